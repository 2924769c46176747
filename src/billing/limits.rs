//! Tier table
//!
//! Static capability set per tier. Everything downstream (snapshot flags,
//! listing visibility, pause eligibility) reads from here.

use serde::Serialize;

use super::types::Tier;

/// Lowest tier allowed to pause billing
pub const PAUSE_THRESHOLD: Tier = Tier::Tier3;

/// Capabilities granted by a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierCapabilities {
    pub max_photos: u32,
    pub max_videos: u32,
    /// Listed in search at all
    pub active_listing: bool,
    /// Pinned placement in search results
    pub featured: bool,
    /// May request the photo-verification badge
    pub verification_eligible: bool,
    pub can_pause: bool,
}

impl TierCapabilities {
    /// Get capabilities for a given tier
    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Basic => Self {
                max_photos: 3,
                max_videos: 0,
                active_listing: false,
                featured: false,
                verification_eligible: false,
                can_pause: false,
            },
            Tier::Trial => Self {
                max_photos: 10,
                max_videos: 1,
                active_listing: true,
                featured: false,
                verification_eligible: false,
                can_pause: false,
            },
            Tier::Tier1 => Self {
                max_photos: 8,
                max_videos: 0,
                active_listing: true,
                featured: false,
                verification_eligible: false,
                can_pause: false,
            },
            Tier::Tier2 => Self {
                max_photos: 12,
                max_videos: 1,
                active_listing: true,
                featured: false,
                verification_eligible: false,
                can_pause: false,
            },
            Tier::Tier3 => Self {
                max_photos: 16,
                max_videos: 2,
                active_listing: true,
                featured: false,
                verification_eligible: true,
                can_pause: true,
            },
            Tier::Tier4 => Self {
                max_photos: 20,
                max_videos: 3,
                active_listing: true,
                featured: false,
                verification_eligible: true,
                can_pause: true,
            },
            Tier::Platinum => Self {
                max_photos: 30,
                max_videos: 5,
                active_listing: true,
                featured: true,
                verification_eligible: true,
                can_pause: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TIERS: [Tier; 7] = [
        Tier::Basic,
        Tier::Trial,
        Tier::Tier1,
        Tier::Tier2,
        Tier::Tier3,
        Tier::Tier4,
        Tier::Platinum,
    ];

    #[test]
    fn test_only_platinum_is_featured() {
        for tier in ALL_TIERS {
            assert_eq!(
                TierCapabilities::for_tier(tier).featured,
                tier == Tier::Platinum,
                "featured flag wrong for {}",
                tier
            );
        }
    }

    #[test]
    fn test_pause_matches_threshold() {
        for tier in ALL_TIERS {
            assert_eq!(TierCapabilities::for_tier(tier).can_pause, tier >= PAUSE_THRESHOLD);
        }
    }

    #[test]
    fn test_basic_has_no_listing() {
        let caps = TierCapabilities::for_tier(Tier::Basic);
        assert!(!caps.active_listing);
        assert!(!caps.verification_eligible);
        assert_eq!(caps.max_videos, 0);
    }
}
