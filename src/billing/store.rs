//! SQLite-backed entitlement store
//!
//! Holds subscriber records (keyed by email), the profile fields the core
//! reads and writes, and per-profile pause state. Every write is a single
//! statement or a single transaction, so a failed call never leaves a
//! partial record behind.
//!
//! Timestamps are stored as Unix milliseconds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use super::pause::{PauseState, PauseStatus};
use super::types::{ListingSync, ProfileRecord, SubscriberRecord};

/// Errors from the persisted store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt {column} value in store: {value}")]
    Corrupt { column: &'static str, value: String },
}

/// Pause state plus the revision it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPause {
    pub state: PauseState,
    pub revision: i64,
}

/// Persistence contract used by the entitlement service
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn get_subscriber_by_email(
        &self,
        email: &str,
    ) -> Result<Option<SubscriberRecord>, StoreError>;

    /// Most recently reconciled subscriber record of an account
    async fn get_subscriber_for_owner(
        &self,
        owner_id: &str,
    ) -> Result<Option<SubscriberRecord>, StoreError>;

    /// Insert or replace the derived fields of a record, keyed by email
    ///
    /// Trial fields are never written here.
    async fn upsert_subscriber(&self, record: &SubscriberRecord) -> Result<(), StoreError>;

    /// Write trial timestamps only if no trial was ever started
    ///
    /// Returns `false` when the email already has `trial_started_at`.
    async fn start_trial(
        &self,
        email: &str,
        started_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn get_profile(&self, profile_id: &str) -> Result<Option<ProfileRecord>, StoreError>;

    /// Write listing fields to every profile of an account
    ///
    /// Returns the number of profiles updated.
    async fn update_owner_profiles(
        &self,
        owner_id: &str,
        sync: ListingSync,
    ) -> Result<usize, StoreError>;

    /// Upsert a reconciled record and sync the owner's profiles atomically
    ///
    /// Either both writes land or neither does. Returns the number of
    /// profiles updated.
    async fn persist_reconciliation(
        &self,
        owner_id: &str,
        record: &SubscriberRecord,
        sync: ListingSync,
    ) -> Result<usize, StoreError>;

    async fn get_pause_state(&self, profile_id: &str) -> Result<Option<StoredPause>, StoreError>;

    /// Replace pause state if it is still at `expected_revision`
    ///
    /// `None` means "no state exists yet". Returns `false` if another writer
    /// got there first.
    async fn replace_pause_state(
        &self,
        profile_id: &str,
        expected_revision: Option<i64>,
        state: &PauseState,
    ) -> Result<bool, StoreError>;

    /// Paused profiles whose window has ended (read by the billing sweep)
    async fn list_due_pauses(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, PauseState)>, StoreError>;
}

/// Helper to acquire the connection with poison recovery
fn acquire_conn(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock()
        .unwrap_or_else(|poisoned: PoisonError<MutexGuard<'_, Connection>>| {
            warn!("Store mutex was poisoned, recovering inner connection");
            poisoned.into_inner()
        })
}

fn to_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(|t| t.timestamp_millis())
}

fn from_millis(
    column: &'static str,
    value: Option<i64>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    value
        .map(|ms| {
            DateTime::from_timestamp_millis(ms).ok_or(StoreError::Corrupt {
                column,
                value: ms.to_string(),
            })
        })
        .transpose()
}

fn parse_column<T: std::str::FromStr>(column: &'static str, value: String) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Corrupt { column, value })
}

const SUBSCRIBER_COLUMNS: &str = "email, tier, subscription_type, provider_customer_ref,
     trial_started_at, trial_ends_at, expires_at, updated_at";

fn subscriber_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubscriberRow> {
    Ok(SubscriberRow {
        email: row.get(0)?,
        tier: row.get(1)?,
        subscription_type: row.get(2)?,
        provider_customer_ref: row.get(3)?,
        trial_started_at: row.get(4)?,
        trial_ends_at: row.get(5)?,
        expires_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// Upsert the derived fields of a record
///
/// Trial fields are never written. A `None` owner keeps the stored one.
fn write_subscriber(
    conn: &Connection,
    record: &SubscriberRecord,
    owner_id: Option<&str>,
) -> Result<(), StoreError> {
    // Flags are written from the tier, never from the caller
    conn.execute(
        r#"
        INSERT INTO subscribers (email, tier, subscription_type, provider_customer_ref,
                                 expires_at, featured, verification_eligible, updated_at,
                                 owner_id)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(email) DO UPDATE SET
            tier = excluded.tier,
            subscription_type = excluded.subscription_type,
            provider_customer_ref = excluded.provider_customer_ref,
            expires_at = excluded.expires_at,
            featured = excluded.featured,
            verification_eligible = excluded.verification_eligible,
            updated_at = excluded.updated_at,
            owner_id = COALESCE(excluded.owner_id, subscribers.owner_id)
        "#,
        params![
            record.email,
            record.tier.as_str(),
            record.subscription_type.as_str(),
            record.provider_customer_ref,
            to_millis(record.expires_at),
            record.featured(),
            record.verification_eligible(),
            to_millis(record.updated_at),
            owner_id,
        ],
    )?;
    Ok(())
}

fn write_owner_profiles(
    conn: &Connection,
    owner_id: &str,
    sync: ListingSync,
) -> Result<usize, StoreError> {
    let changed = conn.execute(
        "UPDATE profiles SET is_active = ?1, payment_status = ?2 WHERE owner_id = ?3",
        params![sync.is_active, sync.payment_status.as_str(), owner_id],
    )?;
    Ok(changed)
}

struct SubscriberRow {
    email: String,
    tier: String,
    subscription_type: String,
    provider_customer_ref: Option<String>,
    trial_started_at: Option<i64>,
    trial_ends_at: Option<i64>,
    expires_at: Option<i64>,
    updated_at: Option<i64>,
}

impl SubscriberRow {
    fn into_record(self) -> Result<SubscriberRecord, StoreError> {
        Ok(SubscriberRecord {
            email: self.email,
            tier: parse_column("tier", self.tier)?,
            subscription_type: parse_column("subscription_type", self.subscription_type)?,
            provider_customer_ref: self.provider_customer_ref,
            trial_started_at: from_millis("trial_started_at", self.trial_started_at)?,
            trial_ends_at: from_millis("trial_ends_at", self.trial_ends_at)?,
            expires_at: from_millis("expires_at", self.expires_at)?,
            updated_at: from_millis("updated_at", self.updated_at)?,
        })
    }
}

struct ProfileRow {
    id: String,
    owner_id: String,
    role: String,
    tier: String,
    is_active: bool,
    payment_status: String,
}

impl ProfileRow {
    fn into_record(self) -> Result<ProfileRecord, StoreError> {
        Ok(ProfileRecord {
            id: self.id,
            owner_id: self.owner_id,
            role: parse_column("role", self.role)?,
            tier: parse_column("tier", self.tier)?,
            is_active: self.is_active,
            payment_status: parse_column("payment_status", self.payment_status)?,
        })
    }
}

struct PauseRow {
    profile_id: String,
    status: String,
    started_at: Option<i64>,
    resume_at: Option<i64>,
    pauses_used: u32,
    pause_cap: u32,
    period_end: Option<i64>,
    revision: i64,
}

impl PauseRow {
    fn into_stored(self) -> Result<(String, StoredPause), StoreError> {
        let status = match self.status.as_str() {
            "active" => PauseStatus::Active,
            "paused" => {
                let started_at = from_millis("started_at", self.started_at)?;
                let resume_at = from_millis("resume_at", self.resume_at)?;
                match (started_at, resume_at) {
                    (Some(started_at), Some(resume_at)) => PauseStatus::Paused {
                        started_at,
                        resume_at,
                    },
                    _ => {
                        return Err(StoreError::Corrupt {
                            column: "resume_at",
                            value: "missing on paused row".to_string(),
                        })
                    }
                }
            }
            _ => {
                return Err(StoreError::Corrupt {
                    column: "status",
                    value: self.status,
                })
            }
        };

        let state = PauseState {
            status,
            pauses_used_in_period: self.pauses_used,
            pause_cap: self.pause_cap,
            period_end: from_millis("period_end", self.period_end)?,
        };
        Ok((
            self.profile_id,
            StoredPause {
                state,
                revision: self.revision,
            },
        ))
    }
}

const PAUSE_COLUMNS: &str =
    "profile_id, status, started_at, resume_at, pauses_used, pause_cap, period_end, revision";

fn pause_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PauseRow> {
    Ok(PauseRow {
        profile_id: row.get(0)?,
        status: row.get(1)?,
        started_at: row.get(2)?,
        resume_at: row.get(3)?,
        pauses_used: row.get(4)?,
        pause_cap: row.get(5)?,
        period_end: row.get(6)?,
        revision: row.get(7)?,
    })
}

fn status_columns(status: &PauseStatus) -> (&'static str, Option<i64>, Option<i64>) {
    match status {
        PauseStatus::Active => ("active", None, None),
        PauseStatus::Paused {
            started_at,
            resume_at,
        } => (
            "paused",
            Some(started_at.timestamp_millis()),
            Some(resume_at.timestamp_millis()),
        ),
    }
}

/// SQLite-backed store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open the store at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests and local tooling
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS subscribers (
                email TEXT PRIMARY KEY,
                owner_id TEXT,
                tier TEXT NOT NULL DEFAULT 'basic',
                subscription_type TEXT NOT NULL DEFAULT 'free',
                provider_customer_ref TEXT,
                trial_started_at INTEGER,
                trial_ends_at INTEGER,
                expires_at INTEGER,
                featured INTEGER NOT NULL DEFAULT 0,
                verification_eligible INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS profiles (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                role TEXT NOT NULL,
                tier TEXT NOT NULL DEFAULT 'basic',
                is_active INTEGER NOT NULL DEFAULT 0,
                payment_status TEXT NOT NULL DEFAULT 'unpaid'
            );

            CREATE INDEX IF NOT EXISTS idx_profiles_owner
                ON profiles(owner_id);

            CREATE TABLE IF NOT EXISTS pause_states (
                profile_id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'active',
                started_at INTEGER,
                resume_at INTEGER,
                pauses_used INTEGER NOT NULL DEFAULT 0,
                pause_cap INTEGER NOT NULL,
                period_end INTEGER,
                revision INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_pause_due
                ON pause_states(status, resume_at);
        "#,
        )?;

        // Migration: stores created before accounts were linked to records
        let _ = conn.execute("ALTER TABLE subscribers ADD COLUMN owner_id TEXT", []);
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_subscribers_owner ON subscribers(owner_id)",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace a profile row
    ///
    /// Profiles are owned by the account service; this exists for seeding
    /// and tests.
    pub fn save_profile(&self, profile: &ProfileRecord) -> Result<(), StoreError> {
        let conn = acquire_conn(&self.conn);
        conn.execute(
            r#"
            INSERT INTO profiles (id, owner_id, role, tier, is_active, payment_status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id,
                role = excluded.role,
                tier = excluded.tier,
                is_active = excluded.is_active,
                payment_status = excluded.payment_status
            "#,
            params![
                profile.id,
                profile.owner_id,
                profile.role.as_str(),
                profile.tier.as_str(),
                profile.is_active,
                profile.payment_status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Run raw SQL against the store, for fault injection in tests
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        acquire_conn(&self.conn).execute_batch(sql)?;
        Ok(())
    }

    fn query_subscriber(
        &self,
        filter: &'static str,
        value: &str,
    ) -> Result<Option<SubscriberRecord>, StoreError> {
        let conn = acquire_conn(&self.conn);
        let sql = format!("SELECT {} FROM subscribers WHERE {}", SUBSCRIBER_COLUMNS, filter);

        match conn.query_row(&sql, params![value], subscriber_row) {
            Ok(row) => row.into_record().map(Some),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn query_profile(&self, profile_id: &str) -> Result<Option<ProfileRecord>, StoreError> {
        let conn = acquire_conn(&self.conn);
        let result = conn.query_row(
            "SELECT id, owner_id, role, tier, is_active, payment_status
             FROM profiles WHERE id = ?1",
            params![profile_id],
            |row| {
                Ok(ProfileRow {
                    id: row.get(0)?,
                    owner_id: row.get(1)?,
                    role: row.get(2)?,
                    tier: row.get(3)?,
                    is_active: row.get(4)?,
                    payment_status: row.get(5)?,
                })
            },
        );

        match result {
            Ok(row) => row.into_record().map(Some),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl EntitlementStore for SqliteStore {
    async fn get_subscriber_by_email(
        &self,
        email: &str,
    ) -> Result<Option<SubscriberRecord>, StoreError> {
        self.query_subscriber("email = ?1", email)
    }

    async fn get_subscriber_for_owner(
        &self,
        owner_id: &str,
    ) -> Result<Option<SubscriberRecord>, StoreError> {
        self.query_subscriber(
            "owner_id = ?1 ORDER BY updated_at DESC, email ASC LIMIT 1",
            owner_id,
        )
    }

    async fn upsert_subscriber(&self, record: &SubscriberRecord) -> Result<(), StoreError> {
        let conn = acquire_conn(&self.conn);
        write_subscriber(&conn, record, None)?;

        debug!(
            email = record.email.as_str(),
            tier = %record.tier,
            "Upserted subscriber"
        );
        Ok(())
    }

    async fn start_trial(
        &self,
        email: &str,
        started_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = acquire_conn(&self.conn);

        let changed = conn.execute(
            r#"
            INSERT INTO subscribers (email, trial_started_at, trial_ends_at, updated_at)
            VALUES (?1, ?2, ?3, ?2)
            ON CONFLICT(email) DO UPDATE SET
                trial_started_at = excluded.trial_started_at,
                trial_ends_at = excluded.trial_ends_at
            WHERE subscribers.trial_started_at IS NULL
            "#,
            params![
                email,
                started_at.timestamp_millis(),
                ends_at.timestamp_millis()
            ],
        )?;

        Ok(changed == 1)
    }

    async fn get_profile(&self, profile_id: &str) -> Result<Option<ProfileRecord>, StoreError> {
        self.query_profile(profile_id)
    }

    async fn update_owner_profiles(
        &self,
        owner_id: &str,
        sync: ListingSync,
    ) -> Result<usize, StoreError> {
        let conn = acquire_conn(&self.conn);
        write_owner_profiles(&conn, owner_id, sync)
    }

    async fn persist_reconciliation(
        &self,
        owner_id: &str,
        record: &SubscriberRecord,
        sync: ListingSync,
    ) -> Result<usize, StoreError> {
        let mut conn = acquire_conn(&self.conn);
        let tx = conn.transaction()?;
        write_subscriber(&tx, record, Some(owner_id))?;
        let profiles = write_owner_profiles(&tx, owner_id, sync)?;
        tx.commit()?;

        debug!(
            email = record.email.as_str(),
            owner = owner_id,
            tier = %record.tier,
            profiles = profiles,
            "Persisted reconciliation"
        );
        Ok(profiles)
    }

    async fn get_pause_state(&self, profile_id: &str) -> Result<Option<StoredPause>, StoreError> {
        let conn = acquire_conn(&self.conn);
        let sql = format!(
            "SELECT {} FROM pause_states WHERE profile_id = ?1",
            PAUSE_COLUMNS
        );

        match conn.query_row(&sql, params![profile_id], pause_row) {
            Ok(row) => row.into_stored().map(|(_, stored)| Some(stored)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_pause_state(
        &self,
        profile_id: &str,
        expected_revision: Option<i64>,
        state: &PauseState,
    ) -> Result<bool, StoreError> {
        let conn = acquire_conn(&self.conn);
        let (status, started_at, resume_at) = status_columns(&state.status);

        let changed = match expected_revision {
            None => conn.execute(
                r#"
                INSERT INTO pause_states (profile_id, status, started_at, resume_at,
                                          pauses_used, pause_cap, period_end, revision)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
                ON CONFLICT(profile_id) DO NOTHING
                "#,
                params![
                    profile_id,
                    status,
                    started_at,
                    resume_at,
                    state.pauses_used_in_period,
                    state.pause_cap,
                    to_millis(state.period_end),
                ],
            )?,
            Some(revision) => conn.execute(
                r#"
                UPDATE pause_states SET
                    status = ?2,
                    started_at = ?3,
                    resume_at = ?4,
                    pauses_used = ?5,
                    pause_cap = ?6,
                    period_end = ?7,
                    revision = revision + 1
                WHERE profile_id = ?1 AND revision = ?8
                "#,
                params![
                    profile_id,
                    status,
                    started_at,
                    resume_at,
                    state.pauses_used_in_period,
                    state.pause_cap,
                    to_millis(state.period_end),
                    revision,
                ],
            )?,
        };

        if changed == 0 {
            debug!(
                profile = profile_id,
                expected = ?expected_revision,
                "Pause state changed underneath us"
            );
        }
        Ok(changed == 1)
    }

    async fn list_due_pauses(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, PauseState)>, StoreError> {
        let conn = acquire_conn(&self.conn);
        let sql = format!(
            "SELECT {} FROM pause_states
             WHERE status = 'paused' AND resume_at <= ?1
             ORDER BY resume_at ASC",
            PAUSE_COLUMNS
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![now.timestamp_millis()], pause_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|row| row.into_stored().map(|(id, stored)| (id, stored.state)))
            .collect()
    }
}
