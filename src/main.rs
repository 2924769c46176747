#[tokio::main]
async fn main() {
    if let Err(e) = entitlements::run().await {
        eprintln!("entitlements: {}", e);
        std::process::exit(1);
    }
}
