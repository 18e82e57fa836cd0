#[tokio::main]
async fn main() {
    if let Err(e) = oxidetunnel_lib::run().await {
        eprintln!("OxideTunnel failed to start: {}", e);
        std::process::exit(1);
    }
}
