#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ghl_relay::app::run().await
}
