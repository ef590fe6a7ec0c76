use anyhow::Result;
use dotenv::dotenv;
use exchange_service_rust::{ExchangeConfig, ExchangeService};
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::init();

    info!("Starting exchange_service_rust...");

    let config = ExchangeConfig::from_env()?;
    let mut service = ExchangeService::new(config).await?;

    service.run().await
}
