use anyhow::Result;
use log::error;
use tokio::sync::broadcast;

use watt_bridge::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::new();
    let config = Config::new(options.config_file)?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {err}");
        }
        let _ = shutdown_tx_clone.send(());
    });

    watt_bridge::app(shutdown_rx, config).await
}
