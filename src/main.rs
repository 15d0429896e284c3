use clap::Parser;
use log::{error, info, warn};
use rustuya_gateway::config::GatewayConfig;
use rustuya_gateway::runtime;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_filter()))
        .init();

    info!(
        "rustuya-gateway {} starting on port {}",
        rustuya_gateway::version(),
        config.port
    );
    if let Err(e) = runtime::maximize_fd_limit() {
        warn!("{}", e);
    }

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
        }
        ctrl_c.cancel();
    });

    // No cloud client is linked into the binary; /sync reports it unavailable.
    if let Err(e) = runtime::run(config, None, token).await {
        error!("Gateway failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}
