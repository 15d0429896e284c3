//! Process wiring: stores, discovery listeners, the resolver and the HTTP
//! server, all stopped by one cancellation token.

use crate::cloud::{CloudClient, CloudSync};
use crate::config::GatewayConfig;
use crate::error::{Result, TuyaError};
use crate::gateway::Gateway;
use crate::http;
use crate::registry::Registry;
use crate::resolver::RetryResolver;
use crate::scanner::DiscoveryListener;
use crate::scheduler::Scheduler;
use crate::session::TuyaConnector;
use crate::store::{CloudConfigStore, CredentialStore};
use log::{info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Raise the soft open-file limit to the hard limit.
pub fn maximize_fd_limit() -> Result<()> {
    #[cfg(unix)]
    {
        let (soft, hard) = rlimit::getrlimit(rlimit::Resource::NOFILE)
            .map_err(|e| TuyaError::Io(format!("Failed to get rlimit: {}", e)))?;

        if soft < hard {
            rlimit::setrlimit(rlimit::Resource::NOFILE, hard, hard)
                .map_err(|e| TuyaError::Io(format!("Failed to set rlimit: {}", e)))?;
            info!("File descriptor limit increased from {} to {}", soft, hard);
        }
    }
    Ok(())
}

/// Run the gateway until `token` is cancelled or the HTTP server fails.
pub async fn run(
    config: GatewayConfig,
    cloud: Option<Arc<dyn CloudClient>>,
    token: CancellationToken,
) -> Result<()> {
    let store = Arc::new(CredentialStore::open(&config.devices_file, config.persist()));
    let cloud_config = Arc::new(CloudConfigStore::open(&config.config_file));
    info!(
        "Loaded {} device credential(s) from {}",
        store.len(),
        config.devices_file.display()
    );

    let registry = Arc::new(Registry::new());
    let sync = Arc::new(CloudSync::new(cloud, cloud_config, store.clone()));
    let tracker = TaskTracker::new();

    let listener = Arc::new(DiscoveryListener::new(
        registry.clone(),
        store.clone(),
        config.bind.clone(),
        config.retry_count,
    ));
    if listener.spawn(&config.udp_ports, &tracker, &token) == 0 {
        warn!("No discovery port could be bound; only known devices will be reachable");
    }

    let resolver = RetryResolver::new(
        registry.clone(),
        store.clone(),
        sync.clone(),
        config.retry_interval(),
    );
    tracker.spawn(resolver.run(token.clone()));

    let scheduler = Scheduler::new(token.clone());
    let gateway = Arc::new(Gateway::new(
        registry,
        store,
        sync,
        Arc::new(TuyaConnector::new(config.device_timeout())),
        scheduler.clone(),
        config.web_root.clone(),
    ));

    let addr = format!("{}:{}", config.bind, config.port);
    let served = match tokio::net::TcpListener::bind(&addr).await {
        Ok(tcp) => {
            info!("HTTP API listening on {}", addr);
            let shutdown = token.clone();
            axum::serve(tcp, http::router(gateway))
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .map_err(TuyaError::from)
        }
        Err(e) => Err(e.into()),
    };

    token.cancel();
    tracker.close();
    tracker.wait().await;
    scheduler.shutdown().await;
    info!("Gateway stopped");
    served
}
