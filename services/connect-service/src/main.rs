use ck_storage::Keystore;
use connect_service::{AppState, LogOtpSender, ServiceConfig, router};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ServiceConfig::from_env()?;
    let addr = config.bind_addr;
    let state = AppState::new(config.clone(), keystore(&config)?, Arc::new(LogOtpSender));
    let app = router(state);

    info!("connect-service listening on {} (public url {})", addr, config.public_url);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for shutdown signal: {}", err);
            }
        })
        .await?;

    Ok(())
}

#[cfg(feature = "rocksdb")]
fn keystore(config: &ServiceConfig) -> anyhow::Result<Arc<dyn Keystore>> {
    match &config.data_dir {
        Some(path) => {
            info!("custodial keys stored in RocksDB at {}", path);
            Ok(Arc::new(ck_storage::RocksDbStore::open_default(path)?))
        }
        None => Ok(Arc::new(ck_storage::InMemoryKeystore::default())),
    }
}

#[cfg(not(feature = "rocksdb"))]
fn keystore(config: &ServiceConfig) -> anyhow::Result<Arc<dyn Keystore>> {
    if config.data_dir.is_some() {
        warn!("{} is ignored; build with the rocksdb feature to persist keys", connect_service::DATA_DIR_VAR);
    }
    Ok(Arc::new(ck_storage::InMemoryKeystore::default()))
}
