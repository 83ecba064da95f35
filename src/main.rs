use std::sync::Arc;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

use remitdesk::{
    api::{self, AppState},
    config::{CliArgs, Config, StorageKind},
    ledger::LedgerService,
    sqlite_storage::SqliteStorage,
    storage::{InMemoryStorage, StorageBackend},
};

fn init_logging(config: &Config) {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(format!("remitdesk={}", config.logging.level)),
    };

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn open_storage(config: &Config) -> Result<Arc<dyn StorageBackend>, Box<dyn std::error::Error>> {
    match config.storage.backend {
        StorageKind::Memory => {
            tracing::warn!("Using in-memory storage; the ledger is lost on restart");
            Ok(Arc::new(InMemoryStorage::new()))
        }
        StorageKind::Sqlite => {
            tracing::info!(path = %config.storage.path, "Opening SQLite storage");
            Ok(Arc::new(SqliteStorage::new(&config.storage.path)?))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();
    let config = Config::load(&cli);
    init_logging(&config);

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Prometheus recorder not installed; /metrics disabled");
            None
        }
    };

    let storage = open_storage(&config)?;
    let ledger = Arc::new(LedgerService::new(storage, config.desk.clone()));
    let state = Arc::new(AppState::new(ledger, metrics));
    let app = api::router(state, Arc::new(config.auth.clone()));

    let addr = config.listen_addr()?;
    tracing::info!(
        %addr,
        auth = config.auth.enabled,
        home = %config.desk.currencies.home,
        primary = %config.desk.currencies.primary,
        secondary = %config.desk.currencies.secondary,
        "RemitDesk listening"
    );

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
