use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::{Extension, Json, Router};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use quotagate::config::{GateSettings, LoggingSettings, StoreBackend};
use quotagate::http::{self, ApiKeyId, GateServer};
use quotagate::ratelimit::{
    spawn_cleanup, CachedConfigSource, Gate, LimitsCatalog, StaticConfigSource,
};
use quotagate::store::{AdmissionLog, ConfigSource, MemoryStore, PgStore, QuotaStore, UsageStore};

/// Admin API rate limiting and quota enforcement gate.
#[derive(Debug, Parser)]
#[command(name = "quotagate", version, about)]
struct Args {
    /// Settings file (YAML or TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Override the limits catalogue path
    #[arg(long)]
    limits: Option<String>,
}

struct Stores {
    usage: Arc<dyn UsageStore>,
    quotas: Arc<dyn QuotaStore>,
    admissions: Arc<dyn AdmissionLog>,
    configs: Arc<dyn ConfigSource>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = GateSettings::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        settings.server.listen_addr = listen;
    }
    if let Some(limits) = args.limits {
        settings.limits.catalog_path = Some(limits);
    }

    init_tracing(&settings.logging);

    info!("Starting Quotagate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %settings.server.listen_addr,
        backend = ?settings.store.backend,
        "Configuration loaded"
    );

    let stores = build_stores(&settings).await?;

    let gate = Arc::new(
        Gate::new(stores.configs, stores.usage.clone(), stores.quotas)
            .with_admission_log(stores.admissions)
            .with_store_timeout(settings.store.timeout())
            .with_quota_type(settings.limits.quota_type.clone())
            .with_quota_period(settings.limits.quota_period()),
    );
    info!("Gate initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cleanup = spawn_cleanup(stores.usage, settings.store.cleanup(), shutdown_rx);

    let admin = Router::new().route("/whoami", get(whoami));
    let server = GateServer::new(settings.server.listen_addr, http::router(gate, admin));

    let served = server.serve_with_shutdown(shutdown_signal()).await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = cleanup.await {
        warn!(error = %e, "Cleanup task ended abnormally");
    }

    served?;
    info!("Quotagate stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }
}

async fn build_stores(settings: &GateSettings) -> anyhow::Result<Stores> {
    let catalog = match &settings.limits.catalog_path {
        Some(path) => {
            let catalog = LimitsCatalog::from_file(path)?;
            info!(path = %path, "Loaded limits catalogue");
            Some(Arc::new(StaticConfigSource::new(catalog)))
        }
        None => None,
    };
    let ttl = settings.limits.cache_ttl();

    match settings.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            let Some(catalog) = catalog else {
                anyhow::bail!("the memory backend needs limits.catalog_path");
            };
            warn!("Using the in-memory store; counters are not shared between instances");
            Ok(Stores {
                usage: store.clone(),
                quotas: store.clone(),
                admissions: store,
                configs: Arc::new(CachedConfigSource::new(catalog, ttl)),
            })
        }
        StoreBackend::Postgres => {
            let url = settings
                .store
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("store.database_url is not set"))?;
            let store = Arc::new(
                PgStore::connect(url, settings.store.max_connections, settings.store.timeout())
                    .await?,
            );
            if settings.store.migrate {
                store.migrate().await?;
            }

            let configs: Arc<dyn ConfigSource> = match catalog {
                Some(catalog) => Arc::new(CachedConfigSource::new(catalog, ttl)),
                None => Arc::new(CachedConfigSource::new(store.clone(), ttl)),
            };
            Ok(Stores {
                usage: store.clone(),
                quotas: store.clone(),
                admissions: store,
                configs,
            })
        }
    }
}

/// Echo the caller's key.
async fn whoami(Extension(ApiKeyId(key)): Extension<ApiKeyId>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "apiKeyId": key }))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
