use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use goldenseed_api::gateway::http::{GatewayHttpState, router};
use goldenseed_api::gateway::memory_store::MemoryStore;
use goldenseed_api::gateway::{
    AccountingStore, Clock, Gateway, GatewayConfig, MeteringPolicy, SystemClock, seed_demo,
    spawn_reservation_reaper,
};

#[derive(Debug, Parser)]
#[command(
    name = "goldenseed-gateway",
    version,
    about = "Serve the GoldenSeed generation API"
)]
struct Args {
    /// Config file; `.toml` is parsed as TOML, anything else as JSON.
    config: Option<PathBuf>,
    /// Address to bind, e.g. 0.0.0.0:8000.
    #[arg(long, env = "GOLDENSEED_LISTEN")]
    listen: Option<String>,
    /// SQLite database path. Without it the gateway runs in demo mode.
    #[arg(long, env = "GOLDENSEED_SQLITE")]
    sqlite: Option<PathBuf>,
    /// Force demo mode (in-memory store with the demo key), ignoring any sqlite path.
    #[arg(long, conflicts_with = "sqlite")]
    demo: bool,
    /// Enables /admin routes.
    #[arg(long, env = "GOLDENSEED_ADMIN_TOKEN", hide_env_values = true)]
    admin_token: Option<String>,
    /// strict | lenient
    #[arg(long)]
    metering: Option<MeteringPolicy>,
    #[arg(long)]
    json_logs: bool,
    /// Allow cross-origin requests from any origin.
    #[arg(long)]
    cors: bool,
    #[arg(long)]
    otel: bool,
    #[arg(long)]
    otel_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match args.config.as_deref() {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(listen) = args.listen.clone() {
        config.listen = listen;
    }
    if let Some(path) = args.sqlite.clone() {
        config.sqlite_path = Some(path);
    }
    if args.demo {
        config.sqlite_path = None;
    }
    if let Some(token) = args.admin_token.clone() {
        config.admin_token = Some(token);
    }
    if let Some(metering) = args.metering {
        config.metering = metering;
    }
    config.json_logs |= args.json_logs;
    config.cors_permissive |= args.cors;
    config.validate()?;

    let _otel_guard = init_telemetry(
        args.otel || args.otel_endpoint.is_some(),
        args.otel_endpoint.as_deref(),
        config.json_logs,
    )?;

    let store = open_store(&config).await?;
    let gateway = Arc::new(Gateway::new(store, &config));
    tracing::info!(
        mode = ?gateway.mode(),
        store = gateway.store_backend(),
        metering = ?config.metering,
        admin = config.admin_token.is_some(),
        cors = config.cors_permissive,
        "gateway configured"
    );

    let reaper = (config.reap_interval_secs > 0).then(|| {
        spawn_reservation_reaper(
            gateway.clone(),
            Duration::from_secs(config.reservation_ttl_secs),
            Duration::from_secs(config.reap_interval_secs),
        )
    });

    let mut state = GatewayHttpState::new(gateway).with_permissive_cors(config.cors_permissive);
    if let Some(token) = config.admin_token.clone() {
        state = state.with_admin_token(token);
    }

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(listen = %config.listen, "goldenseed-gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    if let Some(reaper) = reaper {
        reaper.abort();
    }
    Ok(())
}

async fn open_store(
    config: &GatewayConfig,
) -> Result<Arc<dyn AccountingStore>, Box<dyn std::error::Error>> {
    if let Some(path) = config.sqlite_path.as_ref() {
        return open_sqlite(path).await;
    }

    tracing::warn!(
        account_id = goldenseed_api::gateway::DEMO_ACCOUNT_ID,
        "no sqlite path configured; running in demo mode with an in-memory store"
    );
    let store = MemoryStore::new();
    seed_demo(&store, &config.tiers, SystemClock.now_epoch_millis()).await?;
    Ok(Arc::new(store))
}

#[cfg(feature = "store-sqlite")]
async fn open_sqlite(
    path: &std::path::Path,
) -> Result<Arc<dyn AccountingStore>, Box<dyn std::error::Error>> {
    let existed = path.exists();
    let store = goldenseed_api::gateway::SqliteStore::new(path);
    store.init().await?;
    tracing::info!(path = %path.display(), existed, "sqlite store ready");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "store-sqlite"))]
async fn open_sqlite(
    _path: &std::path::Path,
) -> Result<Arc<dyn AccountingStore>, Box<dyn std::error::Error>> {
    Err("sqlite store requires `--features store-sqlite`".into())
}

#[cfg(feature = "otel")]
fn init_telemetry(
    otel: bool,
    endpoint: Option<&str>,
    json_logs: bool,
) -> Result<Option<goldenseed_api::gateway::telemetry::OtelGuard>, Box<dyn std::error::Error>> {
    if !otel {
        goldenseed_api::gateway::telemetry::init_logging(json_logs)?;
        return Ok(None);
    }
    Ok(Some(goldenseed_api::gateway::telemetry::init_otel(
        "goldenseed-gateway",
        endpoint,
        json_logs,
    )?))
}

#[cfg(not(feature = "otel"))]
fn init_telemetry(
    otel: bool,
    _endpoint: Option<&str>,
    json_logs: bool,
) -> Result<Option<()>, Box<dyn std::error::Error>> {
    if otel {
        return Err("otel requires `--features otel`".into());
    }
    goldenseed_api::gateway::telemetry::init_logging(json_logs)?;
    Ok(None)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
