use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use botfleet_orchestrator::admin::{self, AdminState};
use botfleet_orchestrator::commands;
use botfleet_orchestrator::gateway::{GatewayPool, HttpGatewayConnector};
use botfleet_orchestrator::progress::{ProvisioningTracker, TrackerConfig};
use botfleet_orchestrator::progress_events::{
    BroadcastProgressSink, CompositeSink, ProgressSink, RedisProgressSink,
};
use botfleet_orchestrator::repository::PgRepository;
use botfleet_orchestrator::settings::OrchestratorSettings;
use botfleet_orchestrator::LifecycleOrchestrator;
use botfleet_providers::{AdapterRegistry, DefaultTargetFactory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = OrchestratorSettings::from_env();
    let database_url = settings
        .database_url
        .clone()
        .context("DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("Failed to connect to Postgres")?;
    sqlx::migrate!("../sqlx-migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("[main] connected to database, migrations applied");

    let redis_client =
        redis::Client::open(settings.redis_url.as_str()).context("Invalid REDIS_URL")?;

    let events = Arc::new(BroadcastProgressSink::new(256));
    let sinks: Vec<Arc<dyn ProgressSink>> = vec![
        Arc::new(RedisProgressSink::spawn(redis_client.clone())),
        events.clone() as Arc<dyn ProgressSink>,
    ];
    let tracker = ProvisioningTracker::new(
        Arc::new(CompositeSink::new(sinks)),
        TrackerConfig {
            operation_timeout: settings.provisioning_timeout,
            ..TrackerConfig::default()
        },
    );

    let connector = HttpGatewayConnector::new(settings.gateway_rpc_timeout)
        .context("Failed to build gateway HTTP client")?;
    let gateways = Arc::new(GatewayPool::new(
        Arc::new(connector),
        settings.gateway_retry.clone(),
    ));

    let orchestrator = Arc::new(LifecycleOrchestrator::new(
        Arc::new(PgRepository::new(pool)),
        Arc::new(AdapterRegistry::new()),
        Arc::new(DefaultTargetFactory::new(settings.data_dir.clone())),
        tracker,
        gateways,
    ));

    let listener_orchestrator = orchestrator.clone();
    let listener_redis = redis_client.clone();
    tokio::spawn(async move {
        if let Err(e) = commands::run_listener(listener_redis, listener_orchestrator).await {
            tracing::error!("[main] command listener stopped: {:#}", e);
        }
    });

    let app = admin::router(Arc::new(AdminState {
        orchestrator,
        events,
    }));
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    tracing::info!("[main] orchestrator listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}
