use common::config::AppConfig;
use common::events::{ChannelPublisher, EventFanout, EventPublisher};
use common::results::ResultCache;
use gateway::{create_server, AppState, PassthroughExecutor};
use persistence::{PostgresStore, PostgresWorkflowRepository};
use queue::InMemoryQueue;
use realtime_service::EventFabric;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trigger_service::{MokaResultCache, RedisResultCache, TriggerManager};
use workflow_engine::ExecutionEngine;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway=debug,workflow_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::default();

    // Persistence
    let pool = sqlx::PgPool::connect_lazy(&config.database.url)
        .expect("Failed to configure database pool");
    let store = Arc::new(PostgresStore::new(pool.clone()));
    let workflows = Arc::new(PostgresWorkflowRepository::new(pool));

    // Result cache: redis when reachable, in-process otherwise
    let results: Arc<dyn ResultCache> = match RedisResultCache::connect(&config.redis.url).await {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            tracing::warn!(error = %e, "redis unavailable, using in-process result cache");
            Arc::new(MokaResultCache::new(
                10_000,
                std::time::Duration::from_secs(3600),
            ))
        }
    };

    // Event fabric plus a fanout branch for the trigger manager's
    // completion listener
    let fabric = Arc::new(EventFabric::new(config.fabric.clone()));
    fabric.clone().spawn_sweeper();
    let (completions_tx, completions_rx) = ChannelPublisher::new();
    let publisher: Arc<dyn EventPublisher> = Arc::new(EventFanout::new(vec![
        fabric.clone(),
        Arc::new(completions_tx),
    ]));

    // Engine and trigger manager
    let engine = Arc::new(ExecutionEngine::new(
        store,
        workflows.clone(),
        Arc::new(InMemoryQueue::new()),
        Arc::new(PassthroughExecutor),
        publisher,
        results.clone(),
        config.engine.clone(),
    ));
    engine
        .clone()
        .start()
        .await
        .expect("Failed to start execution engine");

    let triggers = TriggerManager::new(
        engine,
        workflows,
        results,
        fabric.clone(),
        config.triggers.clone(),
    )
    .expect("Failed to build trigger manager");
    triggers.clone().start(completions_rx);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Starting workflow gateway on {}", addr);

    let app = create_server(AppState { triggers, fabric });
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", addr);
    axum::serve(listener, app).await.expect("Server error");
}
