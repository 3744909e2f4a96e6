use patchbay_engine::config::EngineConfig;
use patchbay_engine::db::{
    PgCredentialStore, PgEventLog, PgProcessedTriggerStore, PgRunStore, PgUserStore,
    PgWorkflowStore,
};
use patchbay_integration::{Dispatcher, ResponseCache, TracingNotifier};
use patchbay_scheduler::{DispatcherEventSource, Poller, Reaper};
use patchbay_workflow::nats::{NatsJobQueue, NatsQueueConfig};
use patchbay_workflow::{DispatcherActions, Executor, ExecutorConfig, Interpreter};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = EngineConfig::from_env().expect("failed to load configuration");
    tracing::info!("Loaded configuration");

    // Create database connection pool
    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    // Queue backend
    let queue = Arc::new(
        NatsJobQueue::new(NatsQueueConfig::new(config.nats.url.clone()))
            .await
            .expect("failed to connect to queue backend"),
    );

    // Storage
    let credentials = Arc::new(PgCredentialStore::new(db_pool.clone()));
    let workflows = Arc::new(PgWorkflowStore::new(db_pool.clone()));
    let users = Arc::new(PgUserStore::new(db_pool.clone()));
    let runs = Arc::new(PgRunStore::new(db_pool.clone()));
    let processed = Arc::new(PgProcessedTriggerStore::new(db_pool.clone()));
    let events = Arc::new(PgEventLog::new(db_pool));

    // Integration dispatcher with the process-wide response cache
    let notifier = Arc::new(TracingNotifier);
    let dispatcher = Arc::new(
        Dispatcher::new(
            credentials,
            config.providers.clone().into_registry(),
            ResponseCache::new(),
            notifier.clone(),
            events.clone(),
        )
        .with_webhook_timeout(Duration::from_secs(config.webhook.timeout_seconds)),
    );

    // Executor worker pool
    let actions = Arc::new(DispatcherActions::new(dispatcher.clone(), notifier));
    let interpreter = Arc::new(Interpreter::new(actions, events.clone()));
    let executor = Arc::new(Executor::new(
        queue.clone(),
        workflows.clone(),
        users,
        runs,
        processed.clone(),
        interpreter,
        events.clone(),
        ExecutorConfig {
            concurrency: config.executor.concurrency,
            on_terminal_failure: config.executor.on_terminal_failure,
        },
    ));
    let worker_handles = executor.spawn_workers();
    tracing::info!(workers = worker_handles.len(), "executor started");

    // Poll sweep
    let poller = Poller::new(
        workflows,
        Arc::new(DispatcherEventSource::new(dispatcher)),
        processed.clone(),
        queue,
        events.clone(),
        Duration::from_secs(config.scheduler.tick_seconds),
    );
    let poller_handle = tokio::spawn(async move { poller.run().await });

    // Log reaper
    let reaper = Reaper::new(
        events,
        processed,
        config.log_retention_days,
        Duration::from_secs(config.scheduler.reaper_interval_seconds),
    );
    let reaper_handle = tokio::spawn(async move { reaper.run().await });

    tracing::info!("patchbay engine running");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    tracing::info!("shutting down");

    poller_handle.abort();
    reaper_handle.abort();
    for handle in worker_handles {
        handle.abort();
    }
}
