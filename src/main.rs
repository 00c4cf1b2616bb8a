mod attributes;
mod audit;
mod broker;
mod cache;
mod config;
mod consumer;
mod db;
mod dispatch;
mod errors;
mod handlers;
mod models;
mod processor;
mod store;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::audit::AuditLogger;
use crate::broker::Broker;
use crate::config::Config;
use crate::consumer::{LeadConsumer, LogConsumer};
use crate::db::Database;
use crate::dispatch::LeadDispatcher;
use crate::processor::LeadProcessor;
use crate::store::LeadStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lead_intake_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize database connection pool
    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");

    // Connect to the broker and bootstrap the work streams
    let broker = Broker::connect(&config.nats_url, Duration::from_secs(5)).await?;
    broker.ensure_streams().await?;

    let (audit, audit_handle) = AuditLogger::spawn(broker.jetstream());

    let store = Arc::new(LeadStore::new(db.pool.clone()));
    let processor = Arc::new(LeadProcessor::new(store.clone()));
    let dispatcher = Arc::new(LeadDispatcher::new(broker.jetstream(), audit.clone()));

    // Spawn the background consumers under one cancellation token
    let shutdown = CancellationToken::new();
    let mut workers = Vec::new();

    for worker in 0..config.consumer_workers {
        let consumer = LeadConsumer::new(
            &broker.jetstream(),
            processor.clone(),
            audit.clone(),
            config.consumer_batch_size,
            config.consumer_max_wait_secs,
        )
        .await?;

        let token = shutdown.clone();
        workers.push(tokio::spawn(async move {
            if let Err(e) = consumer.run(token).await {
                tracing::error!(worker, error = %e, "Lead consumer exited with error");
            }
        }));
    }

    let log_consumer = LogConsumer::new(
        &broker.jetstream(),
        config.consumer_batch_size,
        config.consumer_max_wait_secs,
    )
    .await?;
    let token = shutdown.clone();
    workers.push(tokio::spawn(async move {
        if let Err(e) = log_consumer.run(token).await {
            tracing::error!(error = %e, "Log consumer exited with error");
        }
    }));

    // Warm the read caches; a failure here is not fatal
    if let Err(e) = store.warm_up().await {
        tracing::warn!(error = %e, "Cache warm-up failed");
    }

    let app_state = handlers::AppState {
        store,
        processor,
        dispatcher,
        audit: audit.clone(),
    };

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .unwrap(),
    );

    let protected_routes = Router::new()
        .route("/api/v1/lead/process", post(handlers::process_lead))
        .route(
            "/api/v1/lead/process-async",
            post(handlers::process_lead_async),
        )
        .route("/api/v1/leads/process-bulk", post(handlers::process_bulk))
        .route("/api/v1/leads", get(handlers::list_leads))
        .route("/api/v1/leads/statistics", get(handlers::lead_statistics))
        .route("/api/v1/leads/:id", get(handlers::show_lead))
        .layer(
            ServiceBuilder::new()
                .layer(GovernorLayer {
                    config: governor_conf,
                })
                .layer(middleware::from_fn_with_state(
                    audit.clone(),
                    audit::audit_middleware,
                ))
                // Request size limit: 5MB max payload
                .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024)),
        );

    // Health check bypasses rate limiting and auditing
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // Let in-flight consumer batches finish before exiting
    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    drop(audit);
    let _ = audit_handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }

    shutdown.cancel();
}
