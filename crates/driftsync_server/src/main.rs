use axum::{
    Router,
    http::{Method, header},
    routing::get,
};
use driftsync_server::{Config, ReplicateStore, http::replicate_routes};
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "driftsync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting DriftSync Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Database path: {:?}", config.database_path);
    info!("CORS origins: {:?}", config.cors_origins);

    // Open the store
    let store = match ReplicateStore::open(&config.database_path) {
        Ok(s) => Arc::new(s.with_backlog_ms(config.backlog_ms)),
        Err(e) => {
            error!("Failed to open store: {}", e);
            std::process::exit(1);
        }
    };

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(Any); // In production, use specific origins from config

    // Build the router
    let app = Router::new()
        .route("/", get(|| async { "DriftSync Server" }))
        .route("/health", get(|| async { "OK" }))
        .nest("/api", replicate_routes(store.clone()))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Create listener
    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{}", addr);

    // Scheduled maintenance: daily compaction and weekly pruning per
    // configured collection
    let maintenance_store = store.clone();
    let maintenance_config = config.clone();
    tokio::spawn(async move {
        let mut compaction = tokio::time::interval(tokio::time::Duration::from_secs(
            maintenance_config.compaction_interval_hours * 3600,
        ));
        let mut pruning = tokio::time::interval(tokio::time::Duration::from_secs(
            maintenance_config.pruning_interval_days * 24 * 3600,
        ));
        // The first tick of an interval fires immediately; skip it so a
        // restart does not trigger maintenance right away.
        compaction.tick().await;
        pruning.tick().await;

        loop {
            tokio::select! {
                _ = compaction.tick() => {
                    for collection in &maintenance_config.collections {
                        match maintenance_store
                            .compact(collection, maintenance_config.compaction_retention_days)
                        {
                            Ok(report) => info!(
                                collection = %collection,
                                merged = report.merged,
                                "Scheduled compaction finished"
                            ),
                            Err(e) => {
                                error!(collection = %collection, "Scheduled compaction failed: {}", e)
                            }
                        }
                    }
                }
                _ = pruning.tick() => {
                    for collection in &maintenance_config.collections {
                        match maintenance_store
                            .prune(collection, maintenance_config.pruning_retention_days)
                        {
                            Ok(report) => info!(
                                collection = %collection,
                                snapshots_removed = report.snapshots_removed,
                                deltas_removed = report.deltas_removed,
                                "Scheduled pruning finished"
                            ),
                            Err(e) => {
                                error!(collection = %collection, "Scheduled pruning failed: {}", e)
                            }
                        }
                    }
                }
            }
        }
    });

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
