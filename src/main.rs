use agent_float_api::config::Config;
use agent_float_api::db::Database;
use agent_float_api::events::EventPublisher;
use agent_float_api::handlers::{self, AppState};
use agent_float_api::notifier::{spawn_dispatcher, NotificationClient};
use agent_float_api::pg_store::PgStore;
use agent_float_api::services::Services;
use axum::{routing::get, Router};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the application.
///
/// Initializes tracing, configuration, the database pool and migrations, the
/// notification dispatcher and the expiry sweep, then starts the Axum server.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_float_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize database connection pool and run migrations
    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");

    // Outbound notifications: events are logged only when no webhook is configured
    let (events, receiver) = EventPublisher::channel();
    let notifier = match config.notification_webhook_url.clone() {
        Some(url) => match NotificationClient::new(url, config.notification_token.clone()) {
            Ok(client) => {
                tracing::info!("✓ Notification client initialized");
                Some(client)
            }
            Err(e) => {
                tracing::error!("Failed to initialize notification client: {}", e);
                None
            }
        },
        None => None,
    };
    spawn_dispatcher(receiver, notifier);

    let store = Arc::new(PgStore::new(db.pool.clone()));
    let services = Services::new(store, config.float.clone(), events);

    // Deadlines are also enforced lazily on read; the sweep only tidies up
    let sweeper = services.clone();
    let sweep_every = Duration::from_secs(config.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            if let Err(e) = sweeper.sweep(Utc::now()).await {
                tracing::error!("Expiry sweep failed: {}", e);
            }
        }
    });
    tracing::info!("Expiry sweep running every {:?}", sweep_every);

    // Build application state
    let app_state = Arc::new(AppState {
        services,
        admin_api_key: config.admin_api_key.clone(),
        payment_webhook_secret: config.payment_webhook_secret.clone(),
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
    );

    // Build protected routes with security layers
    let protected_routes = handlers::api_routes().layer(
        ServiceBuilder::new()
            // Request size limit: 1MB max payload
            .layer(RequestBodyLimitLayer::new(1024 * 1024))
            // Rate limiting: 10 req/sec per IP, burst of 20
            .layer(GovernorLayer {
                config: governor_conf,
            }),
    );

    // Health check bypasses rate limiting
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

    // Peer address is the rate limiter's fallback key when no proxy headers are present
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
