use axum::Router;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pixelgate::config::Config;
use pixelgate::consent::ConsentStrategy;
use pixelgate::db::{create_pool, init_db, queries, AppState};
use pixelgate::handlers;
use pixelgate::models::{CreateTenant, Plan};
use pixelgate::platforms::Platform;
use pixelgate::worker;

#[derive(Parser, Debug)]
#[command(name = "pixelgate")]
#[command(about = "Conversion event reconciliation pipeline for e-commerce storefronts")]
struct Cli {
    /// Seed the database with a dev tenant
    #[arg(long)]
    seed: bool,

    /// Delete the database on exit (dev mode only, useful for fresh starts)
    #[arg(long)]
    ephemeral: bool,

    /// Override the reconciliation interval in seconds
    #[arg(long)]
    worker_interval_secs: Option<u64>,
}

/// Seeds the database with a dev tenant for local testing.
/// Only runs in dev mode and when no tenant exists yet.
fn seed_dev_data(state: &AppState) {
    let conn = state.db.get().expect("Failed to get db connection for seeding");

    if queries::get_tenant_by_domain(&conn, "dev-shop.local")
        .expect("Failed to query tenants")
        .is_some()
    {
        tracing::info!("Dev tenant already exists, skipping seed");
        return;
    }

    let credentials = serde_json::json!({
        "google": { "measurement_id": "G-DEV000000", "api_secret": "dev-secret" },
        "meta": { "pixel_id": "000000000000000", "access_token": "dev-token" },
        "tiktok": { "pixel_code": "DEV0000000000000000000", "access_token": "dev-token" },
    });

    let tenant = queries::create_tenant(
        &conn,
        &CreateTenant {
            domain: "dev-shop.local".to_string(),
            plan: Plan::Growth,
            consent_strategy: ConsentStrategy::Balanced,
            platforms: Platform::all().to_vec(),
            webhook_secret: "dev-webhook-secret".to_string(),
            credentials: Some(credentials.to_string()),
        },
    )
    .expect("Failed to create dev tenant");

    tracing::info!("============================================");
    tracing::info!("DEV TENANT SEEDED");
    tracing::info!("Domain: {}", tenant.domain);
    tracing::info!("Tenant ID: {}", tenant.id);
    tracing::info!("Webhook Secret: {}", tenant.webhook_secret);
    tracing::info!("============================================");
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pixelgate=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env();
    if let Some(secs) = cli.worker_interval_secs {
        config.worker_interval_secs = secs;
    }

    if config.dev_mode {
        tracing::info!("Running in DEVELOPMENT mode");
    }

    let db_pool = create_pool(&config.database_path).expect("Failed to create database pool");
    {
        let conn = db_pool.get().expect("Failed to get connection");
        init_db(&conn).expect("Failed to initialize database");
    }

    let state = AppState { db: db_pool, config: config.clone() };

    // Seed dev data if --seed flag is passed (only in dev mode)
    if cli.seed {
        if !config.dev_mode {
            tracing::warn!("--seed flag ignored: not in dev mode (set PIXELGATE_ENV=dev)");
        } else {
            seed_dev_data(&state);
        }
    }

    // Start the periodic reconciliation worker
    worker::spawn_worker_loop(state.clone());
    tracing::info!(
        "Reconciliation worker started (runs every {}s)",
        config.worker_interval_secs
    );

    // Build the application router
    let app = Router::new()
        .merge(handlers::health_router())
        // Order webhooks (HMAC auth, never rate limited)
        .merge(handlers::webhooks::router())
        // Pixel receipt ingestion (public, rate limited)
        .merge(handlers::pixel::router(config.pixel_rate_limit_rpm))
        // Verification API (rate limited)
        .merge(handlers::verification::router(config.verification_rate_limit_rpm))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    let cleanup_on_exit = cli.ephemeral && config.dev_mode;
    let db_path = config.database_path.clone();

    if cleanup_on_exit {
        tracing::info!("EPHEMERAL MODE: database will be deleted on exit");
    }

    tracing::info!("Pixelgate server listening on {}", addr);

    // Run server with graceful shutdown
    // Use into_make_service_with_connect_info to enable IP-based rate limiting
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Failed to start server");

    if cleanup_on_exit {
        tracing::info!("Cleaning up ephemeral database...");
        if let Err(e) = std::fs::remove_file(&db_path) {
            tracing::warn!("Failed to remove {}: {}", db_path, e);
        } else {
            tracing::info!("Removed {}", db_path);
        }
        // Also remove WAL and SHM files if they exist
        let _ = std::fs::remove_file(format!("{}-wal", db_path));
        let _ = std::fs::remove_file(format!("{}-shm", db_path));
        tracing::info!("Ephemeral cleanup complete");
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutdown signal received, stopping server...");
}
