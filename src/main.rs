use axum::Router;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coursepay::config::Config;
use coursepay::db::{create_pool, init_db, queries, AppState};
use coursepay::handlers;
use coursepay::models::UpsertCourse;
use coursepay::payments::GatewayRegistry;
use coursepay::sweeper;

#[derive(Parser, Debug)]
#[command(name = "coursepay")]
#[command(about = "Payment reconciliation and enrollment core for course checkouts")]
struct Cli {
    /// Seed the database with dev courses (one free, one paid with external checkout links)
    #[arg(long)]
    seed: bool,

    /// Delete the database on exit (dev mode only, useful for fresh starts)
    #[arg(long)]
    ephemeral: bool,

    /// Run a single reconciliation pass (sweep, drain, grant retries) and exit
    #[arg(long)]
    reconcile_once: bool,
}

/// Seeds the database with dev courses.
/// Only runs in dev mode and when the course table is empty.
fn seed_dev_data(state: &AppState) {
    let conn = state.db.get().expect("Failed to get db connection for seeding");

    let count = queries::count_courses(&conn).expect("Failed to count courses");
    if count > 0 {
        tracing::info!("Database already has courses, skipping seed");
        return;
    }

    tracing::info!("============================================");
    tracing::info!("SEEDING DEV DATA");
    tracing::info!("============================================");

    let courses = [
        UpsertCourse {
            id: "course-intro".to_string(),
            title: "Introduction (free)".to_string(),
            price_cents: 0,
            currency: "brl".to_string(),
            hotmart_url: None,
            kiwify_url: None,
        },
        UpsertCourse {
            id: "course-pro".to_string(),
            title: "Pro Track".to_string(),
            price_cents: 19_900,
            currency: "brl".to_string(),
            hotmart_url: Some("https://pay.hotmart.com/DEV000000".to_string()),
            kiwify_url: Some("https://pay.kiwify.com.br/dev0000".to_string()),
        },
    ];

    for input in &courses {
        let course = queries::upsert_course(&conn, input).expect("Failed to seed course");
        tracing::info!(
            "Course: {} ({}, {} {})",
            course.id,
            course.title,
            course.price_cents,
            course.currency
        );
    }

    tracing::info!("============================================");
}

#[tokio::main]
async fn main() {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coursepay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();

    if config.dev_mode {
        tracing::info!("Running in DEVELOPMENT mode");
    }

    // Create database connection pool
    let db_pool = create_pool(&config.database_path).expect("Failed to create database pool");

    // Initialize database schema
    {
        let conn = db_pool.get().expect("Failed to get connection");
        init_db(&conn).expect("Failed to initialize database");
    }

    let gateways = GatewayRegistry::from_config(&config);
    let state = AppState::new(db_pool, &config, gateways);

    if cli.reconcile_once {
        match sweeper::run_once(&state) {
            Ok(report) => tracing::info!("Reconcile pass complete: {:?}", report),
            Err(e) => {
                tracing::error!("Reconcile pass failed: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    // Seed dev data if --seed flag is passed (only in dev mode)
    if cli.seed {
        if !config.dev_mode {
            tracing::warn!("--seed flag ignored: not in dev mode (set COURSEPAY_ENV=dev)");
        } else {
            seed_dev_data(&state);
        }
    }

    if state.admin_api_token.is_none() {
        tracing::warn!("ADMIN_API_TOKEN not set: manual confirmation of external checkouts is disabled");
    }

    // Start background reconciler (stale sweep, deferred webhooks, grant retries)
    sweeper::spawn_reconciler(state.clone());

    // Build the application router
    let app = Router::new()
        // Browser-facing endpoints (user id from the upstream auth layer)
        .merge(handlers::public::router())
        // Webhook endpoints (provider signature auth)
        .merge(handlers::webhooks::router())
        // Manual confirmation API (admin token auth)
        .merge(handlers::admin::router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start the server
    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    // Track if we should clean up on exit
    let cleanup_on_exit = cli.ephemeral && config.dev_mode;
    let db_path = config.database_path.clone();

    if cleanup_on_exit {
        tracing::info!("EPHEMERAL MODE: database will be deleted on exit");
    }

    tracing::info!("coursepay server listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Failed to start server");

    // Cleanup on exit if ephemeral mode
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
