mod from_row;
mod schema;
pub mod queries;

pub use schema::init_db;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::config::{Config, ReconcileConfig};
use crate::payments::GatewayRegistry;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Application state holding the database pool, gateway adapters and configuration
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    /// Base URL for callbacks (e.g., https://api.example.com)
    pub base_url: String,
    pub success_url: String,
    pub cancel_url: String,
    pub admin_api_token: Option<String>,
    pub gateways: GatewayRegistry,
    pub reconcile: ReconcileConfig,
}

impl AppState {
    pub fn new(db: DbPool, config: &Config, gateways: GatewayRegistry) -> Self {
        Self {
            db,
            base_url: config.base_url.clone(),
            success_url: config.success_url.clone(),
            cancel_url: config.cancel_url.clone(),
            admin_api_token: config.admin_api_token.clone(),
            gateways,
            reconcile: config.reconcile.clone(),
        }
    }
}

pub fn create_pool(database_path: &str) -> Result<DbPool, r2d2::Error> {
    // Concurrent webhook and poll writers wait on the lock instead of failing fast
    let manager = SqliteConnectionManager::file(database_path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000; PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;",
        )
    });
    Pool::builder().max_size(10).build(manager)
}
