pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod seed;
pub mod store;

// Export API types
pub use api::handlers;
pub use api::routes;

pub use error::{SrmaError, SrmaResult};

// Export logic entry points
pub use logic::{
    AccessControl, ChangeRequestWorkflow, DataEntry, ExportBundle, ExportFlattener, FormEditor,
    ProjectOperations, SchemaEditResult, TemplateLoader, WorkingSchema,
};

// Export all model types
pub use model::*;

// Export store types
pub use store::{MemoryStore, PostgresStore, Store};

use crate::config::{AppConfig, StoreBackend};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Serve the API for `store` on the configured address, loading demo data
/// first when enabled
pub async fn serve_with_store<S: Store + 'static>(store: Arc<S>, config: &AppConfig) -> anyhow::Result<()> {
    if config.load_demo_data() {
        log::info!("Loading demo data...");
        seed::load_seed_data(&*store).await?;
    }

    let app = api::routes::create_router().with_state(store);
    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    log::info!("SRMA extraction server running on http://{}", bind_address);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Full startup: configuration, store selection and serving
pub async fn run_server() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;
    log::info!(
        "Configuration loaded: server={}, backend={}",
        config.server_address(),
        config.database.backend
    );

    match config.database.backend {
        StoreBackend::Postgres => {
            log::info!("Connecting to PostgreSQL...");
            let postgres_store =
                PostgresStore::new(&config.database_url(), config.max_connections()).await?;
            postgres_store.migrate().await?;
            log::info!("Database migrations applied");
            serve_with_store(Arc::new(postgres_store), &config).await
        }
        StoreBackend::Memory => {
            log::warn!("Using the in-memory store; data is lost on shutdown");
            serve_with_store(Arc::new(MemoryStore::new()), &config).await
        }
    }
}
