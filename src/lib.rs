//! Affiliate referral network: downstream graph aggregation plus the
//! commission and withdrawal approval engines.

pub mod aggregate;
mod api;
pub mod approval;
pub mod cache;
pub mod config;
pub mod error;
pub mod graph;
mod guard;
pub mod ledger;
pub mod memory;
pub mod network;
pub mod plan;
pub mod responses;
pub mod source;
pub mod store;
pub mod types;
pub mod withdrawal;

use anyhow::Context;
use anyhow::Result;
pub use api::{AppState, init_router};
use sqlx::{PgPool, postgres::PgPoolOptions};

pub use approval::{ApprovalEngine, BatchReport, FetchOutcome};
pub use config::{Config, EngineSettings};
pub use error::EngineError;
pub use guard::{SubmitClaims, SubmitGuard};
pub use memory::MemoryStore;
pub use network::NetworkService;
pub use store::PgStore;
pub use withdrawal::WithdrawalEngine;

/// Initializes the database pool and applies pending migrations.
pub async fn init_pool(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    sqlx::migrate!()
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    Ok(pool)
}
