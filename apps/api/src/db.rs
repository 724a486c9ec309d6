use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

const CONNECT_RETRIES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Creates a PostgreSQL connection pool, retrying a few times so services
/// survive the store coming up after them.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to PostgreSQL...");

    let mut last_err = None;
    for attempt in 1..=CONNECT_RETRIES {
        match PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                info!("PostgreSQL connection pool established");
                return Ok(pool);
            }
            Err(e) => {
                warn!("PostgreSQL connect attempt {attempt} failed: {e}. Retrying in 5s...");
                last_err = Some(e);
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
    Err(last_err.expect("at least one connect attempt").into())
}
