use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Error as SqlxError;

/// Pool settings for the seller store. Bulk writes of a whole consumer batch
/// can be slow, so the statement timeout is generous.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub statement_timeout: Duration,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl PoolSettings {
    pub fn new(max_connections: u32) -> Self {
        Self {
            max_connections,
            statement_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

pub async fn get_pool(url: &str, max_connections: u32) -> Result<PgPool, SqlxError> {
    connect(url, &PoolSettings::new(max_connections)).await
}

/// Opens a lazily filled pool, every connection gets the statement timeout.
pub async fn connect(url: &str, settings: &PoolSettings) -> Result<PgPool, SqlxError> {
    // SET takes no bind parameters
    let set_timeout = format!(
        "SET statement_timeout = {}",
        settings.statement_timeout.as_millis()
    );

    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(settings.idle_timeout)
        .max_lifetime(settings.max_lifetime)
        .test_before_acquire(true)
        .after_connect(move |conn, _meta| {
            let set_timeout = set_timeout.clone();
            Box::pin(async move {
                sqlx::query(&set_timeout).execute(conn).await?;
                Ok(())
            })
        })
        .connect(url)
        .await
}

// SQLSTATE 23505
const UNIQUE_VIOLATION: &str = "23505";

// Whole SQLSTATE classes worth retrying: connection exception, insufficient
// resources, operator intervention (statement timeouts), system error
const TRANSIENT_CLASSES: [&str; 4] = ["08", "53", "57", "58"];

// serialization_failure, deadlock_detected, lock_not_available
const TRANSIENT_CODES: [&str; 3] = ["40001", "40P01", "55P03"];

/// Whether the error is a unique constraint violation, e.g. a second seller
/// with an email that is already stored.
pub fn is_unique_violation(error: &SqlxError) -> bool {
    let SqlxError::Database(db_error) = error else {
        return false;
    };

    match db_error.code() {
        Some(code) => code == UNIQUE_VIOLATION,
        None => {
            let message = db_error.message().to_lowercase();
            message.contains("duplicate key") || message.contains("unique constraint")
        }
    }
}

/// Whether the same statement may succeed if it is simply run again.
pub fn is_transient_error(error: &SqlxError) -> bool {
    match error {
        SqlxError::Io(_) | SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::Tls(_) => {
            true
        }
        SqlxError::Database(db_error) => match db_error.code() {
            Some(code) => {
                TRANSIENT_CODES.contains(&&*code)
                    || TRANSIENT_CLASSES
                        .iter()
                        .any(|class| code.starts_with(class))
            }
            None => {
                let message = db_error.message().to_lowercase();
                ["connection", "timeout", "timed out", "deadlock", "terminating connection"]
                    .iter()
                    .any(|needle| message.contains(needle))
            }
        },
        SqlxError::Protocol(message) => {
            let message = message.to_lowercase();
            message.contains("connection") || message.contains("timeout")
        }
        _ => false,
    }
}
