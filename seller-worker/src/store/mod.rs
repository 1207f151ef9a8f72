pub mod memory;
pub mod postgres;

use std::collections::HashSet;

use async_trait::async_trait;
use common_database::{is_transient_error, is_unique_violation};
use common_types::Seller;
use thiserror::Error;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Another row already owns the email
    #[error("unique constraint violated: {0}")]
    Conflict(String),

    /// Connectivity, timeouts, lock contention. Worth retrying.
    #[error("transient database error: {0}")]
    Transient(String),

    #[error("database error: {0}")]
    Other(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if is_unique_violation(&err) {
            StoreError::Conflict(err.to_string())
        } else if is_transient_error(&err) {
            StoreError::Transient(err.to_string())
        } else {
            StoreError::Other(err.to_string())
        }
    }
}

/// Seller persistence. Lookups by email see soft-deleted (inactive) rows too,
/// an inactive seller still owns its email.
#[async_trait]
pub trait SellerStore: Send + Sync {
    /// The subset of `emails` that already belongs to a stored seller.
    async fn find_existing_emails(&self, emails: &[String]) -> Result<HashSet<String>, StoreError>;

    /// Inserts all sellers atomically: either every row is written or none.
    async fn bulk_insert(&self, sellers: &[Seller]) -> Result<(), StoreError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<Seller>, StoreError>;

    async fn insert(&self, seller: &Seller) -> Result<(), StoreError>;

    /// Writes the mutable fields of `seller`, matched by id.
    async fn update(&self, seller: &Seller) -> Result<(), StoreError>;
}
