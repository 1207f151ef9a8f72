use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A seller to be created, as it travels over the broker. The business key is
/// `email`: two events with the same email describe the same seller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SellerCreatedEvent {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone_number: String,
    pub region: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl SellerCreatedEvent {
    pub fn key(&self) -> &str {
        &self.email
    }
}
