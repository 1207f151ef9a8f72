use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::SellerCreatedEvent;

pub const MAX_NAME_LENGTH: usize = 100;
pub const MAX_EMAIL_LENGTH: usize = 255;
pub const MAX_PHONE_LENGTH: usize = 50;
pub const MAX_REGION_LENGTH: usize = 50;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    Required(&'static str),
    #[error("{field} is longer than {max} characters")]
    TooLong { field: &'static str, max: usize },
}

/// A persisted seller. Rows with `is_active = false` are soft-deleted but
/// still own their email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Seller {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone_number: String,
    pub region: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Seller {
    /// Builds a seller from a wire event, keeping its id and creation time.
    pub fn import(event: &SellerCreatedEvent) -> Result<Seller, ValidationError> {
        validate(event)?;

        Ok(Seller {
            id: event.id,
            first_name: event.first_name.clone(),
            last_name: event.last_name.clone(),
            email: event.email.clone(),
            phone_number: event.phone_number.clone(),
            region: event.region.clone(),
            is_active: event.is_active,
            created_at: event.created_at,
        })
    }

    /// Applies the mutable fields of `event` to this seller. Returns whether
    /// anything changed; an unchanged seller doesn't need to be written.
    /// Identity fields (id, email, creation time) are never touched.
    pub fn apply_update(&mut self, event: &SellerCreatedEvent) -> Result<bool, ValidationError> {
        validate(event)?;

        if self.first_name == event.first_name
            && self.last_name == event.last_name
            && self.phone_number == event.phone_number
            && self.region == event.region
            && self.is_active == event.is_active
        {
            return Ok(false);
        }

        self.first_name.clone_from(&event.first_name);
        self.last_name.clone_from(&event.last_name);
        self.phone_number.clone_from(&event.phone_number);
        self.region.clone_from(&event.region);
        self.is_active = event.is_active;

        Ok(true)
    }
}

fn validate(event: &SellerCreatedEvent) -> Result<(), ValidationError> {
    let fields = [
        ("first_name", event.first_name.as_str(), MAX_NAME_LENGTH),
        ("last_name", event.last_name.as_str(), MAX_NAME_LENGTH),
        ("email", event.email.as_str(), MAX_EMAIL_LENGTH),
        ("phone_number", event.phone_number.as_str(), MAX_PHONE_LENGTH),
        ("region", event.region.as_str(), MAX_REGION_LENGTH),
    ];

    for (field, value, max) in fields {
        if value.trim().is_empty() {
            return Err(ValidationError::Required(field));
        }
        if value.chars().count() > max {
            return Err(ValidationError::TooLong { field, max });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> SellerCreatedEvent {
        SellerCreatedEvent {
            id: Uuid::now_v7(),
            first_name: "Grace".to_string(),
            last_name: "Hopper".to_string(),
            email: "grace@example.com".to_string(),
            phone_number: "555-0101".to_string(),
            region: "NA".to_string(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_import_keeps_identity() {
        let event = event();
        let seller = Seller::import(&event).unwrap();

        assert_eq!(seller.id, event.id);
        assert_eq!(seller.email, event.email);
        assert_eq!(seller.created_at, event.created_at);
    }

    #[test]
    fn test_import_requires_fields() {
        let mut blank_region = event();
        blank_region.region = "   ".to_string();
        assert_eq!(
            Seller::import(&blank_region),
            Err(ValidationError::Required("region"))
        );

        let mut blank_email = event();
        blank_email.email = String::new();
        assert_eq!(
            Seller::import(&blank_email),
            Err(ValidationError::Required("email"))
        );
    }

    #[test]
    fn test_import_enforces_lengths() {
        let mut long_name = event();
        long_name.first_name = "x".repeat(MAX_NAME_LENGTH + 1);
        assert_eq!(
            Seller::import(&long_name),
            Err(ValidationError::TooLong {
                field: "first_name",
                max: MAX_NAME_LENGTH
            })
        );

        let mut exact = event();
        exact.phone_number = "9".repeat(MAX_PHONE_LENGTH);
        assert!(Seller::import(&exact).is_ok());
    }

    #[test]
    fn test_apply_update_detects_changes() {
        let original = event();
        let mut seller = Seller::import(&original).unwrap();

        assert_eq!(seller.apply_update(&original), Ok(false));

        let mut changed = original.clone();
        changed.id = Uuid::now_v7();
        changed.region = "EU".to_string();
        changed.is_active = false;
        assert_eq!(seller.apply_update(&changed), Ok(true));
        assert_eq!(seller.region, "EU");
        assert!(!seller.is_active);
        assert_eq!(seller.id, original.id);
    }

    #[test]
    fn test_apply_update_rejects_invalid() {
        let original = event();
        let mut seller = Seller::import(&original).unwrap();

        let mut invalid = original.clone();
        invalid.last_name = String::new();
        assert_eq!(
            seller.apply_update(&invalid),
            Err(ValidationError::Required("last_name"))
        );
        assert_eq!(seller.last_name, original.last_name);
    }
}
