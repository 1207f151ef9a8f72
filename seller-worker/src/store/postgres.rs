use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_types::Seller;
use sqlx::postgres::PgPool;
use uuid::Uuid;

use super::{SellerStore, StoreError};

const BULK_INSERT_DURATION: &str = "seller_worker_bulk_insert_duration_seconds";
const LOOKUP_DURATION: &str = "seller_worker_existing_lookup_duration_seconds";

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SellerStore for PostgresStore {
    async fn find_existing_emails(&self, emails: &[String]) -> Result<HashSet<String>, StoreError> {
        if emails.is_empty() {
            return Ok(HashSet::new());
        }
        let _timer = common_metrics::timing_guard(LOOKUP_DURATION);

        let found: Vec<String> = sqlx::query_scalar("SELECT email FROM sellers WHERE email = ANY($1)")
            .bind(emails)
            .fetch_all(&self.pool)
            .await?;

        Ok(found.into_iter().collect())
    }

    async fn bulk_insert(&self, sellers: &[Seller]) -> Result<(), StoreError> {
        if sellers.is_empty() {
            return Ok(());
        }
        let _timer = common_metrics::timing_guard(BULK_INSERT_DURATION);

        let mut ids: Vec<Uuid> = Vec::with_capacity(sellers.len());
        let mut first_names: Vec<&str> = Vec::with_capacity(sellers.len());
        let mut last_names: Vec<&str> = Vec::with_capacity(sellers.len());
        let mut emails: Vec<&str> = Vec::with_capacity(sellers.len());
        let mut phone_numbers: Vec<&str> = Vec::with_capacity(sellers.len());
        let mut regions: Vec<&str> = Vec::with_capacity(sellers.len());
        let mut active: Vec<bool> = Vec::with_capacity(sellers.len());
        let mut created_at: Vec<DateTime<Utc>> = Vec::with_capacity(sellers.len());

        for seller in sellers {
            ids.push(seller.id);
            first_names.push(&seller.first_name);
            last_names.push(&seller.last_name);
            emails.push(&seller.email);
            phone_numbers.push(&seller.phone_number);
            regions.push(&seller.region);
            active.push(seller.is_active);
            created_at.push(seller.created_at);
        }

        // A single statement, so a unique violation on any row writes nothing
        sqlx::query(
            r#"
            INSERT INTO sellers (id, first_name, last_name, email, phone_number, region, is_active, created_at)
            SELECT * FROM UNNEST(
                $1::uuid[], $2::text[], $3::text[], $4::text[],
                $5::text[], $6::text[], $7::boolean[], $8::timestamptz[]
            )
            "#,
        )
        .bind(&ids)
        .bind(&first_names)
        .bind(&last_names)
        .bind(&emails)
        .bind(&phone_numbers)
        .bind(&regions)
        .bind(&active)
        .bind(&created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Seller>, StoreError> {
        let seller = sqlx::query_as::<_, Seller>(
            r#"
            SELECT id, first_name, last_name, email, phone_number, region, is_active, created_at
            FROM sellers
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(seller)
    }

    async fn insert(&self, seller: &Seller) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sellers (id, first_name, last_name, email, phone_number, region, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(seller.id)
        .bind(&seller.first_name)
        .bind(&seller.last_name)
        .bind(&seller.email)
        .bind(&seller.phone_number)
        .bind(&seller.region)
        .bind(seller.is_active)
        .bind(seller.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update(&self, seller: &Seller) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sellers
            SET first_name = $2, last_name = $3, phone_number = $4, region = $5, is_active = $6
            WHERE id = $1
            "#,
        )
        .bind(seller.id)
        .bind(&seller.first_name)
        .bind(&seller.last_name)
        .bind(&seller.phone_number)
        .bind(&seller.region)
        .bind(seller.is_active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
