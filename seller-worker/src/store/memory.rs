use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use common_types::Seller;

use super::{SellerStore, StoreError};

#[derive(Default)]
struct State {
    sellers: HashMap<String, Seller>,
    transient_bulk_failures: usize,
    other_bulk_failures: usize,
    concurrent_inserts: Vec<Seller>,
    broken_emails: HashSet<String>,
    unavailable_emails: HashSet<String>,
    offline: bool,
    bulk_insert_calls: usize,
    insert_calls: usize,
    update_calls: usize,
}

/// Seller store kept in memory, keyed by email, with knobs to make the next
/// writes fail. Clones share their state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sellers(sellers: impl IntoIterator<Item = Seller>) -> Self {
        let store = Self::new();
        {
            let mut state = store.lock();
            for seller in sellers {
                state.sellers.insert(seller.email.clone(), seller);
            }
        }
        store
    }

    /// The next `count` bulk inserts fail with a transient error.
    pub fn fail_next_bulk_inserts(&self, count: usize) {
        self.lock().transient_bulk_failures = count;
    }

    /// The next `count` bulk inserts fail with an unclassified error.
    pub fn break_next_bulk_inserts(&self, count: usize) {
        self.lock().other_bulk_failures = count;
    }

    /// Stores `seller` right before the next bulk insert runs, as a
    /// concurrent writer would.
    pub fn insert_before_next_bulk(&self, seller: Seller) {
        self.lock().concurrent_inserts.push(seller);
    }

    /// Every write touching `email` fails with an unclassified error.
    pub fn break_email(&self, email: &str) {
        self.lock().broken_emails.insert(email.to_string());
    }

    /// Every lookup of `email` fails with a transient error.
    pub fn make_email_unavailable(&self, email: &str) {
        self.lock().unavailable_emails.insert(email.to_string());
    }

    /// While offline every operation fails with a transient error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn get(&self, email: &str) -> Option<Seller> {
        self.lock().sellers.get(email).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().sellers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bulk_insert_calls(&self) -> usize {
        self.lock().bulk_insert_calls
    }

    pub fn insert_calls(&self) -> usize {
        self.lock().insert_calls
    }

    pub fn update_calls(&self) -> usize {
        self.lock().update_calls
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl State {
    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline {
            return Err(StoreError::Transient("connection refused".to_string()));
        }
        Ok(())
    }

    fn check_writable(&self, email: &str) -> Result<(), StoreError> {
        if self.broken_emails.contains(email) {
            return Err(StoreError::Other(format!("write rejected for {email}")));
        }
        Ok(())
    }

    fn check_unique(&self, seller: &Seller) -> Result<(), StoreError> {
        if self.sellers.contains_key(&seller.email) {
            return Err(StoreError::Conflict(format!(
                "email {} already exists",
                seller.email
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SellerStore for MemoryStore {
    async fn find_existing_emails(&self, emails: &[String]) -> Result<HashSet<String>, StoreError> {
        let state = self.lock();
        state.check_online()?;
        Ok(emails
            .iter()
            .filter(|email| state.sellers.contains_key(*email))
            .cloned()
            .collect())
    }

    async fn bulk_insert(&self, sellers: &[Seller]) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.bulk_insert_calls += 1;
        state.check_online()?;

        for seller in std::mem::take(&mut state.concurrent_inserts) {
            state.sellers.insert(seller.email.clone(), seller);
        }

        if state.transient_bulk_failures > 0 {
            state.transient_bulk_failures -= 1;
            return Err(StoreError::Transient("connection reset".to_string()));
        }
        if state.other_bulk_failures > 0 {
            state.other_bulk_failures -= 1;
            return Err(StoreError::Other("disk full".to_string()));
        }

        let mut batch_emails = HashSet::new();
        for seller in sellers {
            state.check_writable(&seller.email)?;
            state.check_unique(seller)?;
            if !batch_emails.insert(seller.email.as_str()) {
                return Err(StoreError::Conflict(format!(
                    "email {} appears twice",
                    seller.email
                )));
            }
        }

        for seller in sellers {
            state.sellers.insert(seller.email.clone(), seller.clone());
        }
        Ok(())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Seller>, StoreError> {
        let state = self.lock();
        state.check_online()?;
        if state.unavailable_emails.contains(email) {
            return Err(StoreError::Transient(format!("lookup of {email} timed out")));
        }
        Ok(state.sellers.get(email).cloned())
    }

    async fn insert(&self, seller: &Seller) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.insert_calls += 1;
        state.check_online()?;
        state.check_writable(&seller.email)?;
        state.check_unique(seller)?;
        state.sellers.insert(seller.email.clone(), seller.clone());
        Ok(())
    }

    async fn update(&self, seller: &Seller) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.update_calls += 1;
        state.check_online()?;
        state.check_writable(&seller.email)?;

        let stored = state
            .sellers
            .values_mut()
            .find(|stored| stored.id == seller.id)
            .ok_or_else(|| StoreError::Other(format!("seller {} not found", seller.id)))?;

        stored.first_name.clone_from(&seller.first_name);
        stored.last_name.clone_from(&seller.last_name);
        stored.phone_number.clone_from(&seller.phone_number);
        stored.region.clone_from(&seller.region);
        stored.is_active = seller.is_active;
        Ok(())
    }
}
