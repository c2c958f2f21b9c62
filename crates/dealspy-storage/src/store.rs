use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone, Utc};
use dealspy_core::{Deal, NewDeal, Source, SubscriptionStatus, SubscriptionTier, User};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The store could not be reached at all (pool timeout, I/O, closed pool).
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("failed to decode row: {0}")]
    Decode(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl StorageError {
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::Unavailable(_) => "unavailable",
            StorageError::Query(_) => "query",
            StorageError::Decode(_) => "decode",
            StorageError::NotFound(_) => "not_found",
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => StorageError::Unavailable(err.to_string()),
            sqlx::Error::RowNotFound => StorageError::NotFound(err.to_string()),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_) => StorageError::Decode(err.to_string()),
            other => StorageError::Query(other.to_string()),
        }
    }
}

/// Result of an upsert: the stored row, and whether this call created it.
#[derive(Debug, Clone, PartialEq)]
pub struct Upserted {
    pub deal: Deal,
    pub inserted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateManySummary {
    pub created: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// Converts "now" in `tz` to the UTC instant of that day's local midnight.
pub fn start_of_day_utc<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Utc> {
    let midnight = now.date_naive().and_time(chrono::NaiveTime::MIN);
    now.timezone()
        .from_local_datetime(&midnight)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| midnight.and_utc())
}

/// Persistent deal ledger keyed by `(source, source_id)`.
///
/// `upsert` is first-write-wins: a conflicting insert leaves the stored row untouched
/// and returns it with `inserted = false`.
#[async_trait]
pub trait DealStore: Send + Sync {
    async fn exists(&self, source: Source, source_id: &str) -> Result<bool, StorageError>;

    async fn upsert(&self, deal: NewDeal) -> Result<Upserted, StorageError>;

    async fn get_unnotified(&self) -> Result<Vec<Deal>, StorageError>;

    /// Sets `notified_at` on rows that do not have it yet. Empty input is a no-op.
    async fn mark_notified(&self, ids: &[Uuid]) -> Result<(), StorageError>;

    async fn created_since(&self, since: DateTime<Utc>) -> Result<Vec<Deal>, StorageError>;

    async fn get_created_today(&self) -> Result<Vec<Deal>, StorageError> {
        self.created_since(start_of_day_utc(&Local::now())).await
    }

    /// Bulk insert that never fails as a whole; per-row failures are counted and logged.
    async fn create_many(&self, deals: Vec<NewDeal>) -> CreateManySummary {
        let mut summary = CreateManySummary::default();
        for deal in deals {
            let source = deal.source;
            let source_id = deal.source_id.clone();
            match self.exists(source, &source_id).await {
                Ok(true) => {
                    summary.duplicates += 1;
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(%source, source_id, error = %err, kind = err.kind(), "dedup check failed");
                    summary.failed += 1;
                    continue;
                }
            }
            match self.upsert(deal).await {
                Ok(Upserted { inserted: true, .. }) => summary.created += 1,
                Ok(Upserted { inserted: false, .. }) => {
                    debug!(%source, source_id, "late conflict counted as duplicate");
                    summary.duplicates += 1;
                }
                Err(err) => {
                    warn!(%source, source_id, error = %err, kind = err.kind(), "deal insert failed");
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}

/// Source of the active-subscriber pool the matcher filters.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Users whose status is trialing or active and whose tier is not cancelled.
    /// Date-based expiry is applied by the caller.
    async fn active_users(&self) -> Result<Vec<User>, StorageError>;
}

pub(crate) fn is_candidate_user(user: &User) -> bool {
    matches!(
        user.subscription.status,
        SubscriptionStatus::Trialing | SubscriptionStatus::Active
    ) && user.subscription.tier != SubscriptionTier::Cancelled
}

#[derive(Default)]
struct MemoryState {
    deals: Vec<Deal>,
    keys: HashMap<(Source, String), usize>,
    users: Vec<User>,
}

/// In-process store with the same semantics as the PostgreSQL store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: Vec<User>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                users,
                ..MemoryState::default()
            }),
        }
    }

    pub async fn insert_user(&self, user: User) {
        self.state.lock().await.users.push(user);
    }

    /// Inserts with an explicit creation time. Returns the existing row on conflict.
    pub async fn insert_deal_at(&self, deal: NewDeal, created_at: DateTime<Utc>) -> Upserted {
        let mut state = self.state.lock().await;
        let key = (deal.source, deal.source_id.clone());
        if let Some(&idx) = state.keys.get(&key) {
            return Upserted {
                deal: state.deals[idx].clone(),
                inserted: false,
            };
        }
        let stored = deal.into_deal(Uuid::new_v4(), created_at);
        let idx = state.deals.len();
        state.deals.push(stored.clone());
        state.keys.insert(key, idx);
        Upserted {
            deal: stored,
            inserted: true,
        }
    }

    pub async fn all_deals(&self) -> Vec<Deal> {
        self.state.lock().await.deals.clone()
    }
}

#[async_trait]
impl DealStore for MemoryStore {
    async fn exists(&self, source: Source, source_id: &str) -> Result<bool, StorageError> {
        let state = self.state.lock().await;
        Ok(state.keys.contains_key(&(source, source_id.to_string())))
    }

    async fn upsert(&self, deal: NewDeal) -> Result<Upserted, StorageError> {
        Ok(self.insert_deal_at(deal, Utc::now()).await)
    }

    async fn get_unnotified(&self) -> Result<Vec<Deal>, StorageError> {
        let state = self.state.lock().await;
        let mut out: Vec<Deal> = state
            .deals
            .iter()
            .filter(|d| d.notified_at.is_none())
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn mark_notified(&self, ids: &[Uuid]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut state = self.state.lock().await;
        for deal in state.deals.iter_mut().filter(|d| ids.contains(&d.id)) {
            deal.notified_at.get_or_insert(now);
        }
        Ok(())
    }

    async fn created_since(&self, since: DateTime<Utc>) -> Result<Vec<Deal>, StorageError> {
        let state = self.state.lock().await;
        let mut out: Vec<Deal> = state
            .deals
            .iter()
            .filter(|d| d.created_at >= since)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn active_users(&self) -> Result<Vec<User>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.users.iter().filter(|u| is_candidate_user(u)).cloned().collect())
    }
}
