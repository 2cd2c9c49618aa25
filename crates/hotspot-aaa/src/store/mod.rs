//! Persistence seams for the authorization core
//!
//! The engine only depends on these traits. Two backends implement them:
//!
//! - [`MemoryStore`]: single-process store for tests and lab deployments
//! - `PostgresStore` (feature `postgres`): the production relational schema
//!
//! All trait methods are object-safe so the server can hold
//! `Arc<dyn SessionStore>` and friends without caring which backend is active.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

use crate::model::{
    FupConfig, IpLease, IpPool, LeaseId, LeaseStatus, NewLease, NewPool, NewSession, PackageId,
    PoolId, RadiusSession, Subscriber, UserId, Voucher,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by a store backend
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// A uniqueness rule was violated, e.g. a second active lease on one address
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read access to subscribers and vouchers
#[async_trait]
pub trait SubscriberStore: Send + Sync {
    /// Subscriber whose username, MAC address or phone number equals `identifier`
    async fn find_subscriber(&self, identifier: &str) -> StoreResult<Option<Subscriber>>;

    /// Subscriber by exact username
    async fn find_subscriber_by_username(&self, username: &str) -> StoreResult<Option<Subscriber>>;

    /// Voucher by code, regardless of status
    async fn find_voucher(&self, code: &str) -> StoreResult<Option<Voucher>>;
}

/// Accounting session records
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: NewSession) -> StoreResult<RadiusSession>;

    /// Session with this Acct-Session-Id that has no stop time yet
    async fn find_open_session(&self, session_id: &str) -> StoreResult<Option<RadiusSession>>;

    /// Persist counters, stop time and termination cause of an existing record
    async fn update_session(&self, session: &RadiusSession) -> StoreResult<()>;

    /// Sum of input and output octets over the user's sessions created at or after `since`
    async fn usage_since(&self, user_id: UserId, since: DateTime<Utc>) -> StoreResult<u64>;
}

/// Pools and leases
#[async_trait]
pub trait IpamStore: Send + Sync {
    async fn insert_pool(&self, pool: NewPool) -> StoreResult<IpPool>;

    async fn get_pool(&self, pool_id: PoolId) -> StoreResult<Option<IpPool>>;

    /// Active lease in `pool_id` held by `user_id` or, when `mac_address` is
    /// non-empty, bound to that MAC address
    async fn find_active_lease(
        &self,
        pool_id: PoolId,
        user_id: UserId,
        mac_address: &str,
    ) -> StoreResult<Option<IpLease>>;

    /// Addresses of all active leases in the pool
    async fn active_addresses(&self, pool_id: PoolId) -> StoreResult<Vec<Ipv4Addr>>;

    /// Insert an active lease. Fails with [`StoreError::Conflict`] when the
    /// address already has an active lease in the same pool.
    async fn insert_lease(&self, lease: NewLease) -> StoreResult<IpLease>;

    /// Fails with [`StoreError::NotFound`] for an unknown lease id
    async fn set_lease_status(&self, lease_id: LeaseId, status: LeaseStatus) -> StoreResult<()>;

    async fn get_lease(&self, lease_id: LeaseId) -> StoreResult<Option<IpLease>>;
}

/// Fair-usage policies
#[async_trait]
pub trait FupConfigStore: Send + Sync {
    async fn find_fup_config(&self, package_id: PackageId) -> StoreResult<Option<FupConfig>>;
}

/// The four store handles the engine runs against
#[derive(Clone)]
pub struct Stores {
    pub subscribers: Arc<dyn SubscriberStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub ipam: Arc<dyn IpamStore>,
    pub fup: Arc<dyn FupConfigStore>,
}

impl Stores {
    /// Route every seam to one in-memory store
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Stores {
            subscribers: store.clone(),
            sessions: store.clone(),
            ipam: store.clone(),
            fup: store,
        }
    }

    #[cfg(feature = "postgres")]
    pub fn postgres(store: Arc<PostgresStore>) -> Self {
        Stores {
            subscribers: store.clone(),
            sessions: store.clone(),
            ipam: store.clone(),
            fup: store,
        }
    }
}
