//! In-memory store backend
//!
//! Every table lives behind its own `tokio::sync::RwLock`. Writes that must
//! check a uniqueness rule (active lease per address, open session per id)
//! do the check and the insert under one write guard, which gives the same
//! guarantee as the partial unique index in the PostgreSQL schema.

use super::{
    FupConfigStore, IpamStore, SessionStore, StoreError, StoreResult, SubscriberStore,
};
use crate::model::{
    FupConfig, IpLease, IpPool, LeaseId, LeaseStatus, NewLease, NewPool, NewSession, PackageId,
    PoolId, RadiusSession, Subscriber, UserId, Voucher,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryStore {
    subscribers: RwLock<Vec<Subscriber>>,
    vouchers: RwLock<HashMap<String, Voucher>>,
    fup_configs: RwLock<HashMap<PackageId, FupConfig>>,
    pools: RwLock<BTreeMap<PoolId, IpPool>>,
    leases: RwLock<BTreeMap<LeaseId, IpLease>>,
    sessions: RwLock<BTreeMap<u64, RadiusSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a subscriber (matched by id)
    pub async fn upsert_subscriber(&self, subscriber: Subscriber) {
        let mut subscribers = self.subscribers.write().await;
        match subscribers.iter_mut().find(|s| s.id == subscriber.id) {
            Some(existing) => *existing = subscriber,
            None => subscribers.push(subscriber),
        }
    }

    pub async fn upsert_voucher(&self, voucher: Voucher) {
        self.vouchers
            .write()
            .await
            .insert(voucher.code.clone(), voucher);
    }

    pub async fn upsert_fup_config(&self, config: FupConfig) {
        self.fup_configs
            .write()
            .await
            .insert(config.package_id, config);
    }

    /// Snapshot of every session record, ordered by id
    pub async fn sessions(&self) -> Vec<RadiusSession> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Snapshot of every lease record in a pool, ordered by id
    pub async fn leases(&self, pool_id: PoolId) -> Vec<IpLease> {
        self.leases
            .read()
            .await
            .values()
            .filter(|l| l.pool_id == pool_id)
            .cloned()
            .collect()
    }
}

fn next_id<V>(map: &BTreeMap<u64, V>) -> u64 {
    map.keys().next_back().map_or(1, |last| last + 1)
}

#[async_trait]
impl SubscriberStore for MemoryStore {
    async fn find_subscriber(&self, identifier: &str) -> StoreResult<Option<Subscriber>> {
        let subscribers = self.subscribers.read().await;
        Ok(subscribers
            .iter()
            .find(|s| s.matches_identifier(identifier))
            .cloned())
    }

    async fn find_subscriber_by_username(&self, username: &str) -> StoreResult<Option<Subscriber>> {
        let subscribers = self.subscribers.read().await;
        Ok(subscribers.iter().find(|s| s.username == username).cloned())
    }

    async fn find_voucher(&self, code: &str) -> StoreResult<Option<Voucher>> {
        Ok(self.vouchers.read().await.get(code).cloned())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, session: NewSession) -> StoreResult<RadiusSession> {
        let mut sessions = self.sessions.write().await;
        if sessions
            .values()
            .any(|s| s.is_open() && s.session_id == session.session_id)
        {
            return Err(StoreError::Conflict(format!(
                "open session {} already exists",
                session.session_id
            )));
        }

        let record = RadiusSession {
            id: next_id(&sessions),
            user_id: session.user_id,
            username: session.username,
            nas_ip: session.nas_ip,
            framed_ip: session.framed_ip,
            session_id: session.session_id,
            start_time: session.start_time,
            stop_time: None,
            input_octets: 0,
            output_octets: 0,
            termination_cause: None,
            created_at: session.start_time,
        };
        sessions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_open_session(&self, session_id: &str) -> StoreResult<Option<RadiusSession>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .find(|s| s.is_open() && s.session_id == session_id)
            .cloned())
    }

    async fn update_session(&self, session: &RadiusSession) -> StoreResult<()> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session.id) {
            Some(existing) => {
                *existing = session.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("session record {}", session.id))),
        }
    }

    async fn usage_since(&self, user_id: UserId, since: DateTime<Utc>) -> StoreResult<u64> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.user_id == Some(user_id) && s.created_at >= since)
            .fold(0u64, |acc, s| acc.saturating_add(s.total_octets())))
    }
}

#[async_trait]
impl IpamStore for MemoryStore {
    async fn insert_pool(&self, pool: NewPool) -> StoreResult<IpPool> {
        let mut pools = self.pools.write().await;
        let record = IpPool {
            id: next_id(&pools),
            name: pool.name,
            subnet: pool.subnet,
            gateway: pool.gateway,
            start_ip: pool.start_ip,
            end_ip: pool.end_ip,
            pool_type: pool.pool_type,
        };
        pools.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_pool(&self, pool_id: PoolId) -> StoreResult<Option<IpPool>> {
        Ok(self.pools.read().await.get(&pool_id).cloned())
    }

    async fn find_active_lease(
        &self,
        pool_id: PoolId,
        user_id: UserId,
        mac_address: &str,
    ) -> StoreResult<Option<IpLease>> {
        let leases = self.leases.read().await;
        Ok(leases
            .values()
            .find(|l| {
                l.pool_id == pool_id
                    && l.status == LeaseStatus::Active
                    && (l.user_id == user_id
                        || (!mac_address.is_empty() && l.mac_address == mac_address))
            })
            .cloned())
    }

    async fn active_addresses(&self, pool_id: PoolId) -> StoreResult<Vec<Ipv4Addr>> {
        let leases = self.leases.read().await;
        Ok(leases
            .values()
            .filter(|l| l.pool_id == pool_id && l.status == LeaseStatus::Active)
            .map(|l| l.ip_address)
            .collect())
    }

    async fn insert_lease(&self, lease: NewLease) -> StoreResult<IpLease> {
        let mut leases = self.leases.write().await;
        if leases.values().any(|l| {
            l.pool_id == lease.pool_id
                && l.status == LeaseStatus::Active
                && l.ip_address == lease.ip_address
        }) {
            return Err(StoreError::Conflict(format!(
                "{} already leased in pool {}",
                lease.ip_address, lease.pool_id
            )));
        }

        let record = IpLease {
            id: next_id(&leases),
            pool_id: lease.pool_id,
            user_id: lease.user_id,
            ip_address: lease.ip_address,
            mac_address: lease.mac_address,
            status: LeaseStatus::Active,
            expires_at: lease.expires_at,
            created_at: Utc::now(),
        };
        leases.insert(record.id, record.clone());
        Ok(record)
    }

    async fn set_lease_status(&self, lease_id: LeaseId, status: LeaseStatus) -> StoreResult<()> {
        let mut leases = self.leases.write().await;
        match leases.get_mut(&lease_id) {
            Some(lease) => {
                lease.status = status;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("lease {}", lease_id))),
        }
    }

    async fn get_lease(&self, lease_id: LeaseId) -> StoreResult<Option<IpLease>> {
        Ok(self.leases.read().await.get(&lease_id).cloned())
    }
}

#[async_trait]
impl FupConfigStore for MemoryStore {
    async fn find_fup_config(&self, package_id: PackageId) -> StoreResult<Option<FupConfig>> {
        Ok(self.fup_configs.read().await.get(&package_id).cloned())
    }
}
