//! IP address management
//!
//! Allocation is lowest-free-address within the pool range, scanning at most
//! [`MAX_POOL_SCAN`] addresses. A subscriber who already holds an active
//! lease in the pool gets that lease back unchanged.

use crate::model::{IpLease, IpPool, LeaseId, LeaseStatus, NewLease, NewPool, PoolId, UserId};
use crate::store::{IpamStore, StoreError};
use chrono::{Duration, Utc};
use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Upper bound on addresses enumerated per allocation
pub const MAX_POOL_SCAN: usize = 1000;

/// Attempts made when the store reports the chosen address was taken concurrently
pub const MAX_ALLOCATION_ATTEMPTS: usize = 3;

pub const DEFAULT_LEASE_DURATION_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IpamError {
    #[error("IP pool {0} not found")]
    PoolNotFound(PoolId),

    #[error("IP pool {0} has no free addresses")]
    PoolExhausted(PoolId),

    #[error("Invalid pool definition: {0}")]
    InvalidPool(String),

    #[error("Lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct IpamAllocator {
    store: Arc<dyn IpamStore>,
    lease_duration: Duration,
}

impl IpamAllocator {
    pub fn new(store: Arc<dyn IpamStore>, lease_duration_secs: u64) -> Self {
        let secs = i64::try_from(lease_duration_secs).unwrap_or(i64::MAX);
        IpamAllocator {
            store,
            lease_duration: Duration::try_seconds(secs).unwrap_or_else(|| Duration::hours(24)),
        }
    }

    /// Validate and persist a new pool
    pub async fn create_pool(&self, pool: NewPool) -> Result<IpPool, IpamError> {
        validate_pool(&pool)?;
        let created = self.store.insert_pool(pool).await?;
        info!(
            pool_id = created.id,
            subnet = %created.subnet,
            start_ip = %created.start_ip,
            end_ip = %created.end_ip,
            "Created IP pool"
        );
        Ok(created)
    }

    /// Lease an address from `pool_id` to the subscriber, reusing an existing
    /// active lease held by the same user or MAC address.
    pub async fn allocate_ip(
        &self,
        pool_id: PoolId,
        user_id: UserId,
        mac_address: &str,
    ) -> Result<IpLease, IpamError> {
        let pool = self
            .store
            .get_pool(pool_id)
            .await?
            .ok_or(IpamError::PoolNotFound(pool_id))?;

        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            if let Some(existing) = self
                .store
                .find_active_lease(pool_id, user_id, mac_address)
                .await?
            {
                debug!(
                    pool_id,
                    user_id,
                    ip = %existing.ip_address,
                    lease_id = existing.id,
                    "Reusing active lease"
                );
                return Ok(existing);
            }

            let taken: HashSet<Ipv4Addr> =
                self.store.active_addresses(pool_id).await?.into_iter().collect();
            let candidate = pool_addresses(&pool)
                .find(|ip| !taken.contains(ip))
                .ok_or(IpamError::PoolExhausted(pool_id))?;

            let lease = NewLease {
                pool_id,
                user_id,
                ip_address: candidate,
                mac_address: mac_address.to_string(),
                expires_at: Utc::now() + self.lease_duration,
            };

            match self.store.insert_lease(lease).await {
                Ok(lease) => {
                    info!(
                        pool_id,
                        user_id,
                        ip = %lease.ip_address,
                        lease_id = lease.id,
                        "Allocated IP lease"
                    );
                    return Ok(lease);
                }
                Err(StoreError::Conflict(reason)) => {
                    debug!(pool_id, ip = %candidate, attempt, reason = %reason, "Address taken concurrently, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(pool_id, user_id, "Gave up allocating after repeated conflicts");
        Err(IpamError::PoolExhausted(pool_id))
    }

    /// Mark a lease released; its address becomes eligible on the next scan
    pub async fn release_lease(&self, lease_id: LeaseId) -> Result<(), IpamError> {
        match self
            .store
            .set_lease_status(lease_id, LeaseStatus::Released)
            .await
        {
            Ok(()) => {
                info!(lease_id, "Released IP lease");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Err(IpamError::LeaseNotFound(lease_id)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Addresses from `start_ip` to `end_ip` inclusive, capped at [`MAX_POOL_SCAN`]
fn pool_addresses(pool: &IpPool) -> impl Iterator<Item = Ipv4Addr> {
    (u32::from(pool.start_ip)..=u32::from(pool.end_ip))
        .take(MAX_POOL_SCAN)
        .map(Ipv4Addr::from)
}

fn validate_pool(pool: &NewPool) -> Result<(), IpamError> {
    let network: Ipv4Network = pool
        .subnet
        .parse()
        .map_err(|e| IpamError::InvalidPool(format!("subnet '{}': {}", pool.subnet, e)))?;

    for (label, ip) in [("start_ip", pool.start_ip), ("end_ip", pool.end_ip)] {
        if !network.contains(ip) {
            return Err(IpamError::InvalidPool(format!(
                "{} {} outside {}",
                label, ip, network
            )));
        }
    }

    if pool.start_ip > pool.end_ip {
        return Err(IpamError::InvalidPool(format!(
            "start_ip {} is after end_ip {}",
            pool.start_ip, pool.end_ip
        )));
    }

    Ok(())
}
