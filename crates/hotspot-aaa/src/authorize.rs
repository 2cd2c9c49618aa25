//! Access-Request decisions
//!
//! Resolution order:
//! 1. subscriber matching any supplied identifier by username, MAC or phone
//! 2. otherwise an active voucher whose code equals the User-Name
//! 3. otherwise reject
//!
//! A resolved subscriber is then checked for blacklisting, PPPoE password
//! and access expiry, in that order. Vouchers skip IPAM and FUP.

use crate::fup::{FupEvaluator, ThrottledSpeeds};
use crate::ipam::IpamAllocator;
use crate::model::{PoolId, ServiceType, Subscriber, UserId, Voucher, VoucherStatus};
use crate::store::{StoreError, SubscriberStore};
use chrono::{DateTime, Duration, Utc};
use radius_wire::{decrypt_user_password, Attribute, AttributeType, Packet, PacketError};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why an Access-Request was refused. Never sent to the NAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownIdentity,
    Blacklisted,
    BadPassword,
    Expired,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::UnknownIdentity => "unknown identity",
            RejectReason::Blacklisted => "blacklisted",
            RejectReason::BadPassword => "password mismatch",
            RejectReason::Expired => "access expired",
        }
    }
}

/// What the subscriber gets on Access-Accept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub username: String,
    /// None for voucher sessions
    pub subscriber_id: Option<UserId>,
    pub framed_ip: Option<Ipv4Addr>,
    /// Seconds
    pub session_timeout: u32,
    /// Set when the subscriber is over a FUP limit
    pub throttle: Option<ThrottledSpeeds>,
}

impl AccessGrant {
    pub fn via_voucher(&self) -> bool {
        self.subscriber_id.is_none()
    }

    /// Add Framed-IP-Address and Session-Timeout to an Access-Accept
    pub fn apply(&self, reply: &mut Packet) -> Result<(), PacketError> {
        if let Some(ip) = self.framed_ip {
            reply.add_attribute(Attribute::ipv4(
                AttributeType::FramedIpAddress as u8,
                ip.octets(),
            )?);
        }
        reply.add_attribute(Attribute::integer(
            AttributeType::SessionTimeout as u8,
            self.session_timeout,
        )?);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Accept(AccessGrant),
    Reject(RejectReason),
}

/// Identity and secret material lifted from an Access-Request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessCredentials {
    /// User-Name, then Calling-Station-Id; empty values dropped
    pub identifiers: Vec<String>,
    /// Recovered User-Password, if present and decodable
    pub password: Option<String>,
}

impl AccessCredentials {
    pub fn from_packet(packet: &Packet, secret: &[u8]) -> Self {
        let identifiers = [AttributeType::UserName, AttributeType::CallingStationId]
            .into_iter()
            .filter_map(|attr| packet.string_attribute(attr))
            .filter(|value| !value.is_empty())
            .collect();

        let password = packet
            .find_attribute(AttributeType::UserPassword)
            .and_then(|attr| {
                decrypt_user_password(&attr.value, secret, &packet.authenticator)
                    .map_err(|e| debug!(error = %e, "Undecodable User-Password"))
                    .ok()
            });

        AccessCredentials {
            identifiers,
            password,
        }
    }

    /// Name used for logs and the voucher fallback
    pub fn primary(&self) -> &str {
        self.identifiers.first().map(String::as_str).unwrap_or("")
    }
}

/// Session-Timeout in whole seconds, never negative
pub fn session_timeout_secs(remaining: Duration) -> u32 {
    u32::try_from(remaining.num_seconds().max(0)).unwrap_or(u32::MAX)
}

pub struct Authorizer {
    subscribers: Arc<dyn SubscriberStore>,
    ipam: Arc<IpamAllocator>,
    fup: Arc<FupEvaluator>,
    pool_id: PoolId,
}

impl Authorizer {
    pub fn new(
        subscribers: Arc<dyn SubscriberStore>,
        ipam: Arc<IpamAllocator>,
        fup: Arc<FupEvaluator>,
        pool_id: PoolId,
    ) -> Self {
        Authorizer {
            subscribers,
            ipam,
            fup,
            pool_id,
        }
    }

    pub async fn authorize(
        &self,
        credentials: &AccessCredentials,
    ) -> Result<AccessDecision, StoreError> {
        self.authorize_at(credentials, Utc::now()).await
    }

    /// Decide an Access-Request as of `now`. Only store lookups of the
    /// subscriber or voucher can fail; IPAM and FUP failures degrade.
    pub async fn authorize_at(
        &self,
        credentials: &AccessCredentials,
        now: DateTime<Utc>,
    ) -> Result<AccessDecision, StoreError> {
        let subscriber = self.resolve_subscriber(credentials).await?;

        let Some(subscriber) = subscriber else {
            let code = credentials.primary();
            if code.is_empty() {
                return Ok(AccessDecision::Reject(RejectReason::UnknownIdentity));
            }
            return Ok(match self.subscribers.find_voucher(code).await? {
                Some(voucher) if voucher.status == VoucherStatus::Active => {
                    AccessDecision::Accept(voucher_grant(&voucher))
                }
                _ => AccessDecision::Reject(RejectReason::UnknownIdentity),
            });
        };

        if let Some(reason) = check_subscriber(&subscriber, credentials, now) {
            return Ok(AccessDecision::Reject(reason));
        }

        let framed_ip = match self
            .ipam
            .allocate_ip(self.pool_id, subscriber.id, &subscriber.mac_address)
            .await
        {
            Ok(lease) => Some(lease.ip_address),
            Err(e) => {
                warn!(
                    username = %subscriber.username,
                    pool_id = self.pool_id,
                    error = %e,
                    "IP allocation failed, accepting without Framed-IP-Address"
                );
                None
            }
        };

        let throttle = self.throttle_for(&subscriber).await;

        Ok(AccessDecision::Accept(AccessGrant {
            username: subscriber.username.clone(),
            subscriber_id: Some(subscriber.id),
            framed_ip,
            session_timeout: session_timeout_secs(subscriber.access_expires_at - now),
            throttle,
        }))
    }

    async fn resolve_subscriber(
        &self,
        credentials: &AccessCredentials,
    ) -> Result<Option<Subscriber>, StoreError> {
        for identifier in &credentials.identifiers {
            if let Some(subscriber) = self.subscribers.find_subscriber(identifier).await? {
                return Ok(Some(subscriber));
            }
        }
        Ok(None)
    }

    /// Throttle rate if the subscriber is over a limit. Informational at
    /// access time; no rate attribute is added to the reply.
    async fn throttle_for(&self, subscriber: &Subscriber) -> Option<ThrottledSpeeds> {
        let package_id = subscriber.package_id.unwrap_or(0);
        match self.fup.check_fup_status(subscriber.id, package_id).await {
            Ok(false) => None,
            Ok(true) => match self.fup.get_throttled_speeds(package_id).await {
                Ok(speeds) => {
                    info!(
                        username = %subscriber.username,
                        down_kbps = speeds.down_kbps,
                        up_kbps = speeds.up_kbps,
                        "FUP throttling active"
                    );
                    Some(speeds)
                }
                Err(e) => {
                    warn!(username = %subscriber.username, error = %e, "Throttled speeds unavailable");
                    None
                }
            },
            Err(e) => {
                warn!(username = %subscriber.username, error = %e, "FUP check failed");
                None
            }
        }
    }
}

fn check_subscriber(
    subscriber: &Subscriber,
    credentials: &AccessCredentials,
    now: DateTime<Utc>,
) -> Option<RejectReason> {
    if subscriber.is_blacklisted {
        return Some(RejectReason::Blacklisted);
    }
    if subscriber.service_type == ServiceType::Pppoe
        && credentials.password.as_deref() != Some(subscriber.password.as_str())
    {
        return Some(RejectReason::BadPassword);
    }
    if now > subscriber.access_expires_at {
        return Some(RejectReason::Expired);
    }
    None
}

fn voucher_grant(voucher: &Voucher) -> AccessGrant {
    AccessGrant {
        username: voucher.code.clone(),
        subscriber_id: None,
        framed_ip: None,
        session_timeout: voucher.package.duration.saturating_mul(60),
        throttle: None,
    }
}
