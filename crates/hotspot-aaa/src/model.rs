//! Records read and written by the authorization core.
//!
//! Subscribers, vouchers, pools and FUP policies are owned by the billing and
//! administration side of the platform; this crate only reads them. Leases
//! and accounting sessions are created and mutated here and never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

pub type UserId = u64;
pub type PoolId = u64;
pub type LeaseId = u64;
pub type PackageId = u64;

/// How the subscriber reaches the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Hotspot,
    Pppoe,
}

impl ServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Hotspot => "hotspot",
            ServiceType::Pppoe => "pppoe",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hotspot" => Some(ServiceType::Hotspot),
            "pppoe" => Some(ServiceType::Pppoe),
            _ => None,
        }
    }
}

/// A hotspot or PPPoE subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub phone_number: String,
    /// Only checked for PPPoE subscribers
    #[serde(default)]
    pub password: String,
    pub service_type: ServiceType,
    pub access_expires_at: DateTime<Utc>,
    #[serde(default)]
    pub is_blacklisted: bool,
    /// Purchased package, used to select the FUP policy
    #[serde(default)]
    pub package_id: Option<PackageId>,
}

impl Subscriber {
    /// True if `identifier` equals the username, MAC address or phone number
    pub fn matches_identifier(&self, identifier: &str) -> bool {
        !identifier.is_empty()
            && (self.username == identifier
                || self.mac_address == identifier
                || self.phone_number == identifier)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoucherStatus {
    Active,
    Used,
    Expired,
}

impl VoucherStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VoucherStatus::Active => "active",
            VoucherStatus::Used => "used",
            VoucherStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(VoucherStatus::Active),
            "used" => Some(VoucherStatus::Used),
            "expired" => Some(VoucherStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingPackage {
    pub id: PackageId,
    #[serde(default)]
    pub name: String,
    /// Access duration in minutes
    pub duration: u32,
}

/// Prepaid access code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    pub code: String,
    pub status: VoucherStatus,
    pub package: PricingPackage,
}

/// Administrator-defined address range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPool {
    pub id: PoolId,
    pub name: String,
    /// CIDR, e.g. `10.10.0.0/24`
    pub subnet: String,
    pub gateway: Ipv4Addr,
    pub start_ip: Ipv4Addr,
    pub end_ip: Ipv4Addr,
    /// Free-form: "static", "dynamic", "pppoe"
    #[serde(default)]
    pub pool_type: String,
}

/// Pool definition before the store assigns an id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPool {
    pub name: String,
    pub subnet: String,
    pub gateway: Ipv4Addr,
    pub start_ip: Ipv4Addr,
    pub end_ip: Ipv4Addr,
    #[serde(default)]
    pub pool_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseStatus {
    Active,
    Released,
    Expired,
}

impl LeaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaseStatus::Active => "active",
            LeaseStatus::Released => "released",
            LeaseStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(LeaseStatus::Active),
            "released" => Some(LeaseStatus::Released),
            "expired" => Some(LeaseStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpLease {
    pub id: LeaseId,
    pub pool_id: PoolId,
    pub user_id: UserId,
    pub ip_address: Ipv4Addr,
    pub mac_address: String,
    pub status: LeaseStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLease {
    pub pool_id: PoolId,
    pub user_id: UserId,
    pub ip_address: Ipv4Addr,
    pub mac_address: String,
    pub expires_at: DateTime<Utc>,
}

/// Fair-usage policy attached to a pricing package. Limits are bytes, 0 means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FupConfig {
    pub package_id: PackageId,
    #[serde(default)]
    pub daily_limit: u64,
    #[serde(default)]
    pub monthly_limit: u64,
    /// Kbps
    pub throttled_down: u32,
    /// Kbps
    pub throttled_up: u32,
}

/// Accounting record for one NAS session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadiusSession {
    pub id: u64,
    /// Owning subscriber, when the username resolved at Start
    pub user_id: Option<UserId>,
    pub username: String,
    pub nas_ip: String,
    pub framed_ip: Option<Ipv4Addr>,
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub stop_time: Option<DateTime<Utc>>,
    pub input_octets: u64,
    pub output_octets: u64,
    pub termination_cause: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RadiusSession {
    pub fn is_open(&self) -> bool {
        self.stop_time.is_none()
    }

    pub fn total_octets(&self) -> u64 {
        self.input_octets.saturating_add(self.output_octets)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub user_id: Option<UserId>,
    pub username: String,
    pub nas_ip: String,
    pub framed_ip: Option<Ipv4Addr>,
    pub session_id: String,
    pub start_time: DateTime<Utc>,
}
