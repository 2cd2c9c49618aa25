//! Hotspot/PPPoE AAA core
//!
//! A RADIUS server that authorizes subscribers and vouchers, leases
//! addresses from IP pools, records accounting sessions and enforces a
//! fair-usage policy by sending Disconnect requests back to the NAS.
//!
//! # Components
//!
//! - [`server`]: UDP listener answering Access-Request and Accounting-Request
//! - [`authorize`]: the access decision (subscriber, voucher fallback, IPAM, FUP)
//! - [`accounting`]: session records from Start/Interim-Update/Stop
//! - [`ipam`]: lowest-free address allocation with idempotent leases
//! - [`fup`]: rolling daily/monthly usage limits
//! - [`coa`]: RFC 5176 client and the background dispatch queue
//! - [`store`]: storage seams with in-memory and PostgreSQL backends
//!
//! # Example
//!
//! ```rust,no_run
//! use hotspot_aaa::store::{MemoryStore, Stores};
//! use hotspot_aaa::{Config, RadiusServer, ServerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stores = Stores::memory(Arc::new(MemoryStore::new()));
//!     let server_config = ServerConfig::from_config(Config::default(), stores)?;
//!
//!     let server = RadiusServer::new(server_config).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod accounting;
pub mod audit;
pub mod authorize;
pub mod coa;
pub mod config;
pub mod fup;
pub mod ipam;
pub mod model;
pub mod server;
pub mod store;

pub use accounting::{AccountingOutcome, AccountingProcessor};
pub use audit::{AuditEntry, AuditEventType, AuditLogger};
pub use authorize::{AccessCredentials, AccessDecision, AccessGrant, Authorizer, RejectReason};
pub use coa::{CoaAction, CoaClient, CoaDispatcher, CoaError, CoaJob, CoaSender, COA_PORT};
pub use config::{Client, CoaSettings, Config, ConfigError, PostgresSettings};
pub use fup::{FupError, FupEvaluator, ThrottledSpeeds, UsageStats};
pub use ipam::{IpamAllocator, IpamError};
pub use server::{InboundRequest, RadiusServer, ServerConfig, ServerError};
pub use store::{StoreError, Stores};
