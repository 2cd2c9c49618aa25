//! Audit trail for access decisions, accounting and enforcement
//!
//! One JSON object per line. Disabled when no path is configured.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    AccessAccept,
    AccessReject,
    /// Accepted through the voucher fallback
    VoucherAccept,
    AccountingStart,
    AccountingUpdate,
    AccountingStop,
    /// Interim/Stop for a session that is not open
    AccountingDropped,
    /// Subscriber over FUP limit
    FupThrottled,
    CoaAck,
    CoaFailed,
    UnauthorizedClient,
    ServerStart,
    ServerStop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unix epoch seconds
    pub timestamp: i64,
    pub timestamp_iso: String,
    pub event_type: AuditEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u8>,
    /// Acct-Session-Id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framed_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub server_version: String,
}

impl AuditEntry {
    pub fn new(event_type: AuditEventType) -> Self {
        let now = Utc::now();
        AuditEntry {
            timestamp: now.timestamp(),
            timestamp_iso: now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            event_type,
            username: None,
            client_ip: None,
            request_id: None,
            session_id: None,
            framed_ip: None,
            details: None,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip.to_string());
        self
    }

    pub fn with_request_id(mut self, id: u8) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_framed_ip(mut self, ip: Ipv4Addr) -> Self {
        self.framed_ip = Some(ip.to_string());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

pub struct AuditLogger {
    file_path: Option<String>,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl AuditLogger {
    pub fn new(file_path: Option<String>) -> std::io::Result<Self> {
        let file = match file_path {
            Some(ref path) => {
                let f = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Arc::new(Mutex::new(f)))
            }
            None => None,
        };

        Ok(AuditLogger { file_path, file })
    }

    pub fn disabled() -> Self {
        AuditLogger {
            file_path: None,
            file: None,
        }
    }

    pub async fn log(&self, entry: AuditEntry) {
        if let Some(ref file) = self.file {
            match serde_json::to_string(&entry) {
                Ok(json) => {
                    let mut f = file.lock().await;
                    if let Err(e) = writeln!(f, "{}", json) {
                        error!("Failed to write audit log: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to serialize audit entry: {}", e);
                }
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    pub fn file_path(&self) -> Option<&str> {
        self.file_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::NamedTempFile;

    #[test]
    fn test_audit_entry_serialization() {
        let entry = AuditEntry::new(AuditEventType::AccessReject)
            .with_username("mallory")
            .with_client_ip("10.0.0.1".parse().unwrap())
            .with_request_id(42)
            .with_details("blacklisted");

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("access_reject"));
        assert!(json.contains("mallory"));
        assert!(json.contains("10.0.0.1"));
        assert!(!json.contains("session_id"));
    }

    #[tokio::test]
    async fn test_audit_logger_appends_lines() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap().to_string();

        let logger = AuditLogger::new(Some(path.clone())).unwrap();
        assert!(logger.is_enabled());
        assert_eq!(logger.file_path(), Some(path.as_str()));

        logger
            .log(
                AuditEntry::new(AuditEventType::AccountingStart)
                    .with_username("alice")
                    .with_session_id("S1")
                    .with_framed_ip(Ipv4Addr::new(10, 0, 0, 9)),
            )
            .await;
        logger
            .log(AuditEntry::new(AuditEventType::AccountingStop).with_session_id("S1"))
            .await;

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event_type, AuditEventType::AccountingStart);
        assert_eq!(first.framed_ip.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn test_audit_logger_disabled() {
        assert!(!AuditLogger::new(None).unwrap().is_enabled());
        assert!(!AuditLogger::disabled().is_enabled());
    }
}
