//! RADIUS Accounting (RFC 2866)
//!
//! Status and termination enums plus [`AccountingRequest`], the typed view of
//! an inbound Accounting-Request that the server persists.
//!
//! # Example
//!
//! ```rust
//! use radius_wire::accounting::{AcctStatusType, AcctTerminateCause};
//!
//! assert_eq!(AcctStatusType::InterimUpdate.as_u32(), 3);
//! assert_eq!(AcctTerminateCause::from_u32(1), Some(AcctTerminateCause::UserRequest));
//! assert_eq!(AcctTerminateCause::IdleTimeout.name(), "Idle-Timeout");
//! ```

use crate::attributes::AttributeType;
use crate::packet::{Code, Packet};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Acct-Status-Type values (RFC 2866 Section 5.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AcctStatusType {
    Start = 1,
    Stop = 2,
    InterimUpdate = 3,
    /// NAS is ready
    AccountingOn = 7,
    /// NAS is shutting down
    AccountingOff = 8,
}

impl AcctStatusType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(AcctStatusType::Start),
            2 => Some(AcctStatusType::Stop),
            3 => Some(AcctStatusType::InterimUpdate),
            7 => Some(AcctStatusType::AccountingOn),
            8 => Some(AcctStatusType::AccountingOff),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Start, Stop and Interim-Update refer to a subscriber session
    pub fn is_session_status(self) -> bool {
        matches!(
            self,
            AcctStatusType::Start | AcctStatusType::Stop | AcctStatusType::InterimUpdate
        )
    }
}

/// Acct-Terminate-Cause values (RFC 2866 Section 5.10)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AcctTerminateCause {
    UserRequest = 1,
    LostCarrier = 2,
    LostService = 3,
    IdleTimeout = 4,
    SessionTimeout = 5,
    AdminReset = 6,
    AdminReboot = 7,
    PortError = 8,
    NasError = 9,
    NasRequest = 10,
    NasReboot = 11,
    PortUnneeded = 12,
    PortPreempted = 13,
    PortSuspended = 14,
    ServiceUnavailable = 15,
    Callback = 16,
    UserError = 17,
    HostRequest = 18,
}

impl AcctTerminateCause {
    pub fn from_u32(value: u32) -> Option<Self> {
        use AcctTerminateCause::*;
        Some(match value {
            1 => UserRequest,
            2 => LostCarrier,
            3 => LostService,
            4 => IdleTimeout,
            5 => SessionTimeout,
            6 => AdminReset,
            7 => AdminReboot,
            8 => PortError,
            9 => NasError,
            10 => NasRequest,
            11 => NasReboot,
            12 => PortUnneeded,
            13 => PortPreempted,
            14 => PortSuspended,
            15 => ServiceUnavailable,
            16 => Callback,
            17 => UserError,
            18 => HostRequest,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Dictionary name of the cause, as stored on session records
    pub fn name(self) -> &'static str {
        use AcctTerminateCause::*;
        match self {
            UserRequest => "User-Request",
            LostCarrier => "Lost-Carrier",
            LostService => "Lost-Service",
            IdleTimeout => "Idle-Timeout",
            SessionTimeout => "Session-Timeout",
            AdminReset => "Admin-Reset",
            AdminReboot => "Admin-Reboot",
            PortError => "Port-Error",
            NasError => "NAS-Error",
            NasRequest => "NAS-Request",
            NasReboot => "NAS-Reboot",
            PortUnneeded => "Port-Unneeded",
            PortPreempted => "Port-Preempted",
            PortSuspended => "Port-Suspended",
            ServiceUnavailable => "Service-Unavailable",
            Callback => "Callback",
            UserError => "User-Error",
            HostRequest => "Host-Request",
        }
    }
}

/// Accounting-related errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccountingError {
    #[error("Not an Accounting-Request: {0:?}")]
    NotAccountingRequest(Code),

    #[error("Missing required attribute: {0}")]
    MissingAttribute(&'static str),

    #[error("Invalid Acct-Status-Type value: {0}")]
    InvalidStatusType(u32),
}

/// Typed view of an Accounting-Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountingRequest {
    pub status: AcctStatusType,
    pub session_id: String,
    pub username: String,
    pub nas_ip: Option<Ipv4Addr>,
    pub framed_ip: Option<Ipv4Addr>,
    /// Acct-Input-Octets extended with Acct-Input-Gigawords
    pub input_octets: u64,
    /// Acct-Output-Octets extended with Acct-Output-Gigawords
    pub output_octets: u64,
    /// Raw Acct-Terminate-Cause value
    pub terminate_cause: Option<u32>,
}

impl AccountingRequest {
    /// Extract the accounting fields from a decoded packet.
    ///
    /// Acct-Session-Id is only required for session status types; an
    /// Accounting-On/Off without one yields an empty session id.
    pub fn from_packet(packet: &Packet) -> Result<Self, AccountingError> {
        if packet.code != Code::AccountingRequest {
            return Err(AccountingError::NotAccountingRequest(packet.code));
        }

        let raw_status = packet
            .integer_attribute(AttributeType::AcctStatusType)
            .ok_or(AccountingError::MissingAttribute("Acct-Status-Type"))?;
        let status = AcctStatusType::from_u32(raw_status)
            .ok_or(AccountingError::InvalidStatusType(raw_status))?;

        let session_id = match packet.string_attribute(AttributeType::AcctSessionId) {
            Some(id) => id,
            None if status.is_session_status() => {
                return Err(AccountingError::MissingAttribute("Acct-Session-Id"))
            }
            None => String::new(),
        };

        Ok(AccountingRequest {
            status,
            session_id,
            username: packet
                .string_attribute(AttributeType::UserName)
                .unwrap_or_default(),
            nas_ip: packet.ipv4_attribute(AttributeType::NasIpAddress),
            framed_ip: packet.ipv4_attribute(AttributeType::FramedIpAddress),
            input_octets: octets(
                packet,
                AttributeType::AcctInputOctets,
                AttributeType::AcctInputGigawords,
            ),
            output_octets: octets(
                packet,
                AttributeType::AcctOutputOctets,
                AttributeType::AcctOutputGigawords,
            ),
            terminate_cause: packet.integer_attribute(AttributeType::AcctTerminateCause),
        })
    }

    /// Terminate cause rendered by dictionary name, falling back to the number
    pub fn terminate_cause_name(&self) -> Option<String> {
        self.terminate_cause.map(|raw| {
            AcctTerminateCause::from_u32(raw)
                .map(|cause| cause.name().to_string())
                .unwrap_or_else(|| raw.to_string())
        })
    }
}

fn octets(packet: &Packet, low: AttributeType, high: AttributeType) -> u64 {
    let low = u64::from(packet.integer_attribute(low).unwrap_or(0));
    let high = u64::from(packet.integer_attribute(high).unwrap_or(0));
    (high << 32) | low
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::Attribute;

    fn accounting_packet(status: AcctStatusType) -> Packet {
        let mut packet = Packet::new(Code::AccountingRequest, 1, [0u8; 16]);
        packet.add_attribute(
            Attribute::integer(AttributeType::AcctStatusType as u8, status.as_u32()).unwrap(),
        );
        packet
    }

    #[test]
    fn test_acct_status_type_conversion() {
        assert_eq!(AcctStatusType::from_u32(1), Some(AcctStatusType::Start));
        assert_eq!(AcctStatusType::from_u32(3), Some(AcctStatusType::InterimUpdate));
        assert_eq!(AcctStatusType::from_u32(8), Some(AcctStatusType::AccountingOff));
        assert_eq!(AcctStatusType::from_u32(99), None);
        assert!(AcctStatusType::Stop.is_session_status());
        assert!(!AcctStatusType::AccountingOn.is_session_status());
    }

    #[test]
    fn test_terminate_cause_names() {
        assert_eq!(AcctTerminateCause::from_u32(6).map(|c| c.name()), Some("Admin-Reset"));
        assert_eq!(AcctTerminateCause::NasReboot.as_u32(), 11);
        assert_eq!(AcctTerminateCause::from_u32(0), None);
    }

    #[test]
    fn test_from_packet_interim() {
        let mut packet = accounting_packet(AcctStatusType::InterimUpdate);
        packet.add_attribute(Attribute::string(AttributeType::AcctSessionId as u8, "S1").unwrap());
        packet.add_attribute(Attribute::string(AttributeType::UserName as u8, "alice").unwrap());
        packet.add_attribute(Attribute::ipv4(AttributeType::NasIpAddress as u8, [10, 0, 0, 1]).unwrap());
        packet.add_attribute(Attribute::integer(AttributeType::AcctInputOctets as u8, 500).unwrap());
        packet.add_attribute(Attribute::integer(AttributeType::AcctOutputOctets as u8, 7).unwrap());
        packet.add_attribute(Attribute::integer(AttributeType::AcctOutputGigawords as u8, 1).unwrap());

        let request = AccountingRequest::from_packet(&packet).unwrap();
        assert_eq!(request.status, AcctStatusType::InterimUpdate);
        assert_eq!(request.session_id, "S1");
        assert_eq!(request.username, "alice");
        assert_eq!(request.nas_ip, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(request.framed_ip, None);
        assert_eq!(request.input_octets, 500);
        assert_eq!(request.output_octets, (1u64 << 32) + 7);
    }

    #[test]
    fn test_from_packet_requires_session_id() {
        let packet = accounting_packet(AcctStatusType::Start);
        assert_eq!(
            AccountingRequest::from_packet(&packet),
            Err(AccountingError::MissingAttribute("Acct-Session-Id"))
        );

        let packet = accounting_packet(AcctStatusType::AccountingOn);
        assert!(AccountingRequest::from_packet(&packet).is_ok());
    }

    #[test]
    fn test_from_packet_unknown_status() {
        let mut packet = Packet::new(Code::AccountingRequest, 1, [0u8; 16]);
        packet.add_attribute(Attribute::integer(AttributeType::AcctStatusType as u8, 15).unwrap());
        assert_eq!(
            AccountingRequest::from_packet(&packet),
            Err(AccountingError::InvalidStatusType(15))
        );
    }

    #[test]
    fn test_terminate_cause_name_fallback() {
        let mut packet = accounting_packet(AcctStatusType::Stop);
        packet.add_attribute(Attribute::string(AttributeType::AcctSessionId as u8, "S1").unwrap());
        packet.add_attribute(Attribute::integer(AttributeType::AcctTerminateCause as u8, 4).unwrap());
        let request = AccountingRequest::from_packet(&packet).unwrap();
        assert_eq!(request.terminate_cause_name().as_deref(), Some("Idle-Timeout"));

        let mut other = request.clone();
        other.terminate_cause = Some(200);
        assert_eq!(other.terminate_cause_name().as_deref(), Some("200"));
    }
}
