//! RADIUS wire codec
//!
//! Packet and attribute encoding for the subset of RADIUS spoken between a
//! hotspot/PPPoE NAS and its AAA server:
//!
//! - Access-Request / Accept / Reject (RFC 2865)
//! - Accounting-Request / Response (RFC 2866)
//! - Disconnect and CoA requests and their ACK/NAK replies (RFC 5176)
//!
//! plus the MD5-based authenticators, User-Password hiding and the
//! HMAC-MD5 Message-Authenticator.
//!
//! # Example
//!
//! ```rust
//! use radius_wire::{Attribute, AttributeType, Code, Packet};
//! use radius_wire::auth::{encrypt_user_password, generate_request_authenticator};
//!
//! let req_auth = generate_request_authenticator();
//! let mut packet = Packet::new(Code::AccessRequest, 1, req_auth);
//! packet.add_attribute(Attribute::string(AttributeType::UserName as u8, "alice").unwrap());
//! packet.add_attribute(
//!     Attribute::new(
//!         AttributeType::UserPassword as u8,
//!         encrypt_user_password("password", b"secret", &req_auth),
//!     )
//!     .unwrap(),
//! );
//!
//! let bytes = packet.encode().unwrap();
//! assert_eq!(Packet::decode(&bytes).unwrap().identifier, 1);
//! ```

pub mod accounting;
pub mod attributes;
pub mod auth;
pub mod message_auth;
pub mod packet;

pub use accounting::{AccountingError, AccountingRequest, AcctStatusType, AcctTerminateCause};
pub use attributes::{Attribute, AttributeType};
pub use auth::{
    calculate_accounting_request_authenticator, calculate_response_authenticator,
    decrypt_user_password, encrypt_user_password, generate_request_authenticator, sign_request,
    sign_response, verify_accounting_request_authenticator, verify_response_authenticator,
};
pub use message_auth::{calculate_message_authenticator, verify_message_authenticator};
pub use packet::{Code, Packet, PacketError};
