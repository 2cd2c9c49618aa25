//! Authenticator and User-Password handling (RFC 2865 Sections 3 and 5.2,
//! RFC 2866 Section 3, RFC 5176 Section 3.5).

use crate::attributes::{Attribute, AttributeType};
use crate::message_auth::calculate_message_authenticator;
use crate::packet::{Packet, PacketError};
use rand::Rng;

/// Maximum User-Password length before hiding (RFC 2865 Section 5.2)
pub const MAX_PASSWORD_LENGTH: usize = 128;

/// Generate a random Request Authenticator for an Access-Request
pub fn generate_request_authenticator() -> [u8; 16] {
    let mut authenticator = [0u8; 16];
    rand::rng().fill(&mut authenticator);
    authenticator
}

/// MD5 over the encoded packet with `authenticator` substituted into the
/// header, followed by the shared secret.
fn digest_with_authenticator(
    packet: &Packet,
    authenticator: &[u8; 16],
    secret: &[u8],
) -> Result<[u8; 16], PacketError> {
    let mut data = packet.encode()?;
    data[4..20].copy_from_slice(authenticator);
    data.extend_from_slice(secret);
    Ok(md5::compute(&data).0)
}

/// Response Authenticator per RFC 2865 Section 3
///
/// `MD5(Code + ID + Length + Request Authenticator + Attributes + Secret)`
///
/// Used for Access-Accept/Reject, Accounting-Response and the
/// Disconnect/CoA ACK and NAK replies.
pub fn calculate_response_authenticator(
    packet: &Packet,
    request_authenticator: &[u8; 16],
    secret: &[u8],
) -> Result<[u8; 16], PacketError> {
    digest_with_authenticator(packet, request_authenticator, secret)
}

/// Sign a reply in place and return its wire encoding
pub fn sign_response(
    response: &mut Packet,
    request_authenticator: &[u8; 16],
    secret: &[u8],
) -> Result<Vec<u8>, PacketError> {
    response.authenticator =
        calculate_response_authenticator(response, request_authenticator, secret)?;
    response.encode()
}

pub fn verify_response_authenticator(
    response: &Packet,
    request_authenticator: &[u8; 16],
    secret: &[u8],
) -> bool {
    calculate_response_authenticator(response, request_authenticator, secret)
        .map(|expected| expected == response.authenticator)
        .unwrap_or(false)
}

/// Request Authenticator for Accounting-Request, Disconnect-Request and
/// CoA-Request: `MD5(Code + ID + Length + 16 zero octets + Attributes + Secret)`
pub fn calculate_accounting_request_authenticator(
    packet: &Packet,
    secret: &[u8],
) -> Result<[u8; 16], PacketError> {
    digest_with_authenticator(packet, &[0u8; 16], secret)
}

/// Check the Request Authenticator of an inbound Accounting-Request
pub fn verify_accounting_request_authenticator(packet: &Packet, secret: &[u8]) -> bool {
    calculate_accounting_request_authenticator(packet, secret)
        .map(|expected| expected == packet.authenticator)
        .unwrap_or(false)
}

/// Sign an outbound digest-authenticated request (Disconnect/CoA/Accounting)
/// and return its wire encoding.
///
/// With `message_authenticator` set, a Message-Authenticator is appended and
/// computed over the packet with a zeroed authenticator field before the
/// Request Authenticator itself is calculated.
pub fn sign_request(
    request: &mut Packet,
    secret: &[u8],
    message_authenticator: bool,
) -> Result<Vec<u8>, PacketError> {
    request.authenticator = [0u8; 16];
    if message_authenticator {
        request.attributes.retain(|a| a.attr_type != AttributeType::MessageAuthenticator as u8);
        request.add_attribute(Attribute::new(
            AttributeType::MessageAuthenticator as u8,
            vec![0u8; 16],
        )?);
        let hmac = calculate_message_authenticator(&request.encode()?, secret);
        if let Some(attr) = request.attributes.last_mut() {
            attr.value = hmac.to_vec();
        }
    }
    request.authenticator = calculate_accounting_request_authenticator(request, secret)?;
    request.encode()
}

/// Hide a User-Password per RFC 2865 Section 5.2
///
/// The password is NUL-padded to a multiple of 16 bytes, then each block is
/// XORed with `MD5(secret + previous ciphertext block)`, seeded with the
/// Request Authenticator.
pub fn encrypt_user_password(password: &str, secret: &[u8], authenticator: &[u8; 16]) -> Vec<u8> {
    let mut padded = password.as_bytes().to_vec();
    let padded_len = padded.len().div_ceil(16).max(1) * 16;
    padded.resize(padded_len, 0);

    let mut result = Vec::with_capacity(padded_len);
    let mut previous_block = authenticator.to_vec();

    for chunk in padded.chunks(16) {
        let mut data = secret.to_vec();
        data.extend_from_slice(&previous_block);
        let hash = md5::compute(&data);

        let block: Vec<u8> = chunk.iter().zip(hash.0.iter()).map(|(p, h)| p ^ h).collect();
        result.extend_from_slice(&block);
        previous_block = block;
    }

    result
}

/// Recover a hidden User-Password
pub fn decrypt_user_password(
    encrypted: &[u8],
    secret: &[u8],
    authenticator: &[u8; 16],
) -> Result<String, PacketError> {
    if encrypted.is_empty()
        || encrypted.len() % 16 != 0
        || encrypted.len() > MAX_PASSWORD_LENGTH
    {
        return Err(PacketError::AttributeError(format!(
            "Invalid User-Password length: {}",
            encrypted.len()
        )));
    }

    let mut result = Vec::with_capacity(encrypted.len());
    let mut previous_block: &[u8] = authenticator;

    for chunk in encrypted.chunks(16) {
        let mut data = secret.to_vec();
        data.extend_from_slice(previous_block);
        let hash = md5::compute(&data);

        result.extend(chunk.iter().zip(hash.0.iter()).map(|(c, h)| c ^ h));
        previous_block = chunk;
    }

    while result.last() == Some(&0) {
        result.pop();
    }

    String::from_utf8(result)
        .map_err(|e| PacketError::AttributeError(format!("Invalid UTF-8 in password: {}", e)))
}
