//! Message-Authenticator (RFC 3579 Section 3.2)
//!
//! HMAC-MD5 keyed with the shared secret over the whole packet, computed with
//! the Message-Authenticator value set to sixteen zero octets. For
//! Disconnect/CoA requests the header authenticator is also zeroed while
//! computing it (RFC 5176 Section 3.5).

use hmac::{Hmac, Mac};
use md5_digest::Md5;

type HmacMd5 = Hmac<Md5>;

/// HMAC-MD5 over `packet_bytes` keyed with `secret`
pub fn calculate_message_authenticator(packet_bytes: &[u8], secret: &[u8]) -> [u8; 16] {
    // HMAC accepts keys of any length, so this cannot fail
    let mut mac = match HmacMd5::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return [0u8; 16],
    };
    mac.update(packet_bytes);
    let mut output = [0u8; 16];
    output.copy_from_slice(&mac.finalize().into_bytes());
    output
}

/// Verify the Message-Authenticator whose value starts at `message_auth_offset`
pub fn verify_message_authenticator(
    packet_bytes: &[u8],
    secret: &[u8],
    message_auth_offset: usize,
) -> bool {
    let Some(received) = packet_bytes.get(message_auth_offset..message_auth_offset + 16) else {
        return false;
    };

    let mut packet_copy = packet_bytes.to_vec();
    packet_copy[message_auth_offset..message_auth_offset + 16].fill(0);

    let expected = calculate_message_authenticator(&packet_copy, secret);
    // Fold the comparison so timing does not depend on the first mismatch
    received
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_is_deterministic() {
        let packet = vec![0u8; 20];
        let auth = calculate_message_authenticator(&packet, b"testing123");
        assert_eq!(auth, calculate_message_authenticator(&packet, b"testing123"));
        assert_ne!(auth, calculate_message_authenticator(&packet, b"other"));
    }

    #[test]
    fn test_verify_valid_and_tampered() {
        let mut packet = vec![0u8; 40];
        let secret = b"testing123";

        let auth = calculate_message_authenticator(&packet, secret);
        packet[20..36].copy_from_slice(&auth);
        assert!(verify_message_authenticator(&packet, secret, 20));

        packet[38] = 1;
        assert!(!verify_message_authenticator(&packet, secret, 20));
    }

    #[test]
    fn test_verify_out_of_bounds() {
        assert!(!verify_message_authenticator(&[0u8; 20], b"testing123", 100));
    }
}
