use super::Code;
use crate::attributes::{Attribute, AttributeType};
use std::io;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Invalid packet length: {0}")]
    InvalidLength(usize),
    #[error("Invalid packet code: {0}")]
    InvalidCode(u8),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Attribute error: {0}")]
    AttributeError(String),
    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),
}

/// RADIUS Packet structure as defined in RFC 2865 Section 3
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Code      |  Identifier   |            Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// |                         Authenticator                         |
/// |                                                               |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Attributes ...
/// +-+-+-+-+-+-+-+-+-+-+-+-+-
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub code: Code,
    pub identifier: u8,
    /// Request or Response Authenticator (16 bytes)
    pub authenticator: [u8; 16],
    pub attributes: Vec<Attribute>,
}

impl Packet {
    /// Header size: code + identifier + length + authenticator
    pub const MIN_PACKET_SIZE: usize = 20;
    /// Maximum RADIUS packet size (RFC 2865 Section 3)
    pub const MAX_PACKET_SIZE: usize = 4096;

    pub fn new(code: Code, identifier: u8, authenticator: [u8; 16]) -> Self {
        Packet {
            code,
            identifier,
            authenticator,
            attributes: Vec::new(),
        }
    }

    /// Start a reply to this request.
    ///
    /// The identifier is copied and every Proxy-State attribute is echoed in
    /// order (RFC 2865 Section 5.33). The authenticator is left zeroed; the
    /// caller signs the finished reply with
    /// [`calculate_response_authenticator`](crate::auth::calculate_response_authenticator).
    pub fn reply(&self, code: Code) -> Packet {
        let mut response = Packet::new(code, self.identifier, [0u8; 16]);
        response.attributes.extend(
            self.attributes
                .iter()
                .filter(|a| a.attr_type == AttributeType::ProxyState as u8)
                .cloned(),
        );
        response
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// Encode packet to bytes
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let mut buffer = Vec::with_capacity(self.length());
        buffer.push(self.code.as_u8());
        buffer.push(self.identifier);
        // Length is patched once attributes are written
        buffer.extend_from_slice(&[0, 0]);
        buffer.extend_from_slice(&self.authenticator);

        for attr in &self.attributes {
            buffer.extend_from_slice(&attr.encode()?);
        }

        let total_length = buffer.len();
        if total_length > Self::MAX_PACKET_SIZE {
            return Err(PacketError::PacketTooLarge(total_length));
        }
        buffer[2..4].copy_from_slice(&(total_length as u16).to_be_bytes());

        Ok(buffer)
    }

    /// Decode packet from bytes
    ///
    /// Trailing bytes past the Length field are ignored (RFC 2865 Section 3).
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < Self::MIN_PACKET_SIZE {
            return Err(PacketError::InvalidLength(data.len()));
        }

        let code = Code::from_u8(data[0]).ok_or(PacketError::InvalidCode(data[0]))?;
        let identifier = data[1];
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;

        if !(Self::MIN_PACKET_SIZE..=Self::MAX_PACKET_SIZE).contains(&length) {
            return Err(PacketError::InvalidLength(length));
        }
        if data.len() < length {
            return Err(PacketError::InvalidLength(data.len()));
        }

        let mut authenticator = [0u8; 16];
        authenticator.copy_from_slice(&data[4..Self::MIN_PACKET_SIZE]);

        let mut attributes = Vec::new();
        let mut attr_data = &data[Self::MIN_PACKET_SIZE..length];
        while !attr_data.is_empty() {
            let attr = Attribute::decode(attr_data)?;
            attr_data = &attr_data[attr.encoded_length()..];
            attributes.push(attr);
        }

        Ok(Packet {
            code,
            identifier,
            authenticator,
            attributes,
        })
    }

    /// Get the length of the encoded packet
    pub fn length(&self) -> usize {
        Self::MIN_PACKET_SIZE
            + self
                .attributes
                .iter()
                .map(Attribute::encoded_length)
                .sum::<usize>()
    }

    /// Find first attribute by type
    pub fn find_attribute(&self, attr_type: AttributeType) -> Option<&Attribute> {
        let wanted = attr_type as u8;
        self.attributes.iter().find(|a| a.attr_type == wanted)
    }

    /// First attribute of this type decoded as UTF-8 text
    pub fn string_attribute(&self, attr_type: AttributeType) -> Option<String> {
        self.find_attribute(attr_type)
            .and_then(|attr| attr.as_string().ok())
    }

    /// First attribute of this type decoded as a 32-bit integer
    pub fn integer_attribute(&self, attr_type: AttributeType) -> Option<u32> {
        self.find_attribute(attr_type)
            .and_then(|attr| attr.as_integer().ok())
    }

    /// First attribute of this type decoded as an IPv4 address
    pub fn ipv4_attribute(&self, attr_type: AttributeType) -> Option<Ipv4Addr> {
        self.find_attribute(attr_type)
            .and_then(|attr| attr.as_ipv4().ok())
            .map(Ipv4Addr::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_encode_decode() {
        let mut packet = Packet::new(Code::AccountingRequest, 42, [1u8; 16]);
        packet.add_attribute(Attribute::string(AttributeType::AcctSessionId as u8, "S1").unwrap());
        packet.add_attribute(Attribute::integer(AttributeType::AcctInputOctets as u8, 500).unwrap());

        let encoded = packet.encode().unwrap();
        assert_eq!(encoded.len(), packet.length());
        assert_eq!(u16::from_be_bytes([encoded[2], encoded[3]]) as usize, encoded.len());

        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(
            decoded.string_attribute(AttributeType::AcctSessionId).as_deref(),
            Some("S1")
        );
        assert_eq!(decoded.integer_attribute(AttributeType::AcctInputOctets), Some(500));
    }

    #[test]
    fn test_packet_min_size() {
        let data = vec![0u8; 19];
        assert!(matches!(
            Packet::decode(&data),
            Err(PacketError::InvalidLength(19))
        ));
    }

    #[test]
    fn test_packet_unknown_code() {
        let mut data = vec![0u8; 20];
        data[0] = 99;
        data[3] = 20;
        assert!(matches!(Packet::decode(&data), Err(PacketError::InvalidCode(99))));
    }

    #[test]
    fn test_packet_truncated_body() {
        let mut data = vec![0u8; 20];
        data[0] = Code::AccessRequest.as_u8();
        data[3] = 40; // claims 40 bytes, only 20 present
        assert!(Packet::decode(&data).is_err());
    }

    #[test]
    fn test_reply_echoes_proxy_state() {
        let mut request = Packet::new(Code::AccessRequest, 7, [3u8; 16]);
        request.add_attribute(Attribute::string(AttributeType::UserName as u8, "alice").unwrap());
        request.add_attribute(Attribute::new(AttributeType::ProxyState as u8, vec![1, 2]).unwrap());

        let reply = request.reply(Code::AccessReject);
        assert_eq!(reply.code, Code::AccessReject);
        assert_eq!(reply.identifier, 7);
        assert_eq!(reply.attributes.len(), 1);
        assert_eq!(reply.attributes[0].attr_type, AttributeType::ProxyState as u8);
    }

    #[test]
    fn test_ipv4_attribute() {
        let mut packet = Packet::new(Code::AccessAccept, 1, [0u8; 16]);
        packet.add_attribute(
            Attribute::ipv4(AttributeType::FramedIpAddress as u8, [10, 0, 0, 5]).unwrap(),
        );
        assert_eq!(
            packet.ipv4_attribute(AttributeType::FramedIpAddress),
            Some(Ipv4Addr::new(10, 0, 0, 5))
        );
    }
}
