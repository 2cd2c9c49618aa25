use crate::packet::PacketError;

/// RADIUS Attribute structure as defined in RFC 2865 Section 5
///
/// ```text
///  0                   1                   2
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Type      |    Length     |  Value ...
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: u8,
    /// Raw value (0-253 bytes)
    pub value: Vec<u8>,
}

impl Attribute {
    /// Type and length octets
    pub const HEADER_LENGTH: usize = 2;
    pub const MAX_LENGTH: usize = 255;
    pub const MAX_VALUE_LENGTH: usize = Self::MAX_LENGTH - Self::HEADER_LENGTH;

    pub fn new(attr_type: u8, value: Vec<u8>) -> Result<Self, PacketError> {
        if value.len() > Self::MAX_VALUE_LENGTH {
            return Err(PacketError::AttributeError(format!(
                "Attribute {} value too long: {} bytes (max {})",
                attr_type,
                value.len(),
                Self::MAX_VALUE_LENGTH
            )));
        }
        Ok(Attribute { attr_type, value })
    }

    /// Text attribute (User-Name, Acct-Session-Id, ...)
    pub fn string(attr_type: u8, value: impl Into<String>) -> Result<Self, PacketError> {
        Self::new(attr_type, value.into().into_bytes())
    }

    /// 32-bit big-endian integer attribute
    pub fn integer(attr_type: u8, value: u32) -> Result<Self, PacketError> {
        Self::new(attr_type, value.to_be_bytes().to_vec())
    }

    /// IPv4 address attribute
    pub fn ipv4(attr_type: u8, value: [u8; 4]) -> Result<Self, PacketError> {
        Self::new(attr_type, value.to_vec())
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let length = self.encoded_length();
        if length > Self::MAX_LENGTH {
            return Err(PacketError::AttributeError(format!(
                "Encoded attribute too long: {} bytes",
                length
            )));
        }

        let mut buffer = Vec::with_capacity(length);
        buffer.push(self.attr_type);
        buffer.push(length as u8);
        buffer.extend_from_slice(&self.value);
        Ok(buffer)
    }

    /// Decode the first attribute in `data`; trailing bytes are left for the caller
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < Self::HEADER_LENGTH {
            return Err(PacketError::AttributeError(format!(
                "Attribute data too short: {} bytes",
                data.len()
            )));
        }

        let attr_type = data[0];
        let length = data[1] as usize;

        if length < Self::HEADER_LENGTH {
            return Err(PacketError::AttributeError(format!(
                "Invalid attribute length: {}",
                length
            )));
        }
        if data.len() < length {
            return Err(PacketError::AttributeError(format!(
                "Insufficient data for attribute {}: expected {}, got {}",
                attr_type,
                length,
                data.len()
            )));
        }

        Ok(Attribute {
            attr_type,
            value: data[Self::HEADER_LENGTH..length].to_vec(),
        })
    }

    pub fn encoded_length(&self) -> usize {
        Self::HEADER_LENGTH + self.value.len()
    }

    pub fn as_string(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.value.clone())
    }

    pub fn as_integer(&self) -> Result<u32, PacketError> {
        let bytes: [u8; 4] = self.value.as_slice().try_into().map_err(|_| {
            PacketError::AttributeError(format!(
                "Expected 4 bytes for integer, got {}",
                self.value.len()
            ))
        })?;
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn as_ipv4(&self) -> Result<[u8; 4], PacketError> {
        self.value.as_slice().try_into().map_err(|_| {
            PacketError::AttributeError(format!(
                "Expected 4 bytes for IPv4, got {}",
                self.value.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_attribute() {
        let attr = Attribute::string(1, "testuser").unwrap();
        assert_eq!(attr.attr_type, 1);
        assert_eq!(attr.as_string().unwrap(), "testuser");
        assert_eq!(attr.encode().unwrap()[..2], [1, 10]);
    }

    #[test]
    fn test_integer_attribute() {
        let attr = Attribute::integer(27, 3600).unwrap();
        assert_eq!(attr.as_integer().unwrap(), 3600);
        assert_eq!(attr.encode().unwrap(), vec![27, 6, 0, 0, 0x0e, 0x10]);
    }

    #[test]
    fn test_integer_wrong_width() {
        let attr = Attribute::new(42, vec![1, 2]).unwrap();
        assert!(attr.as_integer().is_err());
        assert!(attr.as_ipv4().is_err());
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let data = [8u8, 6, 10, 0, 0, 1, 0xff, 0xff];
        let attr = Attribute::decode(&data).unwrap();
        assert_eq!(attr.as_ipv4().unwrap(), [10, 0, 0, 1]);
        assert_eq!(attr.encoded_length(), 6);
    }

    #[test]
    fn test_decode_rejects_zero_length() {
        assert!(Attribute::decode(&[1, 0, 0]).is_err());
        assert!(Attribute::decode(&[1, 1]).is_err());
    }

    #[test]
    fn test_max_value_length() {
        assert!(Attribute::new(1, vec![0u8; 253]).is_ok());
        assert!(Attribute::new(1, vec![0u8; 254]).is_err());
    }
}
