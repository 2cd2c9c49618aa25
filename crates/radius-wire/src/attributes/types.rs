/// RADIUS attribute types consumed or produced by this server
/// (RFC 2865, RFC 2866, RFC 2869, RFC 3579)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttributeType {
    /// User-Name (1) - RFC 2865
    UserName = 1,
    /// User-Password (2) - RFC 2865
    UserPassword = 2,
    /// NAS-IP-Address (4) - RFC 2865
    NasIpAddress = 4,
    /// Framed-IP-Address (8) - RFC 2865
    FramedIpAddress = 8,
    /// Reply-Message (18) - RFC 2865
    ReplyMessage = 18,
    /// Vendor-Specific (26) - RFC 2865
    VendorSpecific = 26,
    /// Session-Timeout (27) - RFC 2865
    SessionTimeout = 27,
    /// Calling-Station-Id (31) - RFC 2865, usually the subscriber MAC
    CallingStationId = 31,
    /// NAS-Identifier (32) - RFC 2865
    NasIdentifier = 32,
    /// Proxy-State (33) - RFC 2865
    ProxyState = 33,
    /// Acct-Status-Type (40) - RFC 2866
    AcctStatusType = 40,
    /// Acct-Delay-Time (41) - RFC 2866
    AcctDelayTime = 41,
    /// Acct-Input-Octets (42) - RFC 2866
    AcctInputOctets = 42,
    /// Acct-Output-Octets (43) - RFC 2866
    AcctOutputOctets = 43,
    /// Acct-Session-Id (44) - RFC 2866
    AcctSessionId = 44,
    /// Acct-Session-Time (46) - RFC 2866
    AcctSessionTime = 46,
    /// Acct-Terminate-Cause (49) - RFC 2866
    AcctTerminateCause = 49,
    /// Acct-Input-Gigawords (52) - RFC 2869
    AcctInputGigawords = 52,
    /// Acct-Output-Gigawords (53) - RFC 2869
    AcctOutputGigawords = 53,
    /// Message-Authenticator (80) - RFC 3579
    MessageAuthenticator = 80,
}

impl AttributeType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(AttributeType::UserName),
            2 => Some(AttributeType::UserPassword),
            4 => Some(AttributeType::NasIpAddress),
            8 => Some(AttributeType::FramedIpAddress),
            18 => Some(AttributeType::ReplyMessage),
            26 => Some(AttributeType::VendorSpecific),
            27 => Some(AttributeType::SessionTimeout),
            31 => Some(AttributeType::CallingStationId),
            32 => Some(AttributeType::NasIdentifier),
            33 => Some(AttributeType::ProxyState),
            40 => Some(AttributeType::AcctStatusType),
            41 => Some(AttributeType::AcctDelayTime),
            42 => Some(AttributeType::AcctInputOctets),
            43 => Some(AttributeType::AcctOutputOctets),
            44 => Some(AttributeType::AcctSessionId),
            46 => Some(AttributeType::AcctSessionTime),
            49 => Some(AttributeType::AcctTerminateCause),
            52 => Some(AttributeType::AcctInputGigawords),
            53 => Some(AttributeType::AcctOutputGigawords),
            80 => Some(AttributeType::MessageAuthenticator),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}
