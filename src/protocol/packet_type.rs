/// MQTT control packet types, as carried in the upper nibble of the fixed
/// header's first byte.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketType {
    /// Client request to connect to Server
    /// Direction: Client to Server
    Connect = 1,

    /// Connect acknowledgment
    /// Direction: Server to Client
    ConnAck = 2,

    /// Publish message
    /// Direction: Client to Server or Server to Client
    Publish = 3,

    /// Publish acknowledgment
    /// Direction: Client to Server or Server to Client
    PubAck = 4,

    /// Publish received (assured delivery part 1)
    /// Direction: Client to Server or Server to Client
    PubRec = 5,

    /// Publish release (assured delivery part 2)
    /// Direction: Client to Server or Server to Client
    PubRel = 6,

    /// Publish complete (assured delivery part 3)
    /// Direction: Client to Server or Server to Client
    PubComp = 7,

    /// Client subscribe request
    /// Direction: Client to Server
    Subscribe = 8,

    /// Subscribe acknowledgment
    /// Direction: Server to Client
    SubAck = 9,

    /// Client unsubscribe request
    /// Direction: Client to Server
    Unsubscribe = 10,

    /// Unsubscribe acknowledgment
    /// Direction: Server to Client
    UnsubAck = 11,

    /// Ping request
    /// Direction: Client to Server
    PingReq = 12,

    /// Ping response
    /// Direction: Server to Client
    PingResp = 13,

    /// Client disconnect request
    /// Direction: Client to Server
    Disconnect = 14,
}

impl PacketType {
    /// Decode the packet type from a fixed-header first byte.
    ///
    /// The type lives in the upper nibble; 0 and 15 are reserved and
    /// rejected.
    pub const fn from_header_byte(byte: u8) -> Option<Self> {
        match byte >> 4 {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            5 => Some(PacketType::PubRec),
            6 => Some(PacketType::PubRel),
            7 => Some(PacketType::PubComp),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            _ => None,
        }
    }

    /// True for the packet types a broker may send to a client.
    pub const fn is_server_to_client(self) -> bool {
        matches!(
            self,
            PacketType::ConnAck
                | PacketType::Publish
                | PacketType::PubAck
                | PacketType::PubRec
                | PacketType::PubRel
                | PacketType::PubComp
                | PacketType::SubAck
                | PacketType::UnsubAck
                | PacketType::PingResp
        )
    }
}
