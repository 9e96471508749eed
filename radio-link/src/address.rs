//! Logical node identities and their mapping onto the physical radio address.
use std::fmt;

/// Width in bytes of a physical radio address.
pub const ADDRESS_WIDTH: usize = 5;

/// Address template every node address is derived from (transceiver reset value).
pub const DEFAULT_ADDRESS: PhysicalAddress = PhysicalAddress([0xE7; ADDRESS_WIDTH]);

/// Node id reserved for the master of the network.
pub const MASTER_ID: u8 = 255;
/// Node id of a slave that has not been enumerated yet, also used as the broadcast id.
pub const UNASSIGNED_ID: u8 = 254;
/// Highest node id the enumeration can hand out.
pub const MAX_ASSIGNABLE_ID: u8 = 253;

/// Well-known channel used for broadcast and enumeration.
pub const BROADCAST_CHANNEL: u8 = 0;
/// Highest usable radio channel.
pub const MAX_CHANNEL: u8 = 127;

/// Fixed-width address as programmed into the transceiver.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(pub [u8; ADDRESS_WIDTH]);

impl PhysicalAddress {
    pub fn as_bytes(&self) -> &[u8; ADDRESS_WIDTH] {
        &self.0
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

/// Derives the physical address of a node by substituting the first byte of
/// [DEFAULT_ADDRESS] with its id.
pub fn make_address(node_id: u8) -> PhysicalAddress {
    let mut address = DEFAULT_ADDRESS;
    address.0[0] = node_id;
    address
}

/// A protocol-addressable endpoint.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Node {
    pub id: u8,
    pub channel: u8,
}

impl Node {
    pub const fn new(id: u8, channel: u8) -> Self {
        Self { id, channel }
    }

    /// The master listening on `channel`.
    pub const fn master(channel: u8) -> Self {
        Self::new(MASTER_ID, channel)
    }

    /// A slave waiting for enumeration. Frames sent to it reach every unassigned slave.
    pub const fn unassigned() -> Self {
        Self::new(UNASSIGNED_ID, BROADCAST_CHANNEL)
    }

    pub fn is_master(&self) -> bool {
        self.id == MASTER_ID
    }

    pub fn is_assigned(&self) -> bool {
        self.id <= MAX_ASSIGNABLE_ID
    }

    pub fn address(&self) -> PhysicalAddress {
        make_address(self.id)
    }

    /// Same node, listening on another channel.
    pub fn on_channel(self, channel: u8) -> Self {
        Self::new(self.id, channel)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            MASTER_ID => write!(f, "master@{}", self.channel),
            UNASSIGNED_ID => write!(f, "unassigned@{}", self.channel),
            id => write!(f, "node{}@{}", id, self.channel),
        }
    }
}

/// Width in bytes of a [DeviceIdentity].
pub const IDENTITY_WIDTH: usize = 8;

/// Factory-set identity distinguishing devices before they get a node id.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceIdentity(pub [u8; IDENTITY_WIDTH]);

impl DeviceIdentity {
    pub const fn new(bytes: [u8; IDENTITY_WIDTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_WIDTH] {
        &self.0
    }

    /// Reads an identity from the first [IDENTITY_WIDTH] bytes of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; IDENTITY_WIDTH] = bytes.get(..IDENTITY_WIDTH)?.try_into().ok()?;
        Some(Self(raw))
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_address_substitutes_first_byte() {
        assert_eq!(make_address(1).0, [1, 0xE7, 0xE7, 0xE7, 0xE7]);
        assert_eq!(make_address(MASTER_ID).0[0], 0xFF);
    }

    #[test]
    fn distinct_ids_give_distinct_addresses() {
        for a in 0..=u8::MAX {
            for b in (a as u16 + 1)..=(u8::MAX as u16) {
                assert_ne!(make_address(a), make_address(b as u8));
            }
        }
    }

    #[test]
    fn reserved_ids() {
        assert!(Node::master(3).is_master());
        assert!(!Node::master(3).is_assigned());
        assert!(!Node::unassigned().is_assigned());
        assert_eq!(Node::unassigned().channel, BROADCAST_CHANNEL);
        assert!(Node::new(MAX_ASSIGNABLE_ID, 0).is_assigned());
    }

    #[test]
    fn identity_from_short_slice() {
        assert_eq!(DeviceIdentity::from_slice(&[1, 2, 3]), None);
        let id = DeviceIdentity::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
        assert_eq!(id.to_string(), "0102030405060708");
    }
}
