//! Link-layer addressing.

use core::fmt;

/// An 8-byte extended link-layer identifier.
///
/// The all-ones value is reserved as the broadcast address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address(pub [u8; 8]);

impl Address {
    /// The distinguished broadcast address (all bits set).
    pub const BROADCAST: Address = Address([0xff; 8]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn from_u64(v: u64) -> Self {
        Address(v.to_le_bytes())
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_le_bytes(self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(")?;
        for (i, b) in self.0.iter().enumerate() {
            if i != 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// A 2-byte short link-layer address, used by frames whose dest-addr-mode
/// selects the shorter form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ShortAddress(pub [u8; 2]);

impl ShortAddress {
    pub const BROADCAST: ShortAddress = ShortAddress([0xff; 2]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn broadcast_is_all_ones() {
        assert!(Address::BROADCAST.is_broadcast());
        assert_eq!(Address::BROADCAST.0, [0xff; 8]);
        assert!(ShortAddress::BROADCAST.is_broadcast());
    }

    #[test]
    fn round_trip_u64() {
        let a = Address::from_u64(0x0102030405060708);
        assert_eq!(a.as_u64(), 0x0102030405060708);
    }
}
