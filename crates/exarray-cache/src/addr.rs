//! Addresses of node images inside a block store.
//!
//! Images refer to each other by absolute byte offset. On disk an undefined
//! child pointer is stored as [`UNDEFINED_ADDR`]; in memory it is `None`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw value written for an address slot that does not point anywhere yet.
pub const UNDEFINED_ADDR: u64 = u64::MAX;

/// Byte offset of an image in a block store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Addr(u64);

impl Addr {
    /// Create an address from a byte offset
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Raw byte offset
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Address `delta` bytes past this one
    pub const fn offset(self, delta: u64) -> Self {
        Self(self.0 + delta)
    }

    /// Decode an on-disk address slot.
    pub const fn from_raw(raw: u64) -> Option<Self> {
        if raw == UNDEFINED_ADDR {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Encode an optional address for an on-disk slot.
    pub const fn to_raw(addr: Option<Self>) -> u64 {
        match addr {
            Some(addr) => addr.0,
            None => UNDEFINED_ADDR,
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_round_trip() {
        assert_eq!(Addr::from_raw(UNDEFINED_ADDR), None);
        assert_eq!(Addr::from_raw(0), Some(Addr::new(0)));
        assert_eq!(Addr::to_raw(None), UNDEFINED_ADDR);
        assert_eq!(Addr::to_raw(Some(Addr::new(4096))), 4096);
    }

    #[test]
    fn test_display_and_offset() {
        let addr = Addr::new(0x100);
        assert_eq!(addr.to_string(), "0x100");
        assert_eq!(addr.offset(0x20).get(), 0x120);
    }
}
