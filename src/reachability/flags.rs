//! Reachability flag bitmask

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Network reachability flags for one host
///
/// Bit layout follows the SystemConfiguration reachability flags so values
/// from a platform API can be passed through unchanged.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReachabilityFlags(u32);

impl ReachabilityFlags {
    /// Reachable, but through a transient connection (e.g. PPP)
    pub const TRANSIENT_CONNECTION: Self = Self(1 << 0);
    /// Reachable with the current configuration
    pub const REACHABLE: Self = Self(1 << 1);
    /// Reachable, but a connection must be established first
    pub const CONNECTION_REQUIRED: Self = Self(1 << 2);
    /// Connection comes up automatically on traffic
    pub const CONNECTION_ON_TRAFFIC: Self = Self(1 << 3);
    /// User intervention (e.g. a password) is required
    pub const INTERVENTION_REQUIRED: Self = Self(1 << 4);
    /// Connection comes up on demand
    pub const CONNECTION_ON_DEMAND: Self = Self(1 << 5);
    /// Host resolves to an address on this machine
    pub const IS_LOCAL_ADDRESS: Self = Self(1 << 16);
    /// Traffic does not go through a gateway
    pub const IS_DIRECT: Self = Self(1 << 17);
    /// Reachable over a cellular link
    pub const IS_WWAN: Self = Self(1 << 18);

    /// No flags set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Flags from raw bits
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if every bit of `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if no bit is set
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `(self & mask) == value`
    pub const fn matches(self, mask: Self, value: Self) -> bool {
        self.0 & mask.0 == value.0
    }
}

impl BitOr for ReachabilityFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ReachabilityFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ReachabilityFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

const NAMES: [(ReachabilityFlags, &str); 9] = [
    (ReachabilityFlags::TRANSIENT_CONNECTION, "transient"),
    (ReachabilityFlags::REACHABLE, "reachable"),
    (ReachabilityFlags::CONNECTION_REQUIRED, "connection-required"),
    (ReachabilityFlags::CONNECTION_ON_TRAFFIC, "on-traffic"),
    (ReachabilityFlags::INTERVENTION_REQUIRED, "intervention-required"),
    (ReachabilityFlags::CONNECTION_ON_DEMAND, "on-demand"),
    (ReachabilityFlags::IS_LOCAL_ADDRESS, "local"),
    (ReachabilityFlags::IS_DIRECT, "direct"),
    (ReachabilityFlags::IS_WWAN, "wwan"),
];

impl fmt::Debug for ReachabilityFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReachabilityFlags({self})")
    }
}

impl fmt::Display for ReachabilityFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        let mut known = Self::empty();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
                known |= flag;
            }
        }
        let unknown = self.0 & !known.0;
        if unknown != 0 {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{unknown:#x}")?;
        }
        Ok(())
    }
}
