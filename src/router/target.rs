use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Route target bitfield: one role bit plus zero or more modifiers.
///
/// The router later resolves the role to one or more concrete servers;
/// `RLAG_MAX` and `NAMED_SERVER` refine that resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteTarget(u32);

impl RouteTarget {
    pub const UNDEFINED: RouteTarget = RouteTarget(0);
    pub const PRIMARY: RouteTarget = RouteTarget(1);
    pub const REPLICA: RouteTarget = RouteTarget(1 << 1);
    /// Broadcast: all connected backends, one reply accepted
    pub const ALL: RouteTarget = RouteTarget(1 << 2);
    pub const NAMED_SERVER: RouteTarget = RouteTarget(1 << 3);
    /// Replica selection bounded by replication lag
    pub const RLAG_MAX: RouteTarget = RouteTarget(1 << 4);
    /// The server that produced the previous result
    pub const LAST_USED: RouteTarget = RouteTarget(1 << 5);

    pub fn contains(self, other: RouteTarget) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_undefined(self) -> bool {
        self.0 == 0
    }

    /// The role portion of the target, without modifiers
    pub fn role(self) -> RouteTarget {
        RouteTarget(
            self.0
                & (Self::PRIMARY.0 | Self::REPLICA.0 | Self::ALL.0 | Self::LAST_USED.0
                    | Self::NAMED_SERVER.0),
        )
    }
}

impl BitOr for RouteTarget {
    type Output = RouteTarget;

    fn bitor(self, rhs: RouteTarget) -> RouteTarget {
        RouteTarget(self.0 | rhs.0)
    }
}

impl BitOrAssign for RouteTarget {
    fn bitor_assign(&mut self, rhs: RouteTarget) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(RouteTarget, &str)] = &[
            (RouteTarget::PRIMARY, "PRIMARY"),
            (RouteTarget::REPLICA, "REPLICA"),
            (RouteTarget::ALL, "ALL"),
            (RouteTarget::NAMED_SERVER, "NAMED_SERVER"),
            (RouteTarget::RLAG_MAX, "RLAG_MAX"),
            (RouteTarget::LAST_USED, "LAST_USED"),
        ];

        if self.is_undefined() {
            return f.write_str("UNDEFINED");
        }

        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(*bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}
