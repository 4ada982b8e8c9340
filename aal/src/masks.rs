// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;

use common::ports::PhysPort;
use common::ports::MAX_PHYS_PORTS;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// A set of physical replication ports, one bit per port.
///
/// The hardware walks a group's length-table block in port order: the
/// length entry for a port sits at an offset equal to the number of
/// lower-numbered ports in the mask.  [`PortMask::rank`] computes that
/// offset.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct PortMask(u64);

impl PortMask {
    pub const EMPTY: PortMask = PortMask(0);

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, port: PhysPort) -> bool {
        port.is_valid() && self.0 & (1u64 << port.0) != 0
    }

    pub fn set(&mut self, port: PhysPort) {
        debug_assert!(port.is_valid());
        self.0 |= 1u64 << port.0;
    }

    pub fn clear(&mut self, port: PhysPort) {
        debug_assert!(port.is_valid());
        self.0 &= !(1u64 << port.0);
    }

    /// Number of ports in the mask.  This is also the size of the group's
    /// length-table block.
    pub fn count(&self) -> u16 {
        self.0.count_ones() as u16
    }

    /// Number of mask members strictly below `port`, which is the offset
    /// of `port`'s entry within the group's length-table block.  The
    /// result is the same whether or not `port` itself is a member.
    pub fn rank(&self, port: PhysPort) -> u16 {
        debug_assert!(port.is_valid());
        let below = (1u64 << port.0) - 1;
        (self.0 & below).count_ones() as u16
    }

    /// The member ports, in increasing order.
    pub fn ports(&self) -> impl Iterator<Item = PhysPort> + '_ {
        (0..MAX_PHYS_PORTS)
            .map(PhysPort)
            .filter(move |p| self.contains(*p))
    }
}

impl fmt::Display for PortMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::PhysPort;
    use super::PortMask;

    #[test]
    fn test_rank() {
        let mut mask = PortMask::EMPTY;
        mask.set(PhysPort(3));
        mask.set(PhysPort(5));
        mask.set(PhysPort(11));

        assert_eq!(mask.count(), 3);
        assert_eq!(mask.rank(PhysPort(3)), 0);
        assert_eq!(mask.rank(PhysPort(5)), 1);
        assert_eq!(mask.rank(PhysPort(11)), 2);
        // rank of a non-member is where it would be inserted
        assert_eq!(mask.rank(PhysPort(4)), 1);
        assert_eq!(mask.rank(PhysPort(63)), 3);
    }

    #[test]
    fn test_membership() {
        let mut mask = PortMask::EMPTY;
        assert!(mask.is_empty());
        mask.set(PhysPort(0));
        mask.set(PhysPort(63));
        assert!(mask.contains(PhysPort(0)));
        assert!(mask.contains(PhysPort(63)));
        assert!(!mask.contains(PhysPort(1)));
        mask.clear(PhysPort(0));
        assert!(!mask.contains(PhysPort(0)));
        let ports: Vec<_> = mask.ports().collect();
        assert_eq!(ports, vec![PhysPort(63)]);
    }
}
