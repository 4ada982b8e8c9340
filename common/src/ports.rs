// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Port identifiers used by the multicast replication control plane.
//!
//! The control plane addresses listeners using logical port IDs, which are
//! stable across reconfiguration.  The replication pipeline itself works in
//! terms of physical ports, which are the bit positions in the hardware's
//! replication port masks.  Translation between the two is an ASIC-layer
//! concern.

use std::fmt;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// A logical switch port, as named by the control plane.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct PortId(pub u16);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port{}", self.0)
    }
}

/// A physical port on the replication pipeline.  The value is the port's
/// bit position in the hardware port masks, so it must be below
/// [`MAX_PHYS_PORTS`].
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct PhysPort(pub u16);

impl fmt::Display for PhysPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phys{}", self.0)
    }
}

/// Number of physical ports a replication port mask can represent.
pub const MAX_PHYS_PORTS: u16 = 64;

impl PhysPort {
    /// Is this a representable physical port?
    pub fn is_valid(&self) -> bool {
        self.0 < MAX_PHYS_PORTS
    }
}
