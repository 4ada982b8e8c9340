// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::PortMask;

/// The three linked tables making up the replication pipeline.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumIter,
)]
pub enum McastTable {
    /// One entry per replication group: port mask plus length-table base
    #[strum(to_string = "mcast_group")]
    Group,
    /// One entry per (group, member port): member count plus member-table
    /// base
    #[strum(to_string = "mcast_length")]
    Length,
    /// One entry per listener: the replication tuple itself
    #[strum(to_string = "mcast_member")]
    Member,
}

/// Raw contents of one group-table entry.  An all-zero entry is what the
/// hardware treats as "no members"; `base` is meaningless while `ports` is
/// empty.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupTableEntry {
    /// The member ports of this replication group
    pub ports: PortMask,
    /// Base of the group's contiguous length-table block
    pub base: u16,
}

/// Raw contents of one length-table entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LengthTableEntry {
    /// Number of listeners on this port, which is the size of the port's
    /// member-table block
    pub count: u16,
    /// Base of the port's contiguous member-table block
    pub base: u16,
}

/// Egress rewrite behavior for one listener.
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
pub struct RewriteOps {
    /// Replace the packet's VLAN tag with the listener's VLAN on egress
    pub rewrite_vlan: bool,
    /// Replace the packet's destination tag with the listener's tag on
    /// egress
    pub rewrite_tag: bool,
}

/// Raw contents of one member-table entry: a single egress replication
/// point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemberTableEntry {
    /// The listener's VLAN
    pub vlan: u16,
    /// The listener's destination tag
    pub dest_tag: u16,
    /// Egress rewrite behavior
    pub rewrite: RewriteOps,
}
