// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! General types used throughout the multicast replication manager.

use aal::AsicError;
use aal::Epoch;
use aal::McastTable;
use aal::RewriteOps;
use common::ports::PortId;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

pub type McastResult<T> = Result<T, McastError>;

/// Type alias for multicast group IDs.
pub type McastGroupId = u16;

/// Type alias for replication group IDs.  A replication group is the
/// hardware flood domain a group-table entry describes; its ID doubles as
/// the multicast logical port carrying the forwarding-mask attribute.
pub type ReplGroupId = u16;

#[derive(Debug, thiserror::Error)]
pub enum McastError {
    #[error("ASIC error: {0:?}")]
    Asic(#[from] AsicError),
    #[error("Table {0} is full")]
    TableFull(McastTable),
    #[error("Resource already exists: {0}")]
    Exists(String),
    #[error("Resource is busy: {0}")]
    Busy(String),
    #[error("Resource is missing: {0}")]
    Missing(String),
    #[error("Invalid argument: {0}")]
    Invalid(String),
    #[error("Replication group {0} has no group-table entry reserved")]
    NotReserved(ReplGroupId),
    #[error("Replication group {0} is not enabled")]
    NotEnabled(ReplGroupId),
    #[error(
        "epoch {epoch} usage counter still non-zero after {polls} polls"
    )]
    EpochStuck { epoch: Epoch, polls: u32 },
}

impl From<common::network::VlanError> for McastError {
    fn from(err: common::network::VlanError) -> Self {
        McastError::Invalid(err.to_string())
    }
}

/// One egress replication point, as named by the control plane: a (port,
/// VLAN, destination tag) tuple plus its egress rewrite behavior.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema,
)]
pub struct ListenerSpec {
    /// The logical port the listener sits behind
    pub port: PortId,
    /// The listener's VLAN
    pub vlan: u16,
    /// The listener's destination tag
    pub dest_tag: u16,
    /// Egress rewrite behavior
    pub rewrite: RewriteOps,
    /// Whether replication to this listener is gated on the port's
    /// spanning-tree state
    pub stp_aware: bool,
}

/// Per-group behavior flags, set when the group is enabled.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
)]
pub struct GroupFlags {
    /// A shared group's group-table entry survives a disable; a private
    /// group's entry is released
    pub shared: bool,
    /// Replicate to listeners regardless of spanning-tree state
    pub stp_bypass: bool,
}
