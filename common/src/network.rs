// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! VLAN and spanning-tree types shared by the control plane.

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum VlanError {
    /// Not a valid VLAN ID
    #[error("Invalid VLAN tag: {}", .0)]
    InvalidVlan(u16),
}

pub fn validate_vlan(id: impl Into<u16>) -> Result<(), VlanError> {
    let id: u16 = id.into();
    #[allow(clippy::manual_range_contains)]
    if id < 2 || id > 4095 {
        Err(VlanError::InvalidVlan(id))
    } else {
        Ok(())
    }
}

/// Spanning-tree state of a (port, VLAN) pair, as computed by the
/// spanning-tree subsystem.  Replication entries are only installed for
/// listeners whose port is forwarding.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum StpState {
    Disabled,
    Blocking,
    Listening,
    Learning,
    Forwarding,
}

impl StpState {
    /// Does this state permit traffic to be replicated out the port?
    pub fn is_forwarding(&self) -> bool {
        matches!(self, StpState::Forwarding)
    }
}

#[cfg(test)]
mod tests {
    use super::validate_vlan;
    use super::StpState;

    #[test]
    fn test_vlan_bounds() {
        validate_vlan(1u16).unwrap_err();
        validate_vlan(2u16).unwrap();
        validate_vlan(4095u16).unwrap();
        validate_vlan(4096u16).unwrap_err();
    }

    #[test]
    fn test_forwarding() {
        assert!(StpState::Forwarding.is_forwarding());
        assert!(!StpState::Blocking.is_forwarding());
        assert!(!StpState::Disabled.is_forwarding());
    }
}
