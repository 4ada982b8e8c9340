// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The ASIC abstraction layer for the multicast replication pipeline.
//!
//! Replicated traffic is fanned out by walking three linked hardware
//! tables.  The group table holds one entry per replication group: a mask
//! of member ports and a pointer to a contiguous run of length-table
//! entries, one per member port.  Each length-table entry in turn points to
//! a contiguous run of member-table entries, one per listener on that
//! port.  This crate defines the raw entry formats and the [`AsicOps`]
//! trait through which the control plane reads and writes them; per-ASIC
//! implementations live in the `asic` crate.

use common::ports::PhysPort;
use common::ports::PortId;
use thiserror::Error;

mod masks;
pub use masks::*;

mod tables;
pub use tables::*;

/// A specialized Result type for ASIC operations
pub type AsicResult<T> = Result<T, AsicError>;

/// Error type conveying additional information about ASIC errors
#[derive(Error, Debug)]
pub enum AsicError {
    /// An argument passed to the ASIC layer is invalid or inappropriate.
    /// This indicates misbehavior from the caller.
    #[error("Invalid argument: {}", .0)]
    InvalidArg(String),
    /// An ASIC function was called before the ASIC layer was properly
    /// initialized.  Indicates misbehavior from the caller.
    #[error("ASIC layer uninitialized: {}", .0)]
    Uninitialized(String),
    /// The ASIC layer detected some internal inconsistency
    #[error("Internal error: {}", .0)]
    Internal(String),
    /// This operation is unsupported by the ASIC model being used
    #[error("Operation unsupported by the ASIC")]
    OperationUnsupported,
    /// A general indication that a caller is trying to modify something
    /// that is not present.
    #[error("Missing: {}", .0)]
    Missing(String),
}

/// The 1-bit generation tag used to fence in-flight pipeline reads across
/// a table relocation.
pub type Epoch = u8;

/// The `AsicOps` trait contains all of the replication-pipeline operations
/// that the control plane requires.  Every read and write is a single
/// table entry; contiguity and cross-table consistency are the caller's
/// responsibility.
pub trait AsicOps {
    /// The number of entries in the given table.
    fn table_size(&self, table: McastTable) -> usize;

    /// Read one group-table entry.
    fn group_read(&self, idx: u16) -> AsicResult<GroupTableEntry>;

    /// Write one group-table entry.
    fn group_write(&self, idx: u16, entry: GroupTableEntry) -> AsicResult<()>;

    /// Read one length-table entry.
    fn length_read(&self, idx: u16) -> AsicResult<LengthTableEntry>;

    /// Write one length-table entry.
    fn length_write(
        &self,
        idx: u16,
        entry: LengthTableEntry,
    ) -> AsicResult<()>;

    /// Read one member-table entry.
    fn member_read(&self, idx: u16) -> AsicResult<MemberTableEntry>;

    /// Write one member-table entry.
    fn member_write(
        &self,
        idx: u16,
        entry: MemberTableEntry,
    ) -> AsicResult<()>;

    /// Fetch the forwarding mask attribute of a replication group's
    /// logical port.  This is the set of ports with at least one active
    /// listener, and is what the egress pipeline consults when fanning
    /// out.
    fn fwd_mask_get(&self, repl_group: u16) -> AsicResult<PortMask>;

    /// Update the forwarding mask attribute of a replication group's
    /// logical port.
    fn fwd_mask_set(&self, repl_group: u16, mask: PortMask) -> AsicResult<()>;

    /// Publish a new epoch tag.  Pipeline reads started after this call
    /// are counted against the new epoch.
    fn epoch_set(&self, epoch: Epoch) -> AsicResult<()>;

    /// Read the in-flight usage counter for the given epoch tag.  A zero
    /// reading means no pipeline walk started under that epoch is still in
    /// progress.
    fn epoch_usage(&self, epoch: Epoch) -> AsicResult<u32>;

    /// Translate a logical port ID into the physical replication port the
    /// hardware uses in its port masks.
    fn port_to_phys(&self, port: PortId) -> AsicResult<PhysPort>;
}
