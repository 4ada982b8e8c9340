// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::sync::Mutex;

use slog::info;

use aal::AsicError;
use aal::AsicOps;
use aal::AsicResult;
use aal::Epoch;
use aal::GroupTableEntry;
use aal::LengthTableEntry;
use aal::McastTable;
use aal::MemberTableEntry;
use aal::PortMask;
use common::ports::PhysPort;
use common::ports::PortId;
use common::ports::MAX_PHYS_PORTS;

mod table;
use table::StubTables;

/// Table geometry for the stub pipeline.  The defaults match the sizes we
/// ship on real silicon; tests shrink them to exercise exhaustion paths.
#[derive(Clone, Copy, Debug)]
pub struct AsicConfig {
    pub group_slots: usize,
    pub length_slots: usize,
    pub member_slots: usize,
}

impl Default for AsicConfig {
    fn default() -> Self {
        AsicConfig {
            group_slots: 256,
            length_slots: 1024,
            member_slots: 4096,
        }
    }
}

/// An in-memory model of the replication pipeline.
pub struct StubHandle {
    pub log: slog::Logger,
    tables: Mutex<StubTables>,
}

impl StubHandle {
    pub fn new(log: &slog::Logger, config: &AsicConfig) -> AsicResult<Self> {
        let log = log.new(slog::o!("unit" => "asic-stub"));
        info!(log, "initializing stub replication pipeline";
            "group_slots" => config.group_slots,
            "length_slots" => config.length_slots,
            "member_slots" => config.member_slots);
        Ok(StubHandle {
            log,
            tables: Mutex::new(StubTables::new(config)),
        })
    }

    /// The epoch tag most recently published.
    pub fn current_epoch(&self) -> Epoch {
        self.tables.lock().unwrap().epoch
    }

    /// How many times the published epoch has changed.
    pub fn epoch_flips(&self) -> u32 {
        self.tables.lock().unwrap().epoch_flips
    }

    /// Schedule the readings the in-flight usage counter for `epoch` will
    /// return on successive polls.  Once the schedule is exhausted the
    /// counter reads zero, matching a drained pipeline.
    pub fn schedule_drain(&self, epoch: Epoch, readings: &[u32]) {
        let mut tables = self.tables.lock().unwrap();
        tables.drain[usize::from(epoch & 1)].extend(readings);
    }
}

impl AsicOps for StubHandle {
    fn table_size(&self, table: McastTable) -> usize {
        self.tables.lock().unwrap().size(table)
    }

    fn group_read(&self, idx: u16) -> AsicResult<GroupTableEntry> {
        let tables = self.tables.lock().unwrap();
        tables.check_idx(McastTable::Group, idx)?;
        Ok(tables.groups[usize::from(idx)])
    }

    fn group_write(&self, idx: u16, entry: GroupTableEntry) -> AsicResult<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.check_idx(McastTable::Group, idx)?;
        tables.groups[usize::from(idx)] = entry;
        Ok(())
    }

    fn length_read(&self, idx: u16) -> AsicResult<LengthTableEntry> {
        let tables = self.tables.lock().unwrap();
        tables.check_idx(McastTable::Length, idx)?;
        Ok(tables.lengths[usize::from(idx)])
    }

    fn length_write(
        &self,
        idx: u16,
        entry: LengthTableEntry,
    ) -> AsicResult<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.check_idx(McastTable::Length, idx)?;
        tables.lengths[usize::from(idx)] = entry;
        Ok(())
    }

    fn member_read(&self, idx: u16) -> AsicResult<MemberTableEntry> {
        let tables = self.tables.lock().unwrap();
        tables.check_idx(McastTable::Member, idx)?;
        Ok(tables.members[usize::from(idx)])
    }

    fn member_write(
        &self,
        idx: u16,
        entry: MemberTableEntry,
    ) -> AsicResult<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.check_idx(McastTable::Member, idx)?;
        tables.members[usize::from(idx)] = entry;
        Ok(())
    }

    fn fwd_mask_get(&self, repl_group: u16) -> AsicResult<PortMask> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .fwd_masks
            .get(&repl_group)
            .copied()
            .unwrap_or(PortMask::EMPTY))
    }

    fn fwd_mask_set(&self, repl_group: u16, mask: PortMask) -> AsicResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if mask.is_empty() {
            tables.fwd_masks.remove(&repl_group);
        } else {
            tables.fwd_masks.insert(repl_group, mask);
        }
        Ok(())
    }

    fn epoch_set(&self, epoch: Epoch) -> AsicResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if epoch > 1 {
            return Err(AsicError::InvalidArg(format!(
                "epoch tag out of range: {epoch}"
            )));
        }
        if tables.epoch != epoch {
            tables.epoch = epoch;
            tables.epoch_flips += 1;
        }
        Ok(())
    }

    fn epoch_usage(&self, epoch: Epoch) -> AsicResult<u32> {
        let mut tables = self.tables.lock().unwrap();
        if epoch > 1 {
            return Err(AsicError::InvalidArg(format!(
                "epoch tag out of range: {epoch}"
            )));
        }
        Ok(tables.drain[usize::from(epoch)].pop_front().unwrap_or(0))
    }

    fn port_to_phys(&self, port: PortId) -> AsicResult<PhysPort> {
        // The stub wires logical port N directly to physical port N.
        if port.0 < MAX_PHYS_PORTS {
            Ok(PhysPort(port.0))
        } else {
            Err(AsicError::InvalidArg(format!("no such port: {port}")))
        }
    }
}
