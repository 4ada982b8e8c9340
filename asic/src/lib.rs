// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Backend implementations of the replication-pipeline ASIC abstraction.
//!
//! The backend is chosen at build time with a cargo feature, in the same
//! way the dataplane daemon chooses between real silicon and emulation.
//! This crate currently carries the `stub` backend: a complete in-memory
//! model of the three replication tables, the forwarding-mask attribute
//! store, and the epoch counters.  It is the backend used by the test
//! suites, and supports development on machines without switch hardware.

#[cfg(not(any(feature = "stub")))]
compile_error! {"must set the stub feature"}

cfg_if::cfg_if! {
    if #[cfg(feature = "stub")] {
        mod stub;
        pub use stub::AsicConfig;
        pub use stub::StubHandle as Handle;
    }
}
