//! RISC-V MMIO device subsystem
//!
//! Routes physical loads and stores to memory-mapped peripherals: a CLINT
//! (per-hart timer and software interrupts), a SiFive-style PLIC (external
//! interrupt arbitration), and the WorldGuard access-control devices
//! (per-hart marker, range filter, world PMP). Devices raise and clear
//! interrupt-pending bits on the simulated harts as a side effect of MMIO
//! traffic; the processor model observes them on its next interrupt check.

use thiserror::Error;

mod clock;
mod hart;
mod snapshot;
mod system;
pub mod devices;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use hart::{Harts, MIP_MEIP, MIP_MSIP, MIP_MTIP, MIP_SEIP};
pub use snapshot::{ClintSnapshot, HartSnapshot, MarkerSnapshot, PlicSnapshot, SystemSnapshot};
pub use system::{
    System, SystemConfig, WorldGuardConfig, CLINT_BASE, DRAM_BASE, PLIC_BASE, WG_MARKER_BASE,
    WG_MARKER_STRIDE,
};

/// Errors raised while building devices from a machine description.
///
/// These indicate a malformed configuration; there is no run-time recovery.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("plic: invalid mode '{0}' in hart config")]
    InvalidPlicMode(char),

    #[error("plic: duplicate mode '{mode}' in hart config {config:?}")]
    DuplicatePlicMode { mode: char, config: String },

    #[error("wrong wid ({wid}), exceeds wid_trusted ({wid_trusted})")]
    WorldIdOutOfRange { wid: u32, wid_trusted: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
