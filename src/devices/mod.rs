//! Memory-mapped devices.
//!
//! Contains the bus, CLINT, PLIC, WorldGuard devices, and RAM/ROM

pub mod bus;
pub mod clint;
pub mod plic;
pub mod ram;
pub mod wg;

pub use bus::Bus;
pub use clint::{Clint, CLINT_SIZE};
pub use plic::{Plic, PlicAddr, PlicMode, PlicParams};
pub use ram::{Ram, Rom};
pub use wg::{Guard, Guarded, MarkerState, WgFilter, WgMarker, WgPmp};

/// Flavour of access being policed by the world guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Load,
    Store,
    Fetch,
}

/// Common contract every peripheral satisfies.
///
/// `false` means "refuse": the bus surfaces it to the caller, which turns
/// it into a load/store access-fault exception on the issuing hart.
/// `load` takes `&mut self` because several devices mutate on read (the
/// CLINT resamples time, a PLIC claim register pops the winning IRQ).
pub trait Device {
    fn load(&mut self, offset: u64, bytes: &mut [u8]) -> bool;
    fn store(&mut self, offset: u64, bytes: &[u8]) -> bool;

    /// Declared size of the register window, in bytes.
    fn size(&self) -> u64;
}
