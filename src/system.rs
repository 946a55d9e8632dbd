//! System orchestrator
//!
//! Wires harts, bus, and devices together and exposes the MMIO entry
//! points the processor model drives.

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use crate::clock::{Clock, MonotonicClock};
use crate::devices::{
    Bus, Clint, Device, Guard, Guarded, MarkerState, Plic, PlicParams, Ram, WgFilter, WgMarker,
    WgPmp,
};
use crate::hart::Harts;
use crate::snapshot::{HartSnapshot, MarkerSnapshot, SystemSnapshot, SNAPSHOT_VERSION};
use crate::ConfigError;

// Device base addresses
pub const CLINT_BASE: u64 = 0x0200_0000;
pub const PLIC_BASE: u64 = 0x0400_0000;
pub const WG_MARKER_BASE: u64 = 0x0600_0000;
pub const WG_MARKER_STRIDE: u64 = 0x1000;
pub const DRAM_BASE: u64 = 0x8000_0000;

/// World-guard wiring for a machine.
pub struct WorldGuardConfig {
    pub wid_trusted: u32,
    /// Boot world ID per hart; one entry per hart.
    pub boot_wids: Vec<u32>,
}

pub struct SystemConfig {
    pub nharts: usize,
    pub ram_size: u64,
    pub freq_hz: u64,
    pub real_time: bool,
    pub plic: PlicParams,
    pub world_guard: Option<WorldGuardConfig>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            nharts: 1,
            ram_size: 64 * 1024 * 1024,
            freq_hz: 10_000_000,
            real_time: false,
            plic: PlicParams::default(),
            world_guard: None,
        }
    }
}

impl SystemConfig {
    /// Configuration for `nharts` harts, each with M and S PLIC contexts.
    pub fn with_harts(nharts: usize) -> Self {
        SystemConfig {
            nharts,
            plic: PlicParams {
                hart_config: vec!["MS"; nharts].join(","),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// System state
pub struct System {
    pub harts: Harts,
    pub bus: Bus,
    clint: Rc<RefCell<Clint>>,
    plic: Rc<RefCell<Plic>>,
    marker_states: Vec<Rc<RefCell<MarkerState>>>,
    wid_trusted: Option<u32>,
}

impl System {
    pub fn new(config: SystemConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Rc::new(MonotonicClock::new()))
    }

    /// Build a system against an explicit wall-clock source.
    pub fn with_clock(config: SystemConfig, clock: Rc<dyn Clock>) -> Result<Self, ConfigError> {
        if config.nharts == 0 {
            return Err(ConfigError::InvalidConfig("at least one hart required".into()));
        }
        if config.ram_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "zero bytes of target memory requested".into(),
            ));
        }

        let harts = Harts::new(config.nharts);
        let mut bus = Bus::new();

        let clint = Rc::new(RefCell::new(Clint::new(
            harts.clone(),
            config.freq_hz,
            config.real_time,
            clock,
        )));
        bus.add_device(CLINT_BASE, clint.clone());

        let plic = Rc::new(RefCell::new(Plic::new(harts.clone(), config.plic)?));
        bus.add_device(PLIC_BASE, plic.clone());

        bus.add_device(
            DRAM_BASE,
            Rc::new(RefCell::new(Ram::new(config.ram_size as usize))),
        );

        let mut marker_states = Vec::new();
        let mut wid_trusted = None;
        if let Some(wg) = &config.world_guard {
            if wg.boot_wids.len() != config.nharts {
                return Err(ConfigError::InvalidConfig(format!(
                    "{} boot wids for {} harts",
                    wg.boot_wids.len(),
                    config.nharts
                )));
            }
            for (hartid, &wid) in wg.boot_wids.iter().enumerate() {
                let marker = WgMarker::new(harts.clone(), wid, wg.wid_trusted)?;
                harts.bind_marker(hartid, marker.state());
                marker_states.push(marker.state());
                bus.add_device(
                    WG_MARKER_BASE + hartid as u64 * WG_MARKER_STRIDE,
                    Rc::new(RefCell::new(marker)),
                );
            }
            wid_trusted = Some(wg.wid_trusted);
        }

        debug!(
            "system: {} harts, clint at {:#x}, plic at {:#x}, {} MiB ram at {:#x}",
            config.nharts,
            CLINT_BASE,
            PLIC_BASE,
            config.ram_size >> 20,
            DRAM_BASE
        );

        Ok(System {
            harts,
            bus,
            clint,
            plic,
            marker_states,
            wid_trusted,
        })
    }

    /// Map an additional device.
    pub fn add_device(&mut self, base: u64, dev: Rc<RefCell<dyn Device>>) {
        self.bus.add_device(base, dev);
    }

    /// Map a device behind a world guard.
    pub fn add_guarded_device(&mut self, base: u64, dev: Rc<RefCell<dyn Device>>, guard: Guard) {
        let guarded = Guarded::new(self.harts.clone(), guard, base, dev);
        self.bus.add_device(base, Rc::new(RefCell::new(guarded)));
    }

    /// Map a filter: registers at `reg_base`, gating `[addr, addr+size)`.
    pub fn add_filter(
        &mut self,
        reg_base: u64,
        wid: u32,
        addr: u64,
        size: u64,
    ) -> Result<Rc<RefCell<WgFilter>>, ConfigError> {
        let wid_trusted = self.require_world_guard()?;
        let filter = Rc::new(RefCell::new(WgFilter::new(
            self.harts.clone(),
            wid,
            wid_trusted,
            addr,
            size,
        )?));
        self.bus.add_device(reg_base, filter.clone());
        Ok(filter)
    }

    /// Map a world PMP: registers at `reg_base`, gating `[addr, addr+size)`.
    pub fn add_pmp(
        &mut self,
        reg_base: u64,
        addr: u64,
        size: u64,
    ) -> Result<Rc<RefCell<WgPmp>>, ConfigError> {
        let wid_trusted = self.require_world_guard()?;
        let pmp = Rc::new(RefCell::new(WgPmp::new(
            self.harts.clone(),
            wid_trusted,
            addr,
            size,
        )?));
        self.bus.add_device(reg_base, pmp.clone());
        Ok(pmp)
    }

    fn require_world_guard(&self) -> Result<u32, ConfigError> {
        self.wid_trusted
            .ok_or_else(|| ConfigError::InvalidConfig("world guard not configured".into()))
    }

    pub fn load(&self, addr: u64, bytes: &mut [u8]) -> bool {
        self.bus.load(addr, bytes)
    }

    pub fn store(&self, addr: u64, bytes: &[u8]) -> bool {
        self.bus.store(addr, bytes)
    }

    /// Advance virtual time; called from the instruction step when the
    /// CLINT is not in real-time mode.
    pub fn tick(&self, inc: u64) {
        self.clint.borrow_mut().tick(inc);
    }

    /// External interrupt edge from a device model.
    pub fn set_pending(&self, irq: u32, level: bool) {
        self.plic.borrow_mut().set_pending(irq, level);
    }

    pub fn set_current_hart(&self, hartid: usize) {
        self.harts.set_current(hartid);
    }

    pub fn mip(&self, hartid: usize) -> u32 {
        self.harts.mip(hartid)
    }

    pub fn snapshot(&self) -> SystemSnapshot {
        let harts = (0..self.harts.len())
            .map(|i| HartSnapshot {
                mip: self.harts.mip(i),
                marker: self.marker_states.get(i).map(|m| {
                    let m = m.borrow();
                    MarkerSnapshot {
                        wid: m.wid,
                        lock: m.lock,
                    }
                }),
            })
            .collect();
        SystemSnapshot {
            version: SNAPSHOT_VERSION,
            harts,
            clint: self.clint.borrow().snapshot(),
            plic: self.plic.borrow().snapshot(),
        }
    }

    pub fn restore(&mut self, snap: &SystemSnapshot) -> Result<(), String> {
        if snap.version != SNAPSHOT_VERSION {
            return Err(format!("Snapshot version mismatch: {}", snap.version));
        }
        if snap.harts.len() != self.harts.len() {
            return Err(format!(
                "Snapshot has {} harts, system has {}",
                snap.harts.len(),
                self.harts.len()
            ));
        }
        for (i, hart) in snap.harts.iter().enumerate() {
            self.harts.restore_mip(i, hart.mip);
            if let (Some(state), Some(marker)) = (self.marker_states.get(i), &hart.marker) {
                let mut state = state.borrow_mut();
                state.wid = marker.wid;
                state.lock = marker.lock;
            }
        }
        self.clint.borrow_mut().restore(&snap.clint)?;
        self.plic.borrow_mut().restore(&snap.plic)?;
        Ok(())
    }

    /// Serialize device and hart state to a compressed blob.
    pub fn save_state(&self) -> Result<Vec<u8>, String> {
        self.snapshot().to_bytes()
    }

    /// Restore device and hart state from a compressed blob.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), String> {
        let snap = SystemSnapshot::from_bytes(data)?;
        self.restore(&snap)
    }

    /// Reset the interrupt fabric.
    pub fn reset(&mut self) {
        for i in 0..self.harts.len() {
            self.harts.restore_mip(i, 0);
        }
        self.clint.borrow_mut().reset();
        self.plic.borrow_mut().reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_machine() {
        let config = SystemConfig {
            nharts: 0,
            ..Default::default()
        };
        assert!(matches!(
            System::new(config),
            Err(ConfigError::InvalidConfig(_))
        ));

        let config = SystemConfig {
            ram_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            System::new(config),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_boot_wid_count_mismatch() {
        let config = SystemConfig {
            world_guard: Some(WorldGuardConfig {
                wid_trusted: 3,
                boot_wids: vec![1, 2],
            }),
            ..SystemConfig::with_harts(1)
        };
        assert!(matches!(
            System::new(config),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_ram_is_mapped_at_dram_base() {
        let sys = System::new(SystemConfig::with_harts(1)).unwrap();
        assert!(sys.store(DRAM_BASE + 0x100, &0xDEADBEEFu32.to_le_bytes()));
        let mut b = [0u8; 4];
        assert!(sys.load(DRAM_BASE + 0x100, &mut b));
        assert_eq!(u32::from_le_bytes(b), 0xDEADBEEF);
    }

    #[test]
    fn test_filters_require_world_guard_config() {
        let mut sys = System::new(SystemConfig::with_harts(1)).unwrap();
        assert!(sys.add_filter(0x0700_0000, 1, 0x1000, 0x1000).is_err());
        assert!(sys.add_pmp(0x0700_0000, 0x1000, 0x1000).is_err());
    }
}
