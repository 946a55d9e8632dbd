//! CLINT - Core Local Interruptor
//!
//! Memory-mapped control and status registers for software and timer
//! interrupts. Generates per-hart MSIP and MTIP.

use std::rc::Rc;

use super::Device;
use crate::clock::Clock;
use crate::hart::{Harts, MIP_MSIP, MIP_MTIP};
use crate::snapshot::ClintSnapshot;

// CLINT memory map (relative to base 0x02000000)
const MSIP_BASE: u64 = 0x0000; // msip[i] at + 4*i
const MTIMECMP_BASE: u64 = 0x4000; // mtimecmp[i] at + 8*i
const MTIME_BASE: u64 = 0xBFF8;

pub const CLINT_SIZE: u64 = 0xC000;

/// CLINT device
///
/// `mtime` has two time models: in real-time mode every access resamples
/// the wall-clock and derives `mtime` from the elapsed microseconds;
/// otherwise the simulator advances it explicitly through [`Clint::tick`].
pub struct Clint {
    harts: Harts,
    freq_hz: u64,
    real_time: bool,
    clock: Rc<dyn Clock>,
    /// Microsecond anchor captured at construction.
    anchor_us: u64,
    mtime: u64,
    mtimecmp: Vec<u64>,
}

impl Clint {
    pub fn new(harts: Harts, freq_hz: u64, real_time: bool, clock: Rc<dyn Clock>) -> Self {
        let anchor_us = clock.now_us();
        let nharts = harts.len();
        Clint {
            harts,
            freq_hz,
            real_time,
            clock,
            anchor_us,
            mtime: 0,
            mtimecmp: vec![u64::MAX; nharts],
        }
    }

    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    /// Advance the timer and recompute every hart's MTIP.
    ///
    /// In real-time mode the increment is ignored and `mtime` is derived
    /// from the wall-clock; loads and stores call this with `inc = 0`.
    pub fn tick(&mut self, inc: u64) {
        if self.real_time {
            let diff_us = self.clock.now_us() - self.anchor_us;
            self.mtime = diff_us * self.freq_hz / 1_000_000;
        } else {
            self.mtime = self.mtime.wrapping_add(inc);
        }
        self.update_mtip();
    }

    fn update_mtip(&mut self) {
        for i in 0..self.harts.len() {
            self.harts.set_mip(i, MIP_MTIP, self.mtime >= self.mtimecmp[i]);
        }
    }

    pub fn snapshot(&self) -> ClintSnapshot {
        ClintSnapshot {
            mtime: self.mtime,
            mtimecmp: self.mtimecmp.clone(),
        }
    }

    pub fn restore(&mut self, snap: &ClintSnapshot) -> Result<(), String> {
        if snap.mtimecmp.len() != self.mtimecmp.len() {
            return Err(format!(
                "Snapshot has {} mtimecmp entries, clint has {}",
                snap.mtimecmp.len(),
                self.mtimecmp.len()
            ));
        }
        self.mtime = snap.mtime;
        self.mtimecmp.copy_from_slice(&snap.mtimecmp);
        self.update_mtip();
        Ok(())
    }

    pub fn reset(&mut self) {
        self.mtime = 0;
        self.anchor_us = self.clock.now_us();
        self.mtimecmp.fill(u64::MAX);
        self.update_mtip();
    }
}

impl Device for Clint {
    fn load(&mut self, offset: u64, bytes: &mut [u8]) -> bool {
        self.tick(0);
        let len = bytes.len() as u64;
        let nharts = self.harts.len() as u64;

        if offset >= MSIP_BASE && offset + len <= MSIP_BASE + nharts * 4 {
            // Each hart's MSIP bit materialized as a 32-bit word.
            for (i, b) in bytes.iter_mut().enumerate() {
                let pos = offset - MSIP_BASE + i as u64;
                let hart = (pos / 4) as usize;
                let word: u32 = (self.harts.mip(hart) & MIP_MSIP != 0) as u32;
                *b = (word >> ((pos % 4) * 8)) as u8;
            }
            true
        } else if offset >= MTIMECMP_BASE && offset + len <= MTIMECMP_BASE + nharts * 8 {
            for (i, b) in bytes.iter_mut().enumerate() {
                let pos = offset - MTIMECMP_BASE + i as u64;
                *b = (self.mtimecmp[(pos / 8) as usize] >> ((pos % 8) * 8)) as u8;
            }
            true
        } else if offset >= MTIME_BASE && offset + len <= MTIME_BASE + 8 {
            for (i, b) in bytes.iter_mut().enumerate() {
                let pos = offset - MTIME_BASE + i as u64;
                *b = (self.mtime >> (pos * 8)) as u8;
            }
            true
        } else {
            // Undefined offset, or a read crossing register families.
            false
        }
    }

    fn store(&mut self, offset: u64, bytes: &[u8]) -> bool {
        let len = bytes.len() as u64;
        let nharts = self.harts.len() as u64;

        let ok = if offset >= MSIP_BASE && offset + len <= MSIP_BASE + nharts * 4 {
            // Only bit 0 of each covered word is honoured; a hart's MSIP
            // changes only when the store covers its word's low byte.
            for (i, b) in bytes.iter().enumerate() {
                let pos = offset - MSIP_BASE + i as u64;
                if pos % 4 == 0 {
                    self.harts
                        .set_mip((pos / 4) as usize, MIP_MSIP, b & 1 != 0);
                }
            }
            true
        } else if offset >= MTIMECMP_BASE && offset + len <= MTIMECMP_BASE + nharts * 8 {
            for (i, b) in bytes.iter().enumerate() {
                let pos = offset - MTIMECMP_BASE + i as u64;
                let w = (pos / 8) as usize;
                let shift = (pos % 8) * 8;
                self.mtimecmp[w] = (self.mtimecmp[w] & !(0xFFu64 << shift)) | ((*b as u64) << shift);
            }
            true
        } else if offset >= MTIME_BASE && offset + len <= MTIME_BASE + 8 {
            for (i, b) in bytes.iter().enumerate() {
                let shift = (offset - MTIME_BASE + i as u64) * 8;
                self.mtime = (self.mtime & !(0xFFu64 << shift)) | ((*b as u64) << shift);
            }
            true
        } else {
            false
        };

        if ok {
            self.tick(0);
        }
        ok
    }

    fn size(&self) -> u64 {
        CLINT_SIZE
    }
}
