//! PLIC - Platform-Level Interrupt Controller
//!
//! SiFive-compatible register map: per-source priorities, per-context
//! enable masks and thresholds, pending/claimed bitfields, and
//! claim/complete arbitration. Asserts MEIP and SEIP on the target harts.

use log::trace;

use super::Device;
use crate::hart::{Harts, MIP_MEIP, MIP_SEIP};
use crate::snapshot::PlicSnapshot;
use crate::ConfigError;

/// Privilege mode of an interrupt-delivery context.
///
/// Only M and S contexts drive interrupt lines; U and H contexts can be
/// configured but deliver nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlicMode {
    U,
    S,
    H,
    M,
}

impl PlicMode {
    fn from_char(c: char) -> Result<Self, ConfigError> {
        match c {
            'U' => Ok(PlicMode::U),
            'S' => Ok(PlicMode::S),
            'H' => Ok(PlicMode::H),
            'M' => Ok(PlicMode::M),
            _ => Err(ConfigError::InvalidPlicMode(c)),
        }
    }
}

/// An interrupt-delivery context: one (hart, mode) pair.
#[derive(Debug, Clone, Copy)]
pub struct PlicAddr {
    pub addrid: u32,
    pub hartid: u32,
    pub mode: PlicMode,
}

/// Register-map geometry and sizing.
///
/// `hart_config` lists modes per hart, comma-separated: `"MS,MS"` is two
/// harts with an M and an S context each. Contexts are assigned in input
/// order. `num_sources` counts register slots including the reserved
/// IRQ 0, so a machine with usable sources 1..=3 sets `num_sources = 4`.
#[derive(Debug, Clone)]
pub struct PlicParams {
    pub hart_config: String,
    pub hartid_base: u32,
    pub num_sources: u32,
    pub num_priorities: u32,
    pub priority_base: u64,
    pub pending_base: u64,
    pub enable_base: u64,
    pub enable_stride: u64,
    pub context_base: u64,
    pub context_stride: u64,
    pub aperture_size: u64,
}

impl Default for PlicParams {
    fn default() -> Self {
        PlicParams {
            hart_config: "MS".to_string(),
            hartid_base: 0,
            num_sources: 127,
            num_priorities: 7,
            priority_base: 0x4,
            pending_base: 0x1000,
            enable_base: 0x2000,
            enable_stride: 0x80,
            context_base: 0x20_0000,
            context_stride: 0x1000,
            aperture_size: 0x400_0000,
        }
    }
}

/// PLIC device
#[derive(Debug)]
pub struct Plic {
    harts: Harts,
    params: PlicParams,
    num_addrs: u32,
    bitfield_words: u32,
    addr_config: Vec<PlicAddr>,
    /// Indexed by IRQ number; slot 0 is reserved and stays 0.
    source_priority: Vec<u32>,
    target_priority: Vec<u32>,
    pending: Vec<u32>,
    claimed: Vec<u32>,
    /// `num_addrs * bitfield_words` words, context-major.
    enable: Vec<u32>,
}

/// Scalar register-map geometry, copied out of `PlicParams` so register
/// decode can borrow it while mutating the bitfields.
#[derive(Clone, Copy)]
struct Geometry {
    num_sources: u32,
    num_priorities: u32,
    priority_base: u64,
    pending_base: u64,
    enable_base: u64,
    enable_stride: u64,
    context_base: u64,
    context_stride: u64,
}

impl Geometry {
    fn of(params: &PlicParams) -> Self {
        Geometry {
            num_sources: params.num_sources,
            num_priorities: params.num_priorities,
            priority_base: params.priority_base,
            pending_base: params.pending_base,
            enable_base: params.enable_base,
            enable_stride: params.enable_stride,
            context_base: params.context_base,
            context_stride: params.context_stride,
        }
    }
}

fn parse_hart_config(config: &str, hartid_base: u32) -> Result<Vec<PlicAddr>, ConfigError> {
    let mut addrs = Vec::new();
    let mut hartid = hartid_base;
    let mut modes: u32 = 0;
    for c in config.chars() {
        if c == ',' {
            hartid += 1;
            modes = 0;
        } else {
            let mode = PlicMode::from_char(c)?;
            let m = 1u32 << mode as u32;
            if modes & m != 0 {
                return Err(ConfigError::DuplicatePlicMode {
                    mode: c,
                    config: config.to_string(),
                });
            }
            modes |= m;
            addrs.push(PlicAddr {
                addrid: addrs.len() as u32,
                hartid,
                mode,
            });
        }
    }
    Ok(addrs)
}

impl Plic {
    pub fn new(harts: Harts, params: PlicParams) -> Result<Self, ConfigError> {
        let addr_config = parse_hart_config(&params.hart_config, params.hartid_base)?;
        let num_addrs = addr_config.len() as u32;
        let bitfield_words = (params.num_sources + 31) >> 5;
        log::debug!(
            "plic: {} sources, {} contexts ({:?})",
            params.num_sources,
            num_addrs,
            params.hart_config
        );
        Ok(Plic {
            harts,
            source_priority: vec![0; params.num_sources as usize],
            target_priority: vec![0; num_addrs as usize],
            pending: vec![0; bitfield_words as usize],
            claimed: vec![0; bitfield_words as usize],
            enable: vec![0; (num_addrs * bitfield_words) as usize],
            addr_config,
            num_addrs,
            bitfield_words,
            params,
        })
    }

    pub fn num_contexts(&self) -> u32 {
        self.num_addrs
    }

    pub fn context(&self, addrid: u32) -> PlicAddr {
        self.addr_config[addrid as usize]
    }

    fn set_masked(word: &mut u32, mask: u32, level: bool) {
        if level {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }

    fn set_pending_raw(&mut self, irq: u32, level: bool) {
        Self::set_masked(&mut self.pending[(irq >> 5) as usize], 1 << (irq & 31), level);
    }

    fn set_claimed_raw(&mut self, irq: u32, level: bool) {
        Self::set_masked(&mut self.claimed[(irq >> 5) as usize], 1 << (irq & 31), level);
    }

    /// External edge input from a device model.
    ///
    /// IRQ 0 and out-of-range sources are ignored. A 0-to-1 transition on
    /// an unclaimed source is delivered by the `update` this triggers.
    pub fn set_pending(&mut self, irq: u32, level: bool) {
        if irq == 0 || irq >= self.params.num_sources {
            return;
        }
        trace!("plic: set_pending irq {} level {}", irq, level);
        self.set_pending_raw(irq, level);
        self.update();
    }

    /// Arbitrate a claim for one context.
    ///
    /// Picks the pending, enabled, unclaimed IRQ with the highest priority
    /// strictly above the context's threshold; ties go to the lowest IRQ
    /// number. The winner atomically moves from pending to claimed; 0
    /// means no eligible IRQ.
    pub fn claim(&mut self, addrid: u32) -> u32 {
        let mut max_irq = 0u32;
        let mut max_prio = self.target_priority[addrid as usize];

        for w in 0..self.bitfield_words {
            let pending_enabled_not_claimed = (self.pending[w as usize]
                & !self.claimed[w as usize])
                & self.enable[(addrid * self.bitfield_words + w) as usize];
            if pending_enabled_not_claimed == 0 {
                continue;
            }
            for j in 0..32 {
                let irq = (w << 5) + j;
                if irq >= self.params.num_sources {
                    break;
                }
                let prio = self.source_priority[irq as usize];
                let enabled = pending_enabled_not_claimed & (1 << j) != 0;
                if enabled && prio > max_prio {
                    max_irq = irq;
                    max_prio = prio;
                }
            }
        }

        if max_irq != 0 {
            trace!("plic: context {} claimed irq {}", addrid, max_irq);
            self.set_pending_raw(max_irq, false);
            self.set_claimed_raw(max_irq, true);
        }
        max_irq
    }

    /// Whether any pending, enabled, unclaimed IRQ exceeds the context's
    /// threshold.
    pub fn irqs_pending(&self, addrid: u32) -> bool {
        for w in 0..self.bitfield_words {
            let pending_enabled_not_claimed = (self.pending[w as usize]
                & !self.claimed[w as usize])
                & self.enable[(addrid * self.bitfield_words + w) as usize];
            if pending_enabled_not_claimed == 0 {
                continue;
            }
            for j in 0..32 {
                let irq = (w << 5) + j;
                if irq >= self.params.num_sources {
                    break;
                }
                let enabled = pending_enabled_not_claimed & (1 << j) != 0;
                if enabled && self.source_priority[irq as usize] > self.target_priority[addrid as usize]
                {
                    return true;
                }
            }
        }
        false
    }

    /// Recompute every context's delivery line.
    pub fn update(&mut self) {
        for i in 0..self.num_addrs as usize {
            let ac = self.addr_config[i];
            let hartid = ac.hartid as usize;
            if hartid >= self.harts.len() {
                continue;
            }
            let level = self.irqs_pending(ac.addrid);
            match ac.mode {
                PlicMode::M => self.harts.set_mip(hartid, MIP_MEIP, level),
                PlicMode::S => self.harts.set_mip(hartid, MIP_SEIP, level),
                _ => {}
            }
        }
    }

    fn complete(&mut self, addrid: u32, irq: u32) {
        if irq < self.params.num_sources {
            trace!("plic: context {} completed irq {}", addrid, irq);
            self.set_claimed_raw(irq, false);
            self.update();
        }
    }

    pub fn snapshot(&self) -> PlicSnapshot {
        PlicSnapshot {
            source_priority: self.source_priority.clone(),
            target_priority: self.target_priority.clone(),
            pending: self.pending.clone(),
            claimed: self.claimed.clone(),
            enable: self.enable.clone(),
        }
    }

    pub fn restore(&mut self, snap: &PlicSnapshot) -> Result<(), String> {
        if snap.source_priority.len() != self.source_priority.len()
            || snap.target_priority.len() != self.target_priority.len()
            || snap.pending.len() != self.pending.len()
            || snap.claimed.len() != self.claimed.len()
            || snap.enable.len() != self.enable.len()
        {
            return Err("Snapshot does not match the plic geometry".to_string());
        }
        self.source_priority.copy_from_slice(&snap.source_priority);
        self.target_priority.copy_from_slice(&snap.target_priority);
        self.pending.copy_from_slice(&snap.pending);
        self.claimed.copy_from_slice(&snap.claimed);
        self.enable.copy_from_slice(&snap.enable);
        self.update();
        Ok(())
    }

    pub fn reset(&mut self) {
        self.source_priority.fill(0);
        self.target_priority.fill(0);
        self.pending.fill(0);
        self.claimed.fill(0);
        self.enable.fill(0);
        self.update();
    }
}

impl Device for Plic {
    fn load(&mut self, offset: u64, bytes: &mut [u8]) -> bool {
        // Reads must be 4-byte words.
        if offset & 0x3 != 0 || bytes.len() != 4 {
            return false;
        }
        let p = Geometry::of(&self.params);

        let value: u32 = if offset >= p.priority_base
            && offset < p.priority_base + ((p.num_sources as u64) << 2)
        {
            let irq = ((offset - p.priority_base) >> 2) + 1;
            if irq >= p.num_sources as u64 {
                return false;
            }
            self.source_priority[irq as usize]
        } else if offset >= p.pending_base
            && offset < p.pending_base + (self.bitfield_words as u64) * 4
        {
            self.pending[((offset - p.pending_base) >> 2) as usize]
        } else if offset >= p.enable_base
            && offset < p.enable_base + (self.num_addrs as u64) * p.enable_stride
        {
            let addrid = ((offset - p.enable_base) / p.enable_stride) as u32;
            let wordid = ((offset & (p.enable_stride - 1)) >> 2) as u32;
            if wordid >= self.bitfield_words {
                return false;
            }
            self.enable[(addrid * self.bitfield_words + wordid) as usize]
        } else if offset >= p.context_base
            && offset < p.context_base + (self.num_addrs as u64) * p.context_stride
        {
            let addrid = ((offset - p.context_base) / p.context_stride) as u32;
            match offset & (p.context_stride - 1) {
                0 => self.target_priority[addrid as usize],
                4 => {
                    let irq = self.claim(addrid);
                    self.update();
                    irq
                }
                _ => return false,
            }
        } else {
            return false;
        };

        bytes.copy_from_slice(&value.to_le_bytes());
        true
    }

    fn store(&mut self, offset: u64, bytes: &[u8]) -> bool {
        // Writes must be 4-byte words.
        if offset & 0x3 != 0 || bytes.len() != 4 {
            return false;
        }
        let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let p = Geometry::of(&self.params);

        if offset >= p.priority_base && offset < p.priority_base + ((p.num_sources as u64) << 2) {
            let irq = ((offset - p.priority_base) >> 2) + 1;
            if irq >= p.num_sources as u64 {
                return false;
            }
            self.source_priority[irq as usize] = value & 0x7;
            self.update();
            true
        } else if offset >= p.pending_base
            && offset < p.pending_base + (self.bitfield_words as u64) * 4
        {
            // Pending bits are set and cleared from the device side only.
            false
        } else if offset >= p.enable_base
            && offset < p.enable_base + (self.num_addrs as u64) * p.enable_stride
        {
            let addrid = ((offset - p.enable_base) / p.enable_stride) as u32;
            let wordid = ((offset & (p.enable_stride - 1)) >> 2) as u32;
            if wordid >= self.bitfield_words {
                return false;
            }
            self.enable[(addrid * self.bitfield_words + wordid) as usize] = value;
            self.update();
            true
        } else if offset >= p.context_base
            && offset < p.context_base + (self.num_addrs as u64) * p.context_stride
        {
            let addrid = ((offset - p.context_base) / p.context_stride) as u32;
            match offset & (p.context_stride - 1) {
                0 => {
                    if value <= p.num_priorities {
                        self.target_priority[addrid as usize] = value;
                        self.update();
                    }
                    true
                }
                4 => {
                    self.complete(addrid, value);
                    true
                }
                _ => false,
            }
        } else {
            false
        }
    }

    fn size(&self) -> u64 {
        self.params.aperture_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_plic(hart_config: &str, num_sources: u32) -> (Plic, Harts) {
        let nharts = hart_config.matches(',').count() + 1;
        let harts = Harts::new(nharts);
        let plic = Plic::new(
            harts.clone(),
            PlicParams {
                hart_config: hart_config.to_string(),
                num_sources,
                ..Default::default()
            },
        )
        .unwrap();
        (plic, harts)
    }

    fn store_u32(plic: &mut Plic, offset: u64, value: u32) {
        assert!(plic.store(offset, &value.to_le_bytes()));
    }

    fn load_u32(plic: &mut Plic, offset: u64) -> u32 {
        let mut b = [0u8; 4];
        assert!(plic.load(offset, &mut b));
        u32::from_le_bytes(b)
    }

    const ENABLE0: u64 = 0x2000;
    const THRESHOLD0: u64 = 0x20_0000;
    const CLAIM0: u64 = 0x20_0004;

    #[test]
    fn test_hart_config_parsing() {
        let (plic, _) = make_plic("MS,MS", 32);
        assert_eq!(plic.num_contexts(), 4);
        assert_eq!(plic.context(0).hartid, 0);
        assert_eq!(plic.context(0).mode, PlicMode::M);
        assert_eq!(plic.context(1).mode, PlicMode::S);
        assert_eq!(plic.context(2).hartid, 1);
        assert_eq!(plic.context(3).mode, PlicMode::S);
    }

    #[test]
    fn test_hart_config_rejects_duplicate_mode() {
        let harts = Harts::new(1);
        let err = Plic::new(
            harts,
            PlicParams {
                hart_config: "MM".to_string(),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicatePlicMode { mode: 'M', .. }));
    }

    #[test]
    fn test_hart_config_rejects_unknown_mode() {
        let harts = Harts::new(1);
        let err = Plic::new(
            harts,
            PlicParams {
                hart_config: "MX".to_string(),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPlicMode('X')));
    }

    #[test]
    fn test_claim_priority_arbitration_and_tie_break() {
        let (mut plic, _) = make_plic("M", 4);
        store_u32(&mut plic, 0x4 * 1, 2); // irq 1
        store_u32(&mut plic, 0x4 * 2, 5); // irq 2
        store_u32(&mut plic, 0x4 * 3, 5); // irq 3
        plic.set_pending(2, true);
        plic.set_pending(3, true);
        store_u32(&mut plic, ENABLE0, 0b1110);
        store_u32(&mut plic, THRESHOLD0, 0);

        // Tie between irq 2 and 3 goes to the lowest number.
        assert_eq!(load_u32(&mut plic, CLAIM0), 2);
        assert_eq!(load_u32(&mut plic, CLAIM0), 3);
        assert_eq!(load_u32(&mut plic, CLAIM0), 0);
    }

    #[test]
    fn test_threshold_masks_delivery() {
        let (mut plic, harts) = make_plic("M", 4);
        store_u32(&mut plic, 0x4 * 2, 5);
        plic.set_pending(2, true);
        store_u32(&mut plic, ENABLE0, 0b100);
        store_u32(&mut plic, THRESHOLD0, 5);

        assert_eq!(harts.mip(0) & MIP_MEIP, 0);
        assert_eq!(load_u32(&mut plic, CLAIM0), 0);

        store_u32(&mut plic, THRESHOLD0, 4);
        assert_ne!(harts.mip(0) & MIP_MEIP, 0);
        assert_eq!(load_u32(&mut plic, CLAIM0), 2);
    }

    #[test]
    fn test_disabled_source_is_never_claimed() {
        let (mut plic, harts) = make_plic("M", 4);
        store_u32(&mut plic, 0x4 * 1, 7);
        plic.set_pending(1, true);

        assert_eq!(harts.mip(0) & MIP_MEIP, 0);
        assert_eq!(load_u32(&mut plic, CLAIM0), 0);
    }

    #[test]
    fn test_priority_zero_source_is_never_delivered() {
        let (mut plic, harts) = make_plic("M", 4);
        plic.set_pending(1, true);
        store_u32(&mut plic, ENABLE0, 0b10);
        assert_eq!(harts.mip(0) & MIP_MEIP, 0);
        assert_eq!(load_u32(&mut plic, CLAIM0), 0);
    }

    #[test]
    fn test_complete_allows_redelivery() {
        let (mut plic, harts) = make_plic("M", 4);
        store_u32(&mut plic, 0x4 * 1, 3);
        store_u32(&mut plic, ENABLE0, 0b10);
        plic.set_pending(1, true);

        assert_eq!(load_u32(&mut plic, CLAIM0), 1);
        // Claimed and no longer pending: the line drops.
        assert_eq!(harts.mip(0) & MIP_MEIP, 0);

        // Still asserted by the device model while claimed.
        plic.set_pending(1, true);
        assert_eq!(load_u32(&mut plic, CLAIM0), 0);

        store_u32(&mut plic, CLAIM0, 1);
        assert_ne!(harts.mip(0) & MIP_MEIP, 0);
        assert_eq!(load_u32(&mut plic, CLAIM0), 1);
    }

    #[test]
    fn test_m_and_s_context_lines() {
        let (mut plic, harts) = make_plic("MS", 4);
        store_u32(&mut plic, 0x4 * 1, 1);
        plic.set_pending(1, true);

        // Enabled only for the S context (addrid 1).
        store_u32(&mut plic, ENABLE0 + 0x80, 0b10);
        assert_eq!(harts.mip(0) & MIP_MEIP, 0);
        assert_ne!(harts.mip(0) & MIP_SEIP, 0);

        store_u32(&mut plic, ENABLE0, 0b10);
        assert_ne!(harts.mip(0) & MIP_MEIP, 0);
    }

    #[test]
    fn test_misaligned_and_odd_size_accesses_refuse() {
        let (mut plic, _) = make_plic("M", 4);
        let mut b4 = [0u8; 4];
        assert!(!plic.load(0x5, &mut b4));
        assert!(!plic.store(0x6, &b4));
        let mut b8 = [0u8; 8];
        assert!(!plic.load(0x8, &mut b8));
        assert!(!plic.store(0x8, &[0u8; 2]));
    }

    #[test]
    fn test_pending_is_read_only_through_registers() {
        let (mut plic, _) = make_plic("M", 32);
        plic.set_pending(5, true);
        assert_eq!(load_u32(&mut plic, 0x1000), 1 << 5);
        assert!(!plic.store(0x1000, &0u32.to_le_bytes()));
        assert_eq!(load_u32(&mut plic, 0x1000), 1 << 5);
    }

    #[test]
    fn test_priority_write_clamps_to_three_bits() {
        let (mut plic, _) = make_plic("M", 4);
        store_u32(&mut plic, 0x4, 0xFF);
        assert_eq!(load_u32(&mut plic, 0x4), 7);
    }

    #[test]
    fn test_irq_zero_is_reserved() {
        let (mut plic, _) = make_plic("M", 4);
        plic.set_pending(0, true);
        assert_eq!(load_u32(&mut plic, 0x1000), 0);
        // Offset 0 sits below the first priority register.
        let mut b = [0u8; 4];
        assert!(!plic.load(0x0, &mut b));
    }
}
