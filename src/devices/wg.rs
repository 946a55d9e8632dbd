//! WorldGuard access-control devices.
//!
//! A per-hart marker names the world a hart currently runs in; filters and
//! PMP blocks police downstream MMIO ranges by world ID. The guard
//! registers themselves are reachable only from the trusted world.

use std::cell::RefCell;
use std::rc::Rc;

use log::trace;

use super::{AccessType, Device};
use crate::hart::Harts;
use crate::ConfigError;

fn covers(base: u64, size: u64, req_addr: u64, req_len: u64) -> bool {
    match req_addr.checked_add(req_len) {
        Some(end) => base <= req_addr && end <= base + size,
        None => false,
    }
}

/// Copy `bytes.len()` bytes out of a register field starting at `rel`.
fn read_field(field: &[u8], rel: u64, bytes: &mut [u8]) {
    let rel = rel as usize;
    bytes.copy_from_slice(&field[rel..rel + bytes.len()]);
}

/// Merge `bytes` into a register field at `rel`, read-modify-write.
fn write_field(field: &mut [u8], rel: u64, bytes: &[u8]) {
    let rel = rel as usize;
    field[rel..rel + bytes.len()].copy_from_slice(bytes);
}

/// World-ID register state bound to a hart.
#[derive(Debug)]
pub struct MarkerState {
    pub wid: u32,
    pub lock: u32,
}

/// Per-hart world marker: `wid @ +0x0`, `lock @ +0x4`.
///
/// The wid is set by boot firmware and can be sealed by writing a
/// non-zero `lock`; after that, stores to either register refuse.
pub struct WgMarker {
    harts: Harts,
    state: Rc<RefCell<MarkerState>>,
    wid_trusted: u32,
}

impl WgMarker {
    pub fn new(harts: Harts, wid: u32, wid_trusted: u32) -> Result<Self, ConfigError> {
        if wid > wid_trusted {
            return Err(ConfigError::WorldIdOutOfRange { wid, wid_trusted });
        }
        Ok(WgMarker {
            harts,
            state: Rc::new(RefCell::new(MarkerState { wid, lock: 0 })),
            wid_trusted,
        })
    }

    /// Shared state handle, for binding to the owning hart.
    pub fn state(&self) -> Rc<RefCell<MarkerState>> {
        self.state.clone()
    }

    fn trusted(&self) -> bool {
        self.harts.current_wid() == self.wid_trusted
    }
}

impl Device for WgMarker {
    fn load(&mut self, offset: u64, bytes: &mut [u8]) -> bool {
        if !self.trusted() {
            return false;
        }
        let len = bytes.len() as u64;
        let state = self.state.borrow();
        if offset + len <= 4 {
            read_field(&state.wid.to_le_bytes(), offset, bytes);
            true
        } else if offset >= 4 && offset + len <= 8 {
            read_field(&state.lock.to_le_bytes(), offset - 4, bytes);
            true
        } else {
            false
        }
    }

    fn store(&mut self, offset: u64, bytes: &[u8]) -> bool {
        if !self.trusted() {
            return false;
        }
        let len = bytes.len() as u64;
        let mut state = self.state.borrow_mut();
        if state.lock != 0 {
            return false;
        }
        if offset + len <= 4 {
            let mut raw = state.wid.to_le_bytes();
            write_field(&mut raw, offset, bytes);
            state.wid = u32::from_le_bytes(raw);
            true
        } else if offset >= 4 && offset + len <= 8 {
            let mut raw = state.lock.to_le_bytes();
            write_field(&mut raw, offset - 4, bytes);
            state.lock = u32::from_le_bytes(raw);
            true
        } else {
            false
        }
    }

    fn size(&self) -> u64 {
        8
    }
}

/// Range filter: a permitted-world bitmask over one downstream range.
///
/// Exposes the mask as `wid @ +0x0`. An access passes when the requesting
/// world's bit is set, or the requester is the trusted world.
pub struct WgFilter {
    harts: Harts,
    wid_mask: u32,
    wid_trusted: u32,
    addr: u64,
    size: u64,
}

impl WgFilter {
    pub fn new(
        harts: Harts,
        wid: u32,
        wid_trusted: u32,
        addr: u64,
        size: u64,
    ) -> Result<Self, ConfigError> {
        if wid >= wid_trusted {
            return Err(ConfigError::WorldIdOutOfRange { wid, wid_trusted });
        }
        if wid_trusted > 31 {
            return Err(ConfigError::InvalidConfig(format!(
                "wid_trusted {} does not fit a 32-bit world mask",
                wid_trusted
            )));
        }
        Ok(WgFilter {
            harts,
            wid_mask: 1 << wid,
            wid_trusted,
            addr,
            size,
        })
    }

    pub fn is_valid(&self, req_wid: u32, _req_addr: u64, _req_len: u64) -> bool {
        if req_wid == 0 {
            return false;
        }
        if req_wid > self.wid_trusted {
            return false;
        }
        self.wid_mask & (1 << req_wid) != 0 || req_wid == self.wid_trusted
    }

    pub fn in_range(&self, req_addr: u64, req_len: u64) -> bool {
        covers(self.addr, self.size, req_addr, req_len)
    }

    pub fn permits(&self, req_wid: u32, req_addr: u64, req_len: u64) -> bool {
        self.in_range(req_addr, req_len) && self.is_valid(req_wid, req_addr, req_len)
    }

    fn trusted(&self) -> bool {
        self.harts.current_wid() == self.wid_trusted
    }
}

impl Device for WgFilter {
    fn load(&mut self, offset: u64, bytes: &mut [u8]) -> bool {
        if !self.trusted() {
            return false;
        }
        if offset + bytes.len() as u64 <= 4 {
            read_field(&self.wid_mask.to_le_bytes(), offset, bytes);
            true
        } else {
            false
        }
    }

    fn store(&mut self, offset: u64, bytes: &[u8]) -> bool {
        if !self.trusted() {
            return false;
        }
        if offset + bytes.len() as u64 <= 4 {
            let mut raw = self.wid_mask.to_le_bytes();
            write_field(&mut raw, offset, bytes);
            self.wid_mask = u32::from_le_bytes(raw);
            true
        } else {
            false
        }
    }

    fn size(&self) -> u64 {
        4
    }
}

#[derive(Clone, Default)]
struct PmpBlock {
    perm: u32,
    base_page: u64,
    page_count: u64,
    lock: u32,
}

const PMP_BLOCK_STRIDE: u64 = 0x18;

/// World PMP: an array of capability blocks, one register window each.
///
/// Block layout: `perm @ +0x00`, `base_page @ +0x04`, `page_count @
/// +0x0C`, `lock @ +0x14`. Bits `perm[2w+1:2w]` grant world `w` read
/// (bit 1) and write (bit 0) over `[base_page*4096,
/// (base_page+page_count)*4096)`. Grants are additive across blocks.
pub struct WgPmp {
    harts: Harts,
    wid_trusted: u32,
    addr: u64,
    size: u64,
    blocks: Vec<PmpBlock>,
}

impl WgPmp {
    pub fn new(harts: Harts, wid_trusted: u32, addr: u64, size: u64) -> Result<Self, ConfigError> {
        if wid_trusted > 15 {
            return Err(ConfigError::InvalidConfig(format!(
                "wid_trusted {} does not fit a 32-bit permission word",
                wid_trusted
            )));
        }
        Ok(WgPmp {
            harts,
            wid_trusted,
            addr,
            size,
            blocks: vec![PmpBlock::default(); wid_trusted as usize],
        })
    }

    pub fn is_valid(&self, req_wid: u32, req_addr: u64, req_len: u64, access: AccessType) -> bool {
        if req_wid == 0 {
            return false;
        }
        if req_wid > self.wid_trusted {
            return false;
        }
        if req_wid == self.wid_trusted {
            return true;
        }
        let req_end = match req_addr.checked_add(req_len) {
            Some(end) => end,
            None => return false,
        };
        for blk in &self.blocks {
            let perm = (blk.perm >> (2 * req_wid)) & 0x3;
            let start = blk.base_page.wrapping_shl(12);
            let end = blk.base_page.wrapping_add(blk.page_count).wrapping_shl(12);
            if start <= req_addr && req_end <= end {
                let granted = match access {
                    AccessType::Store => perm & 0x1 != 0,
                    AccessType::Load | AccessType::Fetch => perm & 0x2 != 0,
                };
                if granted {
                    return true;
                }
            }
        }
        false
    }

    pub fn in_range(&self, req_addr: u64, req_len: u64) -> bool {
        covers(self.addr, self.size, req_addr, req_len)
    }

    pub fn permits(&self, req_wid: u32, req_addr: u64, req_len: u64, access: AccessType) -> bool {
        self.in_range(req_addr, req_len) && self.is_valid(req_wid, req_addr, req_len, access)
    }

    fn trusted(&self) -> bool {
        self.harts.current_wid() == self.wid_trusted
    }
}

impl Device for WgPmp {
    fn load(&mut self, offset: u64, bytes: &mut [u8]) -> bool {
        if !self.trusted() {
            return false;
        }
        let len = bytes.len() as u64;
        if offset + len > self.blocks.len() as u64 * PMP_BLOCK_STRIDE {
            return false;
        }
        let blk = &self.blocks[(offset / PMP_BLOCK_STRIDE) as usize];
        let rel = offset % PMP_BLOCK_STRIDE;

        if rel + len <= 0x4 {
            read_field(&blk.perm.to_le_bytes(), rel, bytes);
        } else if rel >= 0x4 && rel + len <= 0xC {
            read_field(&blk.base_page.to_le_bytes(), rel - 0x4, bytes);
        } else if rel >= 0xC && rel + len <= 0x14 {
            read_field(&blk.page_count.to_le_bytes(), rel - 0xC, bytes);
        } else if rel >= 0x14 && rel + len <= 0x18 {
            read_field(&blk.lock.to_le_bytes(), rel - 0x14, bytes);
        } else {
            return false;
        }
        true
    }

    fn store(&mut self, offset: u64, bytes: &[u8]) -> bool {
        if !self.trusted() {
            return false;
        }
        let len = bytes.len() as u64;
        if offset + len > self.blocks.len() as u64 * PMP_BLOCK_STRIDE {
            return false;
        }
        let blk = &mut self.blocks[(offset / PMP_BLOCK_STRIDE) as usize];
        let rel = offset % PMP_BLOCK_STRIDE;

        if blk.lock != 0 {
            return false;
        }

        if rel + len <= 0x4 {
            let mut raw = blk.perm.to_le_bytes();
            write_field(&mut raw, rel, bytes);
            blk.perm = u32::from_le_bytes(raw);
        } else if rel >= 0x4 && rel + len <= 0xC {
            let mut raw = blk.base_page.to_le_bytes();
            write_field(&mut raw, rel - 0x4, bytes);
            blk.base_page = u64::from_le_bytes(raw);
        } else if rel >= 0xC && rel + len <= 0x14 {
            let mut raw = blk.page_count.to_le_bytes();
            write_field(&mut raw, rel - 0xC, bytes);
            blk.page_count = u64::from_le_bytes(raw);
        } else if rel >= 0x14 && rel + len <= 0x18 {
            let mut raw = blk.lock.to_le_bytes();
            write_field(&mut raw, rel - 0x14, bytes);
            blk.lock = u32::from_le_bytes(raw);
        } else {
            return false;
        }
        true
    }

    fn size(&self) -> u64 {
        self.blocks.len() as u64 * PMP_BLOCK_STRIDE
    }
}

/// Guard handle consulted before forwarding to a downstream device.
pub enum Guard {
    Filter(Rc<RefCell<WgFilter>>),
    Pmp(Rc<RefCell<WgPmp>>),
}

impl Guard {
    fn permits(&self, wid: u32, addr: u64, len: u64, access: AccessType) -> bool {
        match self {
            Guard::Filter(f) => f.borrow().permits(wid, addr, len),
            Guard::Pmp(p) => p.borrow().permits(wid, addr, len, access),
        }
    }
}

/// Downstream device gated by a world guard.
///
/// Carries the base the device is mapped at, so guard checks see absolute
/// physical addresses while the inner device keeps its rebased offsets.
pub struct Guarded {
    harts: Harts,
    guard: Guard,
    base: u64,
    inner: Rc<RefCell<dyn Device>>,
}

impl Guarded {
    pub fn new(harts: Harts, guard: Guard, base: u64, inner: Rc<RefCell<dyn Device>>) -> Self {
        Guarded {
            harts,
            guard,
            base,
            inner,
        }
    }
}

impl Device for Guarded {
    fn load(&mut self, offset: u64, bytes: &mut [u8]) -> bool {
        let wid = self.harts.current_wid();
        let addr = self.base + offset;
        if !self
            .guard
            .permits(wid, addr, bytes.len() as u64, AccessType::Load)
        {
            trace!("wg: denied load at {:#x} for wid {}", addr, wid);
            return false;
        }
        self.inner.borrow_mut().load(offset, bytes)
    }

    fn store(&mut self, offset: u64, bytes: &[u8]) -> bool {
        let wid = self.harts.current_wid();
        let addr = self.base + offset;
        if !self
            .guard
            .permits(wid, addr, bytes.len() as u64, AccessType::Store)
        {
            trace!("wg: denied store at {:#x} for wid {}", addr, wid);
            return false;
        }
        self.inner.borrow_mut().store(offset, bytes)
    }

    fn size(&self) -> u64 {
        self.inner.borrow().size()
    }
}
