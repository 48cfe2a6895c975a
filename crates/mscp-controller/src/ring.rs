//! Host-resident descriptor rings.
//!
//! Each ring is a circular array of 32-bit descriptors in guest memory. Bit 31
//! is the ownership bit (set = controller owns the slot), bit 30 is the host's
//! flag bit requesting a ring-transition interrupt, and bits 21:1 carry the
//! word-aligned packet address.
//!
//! Ring-transition detection inspects the *previous adjacent* slot's ownership
//! bit rather than tracking a fill counter. Driver software depends on the
//! exact edge-triggering this produces, so it is preserved as-is.

use crate::proto::{DESC_F, DESC_OWN};
use crate::{MemoryBus, MemoryError};

#[derive(Debug, Clone, Copy)]
pub struct Ring {
    /// Guest-physical base of the descriptor array.
    pub ba: u64,
    /// Ring size in bytes (entries * 4, power of two).
    pub lnt: u32,
    /// Current offset into the ring, bytes.
    pub idx: u32,
    /// Guest-physical address of this ring's transition interrupt word.
    pub int_addr: u64,
}

impl Ring {
    pub fn new(ba: u64, entries: u32, int_addr: u64) -> Self {
        debug_assert!(entries.is_power_of_two());
        Self {
            ba,
            lnt: entries * 4,
            idx: 0,
            int_addr,
        }
    }

    pub fn entries(&self) -> u32 {
        self.lnt / 4
    }

    /// Read the current descriptor; `None` if the host still owns it (no work
    /// this tick, not an error).
    pub fn get_desc(&self, mem: &dyn MemoryBus) -> Result<Option<u32>, MemoryError> {
        let desc = mem.read_u32(self.ba + self.idx as u64)?;
        if desc & DESC_OWN == 0 {
            return Ok(None);
        }
        Ok(Some(desc))
    }

    /// Return the current descriptor to the host and advance the ring.
    ///
    /// Returns true if this release crossed a ring transition (the previous
    /// slot is still controller-owned and the host asked for the interrupt via
    /// the descriptor F bit); the interrupt word has been written when so.
    pub fn put_desc(&mut self, mem: &mut dyn MemoryBus, desc: u32) -> Result<bool, MemoryError> {
        mem.write_u32(self.ba + self.idx as u64, desc & !DESC_OWN)?;

        let mut transition = false;
        if desc & DESC_F != 0 {
            let prev_off = self.idx.wrapping_sub(4) & (self.lnt - 1);
            let prev = mem.read_u32(self.ba + prev_off as u64)?;
            if prev & DESC_OWN != 0 {
                mem.write_u16(self.int_addr, 1)?;
                transition = true;
            }
        }

        self.idx = (self.idx + 4) & (self.lnt - 1);
        Ok(transition)
    }
}
