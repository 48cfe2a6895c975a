//! MSCP mass-storage controller emulation.
//!
//! Emulates the host-visible behavior of an intelligent UQSSP/MSCP disk
//! controller: the IP/SA register handshake, host-resident command and
//! response descriptor rings, the packet pool with credit-based flow control,
//! per-unit command queues, and the chunked block-transfer engine. Unmodified
//! guest drivers written for the real hardware are the compatibility target,
//! so every register bit and packet offset is part of the contract.
//!
//! This crate intentionally stays small and self-contained: the only external
//! inputs are a block backend per unit ([`mscp_storage::BlockDevice`]), a
//! memory bus (guest physical memory access for ring and data DMA), and an
//! interrupt line.
//!
//! Scheduling is single-threaded and cooperative. All controller activity is
//! driven by [`controller::MscpController::tick`], which advances a discrete
//! event queue one quantum at a time; register accesses run to completion
//! between events.

pub mod controller;
pub mod pool;
pub mod proto;
pub mod ring;
pub mod sched;
pub mod unit;

pub use controller::{MscpController, IP_OFFSET, SA_OFFSET};

/// Errors returned by the emulated controller when it cannot access guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    OutOfBounds { addr: u64, len: usize },
}

/// Guest physical memory access used for ring, packet and data DMA.
pub trait MemoryBus {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), MemoryError>;
    fn write_physical(&mut self, paddr: u64, buf: &[u8]) -> Result<(), MemoryError>;

    fn read_u16(&self, paddr: u64) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read_physical(paddr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, paddr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read_physical(paddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u16(&mut self, paddr: u64, val: u16) -> Result<(), MemoryError> {
        self.write_physical(paddr, &val.to_le_bytes())
    }

    fn write_u32(&mut self, paddr: u64, val: u32) -> Result<(), MemoryError> {
        self.write_physical(paddr, &val.to_le_bytes())
    }
}

/// Edge-triggered host interrupt line.
///
/// UQSSP interrupts are vectored QBus/Unibus edges, not levels; the platform
/// decides what "raising" means (posting the negotiated vector, usually).
pub trait IrqLine {
    fn raise(&self);
}
