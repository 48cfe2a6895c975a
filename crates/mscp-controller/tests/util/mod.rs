//! Shared harness for the integration tests: a flat guest memory, a counting
//! interrupt line, and a minimal host-side driver that speaks the port
//! protocol (handshake, ring maintenance, packet envelopes).

use std::cell::Cell;
use std::rc::Rc;

use mscp_controller::proto::*;
use mscp_controller::{IrqLine, MemoryError, MscpController, SA_OFFSET};
// Re-exported so `use util::*` puts the trait in scope for tests that touch
// guest memory directly.
pub use mscp_controller::MemoryBus;

pub struct TestMemory {
    pub data: Vec<u8>,
}

impl TestMemory {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }
}

impl MemoryBus for TestMemory {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let addr = paddr as usize;
        if addr.checked_add(buf.len()).is_none_or(|end| end > self.data.len()) {
            return Err(MemoryError::OutOfBounds {
                addr: paddr,
                len: buf.len(),
            });
        }
        buf.copy_from_slice(&self.data[addr..addr + buf.len()]);
        Ok(())
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) -> Result<(), MemoryError> {
        let addr = paddr as usize;
        if addr.checked_add(buf.len()).is_none_or(|end| end > self.data.len()) {
            return Err(MemoryError::OutOfBounds {
                addr: paddr,
                len: buf.len(),
            });
        }
        self.data[addr..addr + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct TestIrq(Rc<Cell<u32>>);

impl TestIrq {
    pub fn count(&self) -> u32 {
        self.0.get()
    }
}

impl IrqLine for TestIrq {
    fn raise(&self) {
        self.0.set(self.0.get() + 1);
    }
}

/// Response ring base; the communications header sits just below it.
pub const COMM: u64 = 0x1000;
const CMD_SLOTS: u64 = 0x2000;
const RSP_SLOTS: u64 = 0x3000;
const SLOT_STRIDE: u64 = 0x80;

/// Host-side driver model: owns the ring indices and packet slots, mirroring
/// what a guest port driver keeps in its own data structures.
pub struct Host {
    pub cmd_entries: u32,
    pub rsp_entries: u32,
    cmd_idx: u32,
    rsp_idx: u32,
}

impl Host {
    pub fn new(ring_exp: u16) -> Self {
        Self {
            cmd_entries: 1 << ring_exp,
            rsp_entries: 1 << ring_exp,
            cmd_idx: 0,
            rsp_idx: 0,
        }
    }

    fn cmd_ring(&self) -> u64 {
        COMM + self.rsp_entries as u64 * 4
    }

    fn cmd_slot(i: u32) -> u64 {
        CMD_SLOTS + i as u64 * SLOT_STRIDE + 4
    }

    fn rsp_slot(i: u32) -> u64 {
        RSP_SLOTS + i as u64 * SLOT_STRIDE + 4
    }

    /// Drive the four-step handshake to the running state, asserting the SA
    /// pattern at every step.
    pub fn handshake(&mut self, ctrl: &mut MscpController, mem: &mut TestMemory, ie: bool) {
        let exp = self.cmd_entries.trailing_zeros() as u16;
        assert_ne!(ctrl.read_sa() & SA_S1, 0, "controller not in step 1");

        let s1 = SA_S1H_VL
            | (exp << SA_S1H_V_CQ)
            | (exp << SA_S1H_V_RQ)
            | if ie { SA_S1H_IE } else { 0 };
        ctrl.write_u16(mem, SA_OFFSET, s1);
        let sa = ctrl.read_sa();
        assert_ne!(sa & SA_S2, 0, "no step 2 after valid step 1 write");
        assert_eq!(sa & 0x00FF, s1 >> 8, "step 2 must echo step-1 bits 15:8");

        ctrl.write_u16(mem, SA_OFFSET, COMM as u16);
        let sa = ctrl.read_sa();
        assert_ne!(sa & SA_S3, 0);
        assert_eq!(sa & 0x00FF, s1 & 0x00FF, "step 3 must echo step-1 bits 7:0");

        ctrl.write_u16(mem, SA_OFFSET, (COMM >> 16) as u16);
        let sa = ctrl.read_sa();
        assert_ne!(sa & SA_S4, 0);
        assert_eq!((sa >> 4) & 0x00FF, CTRL_MODEL, "step 4 carries the model");

        ctrl.write_u16(mem, SA_OFFSET, SA_S4H_GO);
        assert_eq!(ctrl.read_sa(), 0, "SA clears once the port is up");
        assert!(ctrl.is_up());

        self.arm_responses(mem);
    }

    /// Hand every response slot to the controller.
    pub fn arm_responses(&mut self, mem: &mut TestMemory) {
        for i in 0..self.rsp_entries {
            let desc = DESC_OWN | DESC_F | (Self::rsp_slot(i) as u32 & DESC_ADDR);
            mem.write_u32(COMM + i as u64 * 4, desc).unwrap();
        }
    }

    /// Insert one command into the ring and poll the controller.
    pub fn send(&mut self, ctrl: &mut MscpController, mem: &mut TestMemory, pkt: &Packet) {
        let i = self.cmd_idx;
        let addr = Self::cmd_slot(i);
        mem.write_physical(addr, &pkt.to_bytes()).unwrap();
        mem.write_u16((addr as i64 + ENV_LNT_OFF) as u64, pkt.lnt).unwrap();
        mem.write_u16((addr as i64 + ENV_CTC_OFF) as u64, 0).unwrap();

        let desc = DESC_OWN | DESC_F | (addr as u32 & DESC_ADDR);
        mem.write_u32(self.cmd_ring() + i as u64 * 4, desc).unwrap();
        self.cmd_idx = (i + 1) % self.cmd_entries;

        ctrl.read_ip();
    }

    /// Take the next finished response off the ring, if any, re-arming its
    /// slot. Returns the message and the envelope credits/type word.
    pub fn recv(&mut self, mem: &mut TestMemory) -> Option<(Packet, u16)> {
        let i = self.rsp_idx;
        let desc_addr = COMM + i as u64 * 4;
        let desc = mem.read_u32(desc_addr).unwrap();
        if desc & DESC_OWN != 0 {
            return None;
        }
        let addr = (desc & DESC_ADDR) as u64;
        let lnt = mem.read_u16((addr as i64 + ENV_LNT_OFF) as u64).unwrap();
        let ctc = mem.read_u16((addr as i64 + ENV_CTC_OFF) as u64).unwrap();
        let mut buf = vec![0u8; lnt as usize];
        mem.read_physical(addr, &mut buf).unwrap();

        mem.write_u32(desc_addr, DESC_OWN | DESC_F | (addr as u32 & DESC_ADDR))
            .unwrap();
        self.rsp_idx = (i + 1) % self.rsp_entries;
        Some((Packet::from_bytes(&buf), ctc))
    }

    /// Collect every response currently on the ring.
    pub fn recv_all(&mut self, mem: &mut TestMemory) -> Vec<(Packet, u16)> {
        std::iter::from_fn(|| self.recv(mem)).collect()
    }
}

/// A command packet with just the header filled in.
pub fn cmd(reference: u32, unit: u16, opcode: u16) -> Packet {
    let mut pkt = Packet::zeroed();
    pkt.set_u32(W_REFL, reference);
    pkt.d[W_UNIT] = unit;
    pkt.d[W_OPCODE] = opcode;
    pkt.lnt = 48;
    pkt
}

/// Run the controller for `quanta` ticks.
pub fn settle(ctrl: &mut MscpController, mem: &mut TestMemory, quanta: u64) {
    for _ in 0..quanta {
        ctrl.tick(mem);
    }
}

pub fn new_controller() -> (MscpController, TestIrq, TestMemory) {
    let irq = TestIrq::default();
    let ctrl = MscpController::new(Box::new(irq.clone()));
    let mem = TestMemory::new(0x1_0000);
    (ctrl, irq, mem)
}
