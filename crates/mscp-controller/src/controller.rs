//! The MSCP controller proper: IP/SA register interface, four-step
//! initialization handshake, packet fetch/send over the descriptor rings,
//! per-opcode dispatch, the chunked transfer engine and error-log generation.
//!
//! One [`MscpController`] instance exists per emulated card. All shared state
//! is touched only from register handlers and [`MscpController::tick`], which
//! run to completion one at a time.

use mscp_storage::{BlockDevice, BLOCK_SIZE};
use tracing::{debug, trace, warn};

use crate::pool::{PacketPool, PktQueue, PktRef, POOL_SIZE};
use crate::proto::*;
use crate::ring::Ring;
use crate::sched::{Event, EventQueue};
use crate::unit::{DriveModel, Unit, NUM_UNITS};
use crate::{IrqLine, MemoryBus};

/// Register offsets within the controller's I/O window.
pub const IP_OFFSET: u64 = 0;
pub const SA_OFFSET: u64 = 2;

// Simulated delays, in tick quanta.
const QUE_DELAY: u64 = 50;
const XFER_DELAY: u64 = 100;
const TMR_INTERVAL: u64 = 1000; // one emulated second

/// Default per-chunk transfer bound, bytes.
pub const DEFAULT_CHUNK_BYTES: u32 = 65536;
/// Largest byte count accepted for a single data-transfer command.
pub const MAX_CMD_BYTES: u32 = 0x0100_0000;
/// Host timeout applied until SET CONTROLLER CHARACTERISTICS overrides it,
/// seconds.
pub const DEFAULT_HOST_TIMEOUT: u16 = 60;

const INIT_CREDITS: u16 = (POOL_SIZE / 2 - 1) as u16;
const MAX_CREDIT_GRANT: u16 = 14;

// Fatal fault codes, visible to the host as `SA_ER | code`.
pub const PE_PLF: u16 = 32; // packet read/write failure
pub const PE_QWE: u16 = 34; // ring write failure
pub const PE_QRE: u16 = 36; // ring read failure
pub const PE_HAT: u16 = 38; // host access timeout
pub const PE_PPF: u16 = 40; // purge/poll sequence error

type CtrlResult<T> = Result<T, u16>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitState {
    S1,
    S1Wrap,
    S2,
    S3,
    S3PurgeA,
    S3PurgeB,
    S4,
    Up,
    Dead,
}

#[derive(Debug, Clone, Copy)]
struct Rings {
    cmd: Ring,
    rsp: Ring,
}

enum ChunkOutcome {
    Advance { moved: u32, blocks: u32 },
    DiskError,
    MemError(u64),
    Mismatch,
}

pub struct MscpController {
    irq: Box<dyn IrqLine>,

    state: InitState,
    sa: u16,
    /// Host's step-1 handshake word (ring exponents, IE, vector).
    s1_host: u16,
    comm_lo: u16,
    /// Response-ring base; the communications header sits just below it.
    comm: u64,
    purge_int: bool,
    irq_enabled: bool,

    rings: Option<Rings>,
    pool: PacketPool,
    /// Responses waiting for a host-owned descriptor.
    rspq: PktQueue,
    units: Vec<Unit>,

    cflags: u16,
    host_timeout: u16,
    /// Host-access countdown, seconds; reloaded on every register access.
    hat: u16,
    elog_seq: u16,
    credits: u16,
    chunk_bytes: u32,

    now: u64,
    events: EventQueue,
}

impl MscpController {
    pub fn new(irq: Box<dyn IrqLine>) -> Self {
        let mut ctrl = Self {
            irq,
            state: InitState::S1,
            sa: 0,
            s1_host: 0,
            comm_lo: 0,
            comm: 0,
            purge_int: false,
            irq_enabled: false,
            rings: None,
            pool: PacketPool::new(),
            rspq: PktQueue::new(),
            units: (0..NUM_UNITS).map(|_| Unit::new(crate::unit::RD54)).collect(),
            cflags: 0,
            host_timeout: DEFAULT_HOST_TIMEOUT,
            hat: DEFAULT_HOST_TIMEOUT,
            elog_seq: 0,
            credits: INIT_CREDITS,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            now: 0,
            events: EventQueue::new(),
        };
        ctrl.reset();
        ctrl
    }

    /// Reconfigure the per-invocation transfer bound (power-of-two multiple
    /// of the block size).
    pub fn set_chunk_bytes(&mut self, bytes: u32) {
        assert!(bytes >= BLOCK_SIZE as u32 && bytes.is_multiple_of(BLOCK_SIZE as u32));
        self.chunk_bytes = bytes;
    }

    /// Bind a drive model and backing store to a unit slot.
    ///
    /// If the controller is up and attention messages are enabled this queues
    /// a unit-now-available datagram for the host.
    pub fn attach_unit(&mut self, unit: usize, model: DriveModel, disk: Box<dyn BlockDevice>) {
        let u = &mut self.units[unit];
        u.model = model;
        u.flags = model.flags;
        u.online = false;
        u.disk = Some(disk);
        if self.state == InitState::Up && self.cflags & CF_ATN != 0 {
            self.queue_attention(unit);
        }
    }

    /// Detach a unit's backing store, forcing it offline.
    ///
    /// Work bound to the unit is recalled first: an in-progress transfer ends
    /// offline with the bytes moved so far, and every deferred command ends
    /// offline unstarted.
    pub fn detach_unit(&mut self, unit: usize) -> Option<Box<dyn BlockDevice>> {
        if let Some(r) = self.units[unit].cpkt.take() {
            let moved = {
                let pkt = self.pool.get(r);
                pkt.get_u32(RW_BCL) - pkt.get_u32(RW_WBCL)
            };
            let pkt = self.pool.get_mut(r);
            pkt.set_u32(RW_BCL, moved);
            let opcode = pkt.opcode();
            pkt.set_end(opcode, 0, ST_OFL | SB_OFL_NV, RW_LNT);
            self.rspq.push_tail(&mut self.pool, r);
        }
        self.units[unit].abort_ref = None;
        while let Some(r) = self.units[unit].pktq.pop_head(&mut self.pool) {
            let pkt = self.pool.get_mut(r);
            let opcode = pkt.opcode();
            pkt.set_end(opcode, 0, ST_OFL | SB_OFL_NV, 12);
            self.rspq.push_tail(&mut self.pool, r);
        }
        if self.state == InitState::Up && !self.rspq.is_empty() {
            self.sched_quesvc();
        }
        let u = &mut self.units[unit];
        u.online = false;
        u.disk.take()
    }

    /// Apply or clear the software write lock on a unit.
    pub fn set_write_protected(&mut self, unit: usize, protected: bool) {
        let u = &mut self.units[unit];
        if protected {
            u.flags |= UF_WPS;
        } else {
            u.flags &= !UF_WPS;
        }
    }

    pub fn is_up(&self) -> bool {
        self.state == InitState::Up
    }

    /// Whether the host asked for purge interrupts during step 2.
    pub fn purge_interrupts_requested(&self) -> bool {
        self.purge_int
    }

    pub fn is_dead(&self) -> bool {
        self.state == InitState::Dead
    }

    pub fn credits(&self) -> u16 {
        self.credits
    }

    pub fn free_packets(&self) -> usize {
        self.pool.free_count()
    }

    pub fn in_flight_packets(&self) -> usize {
        self.pool.in_flight()
    }

    // ---- register interface ------------------------------------------------

    pub fn read_u16(&mut self, offset: u64) -> u16 {
        match offset {
            IP_OFFSET => self.read_ip(),
            SA_OFFSET => self.read_sa(),
            _ => 0,
        }
    }

    pub fn write_u16(&mut self, mem: &mut dyn MemoryBus, offset: u64, val: u16) {
        match offset {
            IP_OFFSET => self.write_ip(val),
            SA_OFFSET => self.write_sa(mem, val),
            _ => {}
        }
    }

    /// IP read: completes the purge/poll self-test, or polls the host queues
    /// when the controller is up. Reads as zero.
    pub fn read_ip(&mut self) -> u16 {
        self.hat_reload();
        match self.state {
            InitState::S3PurgeB => {
                self.sa = self.step4_word();
                self.enter(InitState::S4);
            }
            InitState::Up => self.sched_quesvc(),
            _ => {}
        }
        0
    }

    pub fn read_sa(&mut self) -> u16 {
        self.hat_reload();
        self.sa
    }

    /// IP write: hard controller reset, from any state including DEAD.
    pub fn write_ip(&mut self, _val: u16) {
        debug!("controller reset via IP write");
        self.reset();
    }

    pub fn write_sa(&mut self, mem: &mut dyn MemoryBus, val: u16) {
        self.hat_reload();
        match self.state {
            InitState::S1 => self.sa_step1(val),
            InitState::S1Wrap => self.sa = val,
            InitState::S2 => self.sa_step2(val),
            InitState::S3 => self.sa_step3(val),
            InitState::S3PurgeA => {
                if val != 0 {
                    self.fatal(PE_PPF);
                } else {
                    self.enter(InitState::S3PurgeB);
                }
            }
            // Step 4 is the only remaining state that accepts SA data.
            InitState::S4 => self.sa_step4(mem, val),
            InitState::S3PurgeB | InitState::Up | InitState::Dead => {}
        }
    }

    fn sa_step1(&mut self, val: u16) {
        if val & SA_S1H_WR != 0 {
            // Wrap mode: echo every subsequent SA write until reset.
            self.sa = val;
            self.enter(InitState::S1Wrap);
            return;
        }
        if val & SA_S1H_VL == 0 {
            return;
        }
        self.s1_host = val;
        self.irq_enabled = val & SA_S1H_IE != 0;
        self.sa = SA_S2 | (val >> 8);
        self.enter(InitState::S2);
        self.step_irq();
    }

    fn sa_step2(&mut self, val: u16) {
        self.comm_lo = val & SA_S2H_CLO;
        self.purge_int = val & SA_S2H_PI != 0;
        self.sa = SA_S3 | (self.s1_host & 0x00FF);
        self.enter(InitState::S3);
        self.step_irq();
    }

    fn sa_step3(&mut self, val: u16) {
        self.comm = (((val & SA_S3H_CHI) as u64) << 16) | self.comm_lo as u64;
        if val & SA_S3H_PP != 0 {
            self.sa = 0;
            self.enter(InitState::S3PurgeA);
            return;
        }
        self.sa = self.step4_word();
        self.enter(InitState::S4);
        self.step_irq();
    }

    fn sa_step4(&mut self, mem: &mut dyn MemoryBus, val: u16) {
        if val & SA_S4H_GO == 0 {
            return;
        }
        let rsp_entries = 1u32 << ((self.s1_host >> SA_S1H_V_RQ) & SA_S1H_M_Q);
        let cmd_entries = 1u32 << ((self.s1_host >> SA_S1H_V_CQ) & SA_S1H_M_Q);

        let rsp = Ring::new(self.comm, rsp_entries, (self.comm as i64 + COMM_RI_OFF) as u64);
        let cmd = Ring::new(
            self.comm + rsp_entries as u64 * 4,
            cmd_entries,
            (self.comm as i64 + COMM_CI_OFF) as u64,
        );

        // Zero the communications region: header plus both rings, sized to
        // the negotiated lengths.
        let total = COMM_HDR_BYTES + (rsp_entries + cmd_entries) as u64 * 4;
        let zeros = vec![0u8; total as usize];
        if mem
            .write_physical((self.comm as i64 + COMM_QQ_OFF) as u64, &zeros)
            .is_err()
        {
            self.fatal(PE_QWE);
            return;
        }

        self.rings = Some(Rings { cmd, rsp });
        self.sa = 0;
        self.enter(InitState::Up);
        self.hat_reload();
        self.events.schedule(self.now + TMR_INTERVAL, Event::Tmr);
        self.sched_quesvc();

        if val & SA_S4H_LF != 0 {
            self.queue_last_fail();
        }
    }

    fn step4_word(&self) -> u16 {
        SA_S4 | (CTRL_MODEL << 4) | CTRL_SVER
    }

    fn enter(&mut self, next: InitState) {
        debug!(?next, "init state transition");
        self.state = next;
    }

    fn step_irq(&self) {
        if self.irq_enabled {
            self.irq.raise();
        }
    }

    fn hat_reload(&mut self) {
        self.hat = self.host_timeout;
    }

    /// Return the controller to its power-on state. Units stay attached but
    /// go offline; every queued packet is recalled.
    pub fn reset(&mut self) {
        self.state = InitState::S1;
        self.sa = SA_S1 | SA_S1C_Q22 | SA_S1C_DI | SA_S1C_MP;
        self.s1_host = 0;
        self.comm_lo = 0;
        self.comm = 0;
        self.purge_int = false;
        self.irq_enabled = false;
        self.rings = None;
        self.pool.reset();
        self.rspq = PktQueue::new();
        for u in &mut self.units {
            u.online = false;
            u.flags = u.model.flags;
            u.cpkt = None;
            u.pktq = PktQueue::new();
            u.abort_ref = None;
        }
        self.cflags = 0;
        self.host_timeout = DEFAULT_HOST_TIMEOUT;
        self.hat = DEFAULT_HOST_TIMEOUT;
        self.elog_seq = 0;
        self.credits = INIT_CREDITS;
        self.events.clear();
    }

    fn fatal(&mut self, code: u16) {
        warn!(code, "controller fatal, requires external reset");
        self.state = InitState::Dead;
        self.sa = SA_ER | code;
        self.rings = None;
        self.events.clear();
        if self.irq_enabled {
            self.irq.raise();
        }
    }

    // ---- event loop --------------------------------------------------------

    /// Advance simulated time one quantum and fire due events.
    pub fn tick(&mut self, mem: &mut dyn MemoryBus) {
        self.now += 1;
        while let Some(ev) = self.events.pop_due(self.now) {
            match ev {
                Event::QueSvc => self.que_svc(mem),
                Event::UnitSvc(unit) => self.unit_svc(mem, unit),
                Event::Tmr => self.tmr_svc(),
            }
        }
    }

    /// Convenience: tick until the event queue drains or `limit` quanta pass.
    pub fn run(&mut self, mem: &mut dyn MemoryBus, limit: u64) {
        for _ in 0..limit {
            if self.events.is_empty() {
                break;
            }
            self.tick(mem);
        }
    }

    fn sched_quesvc(&mut self) {
        if !self.events.is_scheduled(Event::QueSvc) {
            self.events.schedule(self.now + QUE_DELAY, Event::QueSvc);
        }
    }

    fn que_svc(&mut self, mem: &mut dyn MemoryBus) {
        if self.state != InitState::Up {
            return;
        }

        // At most one new host command per service tick.
        let mut did_host = false;
        match self.fetch_cmd(mem) {
            Err(code) => return self.fatal(code),
            Ok(Some(r)) => {
                did_host = true;
                if let Err(code) = self.dispatch(mem, r, false) {
                    return self.fatal(code);
                }
            }
            Ok(None) => {}
        }

        // Backlog drains only when the host ring is empty, one entry per idle
        // unit, so new work keeps priority and units stay fair.
        if !did_host {
            for unit in 0..NUM_UNITS {
                if self.units[unit].busy() {
                    continue;
                }
                if let Some(r) = self.units[unit].pktq.pop_head(&mut self.pool) {
                    if let Err(code) = self.dispatch(mem, r, true) {
                        return self.fatal(code);
                    }
                }
            }
        }

        // At most one deferred response retry.
        if let Some(r) = self.rspq.pop_head(&mut self.pool) {
            match self.try_send(mem, r) {
                Err(code) => return self.fatal(code),
                Ok(true) => {}
                Ok(false) => self.rspq.push_head(&mut self.pool, r),
            }
        }

        let backlog = !self.rspq.is_empty()
            || self
                .units
                .iter()
                .any(|u| !u.busy() && !u.pktq.is_empty());
        if did_host || backlog {
            self.sched_quesvc();
        }
    }

    fn tmr_svc(&mut self) {
        if self.state != InitState::Up {
            return;
        }
        self.events.schedule(self.now + TMR_INTERVAL, Event::Tmr);
        if self.host_timeout == 0 {
            return;
        }
        let busy = self.units.iter().any(|u| u.busy()) || !self.rspq.is_empty();
        if busy {
            self.hat_reload();
            return;
        }
        self.hat = self.hat.saturating_sub(1);
        if self.hat == 0 {
            self.fatal(PE_HAT);
        }
    }

    // ---- packet fetch / send ----------------------------------------------

    fn fetch_cmd(&mut self, mem: &mut dyn MemoryBus) -> CtrlResult<Option<PktRef>> {
        if self.pool.free_count() == 0 {
            return Ok(None);
        }
        let Some(rings) = self.rings.as_mut() else {
            return Ok(None);
        };
        let Some(desc) = rings.cmd.get_desc(mem).map_err(|_| PE_QRE)? else {
            return Ok(None);
        };

        let addr = (desc & DESC_ADDR) as u64;
        let lnt = mem
            .read_u16((addr as i64 + ENV_LNT_OFF) as u64)
            .map_err(|_| PE_PLF)?;
        if !(12..=PKT_BYTES as u16).contains(&lnt) {
            return Err(PE_PLF);
        }
        let mut buf = vec![0u8; lnt as usize];
        mem.read_physical(addr, &mut buf).map_err(|_| PE_PLF)?;

        let r = self.pool.alloc().expect("free count checked above");
        *self.pool.get_mut(r) = Packet::from_bytes(&buf);

        // Return the command slot to the host; taking a command also returns
        // its flow-control credit to the grant balance.
        let rings = self.rings.as_mut().expect("checked above");
        let transition = rings.cmd.put_desc(mem, desc).map_err(|_| PE_QWE)?;
        if transition && self.irq_enabled {
            self.irq.raise();
        }
        self.credits += 1;
        self.hat_reload();
        trace!(
            opcode = self.pool.get(r).opcode(),
            unit = self.pool.get(r).unit(),
            reference = self.pool.get(r).reference(),
            "fetched command packet"
        );
        Ok(Some(r))
    }

    /// Try to transmit a finished packet. `Ok(false)` means no response
    /// descriptor was available; the caller queues and retries.
    fn try_send(&mut self, mem: &mut dyn MemoryBus, r: PktRef) -> CtrlResult<bool> {
        let Some(rings) = self.rings.as_mut() else {
            return Ok(false);
        };
        let Some(desc) = rings.rsp.get_desc(mem).map_err(|_| PE_QRE)? else {
            return Ok(false);
        };
        let addr = (desc & DESC_ADDR) as u64;

        let grant = if self.pool.get(r).typ == TYP_SEQ {
            self.credits.min(MAX_CREDIT_GRANT)
        } else {
            0
        };

        let (bytes, lnt, typ) = {
            let pkt = self.pool.get(r);
            (pkt.to_bytes(), pkt.lnt, pkt.typ)
        };
        let ctc = (typ << ENV_CTC_V_TYP) | (grant & ENV_CTC_M_CR);

        mem.write_physical(addr, &bytes).map_err(|_| PE_PLF)?;
        mem.write_u16((addr as i64 + ENV_LNT_OFF) as u64, lnt)
            .map_err(|_| PE_PLF)?;
        mem.write_u16((addr as i64 + ENV_CTC_OFF) as u64, ctc)
            .map_err(|_| PE_PLF)?;

        let rings = self.rings.as_mut().expect("checked above");
        let transition = rings.rsp.put_desc(mem, desc).map_err(|_| PE_QWE)?;
        if transition && self.irq_enabled {
            self.irq.raise();
        }

        self.credits -= grant;
        self.pool.free(r);
        Ok(true)
    }

    fn post(&mut self, mem: &mut dyn MemoryBus, r: PktRef) -> CtrlResult<()> {
        if !self.try_send(mem, r)? {
            self.rspq.push_tail(&mut self.pool, r);
            self.sched_quesvc();
        }
        Ok(())
    }

    fn end_packet(
        &mut self,
        mem: &mut dyn MemoryBus,
        r: PktRef,
        flags: u16,
        status: u16,
        lnt: u16,
    ) -> CtrlResult<()> {
        let pkt = self.pool.get_mut(r);
        let opcode = pkt.opcode();
        pkt.set_end(opcode, flags, status, lnt);
        trace!(opcode, status, "completing packet");
        self.post(mem, r)
    }

    // ---- command dispatch --------------------------------------------------

    /// Decode and run one command packet. `deferred` marks a packet replayed
    /// from a unit FIFO; if its unit is still busy it goes back to the head
    /// of that FIFO unchanged.
    fn dispatch(&mut self, mem: &mut dyn MemoryBus, r: PktRef, deferred: bool) -> CtrlResult<()> {
        match self.pool.get(r).opcode() {
            OP_ABO => self.op_abort(mem, r),
            OP_GCS => self.op_get_cmd_status(mem, r),
            OP_GUS => self.op_get_unit_status(mem, r),
            OP_SCC => self.op_set_ctrl_char(mem, r),
            OP_AVL => self.op_available(mem, r, deferred),
            OP_ONL => self.op_online(mem, r, deferred),
            OP_SUC => self.op_set_unit_char(mem, r, deferred),
            OP_FMT => self.op_format(mem, r, deferred),
            OP_ACC | OP_CMP | OP_ERS | OP_RD | OP_WR => self.op_transfer(mem, r, deferred),
            _ => self.end_packet(mem, r, 0, ST_CMD | I_OPCD, 12),
        }
    }

    fn unit_index(&self, r: PktRef) -> Option<usize> {
        let un = self.pool.get(r).unit() as usize;
        (un < NUM_UNITS).then_some(un)
    }

    /// Park a packet on its unit's FIFO until the unit goes idle.
    fn defer_to_unit(&mut self, r: PktRef, unit: usize, deferred: bool) {
        if deferred {
            self.units[unit].pktq.push_head(&mut self.pool, r);
        } else {
            self.units[unit].pktq.push_tail(&mut self.pool, r);
        }
    }

    fn op_abort(&mut self, mem: &mut dyn MemoryBus, r: PktRef) -> CtrlResult<()> {
        let oref = self.pool.get(r).get_u32(ABO_REFL);
        if let Some(unit) = self.unit_index(r) {
            let in_progress = self.units[unit]
                .cpkt
                .is_some_and(|c| self.pool.get(c).reference() == oref);
            if in_progress {
                // Cooperative: the transfer engine honors this at the next
                // chunk boundary.
                self.units[unit].abort_ref = Some(oref);
            } else if let Some(victim) = {
                let units = &mut self.units;
                let pool = &mut self.pool;
                units[unit].pktq.remove_where(pool, |p| p.reference() == oref)
            } {
                let pkt = self.pool.get_mut(victim);
                let lnt = 12;
                let opcode = pkt.opcode();
                pkt.set_end(opcode, 0, ST_ABO, lnt);
                self.post(mem, victim)?;
            }
        }
        self.end_packet(mem, r, 0, ST_SUC, ABO_LNT)
    }

    fn op_get_cmd_status(&mut self, mem: &mut dyn MemoryBus, r: PktRef) -> CtrlResult<()> {
        let pkt = self.pool.get_mut(r);
        // Outstanding-command status is not modelled; report zero.
        pkt.d[GCS_STSL] = 0;
        pkt.d[GCS_STSH] = 0;
        self.end_packet(mem, r, 0, ST_SUC, GCS_LNT)
    }

    fn op_get_unit_status(&mut self, mem: &mut dyn MemoryBus, r: PktRef) -> CtrlResult<()> {
        let Some(unit) = self.unit_index(r) else {
            return self.end_packet(mem, r, 0, ST_OFL | SB_OFL_NV, GUS_LNT);
        };
        let (status, fields) = {
            let u = &self.units[unit];
            let m = &u.model;
            let status = if !u.attached() {
                ST_OFL | SB_OFL_NV
            } else if u.online {
                ST_SUC
            } else {
                ST_AVL
            };
            (
                status,
                (
                    u.flags_word(),
                    u.unit_id(unit as u16),
                    m.media,
                    m.sectors,
                    m.tpg,
                    m.gpc,
                    m.rcts,
                    m.rbns,
                    m.rctc,
                ),
            )
        };
        let (ufl, uid, media, sectors, tpg, gpc, rcts, rbns, rctc) = fields;
        let pkt = self.pool.get_mut(r);
        pkt.d[GUS_MLUN] = 0;
        pkt.d[GUS_UFL] = ufl;
        pkt.d[GUS_UIDA..GUS_UIDA + 4].copy_from_slice(&uid);
        pkt.set_u32(GUS_MEDL, media);
        pkt.d[GUS_SHUN] = 0;
        pkt.d[GUS_SHST] = 0;
        pkt.d[GUS_TRK] = sectors;
        pkt.d[GUS_GRP] = tpg;
        pkt.d[GUS_CYL] = gpc;
        pkt.d[GUS_UVER] = 0;
        pkt.d[GUS_RCTS] = rcts;
        pkt.d[GUS_RBSC] = (rbns as u16) | ((rctc as u16) << 8);
        self.end_packet(mem, r, 0, status, GUS_LNT)
    }

    fn op_set_ctrl_char(&mut self, mem: &mut dyn MemoryBus, r: PktRef) -> CtrlResult<()> {
        let (version, flags, timeout) = {
            let pkt = self.pool.get(r);
            (pkt.d[SCC_MSV], pkt.d[SCC_CFL], pkt.d[SCC_TMO])
        };

        let status = if version != 0 {
            ST_CMD | I_VRSN
        } else {
            self.cflags = flags & CF_MASK;
            self.host_timeout = if timeout == 0 { 0 } else { timeout + 2 };
            self.hat_reload();
            ST_SUC
        };

        let cflags = self.cflags;
        let host_timeout = self.host_timeout;
        let pkt = self.pool.get_mut(r);
        pkt.d[SCC_MSV] = 0;
        pkt.d[SCC_CFL] = cflags;
        pkt.d[SCC_TMO] = host_timeout;
        pkt.d[SCC_VER] = (CTRL_HVER << 8) | CTRL_SVER;
        pkt.d[SCC_CIDA] = 0;
        pkt.d[SCC_CIDA + 1] = 0;
        pkt.d[SCC_CIDA + 2] = 0;
        pkt.d[SCC_CIDA + 3] = (CTRL_CLASS << 8) | CTRL_MODEL;
        pkt.set_u32(SCC_MBCL, MAX_CMD_BYTES);
        self.end_packet(mem, r, 0, status, SCC_LNT)
    }

    fn op_available(
        &mut self,
        mem: &mut dyn MemoryBus,
        r: PktRef,
        deferred: bool,
    ) -> CtrlResult<()> {
        let Some(unit) = self.unit_index(r) else {
            return self.end_packet(mem, r, 0, ST_OFL | SB_OFL_NV, AVL_LNT);
        };
        if self.units[unit].busy() {
            self.defer_to_unit(r, unit, deferred);
            return Ok(());
        }
        let status = if !self.units[unit].online {
            // Idempotent: already available, no side effects.
            ST_SUC | SB_SUC_ON
        } else {
            self.units[unit].online = false;
            ST_SUC
        };
        self.end_packet(mem, r, 0, status, AVL_LNT)
    }

    fn fill_online_fields(&mut self, r: PktRef, unit: usize) {
        let u = &self.units[unit];
        let ufl = u.flags_word();
        let uid = u.unit_id(unit as u16);
        let media = u.model.media;
        let size = u
            .disk
            .as_ref()
            .map(|d| (u.model.lbns as u64).min(d.capacity_blocks()) as u32)
            .unwrap_or(0);
        let vsn = u.volume_serial(unit as u16);

        let pkt = self.pool.get_mut(r);
        pkt.d[ONL_MLUN] = 0;
        pkt.d[ONL_UFL] = ufl;
        pkt.d[ONL_UIDA..ONL_UIDA + 4].copy_from_slice(&uid);
        pkt.set_u32(ONL_MEDL, media);
        pkt.set_u32(ONL_SIZL, size);
        pkt.set_u32(ONL_VSNL, vsn);
    }

    fn op_online(&mut self, mem: &mut dyn MemoryBus, r: PktRef, deferred: bool) -> CtrlResult<()> {
        let Some(unit) = self.unit_index(r) else {
            return self.end_packet(mem, r, 0, ST_OFL | SB_OFL_NV, ONL_LNT);
        };
        if self.units[unit].busy() {
            self.defer_to_unit(r, unit, deferred);
            return Ok(());
        }
        let status = if !self.units[unit].attached() {
            ST_OFL | SB_OFL_NV
        } else if self.units[unit].online {
            ST_SUC | SB_SUC_ON
        } else {
            self.units[unit].online = true;
            ST_SUC
        };
        self.fill_online_fields(r, unit);
        self.end_packet(mem, r, 0, status, ONL_LNT)
    }

    fn op_set_unit_char(
        &mut self,
        mem: &mut dyn MemoryBus,
        r: PktRef,
        deferred: bool,
    ) -> CtrlResult<()> {
        let Some(unit) = self.unit_index(r) else {
            return self.end_packet(mem, r, 0, ST_OFL | SB_OFL_NV, ONL_LNT);
        };
        if self.units[unit].busy() {
            self.defer_to_unit(r, unit, deferred);
            return Ok(());
        }
        let status = if !self.units[unit].attached() {
            ST_OFL | SB_OFL_NV
        } else {
            let req = self.pool.get(r).d[ONL_UFL];
            let u = &mut self.units[unit];
            u.flags = (u.flags & !UF_WPS) | (req & UF_WPS);
            ST_SUC
        };
        self.fill_online_fields(r, unit);
        self.end_packet(mem, r, 0, status, ONL_LNT)
    }

    fn op_format(&mut self, mem: &mut dyn MemoryBus, r: PktRef, deferred: bool) -> CtrlResult<()> {
        let Some(unit) = self.unit_index(r) else {
            return self.end_packet(mem, r, 0, ST_OFL | SB_OFL_NV, FMT_LNT);
        };
        if self.pool.get(r).d[FMT_IH] & 0x8000 == 0 {
            return self.end_packet(mem, r, 0, ST_CMD | I_FMTI, FMT_LNT);
        }
        if self.units[unit].busy() {
            self.defer_to_unit(r, unit, deferred);
            return Ok(());
        }
        let status = if !self.units[unit].attached() {
            ST_OFL | SB_OFL_NV
        } else if self.units[unit].online {
            // Formatting an online unit is an ordering error by the host.
            ST_CMD
        } else if self.units[unit].write_protected() {
            self.write_protect_status(unit)
        } else {
            ST_SUC
        };
        self.end_packet(mem, r, 0, status, FMT_LNT)
    }

    fn write_protect_status(&self, unit: usize) -> u16 {
        if self.units[unit].flags_word() & UF_WPH != 0 {
            ST_WPR | SB_WPR_HW
        } else {
            ST_WPR | SB_WPR_SW
        }
    }

    fn unit_capacity(&self, unit: usize) -> u32 {
        let u = &self.units[unit];
        u.disk
            .as_ref()
            .map(|d| (u.model.lbns as u64).min(d.capacity_blocks()) as u32)
            .unwrap_or(0)
    }

    /// Validate a data-transfer command and hand it to the transfer engine.
    /// The packet is completed later, chunk by chunk.
    fn op_transfer(
        &mut self,
        mem: &mut dyn MemoryBus,
        r: PktRef,
        deferred: bool,
    ) -> CtrlResult<()> {
        let opcode = self.pool.get(r).opcode();
        let Some(unit) = self.unit_index(r) else {
            return self.end_packet(mem, r, 0, ST_OFL | SB_OFL_NV, RW_LNT);
        };
        if self.units[unit].busy() {
            self.defer_to_unit(r, unit, deferred);
            return Ok(());
        }
        if !self.units[unit].attached() {
            return self.end_packet(mem, r, 0, ST_OFL | SB_OFL_NV, RW_LNT);
        }
        if !self.units[unit].online {
            return self.end_packet(mem, r, 0, ST_AVL, RW_LNT);
        }

        let (bc, ba, lbn) = {
            let pkt = self.pool.get(r);
            (
                pkt.get_u32(RW_BCL),
                pkt.get_u32(RW_BAL),
                pkt.get_u32(RW_LBNL),
            )
        };

        if bc & 1 != 0 || bc > MAX_CMD_BYTES {
            return self.end_packet(mem, r, 0, ST_CMD | I_BCNT, RW_LNT);
        }
        // Zero-length transfers complete at the byte-count stage, before any
        // address validation.
        if bc == 0 {
            return self.end_packet(mem, r, 0, ST_SUC, RW_LNT);
        }
        let blocks = bc.div_ceil(BLOCK_SIZE as u32);
        let cap = self.unit_capacity(unit);
        if lbn >= cap || blocks > cap - lbn {
            return self.end_packet(mem, r, 0, ST_CMD | I_LBN, RW_LNT);
        }
        if matches!(opcode, OP_WR | OP_ERS) && self.units[unit].write_protected() {
            let status = self.write_protect_status(unit);
            return self.end_packet(mem, r, 0, status, RW_LNT);
        }

        // Seed the working fields and schedule the first chunk.
        let pkt = self.pool.get_mut(r);
        pkt.set_u32(RW_WBCL, bc);
        pkt.set_u32(RW_WBAL, ba);
        pkt.set_u32(RW_WLBL, lbn);
        self.units[unit].cpkt = Some(r);
        self.events
            .schedule(self.now + XFER_DELAY, Event::UnitSvc(unit));
        Ok(())
    }

    // ---- transfer engine ---------------------------------------------------

    fn unit_svc(&mut self, mem: &mut dyn MemoryBus, unit: usize) {
        let Some(r) = self.units[unit].cpkt else {
            return;
        };
        let (opcode, reference, bc, wbc, wba, wlb) = {
            let pkt = self.pool.get(r);
            (
                pkt.opcode(),
                pkt.reference(),
                pkt.get_u32(RW_BCL),
                pkt.get_u32(RW_WBCL),
                pkt.get_u32(RW_WBAL),
                pkt.get_u32(RW_WLBL),
            )
        };

        // Aborts take effect only at chunk boundaries.
        if self.units[unit].abort_ref == Some(reference) {
            self.units[unit].abort_ref = None;
            if let Err(code) = self.finish_transfer(mem, unit, r, 0, ST_ABO, bc - wbc) {
                self.fatal(code);
            }
            return;
        }

        let chunk = wbc.min(self.chunk_bytes);
        let outcome = self.run_chunk(mem, unit, opcode, chunk, wba, wlb);

        let result = match outcome {
            ChunkOutcome::Advance { moved, blocks } => {
                let pkt = self.pool.get_mut(r);
                pkt.set_u32(RW_WBCL, wbc - moved);
                pkt.set_u32(RW_WBAL, wba.wrapping_add(moved));
                pkt.set_u32(RW_WLBL, wlb + blocks);
                if wbc - moved > 0 {
                    self.events
                        .schedule(self.now + XFER_DELAY, Event::UnitSvc(unit));
                    return;
                }
                self.finish_transfer(mem, unit, r, 0, ST_SUC, bc)
            }
            ChunkOutcome::Mismatch => self.finish_transfer(mem, unit, r, 0, ST_CMP, bc - wbc),
            ChunkOutcome::DiskError => {
                let logged = match self.log_drive_error(mem, r, unit, wlb) {
                    Ok(logged) => logged,
                    Err(code) => return self.fatal(code),
                };
                let flags = if logged { EF_LOG } else { 0 };
                self.finish_transfer(mem, unit, r, flags, ST_DRV, bc - wbc)
            }
            ChunkOutcome::MemError(addr) => {
                let logged = match self.log_host_bus_error(mem, r, unit, addr) {
                    Ok(logged) => logged,
                    Err(code) => return self.fatal(code),
                };
                let flags = if logged { EF_LOG } else { 0 };
                self.finish_transfer(mem, unit, r, flags, ST_HST | SB_HST_NXM, bc - wbc)
            }
        };
        if let Err(code) = result {
            self.fatal(code);
        }
    }

    /// Move one bounded chunk between the host buffer and the backing store.
    fn run_chunk(
        &mut self,
        mem: &mut dyn MemoryBus,
        unit: usize,
        opcode: u16,
        chunk: u32,
        wba: u32,
        wlb: u32,
    ) -> ChunkOutcome {
        let blocks = chunk.div_ceil(BLOCK_SIZE as u32);
        let buf_len = blocks as usize * BLOCK_SIZE;
        let chunk = chunk as usize;
        // The media can vanish under a scheduled chunk (detach between
        // events); surface that as a drive failure rather than asserting.
        let Some(disk) = self.units[unit].disk.as_mut() else {
            return ChunkOutcome::DiskError;
        };

        match opcode {
            OP_RD => {
                let mut buf = vec![0u8; buf_len];
                if disk.read_blocks(wlb as u64, &mut buf).is_err() {
                    return ChunkOutcome::DiskError;
                }
                if mem.write_physical(wba as u64, &buf[..chunk]).is_err() {
                    return ChunkOutcome::MemError(wba as u64);
                }
            }
            OP_ACC => {
                let mut buf = vec![0u8; buf_len];
                if disk.read_blocks(wlb as u64, &mut buf).is_err() {
                    return ChunkOutcome::DiskError;
                }
            }
            OP_CMP => {
                let mut host = vec![0u8; chunk];
                if mem.read_physical(wba as u64, &mut host).is_err() {
                    return ChunkOutcome::MemError(wba as u64);
                }
                let mut media = vec![0u8; buf_len];
                if disk.read_blocks(wlb as u64, &mut media).is_err() {
                    return ChunkOutcome::DiskError;
                }
                if host[..] != media[..chunk] {
                    return ChunkOutcome::Mismatch;
                }
            }
            OP_WR | OP_ERS => {
                let mut buf = vec![0u8; buf_len];
                // A partial final block must preserve the bytes past the
                // request, so read it back before overlaying.
                if chunk != buf_len {
                    let last = wlb as u64 + blocks as u64 - 1;
                    let tail = &mut buf[buf_len - BLOCK_SIZE..];
                    if disk.read_blocks(last, tail).is_err() {
                        return ChunkOutcome::DiskError;
                    }
                }
                if opcode == OP_WR {
                    if mem.read_physical(wba as u64, &mut buf[..chunk]).is_err() {
                        return ChunkOutcome::MemError(wba as u64);
                    }
                } else {
                    buf[..chunk].fill(0);
                }
                if disk.write_blocks(wlb as u64, &buf).is_err() {
                    return ChunkOutcome::DiskError;
                }
            }
            _ => unreachable!("dispatcher only schedules transfer opcodes"),
        }

        ChunkOutcome::Advance {
            moved: chunk as u32,
            blocks,
        }
    }

    fn finish_transfer(
        &mut self,
        mem: &mut dyn MemoryBus,
        unit: usize,
        r: PktRef,
        flags: u16,
        status: u16,
        moved: u32,
    ) -> CtrlResult<()> {
        self.units[unit].cpkt = None;
        self.units[unit].abort_ref = None;
        self.pool.get_mut(r).set_u32(RW_BCL, moved);
        self.end_packet(mem, r, flags, status, RW_LNT)?;
        // Let the unit's FIFO drain now that it is idle.
        self.sched_quesvc();
        Ok(())
    }

    // ---- error logger ------------------------------------------------------

    fn logging_enabled(&self) -> bool {
        self.cflags & (CF_THS | CF_OTH) != 0
    }

    fn next_elog_seq(&mut self) -> u16 {
        self.elog_seq = self.elog_seq.wrapping_add(1);
        self.elog_seq
    }

    fn elog_header(pkt: &mut Packet, reference: u32, unit: u16, seq: u16, format: u16, event: u16) {
        pkt.set_u32(ELP_REFL, reference);
        pkt.d[ELP_UNIT] = unit;
        pkt.d[ELP_SEQ] = seq;
        pkt.d[ELP_FMT] = format & 0x00FF;
        pkt.d[ELP_EVT] = event;
        pkt.d[ELP_CIDA] = 0;
        pkt.d[ELP_CIDA + 1] = 0;
        pkt.d[ELP_CIDA + 2] = 0;
        pkt.d[ELP_CIDA + 3] = (CTRL_CLASS << 8) | CTRL_MODEL;
        pkt.d[ELP_CVER] = (CTRL_HVER << 8) | CTRL_SVER;
        pkt.typ = TYP_DAT;
    }

    /// Drive-transfer error log (FM_DSK).
    fn log_drive_error(
        &mut self,
        mem: &mut dyn MemoryBus,
        cmd: PktRef,
        unit: usize,
        lbn: u32,
    ) -> CtrlResult<bool> {
        if !self.logging_enabled() {
            return Ok(false);
        }
        let Some(r) = self.pool.alloc() else {
            return Ok(false);
        };
        let (reference, un) = {
            let c = self.pool.get(cmd);
            (c.reference(), c.unit())
        };
        let seq = self.next_elog_seq();
        let (uid, cyl, vsn) = {
            let u = &self.units[unit];
            let spc = u.model.sectors as u32 * u.model.tpg as u32 * u.model.gpc as u32;
            (
                u.unit_id(unit as u16),
                (lbn / spc.max(1)) as u16,
                u.volume_serial(unit as u16),
            )
        };
        let pkt = self.pool.get_mut(r);
        Self::elog_header(pkt, reference, un, seq, FM_DSK, ST_DRV);
        pkt.d[ELP_MLUN] = 0;
        pkt.d[ELP_UIDA..ELP_UIDA + 4].copy_from_slice(&uid);
        pkt.d[ELP_UVER] = 0;
        pkt.d[DTE_CYL] = cyl;
        pkt.set_u32(DTE_VSNL, vsn);
        pkt.set_u32(DTE_LBNL, lbn);
        pkt.lnt = DTE_LNT;
        self.post(mem, r)?;
        Ok(true)
    }

    /// Host bus (nonexistent memory) error log (FM_BAD).
    fn log_host_bus_error(
        &mut self,
        mem: &mut dyn MemoryBus,
        cmd: PktRef,
        unit: usize,
        bad_addr: u64,
    ) -> CtrlResult<bool> {
        if !self.logging_enabled() {
            return Ok(false);
        }
        let Some(r) = self.pool.alloc() else {
            return Ok(false);
        };
        let (reference, un) = {
            let c = self.pool.get(cmd);
            (c.reference(), c.unit())
        };
        let seq = self.next_elog_seq();
        let uid = self.units[unit].unit_id(unit as u16);
        let pkt = self.pool.get_mut(r);
        Self::elog_header(pkt, reference, un, seq, FM_BAD, ST_HST | SB_HST_NXM);
        pkt.d[ELP_MLUN] = 0;
        pkt.d[ELP_UIDA..ELP_UIDA + 4].copy_from_slice(&uid);
        pkt.d[ELP_UVER] = 0;
        pkt.set_u32(HBE_BADL, bad_addr as u32);
        pkt.lnt = HBE_LNT;
        self.post(mem, r)?;
        Ok(true)
    }

    /// Port-last-failure log, queued when step 4 requests it. Unconditional:
    /// the host asked for it before it had a chance to enable logging.
    fn queue_last_fail(&mut self) {
        let Some(r) = self.pool.alloc() else {
            return;
        };
        let seq = self.next_elog_seq();
        let pkt = self.pool.get_mut(r);
        Self::elog_header(pkt, 0, 0, seq, FM_CNT, 0);
        pkt.lnt = CNT_LNT;
        self.rspq.push_tail(&mut self.pool, r);
        self.sched_quesvc();
    }

    /// Unit-now-available attention datagram.
    fn queue_attention(&mut self, unit: usize) {
        let Some(r) = self.pool.alloc() else {
            return;
        };
        let (ufl, uid, media) = {
            let u = &self.units[unit];
            (u.flags_word(), u.unit_id(unit as u16), u.model.media)
        };
        let pkt = self.pool.get_mut(r);
        pkt.set_u32(W_REFL, 0);
        pkt.d[W_UNIT] = unit as u16;
        pkt.d[W_OPCODE] = OP_AVA;
        pkt.d[UNA_MLUN] = 0;
        pkt.d[UNA_UFL] = ufl;
        pkt.d[UNA_UIDA..UNA_UIDA + 4].copy_from_slice(&uid);
        pkt.set_u32(UNA_MEDL, media);
        pkt.lnt = UNA_LNT;
        pkt.typ = TYP_DAT;
        self.rspq.push_tail(&mut self.pool, r);
        self.sched_quesvc();
    }
}
