//! MSCP / UQSSP wire formats.
//!
//! Everything in this module is guest-visible contract: register handshake
//! bits, ring descriptor bits, the packet envelope, and per-opcode message
//! layouts. Offsets are 16-bit little-endian words relative to the start of
//! the MSCP message (the envelope sits at negative offsets). The unit tests
//! at the bottom pin the exact byte layout of every response the controller
//! builds.

/// Message buffer size in 16-bit words (64 bytes).
pub const PKT_WORDS: usize = 32;
/// Message buffer size in bytes.
pub const PKT_BYTES: usize = PKT_WORDS * 2;

/// Envelope: message length word, bytes, relative to message start.
pub const ENV_LNT_OFF: i64 = -4;
/// Envelope: connection id (15:8) / msg type (7:4) / credits (3:0).
pub const ENV_CTC_OFF: i64 = -2;

/// Sequential message (commands and their end packets).
pub const TYP_SEQ: u16 = 0;
/// Datagram (error logs, attention messages).
pub const TYP_DAT: u16 = 1;

pub const ENV_CTC_V_TYP: u16 = 4;
pub const ENV_CTC_M_CR: u16 = 0x000F;

// SA status bits (controller to host).
pub const SA_ER: u16 = 0x8000; // fatal error
pub const SA_S4: u16 = 0x4000; // init step 4
pub const SA_S3: u16 = 0x2000; // init step 3
pub const SA_S2: u16 = 0x1000; // init step 2
pub const SA_S1: u16 = 0x0800; // init step 1

// Init step 1, controller to host.
pub const SA_S1C_Q22: u16 = 0x0200; // 22-bit addressing
pub const SA_S1C_DI: u16 = 0x0100; // extended diagnostics
pub const SA_S1C_MP: u16 = 0x0040; // mapping supported

// Init step 1, host to controller.
pub const SA_S1H_VL: u16 = 0x8000; // valid
pub const SA_S1H_WR: u16 = 0x4000; // wrap (loopback) mode
pub const SA_S1H_V_CQ: u16 = 11; // command ring length exponent, bits 13:11
pub const SA_S1H_V_RQ: u16 = 8; // response ring length exponent, bits 10:8
pub const SA_S1H_M_Q: u16 = 0x7;
pub const SA_S1H_IE: u16 = 0x0080; // interrupt enable
pub const SA_S1H_VEC: u16 = 0x007F; // interrupt vector (/4)

// Init step 2, host to controller.
pub const SA_S2H_CLO: u16 = 0xFFFE; // ring base low, word aligned
pub const SA_S2H_PI: u16 = 0x0001; // purge interrupts requested

// Init step 3, host to controller.
pub const SA_S3H_PP: u16 = 0x8000; // purge/poll self-test
pub const SA_S3H_CHI: u16 = 0x7FFF; // ring base high

// Init step 4, host to controller.
pub const SA_S4H_LF: u16 = 0x0002; // send last-fail log
pub const SA_S4H_GO: u16 = 0x0001; // go

/// Communications region header, relative to the response ring base.
pub const COMM_QQ_OFF: i64 = -8; // unused
pub const COMM_PI_OFF: i64 = -6; // purge interrupt word
pub const COMM_CI_OFF: i64 = -4; // command ring transition interrupt word
pub const COMM_RI_OFF: i64 = -2; // response ring transition interrupt word
pub const COMM_HDR_BYTES: u64 = 8;

// Ring descriptor bits.
pub const DESC_OWN: u32 = 0x8000_0000; // 1 = controller owns the slot
pub const DESC_F: u32 = 0x4000_0000; // host requests a transition interrupt
pub const DESC_ADDR: u32 = 0x003F_FFFE; // packet address, word aligned

// Message header word indices.
pub const W_REFL: usize = 0;
pub const W_REFH: usize = 1;
pub const W_UNIT: usize = 2;
pub const W_RSVD: usize = 3;
pub const W_OPCODE: usize = 4; // opcode 7:0, end flags 15:8 in responses
pub const W_MOD: usize = 5; // modifiers (commands)
pub const W_STATUS: usize = 5; // status/subcode (responses)

// Opcodes.
pub const OP_ABO: u16 = 1; // abort
pub const OP_GCS: u16 = 2; // get command status
pub const OP_GUS: u16 = 3; // get unit status
pub const OP_SCC: u16 = 4; // set controller characteristics
pub const OP_AVL: u16 = 8; // available
pub const OP_ONL: u16 = 9; // online
pub const OP_SUC: u16 = 10; // set unit characteristics
pub const OP_ACC: u16 = 16; // access (read check, no data transfer)
pub const OP_ERS: u16 = 18; // erase
pub const OP_FLU: u16 = 19; // flush
pub const OP_CMP: u16 = 32; // compare host data
pub const OP_RD: u16 = 33; // read
pub const OP_WR: u16 = 34; // write
pub const OP_FMT: u16 = 47; // format
pub const OP_AVA: u16 = 64; // unit-now-available attention
pub const OP_END: u16 = 0x80; // end packet flag

// End flags (response word 4, bits 15:8).
pub const EF_LOG: u16 = 0x20; // error log generated
pub const EF_SEREX: u16 = 0x40; // serious exception

// Status codes (response word 5, bits 4:0).
pub const ST_SUC: u16 = 0; // success
pub const ST_CMD: u16 = 1; // invalid command
pub const ST_ABO: u16 = 2; // aborted
pub const ST_OFL: u16 = 3; // unit offline
pub const ST_AVL: u16 = 4; // unit available
pub const ST_MFE: u16 = 5; // media format error
pub const ST_WPR: u16 = 6; // write protected
pub const ST_CMP: u16 = 7; // compare error
pub const ST_DAT: u16 = 8; // data error
pub const ST_HST: u16 = 9; // host buffer access error
pub const ST_CNT: u16 = 10; // controller error
pub const ST_DRV: u16 = 11; // drive error
pub const ST_DIA: u16 = 31; // diagnostic

/// Subcode field position within the status word.
pub const ST_V_SUB: u16 = 5;

// Subcodes.
pub const SB_SUC_ON: u16 = 8 << ST_V_SUB; // already online / already available
pub const SB_OFL_NV: u16 = 1 << ST_V_SUB; // no volume mounted
pub const SB_OFL_INOP: u16 = 2 << ST_V_SUB; // unit inoperative
pub const SB_HST_NXM: u16 = 1 << ST_V_SUB; // nonexistent host memory
pub const SB_WPR_SW: u16 = 128 << ST_V_SUB; // software write lock
pub const SB_WPR_HW: u16 = 256 << ST_V_SUB; // hardware write lock

// Invalid-command subcodes: byte offset of the offending field in the
// command message, shifted into the subcode field.
pub const I_OPCD: u16 = 8 << ST_V_SUB; // invalid opcode (byte 8)
pub const I_VRSN: u16 = 12 << ST_V_SUB; // invalid MSCP version (byte 12)
pub const I_BCNT: u16 = 12 << ST_V_SUB; // invalid byte count (byte 12)
pub const I_FMTI: u16 = 16 << ST_V_SUB; // invalid format flags (byte 16)
pub const I_LBN: u16 = 28 << ST_V_SUB; // invalid LBN (byte 28)

// ABO / GCS command payload.
pub const ABO_REFL: usize = 6;
pub const ABO_REFH: usize = 7;
pub const ABO_LNT: u16 = 16;
pub const AVL_LNT: u16 = 12;
pub const GCS_REFL: usize = 6;
pub const GCS_REFH: usize = 7;
pub const GCS_STSL: usize = 8;
pub const GCS_STSH: usize = 9;
pub const GCS_LNT: u16 = 20;

// GET UNIT STATUS end packet.
pub const GUS_MLUN: usize = 6;
pub const GUS_UFL: usize = 7;
pub const GUS_UIDA: usize = 10; // unit id, 4 words
pub const GUS_MEDL: usize = 14;
pub const GUS_MEDH: usize = 15;
pub const GUS_SHUN: usize = 16;
pub const GUS_SHST: usize = 17;
pub const GUS_TRK: usize = 18; // sectors per track
pub const GUS_GRP: usize = 19; // tracks per group
pub const GUS_CYL: usize = 20; // groups per cylinder
pub const GUS_UVER: usize = 21;
pub const GUS_RCTS: usize = 22; // RCT size in blocks
pub const GUS_RBSC: usize = 23; // RBNs/track 7:0, RCT copies 15:8
pub const GUS_LNT: u16 = 48;

// ONLINE / SET UNIT CHARACTERISTICS end packet.
pub const ONL_MLUN: usize = 6;
pub const ONL_UFL: usize = 7;
pub const ONL_UIDA: usize = 10; // unit id, 4 words
pub const ONL_MEDL: usize = 14;
pub const ONL_MEDH: usize = 15;
pub const ONL_SIZL: usize = 18; // unit size in LBNs
pub const ONL_SIZH: usize = 19;
pub const ONL_VSNL: usize = 20; // volume serial number
pub const ONL_VSNH: usize = 21;
pub const ONL_LNT: u16 = 44;

// SET CONTROLLER CHARACTERISTICS.
pub const SCC_MSV: usize = 6; // MSCP version, must be 0
pub const SCC_CFL: usize = 7; // controller flags
pub const SCC_TMO: usize = 8; // host timeout, seconds
pub const SCC_VER: usize = 9; // controller sw/hw version (end)
pub const SCC_CIDA: usize = 10; // controller id, 4 words (end)
pub const SCC_MBCL: usize = 14; // max byte count per transfer (end)
pub const SCC_MBCH: usize = 15;
pub const SCC_LNT: u16 = 32;

// Controller flags (SCC word 7).
pub const CF_ATN: u16 = 0x0080; // attention messages enabled
pub const CF_MSC: u16 = 0x0040; // miscellaneous error logs
pub const CF_OTH: u16 = 0x0020; // other-host error logs
pub const CF_THS: u16 = 0x0010; // this-host error logs
pub const CF_MASK: u16 = CF_ATN | CF_MSC | CF_OTH | CF_THS;

// Unit flags.
pub const UF_RPL: u16 = 0x8000; // controller-initiated bad block replacement
pub const UF_WPH: u16 = 0x2000; // write protect, hardware
pub const UF_WPS: u16 = 0x1000; // write protect, software
pub const UF_RMV: u16 = 0x0080; // removable media

// FORMAT command payload.
pub const FMT_IH: usize = 8; // format flags; bit 15 must be set
pub const FMT_LNT: u16 = 12;

// Data transfer family (RD/WR/CMP/ACC/ERS).
pub const RW_BCL: usize = 6; // byte count
pub const RW_BCH: usize = 7;
pub const RW_BAL: usize = 8; // buffer descriptor: physical address
pub const RW_BAH: usize = 9;
pub const RW_LBNL: usize = 14;
pub const RW_LBNH: usize = 15;
// Working fields live past the transmitted end message and never reach the host.
pub const RW_WBCL: usize = 16; // working byte count
pub const RW_WBCH: usize = 17;
pub const RW_WBAL: usize = 18; // working buffer address
pub const RW_WBAH: usize = 19;
pub const RW_WLBL: usize = 20; // working LBN
pub const RW_WLBH: usize = 21;
pub const RW_LNT: u16 = 32;

// Error log datagrams.
pub const ELP_REFL: usize = 0;
pub const ELP_REFH: usize = 1;
pub const ELP_UNIT: usize = 2;
pub const ELP_SEQ: usize = 3;
pub const ELP_FMT: usize = 4; // format 7:0, flags 15:8
pub const ELP_EVT: usize = 5; // event, status-word encoding
pub const ELP_CIDA: usize = 6; // controller id, 4 words
pub const ELP_CVER: usize = 10; // controller sw/hw version
pub const ELP_MLUN: usize = 11;
pub const ELP_UIDA: usize = 12; // unit id, 4 words
pub const ELP_UVER: usize = 16;

pub const FM_CNT: u16 = 0; // port/controller last failure
pub const FM_BAD: u16 = 1; // host bus error
pub const FM_DSK: u16 = 2; // drive transfer error

pub const CNT_LNT: u16 = 24;
pub const HBE_BADL: usize = 12; // failing host address
pub const HBE_BADH: usize = 13;
pub const HBE_LNT: u16 = 28;
pub const DTE_CYL: usize = 17; // cylinder of failing block
pub const DTE_VSNL: usize = 18;
pub const DTE_VSNH: usize = 19;
pub const DTE_LBNL: usize = 20; // failing LBN
pub const DTE_LBNH: usize = 21;
pub const DTE_LNT: u16 = 44;

// Unit-available attention datagram.
pub const UNA_MLUN: usize = 6;
pub const UNA_UFL: usize = 7;
pub const UNA_UIDA: usize = 10;
pub const UNA_MEDL: usize = 14;
pub const UNA_MEDH: usize = 15;
pub const UNA_LNT: u16 = 32;

// Controller identity.
pub const CTRL_MODEL: u16 = 19;
pub const CTRL_CLASS: u16 = 1;
pub const CTRL_SVER: u16 = 3;
pub const CTRL_HVER: u16 = 0;
/// Device class stamped into unit identifiers (disk class).
pub const UNIT_CLASS: u16 = 2;

/// Pack a media type identifier.
///
/// Layout: bits 31:27 and 26:22 are the two port-class characters, bits
/// 21:17, 16:12 and 11:7 the (up to three) drive-name characters, bits 6:0
/// the drive number. Characters encode A=1..Z=26, blank=0.
pub fn media_id(port: &str, name: &str, number: u32) -> u32 {
    fn ch(c: Option<u8>) -> u32 {
        match c {
            Some(c @ b'A'..=b'Z') => (c - b'A' + 1) as u32,
            _ => 0,
        }
    }
    let p: Vec<u8> = port.bytes().collect();
    let n: Vec<u8> = name.bytes().collect();
    (ch(p.first().copied()) << 27)
        | (ch(p.get(1).copied()) << 22)
        | (ch(n.first().copied()) << 17)
        | (ch(n.get(1).copied()) << 12)
        | (ch(n.get(2).copied()) << 7)
        | (number & 0x7F)
}

/// Fixed-size MSCP message buffer.
///
/// Owned by the packet pool; the ring layer fills it from guest memory on
/// fetch and serializes it (plus the envelope) on send.
#[derive(Debug, Clone, Copy)]
pub struct Packet {
    pub d: [u16; PKT_WORDS],
    /// Message length in bytes for the send path.
    pub lnt: u16,
    /// Envelope message type for the send path.
    pub typ: u16,
}

impl Packet {
    pub fn zeroed() -> Self {
        Self {
            d: [0; PKT_WORDS],
            lnt: 0,
            typ: TYP_SEQ,
        }
    }

    pub fn reference(&self) -> u32 {
        (self.d[W_REFL] as u32) | ((self.d[W_REFH] as u32) << 16)
    }

    pub fn unit(&self) -> u16 {
        self.d[W_UNIT]
    }

    pub fn opcode(&self) -> u16 {
        self.d[W_OPCODE] & 0x00FF
    }

    pub fn modifier(&self) -> u16 {
        self.d[W_MOD]
    }

    pub fn get_u32(&self, lo: usize) -> u32 {
        (self.d[lo] as u32) | ((self.d[lo + 1] as u32) << 16)
    }

    pub fn set_u32(&mut self, lo: usize, val: u32) {
        self.d[lo] = val as u16;
        self.d[lo + 1] = (val >> 16) as u16;
    }

    /// Rewrite the header as an end packet: endcode, flags, status.
    pub fn set_end(&mut self, opcode: u16, flags: u16, status: u16, lnt: u16) {
        self.d[W_OPCODE] = ((opcode | OP_END) & 0x00FF) | (flags << 8);
        self.d[W_STATUS] = status;
        self.lnt = lnt;
        self.typ = TYP_SEQ;
    }

    pub fn end_flags(&self) -> u16 {
        self.d[W_OPCODE] >> 8
    }

    pub fn status(&self) -> u16 {
        self.d[W_STATUS]
    }

    /// Serialize the message region to little-endian bytes (length `lnt`).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.lnt as usize);
        for w in &self.d[..(self.lnt as usize).div_ceil(2)] {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out.truncate(self.lnt as usize);
        out
    }

    /// Deserialize a message region from guest bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut pkt = Packet::zeroed();
        for (i, ch) in bytes.chunks(2).enumerate().take(PKT_WORDS) {
            let lo = ch[0] as u16;
            let hi = *ch.get(1).unwrap_or(&0) as u16;
            pkt.d[i] = lo | (hi << 8);
        }
        pkt.lnt = bytes.len().min(PKT_BYTES) as u16;
        pkt
    }
}
