//! Logical drive units.
//!
//! Up to [`NUM_UNITS`] drive slots, each bound to a static model-table entry
//! (geometry and identity) plus run-time state: unit flags, online state, an
//! optional attached backing store, the in-progress packet and the FIFO of
//! deferred commands.

use mscp_storage::BlockDevice;

use crate::pool::{PktQueue, PktRef};
use crate::proto::{UF_RMV, UF_WPH, UNIT_CLASS};

/// Number of drive slots on the controller.
pub const NUM_UNITS: usize = 4;

/// Static per-model geometry and identity.
///
/// MSCP geometry is hierarchical: `sectors` per track, `tpg` tracks per
/// group, `gpc` groups per cylinder. For these drives a group is a surface
/// and every cylinder has one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveModel {
    pub name: &'static str,
    pub sectors: u16,
    pub tpg: u16,
    pub gpc: u16,
    pub cylinders: u16,
    /// Host-usable LBN count; the remainder of the media holds the RCT.
    pub lbns: u32,
    /// Replacement control table size, blocks.
    pub rcts: u16,
    /// Replacement blocks per track.
    pub rbns: u8,
    /// Copies of the RCT.
    pub rctc: u8,
    pub media: u32,
    pub model: u16,
    /// Static unit flag bits (removable, hardware write protect).
    pub flags: u16,
}

impl DriveModel {
    pub fn total_blocks(&self) -> u64 {
        self.sectors as u64 * self.tpg as u64 * self.gpc as u64 * self.cylinders as u64
    }
}

pub const RX50: DriveModel = DriveModel {
    name: "RX50",
    sectors: 10,
    tpg: 1,
    gpc: 1,
    cylinders: 80,
    lbns: 800,
    rcts: 0,
    rbns: 0,
    rctc: 0,
    media: media_id_const(4, 21, 18, 24, 0, 50), // DU RX50
    model: 7,
    flags: UF_RMV,
};

pub const RD32: DriveModel = DriveModel {
    name: "RD32",
    sectors: 17,
    tpg: 6,
    gpc: 1,
    cylinders: 820,
    lbns: 83236,
    rcts: 4,
    rbns: 1,
    rctc: 8,
    media: media_id_const(4, 21, 18, 4, 0, 32), // DU RD32
    model: 15,
    flags: 0,
};

pub const RD53: DriveModel = DriveModel {
    name: "RD53",
    sectors: 17,
    tpg: 8,
    gpc: 1,
    cylinders: 1024,
    lbns: 138672,
    rcts: 5,
    rbns: 1,
    rctc: 8,
    media: media_id_const(4, 21, 18, 4, 0, 53), // DU RD53
    model: 9,
    flags: 0,
};

pub const RD54: DriveModel = DriveModel {
    name: "RD54",
    sectors: 17,
    tpg: 15,
    gpc: 1,
    cylinders: 1225,
    lbns: 311556,
    rcts: 7,
    rbns: 1,
    rctc: 8,
    media: media_id_const(4, 21, 18, 4, 0, 54), // DU RD54
    model: 13,
    flags: 0,
};

pub const RA82: DriveModel = DriveModel {
    name: "RA82",
    sectors: 57,
    tpg: 15,
    gpc: 1,
    cylinders: 1435,
    lbns: 1216665,
    rcts: 3,
    rbns: 1,
    rctc: 8,
    media: media_id_const(4, 21, 18, 1, 0, 82), // DU RA82
    model: 11,
    flags: 0,
};

/// `media_id` is not const-evaluable over `&str`; this mirror takes the
/// already-encoded 5-bit characters so model tables can live in consts.
const fn media_id_const(p0: u32, p1: u32, n0: u32, n1: u32, n2: u32, num: u32) -> u32 {
    (p0 << 27) | (p1 << 22) | (n0 << 17) | (n1 << 12) | (n2 << 7) | (num & 0x7F)
}

/// Run-time state of one drive slot.
pub struct Unit {
    pub model: DriveModel,
    /// Dynamic unit flags (static model bits plus write locks etc).
    pub flags: u16,
    pub online: bool,
    pub disk: Option<Box<dyn BlockDevice>>,
    /// In-progress packet; non-empty only while a transfer event is scheduled.
    pub cpkt: Option<PktRef>,
    /// Deferred commands awaiting an idle unit, FIFO.
    pub pktq: PktQueue,
    /// Reference number of a command to abort at the next chunk boundary.
    pub abort_ref: Option<u32>,
}

impl Unit {
    pub fn new(model: DriveModel) -> Self {
        Self {
            model,
            flags: model.flags,
            online: false,
            disk: None,
            cpkt: None,
            pktq: PktQueue::new(),
            abort_ref: None,
        }
    }

    pub fn attached(&self) -> bool {
        self.disk.is_some()
    }

    pub fn busy(&self) -> bool {
        self.cpkt.is_some()
    }

    /// Effective flags word, folding in the backend's hardware write lock.
    pub fn flags_word(&self) -> u16 {
        let mut fl = self.flags;
        if self.disk.as_ref().is_some_and(|d| d.write_locked()) {
            fl |= UF_WPH;
        }
        fl
    }

    pub fn write_protected(&self) -> bool {
        self.flags_word() & (UF_WPH | crate::proto::UF_WPS) != 0
    }

    /// 64-bit unit identifier: serial in the low 32 bits, model code in byte
    /// 6, device class in byte 7.
    pub fn unit_id(&self, unit_number: u16) -> [u16; 4] {
        [
            unit_number + 1,
            0,
            0,
            (UNIT_CLASS << 8) | self.model.model,
        ]
    }

    pub fn volume_serial(&self, unit_number: u16) -> u32 {
        unit_number as u32 + 1
    }
}
