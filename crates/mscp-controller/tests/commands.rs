//! Command dispatch: unit state machine, controller characteristics,
//! credits, aborts and attention messages.

mod util;

use mscp_controller::proto::*;
use mscp_controller::unit::{RA82, RX50};
use mscp_storage::MemDisk;
use util::*;

#[test]
fn online_unattached_unit_reports_offline() {
    let (mut ctrl, _irq, mut mem) = new_controller();
    let mut host = Host::new(2);
    host.handshake(&mut ctrl, &mut mem, false);

    host.send(&mut ctrl, &mut mem, &cmd(7, 0, OP_ONL));
    settle(&mut ctrl, &mut mem, 200);

    let (end, ctc) = host.recv(&mut mem).expect("end packet");
    assert_eq!(end.reference(), 7);
    assert_eq!(end.opcode(), OP_ONL | OP_END);
    assert_eq!(end.status(), ST_OFL | SB_OFL_NV);
    assert_eq!((ctc >> ENV_CTC_V_TYP) & 0xF, TYP_SEQ);
}

#[test]
fn online_attached_unit_reports_identity_and_size() {
    let (mut ctrl, _irq, mut mem) = new_controller();
    ctrl.attach_unit(1, RX50, Box::new(MemDisk::new(RX50.lbns as u64)));
    let mut host = Host::new(2);
    host.handshake(&mut ctrl, &mut mem, false);

    host.send(&mut ctrl, &mut mem, &cmd(8, 1, OP_ONL));
    settle(&mut ctrl, &mut mem, 200);

    let (end, _) = host.recv(&mut mem).unwrap();
    assert_eq!(end.status(), ST_SUC);
    assert_eq!(end.get_u32(ONL_SIZL), RX50.lbns);
    assert_eq!(end.get_u32(ONL_MEDL), RX50.media);
    assert_eq!(end.d[ONL_UFL] & UF_RMV, UF_RMV);
    assert_eq!(end.d[ONL_UIDA], 2, "serial encodes the unit number");

    // Second ONLINE is idempotent but flagged.
    host.send(&mut ctrl, &mut mem, &cmd(9, 1, OP_ONL));
    settle(&mut ctrl, &mut mem, 200);
    let (end, _) = host.recv(&mut mem).unwrap();
    assert_eq!(end.status(), ST_SUC | SB_SUC_ON);
}

#[test]
fn get_unit_status_reports_geometry() {
    let (mut ctrl, _irq, mut mem) = new_controller();
    ctrl.attach_unit(2, RA82, Box::new(MemDisk::new(1024)));
    let mut host = Host::new(2);
    host.handshake(&mut ctrl, &mut mem, false);

    host.send(&mut ctrl, &mut mem, &cmd(3, 2, OP_GUS));
    settle(&mut ctrl, &mut mem, 200);

    let (end, _) = host.recv(&mut mem).unwrap();
    assert_eq!(end.status(), ST_AVL, "attached but not online");
    assert_eq!(end.d[GUS_TRK], RA82.sectors);
    assert_eq!(end.d[GUS_GRP], RA82.tpg);
    assert_eq!(end.d[GUS_CYL], RA82.gpc);
    assert_eq!(end.d[GUS_RCTS], RA82.rcts);
    assert_eq!(end.lnt, GUS_LNT);

    // Unattached slot.
    host.send(&mut ctrl, &mut mem, &cmd(4, 3, OP_GUS));
    settle(&mut ctrl, &mut mem, 200);
    let (end, _) = host.recv(&mut mem).unwrap();
    assert_eq!(end.status(), ST_OFL | SB_OFL_NV);
}

#[test]
fn set_controller_characteristics_rejects_bad_version() {
    let (mut ctrl, _irq, mut mem) = new_controller();
    ctrl.attach_unit(0, RX50, Box::new(MemDisk::new(800)));
    let mut host = Host::new(2);
    host.handshake(&mut ctrl, &mut mem, false);

    let mut scc = cmd(1, 0, OP_SCC);
    scc.d[SCC_MSV] = 1;
    scc.d[SCC_CFL] = CF_ATN | CF_THS;
    host.send(&mut ctrl, &mut mem, &scc);
    settle(&mut ctrl, &mut mem, 200);

    let (end, _) = host.recv(&mut mem).unwrap();
    assert_eq!(end.status(), ST_CMD | I_VRSN);
    assert_eq!(end.d[SCC_CFL], 0, "flags must stay unmodified");

    // With flags never applied, attaching a drive raises no attention.
    ctrl.attach_unit(1, RX50, Box::new(MemDisk::new(800)));
    settle(&mut ctrl, &mut mem, 200);
    assert!(host.recv(&mut mem).is_none());
}

#[test]
fn set_controller_characteristics_applies_flags() {
    let (mut ctrl, _irq, mut mem) = new_controller();
    let mut host = Host::new(2);
    host.handshake(&mut ctrl, &mut mem, false);

    let mut scc = cmd(1, 0, OP_SCC);
    scc.d[SCC_CFL] = CF_ATN | CF_THS;
    host.send(&mut ctrl, &mut mem, &scc);
    settle(&mut ctrl, &mut mem, 200);

    let (end, _) = host.recv(&mut mem).unwrap();
    assert_eq!(end.status(), ST_SUC);
    assert_eq!(end.d[SCC_CFL], CF_ATN | CF_THS);
    assert_eq!(end.d[SCC_CIDA + 3], (CTRL_CLASS << 8) | CTRL_MODEL);
    assert_ne!(end.get_u32(SCC_MBCL), 0);
}

#[test]
fn attach_with_attention_enabled_sends_available_datagram() {
    let (mut ctrl, _irq, mut mem) = new_controller();
    let mut host = Host::new(2);
    host.handshake(&mut ctrl, &mut mem, false);

    let mut scc = cmd(1, 0, OP_SCC);
    scc.d[SCC_CFL] = CF_ATN;
    host.send(&mut ctrl, &mut mem, &scc);
    settle(&mut ctrl, &mut mem, 200);
    host.recv(&mut mem).unwrap();

    ctrl.attach_unit(2, RX50, Box::new(MemDisk::new(800)));
    settle(&mut ctrl, &mut mem, 200);

    let (msg, ctc) = host.recv(&mut mem).expect("attention datagram");
    assert_eq!(msg.opcode(), OP_AVA);
    assert_eq!(msg.unit(), 2);
    assert_eq!(msg.get_u32(UNA_MEDL), RX50.media);
    assert_eq!((ctc >> ENV_CTC_V_TYP) & 0xF, TYP_DAT, "attention is a datagram");
    assert_eq!(ctc & ENV_CTC_M_CR, 0, "datagrams carry no credits");
}

#[test]
fn unknown_opcode_is_an_invalid_command() {
    let (mut ctrl, _irq, mut mem) = new_controller();
    let mut host = Host::new(2);
    host.handshake(&mut ctrl, &mut mem, false);

    host.send(&mut ctrl, &mut mem, &cmd(5, 0, 77));
    settle(&mut ctrl, &mut mem, 200);

    let (end, _) = host.recv(&mut mem).unwrap();
    assert_eq!(end.status(), ST_CMD | I_OPCD);
    assert_eq!(end.opcode(), 77 | OP_END);
}

#[test]
fn format_requires_the_info_bit_and_an_offline_unit() {
    let (mut ctrl, _irq, mut mem) = new_controller();
    ctrl.attach_unit(0, RX50, Box::new(MemDisk::new(800)));
    let mut host = Host::new(2);
    host.handshake(&mut ctrl, &mut mem, false);

    let mut fmt = cmd(1, 0, OP_FMT);
    fmt.d[FMT_IH] = 0;
    host.send(&mut ctrl, &mut mem, &fmt);
    settle(&mut ctrl, &mut mem, 200);
    let (end, _) = host.recv(&mut mem).unwrap();
    assert_eq!(end.status(), ST_CMD | I_FMTI);

    fmt.set_u32(W_REFL, 2);
    fmt.d[FMT_IH] = 0x8000;
    host.send(&mut ctrl, &mut mem, &fmt);
    settle(&mut ctrl, &mut mem, 200);
    let (end, _) = host.recv(&mut mem).unwrap();
    assert_eq!(end.status(), ST_SUC);
}

#[test]
fn available_takes_a_unit_offline() {
    let (mut ctrl, _irq, mut mem) = new_controller();
    ctrl.attach_unit(0, RX50, Box::new(MemDisk::new(800)));
    let mut host = Host::new(2);
    host.handshake(&mut ctrl, &mut mem, false);

    host.send(&mut ctrl, &mut mem, &cmd(1, 0, OP_ONL));
    settle(&mut ctrl, &mut mem, 200);
    assert_eq!(host.recv(&mut mem).unwrap().0.status(), ST_SUC);

    host.send(&mut ctrl, &mut mem, &cmd(2, 0, OP_AVL));
    settle(&mut ctrl, &mut mem, 200);
    assert_eq!(host.recv(&mut mem).unwrap().0.status(), ST_SUC);

    // Already available.
    host.send(&mut ctrl, &mut mem, &cmd(3, 0, OP_AVL));
    settle(&mut ctrl, &mut mem, 200);
    assert_eq!(host.recv(&mut mem).unwrap().0.status(), ST_SUC | SB_SUC_ON);

    // And transfers now bounce.
    host.send(&mut ctrl, &mut mem, &cmd(4, 0, OP_RD));
    settle(&mut ctrl, &mut mem, 200);
    assert_eq!(host.recv(&mut mem).unwrap().0.status(), ST_AVL);
}

#[test]
fn credit_grants_are_bounded() {
    let (mut ctrl, _irq, mut mem) = new_controller();
    let mut host = Host::new(2);
    host.handshake(&mut ctrl, &mut mem, false);

    host.send(&mut ctrl, &mut mem, &cmd(1, 0, OP_GCS));
    settle(&mut ctrl, &mut mem, 200);
    let (_, ctc) = host.recv(&mut mem).unwrap();
    // Initial balance 15, +1 for the fetched command, capped at 14.
    assert_eq!(ctc & ENV_CTC_M_CR, 14);

    host.send(&mut ctrl, &mut mem, &cmd(2, 0, OP_GCS));
    settle(&mut ctrl, &mut mem, 200);
    let (_, ctc) = host.recv(&mut mem).unwrap();
    assert_eq!(ctc & ENV_CTC_M_CR, 3, "2 left over plus this command's credit");

    // Steady state: one command in, one credit back.
    for refnum in 3..8u32 {
        host.send(&mut ctrl, &mut mem, &cmd(refnum, 0, OP_GCS));
        settle(&mut ctrl, &mut mem, 200);
        let (_, ctc) = host.recv(&mut mem).unwrap();
        assert_eq!(ctc & ENV_CTC_M_CR, 1);
    }
    assert_eq!(ctrl.credits(), 0);
}

#[test]
fn abort_removes_a_queued_command() {
    let (mut ctrl, _irq, mut mem) = new_controller();
    ctrl.attach_unit(0, RX50, Box::new(MemDisk::new(800)));
    ctrl.set_chunk_bytes(512);
    let mut host = Host::new(3);
    host.handshake(&mut ctrl, &mut mem, false);

    host.send(&mut ctrl, &mut mem, &cmd(1, 0, OP_ONL));
    settle(&mut ctrl, &mut mem, 200);
    host.recv(&mut mem).unwrap();

    // A long transfer keeps the unit busy while two more commands queue up.
    let mut rd = cmd(10, 0, OP_RD);
    rd.set_u32(RW_BCL, 16 * 512);
    rd.set_u32(RW_BAL, 0x8000);
    rd.set_u32(RW_LBNL, 0);
    host.send(&mut ctrl, &mut mem, &rd);
    settle(&mut ctrl, &mut mem, 120);

    let mut rd2 = cmd(11, 0, OP_RD);
    rd2.set_u32(RW_BCL, 512);
    rd2.set_u32(RW_BAL, 0x9000);
    host.send(&mut ctrl, &mut mem, &rd2);
    let mut rd3 = cmd(12, 0, OP_RD);
    rd3.set_u32(RW_BCL, 512);
    rd3.set_u32(RW_BAL, 0x9800);
    host.send(&mut ctrl, &mut mem, &rd3);
    settle(&mut ctrl, &mut mem, 150);

    // Abort the queued (not yet started) command 11.
    let mut abo = cmd(20, 0, OP_ABO);
    abo.set_u32(ABO_REFL, 11);
    host.send(&mut ctrl, &mut mem, &abo);
    settle(&mut ctrl, &mut mem, 5_000);

    let ends = host.recv_all(&mut mem);
    let status_of = |r: u32| {
        ends.iter()
            .find(|(p, _)| p.reference() == r)
            .map(|(p, _)| p.status())
            .unwrap_or_else(|| panic!("no end packet for reference {r}"))
    };
    assert_eq!(status_of(20), ST_SUC, "abort itself succeeds");
    assert_eq!(status_of(11), ST_ABO, "victim completes as aborted");
    assert_eq!(status_of(10), ST_SUC, "in-flight transfer unaffected");
    assert_eq!(status_of(12), ST_SUC, "later queue entries unaffected");
}

#[test]
fn busy_unit_defers_commands_in_fifo_order() {
    let (mut ctrl, _irq, mut mem) = new_controller();
    ctrl.attach_unit(0, RX50, Box::new(MemDisk::new(800)));
    ctrl.set_chunk_bytes(512);
    let mut host = Host::new(3);
    host.handshake(&mut ctrl, &mut mem, false);

    host.send(&mut ctrl, &mut mem, &cmd(1, 0, OP_ONL));
    settle(&mut ctrl, &mut mem, 200);
    host.recv(&mut mem).unwrap();

    let mut rd = cmd(10, 0, OP_RD);
    rd.set_u32(RW_BCL, 8 * 512);
    rd.set_u32(RW_BAL, 0x8000);
    host.send(&mut ctrl, &mut mem, &rd);
    settle(&mut ctrl, &mut mem, 120);

    // While the unit is busy: another transfer, then AVAILABLE.
    let mut rd2 = cmd(11, 0, OP_RD);
    rd2.set_u32(RW_BCL, 512);
    rd2.set_u32(RW_BAL, 0x9000);
    host.send(&mut ctrl, &mut mem, &rd2);
    host.send(&mut ctrl, &mut mem, &cmd(12, 0, OP_AVL));
    settle(&mut ctrl, &mut mem, 5_000);

    let order: Vec<u32> = host
        .recv_all(&mut mem)
        .iter()
        .map(|(p, _)| p.reference())
        .collect();
    assert_eq!(order, vec![10, 11, 12], "completion follows submission order");
}
