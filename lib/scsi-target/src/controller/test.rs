// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::*;
use crate::backend::{BackendIo, InMemoryBackend, LunInfo};
use crate::cmd::cdb::op;
use crate::cmd::{Cdb, ScsiIo, TagType, TaskIo};
use crate::common::{Nexus, Tag};
use crate::frontend::LoopbackPort;
use crate::ha::{HaError, LoopbackLink};
use crate::inject::{InjectKind, InjectMatch};
use crate::reservation::{pr_out_param, sa_out, PrState, PrType};
use crate::sense::{asc, key, ScsiStatus, SenseData, Status};
use crate::task::{TaskAction, TaskResponse};
use crate::test_logger;

const BS: usize = 512;
const TIMEOUT: Duration = Duration::from_secs(5);

/// Backend which parks every request until told to complete them
struct HoldBackend {
    info: LunInfo,
    held: Mutex<Vec<BackendIo>>,
}
impl HoldBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            info: LunInfo {
                block_size: BS as u32,
                num_blocks: 1024,
                read_only: false,
                supports_unmap: true,
            },
            held: Mutex::new(Vec::new()),
        })
    }
    fn held(&self) -> usize {
        self.held.lock().unwrap().len()
    }
    fn held_opcodes(&self) -> Vec<u8> {
        self.held.lock().unwrap().iter().map(|io| io.cdb().opcode()).collect()
    }
    fn release(&self) {
        let ios = std::mem::take(&mut *self.held.lock().unwrap());
        for io in ios {
            io.complete(Status::good());
        }
    }
}
impl Backend for HoldBackend {
    fn info(&self) -> LunInfo {
        self.info
    }
    fn data_submit(&self, io: BackendIo) {
        self.held.lock().unwrap().push(io);
    }
    fn config_write(&self, io: BackendIo) {
        self.held.lock().unwrap().push(io);
    }
    fn config_read(&self, io: BackendIo) {
        self.held.lock().unwrap().push(io);
    }
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn mem_backend(blocks: usize) -> Arc<InMemoryBackend> {
    InMemoryBackend::create(
        vec![0u8; blocks * BS],
        BS as u32,
        false,
        NonZeroUsize::new(2).unwrap(),
    )
    .unwrap()
}

struct Rig {
    ctl: Controller,
    port: Arc<LoopbackPort>,
    pool: Arc<CmdPool>,
}
impl Rig {
    fn new(opts: ControllerOpts) -> Self {
        let ctl = Controller::new(&test_logger(), opts).unwrap();
        let port = Arc::new(LoopbackPort::new());
        ctl.add_port(0, "fe0", port.clone()).unwrap();
        ctl.enable_port(0).unwrap();
        let pool = ctl.create_pool("io", 64, PoolOpts::default()).unwrap();
        Self { ctl, port, pool }
    }
    fn single() -> Self {
        Self::new(ControllerOpts {
            workers: NonZeroUsize::new(2),
            ..Default::default()
        })
    }

    fn lun(&self, id: LunId, backend: Arc<dyn Backend>, opts: LunOpts) {
        self.ctl.add_lun(id, backend, &opts).unwrap();
        self.ctl.enable_lun(id).unwrap();
    }

    fn io(&self, init: u32, lun: LunId, io: ScsiIo) -> PooledCmd {
        let mut cmd = self.pool.acquire().unwrap();
        cmd.setup_scsi(Nexus::new(0, init, 0, lun), io);
        cmd
    }

    fn run(&self, init: u32, lun: LunId, io: ScsiIo) -> Completion {
        self.ctl.submit_wait(self.io(init, lun, io)).unwrap()
    }
    fn run_cdb(
        &self,
        init: u32,
        lun: LunId,
        cdb: Cdb,
        xfer: usize,
    ) -> Completion {
        self.run(init, lun, simple(cdb).with_xfer_len(xfer))
    }

    /// Submit through the port, with completion delivered back to it
    fn send(&self, init: u32, lun: LunId, io: ScsiIo) {
        self.ctl.submit(self.io(init, lun, io)).unwrap();
    }
    fn recv(&self) -> Completion {
        let mut cmd =
            self.port.recv_timeout(TIMEOUT).expect("completion on port");
        Completion::from_cmd(&mut cmd)
    }

    fn task(
        &self,
        init: u32,
        lun: LunId,
        action: TaskAction,
        tag: Tag,
    ) -> Status {
        let mut cmd = self.pool.acquire().unwrap();
        cmd.setup_task(Nexus::new(0, init, 0, lun), TaskIo { action, tag });
        self.ctl.submit_wait(cmd).unwrap().status
    }

    /// Consume pending unit attentions until a TUR succeeds.
    fn clear_ua(&self, init: u32, lun: LunId) {
        for _ in 0..16 {
            let c = self.run_cdb(init, lun, Cdb::test_unit_ready(), 0);
            if c.status.is_good() {
                return;
            }
            assert_eq!(sense_key(&c), Some(key::UNIT_ATTENTION));
        }
        panic!("unit attentions did not clear");
    }

    fn write(
        &self,
        init: u32,
        lun: LunId,
        lba: u32,
        data: Vec<u8>,
    ) -> Completion {
        let blocks = (data.len() / BS) as u16;
        self.run(
            init,
            lun,
            ScsiIo::new(Cdb::write10(lba, blocks), 0, TagType::Simple)
                .with_data(data),
        )
    }
    fn read(&self, init: u32, lun: LunId, lba: u32, blocks: u16) -> Completion {
        self.run_cdb(init, lun, Cdb::read10(lba, blocks), blocks as usize * BS)
    }

    fn pr_out(
        &self,
        init: u32,
        lun: LunId,
        sa: u8,
        kind: u8,
        key: u64,
        sa_key: u64,
    ) -> Status {
        self.run(
            init,
            lun,
            ScsiIo::new(Cdb::pr_out(sa, kind), 0, TagType::Simple)
                .with_data(pr_out_param(key, sa_key)),
        )
        .status
    }
}

fn simple(cdb: Cdb) -> ScsiIo {
    ScsiIo::new(cdb, 0, TagType::Simple)
}

/// One-block WRITE(10) of `fill`
fn write_one(lba: u32, tag: Tag, fill: u8) -> ScsiIo {
    ScsiIo::new(Cdb::write10(lba, 1), tag, TagType::Simple)
        .with_data(vec![fill; BS])
}

fn prefer(primary: bool) -> LunOpts {
    LunOpts { primary, ..Default::default() }
}

fn sense_key(c: &Completion) -> Option<u8> {
    c.status.sense().map(|s| s.key)
}

fn asc_of(c: &Completion) -> Option<(u8, u8)> {
    c.status.sense().map(|s| s.asc_pair())
}

#[test]
fn power_on_ua_reported_once_then_sense_retained() {
    let rig = Rig::single();
    rig.lun(0, mem_backend(16), LunOpts::default());

    let c = rig.run_cdb(1, 0, Cdb::test_unit_ready(), 0);
    assert_eq!(c.status.scsi_status(), Some(ScsiStatus::CheckCondition));
    assert_eq!(asc_of(&c), Some(asc::POWER_ON));

    // The sense of the failed command is available to REQUEST SENSE
    let c = rig.run_cdb(1, 0, Cdb::request_sense(18), 18);
    assert!(c.status.is_good());
    let sense = SenseData::from_fixed(&c.data).unwrap();
    assert_eq!(sense.key, key::UNIT_ATTENTION);
    assert_eq!(sense.asc_pair(), asc::POWER_ON);

    let c = rig.run_cdb(1, 0, Cdb::request_sense(18), 18);
    assert_eq!(SenseData::from_fixed(&c.data).unwrap().key, key::NO_SENSE);
    assert!(rig.run_cdb(1, 0, Cdb::test_unit_ready(), 0).status.is_good());

    // Other initiators still have their own
    let c = rig.run_cdb(2, 0, Cdb::test_unit_ready(), 0);
    assert_eq!(asc_of(&c), Some(asc::POWER_ON));
}

#[test]
fn absent_lun_answers_inquiry_and_report_luns() {
    let rig = Rig::single();
    rig.lun(0, mem_backend(16), LunOpts::default());
    rig.lun(300, mem_backend(16), LunOpts::default());

    let c = rig.run_cdb(1, 7, Cdb::inquiry(36), 36);
    assert!(c.status.is_good());
    // Peripheral qualifier: not connected
    assert_eq!(c.data[0] & 0xe0, 0x60);

    let c = rig.run_cdb(1, 7, Cdb::report_luns(256), 256);
    assert!(c.status.is_good());
    assert_eq!(&c.data[0..4], &[0, 0, 0, 16]);
    assert_eq!(&c.data[8..10], &[0, 0]);
    assert_eq!(&c.data[16..18], &[0x41, 0x2c]);

    let c = rig.run_cdb(1, 7, Cdb::test_unit_ready(), 0);
    assert_eq!(asc_of(&c), Some(asc::LUN_NOT_SUPPORTED));
}

#[test]
fn unknown_opcode_rejected() {
    let rig = Rig::single();
    rig.lun(0, mem_backend(16), LunOpts::default());
    let cdb = Cdb::new(&[0xff, 0, 0, 0, 0, 0]).unwrap();
    let c = rig.run_cdb(1, 0, cdb, 0);
    assert_eq!(asc_of(&c), Some(asc::INVALID_OPCODE));
}

#[test]
fn write_then_read_back() {
    let rig = Rig::single();
    rig.lun(0, mem_backend(64), LunOpts::default());
    rig.clear_ua(1, 0);

    let data: Vec<u8> = (0..4 * BS).map(|i| i as u8).collect();
    assert!(rig.write(1, 0, 8, data.clone()).status.is_good());
    let c = rig.read(1, 0, 8, 4);
    assert!(c.status.is_good());
    assert_eq!(c.data, data);

    let c = rig.read(1, 0, 62, 4);
    assert_eq!(asc_of(&c), Some(asc::LBA_OUT_OF_RANGE));
}

#[test]
fn write_same_and_verify() {
    let rig = Rig::single();
    rig.lun(0, mem_backend(64), LunOpts::default());
    rig.clear_ua(1, 0);

    let c = rig.run(
        1,
        0,
        ScsiIo::new(Cdb::write_same10(4, 3, false), 0, TagType::Simple)
            .with_data(vec![0xee; BS]),
    );
    assert!(c.status.is_good());
    assert_eq!(rig.read(1, 0, 4, 3).data, vec![0xee; 3 * BS]);
    assert_eq!(rig.read(1, 0, 7, 1).data, vec![0; BS]);

    let c = rig.run(
        1,
        0,
        ScsiIo::new(Cdb::write_same10(5, 1, true), 0, TagType::Simple)
            .with_data(vec![0; BS]),
    );
    assert!(c.status.is_good());
    assert_eq!(rig.read(1, 0, 5, 1).data, vec![0; BS]);

    assert!(rig.run_cdb(1, 0, Cdb::verify10(0, 64), 0).status.is_good());
    let c = rig.run_cdb(1, 0, Cdb::verify10(60, 8), 0);
    assert_eq!(asc_of(&c), Some(asc::LBA_OUT_OF_RANGE));
}

#[test]
fn compare_and_write_detects_miscompare() {
    let rig = Rig::single();
    rig.lun(0, mem_backend(16), LunOpts::default());
    rig.clear_ua(1, 0);
    assert!(rig.write(1, 0, 2, vec![0x11; BS]).status.is_good());

    let caw = |expect: u8, new: u8| {
        let mut data = vec![expect; BS];
        data.extend_from_slice(&vec![new; BS]);
        rig.run(
            1,
            0,
            ScsiIo::new(Cdb::compare_and_write(2, 1), 0, TagType::Simple)
                .with_data(data),
        )
    };
    let c = caw(0x22, 0x33);
    let sense = c.status.sense().unwrap();
    assert_eq!(sense.key, key::MISCOMPARE);
    assert_eq!(sense.info, Some(0));
    assert_eq!(rig.read(1, 0, 2, 1).data, vec![0x11; BS]);

    assert!(caw(0x11, 0x33).status.is_good());
    assert_eq!(rig.read(1, 0, 2, 1).data, vec![0x33; BS]);
}

#[test]
fn data_out_fetched_from_port() {
    let ctl_rig = Rig::single();
    ctl_rig.lun(0, mem_backend(16), LunOpts::default());
    let port = Arc::new(LoopbackPort::with_fill(0xa5));
    ctl_rig.ctl.add_port(1, "fe1", port.clone()).unwrap();
    ctl_rig.ctl.enable_port(1).unwrap();

    let mut cmd = ctl_rig.pool.acquire().unwrap();
    cmd.setup_scsi(
        Nexus::new(1, 1, 0, 0),
        ScsiIo::new(Cdb::write10(0, 2), 0, TagType::Simple)
            .with_xfer_len(2 * BS),
    );
    // First command reports the power-on UA
    ctl_rig.ctl.submit(cmd).unwrap();
    let mut done = port.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(done.status.sense().map(|s| s.key), Some(key::UNIT_ATTENTION));
    done.release();

    let mut cmd = ctl_rig.pool.acquire().unwrap();
    cmd.setup_scsi(
        Nexus::new(1, 1, 0, 0),
        ScsiIo::new(Cdb::write10(0, 2), 0, TagType::Simple)
            .with_xfer_len(2 * BS),
    );
    ctl_rig.ctl.submit(cmd).unwrap();
    let done = port.recv_timeout(TIMEOUT).unwrap();
    assert!(done.status.is_good());
    drop(done);

    let c = ctl_rig.read(2, 0, 0, 2);
    let c = if c.status.is_good() { c } else { ctl_rig.read(2, 0, 0, 2) };
    assert_eq!(c.data, vec![0xa5; 2 * BS]);
}

#[test]
fn untagged_overlap_never_reaches_backend() {
    let rig = Rig::single();
    let backend = HoldBackend::new();
    rig.lun(0, backend.clone(), LunOpts::default());
    rig.clear_ua(1, 0);

    rig.send(1, 0, ScsiIo::new(Cdb::read10(0, 1), 0, TagType::Untagged));
    wait_for("first read at backend", || backend.held() == 1);

    rig.send(1, 0, ScsiIo::new(Cdb::read10(100, 1), 0, TagType::Untagged));
    let c = rig.recv();
    assert_eq!(asc_of(&c), Some(asc::OVERLAPPED_COMMANDS));
    assert_eq!(backend.held(), 1);

    backend.release();
    assert!(rig.recv().status.is_good());
}

#[test]
fn duplicate_tag_overlap() {
    let rig = Rig::single();
    let backend = HoldBackend::new();
    rig.lun(0, backend.clone(), LunOpts::default());
    rig.clear_ua(1, 0);

    rig.send(1, 0, ScsiIo::new(Cdb::read10(0, 1), 0x17, TagType::Simple));
    wait_for("first read at backend", || backend.held() == 1);
    rig.send(1, 0, ScsiIo::new(Cdb::read10(8, 1), 0x17, TagType::Simple));
    let c = rig.recv();
    let sense = c.status.sense().unwrap();
    assert_eq!(
        (sense.key, sense.asc, sense.ascq),
        (key::ABORTED_COMMAND, asc::TAGGED_OVERLAPPED, 0x17)
    );

    backend.release();
    assert!(rig.recv().status.is_good());
}

#[test]
fn writes_serialize_by_extent() {
    let rig = Rig::single();
    let backend = HoldBackend::new();
    rig.lun(0, backend.clone(), LunOpts::default());
    rig.clear_ua(1, 0);
    let lun = rig.ctl.lun(0).unwrap();

    let w = |lba: u32, tag: Tag| {
        ScsiIo::new(Cdb::write10(lba, 8), tag, TagType::Simple)
            .with_data(vec![0; 8 * BS])
    };
    rig.send(1, 0, w(0, 1));
    rig.send(1, 0, w(4, 2));
    rig.send(1, 0, w(100, 3));
    wait_for("non-overlapping writes at backend", || backend.held() == 2);
    wait_for("overlapping write blocked", || lun.blocked_len() == 1);
    assert_eq!(lun.ooa_len(), 3);

    backend.release();
    wait_for("blocked write released", || backend.held() == 1);
    backend.release();

    for _ in 0..3 {
        assert!(rig.recv().status.is_good());
    }
    assert_eq!(lun.ooa_len(), 0);
}

#[test]
fn disjoint_writes_from_different_initiators_run_concurrently() {
    let rig = Rig::single();
    let backend = HoldBackend::new();
    rig.lun(0, backend.clone(), LunOpts::default());
    for init in 1..=3 {
        rig.clear_ua(init, 0);
    }
    let lun = rig.ctl.lun(0).unwrap();

    let w = |lba: u32| {
        ScsiIo::new(Cdb::write10(lba, 8), 1, TagType::Simple)
            .with_data(vec![0; 8 * BS])
    };
    rig.send(1, 0, w(0));
    rig.send(2, 0, w(100));
    wait_for("both writes at backend", || backend.held() == 2);
    assert_eq!(lun.blocked_len(), 0);

    // Overlapping the first write, from a third initiator
    rig.send(3, 0, w(7));
    wait_for("overlapping write blocked", || lun.blocked_len() == 1);
    assert_eq!(backend.held(), 2);

    backend.release();
    wait_for("blocked write released", || backend.held() == 1);
    backend.release();
    for _ in 0..3 {
        assert!(rig.recv().status.is_good());
    }
}

#[test]
fn ordered_command_waits_for_predecessors() {
    let rig = Rig::single();
    let backend = HoldBackend::new();
    rig.lun(0, backend.clone(), LunOpts::default());
    rig.clear_ua(1, 0);
    let lun = rig.ctl.lun(0).unwrap();

    rig.send(1, 0, ScsiIo::new(Cdb::read10(0, 1), 1, TagType::Simple));
    rig.send(1, 0, ScsiIo::new(Cdb::read10(500, 1), 2, TagType::Ordered));
    rig.send(1, 0, ScsiIo::new(Cdb::read10(900, 1), 3, TagType::Simple));
    wait_for("first read at backend", || backend.held() == 1);
    wait_for("ordered and successor blocked", || lun.blocked_len() == 2);

    backend.release();
    wait_for("ordered read at backend", || backend.held() == 1);
    assert_eq!(lun.blocked_len(), 1);
    backend.release();
    wait_for("last read at backend", || backend.held() == 1);
    backend.release();
    for _ in 0..3 {
        assert!(rig.recv().status.is_good());
    }
}

#[test]
fn abort_task_hits_only_its_tag() {
    let rig = Rig::single();
    let backend = HoldBackend::new();
    rig.lun(0, backend.clone(), LunOpts::default());
    rig.clear_ua(1, 0);

    rig.send(1, 0, ScsiIo::new(Cdb::read10(0, 1), 10, TagType::Simple));
    rig.send(1, 0, ScsiIo::new(Cdb::read10(8, 1), 11, TagType::Simple));
    wait_for("both reads at backend", || backend.held() == 2);

    let resp = rig.task(1, 0, TaskAction::QueryTask, 10);
    assert_eq!(resp, Status::Task(TaskResponse::Succeeded));
    let resp = rig.task(1, 0, TaskAction::AbortTask, 10);
    assert_eq!(resp, Status::Task(TaskResponse::Complete));
    let resp = rig.task(1, 0, TaskAction::QueryTask, 10);
    assert_eq!(resp, Status::Task(TaskResponse::Complete));

    backend.release();
    let mut results: Vec<(Tag, Status)> = Vec::new();
    for _ in 0..2 {
        let mut cmd = rig.port.recv_timeout(TIMEOUT).unwrap();
        let tag = cmd.scsi().unwrap().tag;
        results.push((tag, Completion::from_cmd(&mut cmd).status));
    }
    results.sort_by_key(|(tag, _)| *tag);
    assert_eq!(results[0], (10, Status::Aborted));
    assert_eq!(results[1], (11, Status::good()));
}

#[test]
fn task_for_missing_lun() {
    let rig = Rig::single();
    rig.lun(0, mem_backend(16), LunOpts::default());
    let resp = rig.task(1, 9, TaskAction::AbortTaskSet, 0);
    assert_eq!(resp, Status::Task(TaskResponse::IncorrectLun));
}

#[test]
fn lun_reset_raises_ua() {
    let rig = Rig::single();
    rig.lun(0, mem_backend(16), LunOpts::default());
    rig.clear_ua(1, 0);
    rig.clear_ua(2, 0);

    let resp = rig.task(1, 0, TaskAction::LunReset, 0);
    assert_eq!(resp, Status::Task(TaskResponse::Complete));
    for init in [1, 2] {
        let c = rig.run_cdb(init, 0, Cdb::test_unit_ready(), 0);
        assert_eq!(sense_key(&c), Some(key::UNIT_ATTENTION));
        let asc = c.status.sense().map(|s| s.asc);
        assert_eq!(asc, Some(asc::RESET_OCCURRED.0));
    }
}

#[test]
fn write_exclusive_reservation_conflicts() {
    let rig = Rig::single();
    rig.lun(0, mem_backend(16), LunOpts::default());
    rig.clear_ua(1, 0);
    rig.clear_ua(2, 0);

    let we = PrType::WriteExclusive.code();
    assert!(rig.pr_out(1, 0, sa_out::REGISTER, 0, 0, 0xabc).is_good());
    assert!(rig.pr_out(1, 0, sa_out::RESERVE, we, 0xabc, 0).is_good());

    let c = rig.write(2, 0, 0, vec![1; BS]);
    assert_eq!(c.status, Status::conflict());
    assert!(rig.read(2, 0, 0, 1).status.is_good());
    assert!(rig.write(1, 0, 0, vec![1; BS]).status.is_good());

    let read_keys = Cdb::pr_in(crate::reservation::sa_in::READ_KEYS, 64);
    let c = rig.run_cdb(2, 0, read_keys, 64);
    assert!(c.status.is_good());
    // One registered key
    assert_eq!(&c.data[4..8], &[0, 0, 0, 8]);
}

#[test]
fn legacy_reserve_blocks_other_initiators() {
    let rig = Rig::single();
    rig.lun(0, mem_backend(16), LunOpts::default());
    rig.clear_ua(1, 0);
    rig.clear_ua(2, 0);

    assert!(rig.run_cdb(1, 0, Cdb::reserve6(), 0).status.is_good());
    assert_eq!(rig.read(2, 0, 0, 1).status, Status::conflict());
    // INQUIRY is allowed against a legacy reservation
    assert!(rig.run_cdb(2, 0, Cdb::inquiry(36), 36).status.is_good());
    assert!(rig.run_cdb(1, 0, Cdb::release6(), 0).status.is_good());
    assert!(rig.read(2, 0, 0, 1).status.is_good());
}

#[test]
fn mode_select_notifies_other_initiators() {
    let rig = Rig::single();
    rig.lun(0, mem_backend(16), LunOpts::default());
    rig.clear_ua(1, 0);
    rig.clear_ua(2, 0);

    let c = rig.run_cdb(1, 0, Cdb::mode_sense6(0x0a, 0, 255), 255);
    assert!(c.status.is_good());
    let mut param = vec![0u8; 4];
    param.extend_from_slice(&c.data[4..]);
    // Set TAS
    param[4 + 5] |= 0x40;
    let len = param.len() as u8;
    let c = rig.run(
        1,
        0,
        simple(Cdb::mode_select6(len)).with_data(param),
    );
    assert!(c.status.is_good());

    assert!(rig.run_cdb(1, 0, Cdb::test_unit_ready(), 0).status.is_good());
    let c = rig.run_cdb(2, 0, Cdb::test_unit_ready(), 0);
    assert_eq!(asc_of(&c), Some(asc::MODE_PARAMS_CHANGED));
}

#[test]
fn injected_error_fires_once() {
    let rig = Rig::single();
    rig.lun(0, mem_backend(16), LunOpts::default());
    rig.clear_ua(1, 0);

    let id = rig
        .ctl
        .inject_error(
            0,
            ErrorInjection {
                matcher: InjectMatch::Read,
                kind: InjectKind::MediumError,
                continuous: false,
            },
        )
        .unwrap();
    assert_eq!(rig.ctl.list_errors(0).unwrap().len(), 1);

    // Only reads match
    assert!(rig.run_cdb(1, 0, Cdb::test_unit_ready(), 0).status.is_good());
    let c = rig.read(1, 0, 0, 1);
    assert_eq!(sense_key(&c), Some(key::MEDIUM_ERROR));
    assert!(rig.read(1, 0, 0, 1).status.is_good());
    assert!(rig.ctl.list_errors(0).unwrap().is_empty());
    assert!(!rig.ctl.delete_error(0, id).unwrap());
}

#[test]
fn sync_policy_never_skips_backend() {
    let rig = Rig::single();
    let backend = HoldBackend::new();
    rig.lun(0, backend.clone(), LunOpts::default());
    rig.clear_ua(1, 0);

    rig.ctl.set_sync_policy(0, SyncPolicy::Never).unwrap();
    let c = rig.run_cdb(1, 0, Cdb::sync_cache10(), 0);
    assert!(c.status.is_good());
    assert_eq!(backend.held(), 0);

    rig.ctl.set_sync_policy(0, SyncPolicy::Always).unwrap();
    rig.send(1, 0, ScsiIo::new(Cdb::sync_cache10(), 0, TagType::Simple));
    wait_for("flush at backend", || backend.held() == 1);
    assert_eq!(backend.held_opcodes(), vec![op::SYNCHRONIZE_CACHE_10]);
    backend.release();
    assert!(rig.recv().status.is_good());
}

#[test]
fn stopped_lun_rejects_media_access() {
    let rig = Rig::single();
    rig.lun(0, mem_backend(16), LunOpts::default());
    rig.clear_ua(1, 0);

    assert!(rig.run_cdb(1, 0, Cdb::start_stop(false), 0).status.is_good());
    let c = rig.read(1, 0, 0, 1);
    assert_eq!(sense_key(&c), Some(key::NOT_READY));
    assert!(rig.run_cdb(1, 0, Cdb::start_stop(true), 0).status.is_good());
    assert!(rig.read(1, 0, 0, 1).status.is_good());
}

#[test]
fn removal_waits_for_outstanding_commands() {
    let rig = Rig::single();
    let backend = HoldBackend::new();
    rig.lun(0, backend.clone(), LunOpts::default());
    rig.lun(1, mem_backend(16), LunOpts::default());
    rig.clear_ua(1, 0);
    rig.clear_ua(1, 1);

    rig.send(1, 0, ScsiIo::new(Cdb::read10(0, 1), 0, TagType::Simple));
    wait_for("read at backend", || backend.held() == 1);

    rig.ctl.remove_lun(0).unwrap();
    assert!(rig.ctl.lun_ids().contains(&0));
    let c = rig.run_cdb(1, 0, Cdb::test_unit_ready(), 0);
    assert_eq!(asc_of(&c), Some(asc::LUN_NOT_SUPPORTED));
    assert!(matches!(rig.ctl.enable_lun(0), Err(CtlError::NoSuchLun(0))));

    backend.release();
    assert!(rig.recv().status.is_good());
    wait_for("LUN reclaimed", || !rig.ctl.lun_ids().contains(&0));

    // Survivors learn the inventory changed
    let c = rig.run_cdb(1, 1, Cdb::test_unit_ready(), 0);
    assert_eq!(asc_of(&c), Some(asc::LUN_INVENTORY_CHANGED));
}

#[test]
fn disabled_port_refuses_submission() {
    let rig = Rig::single();
    rig.lun(0, mem_backend(16), LunOpts::default());
    rig.ctl.disable_port(0).unwrap();
    let cmd = rig.io(1, 0, simple(Cdb::test_unit_ready()));
    assert!(matches!(rig.ctl.submit(cmd), Err(CtlError::PortDisabled(0))));
    assert_eq!(rig.pool.stats().outstanding, 0);

    let cmd = rig.io(1, 0, simple(Cdb::test_unit_ready()));
    let mut bad = cmd;
    bad.nexus.port = 5;
    assert!(matches!(rig.ctl.submit(bad), Err(CtlError::NoSuchPort(5))));
}

#[tokio::test]
async fn async_submission() {
    let rig = Rig::single();
    rig.lun(0, mem_backend(16), LunOpts::default());
    let cmd = rig.io(1, 0, simple(Cdb::test_unit_ready()));
    let c = rig.ctl.submit_async(cmd).await.unwrap();
    assert_eq!(asc_of(&c), Some(asc::POWER_ON));
    let cmd = rig.io(1, 0, simple(Cdb::test_unit_ready()));
    assert!(rig.ctl.submit_async(cmd).await.unwrap().status.is_good());
}

#[test]
fn pools_are_named_and_unique() {
    let rig = Rig::single();
    assert!(matches!(
        rig.ctl.create_pool("io", 4, PoolOpts::default()),
        Err(CtlError::PoolExists(_))
    ));
    assert_eq!(rig.ctl.pool("io").unwrap().capacity(), 64);
    rig.ctl.destroy_pool("io").unwrap();
    assert!(matches!(rig.ctl.pool("io"), Err(CtlError::NoSuchPool(_))));
}

// HA pairs

struct Pair {
    a: Rig,
    b: Rig,
    link_a: Arc<LoopbackLink>,
}

/// Two controllers joined by a link which is not yet up on either side
fn pair_unlinked(mode: HaMode, segment: usize) -> Pair {
    let opts = |name: &str, id: u32| ControllerOpts {
        name: name.to_string(),
        workers: NonZeroUsize::new(2),
        ha_id: id,
        ha_mode: mode,
        xfer_segment: segment,
        ..Default::default()
    };
    let a = Rig::new(opts("a", 0));
    let b = Rig::new(opts("b", 1));

    // Both controllers see the same LUN; `a` is its preferred primary
    a.lun(0, mem_backend(64), prefer(true));
    b.lun(0, mem_backend(64), prefer(false));

    let (link_a, link_b) = LoopbackLink::pair();
    a.ctl.ha_attach(link_a.clone());
    b.ctl.ha_attach(link_b.clone());
    link_a.attach(a.ctl.ha_receiver()).unwrap();
    link_b.attach(b.ctl.ha_receiver()).unwrap();

    Pair { a, b, link_a }
}

fn pair(mode: HaMode, segment: usize) -> Pair {
    let p = pair_unlinked(mode, segment);
    p.a.ctl.ha_link_up().unwrap();
    p.b.ctl.ha_link_up().unwrap();
    assert_eq!(p.a.ctl.ha_role(), HaRole::Paired);
    assert!(p.a.ctl.lun(0).unwrap().is_primary());
    assert!(!p.b.ctl.lun(0).unwrap().is_primary());
    p
}

#[test]
fn serialize_only_admits_on_primary() {
    let p = pair(HaMode::SerializeOnly, DEFAULT_XFER_SEGMENT);
    p.b.clear_ua(1, 0);
    p.a.clear_ua(2, 0);

    let data = vec![0x3c; 2 * BS];
    assert!(p.b.write(1, 0, 4, data.clone()).status.is_good());
    // Execution stayed on the originator
    assert_eq!(p.b.read(1, 0, 4, 2).data, data);
    assert_eq!(p.a.read(2, 0, 4, 2).data, vec![0; 2 * BS]);

    let primary = p.a.ctl.lun(0).unwrap();
    wait_for("proxies retired", || primary.ooa_len() == 0);
    assert_eq!(p.b.ctl.lun(0).unwrap().ooa_len(), 0);
}

#[test]
fn serialize_only_blocks_across_controllers() {
    let p = pair(HaMode::SerializeOnly, DEFAULT_XFER_SEGMENT);
    let backend = HoldBackend::new();
    p.a.ctl.remove_lun(0).unwrap();
    wait_for("LUN removed", || p.a.ctl.lun_ids().is_empty());
    p.a.lun(0, backend.clone(), prefer(true));
    p.a.clear_ua(1, 0);
    p.b.clear_ua(2, 0);

    p.a.send(1, 0, write_one(0, 1, 0));
    wait_for("write at backend", || backend.held() == 1);

    // Overlapping write from the partner waits on the primary
    p.b.send(2, 0, write_one(0, 1, 1));
    let primary = p.a.ctl.lun(0).unwrap();
    wait_for("proxy blocked", || primary.blocked_len() == 1);
    assert!(primary.ooa_snapshot().iter().any(|e| e.from_partner && e.blocked));
    assert!(p.b.port.recv_timeout(Duration::from_millis(20)).is_none());

    backend.release();
    assert!(p.a.recv().status.is_good());
    assert!(p.b.recv().status.is_good());
    wait_for("proxy retired", || primary.ooa_len() == 0);
}

#[test]
fn full_transfer_executes_on_primary() {
    // Segments smaller than the transfer force several round trips
    let p = pair(HaMode::FullTransfer, 700);
    p.b.clear_ua(1, 0);
    p.a.clear_ua(2, 0);

    let data: Vec<u8> = (0..4 * BS).map(|i| (i * 7) as u8).collect();
    assert!(p.b.write(1, 0, 10, data.clone()).status.is_good());

    // Data landed on the primary's backend
    assert_eq!(p.a.read(2, 0, 10, 4).data, data);
    // Reads through the secondary are served from the primary, too
    let c = p.b.read(1, 0, 10, 4);
    assert!(c.status.is_good());
    assert_eq!(c.data, data);

    let c = p.b.read(1, 0, 62, 4);
    assert_eq!(asc_of(&c), Some(asc::LBA_OUT_OF_RANGE));
}

#[test]
fn full_transfer_pulls_data_from_port() {
    let p = pair(HaMode::FullTransfer, 256);
    p.b.clear_ua(1, 0);
    p.a.clear_ua(2, 0);

    let fill = Arc::new(LoopbackPort::with_fill(0x77));
    p.b.ctl.add_port(3, "fe3", fill.clone()).unwrap();
    p.b.ctl.enable_port(3).unwrap();
    let submit = || {
        let mut cmd = p.b.pool.acquire().unwrap();
        cmd.setup_scsi(
            Nexus::new(3, 1, 0, 0),
            ScsiIo::new(Cdb::write10(20, 2), 0, TagType::Simple)
                .with_xfer_len(2 * BS),
        );
        p.b.ctl.submit(cmd).unwrap();
        fill.recv_timeout(TIMEOUT).unwrap()
    };
    let first = submit();
    let done = if first.status.is_good() { first } else { submit() };
    assert!(done.status.is_good());
    drop(done);
    assert_eq!(p.a.read(2, 0, 20, 2).data, vec![0x77; 2 * BS]);
}

#[test]
fn reservations_mirror_to_partner() {
    let p = pair(HaMode::SerializeOnly, DEFAULT_XFER_SEGMENT);
    p.a.clear_ua(1, 0);
    p.b.clear_ua(2, 0);

    let we = PrType::WriteExclusive.code();
    assert!(p.a.pr_out(1, 0, sa_out::REGISTER, 0, 0, 0x55).is_good());
    assert!(p.a.pr_out(1, 0, sa_out::RESERVE, we, 0x55, 0).is_good());

    let primary = p.a.ctl.lun(0).unwrap();
    let secondary = p.b.ctl.lun(0).unwrap();
    wait_for("reservation mirrored", || {
        secondary.pr_generation() == primary.pr_generation()
            && secondary.pr_state() == primary.pr_state()
    });

    // The secondary enforces it locally
    assert_eq!(p.b.write(2, 0, 0, vec![9; BS]).status, Status::conflict());
}

#[test]
fn reservation_survives_either_link_up_order() {
    for primary_first in [true, false] {
        let p = pair_unlinked(HaMode::SerializeOnly, DEFAULT_XFER_SEGMENT);
        p.a.clear_ua(1, 0);

        // Established while both controllers are still single
        let we = PrType::WriteExclusive.code();
        assert!(p.a.pr_out(1, 0, sa_out::REGISTER, 0, 0, 0x77).is_good());
        assert!(p.a.pr_out(1, 0, sa_out::RESERVE, we, 0x77, 0).is_good());

        let (first, second) =
            if primary_first { (&p.a, &p.b) } else { (&p.b, &p.a) };
        first.ctl.ha_link_up().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        second.ctl.ha_link_up().unwrap();

        let primary = p.a.ctl.lun(0).unwrap();
        let secondary = p.b.ctl.lun(0).unwrap();
        wait_for("reservation synced", || {
            secondary.pr_state() == primary.pr_state()
                && secondary.pr_generation() == primary.pr_generation()
        });
        assert_eq!(
            secondary.pr_state(),
            PrState::Reserved {
                holder: Nexus::new(0, 1, 0, 0).iid().unwrap(),
                kind: PrType::WriteExclusive,
            }
        );

        p.b.clear_ua(2, 0);
        let c = p.b.write(2, 0, 0, vec![3; BS]);
        assert_eq!(c.status, Status::conflict(), "{primary_first}");
        assert!(p.b.read(2, 0, 0, 1).status.is_good());
    }
}

#[test]
fn blocked_command_replayed_on_link_up_skips_ua() {
    let p = pair_unlinked(HaMode::SerializeOnly, DEFAULT_XFER_SEGMENT);
    let backend = HoldBackend::new();
    p.b.ctl.remove_lun(0).unwrap();
    wait_for("LUN removed", || p.b.ctl.lun_ids().is_empty());
    p.b.lun(0, backend.clone(), prefer(false));
    p.b.clear_ua(1, 0);

    // Single: `b` admits both itself, and the second write blocks
    p.b.send(1, 0, write_one(0, 1, 1));
    wait_for("first write at backend", || backend.held() == 1);
    p.b.send(1, 0, write_one(0, 2, 2));
    let lun = p.b.ctl.lun(0).unwrap();
    wait_for("second write blocked", || lun.blocked_len() == 1);

    p.a.ctl.ha_link_up().unwrap();
    p.b.ctl.ha_link_up().unwrap();
    assert!(!lun.is_primary());

    // The blocked write is replayed through the new primary
    wait_for("replayed write at backend", || backend.held() == 2);
    backend.release();
    for _ in 0..2 {
        let c = p.b.recv();
        assert!(c.status.is_good(), "unexpected {:?}", c.status);
    }

    // Fresh commands still see the access-state change
    let c = p.b.run_cdb(1, 0, Cdb::test_unit_ready(), 0);
    assert_eq!(sense_key(&c), Some(key::UNIT_ATTENTION));
}

#[test]
fn link_loss_fails_over() {
    let p = pair(HaMode::SerializeOnly, DEFAULT_XFER_SEGMENT);
    p.b.clear_ua(1, 0);

    p.link_a.sever();
    wait_for("a single", || p.a.ctl.ha_role() == HaRole::Single);
    wait_for("b single", || p.b.ctl.ha_role() == HaRole::Single);
    let lun = p.b.ctl.lun(0).unwrap();
    assert!(lun.is_primary());

    let c = p.b.run_cdb(1, 0, Cdb::test_unit_ready(), 0);
    assert_eq!(asc_of(&c), Some(asc::ASYM_ACCESS_CHANGED));
    assert!(p.b.write(1, 0, 0, vec![2; BS]).status.is_good());
    assert_eq!(lun.ooa_len(), 0);

    // Idempotent
    p.b.ctl.ha_link_down();
    assert!(lun.is_primary());
}

#[test]
fn forwarded_command_resubmitted_on_failover() {
    let p = pair(HaMode::SerializeOnly, DEFAULT_XFER_SEGMENT);
    let backend = HoldBackend::new();
    p.a.ctl.remove_lun(0).unwrap();
    wait_for("LUN removed", || p.a.ctl.lun_ids().is_empty());
    p.a.lun(0, backend.clone(), prefer(true));
    p.a.clear_ua(1, 0);
    p.b.clear_ua(2, 0);

    // Occupy the block range on the primary, so the partner's write waits
    p.a.send(1, 0, write_one(0, 1, 0));
    wait_for("write at backend", || backend.held() == 1);
    p.b.send(2, 0, write_one(0, 1, 1));
    let primary = p.a.ctl.lun(0).unwrap();
    wait_for("proxy blocked", || primary.blocked_len() == 1);

    p.link_a.sever();
    wait_for("b single", || p.b.ctl.ha_role() == HaRole::Single);

    // The partner runs its write locally; the orphaned proxy is dropped
    assert!(p.b.recv().status.is_good());
    wait_for("proxy purged", || primary.blocked_len() == 0);
    backend.release();
    assert!(p.a.recv().status.is_good());
    wait_for("primary drained", || primary.ooa_len() == 0);
}

#[test]
fn task_management_mirrors_to_partner() {
    let p = pair(HaMode::SerializeOnly, DEFAULT_XFER_SEGMENT);
    p.a.clear_ua(1, 0);
    p.a.clear_ua(2, 0);
    p.b.clear_ua(2, 0);

    assert_eq!(
        p.a.task(1, 0, TaskAction::LunReset, 0),
        Status::Task(TaskResponse::Complete)
    );
    let secondary = p.b.ctl.lun(0).unwrap();
    let iid = Nexus::new(0, 2, 0, 0).iid().unwrap();
    wait_for("reset mirrored", || !secondary.pending_ua(iid).is_empty());
    let c = p.b.run_cdb(2, 0, Cdb::test_unit_ready(), 0);
    assert_eq!(c.status.sense().map(|s| s.asc), Some(asc::RESET_OCCURRED.0));
}

#[test]
fn state_sync_reports_partner_ports() {
    let p = pair(HaMode::SerializeOnly, DEFAULT_XFER_SEGMENT);
    wait_for("port sync", || p.b.ctl.ha_partner_ports() == vec![(0, true)]);
    wait_for("port sync", || p.a.ctl.ha_partner_ports() == vec![(0, true)]);
}

#[test]
fn ha_lock_is_exclusive_across_pair() {
    let p = pair(HaMode::SerializeOnly, DEFAULT_XFER_SEGMENT);

    let held = p.a.ctl.ha_lock(TIMEOUT).unwrap();
    assert!(matches!(
        p.b.ctl.ha_lock(Duration::from_millis(50)),
        Err(CtlError::Ha(HaError::LockTimeout))
    ));
    drop(held);

    let held = p.b.ctl.ha_lock(TIMEOUT).unwrap();
    drop(held);
    let _held = p.a.ctl.ha_lock(TIMEOUT).unwrap();
}

#[test]
fn ha_lock_granted_locally_when_single() {
    let rig = Rig::single();
    let held = rig.ctl.ha_lock(TIMEOUT).unwrap();
    assert!(matches!(
        rig.ctl.ha_lock(Duration::from_millis(10)),
        Err(CtlError::Ha(HaError::LockTimeout))
    ));
    drop(held);
    assert!(rig.ctl.ha_lock(TIMEOUT).is_ok());
    assert!(matches!(
        rig.ctl.ha_link_up(),
        Err(CtlError::Ha(HaError::NotPaired))
    ));
}
