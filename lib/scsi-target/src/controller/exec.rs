// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command flow through a worker: precheck and admission, execution, and
//! completion.

use std::sync::MutexGuard;

use byteorder::{BigEndian, ByteOrder};
use slog::{debug, error, info, warn};

use super::Shared;
use crate::backend::{self, BackendIo, Operation};
use crate::cmd::cdb::{self, op, CmdClass, CmdEntry, CoreOp, Extent, Route};
use crate::cmd::{CmdFlags, Command, OpFlags, Payload, Reply, TaskIo};
use crate::common::{Iid, Nexus, Tag};
use crate::frontend::DatamoveIo;
use crate::ha::msg::PrMirror;
use crate::ha::HaMode;
use crate::lun::mode::PageControl;
use crate::lun::pending::UaBits;
use crate::lun::{Blocked, Lun, LunFlags, LunState, OoaSeq, SyncPolicy};
use crate::pool::PooledCmd;
use crate::probes;
use crate::reservation::{self, sa_in, PrError, PrOutAction};
use crate::sense::{asc, key, ScsiStatus, SenseData, Status};
use crate::serialize::{self, Action};
use crate::task::{Scope, TaskAction, TaskResponse};

/// Length of the UNMAP parameter list header
const UNMAP_HDR_LEN: usize = 8;
/// Length of one UNMAP block descriptor
const UNMAP_DESC_LEN: usize = 16;

impl LunState {
    /// Keep the sense of a CHECK CONDITION for a later REQUEST SENSE.
    fn record_sense(&mut self, cmd: &Command) {
        if cmd.is_from_partner() {
            return;
        }
        if let (
            Some(iid),
            Status::Scsi {
                status: ScsiStatus::CheckCondition,
                sense: Some(sense),
            },
        ) = (cmd.nexus.iid(), &cmd.status)
        {
            self.pending.set_sense(iid, sense.clone());
        }
    }
}

fn internal_failure() -> Status {
    Status::check(SenseData::internal_failure())
}

/// Status for a command which admission refused outright
fn refusal(action: Action) -> Option<Status> {
    match action {
        Action::Block | Action::Pass | Action::Skip => None,
        Action::Overlap => {
            Some(Status::check(SenseData::overlapped_commands()))
        }
        Action::OverlapTag(tag) => {
            Some(Status::check(SenseData::tagged_overlapped(tag)))
        }
        Action::Error => {
            Some(Status::check(SenseData::invalid_field_in_cdb(0, None)))
        }
    }
}

/// Build REPORT LUNS parameter data for `luns`.
pub(crate) fn report_luns(luns: &[u32], alloc: usize) -> Vec<u8> {
    let mut buf = vec![0u8; 8 + 8 * luns.len()];
    BigEndian::write_u32(&mut buf[0..4], (8 * luns.len()) as u32);
    for (ent, id) in buf[8..].chunks_exact_mut(8).zip(luns.iter()) {
        if *id < 256 {
            // Peripheral device addressing
            ent[1] = *id as u8;
        } else {
            // Flat space addressing
            ent[0] = 0x40 | ((*id >> 8) as u8 & 0x3f);
            ent[1] = *id as u8;
        }
    }
    buf.truncate(alloc);
    buf
}

/// Decode an UNMAP parameter list.
fn parse_unmap(
    param: &[u8],
    num_blocks: u64,
) -> Result<Vec<Extent>, SenseData> {
    if param.len() < UNMAP_HDR_LEN {
        return Ok(Vec::new());
    }
    let desc_len = BigEndian::read_u16(&param[2..4]) as usize;
    let body = &param[UNMAP_HDR_LEN..];
    let count = desc_len.min(body.len()) / UNMAP_DESC_LEN;

    let mut extents = Vec::with_capacity(count);
    for desc in body.chunks_exact(UNMAP_DESC_LEN).take(count) {
        let lba = BigEndian::read_u64(&desc[0..8]);
        let len = BigEndian::read_u32(&desc[8..12]) as u64;
        if len == 0 {
            continue;
        }
        match lba.checked_add(len) {
            Some(end) if end <= num_blocks => {}
            _ => return Err(SenseData::lba_out_of_range()),
        }
        extents.push(Extent { lba, len });
    }
    Ok(extents)
}

/// Apply a PERSISTENT RESERVE OUT action, along with its effects on the rest
/// of the LUN.
fn apply_pr(
    state: &mut LunState,
    iid: Iid,
    action: &PrOutAction,
) -> Result<(Option<PrMirror>, Vec<(Blocked, Action)>), PrError> {
    let effects = state.pr.apply(iid, action)?;
    state.raise_ua(&effects.ua);
    let mut released = Vec::new();
    if !effects.aborted.is_empty() {
        state.abort_initiators(iid, &effects.aborted);
        released = serialize::check_blocked(state);
    }
    let mirror = effects.changed.then(|| PrMirror {
        snapshot: state.pr.snapshot(),
        ua: effects.ua.iter().map(|(i, bits)| (*i, bits.bits())).collect(),
        requester: Some(iid),
        aborted: effects.aborted.clone(),
    });
    Ok((mirror, released))
}

impl Shared {
    pub(crate) fn process_incoming(&self, cmd: PooledCmd) {
        match &cmd.payload {
            Payload::Scsi(_) => self.scsi_precheck(cmd),
            Payload::Task(task) => {
                let task = *task;
                self.run_task(cmd, task)
            }
            Payload::Reservation(_) => self.run_reservation(cmd),
            Payload::Partner(_) => self.partner_precheck(cmd),
            Payload::Free => {
                error!(self.log, "free command submitted";
                    "id" => u64::from(cmd.id()));
            }
        }
    }

    /// Terminate a command which holds no place in an OOA list.
    fn complete(&self, mut cmd: PooledCmd, status: Status) {
        cmd.status = status;
        self.reply(cmd);
    }

    /// Checks applied to a new command, in order, before it is entered in
    /// the OOA list of its LUN.
    fn scsi_precheck(&self, mut cmd: PooledCmd) {
        let Some(iid) = cmd.nexus.iid() else {
            warn!(self.log, "command from invalid nexus";
                "nexus" => ?cmd.nexus);
            return self.complete(cmd, internal_failure());
        };
        let Some(cdb) = cmd.cdb().copied() else {
            return self.complete(cmd, internal_failure());
        };
        let Some(entry) = cdb::lookup(cdb.opcode()) else {
            let status = Status::check(SenseData::invalid_opcode());
            return self.complete(cmd, status);
        };
        if cdb.len() < entry.min_len as usize {
            return self.complete(
                cmd,
                Status::check(SenseData::invalid_field_in_cdb(0, None)),
            );
        }

        let lun = match self.lun(cmd.nexus.lun) {
            Some(lun) if lun.is_enabled() => lun,
            _ => return self.no_lun(cmd, entry),
        };
        let mut state = lun.lock();
        if state.flags.intersects(LunFlags::DISABLED | LunFlags::INVALID) {
            drop(state);
            return self.no_lun(cmd, entry);
        }

        let mut early = None;
        if !entry.flags.contains(OpFlags::NO_UA)
            && !cmd.flags.contains(CmdFlags::RESUBMITTED)
        {
            early = state.pending.take_ua(iid).map(Status::check);
        }
        let early = early
            .or_else(|| state.gate(entry.flags).map(Status::check))
            .or_else(|| {
                let access = state.pr.check_access(iid, entry.flags);
                access.err().map(PrError::status)
            });
        if let Some(status) = early {
            cmd.status = status;
            state.record_sense(&cmd);
            drop(state);
            return self.reply(cmd);
        }

        if !state.flags.contains(LunFlags::PRIMARY) {
            cmd.flags |= CmdFlags::SENT_TO_PARTNER;
            state.ooa_insert(&mut cmd);
            drop(state);
            return self.ha_forward(cmd);
        }

        let seq = state.ooa_insert(&mut cmd);
        let action = serialize::admit(&state, seq);
        self.admitted(&lun, state, seq, cmd, action);
    }

    /// Carry out an admission verdict for a command just entered in the OOA
    /// list.
    fn admitted(
        &self,
        lun: &Lun,
        mut state: MutexGuard<'_, LunState>,
        seq: OoaSeq,
        mut cmd: PooledCmd,
        action: Action,
    ) {
        let verdict: &'static str = action.into();
        probes::cmd_admit!(|| (lun.id, u64::from(cmd.id()), verdict));

        let Some(status) = refusal(action) else {
            if action == Action::Block {
                probes::cmd_block!(|| (lun.id, u64::from(cmd.id())));
                state.block(seq, cmd);
            } else {
                drop(state);
                self.dispatch.push_rtr(cmd);
            }
            return;
        };

        info!(lun.log, "command refused at admission";
            "nexus" => ?cmd.nexus,
            "verdict" => verdict);
        state.ooa_remove(seq);
        cmd.ooa_seq = None;
        cmd.status = status;
        state.record_sense(&cmd);
        drop(state);
        self.reply(cmd);
    }

    /// Admission of a proxy for a command which arrived on the partner.
    pub(crate) fn partner_precheck(&self, mut proxy: PooledCmd) {
        let lun = match self.lun(proxy.nexus.lun) {
            Some(lun) if lun.is_enabled() => lun,
            _ => {
                return self.complete(
                    proxy,
                    Status::check(SenseData::lun_not_supported()),
                )
            }
        };
        let mut state = lun.lock();
        // The owner's reservation state is authoritative
        let denied = match (proxy.nexus.iid(), proxy.opcode()) {
            (Some(iid), Some(opcode)) => cdb::lookup(opcode).and_then(|e| {
                state.pr.check_access(iid, e.flags).err().map(PrError::status)
            }),
            _ => Some(internal_failure()),
        };
        if let Some(status) = denied {
            drop(state);
            return self.complete(proxy, status);
        }
        let seq = state.ooa_insert(&mut proxy);
        let action = serialize::admit(&state, seq);
        self.admitted(&lun, state, seq, proxy, action);
    }

    /// Commands addressed to a LUN which is absent (or disabled) are
    /// answered by the core when they can be, and refused otherwise.
    fn no_lun(&self, mut cmd: PooledCmd, entry: &CmdEntry) {
        let alloc = cmd.cdb().map(|c| c.xfer_len()).unwrap_or(0);
        let data = match entry.opcode {
            op::INQUIRY => backend::inquiry_absent(alloc),
            op::REPORT_LUNS => report_luns(&self.visible_luns(), alloc),
            op::REQUEST_SENSE => {
                let sense = SenseData::lun_not_supported();
                let mut buf = sense.to_fixed().to_vec();
                buf.truncate(alloc);
                buf
            }
            _ => {
                return self.complete(
                    cmd,
                    Status::check(SenseData::lun_not_supported()),
                )
            }
        };
        if let Some(io) = cmd.scsi_mut() {
            io.data = data;
        }
        self.complete(cmd, Status::good());
    }

    /// Run an admitted command.
    pub(crate) fn execute(&self, mut cmd: PooledCmd) {
        if !cmd.status.is_pending() {
            return self.process_done(cmd);
        }
        let Some(lun) = self.lun(cmd.nexus.lun) else {
            error!(self.log, "ready command for missing LUN";
                "nexus" => ?cmd.nexus);
            return self.complete(cmd, internal_failure());
        };
        if let Some(seq) = cmd.ooa_seq {
            if lun.lock().is_aborted(seq) {
                return self.process_done(cmd);
            }
        }
        if cmd.is_from_partner() {
            if !self.is_paired() {
                cmd.flags |= CmdFlags::PARTNER_DONE;
                return self.process_done(cmd);
            }
            if self.ha_mode == HaMode::SerializeOnly {
                return self.partner_ready(cmd);
            }
        }

        let Some((cdb, xfer_len)) = cmd.scsi().map(|io| (io.cdb, io.xfer_len))
        else {
            cmd.status = internal_failure();
            return self.process_done(cmd);
        };
        let Some(entry) = cdb::lookup(cdb.opcode()) else {
            cmd.status = Status::check(SenseData::invalid_opcode());
            return self.process_done(cmd);
        };
        probes::cmd_exec!(|| (lun.id, u64::from(cmd.id()), cdb.opcode()));

        let injected = lun.lock().injections.check(cdb.opcode());
        if let Some(status) = injected {
            debug!(lun.log, "injected error"; "opcode" => cdb.opcode());
            cmd.status = status;
            return self.process_done(cmd);
        }

        if entry.flags.contains(OpFlags::DATA_OUT)
            && !cmd.flags.contains(CmdFlags::DATA_MOVED)
            && xfer_len > 0
        {
            return if cmd.is_from_partner() {
                self.partner_pull(cmd)
            } else {
                self.port_datamove(cmd)
            };
        }

        match entry.route {
            Route::Core(op) => self.run_core(&lun, cmd, op),
            Route::Data => self.run_data(&lun, cmd, entry),
            Route::ConfigWrite => self.run_config_write(&lun, cmd),
            Route::ConfigRead => {
                let op = Operation::Inquire;
                self.to_backend(&lun, cmd, op, Route::ConfigRead)
            }
        }
    }

    /// Ask the originating port for the data-out of a command.
    pub(crate) fn port_datamove(&self, mut cmd: PooledCmd) {
        match self.port(cmd.nexus.port) {
            Some(port) => {
                port.datamove(DatamoveIo::new(cmd, self.this.clone()))
            }
            None => {
                warn!(self.log, "datamove for unknown port";
                    "nexus" => ?cmd.nexus);
                cmd.status = internal_failure();
                if let Some(io) = cmd.scsi_mut() {
                    io.pending_pull = None;
                }
                self.process_done(cmd);
            }
        }
    }

    /// A port has finished (or failed) moving data-out.
    pub(crate) fn datamove_done(&self, cmd: PooledCmd) {
        let pulled = cmd.scsi().map(|io| io.pending_pull.is_some());
        if pulled == Some(true) {
            return self.pull_ready(cmd);
        }
        if cmd.status.is_pending() {
            self.dispatch.push_rtr(cmd);
        } else {
            self.dispatch.push_done(cmd);
        }
    }

    fn fail(&self, mut cmd: PooledCmd, sense: SenseData) {
        cmd.status = Status::check(sense);
        self.process_done(cmd);
    }

    fn to_backend(
        &self,
        lun: &Lun,
        mut cmd: PooledCmd,
        op: Operation,
        route: Route,
    ) {
        cmd.flags |= CmdFlags::ACTIVE;
        let io = BackendIo::new(cmd, op, self.this.clone());
        match route {
            Route::Data => lun.backend.data_submit(io),
            Route::ConfigWrite => lun.backend.config_write(io),
            Route::ConfigRead => lun.backend.config_read(io),
            Route::Core(_) => {
                error!(lun.log, "core command routed to backend");
                io.complete(internal_failure());
            }
        }
    }

    fn run_data(&self, lun: &Lun, cmd: PooledCmd, entry: &CmdEntry) {
        let info = lun.info();
        let Some(cdb) = cmd.cdb().copied() else {
            return self.fail(cmd, SenseData::internal_failure());
        };
        let ext = match cdb::decode_extent(&cdb) {
            Ok(Some(ext)) => ext,
            Ok(None) => return self.complete_good(cmd),
            Err(_) => {
                return self.fail(cmd, SenseData::invalid_field_in_cdb(0, None))
            }
        };
        if ext.end() >= info.num_blocks {
            return self.fail(cmd, SenseData::lba_out_of_range());
        }

        let bs = info.block_size as u64;
        let (lba, blocks) = (ext.lba, ext.len);
        let (op, need) = match cdb.opcode() {
            _ if entry.class == CmdClass::Write && info.read_only => {
                return self.fail(cmd, SenseData::write_protected());
            }
            op::VERIFY_10 | op::VERIFY_16 if cdb.byte(1) & 0x06 != 0 => {
                return self
                    .fail(cmd, SenseData::invalid_field_in_cdb(1, Some(1)));
            }
            op::VERIFY_10 | op::VERIFY_16 => {
                (Operation::Verify { lba, blocks }, 0)
            }
            op::WRITE_SAME_10 | op::WRITE_SAME_16
                if cdb.byte(1) & 0x08 != 0 =>
            {
                if !info.supports_unmap {
                    return self
                        .fail(cmd, SenseData::invalid_field_in_cdb(1, Some(3)));
                }
                let op = Operation::Unmap(vec![ext]);
                return self.to_backend(lun, cmd, op, Route::ConfigWrite);
            }
            op::WRITE_SAME_10 | op::WRITE_SAME_16 => {
                (Operation::WriteSame { lba, blocks }, bs)
            }
            op::COMPARE_AND_WRITE => (
                Operation::CompareAndWrite { lba, blocks },
                blocks.saturating_mul(bs).saturating_mul(2),
            ),
            _ if entry.class == CmdClass::Write => {
                (Operation::Write { lba, blocks }, blocks.saturating_mul(bs))
            }
            _ => (Operation::Read { lba, blocks }, 0),
        };
        if (cmd.data().len() as u64) < need {
            return self.fail(cmd, SenseData::phase_error());
        }
        self.to_backend(lun, cmd, op, Route::Data);
    }

    fn complete_good(&self, mut cmd: PooledCmd) {
        cmd.status = Status::good();
        self.process_done(cmd);
    }

    fn run_config_write(&self, lun: &Lun, cmd: PooledCmd) {
        let info = lun.info();
        let Some(cdb) = cmd.cdb().copied() else {
            return self.fail(cmd, SenseData::internal_failure());
        };
        let op = match cdb.opcode() {
            op::SYNCHRONIZE_CACHE_10 | op::SYNCHRONIZE_CACHE_16 => {
                if lun.lock().sync_policy == SyncPolicy::Never {
                    return self.complete_good(cmd);
                }
                Operation::Flush
            }
            op::START_STOP_UNIT => {
                Operation::StartStop { start: cdb.byte(4) & 0x1 != 0 }
            }
            op::FORMAT_UNIT if info.read_only => {
                return self.fail(cmd, SenseData::write_protected())
            }
            op::FORMAT_UNIT => Operation::Format,
            op::UNMAP if !info.supports_unmap => {
                return self.fail(cmd, SenseData::invalid_opcode())
            }
            op::UNMAP if info.read_only => {
                return self.fail(cmd, SenseData::write_protected())
            }
            op::UNMAP => match parse_unmap(cmd.data(), info.num_blocks) {
                Ok(extents) => Operation::Unmap(extents),
                Err(sense) => return self.fail(cmd, sense),
            },
            _ => return self.fail(cmd, SenseData::invalid_opcode()),
        };
        self.to_backend(lun, cmd, op, Route::ConfigWrite);
    }

    /// Commands completed by the core itself, against LUN state.
    fn run_core(&self, lun: &Lun, mut cmd: PooledCmd, op: CoreOp) {
        let Some(cdb) = cmd.cdb().copied() else {
            return self.fail(cmd, SenseData::internal_failure());
        };
        let iid = cmd.nexus.iid();
        let alloc = cdb.xfer_len();

        if op == CoreOp::ReportLuns {
            let data = report_luns(&self.visible_luns(), alloc);
            return self.finish_core(cmd, Ok(data));
        }
        let read_only = lun.info().read_only;

        let mut mirror = None;
        let mut released = Vec::new();
        let result: Result<Vec<u8>, Status> = {
            let mut state = lun.lock();
            match (op, iid) {
                (CoreOp::TestUnitReady, _) => Ok(Vec::new()),
                (CoreOp::RequestSense, Some(iid)) => {
                    let sense = state
                        .pending
                        .take_sense(iid)
                        .or_else(|| state.pending.take_ua(iid))
                        .unwrap_or_else(|| {
                            SenseData::new(key::NO_SENSE, asc::NO_ADDITIONAL)
                        });
                    let mut buf = sense.to_fixed().to_vec();
                    buf.truncate(alloc);
                    Ok(buf)
                }
                (CoreOp::ModeSense, _) => {
                    let ten = cdb.opcode() == op::MODE_SENSE_10;
                    let page = cdb.byte(2) & 0x3f;
                    let pc = PageControl::from_cdb(cdb.byte(2) >> 6);
                    state
                        .mode
                        .sense(page, pc, ten, read_only, alloc)
                        .map_err(Status::check)
                }
                (CoreOp::ModeSelect, Some(iid)) => {
                    let ten = cdb.opcode() == op::MODE_SELECT_10;
                    if alloc == 0 {
                        Ok(Vec::new())
                    } else {
                        match state.mode.select(cmd.data(), ten) {
                            Ok(true) => {
                                state.pending.establish_all_except(
                                    iid,
                                    UaBits::MODE_CHANGE,
                                );
                                Ok(Vec::new())
                            }
                            Ok(false) => Ok(Vec::new()),
                            Err(sense) => Err(Status::check(sense)),
                        }
                    }
                }
                (CoreOp::Reserve | CoreOp::Release, Some(iid)) => {
                    let res = if op == CoreOp::Reserve {
                        state.pr.legacy_reserve(iid)
                    } else {
                        state.pr.legacy_release(iid)
                    };
                    match res {
                        Ok(()) => {
                            mirror = Some(PrMirror {
                                snapshot: state.pr.snapshot(),
                                ua: Vec::new(),
                                requester: Some(iid),
                                aborted: Vec::new(),
                            });
                            Ok(Vec::new())
                        }
                        Err(e) => Err(e.status()),
                    }
                }
                (CoreOp::PrIn, _) => {
                    let data = match cdb.service_action() {
                        sa_in::READ_KEYS => Some(state.pr.read_keys()),
                        sa_in::READ_RESERVATION => {
                            Some(state.pr.read_reservation())
                        }
                        sa_in::REPORT_CAPABILITIES => {
                            Some(state.pr.report_capabilities())
                        }
                        _ => None,
                    };
                    match data {
                        Some(mut buf) => {
                            buf.truncate(alloc);
                            Ok(buf)
                        }
                        None => Err(Status::check(
                            SenseData::invalid_field_in_cdb(1, Some(4)),
                        )),
                    }
                }
                (CoreOp::PrOut, Some(iid)) => {
                    match reservation::parse_pr_out(&cdb, cmd.data()) {
                        Err(sense) => Err(Status::check(sense)),
                        Ok(action) => match apply_pr(&mut state, iid, &action) {
                            Ok((m, r)) => {
                                debug!(lun.log, "reservation action";
                                    "iid" => ?iid,
                                    "action" => ?action,
                                    "generation" => state.pr.generation());
                                mirror = m;
                                released = r;
                                Ok(Vec::new())
                            }
                            Err(e) => Err(e.status()),
                        },
                    }
                }
                (_, None) => {
                    Err(internal_failure())
                }
                (CoreOp::ReportLuns, _) => unreachable!("answered above"),
            }
        };

        if let Some(mirror) = mirror {
            self.ha_mirror_pr(lun.id, mirror);
        }
        self.dispatch_released(released);
        self.finish_core(cmd, result);
    }

    fn finish_core(&self, mut cmd: PooledCmd, result: Result<Vec<u8>, Status>) {
        match result {
            Ok(data) => {
                if let Some(io) = cmd.scsi_mut() {
                    io.data = data;
                }
                cmd.status = Status::good();
            }
            Err(status) => cmd.status = status,
        }
        self.process_done(cmd);
    }

    /// Requeue commands released from a blocked list.
    pub(crate) fn dispatch_released(&self, released: Vec<(Blocked, Action)>) {
        for (Blocked { mut cmd, .. }, action) in released {
            let lun = cmd.nexus.lun;
            probes::cmd_unblock!(|| (lun, u64::from(cmd.id())));
            match refusal(action) {
                None => self.dispatch.push_rtr(cmd),
                Some(status) => {
                    cmd.status = status;
                    self.dispatch.push_done(cmd);
                }
            }
        }
    }

    /// Retire a command from its LUN and deliver its status.
    pub(crate) fn process_done(&self, mut cmd: PooledCmd) {
        cmd.flags.remove(CmdFlags::ACTIVE);
        let mut released = Vec::new();
        let mut reclaim = None;
        let lun_id = cmd.nexus.lun;

        if let Some(lun) = self.lun(lun_id) {
            let mut state = lun.lock();
            if let Some(seq) = cmd.ooa_seq.take() {
                if let Some(ent) = state.ooa_remove(seq) {
                    if ent.is_aborted() {
                        cmd.flags |= ent.flags
                            & (CmdFlags::ABORT | CmdFlags::ABORT_STATUS);
                        let tas = ent.flags.contains(CmdFlags::ABORT_STATUS);
                        cmd.status = if tas {
                            Status::task_aborted()
                        } else {
                            Status::Aborted
                        };
                    }
                }
                released = serialize::check_blocked(&mut state);
            }
            state.record_sense(&cmd);
            if cmd.status.is_good()
                && cmd.opcode() == Some(op::START_STOP_UNIT)
            {
                let start = cmd.cdb().map(|c| c.byte(4) & 0x1 != 0);
                match start {
                    Some(true) => state.flags.remove(LunFlags::STOPPED),
                    Some(false) => state.flags.insert(LunFlags::STOPPED),
                    None => {}
                }
            }
            if state.is_reclaimable() {
                reclaim = Some(lun.clone());
            }
        }

        self.dispatch_released(released);
        if let Some(lun) = reclaim {
            self.reclaim_lun(lun);
        }

        let queue_ns = cmd
            .time_queued
            .map(|t| t.elapsed().as_nanos() as u64)
            .unwrap_or(0);
        probes::cmd_done!(|| (
            lun_id,
            u64::from(cmd.id()),
            cmd.status.probe_code(),
            queue_ns
        ));
        self.reply(cmd);
    }

    /// Deliver a terminal status to whoever is waiting for it.
    pub(crate) fn reply(&self, mut cmd: PooledCmd) {
        if cmd.is_from_partner() {
            return self.reply_partner(cmd);
        }
        if cmd.flags.contains(CmdFlags::SENT_TO_PARTNER)
            && !cmd.flags.contains(CmdFlags::PARTNER_DONE)
        {
            self.notify_primary(&cmd);
        }
        match std::mem::take(&mut cmd.reply) {
            Reply::Port => match self.port(cmd.nexus.port) {
                Some(port) => port.done(cmd),
                None => {
                    warn!(self.log, "completion for unknown port";
                        "nexus" => ?cmd.nexus);
                }
            },
            Reply::Sync(waiter) => waiter.post(cmd),
            Reply::Async(tx) => {
                // The submitter may have given up waiting
                let _ = tx.send(cmd);
            }
        }
    }

    fn run_task(&self, mut cmd: PooledCmd, task: TaskIo) {
        let resp = match cmd.nexus.iid() {
            None => TaskResponse::FunctionRejected,
            Some(iid) => self.apply_task(cmd.nexus, iid, task.action, task.tag),
        };
        let mirrored = !matches!(
            task.action,
            TaskAction::QueryTask | TaskAction::QueryTaskSet
        );
        if mirrored && resp == TaskResponse::Complete {
            self.ha_mirror_task(cmd.nexus, task.action, task.tag);
        }
        cmd.status = Status::Task(resp);
        self.reply(cmd);
    }

    /// Carry out a task management function against the LUN(s) it
    /// addresses.
    pub(crate) fn apply_task(
        &self,
        nexus: Nexus,
        iid: Iid,
        action: TaskAction,
        tag: Tag,
    ) -> TaskResponse {
        let luns = if action.is_target_wide() {
            self.luns()
        } else {
            match self.lun(nexus.lun) {
                Some(lun) if lun.is_enabled() => vec![lun],
                _ => return TaskResponse::IncorrectLun,
            }
        };
        let name: &'static str = action.into();
        info!(self.log, "task management";
            "action" => name,
            "nexus" => ?nexus,
            "tag" => tag);

        let mut resp = TaskResponse::Complete;
        for lun in luns {
            let mut state = lun.lock();
            match action {
                TaskAction::AbortTask => {
                    state.abort_task(iid, tag);
                }
                TaskAction::AbortTaskSet => {
                    state.abort_scope(Some(iid), Scope::Initiator(iid));
                }
                TaskAction::ClearTaskSet => {
                    state.abort_scope(Some(iid), Scope::All);
                }
                TaskAction::LunReset => {
                    state.reset(Some(iid), UaBits::LUN_RESET);
                }
                TaskAction::TargetReset => {
                    state.reset(Some(iid), UaBits::TARG_RESET);
                }
                TaskAction::BusReset => {
                    state.reset(Some(iid), UaBits::BUS_RESET);
                }
                TaskAction::ItNexusReset => {
                    state.nexus_reset(iid);
                }
                TaskAction::QueryTask => {
                    if state.query_task(iid, tag) {
                        resp = TaskResponse::Succeeded;
                    }
                }
                TaskAction::QueryTaskSet => {
                    if state.query_task_set(iid) {
                        resp = TaskResponse::Succeeded;
                    }
                }
            }
            let released = serialize::check_blocked(&mut state);
            drop(state);
            self.dispatch_released(released);
        }
        resp
    }

    /// Reservation actions submitted through the management plane, applied
    /// without passing through admission.
    fn run_reservation(&self, mut cmd: PooledCmd) {
        let Payload::Reservation(action) = &cmd.payload else {
            return;
        };
        let action = action.clone();
        let (Some(iid), Some(lun)) = (cmd.nexus.iid(), self.lun(cmd.nexus.lun))
        else {
            return self
                .complete(cmd, Status::check(SenseData::lun_not_supported()));
        };

        let res = apply_pr(&mut lun.lock(), iid, &action);
        cmd.status = match res {
            Ok((mirror, released)) => {
                if let Some(mirror) = mirror {
                    self.ha_mirror_pr(lun.id, mirror);
                }
                self.dispatch_released(released);
                Status::good()
            }
            Err(e) => e.status(),
        };
        debug!(lun.log, "reservation action applied";
            "iid" => ?iid,
            "action" => ?action,
            "status" => ?cmd.status);
        self.reply(cmd);
    }
}
