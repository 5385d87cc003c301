// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Coordination between the two controllers of an HA pair.
//!
//! Each LUN has one primary controller, which performs admission for every
//! command addressed to it, whichever controller the command arrived on.
//! A command arriving on the other (originating) controller is entered in
//! its local OOA list and forwarded with [HaBody::Serialize]; the primary
//! admits a proxy for it.  What happens next depends on the [HaMode]:
//!
//! - Serialize-only: once admitted, the primary answers with
//!   [HaBody::ReadyToRun] and the originator executes the command itself,
//!   reporting back with [HaBody::Finish] so the primary can retire the
//!   proxy.
//! - Full transfer: the primary executes the proxy, pulling data-out from
//!   (and pushing data-in to) the originator segment by segment with
//!   [HaBody::Datamove], then sends [HaBody::Finish] with the status.
//!
//! Losing the link returns the controller to single mode: it becomes primary
//! for every LUN, silently retires proxies for the partner, and resubmits
//! its own forwarded commands locally.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use slog::{debug, error, info, warn};
use thiserror::Error;

use crate::cmd::{CmdFlags, CmdId, DataDir};
use crate::common::{LunId, Nexus, PortId, Tag};
use crate::controller::Shared;
use crate::lun::pending::UaBits;
use crate::lun::{Blocked, LunFlags};
use crate::pool::PooledCmd;
use crate::probes;
use crate::sense::Status;
use crate::serialize;
use crate::task::TaskAction;

pub mod link;
pub mod msg;

pub use link::{HaLink, LoopbackLink};
use msg::{HaBody, HaMsg, LockMsg, PrMirror, SyncState, WireScsi};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HaError {
    /// No partner link attached, or not in paired mode
    #[error("not paired with an HA partner")]
    NotPaired,

    #[error("HA link is down")]
    LinkDown,

    #[error("failed to encode HA message: {0}")]
    Encode(String),

    #[error("failed to decode HA message: {0}")]
    Decode(String),

    #[error("timed out waiting for the HA lock")]
    LockTimeout,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HaMode {
    /// Only admission crosses the link; execution stays with the
    /// controller a command arrived on
    #[default]
    SerializeOnly,
    /// Execution happens on the primary, with data crossing the link
    FullTransfer,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum HaRole {
    #[default]
    Single,
    Paired,
}

#[derive(Default)]
struct LockState {
    /// A local caller holds the lock
    held: bool,
    /// A local caller has asked the partner for the lock
    requesting: bool,
    /// The partner has granted our request
    granted: bool,
    /// We granted the lock to the partner
    partner_holds: bool,
    /// The partner asked while we held (or were entitled to) the lock
    deferred: bool,
}

#[derive(Default)]
pub(crate) struct HaState {
    pub(crate) role: HaRole,
    pub(crate) link: Option<Arc<dyn HaLink>>,
    /// Commands forwarded to the primary, by their own [CmdId]
    sent: HashMap<CmdId, PooledCmd>,
    /// Proxies waiting on the partner, by the partner's [CmdId]
    proxies: HashMap<CmdId, PooledCmd>,
    lock: LockState,
    pub(crate) partner_ports: Vec<(PortId, bool)>,
}

/// Inbound side of the HA link: the link hands every message it receives
/// to [HaReceiver::deliver].
#[derive(Clone)]
pub struct HaReceiver {
    ctl: Weak<Shared>,
}
impl HaReceiver {
    pub(crate) fn new(ctl: Weak<Shared>) -> Self {
        Self { ctl }
    }

    pub fn deliver(&self, buf: &[u8]) {
        let Some(ctl) = self.ctl.upgrade() else {
            return;
        };
        let msg = match HaMsg::decode(buf) {
            Ok(msg) => msg,
            Err(e) => {
                error!(ctl.log, "dropping HA message"; "error" => %e);
                return;
            }
        };
        probes::ha_recv!(|| (msg.lun, msg.kind()));
        match msg.body {
            HaBody::Lock(lock) => ctl.recv_lock(lock),
            HaBody::Sync(sync) => ctl.recv_sync(sync),
            _ if ctl.is_paired() => ctl.dispatch.push_msg(msg),
            _ => {
                debug!(ctl.log, "HA message while unpaired";
                    "msg" => msg.kind());
            }
        }
    }

    /// The link has failed underneath us
    pub fn link_lost(&self) {
        if let Some(ctl) = self.ctl.upgrade() {
            ctl.link_down();
        }
    }
}

/// Holder of the lock shared with the HA partner.  Released on drop.
pub struct HaLockGuard {
    ctl: Weak<Shared>,
}
impl Drop for HaLockGuard {
    fn drop(&mut self) {
        if let Some(ctl) = self.ctl.upgrade() {
            ctl.ha_unlock();
        }
    }
}

impl Shared {
    pub(crate) fn is_paired(&self) -> bool {
        self.ha.lock().unwrap().role == HaRole::Paired
    }

    /// Send a message to the partner.  A link failure drops us to single
    /// mode before the error is returned.
    pub(crate) fn ha_send(
        &self,
        lun: LunId,
        body: HaBody,
    ) -> Result<(), HaError> {
        let link = {
            let ha = self.ha.lock().unwrap();
            if ha.role != HaRole::Paired {
                return Err(HaError::NotPaired);
            }
            ha.link.clone().ok_or(HaError::NotPaired)?
        };
        let msg = HaMsg::new(lun, body);
        let kind = msg.kind();
        probes::ha_send!(|| (lun, kind));

        let res = msg.encode().and_then(|buf| link.send(&buf));
        if let Err(e) = &res {
            warn!(self.log, "HA send failed"; "msg" => kind, "error" => %e);
            if *e == HaError::LinkDown {
                self.link_down();
            }
        }
        res
    }

    fn park_sent(&self, cmd: PooledCmd) -> Option<PooledCmd> {
        let mut ha = self.ha.lock().unwrap();
        if ha.role != HaRole::Paired {
            return Some(cmd);
        }
        ha.sent.insert(cmd.id(), cmd);
        None
    }
    fn take_sent(&self, id: CmdId) -> Option<PooledCmd> {
        self.ha.lock().unwrap().sent.remove(&id)
    }
    fn park_proxy(&self, proxy: PooledCmd) -> Option<PooledCmd> {
        let Some(remote) = proxy.remote_id() else {
            return Some(proxy);
        };
        let mut ha = self.ha.lock().unwrap();
        if ha.role != HaRole::Paired {
            return Some(proxy);
        }
        ha.proxies.insert(remote, proxy);
        None
    }
    fn take_proxy(&self, id: CmdId) -> Option<PooledCmd> {
        self.ha.lock().unwrap().proxies.remove(&id)
    }

    fn vanished(&self, what: &str, id: CmdId) {
        error!(self.log, "HA message references unknown command";
            "msg" => what, "id" => u64::from(id));
    }

    /// Retire a proxy whose partner can no longer hear about it.
    fn drop_proxy(&self, mut proxy: PooledCmd) {
        proxy.flags |= CmdFlags::PARTNER_DONE;
        self.process_done(proxy);
    }

    // Originator side

    /// Hand admission of a command to the LUN's primary.
    pub(crate) fn ha_forward(&self, cmd: PooledCmd) {
        let Some(io) = cmd.scsi().map(WireScsi::from) else {
            error!(self.log, "forwarding a non-SCSI command";
                "id" => u64::from(cmd.id()));
            return self.resubmit_local(cmd);
        };
        let id = cmd.id();
        let lun = cmd.nexus.lun;
        let body = HaBody::Serialize { id, nexus: cmd.nexus, io };
        if let Some(cmd) = self.park_sent(cmd) {
            return self.resubmit_local(cmd);
        }
        // On failure the link is torn down, which resubmits the command
        let _ = self.ha_send(lun, body);
    }

    /// Run a command which had been forwarded (or blocked awaiting
    /// forwarding) through local admission from the start.
    pub(crate) fn resubmit_local(&self, mut cmd: PooledCmd) {
        cmd.flags.remove(CmdFlags::SENT_TO_PARTNER | CmdFlags::PARTNER_DONE);
        cmd.flags.insert(CmdFlags::RESUBMITTED);
        if let (Some(seq), Some(lun)) = (cmd.ooa_seq, self.lun(cmd.nexus.lun))
        {
            let mut state = lun.lock();
            if state.is_aborted(seq) {
                drop(state);
                return self.process_done(cmd);
            }
            state.ooa_remove(seq);
            let released = serialize::check_blocked(&mut state);
            drop(state);
            self.dispatch_released(released);
        }
        cmd.ooa_seq = None;
        let data_out = cmd.data_dir() == DataDir::Out;
        if let Some(io) = cmd.scsi_mut() {
            io.pending_pull = None;
            if !data_out {
                io.data.clear();
            }
        }
        self.enqueue_incoming(&mut cmd);
        self.dispatch.push_incoming(cmd);
    }

    /// A data-out transfer requested by the partner has reached us.
    pub(crate) fn pull_ready(&self, mut cmd: PooledCmd) {
        let Some((offset, len)) =
            cmd.scsi_mut().and_then(|io| io.pending_pull.take())
        else {
            return self.dispatch.push_rtr(cmd);
        };
        let failure = (!cmd.status.is_pending()).then(|| cmd.status.clone());
        self.send_segment(cmd, offset, len, failure);
    }

    fn send_segment(
        &self,
        cmd: PooledCmd,
        offset: u64,
        len: u32,
        status: Option<Status>,
    ) {
        let id = cmd.id();
        let lun = cmd.nexus.lun;
        let data = status.is_none().then(|| {
            let buf = cmd.data();
            let start = (offset as usize).min(buf.len());
            let end = (start + len as usize).min(buf.len());
            buf[start..end].to_vec()
        });
        if let Some(cmd) = self.park_sent(cmd) {
            return self.resubmit_local(cmd);
        }
        let _ = self
            .ha_send(lun, HaBody::DatamoveDone { id, offset, data, status });
    }

    /// Report completion of a locally executed, partner-admitted command
    /// so the primary can retire its proxy.
    pub(crate) fn notify_primary(&self, cmd: &PooledCmd) {
        if !self.is_paired() {
            return;
        }
        let _ = self.ha_send(
            cmd.nexus.lun,
            HaBody::Finish {
                id: cmd.id(),
                status: cmd.status.clone(),
                to_primary: true,
            },
        );
    }

    // Primary side

    fn recv_serialize(&self, id: CmdId, nexus: Nexus, io: WireScsi) {
        let mut proxy = match self.partner_pool.acquire() {
            Ok(proxy) => proxy,
            Err(e) => {
                warn!(self.log, "no proxy for partner command"; "error" => %e);
                let _ = self.ha_send(
                    nexus.lun,
                    HaBody::Finish {
                        id,
                        status: Status::busy(),
                        to_primary: false,
                    },
                );
                return;
            }
        };
        proxy.setup_partner(nexus, id, io.into());
        self.enqueue_incoming(&mut proxy);
        self.partner_precheck(proxy);
    }

    /// Admission granted to a proxy in serialize-only mode: let the
    /// originator run it.
    pub(crate) fn partner_ready(&self, proxy: PooledCmd) {
        let Some(remote) = proxy.remote_id() else {
            return self.drop_proxy(proxy);
        };
        let lun = proxy.nexus.lun;
        if let Some(proxy) = self.park_proxy(proxy) {
            return self.drop_proxy(proxy);
        }
        let _ = self.ha_send(lun, HaBody::ReadyToRun { id: remote });
    }

    /// Ask the originator for the next segment of data-out.
    pub(crate) fn partner_pull(&self, proxy: PooledCmd) {
        let (Some(remote), Some(io)) = (proxy.remote_id(), proxy.scsi()) else {
            return self.drop_proxy(proxy);
        };
        let offset = io.data.len() as u64;
        let remaining = io.xfer_len.saturating_sub(io.data.len());
        let len = remaining.min(self.xfer_segment) as u32;
        let lun = proxy.nexus.lun;
        if let Some(proxy) = self.park_proxy(proxy) {
            return self.drop_proxy(proxy);
        }
        let _ = self.ha_send(
            lun,
            HaBody::Datamove { id: remote, offset, len, data: None },
        );
    }

    /// Deliver the terminal state of a proxy to the partner.
    pub(crate) fn reply_partner(&self, proxy: PooledCmd) {
        if proxy.flags.contains(CmdFlags::PARTNER_DONE) || !self.is_paired() {
            // Dropping returns the proxy to the partner pool
            return;
        }
        if self.ha_mode == HaMode::FullTransfer
            && proxy.data_dir() == DataDir::In
            && !proxy.data().is_empty()
        {
            return self.push_segment(proxy, 0);
        }
        self.finish_partner(proxy);
    }

    fn finish_partner(&self, proxy: PooledCmd) {
        let Some(remote) = proxy.remote_id() else {
            return;
        };
        let _ = self.ha_send(
            proxy.nexus.lun,
            HaBody::Finish {
                id: remote,
                status: proxy.status.clone(),
                to_primary: false,
            },
        );
    }

    fn push_segment(&self, proxy: PooledCmd, offset: u64) {
        let Some(remote) = proxy.remote_id() else {
            return;
        };
        let buf = proxy.data();
        let start = offset as usize;
        if start >= buf.len() {
            return self.finish_partner(proxy);
        }
        let end = (start + self.xfer_segment).min(buf.len());
        let seg = buf[start..end].to_vec();
        let lun = proxy.nexus.lun;
        if let Some(proxy) = self.park_proxy(proxy) {
            return self.drop_proxy(proxy);
        }
        let _ = self.ha_send(
            lun,
            HaBody::Datamove {
                id: remote,
                offset,
                len: seg.len() as u32,
                data: Some(seg),
            },
        );
    }

    fn recv_datamove_done(
        &self,
        id: CmdId,
        offset: u64,
        data: Option<Vec<u8>>,
        status: Option<Status>,
    ) {
        let Some(mut proxy) = self.take_proxy(id) else {
            return self.vanished("DatamoveDone", id);
        };
        if let Some(status) = status {
            proxy.status = status;
            return self.process_done(proxy);
        }
        match data {
            // Segment of data-out pulled from the originator
            Some(seg) => {
                let Some(io) = proxy.scsi_mut() else {
                    return self.drop_proxy(proxy);
                };
                io.data.extend_from_slice(&seg);
                if seg.is_empty() || io.data.len() >= io.xfer_len {
                    proxy.flags |= CmdFlags::DATA_MOVED;
                    self.dispatch.push_rtr(proxy);
                } else {
                    self.partner_pull(proxy);
                }
            }
            // Originator has taken a segment of data-in
            None => {
                self.push_segment(proxy, offset + self.xfer_segment as u64)
            }
        }
    }

    // Both sides

    pub(crate) fn handle_msg(&self, msg: HaMsg) {
        let lun = msg.lun;
        match msg.body {
            HaBody::Serialize { id, nexus, io } => {
                self.recv_serialize(id, nexus, io)
            }
            HaBody::ReadyToRun { id } => match self.take_sent(id) {
                Some(cmd) => self.dispatch.push_rtr(cmd),
                None => self.vanished("ReadyToRun", id),
            },
            HaBody::Datamove { id, offset, len, data: None } => {
                let Some(mut cmd) = self.take_sent(id) else {
                    return self.vanished("Datamove", id);
                };
                if cmd.flags.contains(CmdFlags::DATA_MOVED) {
                    return self.send_segment(cmd, offset, len, None);
                }
                if let Some(io) = cmd.scsi_mut() {
                    io.pending_pull = Some((offset, len));
                }
                self.port_datamove(cmd);
            }
            HaBody::Datamove { id, offset, data: Some(seg), .. } => {
                let Some(mut cmd) = self.take_sent(id) else {
                    return self.vanished("Datamove", id);
                };
                if let Some(io) = cmd.scsi_mut() {
                    let start = offset as usize;
                    let end = start + seg.len();
                    if io.data.len() < end {
                        io.data.resize(end, 0);
                    }
                    io.data[start..end].copy_from_slice(&seg);
                }
                if let Some(cmd) = self.park_sent(cmd) {
                    return self.resubmit_local(cmd);
                }
                let _ = self.ha_send(
                    lun,
                    HaBody::DatamoveDone {
                        id,
                        offset,
                        data: None,
                        status: None,
                    },
                );
            }
            HaBody::DatamoveDone { id, offset, data, status } => {
                self.recv_datamove_done(id, offset, data, status)
            }
            HaBody::Finish { id, status, to_primary: true } => {
                let Some(mut proxy) = self.take_proxy(id) else {
                    return self.vanished("Finish", id);
                };
                proxy.status = status;
                self.drop_proxy(proxy);
            }
            HaBody::Finish { id, status, to_primary: false } => {
                let Some(mut cmd) = self.take_sent(id) else {
                    return self.vanished("Finish", id);
                };
                cmd.status = status;
                cmd.flags |= CmdFlags::PARTNER_DONE;
                self.process_done(cmd);
            }
            HaBody::Task { nexus, action, tag } => {
                if let Some(iid) = nexus.iid() {
                    self.apply_task(nexus, iid, action, tag);
                }
            }
            HaBody::ReservationAction(mirror) => self.recv_pr(lun, mirror),
            HaBody::Lock(lock) => self.recv_lock(lock),
            HaBody::Sync(sync) => self.recv_sync(sync),
        }
    }

    pub(crate) fn ha_mirror_pr(&self, lun: LunId, mirror: PrMirror) {
        if self.is_paired() {
            let _ = self.ha_send(lun, HaBody::ReservationAction(mirror));
        }
    }

    pub(crate) fn ha_mirror_task(
        &self,
        nexus: Nexus,
        action: TaskAction,
        tag: Tag,
    ) {
        if self.is_paired() {
            let body = HaBody::Task { nexus, action, tag };
            let _ = self.ha_send(nexus.lun, body);
        }
    }

    fn recv_pr(&self, lun_id: LunId, mirror: PrMirror) {
        let Some(lun) = self.lun(lun_id) else {
            error!(self.log, "reservation update for unknown LUN";
                "lun" => lun_id);
            return;
        };
        let released = {
            let mut state = lun.lock();
            state.pr.install(&mirror.snapshot);
            for (iid, bits) in mirror.ua.iter() {
                let bits = UaBits::from_bits_truncate(*bits);
                state.pending.establish(*iid, bits);
            }
            if let (Some(req), false) =
                (mirror.requester, mirror.aborted.is_empty())
            {
                state.abort_initiators(req, &mirror.aborted);
            }
            serialize::check_blocked(&mut state)
        };
        debug!(lun.log, "reservation state mirrored";
            "generation" => mirror.snapshot.generation);
        self.dispatch_released(released);
    }

    fn recv_sync(&self, sync: SyncState) {
        info!(self.log, "HA state sync from partner";
            "ports" => sync.ports.len(),
            "reservations" => sync.reservations.len());
        self.ha.lock().unwrap().partner_ports = sync.ports;
        // Ownership by preference, not the current flag: a controller still
        // in single mode holds every LUN as primary.
        for (id, snap) in sync.reservations {
            match self.lun(id) {
                Some(lun) if !lun.preferred_primary() => {
                    lun.lock().pr.install(&snap);
                }
                _ => {}
            }
        }
    }

    // Role transitions

    pub(crate) fn link_up(&self) -> Result<(), HaError> {
        {
            let mut ha = self.ha.lock().unwrap();
            if ha.link.is_none() {
                return Err(HaError::NotPaired);
            }
            if ha.role == HaRole::Paired {
                return Ok(());
            }
            ha.role = HaRole::Paired;
        }

        let mut sync =
            SyncState { ports: self.port_states(), ..Default::default() };
        let mut replay = Vec::new();
        for lun in self.luns() {
            let mut state = lun.lock();
            let was_primary = state.flags.contains(LunFlags::PRIMARY);
            if lun.preferred_primary() {
                state.flags.insert(LunFlags::PRIMARY);
                sync.reservations.push((lun.id, state.pr.snapshot()));
            } else {
                state.flags.remove(LunFlags::PRIMARY);
                // Aborted entries go out the normal way; the rest are
                // replayed through admission on the new primary.
                let released = serialize::check_blocked(&mut state);
                let blocked = std::mem::take(&mut state.blocked);
                for Blocked { seq, mut cmd } in blocked {
                    state.ooa_remove(seq);
                    cmd.ooa_seq = None;
                    cmd.flags.remove(CmdFlags::BLOCKED);
                    cmd.flags.insert(CmdFlags::RESUBMITTED);
                    replay.push(cmd);
                }
                drop(state);
                self.dispatch_released(released);
                state = lun.lock();
            }
            if was_primary != state.flags.contains(LunFlags::PRIMARY) {
                state.pending.establish_all(UaBits::ASYM_ACC_CHANGE);
            }
        }
        warn!(self.log, "HA link up, entering paired mode";
            "replayed" => replay.len());
        for mut cmd in replay {
            self.enqueue_incoming(&mut cmd);
            self.dispatch.push_incoming(cmd);
        }
        self.ha_send(0, HaBody::Sync(sync))
    }

    pub(crate) fn link_down(&self) {
        let (sent, proxies) = {
            let mut ha = self.ha.lock().unwrap();
            if ha.role == HaRole::Single {
                return;
            }
            ha.role = HaRole::Single;
            ha.lock.partner_holds = false;
            ha.lock.deferred = false;
            self.ha_cv.notify_all();
            (std::mem::take(&mut ha.sent), std::mem::take(&mut ha.proxies))
        };
        let isc_dropped = self.dispatch.clear_isc();

        // Responses for the partner's commands can never be delivered
        let mut orphans: Vec<PooledCmd> = proxies.into_values().collect();
        orphans.extend(self.dispatch.purge(|c| c.is_from_partner()));
        let mut promoted = 0;
        for lun in self.luns() {
            let mut state = lun.lock();
            let (theirs, ours): (VecDeque<_>, VecDeque<_>) =
                std::mem::take(&mut state.blocked)
                    .into_iter()
                    .partition(|b| b.cmd.is_from_partner());
            state.blocked = ours;
            orphans.extend(theirs.into_iter().map(|b| b.cmd));
            if !state.flags.contains(LunFlags::PRIMARY) {
                state.flags.insert(LunFlags::PRIMARY);
                state.pending.establish_all(UaBits::ASYM_ACC_CHANGE);
                promoted += 1;
            }
        }
        warn!(self.log, "HA link down, entering single mode";
            "purged" => orphans.len(),
            "resubmitted" => sent.len(),
            "messages_dropped" => isc_dropped,
            "promoted" => promoted);

        for proxy in orphans {
            self.drop_proxy(proxy);
        }
        for cmd in sent.into_values() {
            self.resubmit_local(cmd);
        }
    }

    // Lock

    pub(crate) fn ha_lock(
        &self,
        timeout: Duration,
    ) -> Result<HaLockGuard, HaError> {
        let deadline = Instant::now() + timeout;
        let guard = || HaLockGuard { ctl: self.this.clone() };

        let mut ha = self.ha.lock().unwrap();
        while ha.lock.held || ha.lock.requesting {
            let now = Instant::now();
            if now >= deadline {
                return Err(HaError::LockTimeout);
            }
            ha = self.ha_cv.wait_timeout(ha, deadline - now).unwrap().0;
        }
        if ha.role == HaRole::Single {
            ha.lock.held = true;
            return Ok(guard());
        }
        ha.lock.requesting = true;
        ha.lock.granted = false;
        drop(ha);

        let req = LockMsg::Request { from: self.ha_id };
        let _ = self.ha_send(0, HaBody::Lock(req));

        let mut ha = self.ha.lock().unwrap();
        loop {
            if ha.lock.granted || ha.role == HaRole::Single {
                ha.lock.requesting = false;
                ha.lock.granted = false;
                ha.lock.held = true;
                return Ok(guard());
            }
            let now = Instant::now();
            if now >= deadline {
                ha.lock.requesting = false;
                self.ha_cv.notify_all();
                drop(ha);
                // Withdraw the request, should the partner have deferred it
                let _ = self.ha_send(0, HaBody::Lock(LockMsg::Release));
                return Err(HaError::LockTimeout);
            }
            ha = self.ha_cv.wait_timeout(ha, deadline - now).unwrap().0;
        }
    }

    fn ha_unlock(&self) {
        let (deferred, paired) = {
            let mut ha = self.ha.lock().unwrap();
            ha.lock.held = false;
            let deferred = std::mem::take(&mut ha.lock.deferred);
            if deferred {
                ha.lock.partner_holds = true;
            }
            self.ha_cv.notify_all();
            (deferred, ha.role == HaRole::Paired)
        };
        if paired {
            let _ = self.ha_send(0, HaBody::Lock(LockMsg::Release));
            if deferred {
                let _ = self.ha_send(0, HaBody::Lock(LockMsg::Grant));
            }
        }
    }

    fn recv_lock(&self, lock: LockMsg) {
        let reply = {
            let mut ha = self.ha.lock().unwrap();
            let state = &mut ha.lock;
            match lock {
                LockMsg::Request { from } => {
                    // Ties between simultaneous requests go to the lower id
                    if state.held || (state.requesting && self.ha_id < from) {
                        state.deferred = true;
                        None
                    } else {
                        state.partner_holds = true;
                        Some(LockMsg::Grant)
                    }
                }
                LockMsg::Grant if state.requesting => {
                    state.granted = true;
                    self.ha_cv.notify_all();
                    None
                }
                // Stale grant for a request that timed out
                LockMsg::Grant => Some(LockMsg::Release),
                LockMsg::Release => {
                    state.partner_holds = false;
                    state.deferred = false;
                    self.ha_cv.notify_all();
                    None
                }
            }
        };
        if let Some(reply) = reply {
            let _ = self.ha_send(0, HaBody::Lock(reply));
        }
    }
}
