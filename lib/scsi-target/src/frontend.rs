// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Frontends: the transports through which initiators reach the target.

use std::sync::{Condvar, Mutex, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::cmd::{CmdId, Command};
use crate::common::Nexus;
use crate::controller::Shared;
use crate::pool::PooledCmd;
use crate::sense::{Status, FIXED_SENSE_LEN};

pub trait Port: Send + Sync + 'static {
    /// Fetch data-out for a command from its initiator.
    ///
    /// The buffer is attached with [DatamoveIo::set_data] and the transfer
    /// concluded with [DatamoveIo::complete] (or [DatamoveIo::fail]).
    fn datamove(&self, io: DatamoveIo);

    /// Deliver a command which has reached a terminal state.  Dropping the
    /// command returns it to its pool.
    fn done(&self, cmd: PooledCmd);
}

/// A data-out transfer requested of a [Port].
pub struct DatamoveIo {
    cmd: Option<PooledCmd>,
    ctl: Weak<Shared>,
    _nodrop: NoDropDatamoveIo,
}
impl DatamoveIo {
    pub(crate) fn new(cmd: PooledCmd, ctl: Weak<Shared>) -> Self {
        Self { cmd: Some(cmd), ctl, _nodrop: NoDropDatamoveIo }
    }

    pub fn cmd(&self) -> &Command {
        self.cmd.as_deref().expect("command present until completion")
    }
    /// Number of bytes the initiator is expected to send
    pub fn xfer_len(&self) -> usize {
        self.cmd().scsi().map(|io| io.xfer_len).unwrap_or(0)
    }
    pub fn set_data(&mut self, data: Vec<u8>) {
        let cmd = self.cmd.as_deref_mut().expect("command present");
        if let Some(io) = cmd.scsi_mut() {
            io.data = data;
        }
    }

    /// Transfer succeeded
    pub fn complete(self) {
        self.finish(None)
    }
    /// Transfer failed; the command terminates with `status`
    pub fn fail(self, status: Status) {
        self.finish(Some(status))
    }

    fn finish(self, failure: Option<Status>) {
        let DatamoveIo { cmd, ctl, _nodrop } = self;
        std::mem::forget(_nodrop);

        let Some(mut cmd) = cmd else {
            return;
        };
        match failure {
            Some(status) => cmd.status = status,
            None => cmd.flags |= crate::cmd::CmdFlags::DATA_MOVED,
        }
        if let Some(ctl) = ctl.upgrade() {
            ctl.datamove_done(cmd);
        }
    }
}

/// Marker struct to ensure that [DatamoveIo] is completed before drop
struct NoDropDatamoveIo;
impl Drop for NoDropDatamoveIo {
    fn drop(&mut self) {
        panic!("DatamoveIo should be complete()-ed before drop");
    }
}

/// Terminal state of a command, detached from its pooled object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub id: CmdId,
    pub nexus: Nexus,
    pub status: Status,
    /// Fixed-format sense data accompanying CHECK CONDITION
    pub sense: Option<[u8; FIXED_SENSE_LEN]>,
    /// Data-in
    pub data: Vec<u8>,
}
impl Completion {
    pub fn from_cmd(cmd: &mut Command) -> Self {
        let data = cmd
            .scsi_mut()
            .map(|io| std::mem::take(&mut io.data))
            .unwrap_or_default();
        Self {
            id: cmd.id(),
            nexus: cmd.nexus,
            sense: cmd.status.sense().map(|s| s.to_fixed()),
            status: cmd.status.clone(),
            data,
        }
    }
}

/// Rendezvous for a synchronous submitter waiting on its command.
pub(crate) struct SyncWaiter {
    slot: Mutex<Option<PooledCmd>>,
    cv: Condvar,
}
impl SyncWaiter {
    pub(crate) fn new() -> Self {
        Self { slot: Mutex::new(None), cv: Condvar::new() }
    }
    pub(crate) fn post(&self, cmd: PooledCmd) {
        let mut slot = self.slot.lock().unwrap();
        *slot = Some(cmd);
        self.cv.notify_all();
    }
    pub(crate) fn wait(&self) -> PooledCmd {
        let guard = self.slot.lock().unwrap();
        let mut guard = self.cv.wait_while(guard, |s| s.is_none()).unwrap();
        guard.take().expect("slot populated")
    }
}

/// In-process [Port] handing completions over a channel.
///
/// Data-out requested through [Port::datamove] is satisfied immediately
/// with a buffer of `xfer_len` bytes of the configured fill pattern.
pub struct LoopbackPort {
    tx: Sender<PooledCmd>,
    rx: Receiver<PooledCmd>,
    fill: u8,
}
impl LoopbackPort {
    pub fn new() -> Self {
        Self::with_fill(0)
    }
    pub fn with_fill(fill: u8) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx, fill }
    }

    pub fn completions(&self) -> &Receiver<PooledCmd> {
        &self.rx
    }
    pub fn recv_timeout(&self, timeout: Duration) -> Option<PooledCmd> {
        self.rx.recv_timeout(timeout).ok()
    }
}
impl Default for LoopbackPort {
    fn default() -> Self {
        Self::new()
    }
}
impl Port for LoopbackPort {
    fn datamove(&self, mut io: DatamoveIo) {
        let len = io.xfer_len();
        io.set_data(vec![self.fill; len]);
        io.complete();
    }

    fn done(&self, cmd: PooledCmd) {
        // Receiver lives as long as we do
        let _ = self.tx.send(cmd);
    }
}
