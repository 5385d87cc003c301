// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The unit of work flowing through the target: a [Command].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;
use tokio::sync::oneshot;

use crate::common::{Nexus, Tag};
use crate::frontend::SyncWaiter;
use crate::lun::OoaSeq;
use crate::pool::PooledCmd;
use crate::reservation::PrOutAction;
use crate::sense::Status;
use crate::task::TaskAction;

pub mod cdb;
pub use cdb::{Cdb, CmdClass, Extent, OpFlags};

/// Static for generating unique [CmdId]s within a process
static NEXT_CMD_ID: AtomicU64 = AtomicU64::new(1);

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct CmdId(u64);
impl CmdId {
    /// Identity of a command sitting free in its pool
    pub const INVALID: Self = Self(0);

    pub(crate) fn next() -> Self {
        Self(NEXT_CMD_ID.fetch_add(1, Ordering::Relaxed))
    }
}
impl From<CmdId> for u64 {
    fn from(value: CmdId) -> Self {
        value.0
    }
}

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    IntoStaticStr,
)]
pub enum TagType {
    #[default]
    Untagged,
    Simple,
    Ordered,
    HeadOfQueue,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataDir {
    None,
    /// Target to initiator
    In,
    /// Initiator to target
    Out,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct CmdFlags: u32 {
        /// Waiting on the LUN's blocked list
        const BLOCKED = 1 << 0;
        /// Marked aborted by task management
        const ABORT = 1 << 1;
        /// Report TASK ABORTED status when terminating an aborted command
        const ABORT_STATUS = 1 << 2;
        /// Proxy for a command owned by the HA partner
        const FROM_PARTNER = 1 << 3;
        /// Admission (and maybe execution) delegated to the HA partner
        const SENT_TO_PARTNER = 1 << 4;
        /// Data-out phase has completed
        const DATA_MOVED = 1 << 5;
        /// Handed to the backend
        const ACTIVE = 1 << 6;
        /// The partner has already seen the final status
        const PARTNER_DONE = 1 << 7;
        /// Re-admitted after an HA role change; unit attentions were
        /// already checked on first admission
        const RESUBMITTED = 1 << 8;
    }
}

/// A SCSI command as received from an initiator.
#[derive(Clone, Debug)]
pub struct ScsiIo {
    pub cdb: Cdb,
    pub tag: Tag,
    pub tag_type: TagType,
    /// Data buffer: holds data-out on the way in, data-in on the way out
    pub data: Vec<u8>,
    /// Expected transfer length in bytes
    pub xfer_len: usize,
    /// Outstanding data-out pull requested by the HA partner
    pub(crate) pending_pull: Option<(u64, u32)>,
}
impl ScsiIo {
    pub fn new(cdb: Cdb, tag: Tag, tag_type: TagType) -> Self {
        Self {
            cdb,
            tag,
            tag_type,
            data: Vec::new(),
            xfer_len: 0,
            pending_pull: None,
        }
    }
    pub fn with_xfer_len(mut self, len: usize) -> Self {
        self.xfer_len = len;
        self
    }
    /// Attach data-out with the command, sparing a datamove round-trip
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.xfer_len = data.len();
        self.data = data;
        self
    }
}

/// A task management request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TaskIo {
    pub action: TaskAction,
    /// Tag of the command targeted by ABORT TASK or QUERY TASK
    pub tag: Tag,
}

/// Local proxy for a command admitted on behalf of the HA partner.
#[derive(Clone, Debug)]
pub struct PartnerIo {
    /// Identity of the original command on the partner
    pub remote: CmdId,
    pub io: ScsiIo,
}

#[derive(Clone, Debug, Default, IntoStaticStr)]
pub enum Payload {
    /// Object is sitting in its pool
    #[default]
    Free,
    Scsi(ScsiIo),
    Task(TaskIo),
    /// Persistent reservation action requested out-of-band
    Reservation(PrOutAction),
    Partner(PartnerIo),
}

/// Where the terminal status of a command is delivered
#[derive(Default)]
pub(crate) enum Reply {
    #[default]
    Port,
    Sync(Arc<SyncWaiter>),
    Async(oneshot::Sender<PooledCmd>),
}

pub struct Command {
    pub(crate) id: CmdId,
    pub nexus: Nexus,
    pub payload: Payload,
    pub flags: CmdFlags,
    pub status: Status,
    pub(crate) ooa_seq: Option<OoaSeq>,
    pub(crate) reply: Reply,
    pub(crate) time_queued: Option<Instant>,
}
impl Command {
    pub(crate) fn blank() -> Self {
        Self {
            id: CmdId::INVALID,
            nexus: Nexus::default(),
            payload: Payload::Free,
            flags: CmdFlags::empty(),
            status: Status::Pending,
            ooa_seq: None,
            reply: Reply::Port,
            time_queued: None,
        }
    }

    /// Return to the pristine state of a free pool object.
    pub(crate) fn reset(&mut self) {
        self.id = CmdId::INVALID;
        self.nexus = Nexus::default();
        self.payload = Payload::Free;
        self.flags = CmdFlags::empty();
        self.status = Status::Pending;
        self.ooa_seq = None;
        self.reply = Reply::Port;
        self.time_queued = None;
    }

    pub fn id(&self) -> CmdId {
        self.id
    }
    pub fn is_free(&self) -> bool {
        matches!(self.payload, Payload::Free)
    }

    pub fn setup_scsi(&mut self, nexus: Nexus, io: ScsiIo) {
        self.nexus = nexus;
        if !io.data.is_empty() {
            self.flags |= CmdFlags::DATA_MOVED;
        }
        self.payload = Payload::Scsi(io);
    }
    pub fn setup_task(&mut self, nexus: Nexus, task: TaskIo) {
        self.nexus = nexus;
        self.payload = Payload::Task(task);
    }
    pub fn setup_reservation(&mut self, nexus: Nexus, action: PrOutAction) {
        self.nexus = nexus;
        self.payload = Payload::Reservation(action);
    }
    pub(crate) fn setup_partner(
        &mut self,
        nexus: Nexus,
        remote: CmdId,
        io: ScsiIo,
    ) {
        self.nexus = nexus;
        self.flags |= CmdFlags::FROM_PARTNER;
        self.payload = Payload::Partner(PartnerIo { remote, io });
    }

    /// SCSI portion of the command, for both local and proxied commands
    pub fn scsi(&self) -> Option<&ScsiIo> {
        match &self.payload {
            Payload::Scsi(io) => Some(io),
            Payload::Partner(p) => Some(&p.io),
            _ => None,
        }
    }
    pub fn scsi_mut(&mut self) -> Option<&mut ScsiIo> {
        match &mut self.payload {
            Payload::Scsi(io) => Some(io),
            Payload::Partner(p) => Some(&mut p.io),
            _ => None,
        }
    }
    pub fn cdb(&self) -> Option<&Cdb> {
        self.scsi().map(|io| &io.cdb)
    }
    pub fn opcode(&self) -> Option<u8> {
        self.cdb().map(Cdb::opcode)
    }
    pub fn data(&self) -> &[u8] {
        self.scsi().map(|io| io.data.as_slice()).unwrap_or(&[])
    }

    /// Partner-side identity of a proxied command
    pub fn remote_id(&self) -> Option<CmdId> {
        match &self.payload {
            Payload::Partner(p) => Some(p.remote),
            _ => None,
        }
    }
    pub fn is_from_partner(&self) -> bool {
        self.flags.contains(CmdFlags::FROM_PARTNER)
    }
    pub fn is_aborted(&self) -> bool {
        self.flags.contains(CmdFlags::ABORT)
    }

    pub fn data_dir(&self) -> DataDir {
        match self.opcode().and_then(cdb::lookup) {
            Some(e) if e.flags.contains(OpFlags::DATA_IN) => DataDir::In,
            Some(e) if e.flags.contains(OpFlags::DATA_OUT) => DataDir::Out,
            _ => DataDir::None,
        }
    }
}
impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("nexus", &self.nexus)
            .field("payload", &self.payload)
            .field("flags", &self.flags)
            .field("status", &self.status)
            .finish()
    }
}
