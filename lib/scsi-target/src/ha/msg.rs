// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Messages exchanged between the controllers of an HA pair.

use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;

use crate::cmd::{Cdb, CmdId, ScsiIo, TagType};
use crate::common::{Iid, LunId, Nexus, PortId, Tag};
use crate::reservation::PrSnapshot;
use crate::sense::Status;
use crate::task::TaskAction;

use super::HaError;

/// Bumped on any incompatible change to [HaMsg]
pub const HA_PROTO_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaMsg {
    pub version: u32,
    /// LUN the message concerns, which also selects the receiving worker
    pub lun: LunId,
    pub body: HaBody,
}
impl HaMsg {
    pub fn new(lun: LunId, body: HaBody) -> Self {
        Self { version: HA_PROTO_VERSION, lun, body }
    }

    pub fn encode(&self) -> Result<Vec<u8>, HaError> {
        serde_json::to_vec(self).map_err(|e| HaError::Encode(e.to_string()))
    }
    pub fn decode(buf: &[u8]) -> Result<Self, HaError> {
        let msg: HaMsg = serde_json::from_slice(buf)
            .map_err(|e| HaError::Decode(e.to_string()))?;
        if msg.version != HA_PROTO_VERSION {
            return Err(HaError::Decode(format!(
                "protocol version {} (expected {HA_PROTO_VERSION})",
                msg.version
            )));
        }
        Ok(msg)
    }

    pub fn kind(&self) -> &'static str {
        (&self.body).into()
    }
}

/// SCSI command as carried in [HaBody::Serialize]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireScsi {
    pub cdb: Cdb,
    pub tag: Tag,
    pub tag_type: TagType,
    pub xfer_len: usize,
}
impl From<&ScsiIo> for WireScsi {
    fn from(io: &ScsiIo) -> Self {
        Self {
            cdb: io.cdb,
            tag: io.tag,
            tag_type: io.tag_type,
            xfer_len: io.xfer_len,
        }
    }
}
impl From<WireScsi> for ScsiIo {
    fn from(w: WireScsi) -> Self {
        ScsiIo::new(w.cdb, w.tag, w.tag_type).with_xfer_len(w.xfer_len)
    }
}

/// Reservation state change, applied verbatim on the partner
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrMirror {
    pub snapshot: PrSnapshot,
    /// Unit attentions raised, as [crate::lun::pending::UaBits]
    pub ua: Vec<(Iid, u32)>,
    pub requester: Option<Iid>,
    /// Initiators whose commands are to be aborted
    pub aborted: Vec<Iid>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMsg {
    Request { from: u32 },
    Grant,
    Release,
}

/// State exchanged when the link comes up
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub ports: Vec<(PortId, bool)>,
    /// Reservation state of the LUNs the sender is primary for
    pub reservations: Vec<(LunId, PrSnapshot)>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, IntoStaticStr)]
pub enum HaBody {
    /// Propose a command for admission on the LUN's primary
    Serialize { id: CmdId, nexus: Nexus, io: WireScsi },
    /// Admission granted; the originator may execute (serialize-only)
    ReadyToRun { id: CmdId },
    /// Move one segment of data.  With `data` absent this is a request to
    /// pull data-out from the originator; otherwise it pushes data-in.
    Datamove { id: CmdId, offset: u64, len: u32, data: Option<Vec<u8>> },
    /// Segment moved.  Carries the data for a pull, or the terminal status
    /// if the transfer failed.
    DatamoveDone {
        id: CmdId,
        offset: u64,
        data: Option<Vec<u8>>,
        status: Option<Status>,
    },
    /// Terminal status.  `to_primary` is set when the originator reports
    /// completion of a command it executed itself.
    Finish { id: CmdId, status: Status, to_primary: bool },
    Task { nexus: Nexus, action: TaskAction, tag: Tag },
    ReservationAction(PrMirror),
    Lock(LockMsg),
    Sync(SyncState),
}
