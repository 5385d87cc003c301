// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logical units and their ordering state.
//!
//! Each [Lun] keeps, under a single lock, the ordered list of every admitted
//! and not-yet-completed command (the OOA list, in arrival order), the list
//! of commands blocked behind them, reservation and unit-attention state,
//! and its mode pages.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use slog::Logger;

use crate::backend::{Backend, LunInfo};
use crate::cmd::cdb::{self, CmdClass, ExtentError, OpFlags};
use crate::cmd::{CmdFlags, CmdId, Command, Extent, TagType};
use crate::common::{Iid, LunId, Nexus, Tag};
use crate::inject::Injections;
use crate::pool::PooledCmd;
use crate::reservation::Reservations;
use crate::sense::{asc, key, SenseData};

pub mod mode;
pub mod pending;

use mode::ModePages;
use pending::{PendingTable, UaBits};

/// Position of a command in its LUN's arrival order
pub type OoaSeq = u64;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct LunFlags: u32 {
        /// Not accepting new commands
        const DISABLED = 1 << 0;
        const OFFLINE = 1 << 1;
        const STOPPED = 1 << 2;
        const INOPERABLE = 1 << 3;
        /// Removed, with teardown deferred until the OOA list drains
        const INVALID = 1 << 4;
        /// This controller performs admission for the LUN
        const PRIMARY = 1 << 5;
    }
}

/// Whether SYNCHRONIZE CACHE is passed to the backend
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    #[default]
    Always,
    /// Complete immediately without involving the backend
    Never,
}

/// Operational condition of a LUN, gating which commands it accepts
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LunCondition {
    #[default]
    Online,
    Offline,
    Stopped,
    Inoperable,
}

#[derive(Clone, Debug, Default)]
pub struct LunOpts {
    /// Preferred owner of admission when paired with an HA partner
    pub primary: bool,
    pub sync_policy: SyncPolicy,
    pub condition: LunCondition,
}

/// Serialization-relevant copy of an admitted command
#[derive(Clone, Debug)]
pub(crate) struct OoaEntry {
    pub id: CmdId,
    pub nexus: Nexus,
    pub iid: Option<Iid>,
    pub tag: Tag,
    pub tag_type: TagType,
    pub opcode: u8,
    pub class: Option<CmdClass>,
    pub extent: Result<Option<Extent>, ExtentError>,
    pub flags: CmdFlags,
    pub admitted: Instant,
}
impl OoaEntry {
    pub fn is_aborted(&self) -> bool {
        self.flags.contains(CmdFlags::ABORT)
    }
}

/// Diagnostic view of an OOA entry
#[derive(Clone, Debug)]
pub struct OoaSnapshot {
    pub id: CmdId,
    pub nexus: Nexus,
    pub tag: Tag,
    pub tag_type: TagType,
    pub opcode: u8,
    pub blocked: bool,
    pub aborted: bool,
    pub from_partner: bool,
    pub age: Duration,
}

pub(crate) struct Blocked {
    pub seq: OoaSeq,
    pub cmd: PooledCmd,
}

pub(crate) struct LunState {
    pub flags: LunFlags,
    next_seq: OoaSeq,
    pub ooa: BTreeMap<OoaSeq, OoaEntry>,
    pub blocked: VecDeque<Blocked>,
    pub pr: Reservations,
    pub pending: PendingTable,
    pub mode: ModePages,
    pub sync_policy: SyncPolicy,
    pub injections: Injections,
}
impl LunState {
    /// Record a command at the tail of the OOA list.
    pub fn ooa_insert(&mut self, cmd: &mut Command) -> OoaSeq {
        let seq = self.next_seq;
        self.next_seq += 1;

        let io = cmd.scsi();
        let opcode = io.map(|io| io.cdb.opcode()).unwrap_or(0);
        let entry = OoaEntry {
            id: cmd.id(),
            nexus: cmd.nexus,
            iid: cmd.nexus.iid(),
            tag: io.map(|io| io.tag).unwrap_or(0),
            tag_type: io.map(|io| io.tag_type).unwrap_or_default(),
            opcode,
            class: cdb::lookup(opcode).map(|e| e.class),
            extent: io
                .map(|io| cdb::decode_extent(&io.cdb))
                .unwrap_or(Ok(None)),
            flags: cmd.flags
                & (CmdFlags::FROM_PARTNER | CmdFlags::SENT_TO_PARTNER),
            admitted: Instant::now(),
        };
        self.ooa.insert(seq, entry);
        cmd.ooa_seq = Some(seq);
        seq
    }
    pub fn ooa_remove(&mut self, seq: OoaSeq) -> Option<OoaEntry> {
        self.ooa.remove(&seq)
    }
    pub fn entry(&self, seq: OoaSeq) -> Option<&OoaEntry> {
        self.ooa.get(&seq)
    }
    pub fn entry_mut(&mut self, seq: OoaSeq) -> Option<&mut OoaEntry> {
        self.ooa.get_mut(&seq)
    }
    pub fn is_aborted(&self, seq: OoaSeq) -> bool {
        self.entry(seq).map(OoaEntry::is_aborted).unwrap_or(false)
    }

    /// Park an admitted command on the blocked list.
    pub fn block(&mut self, seq: OoaSeq, mut cmd: PooledCmd) {
        cmd.flags |= CmdFlags::BLOCKED;
        if let Some(ent) = self.entry_mut(seq) {
            ent.flags |= CmdFlags::BLOCKED;
        }
        self.blocked.push_back(Blocked { seq, cmd });
    }

    /// Check LUN condition against the opcode's allowances.
    pub fn gate(&self, flags: OpFlags) -> Option<SenseData> {
        if self.flags.contains(LunFlags::OFFLINE)
            && !flags.contains(OpFlags::OK_ON_OFFLINE)
        {
            return Some(SenseData::new(key::NOT_READY, asc::NOT_READY_OFFLINE));
        }
        if self.flags.contains(LunFlags::INOPERABLE)
            && !flags.contains(OpFlags::OK_ON_INOPERABLE)
        {
            return Some(SenseData::new(
                key::NOT_READY,
                asc::NOT_READY_MANUAL_INTERVENTION,
            ));
        }
        if self.flags.contains(LunFlags::STOPPED)
            && !flags.contains(OpFlags::OK_ON_STOPPED)
        {
            return Some(SenseData::new(
                key::NOT_READY,
                asc::NOT_READY_INIT_REQUIRED,
            ));
        }
        None
    }

    pub fn set_condition(&mut self, cond: LunCondition) {
        self.flags.remove(
            LunFlags::OFFLINE | LunFlags::STOPPED | LunFlags::INOPERABLE,
        );
        match cond {
            LunCondition::Online => {}
            LunCondition::Offline => self.flags |= LunFlags::OFFLINE,
            LunCondition::Stopped => self.flags |= LunFlags::STOPPED,
            LunCondition::Inoperable => self.flags |= LunFlags::INOPERABLE,
        }
    }

    /// Raise unit attentions produced by a reservation transition.
    pub fn raise_ua(&mut self, ua: &[(Iid, UaBits)]) {
        for (iid, bits) in ua {
            self.pending.establish(*iid, *bits);
        }
    }

    /// A removed LUN whose last command has drained
    pub fn is_reclaimable(&self) -> bool {
        self.flags.contains(LunFlags::INVALID) && self.ooa.is_empty()
    }
}

pub struct Lun {
    pub id: LunId,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) state: Mutex<LunState>,
    preferred_primary: bool,
    pub(crate) log: Logger,
}
impl Lun {
    pub(crate) fn new(
        log: &Logger,
        id: LunId,
        backend: Arc<dyn Backend>,
        opts: &LunOpts,
    ) -> Arc<Self> {
        let mut pending = PendingTable::new();
        pending.establish_all(UaBits::POWER_ON);

        let mut state = LunState {
            flags: LunFlags::DISABLED | LunFlags::PRIMARY,
            next_seq: 1,
            ooa: BTreeMap::new(),
            blocked: VecDeque::new(),
            pr: Reservations::new(),
            pending,
            mode: ModePages::new(),
            sync_policy: opts.sync_policy,
            injections: Injections::default(),
        };
        state.set_condition(opts.condition);

        Arc::new(Self {
            id,
            backend,
            state: Mutex::new(state),
            preferred_primary: opts.primary,
            log: log.new(slog::o!("lun" => id)),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, LunState> {
        self.state.lock().unwrap()
    }

    pub fn info(&self) -> LunInfo {
        self.backend.info()
    }
    pub fn flags(&self) -> LunFlags {
        self.lock().flags
    }
    pub fn is_primary(&self) -> bool {
        self.flags().contains(LunFlags::PRIMARY)
    }
    pub fn is_enabled(&self) -> bool {
        !self.flags().intersects(LunFlags::DISABLED | LunFlags::INVALID)
    }
    pub(crate) fn preferred_primary(&self) -> bool {
        self.preferred_primary
    }
    pub fn ooa_len(&self) -> usize {
        self.lock().ooa.len()
    }
    pub fn blocked_len(&self) -> usize {
        self.lock().blocked.len()
    }

    /// Snapshot of the OOA list, in arrival order
    pub fn ooa_snapshot(&self) -> Vec<OoaSnapshot> {
        let state = self.lock();
        let now = Instant::now();
        state
            .ooa
            .values()
            .map(|e| OoaSnapshot {
                id: e.id,
                nexus: e.nexus,
                tag: e.tag,
                tag_type: e.tag_type,
                opcode: e.opcode,
                blocked: e.flags.contains(CmdFlags::BLOCKED),
                aborted: e.is_aborted(),
                from_partner: e.flags.contains(CmdFlags::FROM_PARTNER),
                age: now.saturating_duration_since(e.admitted),
            })
            .collect()
    }

    pub fn pr_generation(&self) -> u32 {
        self.lock().pr.generation()
    }
    pub fn pr_state(&self) -> crate::reservation::PrState {
        self.lock().pr.state()
    }
    pub fn pending_ua(&self, iid: Iid) -> UaBits {
        self.lock().pending.pending(iid)
    }
}
