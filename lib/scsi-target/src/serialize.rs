// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Admission: deciding whether a newly arrived command may run now, must
//! wait behind earlier ones, or is to be rejected outright.
//!
//! A new command is compared against each earlier entry on its LUN's OOA
//! list, walking backwards from the most recent.  Scanning stops at the
//! first verdict other than [Action::Pass].

use strum::IntoStaticStr;

use crate::cmd::cdb::CmdClass;
use crate::cmd::{CmdFlags, TagType};
use crate::common::Tag;
use crate::lun::{Blocked, LunState, OoaEntry, OoaSeq};

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoStaticStr)]
pub enum Action {
    /// Wait for an earlier command to complete
    Block,
    /// May run now
    Pass,
    /// May run now, without consulting older entries
    Skip,
    /// Untagged command overlaps an outstanding untagged one
    Overlap,
    /// Tag is already in use by this initiator
    OverlapTag(Tag),
    /// CDB could not be decoded well enough to serialize
    Error,
}
impl Action {
    pub fn is_runnable(self) -> bool {
        matches!(self, Action::Pass | Action::Skip)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Ser {
    Block,
    Pass,
    /// Block only if the block ranges overlap
    Extent,
    Skip,
}
use Ser::{Block as B, Extent as X, Pass as P, Skip as S};

/// Row: class of the new command.  Column: class of the earlier command.
///
/// Column order follows [CmdClass]: Tur, Read, Write, ModeSense, ModeSelect,
/// RequestSense, Inquiry, ReadCapacity, Reservation, LogSense, Format,
/// StartStop, Sync, Unmap, ReportLuns.
#[rustfmt::skip]
static SERIALIZE_TABLE: [[Ser; CmdClass::COUNT]; CmdClass::COUNT] = [
/*               TUR RD WR MS MSL RQS INQ RCP RES LOG FMT SS SYN UNM RPL */
/* Tur       */ [P,  P, P, P, P,  P,  P,  P,  P,  P,  B,  B, P,  P,  P],
/* Read      */ [P,  P, X, P, B,  P,  P,  P,  B,  P,  B,  B, P,  X,  P],
/* Write     */ [P,  X, X, P, B,  P,  P,  P,  B,  P,  B,  B, P,  X,  P],
/* ModeSense */ [P,  P, P, P, B,  P,  P,  P,  P,  P,  B,  P, P,  P,  P],
/* ModeSel   */ [P,  B, B, B, B,  P,  P,  P,  B,  P,  B,  B, B,  B,  P],
/* ReqSense  */ [S,  S, S, S, S,  S,  S,  S,  S,  S,  S,  S, S,  S,  S],
/* Inquiry   */ [P,  P, P, P, P,  P,  P,  P,  P,  P,  P,  P, P,  P,  P],
/* ReadCap   */ [P,  P, P, P, B,  P,  P,  P,  P,  P,  B,  P, P,  P,  P],
/* Reserv    */ [P,  P, P, P, P,  P,  P,  P,  B,  P,  B,  P, P,  P,  P],
/* LogSense  */ [P,  P, P, P, P,  P,  P,  P,  P,  P,  B,  P, P,  P,  P],
/* Format    */ [B,  B, B, B, B,  P,  P,  B,  B,  B,  B,  B, B,  B,  P],
/* StartStop */ [P,  B, B, P, B,  P,  P,  P,  P,  P,  B,  B, B,  B,  P],
/* Sync      */ [P,  P, B, P, B,  P,  P,  P,  P,  P,  B,  B, P,  B,  P],
/* Unmap     */ [P,  X, X, P, B,  P,  P,  P,  B,  P,  B,  B, P,  X,  P],
/* ReportLun */ [P,  P, P, P, P,  P,  P,  P,  P,  P,  P,  P, P,  P,  P],
];

/// Compare a new command against a single earlier entry.
pub(crate) fn check_pair(new: &OoaEntry, earlier: &OoaEntry) -> Action {
    let same_initiator = new.iid.is_some() && new.iid == earlier.iid;
    let untagged = |e: &OoaEntry| e.tag_type == TagType::Untagged;
    let either_aborted = new.is_aborted() || earlier.is_aborted();

    if same_initiator && untagged(new) && untagged(earlier) && !either_aborted
    {
        return Action::Overlap;
    }
    if same_initiator
        && !untagged(new)
        && !untagged(earlier)
        && new.tag == earlier.tag
        && !either_aborted
    {
        return Action::OverlapTag(new.tag);
    }

    match new.tag_type {
        TagType::HeadOfQueue => return Action::Pass,
        TagType::Ordered => return Action::Block,
        TagType::Simple | TagType::Untagged => {
            if matches!(
                earlier.tag_type,
                TagType::HeadOfQueue | TagType::Ordered
            ) {
                return Action::Block;
            }
        }
    }

    let (Some(nc), Some(ec)) = (new.class, earlier.class) else {
        // Opcodes without a class were rejected before admission
        return Action::Pass;
    };
    match SERIALIZE_TABLE[nc.idx()][ec.idx()] {
        Ser::Block => Action::Block,
        Ser::Pass => Action::Pass,
        Ser::Skip => Action::Skip,
        Ser::Extent => match (&new.extent, &earlier.extent) {
            (Err(_), _) | (_, Err(_)) => Action::Error,
            (Ok(Some(a)), Ok(Some(b))) if a.overlaps(b) => Action::Block,
            _ => Action::Pass,
        },
    }
}

/// Evaluate the entry at `seq` against everything admitted before it.
pub(crate) fn admit(state: &LunState, seq: OoaSeq) -> Action {
    let Some(new) = state.entry(seq) else {
        return Action::Pass;
    };
    for (_, earlier) in state.ooa.range(..seq).rev() {
        match check_pair(new, earlier) {
            Action::Pass => continue,
            other => return other,
        }
    }
    Action::Pass
}

/// Walk the blocked list in order, re-running admission for each entry.
///
/// Entries which may now run (or must now fail) are removed and returned in
/// their original order; the rest stay blocked.  Aborted entries are always
/// released so that they can be terminated.
pub(crate) fn check_blocked(state: &mut LunState) -> Vec<(Blocked, Action)> {
    let mut released = Vec::new();
    let pending = std::mem::take(&mut state.blocked);
    for blk in pending {
        let action = if state.is_aborted(blk.seq) {
            Action::Pass
        } else {
            admit(state, blk.seq)
        };
        if action == Action::Block {
            state.blocked.push_back(blk);
            continue;
        }
        if let Some(ent) = state.entry_mut(blk.seq) {
            ent.flags.remove(CmdFlags::BLOCKED);
        }
        released.push((blk, action));
    }
    for (blk, _) in released.iter_mut() {
        blk.cmd.flags.remove(CmdFlags::BLOCKED);
    }
    released
}
