// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task management functions.
//!
//! Aborting is cooperative: the target command is only marked in its LUN's
//! OOA list, and each stage of the pipeline checks the mark before doing
//! further work.  The command still completes through the normal path, with
//! its status replaced.

use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;

use crate::cmd::CmdFlags;
use crate::common::{Iid, Tag};
use crate::lun::pending::UaBits;
use crate::lun::LunState;

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    IntoStaticStr,
)]
pub enum TaskAction {
    AbortTask,
    AbortTaskSet,
    ClearTaskSet,
    LunReset,
    TargetReset,
    BusReset,
    ItNexusReset,
    QueryTask,
    QueryTaskSet,
}
impl TaskAction {
    /// Applies to every LUN rather than only the addressed one
    pub fn is_target_wide(self) -> bool {
        matches!(
            self,
            TaskAction::TargetReset
                | TaskAction::BusReset
                | TaskAction::ItNexusReset
        )
    }
}

#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    IntoStaticStr,
)]
pub enum TaskResponse {
    /// Function complete (and for queries: no matching task)
    Complete,
    /// Query found a matching task
    Succeeded,
    FunctionRejected,
    IncorrectLun,
}

/// Which commands an abort applies to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Scope {
    /// Commands from this initiator only
    Initiator(Iid),
    /// All commands on the LUN
    All,
}

impl LunState {
    fn mark_aborted(
        &mut self,
        requester: Option<Iid>,
        pred: impl Fn(&crate::lun::OoaEntry) -> bool,
    ) -> usize {
        let tas = self.mode.tas();
        let mut count = 0;
        for ent in self.ooa.values_mut() {
            if ent.is_aborted() || !pred(ent) {
                continue;
            }
            ent.flags |= CmdFlags::ABORT;
            if tas && ent.iid != requester {
                ent.flags |= CmdFlags::ABORT_STATUS;
            }
            count += 1;
        }
        count
    }

    /// ABORT TASK: mark the first command from `iid` bearing `tag`.
    ///
    /// Matching is by tag alone, without regard to task attribute.
    pub(crate) fn abort_task(&mut self, iid: Iid, tag: Tag) -> bool {
        let Some(ent) = self
            .ooa
            .values_mut()
            .find(|e| e.iid == Some(iid) && e.tag == tag && !e.is_aborted())
        else {
            return false;
        };
        ent.flags |= CmdFlags::ABORT;
        true
    }

    /// ABORT TASK SET / CLEAR TASK SET and the abort half of resets.
    pub(crate) fn abort_scope(
        &mut self,
        requester: Option<Iid>,
        scope: Scope,
    ) -> usize {
        match scope {
            Scope::Initiator(iid) => {
                self.mark_aborted(requester, |e| e.iid == Some(iid))
            }
            Scope::All => self.mark_aborted(requester, |_| true),
        }
    }

    /// Abort every command from any of `victims`, as for PREEMPT AND ABORT.
    pub(crate) fn abort_initiators(
        &mut self,
        requester: Iid,
        victims: &[Iid],
    ) -> usize {
        self.mark_aborted(Some(requester), |e| {
            e.iid.map(|i| victims.contains(&i)).unwrap_or(false)
        })
    }

    /// LUN reset (and the per-LUN half of target and bus resets): abort all
    /// commands, drop any legacy reservation, and raise `ua` everywhere.
    pub(crate) fn reset(
        &mut self,
        requester: Option<Iid>,
        ua: UaBits,
    ) -> usize {
        let count = self.abort_scope(requester, Scope::All);
        self.pr.legacy_clear(None);
        self.pending.establish_all(ua);
        count
    }

    /// I_T nexus reset, as it applies to this LUN.
    pub(crate) fn nexus_reset(&mut self, iid: Iid) -> usize {
        let count = self.abort_scope(Some(iid), Scope::Initiator(iid));
        self.pr.legacy_clear(Some(iid));
        self.pending.establish(iid, UaBits::I_T_NEXUS_LOSS);
        count
    }

    pub(crate) fn query_task(&self, iid: Iid, tag: Tag) -> bool {
        self.ooa
            .values()
            .any(|e| e.iid == Some(iid) && e.tag == tag && !e.is_aborted())
    }
    pub(crate) fn query_task_set(&self, iid: Iid) -> bool {
        self.ooa.values().any(|e| e.iid == Some(iid) && !e.is_aborted())
    }
}
