// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker slots and the queues they service.
//!
//! Each worker owns four private queues.  New commands are routed by a hash
//! of their (port, initiator) pair so that one initiator's commands are
//! prechecked in submission order; everything after admission (and all
//! inter-controller traffic) is routed by LUN.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Condvar, Mutex};

use strum::IntoStaticStr;

use crate::cmd::Command;
use crate::common::{LunId, Nexus};
use crate::ha::msg::HaMsg;
use crate::pool::PooledCmd;
use crate::probes;

/// Upper bound on the default number of workers
pub const MAX_WORKERS: usize = 16;

/// Worker count used when none is configured: one per CPU, capped.
pub fn default_worker_count() -> NonZeroUsize {
    let cpus = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    NonZeroUsize::new(cpus.min(MAX_WORKERS)).unwrap_or(NonZeroUsize::MIN)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoStaticStr)]
pub(crate) enum QueueKind {
    /// Messages from the HA partner
    Isc,
    /// Completions returning from backends
    Done,
    /// Admitted commands, ready to run
    Rtr,
    /// New arrivals awaiting precheck
    Incoming,
}

/// Strict servicing priority of a worker's queues
pub(crate) const SERVICE_ORDER: [QueueKind; 4] =
    [QueueKind::Isc, QueueKind::Done, QueueKind::Rtr, QueueKind::Incoming];

pub(crate) enum Work {
    Isc(HaMsg),
    Done(PooledCmd),
    Rtr(PooledCmd),
    Incoming(PooledCmd),
}

#[derive(Default)]
struct WorkerQueues {
    isc: VecDeque<HaMsg>,
    done: VecDeque<PooledCmd>,
    rtr: VecDeque<PooledCmd>,
    incoming: VecDeque<PooledCmd>,
}
impl WorkerQueues {
    fn cmds_mut(
        &mut self,
        kind: QueueKind,
    ) -> Option<&mut VecDeque<PooledCmd>> {
        match kind {
            QueueKind::Isc => None,
            QueueKind::Done => Some(&mut self.done),
            QueueKind::Rtr => Some(&mut self.rtr),
            QueueKind::Incoming => Some(&mut self.incoming),
        }
    }

    fn pop(&mut self) -> Option<Work> {
        for kind in SERVICE_ORDER {
            let work = match kind {
                QueueKind::Isc => self.isc.pop_front().map(Work::Isc),
                QueueKind::Done => self.done.pop_front().map(Work::Done),
                QueueKind::Rtr => self.rtr.pop_front().map(Work::Rtr),
                QueueKind::Incoming => {
                    self.incoming.pop_front().map(Work::Incoming)
                }
            };
            if work.is_some() {
                return work;
            }
        }
        None
    }

    fn is_empty(&self) -> bool {
        self.isc.is_empty()
            && self.done.is_empty()
            && self.rtr.is_empty()
            && self.incoming.is_empty()
    }
}

#[derive(Default)]
struct WorkerState {
    queues: WorkerQueues,
    /// Has the absence of work caused this worker to sleep?
    sleeping: bool,
    halted: bool,
}

pub(crate) struct WorkerSlot {
    state: Mutex<WorkerState>,
    cv: Condvar,
    id: usize,
}
impl WorkerSlot {
    fn new(id: usize) -> Self {
        Self { state: Mutex::new(Default::default()), cv: Condvar::new(), id }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Wait for the next unit of work, in [SERVICE_ORDER] priority.
    ///
    /// Returns `None` once the slot has been halted and drained.
    pub(crate) fn block_for_work(&self) -> Option<Work> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(work) = state.queues.pop() {
                return Some(work);
            }
            if state.halted {
                return None;
            }

            state.sleeping = true;
            probes::worker_sleep!(|| self.id as u64);
            state = self.cv.wait(state).unwrap();
            probes::worker_wake!(|| self.id as u64);
            state.sleeping = false;
        }
    }

    fn push(&self, kind: QueueKind, cmd: PooledCmd) {
        let mut state = self.state.lock().unwrap();
        state
            .queues
            .cmds_mut(kind)
            .expect("command queues exclude ISC")
            .push_back(cmd);
        self.wake(state);
    }

    fn push_msg(&self, msg: HaMsg) {
        let mut state = self.state.lock().unwrap();
        state.queues.isc.push_back(msg);
        self.wake(state);
    }

    fn wake(&self, state: std::sync::MutexGuard<'_, WorkerState>) {
        if state.sleeping {
            self.cv.notify_one();
        }
    }

    /// Remove every queued command matching `pred`.
    fn purge(&self, pred: &dyn Fn(&Command) -> bool) -> Vec<PooledCmd> {
        let mut state = self.state.lock().unwrap();
        let mut purged = Vec::new();
        for kind in [QueueKind::Done, QueueKind::Rtr, QueueKind::Incoming] {
            let queue = state.queues.cmds_mut(kind).expect("command queue");
            let (out, keep): (VecDeque<_>, VecDeque<_>) =
                std::mem::take(queue).into_iter().partition(|c| pred(c));
            *queue = keep;
            purged.extend(out);
        }
        purged
    }

    fn clear_isc(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let count = state.queues.isc.len();
        state.queues.isc.clear();
        count
    }

    fn halt(&self) {
        let mut state = self.state.lock().unwrap();
        state.halted = true;
        self.cv.notify_all();
    }

    fn is_idle(&self) -> bool {
        self.state.lock().unwrap().queues.is_empty()
    }
}

/// The set of worker slots, and the routing of work onto them.
pub(crate) struct Dispatcher {
    slots: Vec<std::sync::Arc<WorkerSlot>>,
}
impl Dispatcher {
    pub(crate) fn new(count: NonZeroUsize) -> Self {
        let slots = (0..count.get())
            .map(|id| std::sync::Arc::new(WorkerSlot::new(id)))
            .collect();
        Self { slots }
    }

    pub(crate) fn slots(&self) -> &[std::sync::Arc<WorkerSlot>] {
        &self.slots
    }
    pub(crate) fn count(&self) -> usize {
        self.slots.len()
    }

    fn by_source(&self, nexus: &Nexus) -> &WorkerSlot {
        let key = (nexus.port as usize)
            .wrapping_mul(crate::common::MAX_INIT_PER_PORT)
            .wrapping_add(nexus.initiator as usize);
        &self.slots[key % self.slots.len()]
    }
    fn by_lun(&self, lun: LunId) -> &WorkerSlot {
        &self.slots[lun as usize % self.slots.len()]
    }

    pub(crate) fn push_incoming(&self, cmd: PooledCmd) {
        self.by_source(&cmd.nexus).push(QueueKind::Incoming, cmd)
    }
    pub(crate) fn push_rtr(&self, cmd: PooledCmd) {
        self.by_lun(cmd.nexus.lun).push(QueueKind::Rtr, cmd)
    }
    pub(crate) fn push_done(&self, cmd: PooledCmd) {
        self.by_lun(cmd.nexus.lun).push(QueueKind::Done, cmd)
    }
    pub(crate) fn push_msg(&self, msg: HaMsg) {
        self.by_lun(msg.lun).push_msg(msg)
    }

    /// Pull every matching command out of all worker queues.
    pub(crate) fn purge(
        &self,
        pred: impl Fn(&Command) -> bool,
    ) -> Vec<PooledCmd> {
        self.slots.iter().flat_map(|s| s.purge(&pred)).collect()
    }
    pub(crate) fn clear_isc(&self) -> usize {
        self.slots.iter().map(|s| s.clear_isc()).sum()
    }
    pub(crate) fn halt(&self) {
        self.slots.iter().for_each(|s| s.halt());
    }
    pub(crate) fn is_idle(&self) -> bool {
        self.slots.iter().all(|s| s.is_idle())
    }
}
