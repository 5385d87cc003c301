// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The target controller: directory of LUNs, ports and pools, the worker
//! threads driving commands through admission and execution, and the
//! management plane.
//!
//! Lock ordering: the directory lock may be taken before a LUN lock, never
//! after one.  The HA state lock is a leaf.  No LUN lock is held while
//! calling into a backend, a port, or the HA link.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use slog::{info, o, warn, Logger};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::backend::Backend;
use crate::cmd::Reply;
use crate::common::{LunId, PortId, MAX_LUNS, MAX_PORTS};
use crate::dispatch::{self, Dispatcher, Work, WorkerSlot};
use crate::frontend::{Completion, Port, SyncWaiter};
use crate::ha::{
    HaError, HaLink, HaLockGuard, HaMode, HaReceiver, HaRole, HaState,
};
use crate::inject::ErrorInjection;
use crate::lun::pending::UaBits;
use crate::lun::{
    Lun, LunCondition, LunFlags, LunOpts, OoaSnapshot, SyncPolicy,
};
use crate::pool::{CmdPool, PoolError, PoolOpts, PooledCmd};

mod exec;

#[cfg(test)]
mod test;

/// Default size of a data segment crossing the HA link
pub const DEFAULT_XFER_SEGMENT: usize = 128 * 1024;

#[derive(Debug, Error)]
pub enum CtlError {
    #[error("LUN {0} does not exist")]
    NoSuchLun(LunId),

    #[error("LUN {0} already exists")]
    LunExists(LunId),

    #[error("port {0} does not exist")]
    NoSuchPort(PortId),

    #[error("port {0} already exists")]
    PortExists(PortId),

    /// Commands are not accepted through a disabled port
    #[error("port {0} is disabled")]
    PortDisabled(PortId),

    #[error("pool {0} does not exist")]
    NoSuchPool(String),

    #[error("pool {0} already exists")]
    PoolExists(String),

    /// Port, initiator or LUN number out of range
    #[error("invalid nexus")]
    InvalidNexus,

    #[error("controller is shut down")]
    ShutDown,

    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Ha(#[from] HaError),
}

#[derive(Clone, Debug)]
pub struct ControllerOpts {
    pub name: String,
    /// Worker thread count, defaulting to one per CPU (capped)
    pub workers: Option<NonZeroUsize>,
    /// Identity of this controller within an HA pair
    pub ha_id: u32,
    pub ha_mode: HaMode,
    pub xfer_segment: usize,
    /// Number of commands the HA partner may have proxied here at once
    pub partner_pool: usize,
}
impl Default for ControllerOpts {
    fn default() -> Self {
        Self {
            name: "tgt0".to_string(),
            workers: None,
            ha_id: 0,
            ha_mode: HaMode::SerializeOnly,
            xfer_segment: DEFAULT_XFER_SEGMENT,
            partner_pool: 1024,
        }
    }
}

pub(crate) struct PortEntry {
    name: String,
    port: Arc<dyn Port>,
    enabled: bool,
}

#[derive(Default)]
pub(crate) struct Directory {
    luns: BTreeMap<LunId, Arc<Lun>>,
    ports: BTreeMap<PortId, PortEntry>,
    pools: BTreeMap<String, Arc<CmdPool>>,
}

/// State shared between the [Controller] handle and its worker threads.
pub(crate) struct Shared {
    pub(crate) log: Logger,
    dir: Mutex<Directory>,
    pub(crate) dispatch: Dispatcher,
    pub(crate) ha: Mutex<HaState>,
    pub(crate) ha_cv: Condvar,
    pub(crate) ha_id: u32,
    pub(crate) ha_mode: HaMode,
    pub(crate) xfer_segment: usize,
    /// Source of proxy commands for work admitted on the partner's behalf
    pub(crate) partner_pool: Arc<CmdPool>,
    pub(crate) this: Weak<Shared>,
    halted: AtomicBool,
}
impl Shared {
    pub(crate) fn lun(&self, id: LunId) -> Option<Arc<Lun>> {
        self.dir.lock().unwrap().luns.get(&id).cloned()
    }
    pub(crate) fn luns(&self) -> Vec<Arc<Lun>> {
        self.dir.lock().unwrap().luns.values().cloned().collect()
    }
    pub(crate) fn port(&self, id: PortId) -> Option<Arc<dyn Port>> {
        self.dir.lock().unwrap().ports.get(&id).map(|p| p.port.clone())
    }
    pub(crate) fn port_states(&self) -> Vec<(PortId, bool)> {
        let dir = self.dir.lock().unwrap();
        dir.ports.iter().map(|(id, p)| (*id, p.enabled)).collect()
    }

    /// LUNs visible to initiators, in ascending order
    pub(crate) fn visible_luns(&self) -> Vec<LunId> {
        let dir = self.dir.lock().unwrap();
        dir.luns
            .values()
            .filter(|l| l.is_enabled())
            .map(|l| l.id)
            .collect()
    }

    fn submit(&self, mut cmd: PooledCmd) -> Result<(), CtlError> {
        if self.halted.load(Ordering::Acquire) {
            return Err(CtlError::ShutDown);
        }
        {
            let dir = self.dir.lock().unwrap();
            let port = cmd.nexus.port;
            match dir.ports.get(&port) {
                None => return Err(CtlError::NoSuchPort(port)),
                Some(p) if !p.enabled => {
                    return Err(CtlError::PortDisabled(port))
                }
                Some(_) => {}
            }
        }
        self.enqueue_incoming(&mut cmd);
        self.dispatch.push_incoming(cmd);
        Ok(())
    }

    pub(crate) fn enqueue_incoming(&self, cmd: &mut PooledCmd) {
        cmd.time_queued = Some(Instant::now());
    }

    /// Entry point for backend completions
    pub(crate) fn backend_done(&self, cmd: PooledCmd) {
        self.dispatch.push_done(cmd);
    }

    /// Remove a drained, invalidated LUN from the directory.
    pub(crate) fn reclaim_lun(&self, lun: Arc<Lun>) {
        {
            let mut dir = self.dir.lock().unwrap();
            match dir.luns.get(&lun.id) {
                Some(cur) if Arc::ptr_eq(cur, &lun) => {
                    dir.luns.remove(&lun.id);
                }
                _ => return,
            }
            for other in dir.luns.values() {
                other.lock().pending.establish_all(UaBits::LUN_CHANGE);
            }
        }
        lun.backend.shutdown();
        info!(lun.log, "LUN torn down");
    }

    fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        self.dispatch.halt();
    }
}

fn worker_loop(shared: Arc<Shared>, slot: Arc<WorkerSlot>) {
    while let Some(work) = slot.block_for_work() {
        match work {
            Work::Isc(msg) => shared.handle_msg(msg),
            Work::Done(cmd) => shared.process_done(cmd),
            Work::Rtr(cmd) => shared.execute(cmd),
            Work::Incoming(cmd) => shared.process_incoming(cmd),
        }
    }
}

/// A SCSI target controller.
///
/// Dropping the controller halts and joins its worker threads.
pub struct Controller {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    log: Logger,
}
impl Controller {
    pub fn new(log: &Logger, opts: ControllerOpts) -> Result<Self, CtlError> {
        // Inconsistent static tables are a build defect, not a runtime
        // condition, and these panic.
        crate::cmd::cdb::validate_table();
        crate::lun::mode::validate_templates();

        let log = log.new(o!("controller" => opts.name.clone()));
        let count = opts.workers.unwrap_or_else(dispatch::default_worker_count);
        let partner_pool = CmdPool::create(
            &log,
            &format!("{}-partner", opts.name),
            opts.partner_pool,
            PoolOpts::default(),
        );
        let shared = Arc::new_cyclic(|this| Shared {
            log: log.clone(),
            dir: Mutex::new(Directory::default()),
            dispatch: Dispatcher::new(count),
            ha: Mutex::new(HaState::default()),
            ha_cv: Condvar::new(),
            ha_id: opts.ha_id,
            ha_mode: opts.ha_mode,
            xfer_segment: opts.xfer_segment.max(1),
            partner_pool,
            this: this.clone(),
            halted: AtomicBool::new(false),
        });

        let this = Self {
            shared: shared.clone(),
            workers: Mutex::new(Vec::new()),
            log,
        };
        {
            let mut workers = this.workers.lock().unwrap();
            for slot in shared.dispatch.slots() {
                let shared = shared.clone();
                let slot = slot.clone();
                let hdl = std::thread::Builder::new()
                    .name(format!("{} worker {}", opts.name, slot.id()))
                    .spawn(move || worker_loop(shared, slot));
                match hdl {
                    Ok(hdl) => workers.push(hdl),
                    Err(e) => {
                        drop(workers);
                        this.shutdown();
                        return Err(e.into());
                    }
                }
            }
        }
        info!(this.log, "controller started"; "workers" => count.get());
        Ok(this)
    }

    pub fn worker_count(&self) -> usize {
        self.shared.dispatch.count()
    }

    /// Halt the workers and wait for them to exit.  Queued work is
    /// serviced before each worker stops.
    pub fn shutdown(&self) {
        self.shared.halt();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for hdl in workers {
            let _ = hdl.join();
        }
    }

    // Pools

    pub fn create_pool(
        &self,
        name: &str,
        capacity: usize,
        opts: PoolOpts,
    ) -> Result<Arc<CmdPool>, CtlError> {
        let mut dir = self.shared.dir.lock().unwrap();
        if dir.pools.contains_key(name) {
            return Err(CtlError::PoolExists(name.to_string()));
        }
        let pool = CmdPool::create(&self.log, name, capacity, opts);
        dir.pools.insert(name.to_string(), pool.clone());
        Ok(pool)
    }
    pub fn pool(&self, name: &str) -> Result<Arc<CmdPool>, CtlError> {
        let dir = self.shared.dir.lock().unwrap();
        dir.pools
            .get(name)
            .cloned()
            .ok_or_else(|| CtlError::NoSuchPool(name.to_string()))
    }
    /// Remove a pool from the directory.  Its storage is released once the
    /// last outstanding command returns.
    pub fn destroy_pool(&self, name: &str) -> Result<(), CtlError> {
        let pool = self
            .shared
            .dir
            .lock()
            .unwrap()
            .pools
            .remove(name)
            .ok_or_else(|| CtlError::NoSuchPool(name.to_string()))?;
        pool.invalidate();
        Ok(())
    }

    // LUNs

    /// Register a LUN.  It starts disabled.
    pub fn add_lun(
        &self,
        id: LunId,
        backend: Arc<dyn Backend>,
        opts: &LunOpts,
    ) -> Result<Arc<Lun>, CtlError> {
        if id >= MAX_LUNS {
            return Err(CtlError::InvalidNexus);
        }
        let paired = self.ha_role() == HaRole::Paired;
        let mut dir = self.shared.dir.lock().unwrap();
        if dir.luns.contains_key(&id) {
            return Err(CtlError::LunExists(id));
        }
        let lun = Lun::new(&self.log, id, backend, opts);
        if paired && !opts.primary {
            lun.lock().flags.remove(LunFlags::PRIMARY);
        }
        for other in dir.luns.values() {
            other.lock().pending.establish_all(UaBits::LUN_CHANGE);
        }
        dir.luns.insert(id, lun.clone());
        info!(lun.log, "LUN added"; "info" => ?lun.info());
        Ok(lun)
    }

    fn with_lun<T>(
        &self,
        id: LunId,
        f: impl FnOnce(&Lun) -> T,
    ) -> Result<T, CtlError> {
        let lun = self.shared.lun(id).ok_or(CtlError::NoSuchLun(id))?;
        if lun.flags().contains(LunFlags::INVALID) {
            return Err(CtlError::NoSuchLun(id));
        }
        Ok(f(&lun))
    }

    pub fn enable_lun(&self, id: LunId) -> Result<(), CtlError> {
        self.with_lun(id, |lun| {
            lun.lock().flags.remove(LunFlags::DISABLED);
            info!(lun.log, "LUN enabled");
        })
    }
    pub fn disable_lun(&self, id: LunId) -> Result<(), CtlError> {
        self.with_lun(id, |lun| {
            lun.lock().flags.insert(LunFlags::DISABLED);
            info!(lun.log, "LUN disabled");
        })
    }

    /// Remove a LUN.  Teardown is deferred until every command already
    /// admitted to it has completed.
    pub fn remove_lun(&self, id: LunId) -> Result<(), CtlError> {
        let drained = self.with_lun(id, |lun| {
            let mut state = lun.lock();
            state.flags.insert(LunFlags::INVALID | LunFlags::DISABLED);
            info!(lun.log, "LUN removal requested";
                "outstanding" => state.ooa.len());
            state.is_reclaimable()
        })?;
        if drained {
            if let Some(lun) = self.shared.lun(id) {
                self.shared.reclaim_lun(lun);
            }
        }
        Ok(())
    }

    pub fn set_lun_condition(
        &self,
        id: LunId,
        cond: LunCondition,
    ) -> Result<(), CtlError> {
        self.with_lun(id, |lun| lun.lock().set_condition(cond))
    }
    pub fn set_sync_policy(
        &self,
        id: LunId,
        policy: SyncPolicy,
    ) -> Result<(), CtlError> {
        self.with_lun(id, |lun| lun.lock().sync_policy = policy)
    }
    pub fn inject_error(
        &self,
        id: LunId,
        inj: ErrorInjection,
    ) -> Result<u32, CtlError> {
        self.with_lun(id, |lun| lun.lock().injections.add(inj))
    }
    pub fn delete_error(
        &self,
        id: LunId,
        inj_id: u32,
    ) -> Result<bool, CtlError> {
        self.with_lun(id, |lun| lun.lock().injections.remove(inj_id))
    }
    pub fn list_errors(
        &self,
        id: LunId,
    ) -> Result<Vec<(u32, ErrorInjection)>, CtlError> {
        self.with_lun(id, |lun| lun.lock().injections.list())
    }
    pub fn ooa_snapshot(
        &self,
        id: LunId,
    ) -> Result<Vec<OoaSnapshot>, CtlError> {
        self.with_lun(id, |lun| lun.ooa_snapshot())
    }
    pub fn lun(&self, id: LunId) -> Option<Arc<Lun>> {
        self.shared.lun(id)
    }
    pub fn lun_ids(&self) -> Vec<LunId> {
        self.shared.dir.lock().unwrap().luns.keys().copied().collect()
    }

    // Ports

    /// Register a frontend port.  It starts disabled.
    pub fn add_port(
        &self,
        id: PortId,
        name: &str,
        port: Arc<dyn Port>,
    ) -> Result<(), CtlError> {
        if id as usize >= MAX_PORTS {
            return Err(CtlError::InvalidNexus);
        }
        let mut dir = self.shared.dir.lock().unwrap();
        if dir.ports.contains_key(&id) {
            return Err(CtlError::PortExists(id));
        }
        dir.ports.insert(
            id,
            PortEntry { name: name.to_string(), port, enabled: false },
        );
        info!(self.log, "port added"; "port" => id, "name" => name);
        Ok(())
    }
    fn set_port_enabled(
        &self,
        id: PortId,
        enabled: bool,
    ) -> Result<(), CtlError> {
        let mut dir = self.shared.dir.lock().unwrap();
        let entry = dir.ports.get_mut(&id).ok_or(CtlError::NoSuchPort(id))?;
        entry.enabled = enabled;
        info!(self.log, "port state change";
            "port" => id, "name" => &entry.name, "enabled" => enabled);
        Ok(())
    }
    pub fn enable_port(&self, id: PortId) -> Result<(), CtlError> {
        self.set_port_enabled(id, true)
    }
    pub fn disable_port(&self, id: PortId) -> Result<(), CtlError> {
        self.set_port_enabled(id, false)
    }

    // I/O

    /// Queue a command for admission.  Its terminal state is delivered
    /// through the port it arrived on.
    ///
    /// Only conditions outside of SCSI (unknown or disabled port, shutdown)
    /// are reported here; everything else arrives as a completion.
    pub fn submit(&self, cmd: PooledCmd) -> Result<(), CtlError> {
        self.shared.submit(cmd)
    }

    /// Submit a command and block until it completes.
    pub fn submit_wait(
        &self,
        mut cmd: PooledCmd,
    ) -> Result<Completion, CtlError> {
        let waiter = Arc::new(SyncWaiter::new());
        cmd.reply = Reply::Sync(waiter.clone());
        self.shared.submit(cmd)?;
        let mut cmd = waiter.wait();
        Ok(Completion::from_cmd(&mut cmd))
    }

    /// Submit a command, resolving once it completes.
    pub async fn submit_async(
        &self,
        mut cmd: PooledCmd,
    ) -> Result<Completion, CtlError> {
        let (tx, rx) = oneshot::channel();
        cmd.reply = Reply::Async(tx);
        self.shared.submit(cmd)?;
        let mut cmd = rx.await.map_err(|_| CtlError::ShutDown)?;
        Ok(Completion::from_cmd(&mut cmd))
    }

    // HA

    pub fn ha_mode(&self) -> HaMode {
        self.shared.ha_mode
    }
    pub fn ha_role(&self) -> HaRole {
        self.shared.ha.lock().unwrap().role
    }
    /// Handle through which the link delivers inbound messages
    pub fn ha_receiver(&self) -> HaReceiver {
        HaReceiver::new(Arc::downgrade(&self.shared))
    }
    pub fn ha_attach(&self, link: Arc<dyn HaLink>) {
        self.shared.ha.lock().unwrap().link = Some(link);
    }
    /// The partner is reachable: become paired and exchange state.
    pub fn ha_link_up(&self) -> Result<(), CtlError> {
        Ok(self.shared.link_up()?)
    }
    /// The partner is gone: take over every LUN.
    pub fn ha_link_down(&self) {
        self.shared.link_down()
    }
    /// Port enablement last reported by the partner
    pub fn ha_partner_ports(&self) -> Vec<(PortId, bool)> {
        self.shared.ha.lock().unwrap().partner_ports.clone()
    }
    /// Acquire the lock shared with the HA partner.
    pub fn ha_lock(&self, timeout: Duration) -> Result<HaLockGuard, CtlError> {
        Ok(self.shared.ha_lock(timeout)?)
    }
}
impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
        if !self.shared.dispatch.is_idle() {
            warn!(self.log, "controller dropped with queued work");
        }
    }
}
