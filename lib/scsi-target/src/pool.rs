// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded pools of preallocated [Command] objects.
//!
//! Frontends acquire commands from a [CmdPool] and the core returns them when
//! the command completes.  A pool is sized up front; once it is drained,
//! acquisition fails with [PoolError::Busy] (after trying the emergency pool
//! and the optional heap fallback), giving natural backpressure to initiators.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use slog::{debug, info, Logger};
use thiserror::Error;

use crate::cmd::{CmdId, Command};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// No free object in the pool or its fallbacks
    #[error("command pool exhausted")]
    Busy,

    /// Pool has been marked for teardown
    #[error("command pool is being torn down")]
    Invalid,
}

#[derive(Clone, Default)]
pub struct PoolOpts {
    /// Secondary pool consulted when this one is exhausted
    pub emergency: Option<Arc<CmdPool>>,
    /// Number of heap-allocated commands permitted beyond capacity
    pub heap_fallback: usize,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub outstanding: usize,
    pub total_allocated: u64,
    pub total_freed: u64,
    pub emergency_allocated: u64,
    pub fallback_outstanding: usize,
}

struct PoolInner {
    free: Vec<Box<Command>>,
    outstanding: usize,
    fallback_outstanding: usize,
    total_allocated: u64,
    total_freed: u64,
    emergency_allocated: u64,
    emergency: Option<Arc<CmdPool>>,
    invalid: bool,
    torn_down: bool,
}

pub struct CmdPool {
    name: String,
    capacity: usize,
    heap_fallback: usize,
    inner: Mutex<PoolInner>,
    log: Logger,
}
impl CmdPool {
    pub fn create(
        log: &Logger,
        name: &str,
        capacity: usize,
        opts: PoolOpts,
    ) -> Arc<Self> {
        let free = (0..capacity).map(|_| Box::new(Command::blank())).collect();
        Arc::new(Self {
            name: name.to_string(),
            capacity,
            heap_fallback: opts.heap_fallback,
            inner: Mutex::new(PoolInner {
                free,
                outstanding: 0,
                fallback_outstanding: 0,
                total_allocated: 0,
                total_freed: 0,
                emergency_allocated: 0,
                emergency: opts.emergency,
                invalid: false,
                torn_down: false,
            }),
            log: log.new(slog::o!("pool" => name.to_string())),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquire a blank command, identified by a fresh [CmdId].
    ///
    /// Never blocks.  Falls back to the emergency pool (if configured), then
    /// to a bounded number of heap allocations, before failing with
    /// [PoolError::Busy].
    pub fn acquire(self: &Arc<Self>) -> Result<PooledCmd, PoolError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.invalid {
            return Err(PoolError::Invalid);
        }
        if let Some(mut cmd) = inner.free.pop() {
            assert!(cmd.is_free(), "pooled command reused while live");
            inner.outstanding += 1;
            inner.total_allocated += 1;
            drop(inner);

            cmd.id = CmdId::next();
            return Ok(PooledCmd {
                cmd: Some(cmd),
                pool: self.clone(),
                origin: Origin::Pool,
            });
        }

        if let Some(emergency) = inner.emergency.clone() {
            drop(inner);
            if let Ok(cmd) = emergency.acquire() {
                self.inner.lock().unwrap().emergency_allocated += 1;
                return Ok(cmd);
            }
            inner = self.inner.lock().unwrap();
        }

        if inner.fallback_outstanding < self.heap_fallback {
            inner.fallback_outstanding += 1;
            inner.total_allocated += 1;
            drop(inner);

            let mut cmd = Box::new(Command::blank());
            cmd.id = CmdId::next();
            return Ok(PooledCmd {
                cmd: Some(cmd),
                pool: self.clone(),
                origin: Origin::Heap,
            });
        }
        Err(PoolError::Busy)
    }

    fn put(&self, mut cmd: Box<Command>, origin: Origin) {
        cmd.reset();

        let mut inner = self.inner.lock().unwrap();
        inner.total_freed += 1;
        match origin {
            Origin::Pool => {
                assert!(inner.outstanding > 0, "pool release underflow");
                inner.outstanding -= 1;
                if !inner.torn_down {
                    inner.free.push(cmd);
                }
            }
            Origin::Heap => {
                assert!(inner.fallback_outstanding > 0);
                inner.fallback_outstanding -= 1;
            }
        }
        self.teardown_if_idle(&mut inner);
    }

    /// Mark the pool for teardown.  Outstanding commands may still be
    /// released; the pool's storage is freed once the last one is returned.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.invalid {
            info!(self.log, "pool marked for teardown";
                "outstanding" => inner.outstanding);
            inner.invalid = true;
        }
        self.teardown_if_idle(&mut inner);
    }

    fn teardown_if_idle(&self, inner: &mut PoolInner) {
        if inner.invalid
            && !inner.torn_down
            && inner.outstanding == 0
            && inner.fallback_outstanding == 0
        {
            inner.free.clear();
            inner.free.shrink_to_fit();
            inner.emergency = None;
            inner.torn_down = true;
            debug!(self.log, "pool torn down");
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.lock().unwrap().torn_down
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        PoolStats {
            capacity: self.capacity,
            free: inner.free.len(),
            outstanding: inner.outstanding,
            total_allocated: inner.total_allocated,
            total_freed: inner.total_freed,
            emergency_allocated: inner.emergency_allocated,
            fallback_outstanding: inner.fallback_outstanding,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Origin {
    Pool,
    Heap,
}

/// A [Command] on loan from a [CmdPool].
///
/// Dropping it (or calling [PooledCmd::release]) returns the object to the
/// pool it was taken from, in its free state.
pub struct PooledCmd {
    cmd: Option<Box<Command>>,
    pool: Arc<CmdPool>,
    origin: Origin,
}
impl PooledCmd {
    pub fn pool(&self) -> &Arc<CmdPool> {
        &self.pool
    }
    pub fn release(self) {
        drop(self)
    }
}
impl Deref for PooledCmd {
    type Target = Command;

    fn deref(&self) -> &Self::Target {
        self.cmd.as_deref().expect("command present until drop")
    }
}
impl DerefMut for PooledCmd {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.cmd.as_deref_mut().expect("command present until drop")
    }
}
impl Drop for PooledCmd {
    fn drop(&mut self) {
        if let Some(cmd) = self.cmd.take() {
            self.pool.put(cmd, self.origin);
        }
    }
}
impl std::fmt::Debug for PooledCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cmd::{Cdb, ScsiIo, TagType};
    use crate::common::Nexus;
    use crate::test_logger;

    use proptest::prelude::*;

    #[test]
    fn exhaustion_is_busy() {
        let pool = CmdPool::create(&test_logger(), "p", 2, Default::default());
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.acquire().err(), Some(PoolError::Busy));

        drop(a);
        let c = pool.acquire().unwrap();
        assert!(c.is_free());
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 2);
        assert_eq!(stats.total_allocated, 3);
        assert_eq!(stats.total_freed, 1);
        drop((b, c));
    }

    #[test]
    fn release_scrubs_payload() {
        let pool = CmdPool::create(&test_logger(), "p", 1, Default::default());
        let mut cmd = pool.acquire().unwrap();
        cmd.setup_scsi(
            Nexus::new(0, 1, 0, 0),
            ScsiIo::new(Cdb::test_unit_ready(), 7, TagType::Simple),
        );
        assert!(!cmd.is_free());
        cmd.release();

        let cmd = pool.acquire().unwrap();
        assert!(cmd.is_free());
        assert_eq!(cmd.nexus, Nexus::default());
    }

    #[test]
    fn emergency_then_heap_fallback() {
        let log = test_logger();
        let emergency = CmdPool::create(&log, "emerg", 1, Default::default());
        let pool = CmdPool::create(
            &log,
            "p",
            1,
            PoolOpts { emergency: Some(emergency.clone()), heap_fallback: 1 },
        );

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(Arc::ptr_eq(b.pool(), &emergency));
        let c = pool.acquire().unwrap();
        assert!(Arc::ptr_eq(c.pool(), &pool));
        assert_eq!(pool.stats().fallback_outstanding, 1);
        assert_eq!(pool.acquire().err(), Some(PoolError::Busy));

        drop((a, b, c));
        assert_eq!(pool.stats().fallback_outstanding, 0);
        assert_eq!(emergency.stats().outstanding, 0);
        assert_eq!(pool.stats().free, 1);
    }

    #[test]
    fn deferred_teardown() {
        let pool = CmdPool::create(&test_logger(), "p", 4, Default::default());
        let a = pool.acquire().unwrap();

        pool.invalidate();
        assert_eq!(pool.acquire().err(), Some(PoolError::Invalid));
        assert!(!pool.is_torn_down());

        drop(a);
        assert!(pool.is_torn_down());
        assert_eq!(pool.stats().free, 0);
    }

    proptest! {
        #[test]
        fn conservation(ops in prop::collection::vec(any::<bool>(), 1..200)) {
            let pool =
                CmdPool::create(&test_logger(), "p", 8, Default::default());
            let mut held = Vec::new();
            for acquire in ops {
                if acquire {
                    match pool.acquire() {
                        Ok(cmd) => held.push(cmd),
                        Err(e) => {
                            prop_assert_eq!(e, PoolError::Busy);
                            prop_assert_eq!(held.len(), 8);
                        }
                    }
                } else if let Some(cmd) = held.pop() {
                    cmd.release();
                }
                let stats = pool.stats();
                prop_assert_eq!(stats.free + stats.outstanding, 8);
                prop_assert_eq!(stats.outstanding, held.len());
            }
        }
    }
}
