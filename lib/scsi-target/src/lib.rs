// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core of a SCSI target: command admission and ordering, the command object
//! pool, worker dispatch, persistent reservations, task management, and the
//! coordination protocol spoken between the two controllers of an HA pair.
//!
//! Transports (frontends) feed commands in through a [Controller], which
//! serializes them against each other on a per-[lun::Lun] basis before
//! handing them to the [backend::Backend] registered for that unit.

#![allow(clippy::style)]

pub extern crate usdt;

pub mod backend;
pub mod cmd;
pub mod common;
pub mod controller;
pub mod dispatch;
pub mod frontend;
pub mod ha;
pub mod inject;
pub mod lun;
pub mod pool;
pub mod reservation;
pub mod sense;
pub mod serialize;
pub mod task;

pub use controller::{Controller, ControllerOpts, CtlError};
pub use pool::{CmdPool, PoolError, PooledCmd};

#[usdt::provider(provider = "scsi_target")]
mod probes {
    fn cmd_admit(lun: u32, cmd_id: u64, action: &str) {}
    fn cmd_block(lun: u32, cmd_id: u64) {}
    fn cmd_unblock(lun: u32, cmd_id: u64) {}
    fn cmd_exec(lun: u32, cmd_id: u64, opcode: u8) {}
    fn cmd_done(lun: u32, cmd_id: u64, status: u8, queue_ns: u64) {}

    fn worker_sleep(worker_id: u64) {}
    fn worker_wake(worker_id: u64) {}

    fn ha_send(lun: u32, msg: &str) {}
    fn ha_recv(lun: u32, msg: &str) {}
}

/// Logger which discards everything, for use in tests.
#[cfg(test)]
pub(crate) fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}
