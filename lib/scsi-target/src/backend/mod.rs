// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage backends, which execute commands once they are ready to run.

use std::sync::Weak;
use std::time::Instant;

use byteorder::{BigEndian, ByteOrder};

use crate::cmd::cdb::{op, Cdb};
use crate::cmd::{Command, Extent};
use crate::controller::Shared;
use crate::pool::PooledCmd;
use crate::sense::{SenseData, Status};

mod in_memory;
pub use in_memory::InMemoryBackend;

mod noop;
pub use noop::NoopBackend;

/// When no block size is specified for a backend, a default of 512B is used.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LunInfo {
    /// Size (in bytes) per block
    pub block_size: u32,
    /// Device size in blocks (see above)
    pub num_blocks: u64,
    /// Device is read-only
    pub read_only: bool,
    /// Device supports UNMAP
    pub supports_unmap: bool,
}

/// Operation requested of a backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Read { lba: u64, blocks: u64 },
    Write { lba: u64, blocks: u64 },
    /// VERIFY without byte comparison: check the range is readable
    Verify { lba: u64, blocks: u64 },
    /// Replicate the single block of data-out across the range
    WriteSame { lba: u64, blocks: u64 },
    /// Data-out holds `blocks` blocks to compare, then as many to write
    CompareAndWrite { lba: u64, blocks: u64 },
    /// SYNCHRONIZE CACHE
    Flush,
    Unmap(Vec<Extent>),
    Format,
    StartStop { start: bool },
    /// INQUIRY, READ CAPACITY, LOG SENSE: answered from [LunInfo]
    Inquire,
}
impl Operation {
    pub const fn is_write(&self) -> bool {
        matches!(
            self,
            Operation::Write { .. }
                | Operation::WriteSame { .. }
                | Operation::CompareAndWrite { .. }
                | Operation::Unmap(_)
                | Operation::Format
        )
    }
}

pub trait Backend: Send + Sync + 'static {
    fn info(&self) -> LunInfo;

    /// Read or write user data
    fn data_submit(&self, io: BackendIo);

    /// Commands modifying device configuration or state
    fn config_write(&self, io: BackendIo);

    /// Commands reporting device configuration
    fn config_read(&self, io: BackendIo);

    /// LUN has been removed and drained of commands
    fn shutdown(&self) {}
}

/// A command handed to a [Backend], which must eventually be completed via
/// [BackendIo::complete].
pub struct BackendIo {
    cmd: Option<PooledCmd>,
    op: Operation,
    ctl: Weak<Shared>,
    time_submitted: Instant,
    _nodrop: NoDropBackendIo,
}
impl BackendIo {
    pub(crate) fn new(
        cmd: PooledCmd,
        op: Operation,
        ctl: Weak<Shared>,
    ) -> Self {
        Self {
            cmd: Some(cmd),
            op,
            ctl,
            time_submitted: Instant::now(),
            _nodrop: NoDropBackendIo,
        }
    }

    pub fn op(&self) -> &Operation {
        &self.op
    }
    pub fn cmd(&self) -> &Command {
        self.cmd.as_deref().expect("command present until completion")
    }
    fn cmd_mut(&mut self) -> &mut Command {
        self.cmd.as_deref_mut().expect("command present until completion")
    }
    pub fn cdb(&self) -> Cdb {
        *self.cmd().cdb().expect("backend commands carry a CDB")
    }
    /// Data-out supplied by the initiator
    pub fn data(&self) -> &[u8] {
        self.cmd().data()
    }
    /// Buffer for data-in
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self
            .cmd_mut()
            .scsi_mut()
            .expect("backend commands carry a CDB")
            .data
    }
    pub fn elapsed(&self) -> std::time::Duration {
        self.time_submitted.elapsed()
    }

    /// Issue a completion for this command.
    pub fn complete(self, status: Status) {
        let BackendIo { cmd, ctl, _nodrop, .. } = self;
        std::mem::forget(_nodrop);

        let Some(mut cmd) = cmd else {
            return;
        };
        cmd.status = status;
        match ctl.upgrade() {
            Some(ctl) => ctl.backend_done(cmd),
            // Controller is gone; the command just returns to its pool
            None => drop(cmd),
        }
    }

    /// Answer an informational command from `info`.
    pub fn complete_inquire(mut self, info: &LunInfo) {
        match respond_inquire(info, &self.cdb()) {
            Ok(data) => {
                *self.data_mut() = data;
                self.complete(Status::good());
            }
            Err(sense) => self.complete(Status::check(sense)),
        }
    }
}

/// Marker struct to ensure that [BackendIo] is completed before drop
struct NoDropBackendIo;
impl Drop for NoDropBackendIo {
    fn drop(&mut self) {
        panic!("BackendIo should be complete()-ed before drop");
    }
}

pub const VENDOR_ID: &[u8; 8] = b"SCSITGT ";
pub const PRODUCT_ID: &[u8; 16] = b"VIRTUAL-DISK    ";
pub const PRODUCT_REV: &[u8; 4] = b"0001";

/// Standard INQUIRY data for a LUN which is not present
pub fn inquiry_absent(alloc_len: usize) -> Vec<u8> {
    let mut buf = standard_inquiry();
    // Peripheral qualifier 011b, device type 1Fh
    buf[0] = 0x7f;
    buf.truncate(alloc_len);
    buf
}

fn standard_inquiry() -> Vec<u8> {
    let mut buf = vec![0u8; 36];
    buf[2] = 0x06;
    buf[3] = 0x02;
    buf[4] = (buf.len() - 5) as u8;
    // CmdQue
    buf[7] = 0x02;
    buf[8..16].copy_from_slice(VENDOR_ID);
    buf[16..32].copy_from_slice(PRODUCT_ID);
    buf[32..36].copy_from_slice(PRODUCT_REV);
    buf
}

/// Build the response to INQUIRY, READ CAPACITY or LOG SENSE.
pub fn respond_inquire(
    info: &LunInfo,
    cdb: &Cdb,
) -> Result<Vec<u8>, SenseData> {
    let alloc = cdb.xfer_len();
    let mut buf = match cdb.opcode() {
        op::INQUIRY if cdb.byte(1) & 0x1 != 0 => match cdb.byte(2) {
            // Supported VPD pages
            0x00 => vec![0, 0x00, 0, 2, 0x00, 0x80],
            0x80 => {
                let serial = b"0000000000000001";
                let mut buf = vec![0, 0x80, 0, serial.len() as u8];
                buf.extend_from_slice(serial);
                buf
            }
            _ => return Err(SenseData::invalid_field_in_cdb(2, None)),
        },
        op::INQUIRY => {
            if cdb.byte(2) != 0 {
                return Err(SenseData::invalid_field_in_cdb(2, None));
            }
            standard_inquiry()
        }
        op::READ_CAPACITY_10 => {
            let mut buf = vec![0u8; 8];
            let last = info.num_blocks.saturating_sub(1);
            let last = last.min(u32::MAX as u64) as u32;
            BigEndian::write_u32(&mut buf[0..4], last);
            BigEndian::write_u32(&mut buf[4..8], info.block_size);
            buf
        }
        op::SERVICE_ACTION_IN_16 if cdb.service_action() == 0x10 => {
            let mut buf = vec![0u8; 32];
            let last = info.num_blocks.saturating_sub(1);
            BigEndian::write_u64(&mut buf[0..8], last);
            BigEndian::write_u32(&mut buf[8..12], info.block_size);
            if info.supports_unmap {
                // LBPME
                buf[14] = 0x80;
            }
            buf
        }
        op::SERVICE_ACTION_IN_16 => {
            return Err(SenseData::invalid_field_in_cdb(1, Some(4)))
        }
        op::LOG_SENSE => match cdb.byte(2) & 0x3f {
            // Supported log pages
            0x00 => vec![0x00, 0, 0, 1, 0x00],
            _ => return Err(SenseData::invalid_field_in_cdb(2, Some(5))),
        },
        _ => return Err(SenseData::invalid_opcode()),
    };
    buf.truncate(alloc);
    Ok(buf)
}
