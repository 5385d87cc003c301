// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SCSI status codes, sense data, and the terminal [Status] of a command.

use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;

use crate::common::Tag;
use crate::task::TaskResponse;

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
#[repr(u8)]
pub enum ScsiStatus {
    Good = 0x00,
    CheckCondition = 0x02,
    Busy = 0x08,
    ReservationConflict = 0x18,
    TaskSetFull = 0x28,
    TaskAborted = 0x40,
}

/// Sense keys
pub mod key {
    pub const NO_SENSE: u8 = 0x0;
    pub const NOT_READY: u8 = 0x2;
    pub const MEDIUM_ERROR: u8 = 0x3;
    pub const HARDWARE_ERROR: u8 = 0x4;
    pub const ILLEGAL_REQUEST: u8 = 0x5;
    pub const UNIT_ATTENTION: u8 = 0x6;
    pub const DATA_PROTECT: u8 = 0x7;
    pub const ABORTED_COMMAND: u8 = 0xb;
    pub const MISCOMPARE: u8 = 0xe;
}

/// Additional sense code and qualifier pairs
pub mod asc {
    pub type Asc = (u8, u8);

    pub const NO_ADDITIONAL: Asc = (0x00, 0x00);
    pub const NOT_READY_INIT_REQUIRED: Asc = (0x04, 0x02);
    pub const NOT_READY_MANUAL_INTERVENTION: Asc = (0x04, 0x03);
    pub const NOT_READY_OFFLINE: Asc = (0x04, 0x12);
    pub const WRITE_ERROR: Asc = (0x0c, 0x02);
    pub const UNRECOVERED_READ: Asc = (0x11, 0x00);
    pub const MISCOMPARE_DURING_VERIFY: Asc = (0x1d, 0x00);
    pub const INVALID_OPCODE: Asc = (0x20, 0x00);
    pub const LBA_OUT_OF_RANGE: Asc = (0x21, 0x00);
    pub const INVALID_FIELD_IN_CDB: Asc = (0x24, 0x00);
    pub const LUN_NOT_SUPPORTED: Asc = (0x25, 0x00);
    pub const INVALID_FIELD_IN_PARAM: Asc = (0x26, 0x00);
    pub const INVALID_RELEASE: Asc = (0x26, 0x04);
    pub const WRITE_PROTECTED: Asc = (0x27, 0x00);
    pub const RESET_OCCURRED: Asc = (0x29, 0x00);
    pub const POWER_ON: Asc = (0x29, 0x01);
    pub const BUS_RESET: Asc = (0x29, 0x02);
    pub const TARGET_RESET: Asc = (0x29, 0x03);
    pub const I_T_NEXUS_LOSS: Asc = (0x29, 0x07);
    pub const MODE_PARAMS_CHANGED: Asc = (0x2a, 0x01);
    pub const RESERVATIONS_PREEMPTED: Asc = (0x2a, 0x03);
    pub const RESERVATIONS_RELEASED: Asc = (0x2a, 0x04);
    pub const REGISTRATIONS_PREEMPTED: Asc = (0x2a, 0x05);
    pub const ASYM_ACCESS_CHANGED: Asc = (0x2a, 0x06);
    pub const CAPACITY_CHANGED: Asc = (0x2a, 0x09);
    pub const MEDIUM_NOT_PRESENT: Asc = (0x3a, 0x00);
    pub const LUN_INVENTORY_CHANGED: Asc = (0x3f, 0x0e);
    pub const INTERNAL_TARGET_FAILURE: Asc = (0x44, 0x00);
    pub const COMMAND_PHASE_ERROR: Asc = (0x4a, 0x00);
    pub const TAGGED_OVERLAPPED: u8 = 0x4d;
    pub const OVERLAPPED_COMMANDS: Asc = (0x4e, 0x00);
}

/// Sense-key specific field pointer, naming the offending byte (and
/// optionally bit) of either the CDB or the parameter data.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPointer {
    /// The pointer refers to the CDB rather than the parameter list
    pub command: bool,
    pub byte: u16,
    pub bit: Option<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenseData {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
    pub info: Option<u32>,
    pub field: Option<FieldPointer>,
}

/// Length of fixed-format sense data as produced by [SenseData::to_fixed]
pub const FIXED_SENSE_LEN: usize = 18;

impl SenseData {
    pub const fn new(key: u8, code: asc::Asc) -> Self {
        Self { key, asc: code.0, ascq: code.1, info: None, field: None }
    }

    pub fn with_info(mut self, info: u32) -> Self {
        self.info = Some(info);
        self
    }
    pub fn with_field(mut self, field: FieldPointer) -> Self {
        self.field = Some(field);
        self
    }

    pub const fn asc_pair(&self) -> asc::Asc {
        (self.asc, self.ascq)
    }

    pub fn invalid_opcode() -> Self {
        Self::new(key::ILLEGAL_REQUEST, asc::INVALID_OPCODE).with_field(
            FieldPointer { command: true, byte: 0, bit: None },
        )
    }
    pub fn invalid_field_in_cdb(byte: u16, bit: Option<u8>) -> Self {
        Self::new(key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB)
            .with_field(FieldPointer { command: true, byte, bit })
    }
    pub fn invalid_field_in_param(byte: u16, bit: Option<u8>) -> Self {
        Self::new(key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_PARAM)
            .with_field(FieldPointer { command: false, byte, bit })
    }
    pub fn invalid_release() -> Self {
        Self::new(key::ILLEGAL_REQUEST, asc::INVALID_RELEASE)
    }
    pub fn lba_out_of_range() -> Self {
        Self::new(key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE)
    }
    pub fn lun_not_supported() -> Self {
        Self::new(key::ILLEGAL_REQUEST, asc::LUN_NOT_SUPPORTED)
    }
    pub fn write_protected() -> Self {
        Self::new(key::DATA_PROTECT, asc::WRITE_PROTECTED)
    }
    pub fn overlapped_commands() -> Self {
        Self::new(key::ABORTED_COMMAND, asc::OVERLAPPED_COMMANDS)
    }
    /// TAGGED OVERLAPPED COMMANDS, with the low byte of the duplicated tag
    /// carried in the qualifier.
    pub fn tagged_overlapped(tag: Tag) -> Self {
        Self::new(key::ABORTED_COMMAND, (asc::TAGGED_OVERLAPPED, tag as u8))
    }
    pub fn internal_failure() -> Self {
        Self::new(key::HARDWARE_ERROR, asc::INTERNAL_TARGET_FAILURE)
    }
    pub fn aborted_command() -> Self {
        Self::new(key::ABORTED_COMMAND, asc::NO_ADDITIONAL)
    }
    pub fn phase_error() -> Self {
        Self::new(key::ABORTED_COMMAND, asc::COMMAND_PHASE_ERROR)
    }
    /// COMPARE AND WRITE mismatch, at `offset` bytes into the compared data
    pub fn miscompare(offset: u32) -> Self {
        Self::new(key::MISCOMPARE, asc::MISCOMPARE_DURING_VERIFY)
            .with_info(offset)
    }

    /// Encode as fixed-format (response code 0x70) sense data.
    pub fn to_fixed(&self) -> [u8; FIXED_SENSE_LEN] {
        let mut buf = [0u8; FIXED_SENSE_LEN];
        buf[0] = 0x70;
        buf[2] = self.key & 0xf;
        if let Some(info) = self.info {
            buf[0] |= 0x80;
            buf[3..7].copy_from_slice(&info.to_be_bytes());
        }
        buf[7] = (FIXED_SENSE_LEN - 8) as u8;
        buf[12] = self.asc;
        buf[13] = self.ascq;
        if let Some(fp) = self.field {
            buf[15] = 0x80;
            if fp.command {
                buf[15] |= 0x40;
            }
            if let Some(bit) = fp.bit {
                buf[15] |= 0x08 | (bit & 0x7);
            }
            buf[16..18].copy_from_slice(&fp.byte.to_be_bytes());
        }
        buf
    }

    /// Decode fixed-format sense data.
    pub fn from_fixed(buf: &[u8]) -> Option<Self> {
        if buf.len() < 14 || (buf[0] & 0x7f) != 0x70 {
            return None;
        }
        let info = (buf[0] & 0x80 != 0)
            .then(|| u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]));
        let field = (buf.len() >= FIXED_SENSE_LEN && buf[15] & 0x80 != 0)
            .then(|| FieldPointer {
                command: buf[15] & 0x40 != 0,
                byte: u16::from_be_bytes([buf[16], buf[17]]),
                bit: (buf[15] & 0x08 != 0).then_some(buf[15] & 0x7),
            });
        Some(Self {
            key: buf[2] & 0xf,
            asc: buf[12],
            ascq: buf[13],
            info,
            field,
        })
    }
}

/// Terminal (or not-yet-terminal) state of a command.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Status {
    /// Command has not yet reached a terminal state
    #[default]
    Pending,
    /// SCSI status, with sense data for CHECK CONDITION
    Scsi { status: ScsiStatus, sense: Option<SenseData> },
    /// Terminated by task management, with no status to be returned
    Aborted,
    /// Response to a task management function
    Task(TaskResponse),
}
impl Status {
    pub const fn good() -> Self {
        Self::Scsi { status: ScsiStatus::Good, sense: None }
    }
    pub const fn check(sense: SenseData) -> Self {
        Self::Scsi { status: ScsiStatus::CheckCondition, sense: Some(sense) }
    }
    pub const fn busy() -> Self {
        Self::Scsi { status: ScsiStatus::Busy, sense: None }
    }
    pub const fn task_set_full() -> Self {
        Self::Scsi { status: ScsiStatus::TaskSetFull, sense: None }
    }
    pub const fn conflict() -> Self {
        Self::Scsi { status: ScsiStatus::ReservationConflict, sense: None }
    }
    pub const fn task_aborted() -> Self {
        Self::Scsi { status: ScsiStatus::TaskAborted, sense: None }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Status::Pending)
    }
    pub fn is_good(&self) -> bool {
        matches!(self, Status::Scsi { status: ScsiStatus::Good, .. })
    }
    pub fn scsi_status(&self) -> Option<ScsiStatus> {
        match self {
            Status::Scsi { status, .. } => Some(*status),
            _ => None,
        }
    }
    pub fn sense(&self) -> Option<&SenseData> {
        match self {
            Status::Scsi { sense, .. } => sense.as_ref(),
            _ => None,
        }
    }

    /// Compact code for probes
    pub(crate) fn probe_code(&self) -> u8 {
        match self {
            Status::Pending => 0xff,
            Status::Scsi { status, .. } => *status as u8,
            Status::Aborted => 0xfe,
            Status::Task(_) => 0xfd,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixed_format_field_pointer() {
        let sense = SenseData::invalid_field_in_param(14, Some(6));
        let buf = sense.to_fixed();
        assert_eq!(buf[0], 0x70);
        assert_eq!(buf[2], key::ILLEGAL_REQUEST);
        assert_eq!((buf[12], buf[13]), asc::INVALID_FIELD_IN_PARAM);
        // SKSV set, C/D clear (parameter data), BPV set, bit 6
        assert_eq!(buf[15], 0x80 | 0x08 | 6);
        assert_eq!(&buf[16..18], &[0, 14]);

        assert_eq!(SenseData::from_fixed(&buf), Some(sense));
    }

    #[test]
    fn tagged_overlap_carries_tag() {
        let sense = SenseData::tagged_overlapped(0x1234);
        assert_eq!(sense.asc_pair(), (0x4d, 0x34));
        assert_eq!(sense.key, key::ABORTED_COMMAND);
    }

    #[test]
    fn status_helpers() {
        assert!(Status::good().is_good());
        assert!(!Status::busy().is_good());
        assert!(Status::default().is_pending());
        let s = Status::check(SenseData::lun_not_supported());
        assert_eq!(s.scsi_status(), Some(ScsiStatus::CheckCondition));
        assert_eq!(s.sense().unwrap().asc_pair(), asc::LUN_NOT_SUPPORTED);
    }
}
