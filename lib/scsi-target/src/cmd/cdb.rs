// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command descriptor blocks and the static opcode table.

use std::fmt;

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;

pub const CDB_MAX: usize = 16;

pub mod op {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const FORMAT_UNIT: u8 = 0x04;
    pub const READ_6: u8 = 0x08;
    pub const WRITE_6: u8 = 0x0a;
    pub const INQUIRY: u8 = 0x12;
    pub const MODE_SELECT_6: u8 = 0x15;
    pub const RESERVE_6: u8 = 0x16;
    pub const RELEASE_6: u8 = 0x17;
    pub const MODE_SENSE_6: u8 = 0x1a;
    pub const START_STOP_UNIT: u8 = 0x1b;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2a;
    pub const VERIFY_10: u8 = 0x2f;
    pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
    pub const WRITE_SAME_10: u8 = 0x41;
    pub const UNMAP: u8 = 0x42;
    pub const LOG_SENSE: u8 = 0x4d;
    pub const MODE_SELECT_10: u8 = 0x55;
    pub const MODE_SENSE_10: u8 = 0x5a;
    pub const PERSISTENT_RESERVE_IN: u8 = 0x5e;
    pub const PERSISTENT_RESERVE_OUT: u8 = 0x5f;
    pub const READ_16: u8 = 0x88;
    pub const COMPARE_AND_WRITE: u8 = 0x89;
    pub const WRITE_16: u8 = 0x8a;
    pub const VERIFY_16: u8 = 0x8f;
    pub const SYNCHRONIZE_CACHE_16: u8 = 0x91;
    pub const WRITE_SAME_16: u8 = 0x93;
    pub const SERVICE_ACTION_IN_16: u8 = 0x9e;
    pub const REPORT_LUNS: u8 = 0xa0;
    pub const READ_12: u8 = 0xa8;
    pub const WRITE_12: u8 = 0xaa;
}

/// A command descriptor block of up to 16 bytes.
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cdb {
    bytes: [u8; CDB_MAX],
    len: u8,
}
impl Cdb {
    pub fn new(raw: &[u8]) -> Option<Self> {
        if raw.is_empty() || raw.len() > CDB_MAX {
            return None;
        }
        let mut bytes = [0u8; CDB_MAX];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(Self { bytes, len: raw.len() as u8 })
    }
    fn sized<const N: usize>(raw: [u8; N]) -> Self {
        let mut bytes = [0u8; CDB_MAX];
        bytes[..N].copy_from_slice(&raw);
        Self { bytes, len: N as u8 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
    pub fn len(&self) -> usize {
        self.len as usize
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }
    /// Byte at `idx`, reading as zero past the end of the CDB
    pub fn byte(&self, idx: usize) -> u8 {
        if idx < self.len() {
            self.bytes[idx]
        } else {
            0
        }
    }
    pub fn service_action(&self) -> u8 {
        self.bytes[1] & 0x1f
    }

    /// Allocation/parameter-list length, for those commands carrying one.
    pub fn xfer_len(&self) -> usize {
        let b = &self.bytes;
        match self.opcode() {
            op::INQUIRY => BigEndian::read_u16(&b[3..5]) as usize,
            op::REQUEST_SENSE | op::MODE_SENSE_6 | op::MODE_SELECT_6 => {
                b[4] as usize
            }
            op::MODE_SELECT_10
            | op::MODE_SENSE_10
            | op::LOG_SENSE
            | op::PERSISTENT_RESERVE_IN
            | op::UNMAP => BigEndian::read_u16(&b[7..9]) as usize,
            op::PERSISTENT_RESERVE_OUT => {
                BigEndian::read_u32(&b[5..9]) as usize
            }
            op::READ_CAPACITY_10 => 8,
            op::SERVICE_ACTION_IN_16 => {
                BigEndian::read_u32(&b[10..14]) as usize
            }
            op::REPORT_LUNS => BigEndian::read_u32(&b[6..10]) as usize,
            _ => 0,
        }
    }

    pub fn test_unit_ready() -> Self {
        Self::sized([op::TEST_UNIT_READY, 0, 0, 0, 0, 0])
    }
    pub fn request_sense(alloc: u8) -> Self {
        Self::sized([op::REQUEST_SENSE, 0, 0, 0, alloc, 0])
    }
    pub fn inquiry(alloc: u16) -> Self {
        let [hi, lo] = alloc.to_be_bytes();
        Self::sized([op::INQUIRY, 0, 0, hi, lo, 0])
    }
    pub fn read6(lba: u32, blocks: u8) -> Self {
        let l = lba.to_be_bytes();
        Self::sized([op::READ_6, l[1] & 0x1f, l[2], l[3], blocks, 0])
    }
    pub fn write6(lba: u32, blocks: u8) -> Self {
        let l = lba.to_be_bytes();
        Self::sized([op::WRITE_6, l[1] & 0x1f, l[2], l[3], blocks, 0])
    }
    fn rw10(opc: u8, lba: u32, blocks: u16) -> Self {
        let mut raw = [0u8; 10];
        raw[0] = opc;
        BigEndian::write_u32(&mut raw[2..6], lba);
        BigEndian::write_u16(&mut raw[7..9], blocks);
        Self::sized(raw)
    }
    pub fn read10(lba: u32, blocks: u16) -> Self {
        Self::rw10(op::READ_10, lba, blocks)
    }
    pub fn write10(lba: u32, blocks: u16) -> Self {
        Self::rw10(op::WRITE_10, lba, blocks)
    }
    fn rw16(opc: u8, lba: u64, blocks: u32) -> Self {
        let mut raw = [0u8; 16];
        raw[0] = opc;
        BigEndian::write_u64(&mut raw[2..10], lba);
        BigEndian::write_u32(&mut raw[10..14], blocks);
        Self::sized(raw)
    }
    pub fn read16(lba: u64, blocks: u32) -> Self {
        Self::rw16(op::READ_16, lba, blocks)
    }
    pub fn write16(lba: u64, blocks: u32) -> Self {
        Self::rw16(op::WRITE_16, lba, blocks)
    }
    pub fn verify10(lba: u32, blocks: u16) -> Self {
        Self::rw10(op::VERIFY_10, lba, blocks)
    }
    pub fn write_same10(lba: u32, blocks: u16, unmap: bool) -> Self {
        let mut cdb = Self::rw10(op::WRITE_SAME_10, lba, blocks);
        if unmap {
            cdb.bytes[1] |= 0x08;
        }
        cdb
    }
    pub fn compare_and_write(lba: u64, blocks: u8) -> Self {
        let mut raw = [0u8; 16];
        raw[0] = op::COMPARE_AND_WRITE;
        BigEndian::write_u64(&mut raw[2..10], lba);
        raw[13] = blocks;
        Self::sized(raw)
    }
    pub fn read_capacity10() -> Self {
        Self::sized([op::READ_CAPACITY_10, 0, 0, 0, 0, 0, 0, 0, 0, 0])
    }
    pub fn sync_cache10() -> Self {
        Self::sized([op::SYNCHRONIZE_CACHE_10, 0, 0, 0, 0, 0, 0, 0, 0, 0])
    }
    pub fn start_stop(start: bool) -> Self {
        Self::sized([op::START_STOP_UNIT, 0, 0, 0, start as u8, 0])
    }
    pub fn format_unit() -> Self {
        Self::sized([op::FORMAT_UNIT, 0, 0, 0, 0, 0])
    }
    pub fn reserve6() -> Self {
        Self::sized([op::RESERVE_6, 0, 0, 0, 0, 0])
    }
    pub fn release6() -> Self {
        Self::sized([op::RELEASE_6, 0, 0, 0, 0, 0])
    }
    pub fn mode_sense6(page: u8, pc: u8, alloc: u8) -> Self {
        Self::sized([
            op::MODE_SENSE_6,
            0x08,
            ((pc & 0x3) << 6) | (page & 0x3f),
            0,
            alloc,
            0,
        ])
    }
    pub fn mode_select6(param_len: u8) -> Self {
        Self::sized([op::MODE_SELECT_6, 0x10, 0, 0, param_len, 0])
    }
    pub fn pr_in(service_action: u8, alloc: u16) -> Self {
        let mut raw = [0u8; 10];
        raw[0] = op::PERSISTENT_RESERVE_IN;
        raw[1] = service_action & 0x1f;
        BigEndian::write_u16(&mut raw[7..9], alloc);
        Self::sized(raw)
    }
    pub fn pr_out(service_action: u8, kind: u8) -> Self {
        let mut raw = [0u8; 10];
        raw[0] = op::PERSISTENT_RESERVE_OUT;
        raw[1] = service_action & 0x1f;
        raw[2] = kind & 0xf;
        BigEndian::write_u32(&mut raw[5..9], 24);
        Self::sized(raw)
    }
    pub fn report_luns(alloc: u32) -> Self {
        let mut raw = [0u8; 12];
        raw[0] = op::REPORT_LUNS;
        BigEndian::write_u32(&mut raw[6..10], alloc);
        Self::sized(raw)
    }
}
impl fmt::Debug for Cdb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cdb[")?;
        for (i, b) in self.as_bytes().iter().enumerate() {
            if i != 0 {
                write!(f, " ")?;
            }
            write!(f, "{b:02x}")?;
        }
        write!(f, "]")
    }
}

/// Serialization class of an opcode, indexing the admission table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoStaticStr)]
#[repr(u8)]
pub enum CmdClass {
    Tur = 0,
    Read,
    Write,
    ModeSense,
    ModeSelect,
    RequestSense,
    Inquiry,
    ReadCapacity,
    Reservation,
    LogSense,
    Format,
    StartStop,
    Sync,
    Unmap,
    ReportLuns,
}
impl CmdClass {
    pub const COUNT: usize = 15;

    pub const fn idx(self) -> usize {
        self as usize
    }
}

/// Operations carried out by the core without a backend
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoStaticStr)]
pub enum CoreOp {
    TestUnitReady,
    RequestSense,
    ReportLuns,
    ModeSelect,
    ModeSense,
    Reserve,
    Release,
    PrIn,
    PrOut,
}

/// Where a command is executed once it is ready to run
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Route {
    Core(CoreOp),
    /// Block data transfer through [crate::backend::Backend::data_submit]
    Data,
    /// [crate::backend::Backend::config_write]
    ConfigWrite,
    /// [crate::backend::Backend::config_read]
    ConfigRead,
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct OpFlags: u32 {
        /// Data flows from target to initiator
        const DATA_IN = 1 << 0;
        /// Data flows from initiator to target
        const DATA_OUT = 1 << 1;
        /// Not subject to pending unit attention delivery
        const NO_UA = 1 << 2;
        /// Permitted against a legacy RESERVE(6) held by another initiator
        const ALLOW_ON_RESV = 1 << 3;
        /// Permitted for non-holders under an exclusive-access reservation
        const ALLOW_ON_PR_EXCL = 1 << 4;
        /// Permitted for non-holders under a write-exclusive reservation
        const ALLOW_ON_PR_WRESV = 1 << 5;
        const OK_ON_STOPPED = 1 << 6;
        const OK_ON_OFFLINE = 1 << 7;
        const OK_ON_INOPERABLE = 1 << 8;
        /// Can be answered for a LUN which does not exist
        const NO_LUN = 1 << 9;

        const OK_ON_ALL = Self::OK_ON_STOPPED.bits()
            | Self::OK_ON_OFFLINE.bits()
            | Self::OK_ON_INOPERABLE.bits();
        const INFO = Self::NO_UA.bits()
            | Self::ALLOW_ON_RESV.bits()
            | Self::ALLOW_ON_PR_EXCL.bits()
            | Self::OK_ON_ALL.bits()
            | Self::NO_LUN.bits();
    }
}

#[derive(Debug)]
pub struct CmdEntry {
    pub opcode: u8,
    pub name: &'static str,
    pub class: CmdClass,
    pub route: Route,
    pub flags: OpFlags,
    pub min_len: u8,
}

const fn ent(
    opcode: u8,
    name: &'static str,
    class: CmdClass,
    route: Route,
    flags: OpFlags,
    min_len: u8,
) -> CmdEntry {
    CmdEntry { opcode, name, class, route, flags, min_len }
}

use CmdClass as C;
use CoreOp as Co;

const F_RD: OpFlags = OpFlags::DATA_IN.union(OpFlags::ALLOW_ON_PR_WRESV);
const F_WR: OpFlags = OpFlags::DATA_OUT;
/// VERIFY is only supported without byte comparison, so moves no data
const F_VERIFY: OpFlags = OpFlags::ALLOW_ON_PR_WRESV;

/// Supported opcodes, sorted by opcode value.
static OPCODE_TABLE: [CmdEntry; 33] = [
    ent(
        op::TEST_UNIT_READY,
        "TEST UNIT READY",
        C::Tur,
        Route::Core(Co::TestUnitReady),
        OpFlags::ALLOW_ON_PR_EXCL,
        6,
    ),
    ent(
        op::REQUEST_SENSE,
        "REQUEST SENSE",
        C::RequestSense,
        Route::Core(Co::RequestSense),
        OpFlags::DATA_IN.union(OpFlags::INFO),
        6,
    ),
    ent(op::FORMAT_UNIT, "FORMAT UNIT", C::Format, Route::ConfigWrite, F_WR, 6),
    ent(op::READ_6, "READ(6)", C::Read, Route::Data, F_RD, 6),
    ent(op::WRITE_6, "WRITE(6)", C::Write, Route::Data, F_WR, 6),
    ent(
        op::INQUIRY,
        "INQUIRY",
        C::Inquiry,
        Route::ConfigRead,
        OpFlags::DATA_IN.union(OpFlags::INFO),
        6,
    ),
    ent(
        op::MODE_SELECT_6,
        "MODE SELECT(6)",
        C::ModeSelect,
        Route::Core(Co::ModeSelect),
        OpFlags::DATA_OUT.union(OpFlags::OK_ON_STOPPED),
        6,
    ),
    ent(
        op::RESERVE_6,
        "RESERVE(6)",
        C::Reservation,
        Route::Core(Co::Reserve),
        OpFlags::OK_ON_STOPPED,
        6,
    ),
    ent(
        op::RELEASE_6,
        "RELEASE(6)",
        C::Reservation,
        Route::Core(Co::Release),
        OpFlags::ALLOW_ON_RESV.union(OpFlags::OK_ON_STOPPED),
        6,
    ),
    ent(
        op::MODE_SENSE_6,
        "MODE SENSE(6)",
        C::ModeSense,
        Route::Core(Co::ModeSense),
        F_RD.union(OpFlags::OK_ON_STOPPED),
        6,
    ),
    ent(
        op::START_STOP_UNIT,
        "START STOP UNIT",
        C::StartStop,
        Route::ConfigWrite,
        OpFlags::OK_ON_STOPPED,
        6,
    ),
    ent(
        op::READ_CAPACITY_10,
        "READ CAPACITY(10)",
        C::ReadCapacity,
        Route::ConfigRead,
        OpFlags::DATA_IN.union(OpFlags::ALLOW_ON_PR_EXCL),
        10,
    ),
    ent(op::READ_10, "READ(10)", C::Read, Route::Data, F_RD, 10),
    ent(op::WRITE_10, "WRITE(10)", C::Write, Route::Data, F_WR, 10),
    ent(op::VERIFY_10, "VERIFY(10)", C::Read, Route::Data, F_VERIFY, 10),
    ent(
        op::SYNCHRONIZE_CACHE_10,
        "SYNCHRONIZE CACHE(10)",
        C::Sync,
        Route::ConfigWrite,
        OpFlags::empty(),
        10,
    ),
    ent(op::WRITE_SAME_10, "WRITE SAME(10)", C::Write, Route::Data, F_WR, 10),
    ent(op::UNMAP, "UNMAP", C::Unmap, Route::ConfigWrite, F_WR, 10),
    ent(
        op::LOG_SENSE,
        "LOG SENSE",
        C::LogSense,
        Route::ConfigRead,
        F_RD.union(OpFlags::OK_ON_STOPPED),
        10,
    ),
    ent(
        op::MODE_SELECT_10,
        "MODE SELECT(10)",
        C::ModeSelect,
        Route::Core(Co::ModeSelect),
        OpFlags::DATA_OUT.union(OpFlags::OK_ON_STOPPED),
        10,
    ),
    ent(
        op::MODE_SENSE_10,
        "MODE SENSE(10)",
        C::ModeSense,
        Route::Core(Co::ModeSense),
        F_RD.union(OpFlags::OK_ON_STOPPED),
        10,
    ),
    ent(
        op::PERSISTENT_RESERVE_IN,
        "PERSISTENT RESERVE IN",
        C::Reservation,
        Route::Core(Co::PrIn),
        OpFlags::DATA_IN
            .union(OpFlags::ALLOW_ON_PR_EXCL)
            .union(OpFlags::OK_ON_STOPPED),
        10,
    ),
    ent(
        op::PERSISTENT_RESERVE_OUT,
        "PERSISTENT RESERVE OUT",
        C::Reservation,
        Route::Core(Co::PrOut),
        OpFlags::DATA_OUT
            .union(OpFlags::ALLOW_ON_PR_EXCL)
            .union(OpFlags::OK_ON_STOPPED),
        10,
    ),
    ent(op::READ_16, "READ(16)", C::Read, Route::Data, F_RD, 16),
    ent(
        op::COMPARE_AND_WRITE,
        "COMPARE AND WRITE",
        C::Write,
        Route::Data,
        F_WR,
        16,
    ),
    ent(op::WRITE_16, "WRITE(16)", C::Write, Route::Data, F_WR, 16),
    ent(op::VERIFY_16, "VERIFY(16)", C::Read, Route::Data, F_VERIFY, 16),
    ent(
        op::SYNCHRONIZE_CACHE_16,
        "SYNCHRONIZE CACHE(16)",
        C::Sync,
        Route::ConfigWrite,
        OpFlags::empty(),
        16,
    ),
    ent(op::WRITE_SAME_16, "WRITE SAME(16)", C::Write, Route::Data, F_WR, 16),
    ent(
        op::SERVICE_ACTION_IN_16,
        "SERVICE ACTION IN(16)",
        C::ReadCapacity,
        Route::ConfigRead,
        OpFlags::DATA_IN.union(OpFlags::ALLOW_ON_PR_EXCL),
        16,
    ),
    ent(
        op::REPORT_LUNS,
        "REPORT LUNS",
        C::ReportLuns,
        Route::Core(Co::ReportLuns),
        OpFlags::DATA_IN.union(OpFlags::INFO),
        12,
    ),
    ent(op::READ_12, "READ(12)", C::Read, Route::Data, F_RD, 12),
    ent(op::WRITE_12, "WRITE(12)", C::Write, Route::Data, F_WR, 12),
];

/// Look up the table entry for an opcode.
pub fn lookup(opcode: u8) -> Option<&'static CmdEntry> {
    OPCODE_TABLE
        .binary_search_by_key(&opcode, |e| e.opcode)
        .ok()
        .map(|idx| &OPCODE_TABLE[idx])
}

/// Check internal consistency of the opcode table.
///
/// Called once at controller startup; an inconsistent table is a programming
/// error and so panics rather than returning an error.
pub(crate) fn validate_table() {
    for pair in OPCODE_TABLE.windows(2) {
        assert!(
            pair[0].opcode < pair[1].opcode,
            "opcode table unsorted at {:#x}",
            pair[1].opcode
        );
    }
    for e in OPCODE_TABLE.iter() {
        assert!(
            !e.flags.contains(OpFlags::DATA_IN | OpFlags::DATA_OUT),
            "{} is bidirectional",
            e.name
        );
        assert!(
            matches!(e.min_len, 6 | 10 | 12 | 16),
            "{} has bogus CDB length {}",
            e.name,
            e.min_len
        );
        if e.route == Route::Data {
            assert!(
                matches!(e.class, CmdClass::Read | CmdClass::Write),
                "{} routed as data transfer",
                e.name
            );
        }
    }
}

/// Logical block range touched by a command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Extent {
    pub lba: u64,
    /// Length in blocks, never zero
    pub len: u64,
}
impl Extent {
    /// Extent covering every block of a LUN
    pub const WHOLE: Extent = Extent { lba: 0, len: u64::MAX };

    /// Last block covered (inclusive)
    pub const fn end(&self) -> u64 {
        self.lba + (self.len - 1)
    }
    pub const fn overlaps(&self, other: &Extent) -> bool {
        self.end() >= other.lba && other.end() >= self.lba
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExtentError;

/// Decode the block range addressed by `cdb`.
///
/// Commands which address no blocks (and zero-length transfers of the larger
/// READ/WRITE variants) decode to `Ok(None)`.  A CDB too short for its
/// opcode, or one whose range wraps the LBA space, is an error.
pub fn decode_extent(cdb: &Cdb) -> Result<Option<Extent>, ExtentError> {
    let b = cdb.as_bytes();
    let need = |n: usize| if b.len() < n { Err(ExtentError) } else { Ok(()) };
    let (lba, len) = match cdb.opcode() {
        op::READ_6 | op::WRITE_6 => {
            need(6)?;
            let lba = ((b[1] as u64 & 0x1f) << 16)
                | ((b[2] as u64) << 8)
                | b[3] as u64;
            let len = match b[4] {
                0 => 256,
                n => n as u64,
            };
            (lba, len)
        }
        op::READ_10 | op::WRITE_10 | op::VERIFY_10 | op::WRITE_SAME_10 => {
            need(10)?;
            (
                BigEndian::read_u32(&b[2..6]) as u64,
                BigEndian::read_u16(&b[7..9]) as u64,
            )
        }
        op::READ_12 | op::WRITE_12 => {
            need(12)?;
            (
                BigEndian::read_u32(&b[2..6]) as u64,
                BigEndian::read_u32(&b[6..10]) as u64,
            )
        }
        op::READ_16 | op::WRITE_16 | op::VERIFY_16 | op::WRITE_SAME_16 => {
            need(16)?;
            (
                BigEndian::read_u64(&b[2..10]),
                BigEndian::read_u32(&b[10..14]) as u64,
            )
        }
        op::COMPARE_AND_WRITE => {
            need(16)?;
            (BigEndian::read_u64(&b[2..10]), b[13] as u64)
        }
        // Descriptors live in the parameter data, so assume the worst
        op::UNMAP => return Ok(Some(Extent::WHOLE)),
        _ => return Ok(None),
    };
    if len == 0 {
        return Ok(None);
    }
    if lba.checked_add(len - 1).is_none() {
        return Err(ExtentError);
    }
    Ok(Some(Extent { lba, len }))
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn table_is_consistent() {
        validate_table();
        assert_eq!(lookup(op::READ_10).unwrap().class, CmdClass::Read);
        assert!(lookup(0xff).is_none());
        assert!(lookup(op::INQUIRY).unwrap().flags.contains(OpFlags::NO_UA));
    }

    #[test]
    fn rw6_zero_means_256() {
        let ext = decode_extent(&Cdb::read6(0x10, 0)).unwrap().unwrap();
        assert_eq!(ext, Extent { lba: 0x10, len: 256 });
    }

    #[test]
    fn zero_length_has_no_extent() {
        assert_eq!(decode_extent(&Cdb::read10(5, 0)), Ok(None));
        assert_eq!(decode_extent(&Cdb::write16(5, 0)), Ok(None));
        assert_eq!(decode_extent(&Cdb::test_unit_ready()), Ok(None));
    }

    #[test]
    fn compare_and_write_extent() {
        let ext = decode_extent(&Cdb::compare_and_write(1 << 33, 4)).unwrap();
        assert_eq!(ext, Some(Extent { lba: 1 << 33, len: 4 }));
        let entry = lookup(op::COMPARE_AND_WRITE).unwrap();
        assert_eq!(entry.class, CmdClass::Write);
        assert_eq!(lookup(op::VERIFY_16).unwrap().class, CmdClass::Read);
    }

    #[test]
    fn short_or_wrapping_cdb_is_error() {
        let short = Cdb::new(&[op::READ_10, 0, 0, 0]).unwrap();
        assert_eq!(decode_extent(&short), Err(ExtentError));
        let wrap = Cdb::read16(u64::MAX, 2);
        assert_eq!(decode_extent(&wrap), Err(ExtentError));
    }

    #[test]
    fn xfer_lengths() {
        assert_eq!(Cdb::inquiry(0x124).xfer_len(), 0x124);
        assert_eq!(Cdb::pr_out(0, 0).xfer_len(), 24);
        assert_eq!(Cdb::report_luns(4096).xfer_len(), 4096);
        assert_eq!(Cdb::mode_sense6(0x3f, 0, 200).xfer_len(), 200);
    }

    proptest! {
        #[test]
        fn overlap_is_symmetric(
            a in 0u64..1000, alen in 1u64..100,
            b in 0u64..1000, blen in 1u64..100,
        ) {
            let x = Extent { lba: a, len: alen };
            let y = Extent { lba: b, len: blen };
            prop_assert_eq!(x.overlaps(&y), y.overlaps(&x));
            let brute = (a..a + alen).any(|blk| blk >= b && blk < b + blen);
            prop_assert_eq!(x.overlaps(&y), brute);
        }
    }
}
