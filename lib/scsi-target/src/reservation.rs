// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent reservations, and the legacy RESERVE(6)/RELEASE(6) model.
//!
//! Each LUN carries a fixed-size registration table, indexed by [Iid], with
//! a key of zero meaning "not registered".  At most one reservation exists
//! at a time, held either by a single initiator or (for the all-registrants
//! types) by every registered initiator.  All state here is mutated only
//! under the owning LUN's lock.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;
use thiserror::Error;

use crate::cmd::{Cdb, OpFlags};
use crate::common::{Iid, MAX_INITIATORS};
use crate::lun::pending::UaBits;
use crate::sense::{SenseData, Status};

/// PERSISTENT RESERVE OUT service actions
pub mod sa_out {
    pub const REGISTER: u8 = 0x0;
    pub const RESERVE: u8 = 0x1;
    pub const RELEASE: u8 = 0x2;
    pub const CLEAR: u8 = 0x3;
    pub const PREEMPT: u8 = 0x4;
    pub const PREEMPT_AND_ABORT: u8 = 0x5;
    pub const REGISTER_AND_IGNORE: u8 = 0x6;
}

/// PERSISTENT RESERVE IN service actions
pub mod sa_in {
    pub const READ_KEYS: u8 = 0x0;
    pub const READ_RESERVATION: u8 = 0x1;
    pub const REPORT_CAPABILITIES: u8 = 0x2;
}

/// Length of the PERSISTENT RESERVE OUT parameter list
pub const PR_OUT_PARAM_LEN: usize = 24;

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
pub enum PrType {
    WriteExclusive = 1,
    ExclusiveAccess = 3,
    WriteExclusiveRegOnly = 5,
    ExclusiveAccessRegOnly = 6,
    WriteExclusiveAllReg = 7,
    ExclusiveAccessAllReg = 8,
}
impl PrType {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::WriteExclusive,
            3 => Self::ExclusiveAccess,
            5 => Self::WriteExclusiveRegOnly,
            6 => Self::ExclusiveAccessRegOnly,
            7 => Self::WriteExclusiveAllReg,
            8 => Self::ExclusiveAccessAllReg,
            _ => return None,
        })
    }
    pub const fn code(self) -> u8 {
        self as u8
    }
    pub fn is_all_registrants(self) -> bool {
        matches!(
            self,
            Self::WriteExclusiveAllReg | Self::ExclusiveAccessAllReg
        )
    }
    pub fn is_registrants_only(self) -> bool {
        matches!(
            self,
            Self::WriteExclusiveRegOnly | Self::ExclusiveAccessRegOnly
        )
    }
    pub fn is_exclusive_access(self) -> bool {
        matches!(
            self,
            Self::ExclusiveAccess
                | Self::ExclusiveAccessRegOnly
                | Self::ExclusiveAccessAllReg
        )
    }
}

/// Holder of a reservation
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Holder {
    Slot(Iid),
    /// Every registered initiator holds the reservation
    AllRegistrants,
}

/// Reservation state, as observed from outside
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrState {
    Unreserved,
    Reserved { holder: Iid, kind: PrType },
    ReservedAllRegistrants { kind: PrType },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrOutAction {
    Register { key: u64, new_key: u64 },
    RegisterIgnore { new_key: u64 },
    Reserve { key: u64, kind: PrType },
    Release { key: u64, kind: PrType },
    Clear { key: u64 },
    Preempt { key: u64, sa_key: u64, kind: PrType, abort: bool },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PrError {
    #[error("reservation conflict")]
    Conflict,

    /// Service action reservation key not valid for the request
    #[error("invalid field in parameter list")]
    InvalidField,

    /// Release with a type other than the one held
    #[error("invalid release of persistent reservation")]
    InvalidRelease,
}
impl PrError {
    pub fn status(self) -> Status {
        match self {
            PrError::Conflict => Status::conflict(),
            PrError::InvalidField => {
                Status::check(SenseData::invalid_field_in_param(8, None))
            }
            PrError::InvalidRelease => {
                Status::check(SenseData::invalid_release())
            }
        }
    }
}

/// Side effects of a reservation state transition, for the caller to carry
/// out against the rest of the LUN.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PrEffects {
    /// State was modified (and the generation advanced)
    pub changed: bool,
    pub ua: Vec<(Iid, UaBits)>,
    /// Initiators whose tasks are to be aborted (PREEMPT AND ABORT)
    pub aborted: Vec<Iid>,
}

/// Serializable image of a LUN's reservation state, as mirrored to the HA
/// partner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrSnapshot {
    pub generation: u32,
    pub reservation: Option<(Holder, PrType)>,
    pub registrations: Vec<(Iid, u64)>,
    pub legacy: Option<Iid>,
}

pub struct Reservations {
    keys: Box<[u64]>,
    res: Option<(Holder, PrType)>,
    generation: u32,
    legacy: Option<Iid>,
}
impl Reservations {
    pub fn new() -> Self {
        Self {
            keys: vec![0u64; MAX_INITIATORS].into_boxed_slice(),
            res: None,
            generation: 0,
            legacy: None,
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
    pub fn state(&self) -> PrState {
        match self.res {
            None => PrState::Unreserved,
            Some((Holder::Slot(holder), kind)) => {
                PrState::Reserved { holder, kind }
            }
            Some((Holder::AllRegistrants, kind)) => {
                PrState::ReservedAllRegistrants { kind }
            }
        }
    }
    pub fn key(&self, iid: Iid) -> Option<u64> {
        match self.keys[iid.index()] {
            0 => None,
            key => Some(key),
        }
    }
    pub fn is_registered(&self, iid: Iid) -> bool {
        self.keys[iid.index()] != 0
    }
    pub fn registrants(&self) -> impl Iterator<Item = (Iid, u64)> + '_ {
        self.keys.iter().enumerate().filter(|(_, k)| **k != 0).filter_map(
            |(idx, key)| Iid::from_index(idx).map(|iid| (iid, *key)),
        )
    }
    pub fn is_holder(&self, iid: Iid) -> bool {
        match self.res {
            Some((Holder::Slot(h), _)) => h == iid,
            Some((Holder::AllRegistrants, _)) => self.is_registered(iid),
            None => false,
        }
    }
    pub fn legacy_holder(&self) -> Option<Iid> {
        self.legacy
    }

    /// Carry out a PERSISTENT RESERVE OUT action on behalf of `iid`.
    pub fn apply(
        &mut self,
        iid: Iid,
        action: &PrOutAction,
    ) -> Result<PrEffects, PrError> {
        let effects = match *action {
            PrOutAction::Register { key, new_key } => {
                if self.keys[iid.index()] != key {
                    return Err(PrError::Conflict);
                }
                self.register(iid, new_key)
            }
            PrOutAction::RegisterIgnore { new_key } => {
                self.register(iid, new_key)
            }
            PrOutAction::Reserve { key, kind } => {
                self.check_key(iid, key)?;
                self.reserve(iid, kind)?
            }
            PrOutAction::Release { key, kind } => {
                self.check_key(iid, key)?;
                self.release(iid, kind)?
            }
            PrOutAction::Clear { key } => {
                self.check_key(iid, key)?;
                self.clear(iid)
            }
            PrOutAction::Preempt { key, sa_key, kind, abort } => {
                self.check_key(iid, key)?;
                let mut effects = self.preempt(iid, sa_key, kind)?;
                if abort {
                    effects.aborted = effects
                        .ua
                        .iter()
                        .filter(|(_, ua)| ua.contains(UaBits::REG_PREEMPT))
                        .map(|(iid, _)| *iid)
                        .collect();
                }
                effects
            }
        };
        if effects.changed {
            self.generation = self.generation.wrapping_add(1);
        }
        Ok(effects)
    }

    fn check_key(&self, iid: Iid, key: u64) -> Result<(), PrError> {
        match self.key(iid) {
            Some(k) if k == key => Ok(()),
            _ => Err(PrError::Conflict),
        }
    }

    fn register(&mut self, iid: Iid, new_key: u64) -> PrEffects {
        let mut effects = PrEffects::default();
        let slot = &mut self.keys[iid.index()];
        if *slot == new_key {
            return effects;
        }
        *slot = new_key;
        effects.changed = true;

        if new_key == 0 {
            match self.res {
                Some((Holder::Slot(h), kind)) if h == iid => {
                    self.res = None;
                    if kind.is_registrants_only() {
                        effects.ua = self.ua_registrants(UaBits::RES_RELEASE);
                    }
                }
                Some((Holder::AllRegistrants, _))
                    if self.registrants().next().is_none() =>
                {
                    self.res = None;
                }
                _ => {}
            }
        }
        effects
    }

    fn reserve(
        &mut self,
        iid: Iid,
        kind: PrType,
    ) -> Result<PrEffects, PrError> {
        match self.res {
            None => {
                let holder = if kind.is_all_registrants() {
                    Holder::AllRegistrants
                } else {
                    Holder::Slot(iid)
                };
                self.res = Some((holder, kind));
                Ok(PrEffects { changed: true, ..Default::default() })
            }
            Some((_, held)) if self.is_holder(iid) && held == kind => {
                Ok(PrEffects::default())
            }
            Some(_) => Err(PrError::Conflict),
        }
    }

    fn release(
        &mut self,
        iid: Iid,
        kind: PrType,
    ) -> Result<PrEffects, PrError> {
        let Some((_, held)) = self.res else {
            return Ok(PrEffects::default());
        };
        if !self.is_holder(iid) {
            return Ok(PrEffects::default());
        }
        if held != kind {
            return Err(PrError::InvalidRelease);
        }
        self.res = None;
        // Only registrants of a shared reservation lose anything on release
        let ua = if kind.is_registrants_only() || kind.is_all_registrants() {
            self.ua_registrants(UaBits::RES_RELEASE)
                .into_iter()
                .filter(|(other, _)| *other != iid)
                .collect()
        } else {
            Vec::new()
        };
        Ok(PrEffects { changed: true, ua, aborted: Vec::new() })
    }

    fn clear(&mut self, iid: Iid) -> PrEffects {
        let ua = self
            .ua_registrants(UaBits::RES_PREEMPT)
            .into_iter()
            .filter(|(other, _)| *other != iid)
            .collect();
        self.keys.iter_mut().for_each(|k| *k = 0);
        self.res = None;
        PrEffects { changed: true, ua, aborted: Vec::new() }
    }

    fn preempt(
        &mut self,
        iid: Iid,
        sa_key: u64,
        kind: PrType,
    ) -> Result<PrEffects, PrError> {
        let new_holder = if kind.is_all_registrants() {
            Holder::AllRegistrants
        } else {
            Holder::Slot(iid)
        };
        match self.res {
            Some((Holder::AllRegistrants, _)) if sa_key == 0 => {
                // Everyone else loses their registration, and the caller
                // becomes the holder under the new type
                let removed = self.remove_where(iid, |_| true);
                self.res = Some((new_holder, kind));
                Ok(Self::preempted(removed))
            }
            Some((Holder::AllRegistrants, _)) => {
                let removed = self.remove_where(iid, |k| k == sa_key);
                if removed.is_empty() {
                    return Err(PrError::Conflict);
                }
                Ok(Self::preempted(removed))
            }
            _ if sa_key == 0 => Err(PrError::InvalidField),
            Some((Holder::Slot(holder), held))
                if self.keys[holder.index()] == sa_key =>
            {
                let removed = self.remove_where(iid, |k| k == sa_key);
                self.res = Some((new_holder, kind));
                let mut effects = Self::preempted(removed);
                if held != kind {
                    effects.ua.extend(
                        self.ua_registrants(UaBits::RES_RELEASE)
                            .into_iter()
                            .filter(|(other, _)| *other != iid),
                    );
                }
                Ok(effects)
            }
            Some(_) | None => {
                let removed = self.remove_where(iid, |k| k == sa_key);
                if removed.is_empty() {
                    return Err(PrError::Conflict);
                }
                Ok(Self::preempted(removed))
            }
        }
    }

    /// Unregister every initiator other than `except` whose key satisfies
    /// `pred`, returning those removed.
    fn remove_where(
        &mut self,
        except: Iid,
        pred: impl Fn(u64) -> bool,
    ) -> Vec<Iid> {
        let mut removed = Vec::new();
        for (idx, key) in self.keys.iter_mut().enumerate() {
            if idx == except.index() || *key == 0 || !pred(*key) {
                continue;
            }
            *key = 0;
            if let Some(iid) = Iid::from_index(idx) {
                removed.push(iid);
            }
        }
        removed
    }

    fn preempted(removed: Vec<Iid>) -> PrEffects {
        PrEffects {
            changed: true,
            ua: removed.into_iter().map(|i| (i, UaBits::REG_PREEMPT)).collect(),
            aborted: Vec::new(),
        }
    }

    fn ua_registrants(&self, bits: UaBits) -> Vec<(Iid, UaBits)> {
        self.registrants().map(|(iid, _)| (iid, bits)).collect()
    }

    /// Determine whether `iid` may execute a command with `flags` given the
    /// current reservation state.
    pub fn check_access(
        &self,
        iid: Iid,
        flags: OpFlags,
    ) -> Result<(), PrError> {
        if let Some(holder) = self.legacy {
            if holder != iid && !flags.contains(OpFlags::ALLOW_ON_RESV) {
                return Err(PrError::Conflict);
            }
        }
        let Some((_, kind)) = self.res else {
            return Ok(());
        };
        if self.is_holder(iid) {
            return Ok(());
        }
        if (kind.is_registrants_only() || kind.is_all_registrants())
            && self.is_registered(iid)
        {
            return Ok(());
        }
        let allowed = if kind.is_exclusive_access() {
            flags.contains(OpFlags::ALLOW_ON_PR_EXCL)
        } else {
            flags.intersects(
                OpFlags::ALLOW_ON_PR_EXCL | OpFlags::ALLOW_ON_PR_WRESV,
            )
        };
        if allowed {
            Ok(())
        } else {
            Err(PrError::Conflict)
        }
    }

    /// RESERVE(6)
    pub fn legacy_reserve(&mut self, iid: Iid) -> Result<(), PrError> {
        if self.res.is_some() || self.registrants().next().is_some() {
            return Err(PrError::Conflict);
        }
        match self.legacy {
            Some(holder) if holder != iid => Err(PrError::Conflict),
            _ => {
                self.legacy = Some(iid);
                Ok(())
            }
        }
    }

    /// RELEASE(6).  Releasing a reservation held by someone else (or none at
    /// all) is not an error.
    pub fn legacy_release(&mut self, iid: Iid) -> Result<(), PrError> {
        if self.res.is_some() {
            return Err(PrError::Conflict);
        }
        if self.legacy == Some(iid) {
            self.legacy = None;
        }
        Ok(())
    }

    /// Drop any legacy reservation, as on reset.  Returns whether one was
    /// held.
    pub fn legacy_clear(&mut self, only: Option<Iid>) -> bool {
        match (self.legacy, only) {
            (Some(h), Some(iid)) if h != iid => false,
            (Some(_), _) => {
                self.legacy = None;
                true
            }
            (None, _) => false,
        }
    }

    pub fn snapshot(&self) -> PrSnapshot {
        PrSnapshot {
            generation: self.generation,
            reservation: self.res,
            registrations: self.registrants().collect(),
            legacy: self.legacy,
        }
    }

    /// Replace local state with an image from the HA partner.
    pub fn install(&mut self, snap: &PrSnapshot) {
        self.keys.iter_mut().for_each(|k| *k = 0);
        for (iid, key) in snap.registrations.iter() {
            self.keys[iid.index()] = *key;
        }
        self.res = snap.reservation;
        self.generation = snap.generation;
        self.legacy = snap.legacy;
    }

    /// PERSISTENT RESERVE IN, READ KEYS
    pub fn read_keys(&self) -> Vec<u8> {
        let keys: Vec<u64> = self.registrants().map(|(_, k)| k).collect();
        let mut buf = vec![0u8; 8 + keys.len() * 8];
        BigEndian::write_u32(&mut buf[0..4], self.generation);
        BigEndian::write_u32(&mut buf[4..8], (keys.len() * 8) as u32);
        for (i, key) in keys.iter().enumerate() {
            BigEndian::write_u64(&mut buf[8 + i * 8..16 + i * 8], *key);
        }
        buf
    }

    /// PERSISTENT RESERVE IN, READ RESERVATION
    pub fn read_reservation(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 8];
        BigEndian::write_u32(&mut buf[0..4], self.generation);
        if let Some((holder, kind)) = self.res {
            BigEndian::write_u32(&mut buf[4..8], 16);
            let key = match holder {
                Holder::Slot(h) => self.keys[h.index()],
                Holder::AllRegistrants => 0,
            };
            let mut desc = [0u8; 16];
            BigEndian::write_u64(&mut desc[0..8], key);
            desc[13] = kind.code();
            buf.extend_from_slice(&desc);
        }
        buf
    }

    /// PERSISTENT RESERVE IN, REPORT CAPABILITIES
    pub fn report_capabilities(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 8];
        BigEndian::write_u16(&mut buf[0..2], 8);
        // Compatible reservation handling
        buf[2] = 0x10;
        // Type mask valid
        buf[3] = 0x80;
        // WR_EX_AR, EX_AC_RO, WR_EX_RO, EX_AC, WR_EX; then EX_AC_AR
        buf[4] = 0xea;
        buf[5] = 0x01;
        buf
    }
}
impl Default for Reservations {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a PERSISTENT RESERVE OUT command and its parameter list.
pub fn parse_pr_out(cdb: &Cdb, param: &[u8]) -> Result<PrOutAction, SenseData> {
    if cdb.xfer_len() != PR_OUT_PARAM_LEN || param.len() < PR_OUT_PARAM_LEN {
        return Err(SenseData::invalid_field_in_cdb(5, None));
    }
    let key = BigEndian::read_u64(&param[0..8]);
    let sa_key = BigEndian::read_u64(&param[8..16]);
    if param[20] & 0x08 != 0 {
        // SPEC_I_PT
        return Err(SenseData::invalid_field_in_param(20, Some(3)));
    }
    if param[20] & 0x04 != 0 {
        // ALL_TG_PT
        return Err(SenseData::invalid_field_in_param(20, Some(2)));
    }

    let kind = || {
        if cdb.byte(2) >> 4 != 0 {
            return Err(SenseData::invalid_field_in_cdb(2, Some(7)));
        }
        PrType::from_code(cdb.byte(2) & 0xf)
            .ok_or_else(|| SenseData::invalid_field_in_cdb(2, Some(3)))
    };
    Ok(match cdb.service_action() {
        sa_out::REGISTER => PrOutAction::Register { key, new_key: sa_key },
        sa_out::REGISTER_AND_IGNORE => {
            PrOutAction::RegisterIgnore { new_key: sa_key }
        }
        sa_out::RESERVE => PrOutAction::Reserve { key, kind: kind()? },
        sa_out::RELEASE => PrOutAction::Release { key, kind: kind()? },
        sa_out::CLEAR => PrOutAction::Clear { key },
        sa @ (sa_out::PREEMPT | sa_out::PREEMPT_AND_ABORT) => {
            PrOutAction::Preempt {
                key,
                sa_key,
                kind: kind()?,
                abort: sa == sa_out::PREEMPT_AND_ABORT,
            }
        }
        _ => return Err(SenseData::invalid_field_in_cdb(1, Some(4))),
    })
}

/// Build a PERSISTENT RESERVE OUT parameter list.
pub fn pr_out_param(key: u64, sa_key: u64) -> Vec<u8> {
    let mut buf = vec![0u8; PR_OUT_PARAM_LEN];
    BigEndian::write_u64(&mut buf[0..8], key);
    BigEndian::write_u64(&mut buf[8..16], sa_key);
    buf
}

#[cfg(test)]
mod test {
    use super::*;

    fn iid(n: u32) -> Iid {
        Iid::new(0, n).unwrap()
    }

    fn registered(keys: &[(u32, u64)]) -> Reservations {
        let mut pr = Reservations::new();
        for (i, key) in keys {
            pr.apply(iid(*i), &PrOutAction::Register { key: 0, new_key: *key })
                .unwrap();
        }
        pr
    }

    #[test]
    fn register_then_reserve() {
        let mut pr = registered(&[(1, 0xa)]);
        assert_eq!(pr.generation(), 1);
        assert_eq!(pr.key(iid(1)), Some(0xa));

        let kind = PrType::WriteExclusive;
        pr.apply(iid(1), &PrOutAction::Reserve { key: 0xa, kind }).unwrap();
        assert_eq!(pr.state(), PrState::Reserved { holder: iid(1), kind });
        assert_eq!(pr.generation(), 2);

        // Identical reserve by the holder is a no-op
        let effects =
            pr.apply(iid(1), &PrOutAction::Reserve { key: 0xa, kind }).unwrap();
        assert!(!effects.changed);
        assert_eq!(pr.generation(), 2);
    }

    #[test]
    fn register_with_wrong_key_conflicts() {
        let mut pr = registered(&[(1, 0xa)]);
        let wrong_key = PrOutAction::Register { key: 0xb, new_key: 1 };
        let res = pr.apply(iid(1), &wrong_key);
        assert_eq!(res, Err(PrError::Conflict));
        // Unregistered initiator supplying a non-zero key
        let res = pr.apply(iid(2), &wrong_key);
        assert_eq!(res, Err(PrError::Conflict));
        // Register-and-ignore needs no key
        pr.apply(iid(1), &PrOutAction::RegisterIgnore { new_key: 0xc })
            .unwrap();
        assert_eq!(pr.key(iid(1)), Some(0xc));
    }

    #[test]
    fn reserve_conflicts_with_other_holder() {
        let mut pr = registered(&[(1, 0xa), (2, 0xb)]);
        let kind = PrType::ExclusiveAccess;
        pr.apply(iid(1), &PrOutAction::Reserve { key: 0xa, kind }).unwrap();
        let res = pr.apply(iid(2), &PrOutAction::Reserve { key: 0xb, kind });
        assert_eq!(res, Err(PrError::Conflict));
    }

    #[test]
    fn release_type_mismatch() {
        let mut pr = registered(&[(1, 0xa), (2, 0xb)]);
        let kind = PrType::WriteExclusive;
        pr.apply(iid(1), &PrOutAction::Reserve { key: 0xa, kind }).unwrap();

        let res = pr.apply(
            iid(1),
            &PrOutAction::Release { key: 0xa, kind: PrType::ExclusiveAccess },
        );
        assert_eq!(res, Err(PrError::InvalidRelease));

        let effects =
            pr.apply(iid(1), &PrOutAction::Release { key: 0xa, kind }).unwrap();
        assert_eq!(pr.state(), PrState::Unreserved);
        assert!(effects.changed);
        assert!(effects.ua.is_empty());
    }

    #[test]
    fn release_ua_by_type() {
        let cases = [
            (PrType::WriteExclusive, false),
            (PrType::ExclusiveAccess, false),
            (PrType::WriteExclusiveRegOnly, true),
            (PrType::ExclusiveAccessRegOnly, true),
            (PrType::WriteExclusiveAllReg, true),
            (PrType::ExclusiveAccessAllReg, true),
        ];
        for (kind, raises) in cases {
            let mut pr = registered(&[(1, 0xa), (2, 0xb), (3, 0xc)]);
            pr.apply(iid(1), &PrOutAction::Reserve { key: 0xa, kind })
                .unwrap();
            let effects = pr
                .apply(iid(1), &PrOutAction::Release { key: 0xa, kind })
                .unwrap();
            assert_eq!(pr.state(), PrState::Unreserved, "{kind:?}");
            let expect = if raises {
                vec![
                    (iid(2), UaBits::RES_RELEASE),
                    (iid(3), UaBits::RES_RELEASE),
                ]
            } else {
                Vec::new()
            };
            assert_eq!(effects.ua, expect, "{kind:?}");
        }
    }

    #[test]
    fn release_by_non_holder_is_noop() {
        let mut pr = registered(&[(1, 0xa), (2, 0xb)]);
        let kind = PrType::WriteExclusive;
        pr.apply(iid(1), &PrOutAction::Reserve { key: 0xa, kind }).unwrap();
        let effects =
            pr.apply(iid(2), &PrOutAction::Release { key: 0xb, kind }).unwrap();
        assert!(!effects.changed);
        assert_eq!(pr.state(), PrState::Reserved { holder: iid(1), kind });
    }

    #[test]
    fn clear_removes_everything() {
        let mut pr = registered(&[(1, 0xa), (2, 0xb), (3, 0xc)]);
        let kind = PrType::ExclusiveAccessAllReg;
        pr.apply(iid(1), &PrOutAction::Reserve { key: 0xa, kind }).unwrap();

        let effects =
            pr.apply(iid(2), &PrOutAction::Clear { key: 0xb }).unwrap();
        assert_eq!(pr.state(), PrState::Unreserved);
        assert_eq!(pr.registrants().count(), 0);
        assert_eq!(
            effects.ua,
            vec![(iid(1), UaBits::RES_PREEMPT), (iid(3), UaBits::RES_PREEMPT)]
        );
    }

    #[test]
    fn preempt_holder() {
        let mut pr = registered(&[(1, 0xa), (2, 0xb)]);
        let kind = PrType::WriteExclusive;
        pr.apply(iid(1), &PrOutAction::Reserve { key: 0xa, kind }).unwrap();

        let effects = pr
            .apply(
                iid(2),
                &PrOutAction::Preempt {
                    key: 0xb,
                    sa_key: 0xa,
                    kind: PrType::ExclusiveAccess,
                    abort: true,
                },
            )
            .unwrap();
        assert_eq!(
            pr.state(),
            PrState::Reserved { holder: iid(2), kind: PrType::ExclusiveAccess }
        );
        assert!(!pr.is_registered(iid(1)));
        assert_eq!(effects.aborted, vec![iid(1)]);
        assert!(effects.ua.contains(&(iid(1), UaBits::REG_PREEMPT)));
    }

    #[test]
    fn preempt_zero_key_all_registrants() {
        let mut pr = registered(&[(1, 0xa), (2, 0xb), (3, 0xc)]);
        let kind = PrType::WriteExclusiveAllReg;
        pr.apply(iid(1), &PrOutAction::Reserve { key: 0xa, kind }).unwrap();
        assert_eq!(pr.state(), PrState::ReservedAllRegistrants { kind });

        let new = PrType::ExclusiveAccess;
        let effects = pr
            .apply(
                iid(2),
                &PrOutAction::Preempt {
                    key: 0xb,
                    sa_key: 0,
                    kind: new,
                    abort: false,
                },
            )
            .unwrap();
        assert_eq!(pr.state(), PrState::Reserved { holder: iid(2), kind: new });
        assert_eq!(pr.registrants().collect::<Vec<_>>(), vec![(iid(2), 0xb)]);
        assert_eq!(
            effects.ua,
            vec![(iid(1), UaBits::REG_PREEMPT), (iid(3), UaBits::REG_PREEMPT)]
        );
        assert!(effects.aborted.is_empty());
    }

    #[test]
    fn preempt_zero_key_single_holder_invalid() {
        let mut pr = registered(&[(1, 0xa), (2, 0xb)]);
        let kind = PrType::WriteExclusive;
        pr.apply(iid(1), &PrOutAction::Reserve { key: 0xa, kind }).unwrap();
        let res = pr.apply(
            iid(2),
            &PrOutAction::Preempt { key: 0xb, sa_key: 0, kind, abort: false },
        );
        assert_eq!(res, Err(PrError::InvalidField));
    }

    #[test]
    fn preempt_unknown_key_conflicts() {
        let mut pr = registered(&[(1, 0xa), (2, 0xb)]);
        let res = pr.apply(
            iid(2),
            &PrOutAction::Preempt {
                key: 0xb,
                sa_key: 0x77,
                kind: PrType::WriteExclusive,
                abort: false,
            },
        );
        assert_eq!(res, Err(PrError::Conflict));
    }

    #[test]
    fn unregister_holder_releases() {
        let mut pr = registered(&[(1, 0xa), (2, 0xb)]);
        let kind = PrType::ExclusiveAccessRegOnly;
        pr.apply(iid(1), &PrOutAction::Reserve { key: 0xa, kind }).unwrap();
        let effects = pr
            .apply(iid(1), &PrOutAction::Register { key: 0xa, new_key: 0 })
            .unwrap();
        assert_eq!(pr.state(), PrState::Unreserved);
        assert_eq!(effects.ua, vec![(iid(2), UaBits::RES_RELEASE)]);
    }

    #[test]
    fn access_rules() {
        let mut pr = registered(&[(1, 0xa), (2, 0xb)]);
        let read = OpFlags::DATA_IN | OpFlags::ALLOW_ON_PR_WRESV;
        let write = OpFlags::DATA_OUT;

        pr.apply(
            iid(1),
            &PrOutAction::Reserve { key: 0xa, kind: PrType::WriteExclusive },
        )
        .unwrap();
        assert_eq!(pr.check_access(iid(3), read), Ok(()));
        assert_eq!(pr.check_access(iid(3), write), Err(PrError::Conflict));
        assert_eq!(pr.check_access(iid(1), write), Ok(()));

        pr.apply(
            iid(1),
            &PrOutAction::Release { key: 0xa, kind: PrType::WriteExclusive },
        )
        .unwrap();
        pr.apply(
            iid(1),
            &PrOutAction::Reserve {
                key: 0xa,
                kind: PrType::ExclusiveAccessRegOnly,
            },
        )
        .unwrap();
        // Registrants get full access; others none
        assert_eq!(pr.check_access(iid(2), write), Ok(()));
        assert_eq!(pr.check_access(iid(3), read), Err(PrError::Conflict));
        assert_eq!(
            pr.check_access(iid(3), OpFlags::ALLOW_ON_PR_EXCL),
            Ok(())
        );
    }

    #[test]
    fn legacy_reservation() {
        let mut pr = Reservations::new();
        pr.legacy_reserve(iid(1)).unwrap();
        assert_eq!(pr.legacy_reserve(iid(2)), Err(PrError::Conflict));
        assert_eq!(
            pr.check_access(iid(2), OpFlags::DATA_IN),
            Err(PrError::Conflict)
        );
        assert_eq!(pr.check_access(iid(2), OpFlags::ALLOW_ON_RESV), Ok(()));
        pr.legacy_release(iid(2)).unwrap();
        assert_eq!(pr.legacy_holder(), Some(iid(1)));
        pr.legacy_release(iid(1)).unwrap();
        assert_eq!(pr.legacy_holder(), None);

        let mut pr = registered(&[(1, 0xa)]);
        assert_eq!(pr.legacy_reserve(iid(1)), Err(PrError::Conflict));
    }

    #[test]
    fn snapshot_install() {
        let mut pr = registered(&[(1, 0xa), (5, 0xe)]);
        pr.apply(
            iid(5),
            &PrOutAction::Reserve { key: 0xe, kind: PrType::ExclusiveAccess },
        )
        .unwrap();
        let snap = pr.snapshot();

        let mut other = Reservations::new();
        other.install(&snap);
        assert_eq!(other.snapshot(), snap);
        assert_eq!(other.state(), pr.state());
    }

    #[test]
    fn pr_in_data() {
        let mut pr = registered(&[(1, 0xa), (2, 0xb)]);
        let keys = pr.read_keys();
        assert_eq!(BigEndian::read_u32(&keys[4..8]), 16);
        assert_eq!(BigEndian::read_u64(&keys[8..16]), 0xa);

        assert_eq!(pr.read_reservation().len(), 8);
        pr.apply(
            iid(2),
            &PrOutAction::Reserve { key: 0xb, kind: PrType::WriteExclusive },
        )
        .unwrap();
        let res = pr.read_reservation();
        assert_eq!(res.len(), 24);
        assert_eq!(BigEndian::read_u64(&res[8..16]), 0xb);
        assert_eq!(res[21], PrType::WriteExclusive.code());
    }

    #[test]
    fn parse_out() {
        let param = pr_out_param(0xa, 0xb);
        let cdb = Cdb::pr_out(sa_out::PREEMPT_AND_ABORT, 3);
        assert_eq!(
            parse_pr_out(&cdb, &param),
            Ok(PrOutAction::Preempt {
                key: 0xa,
                sa_key: 0xb,
                kind: PrType::ExclusiveAccess,
                abort: true
            })
        );
        let cdb = Cdb::pr_out(sa_out::RESERVE, 2);
        assert_eq!(
            parse_pr_out(&cdb, &param).unwrap_err(),
            SenseData::invalid_field_in_cdb(2, Some(3))
        );
        let mut bad = param.clone();
        bad[20] = 0x08;
        let cdb = Cdb::pr_out(sa_out::REGISTER, 0);
        assert!(parse_pr_out(&cdb, &bad).is_err());
    }
}
