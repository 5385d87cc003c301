// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-initiator unit attention and pending sense state of a LUN.

use bitflags::bitflags;

use crate::common::{Iid, MAX_INITIATORS};
use crate::sense::{asc, key, SenseData};

bitflags! {
    /// Pending unit attention conditions.  Lower bits take precedence when
    /// more than one is pending.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct UaBits: u32 {
        const POWER_ON = 1 << 0;
        const BUS_RESET = 1 << 1;
        const TARG_RESET = 1 << 2;
        const LUN_RESET = 1 << 3;
        const I_T_NEXUS_LOSS = 1 << 4;
        const LUN_CHANGE = 1 << 5;
        const MODE_CHANGE = 1 << 6;
        const RES_PREEMPT = 1 << 7;
        const RES_RELEASE = 1 << 8;
        const REG_PREEMPT = 1 << 9;
        const ASYM_ACC_CHANGE = 1 << 10;
        const CAPACITY_CHANGE = 1 << 11;
    }
}
impl UaBits {
    /// Sense data reported for a single condition
    pub fn sense(self) -> Option<SenseData> {
        let code = match self {
            UaBits::POWER_ON => asc::POWER_ON,
            UaBits::BUS_RESET => asc::BUS_RESET,
            UaBits::TARG_RESET => asc::TARGET_RESET,
            UaBits::LUN_RESET => asc::RESET_OCCURRED,
            UaBits::I_T_NEXUS_LOSS => asc::I_T_NEXUS_LOSS,
            UaBits::LUN_CHANGE => asc::LUN_INVENTORY_CHANGED,
            UaBits::MODE_CHANGE => asc::MODE_PARAMS_CHANGED,
            UaBits::RES_PREEMPT => asc::RESERVATIONS_PREEMPTED,
            UaBits::RES_RELEASE => asc::RESERVATIONS_RELEASED,
            UaBits::REG_PREEMPT => asc::REGISTRATIONS_PREEMPTED,
            UaBits::ASYM_ACC_CHANGE => asc::ASYM_ACCESS_CHANGED,
            UaBits::CAPACITY_CHANGE => asc::CAPACITY_CHANGED,
            _ => return None,
        };
        Some(SenseData::new(key::UNIT_ATTENTION, code))
    }

    /// Highest-priority single condition in the set
    pub fn highest(self) -> Option<UaBits> {
        if self.is_empty() {
            return None;
        }
        Some(UaBits::from_bits_retain(1 << self.bits().trailing_zeros()))
    }
}

pub struct PendingTable {
    ua: Box<[UaBits]>,
    sense: Box<[Option<SenseData>]>,
}
impl PendingTable {
    pub fn new() -> Self {
        Self {
            ua: vec![UaBits::empty(); MAX_INITIATORS].into_boxed_slice(),
            sense: vec![None; MAX_INITIATORS].into_boxed_slice(),
        }
    }

    pub fn establish(&mut self, iid: Iid, bits: UaBits) {
        self.ua[iid.index()] |= bits;
    }
    pub fn establish_all(&mut self, bits: UaBits) {
        self.ua.iter_mut().for_each(|ua| *ua |= bits);
    }
    pub fn establish_all_except(&mut self, except: Iid, bits: UaBits) {
        for (idx, ua) in self.ua.iter_mut().enumerate() {
            if idx != except.index() {
                *ua |= bits;
            }
        }
    }
    pub fn clear(&mut self, iid: Iid, bits: UaBits) {
        self.ua[iid.index()] &= !bits;
    }
    pub fn pending(&self, iid: Iid) -> UaBits {
        self.ua[iid.index()]
    }

    /// Remove and report the highest-priority pending unit attention.
    pub fn take_ua(&mut self, iid: Iid) -> Option<SenseData> {
        let slot = &mut self.ua[iid.index()];
        let top = slot.highest()?;
        *slot &= !top;
        top.sense()
    }

    /// Record sense from a CHECK CONDITION for a later REQUEST SENSE.
    pub fn set_sense(&mut self, iid: Iid, sense: SenseData) {
        self.sense[iid.index()] = Some(sense);
    }
    pub fn take_sense(&mut self, iid: Iid) -> Option<SenseData> {
        self.sense[iid.index()].take()
    }
}
impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ua_priority_and_consumption() {
        let mut table = PendingTable::new();
        let iid = Iid::new(0, 3).unwrap();
        table.establish(iid, UaBits::MODE_CHANGE | UaBits::POWER_ON);

        let first = table.take_ua(iid).unwrap();
        assert_eq!(first.asc_pair(), asc::POWER_ON);
        let second = table.take_ua(iid).unwrap();
        assert_eq!(second.asc_pair(), asc::MODE_PARAMS_CHANGED);
        assert!(table.take_ua(iid).is_none());
    }

    #[test]
    fn all_except() {
        let mut table = PendingTable::new();
        let me = Iid::new(1, 0).unwrap();
        let other = Iid::new(1, 1).unwrap();
        table.establish_all_except(me, UaBits::RES_PREEMPT);
        assert!(table.pending(me).is_empty());
        assert_eq!(table.pending(other), UaBits::RES_PREEMPT);
    }

    #[test]
    fn every_bit_has_sense() {
        for bit in UaBits::all().iter() {
            let sense = bit.sense().unwrap();
            assert_eq!(sense.key, key::UNIT_ATTENTION);
        }
    }
}
