// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-LUN error injection, for exercising initiator error handling.

use serde::{Deserialize, Serialize};

use crate::cmd::cdb::{self, CmdClass};
use crate::sense::{asc, key, SenseData, Status};

/// Which commands an injection applies to
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectMatch {
    Any,
    Read,
    Write,
    Opcode(u8),
}

/// Error reported in place of executing the command
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectKind {
    Aborted,
    MediumError,
    UnitAttention,
    Custom(SenseData),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInjection {
    pub matcher: InjectMatch,
    pub kind: InjectKind,
    /// Keep firing on every match instead of only the first
    #[serde(default)]
    pub continuous: bool,
}
impl ErrorInjection {
    fn matches(&self, opcode: u8, class: Option<CmdClass>) -> bool {
        match self.matcher {
            InjectMatch::Any => true,
            InjectMatch::Read => class == Some(CmdClass::Read),
            InjectMatch::Write => class == Some(CmdClass::Write),
            InjectMatch::Opcode(op) => op == opcode,
        }
    }

    fn status(&self, class: Option<CmdClass>) -> Status {
        let sense = match &self.kind {
            InjectKind::Aborted => SenseData::aborted_command(),
            InjectKind::MediumError if class == Some(CmdClass::Write) => {
                SenseData::new(key::MEDIUM_ERROR, asc::WRITE_ERROR)
            }
            InjectKind::MediumError => {
                SenseData::new(key::MEDIUM_ERROR, asc::UNRECOVERED_READ)
            }
            InjectKind::UnitAttention => {
                SenseData::new(key::UNIT_ATTENTION, asc::RESET_OCCURRED)
            }
            InjectKind::Custom(sense) => sense.clone(),
        };
        Status::check(sense)
    }
}

#[derive(Default)]
pub struct Injections {
    next_id: u32,
    list: Vec<(u32, ErrorInjection)>,
}
impl Injections {
    pub fn add(&mut self, inj: ErrorInjection) -> u32 {
        self.next_id += 1;
        self.list.push((self.next_id, inj));
        self.next_id
    }
    pub fn remove(&mut self, id: u32) -> bool {
        let before = self.list.len();
        self.list.retain(|(i, _)| *i != id);
        self.list.len() != before
    }
    pub fn list(&self) -> Vec<(u32, ErrorInjection)> {
        self.list.clone()
    }

    /// Check a command about to execute, consuming one-shot injections.
    pub(crate) fn check(&mut self, opcode: u8) -> Option<Status> {
        if self.list.is_empty() {
            return None;
        }
        let class = cdb::lookup(opcode).map(|e| e.class);
        let pos =
            self.list.iter().position(|(_, inj)| inj.matches(opcode, class))?;
        let status = self.list[pos].1.status(class);
        if !self.list[pos].1.continuous {
            self.list.remove(pos);
        }
        Some(status)
    }
}
