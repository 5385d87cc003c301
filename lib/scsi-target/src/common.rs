// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identifiers shared across the target core.

use std::fmt;

use serde::{Deserialize, Serialize};

pub type PortId = u16;
pub type InitiatorId = u32;
pub type TargetId = u32;
pub type LunId = u32;
pub type Tag = u64;

/// Maximum number of frontend ports known to one controller.
pub const MAX_PORTS: usize = 32;
/// Maximum number of initiators tracked per port.
pub const MAX_INIT_PER_PORT: usize = 64;
/// Size of every per-initiator table (registrations, unit attentions, ...).
pub const MAX_INITIATORS: usize = MAX_PORTS * MAX_INIT_PER_PORT;
/// Largest LUN number which may be configured.
pub const MAX_LUNS: LunId = 1024;

/// Index of a (port, initiator) pair into per-LUN, per-initiator tables.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Iid(u16);
impl Iid {
    pub fn new(port: PortId, initiator: InitiatorId) -> Option<Self> {
        let (port, initiator) = (port as usize, initiator as usize);
        if port >= MAX_PORTS || initiator >= MAX_INIT_PER_PORT {
            return None;
        }
        Some(Self((port * MAX_INIT_PER_PORT + initiator) as u16))
    }
    pub fn from_index(idx: usize) -> Option<Self> {
        (idx < MAX_INITIATORS).then_some(Self(idx as u16))
    }
    pub const fn index(self) -> usize {
        self.0 as usize
    }
    pub const fn port(self) -> PortId {
        (self.0 as usize / MAX_INIT_PER_PORT) as PortId
    }
    pub const fn initiator(self) -> InitiatorId {
        (self.0 as usize % MAX_INIT_PER_PORT) as InitiatorId
    }

    /// Iterate over every possible initiator slot
    pub fn all() -> impl Iterator<Item = Iid> {
        (0..MAX_INITIATORS).map(|i| Iid(i as u16))
    }
}
impl fmt::Debug for Iid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Iid({}:{})", self.port(), self.initiator())
    }
}

/// The (port, initiator, target, LUN) tuple through which a command arrived.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub struct Nexus {
    pub port: PortId,
    pub initiator: InitiatorId,
    pub target: TargetId,
    pub lun: LunId,
}
impl Nexus {
    pub const fn new(
        port: PortId,
        initiator: InitiatorId,
        target: TargetId,
        lun: LunId,
    ) -> Self {
        Self { port, initiator, target, lun }
    }

    /// Slot for this nexus' I_T pair, if it is within the supported range
    pub fn iid(&self) -> Option<Iid> {
        Iid::new(self.port, self.initiator)
    }

    /// Same I_T pair, addressing a different LUN
    pub const fn with_lun(self, lun: LunId) -> Self {
        Self { lun, ..self }
    }
}
