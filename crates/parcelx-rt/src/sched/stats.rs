// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler statistics.
//!
//! Each worker counts locally without synchronization; counts are folded
//! into the runtime totals when the worker stops.

use std::fmt;
use std::ops::AddAssign;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Parcels pushed onto a local deque.
    pub spawns: u64,
    pub steals: u64,
    pub failed_steals: u64,
    /// Parcels received through the mailbox.
    pub mail: u64,
    /// Stacks allocated because the freelist was empty.
    pub stacks: u64,
    pub yields: u64,
    /// Lightweight threads run to completion.
    pub executed: u64,
}

impl AddAssign<&Stats> for Stats {
    fn add_assign(&mut self, rhs: &Stats) {
        self.spawns += rhs.spawns;
        self.steals += rhs.steals;
        self.failed_steals += rhs.failed_steals;
        self.mail += rhs.mail;
        self.stacks += rhs.stacks;
        self.yields += rhs.yields;
        self.executed += rhs.executed;
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spawns {} steals {} failed_steals {} mail {} stacks {} yields {} executed {}",
            self.spawns,
            self.steals,
            self.failed_steals,
            self.mail,
            self.stacks,
            self.yields,
            self.executed
        )
    }
}
