// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Network collaborator.
//!
//! The scheduler needs two things from a transport: deliver a parcel to a
//! rank, and run completion commands that arrive from it. [`Fabric`] wires
//! several runtimes in one process together; [`Loopback`] is the default for
//! a lone rank and refuses remote delivery.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::addr::Rank;
use crate::error::{Error, SendError, Status};
use crate::parcel::Parcel;
use crate::sched::worker::Shared;

pub trait Network: Send + Sync {
    /// Hand `parcel` to `rank`. A parcel that cannot be delivered comes
    /// back in the error.
    fn deliver(&self, parcel: Parcel, rank: Rank) -> Result<(), SendError>;

    /// Register the local endpoint. Called once the runtime is running.
    fn bind(&self, _rank: Rank, _handle: Handle) {}
}

/// Work the transport asks the scheduler to do.
pub enum Command {
    /// Run an incoming parcel.
    Deliver(Parcel),
    /// Resume a thread suspended on a network operation.
    Resume(Parcel, Status),
    Nop,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Deliver(p) => f.debug_tuple("Deliver").field(p).finish(),
            Command::Resume(p, status) => f.debug_tuple("Resume").field(p).field(status).finish(),
            Command::Nop => f.write_str("Nop"),
        }
    }
}

/// Entry point into a runtime for its transport. Does not keep the runtime
/// alive.
#[derive(Clone)]
pub struct Handle {
    rt: Weak<Shared>,
}

impl Handle {
    pub(crate) fn new(rt: &Arc<Shared>) -> Self {
        Self {
            rt: Arc::downgrade(rt),
        }
    }

    /// Run a completion command. Fails with `Resend` once the runtime has
    /// gone away.
    pub fn run_completion(&self, command: Command) -> Status {
        let Some(rt) = self.rt.upgrade() else {
            log::debug!("completion {command:?} for a dropped runtime");
            return Err(Error::Resend);
        };
        if rt.is_shutdown() {
            return Err(Error::Resend);
        }
        match command {
            Command::Deliver(mut parcel) => {
                parcel.rebind(&rt);
                rt.spawn(parcel);
            }
            Command::Resume(parcel, status) => parcel.resume(status),
            Command::Nop => {}
        }
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.rt
            .upgrade()
            .is_some_and(|rt| !rt.is_shutdown())
    }
}

/// Single-rank network: nothing is remote.
#[derive(Debug, Default)]
pub struct Loopback;

impl Network for Loopback {
    fn deliver(&self, parcel: Parcel, rank: Rank) -> Result<(), SendError> {
        log::debug!("no route to rank {rank} for parcel {}", parcel.id());
        Err(SendError {
            parcel,
            error: Error::Resend,
        })
    }
}

/// In-process network joining several runtimes, one per rank.
pub struct Fabric {
    endpoints: RwLock<Vec<Option<Handle>>>,
}

impl Fabric {
    pub fn new(ranks: u32) -> Arc<Self> {
        Arc::new(Self {
            endpoints: RwLock::new(vec![None; ranks as usize]),
        })
    }

    pub fn ranks(&self) -> u32 {
        self.endpoints.read().len() as u32
    }

    /// The endpoint for `rank`, once its runtime has started.
    pub fn handle(&self, rank: Rank) -> Option<Handle> {
        self.endpoints.read().get(rank as usize).cloned().flatten()
    }
}

impl Network for Fabric {
    fn deliver(&self, parcel: Parcel, rank: Rank) -> Result<(), SendError> {
        let Some(handle) = self.handle(rank).filter(Handle::is_alive) else {
            return Err(SendError {
                parcel,
                error: Error::Resend,
            });
        };
        log::trace!("fabric: parcel {} to rank {rank}", parcel.id());
        // The runtime can only vanish between the check and here during
        // shutdown, where dropping the parcel is fine.
        if let Err(e) = handle.run_completion(Command::Deliver(parcel)) {
            log::debug!("fabric: rank {rank} went away: {e}");
        }
        Ok(())
    }

    fn bind(&self, rank: Rank, handle: Handle) {
        let mut endpoints = self.endpoints.write();
        match endpoints.get_mut(rank as usize) {
            Some(slot) => *slot = Some(handle),
            None => log::warn!("fabric has no slot for rank {rank}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_fabric_has_no_endpoints() {
        let fabric = Fabric::new(3);
        assert_eq!(fabric.ranks(), 3);
        assert!(fabric.handle(1).is_none());
        assert!(fabric.handle(9).is_none());
    }

    #[test]
    fn dead_handle_asks_for_resend() {
        let handle = Handle { rt: Weak::new() };
        assert!(!handle.is_alive());
        assert_eq!(handle.run_completion(Command::Nop), Err(Error::Resend));
    }
}
