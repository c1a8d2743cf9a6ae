// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Local control objects.
//!
//! An LCO is a lock-protected synchronization object that lightweight
//! threads block on and signal through. Blocking never holds the lock
//! across a suspension: the waiter re-checks its condition inside the
//! suspend continuation, under the lock, and only then joins the cvar.
//!
//! Components:
//! - `cvar`: parcel wait queue with a terminal error
//! - `future`: write-once value
//! - `gencount`: monotonically increasing generation counter
//! - `actions`: built-in actions that reach LCOs through parcels

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Status};
use crate::parcel::Parcel;
use crate::sched::suspend::suspend;

pub(crate) mod actions;
pub(crate) mod cvar;
mod future;
mod gencount;

pub use future::Future;
pub use gencount::Gencount;

use cvar::Cvar;

/// A boxed `Send` future, as returned by the blocking LCO operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// The operations every LCO supports.
///
/// Blocking operations take `self: Arc<Self>` so the returned future owns
/// the object while it waits.
pub trait Lco: Send + Sync + 'static {
    /// Store `bytes` and wake the waiters.
    fn set(&self, bytes: &[u8]);

    /// Make `error` terminal: every current and later waiter gets it.
    fn error(&self, error: Error);

    /// Return to the initial state. Aborts if anyone is waiting.
    fn reset(&self);

    /// Value size in bytes.
    fn size(&self) -> usize;

    /// Send `parcel` once the LCO triggers. Returns the LCO's error without
    /// sending if it already failed.
    fn attach(&self, parcel: Parcel) -> Status;

    /// Wait for the LCO, copy out `size` bytes, optionally reset.
    fn get(self: Arc<Self>, size: usize, reset: bool) -> BoxFuture<'static, Result<Vec<u8>, Error>>;

    /// Wait for the LCO, optionally reset.
    fn wait(self: Arc<Self>, reset: bool) -> BoxFuture<'static, Status>;

    /// Wait, then borrow the value without copying.
    fn getref(self: Arc<Self>, size: usize) -> BoxFuture<'static, Result<LcoRef, Error>> {
        let get = self.get(size, false);
        Box::pin(async move { get.await.map(LcoRef::from) })
    }

    /// Give back a reference from `getref`. Returns true when the caller
    /// should unpin the LCO.
    fn release(&self, _value: LcoRef) -> bool {
        true
    }

    /// Wake every waiter with `Error::Reset`. Used when the LCO is deleted
    /// or its runtime stops.
    fn abandon(&self);

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// LCO state bits.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Flags(u8);

impl Flags {
    const TRIGGERED: u8 = 1;
    /// The value slot has a user-visible size.
    const USER: u8 = 2;

    pub fn triggered(self) -> bool {
        self.0 & Self::TRIGGERED != 0
    }

    pub fn set_triggered(&mut self, on: bool) {
        if on {
            self.0 |= Self::TRIGGERED;
        } else {
            self.0 &= !Self::TRIGGERED;
        }
    }

    pub fn user(self) -> bool {
        self.0 & Self::USER != 0
    }

    pub fn set_user(&mut self) {
        self.0 |= Self::USER;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flags")
            .field("triggered", &self.triggered())
            .field("user", &self.user())
            .finish()
    }
}

/// A borrowed LCO value.
#[derive(Clone, PartialEq, Eq)]
pub struct LcoRef(Arc<[u8]>);

impl LcoRef {
    pub(crate) fn new(bytes: Arc<[u8]>) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for LcoRef {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

impl Deref for LcoRef {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for LcoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LcoRef({:?})", &*self.0)
    }
}

/// How an LCO is stored in the address space.
pub(crate) struct LcoEntry(pub Arc<dyn Lco>);

/// An LCO whose state lives behind one lock.
pub(crate) trait Guarded: Send + Sync + 'static {
    type State: Send + 'static;

    fn state(&self) -> &Mutex<Self::State>;
}

/// Outcome of a wait probe.
pub(crate) enum Check<'a> {
    /// Stop waiting with this status.
    Ready(Status),
    /// Block on this cvar.
    Block(&'a mut Cvar),
}

/// Decides, under the lock, whether a waiter for `key` must block.
pub(crate) type Probe<S> = for<'a> fn(&'a mut S, u64) -> Check<'a>;

/// Suspend the current thread until `probe` is ready.
///
/// The probe runs once under the lock before suspending, and again inside
/// the suspend continuation, so a signal between the two is never missed.
/// An error wake ends the wait; a success wake re-checks.
pub(crate) async fn block_on_cvar<L: Guarded>(lco: Arc<L>, probe: Probe<L::State>, key: u64) -> Status {
    loop {
        {
            let mut state = lco.state().lock();
            if let Check::Ready(status) = probe(&mut state, key) {
                return status;
            }
        }

        let target = lco.clone();
        let woke = suspend(move |parcel| {
            let mut state = target.state().lock();
            let ready = match probe(&mut state, key) {
                Check::Ready(status) => Some((parcel, status)),
                Check::Block(cvar) => cvar.push(parcel).err().map(|(p, e)| (p, Err(e))),
            };
            drop(state);
            if let Some((parcel, status)) = ready {
                parcel.resume(status);
            }
        })
        .await;

        if woke.is_err() {
            return woke;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_track_bits_independently() {
        let mut flags = Flags::default();
        flags.set_user();
        flags.set_triggered(true);
        assert!(flags.triggered() && flags.user());
        flags.set_triggered(false);
        assert!(!flags.triggered());
        assert!(flags.user());
    }

    #[test]
    fn lco_ref_derefs_to_bytes() {
        let r = LcoRef::from(vec![1, 2, 3]);
        assert_eq!(&*r, &[1, 2, 3]);
        assert_eq!(r.len(), 3);
    }
}
