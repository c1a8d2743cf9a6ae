// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Write-once future.
//!
//! EMPTY until the first `set` (FULL) or `error` (ERROR). Readers before
//! that block on the `full` cvar. Only an empty wait queue may be reset.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

use super::cvar::Cvar;
use super::{block_on_cvar, BoxFuture, Check, Flags, Guarded, Lco, LcoRef};
use crate::error::{fatal, Error, Misuse, Status};
use crate::parcel::Parcel;

pub struct Future {
    size: usize,
    state: Mutex<FutureState>,
}

pub(crate) struct FutureState {
    flags: Flags,
    full: Cvar,
    value: Arc<[u8]>,
}

impl Guarded for Future {
    type State = FutureState;

    fn state(&self) -> &Mutex<FutureState> {
        &self.state
    }
}

fn probe_full(state: &mut FutureState, _: u64) -> Check<'_> {
    if state.flags.triggered() {
        Check::Ready(state.full.error())
    } else {
        Check::Block(&mut state.full)
    }
}

impl Future {
    /// An empty future holding `size` bytes.
    pub fn new(size: usize) -> Arc<Self> {
        let mut flags = Flags::default();
        if size > 0 {
            flags.set_user();
        }
        Arc::new(Self {
            size,
            state: Mutex::new(FutureState {
                flags,
                full: Cvar::new(),
                value: vec![0; size].into(),
            }),
        })
    }

    /// Fill the future and wake every reader.
    pub fn try_set(&self, bytes: &[u8]) -> Result<(), Misuse> {
        let released = {
            let mut state = self.state.lock();
            if !bytes.is_empty() && (!state.flags.user() || bytes.len() > self.size) {
                return Err(Misuse::Oversized {
                    len: bytes.len(),
                    size: self.size,
                });
            }
            if state.flags.triggered() {
                return Err(Misuse::AlreadySet);
            }
            state.flags.set_triggered(true);
            if !bytes.is_empty() {
                let mut value = vec![0; self.size];
                value[..bytes.len()].copy_from_slice(bytes);
                state.value = value.into();
            }
            state.full.signal_all()
        };
        log::trace!("future set, waking {}", released.len());
        released.launch();
        Ok(())
    }

    /// Return to EMPTY. Fails if readers are queued.
    pub fn try_reset(&self) -> Result<(), Misuse> {
        let mut state = self.state.lock();
        state.full.try_reset()?;
        state.flags.set_triggered(false);
        log::trace!("future reset");
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.state.lock().flags.triggered()
    }

    /// Readers currently blocked.
    pub fn waiting(&self) -> usize {
        self.state.lock().full.len()
    }
}

impl Lco for Future {
    fn set(&self, bytes: &[u8]) {
        if let Err(misuse) = self.try_set(bytes) {
            fatal(misuse);
        }
    }

    fn error(&self, error: Error) {
        let released = {
            let mut state = self.state.lock();
            state.flags.set_triggered(true);
            state.full.signal_error(error)
        };
        log::trace!("future failed with {error}, waking {}", released.len());
        released.launch();
    }

    fn reset(&self) {
        if let Err(misuse) = self.try_reset() {
            fatal(misuse);
        }
    }

    fn size(&self) -> usize {
        self.size
    }

    fn attach(&self, parcel: Parcel) -> Status {
        let mut state = self.state.lock();
        if !state.flags.triggered() {
            return state.full.push(parcel).map_err(|(_, e)| e);
        }
        state.full.error()?;
        drop(state);
        parcel.send().map_err(|e| e.error)
    }

    fn get(self: Arc<Self>, size: usize, reset: bool) -> BoxFuture<'static, Result<Vec<u8>, Error>> {
        Box::pin(async move {
            loop {
                block_on_cvar(self.clone(), probe_full, 0).await?;
                let mut state = self.state.lock();
                // A reset may slip in between the wake and the relock.
                if !state.flags.triggered() {
                    continue;
                }
                state.full.error()?;
                let out = state.value[..size.min(self.size)].to_vec();
                if reset {
                    if let Err(misuse) = state.full.try_reset() {
                        fatal(misuse);
                    }
                    state.flags.set_triggered(false);
                }
                return Ok(out);
            }
        })
    }

    fn wait(self: Arc<Self>, reset: bool) -> BoxFuture<'static, Status> {
        let get = self.get(0, reset);
        Box::pin(async move { get.await.map(drop) })
    }

    fn getref(self: Arc<Self>, size: usize) -> BoxFuture<'static, Result<LcoRef, Error>> {
        Box::pin(async move {
            self.clone().wait(false).await?;
            let value = self.state.lock().value.clone();
            if size >= value.len() {
                Ok(LcoRef::new(value))
            } else {
                Ok(LcoRef::from(value[..size].to_vec()))
            }
        })
    }

    fn abandon(&self) {
        let released = self.state.lock().full.abandon(Err(Error::Reset));
        if released.len() > 0 {
            log::debug!("future abandoned with {} waiters", released.len());
        }
        released.launch();
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lco::testing::poll_once;
    use std::task::Poll;

    #[test]
    fn set_then_get_copies_value() {
        let f = Future::new(8);
        f.set(&[0x11; 8]);
        assert_eq!(
            poll_once(f.clone().get(8, false)),
            Poll::Ready(Ok(vec![0x11; 8]))
        );
        // Still full after a plain get.
        assert!(f.is_set());
    }

    #[test]
    fn second_set_is_misuse() {
        let f = Future::new(4);
        f.try_set(&[1]).unwrap();
        assert_eq!(f.try_set(&[2]), Err(Misuse::AlreadySet));
        assert_eq!(poll_once(f.get(1, false)), Poll::Ready(Ok(vec![1])));
    }

    #[test]
    fn oversized_values_are_rejected() {
        let f = Future::new(2);
        assert_eq!(
            f.try_set(&[1, 2, 3]),
            Err(Misuse::Oversized { len: 3, size: 2 })
        );
        let empty = Future::new(0);
        assert_eq!(
            empty.try_set(&[1]),
            Err(Misuse::Oversized { len: 1, size: 0 })
        );
        empty.try_set(&[]).unwrap();
        assert!(empty.is_set());
    }

    #[test]
    fn error_reaches_readers_instead_of_value() {
        let f = Future::new(8);
        f.error(Error::User(300));
        assert_eq!(
            poll_once(f.clone().get(8, false)),
            Poll::Ready(Err(Error::User(300)))
        );
        assert_eq!(
            poll_once(f.clone().wait(false)),
            Poll::Ready(Err(Error::User(300)))
        );
        // ERROR counts as triggered, so a later set is still a second set.
        assert_eq!(f.try_set(&[1]), Err(Misuse::AlreadySet));
    }

    #[test]
    fn get_with_reset_empties_the_future() {
        let f = Future::new(1);
        f.set(&[9]);
        assert_eq!(poll_once(f.clone().get(1, true)), Poll::Ready(Ok(vec![9])));
        assert!(!f.is_set());
        f.set(&[10]);
        assert_eq!(poll_once(f.clone().get(1, false)), Poll::Ready(Ok(vec![10])));
    }

    #[test]
    fn reset_clears_error() {
        let f = Future::new(1);
        f.error(Error::Lco);
        f.try_reset().unwrap();
        assert!(!f.is_set());
        f.set(&[3]);
        assert_eq!(poll_once(f.get(1, false)), Poll::Ready(Ok(vec![3])));
    }

    #[test]
    fn getref_shares_the_value() {
        let f = Future::new(4);
        f.set(&[1, 2, 3, 4]);
        let Poll::Ready(Ok(r)) = poll_once(f.clone().getref(4)) else {
            panic!("future was set");
        };
        assert_eq!(&*r, &[1, 2, 3, 4]);
        assert!(f.release(r));
        let Poll::Ready(Ok(short)) = poll_once(f.getref(2)) else {
            panic!("future was set");
        };
        assert_eq!(&*short, &[1, 2]);
    }
}
