// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Generation counter.
//!
//! The generation only moves forward. A waiter for generation `g` that is
//! within `ninplace` generations of the current one waits on
//! `inplace[g % ninplace]`, so each advance wakes only the waiters it can
//! satisfy; everyone further out waits on `oflow`, which every advance
//! wakes. With `ninplace == 0` all waiters use `oflow`.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use super::cvar::{Cvar, Released};
use super::{block_on_cvar, BoxFuture, Check, Guarded, Lco};
use crate::error::{fatal, Error, Misuse, Status};
use crate::parcel::Parcel;

pub struct Gencount {
    ninplace: usize,
    state: Mutex<GenState>,
}

pub(crate) struct GenState {
    gen: u64,
    oflow: Cvar,
    inplace: Box<[Cvar]>,
}

impl GenState {
    fn new(ninplace: usize) -> Self {
        Self {
            gen: 0,
            oflow: Cvar::new(),
            inplace: (0..ninplace).map(|_| Cvar::new()).collect(),
        }
    }

    fn cvars(&mut self) -> impl Iterator<Item = &mut Cvar> + '_ {
        std::iter::once(&mut self.oflow).chain(self.inplace.iter_mut())
    }
}

impl Guarded for Gencount {
    type State = GenState;

    fn state(&self) -> &Mutex<GenState> {
        &self.state
    }
}

/// Pick the cvar a waiter for `gen` blocks on.
fn probe_gen(state: &mut GenState, gen: u64) -> Check<'_> {
    if state.gen >= gen {
        return Check::Ready(Ok(()));
    }
    let n = state.inplace.len() as u64;
    let cvar = if n > 0 && gen < state.gen + n {
        &mut state.inplace[(gen % n) as usize]
    } else {
        &mut state.oflow
    };
    match cvar.error() {
        Err(e) => Check::Ready(Err(e)),
        Ok(()) => Check::Block(cvar),
    }
}

impl Gencount {
    pub fn new(ninplace: usize) -> Arc<Self> {
        Arc::new(Self {
            ninplace,
            state: Mutex::new(GenState::new(ninplace)),
        })
    }

    pub fn ninplace(&self) -> usize {
        self.ninplace
    }

    /// Current generation. Never blocks.
    pub fn current(&self) -> u64 {
        self.state.lock().gen
    }

    /// Move to the next generation and wake the waiters it may satisfy.
    pub fn advance(&self) -> u64 {
        let (gen, released) = {
            let mut state = self.state.lock();
            state.gen += 1;
            let gen = state.gen;
            let mut released = state.oflow.signal_all();
            if self.ninplace > 0 {
                let slot = (gen % self.ninplace as u64) as usize;
                released = released.chain(state.inplace[slot].signal_all());
            }
            (gen, released)
        };
        log::trace!("gencount at {gen}, waking {}", released.len());
        released.launch();
        gen
    }

    /// Resolves once the counter reaches `gen`.
    pub fn wait_for(self: &Arc<Self>, gen: u64) -> impl Future<Output = Status> + Send + 'static {
        block_on_cvar(self.clone(), probe_gen, gen)
    }

    /// Return to generation zero. Fails if anyone is waiting.
    pub fn try_reset(&self) -> Result<(), Misuse> {
        let mut state = self.state.lock();
        if state.cvars().any(|cv| !cv.is_empty()) {
            return Err(Misuse::ResetWithWaiters);
        }
        for cv in state.cvars() {
            cv.try_reset()?;
        }
        state.gen = 0;
        Ok(())
    }

    /// Threads blocked across all buckets.
    pub fn waiting(&self) -> usize {
        self.state.lock().cvars().map(|cv| cv.len()).sum()
    }
}

impl Lco for Gencount {
    /// Setting a counter advances it; the bytes are ignored.
    fn set(&self, _bytes: &[u8]) {
        self.advance();
    }

    fn error(&self, error: Error) {
        // Buckets may already hold different errors, so each batch keeps
        // its own status.
        let batches: Vec<Released> = {
            let mut state = self.state.lock();
            state.cvars().map(|cv| cv.signal_error(error)).collect()
        };
        log::trace!(
            "gencount failed with {error}, waking {}",
            batches.iter().map(Released::len).sum::<usize>()
        );
        for released in batches {
            released.launch();
        }
    }

    fn reset(&self) {
        if let Err(misuse) = self.try_reset() {
            fatal(misuse);
        }
    }

    fn size(&self) -> usize {
        std::mem::size_of::<u64>()
    }

    /// Sends `parcel` at the next advance.
    fn attach(&self, parcel: Parcel) -> Status {
        self.state
            .lock()
            .oflow
            .push(parcel)
            .map_err(|(_, e)| e)
    }

    /// The current generation as little-endian bytes.
    fn get(self: Arc<Self>, size: usize, _reset: bool) -> BoxFuture<'static, Result<Vec<u8>, Error>> {
        let result = {
            let state = self.state.lock();
            state.oflow.error().map(|()| {
                let bytes = state.gen.to_le_bytes();
                bytes[..size.min(bytes.len())].to_vec()
            })
        };
        Box::pin(async move { result })
    }

    /// Wait for the next generation. `reset` is ignored: a counter in use
    /// never goes back.
    fn wait(self: Arc<Self>, _reset: bool) -> BoxFuture<'static, Status> {
        let next = self.current() + 1;
        Box::pin(self.wait_for(next))
    }

    fn abandon(&self) {
        let released = {
            let mut state = self.state.lock();
            state
                .cvars()
                .fold(Released::none(), |all, cv| all.chain(cv.abandon(Err(Error::Reset))))
        };
        if released.len() > 0 {
            log::debug!("gencount abandoned with {} waiters", released.len());
        }
        released.launch();
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
