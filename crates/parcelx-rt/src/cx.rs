// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Thread context.
//!
//! Every lightweight thread receives a `Cx`: the parcel it runs for, and the
//! runtime operations a thread may call. LCO helpers take a global address
//! and work the same whether the LCO is local or on another rank.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use crate::action::{self, ActionId};
use crate::addr::{GlobalAddr, Rank};
use crate::error::{Error, SendError, Status};
use crate::gas::{Gas, Pinned};
use crate::lco::actions::{get_args, wait_args};
use crate::lco::{self, Gencount, Lco, LcoEntry};
use crate::parcel::{Parcel, Thunk};
use crate::sched::suspend::{self, Suspend, Yield};
use crate::sched::worker::{self, Shared};

#[derive(Clone)]
pub struct Cx {
    rt: Arc<Shared>,
    target: GlobalAddr,
    action: ActionId,
    source: Rank,
}

/// Queue a closure thread on `rt`.
pub(crate) fn spawn_thread<F, Fut>(rt: &Arc<Shared>, f: F) -> Parcel
where
    F: FnOnce(Cx) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let thunk: Thunk = Box::new(move |cx| {
        Box::pin(async move {
            f(cx).await;
            Ok(Vec::new())
        })
    });
    Parcel::thread(rt, thunk)
}

impl Cx {
    pub(crate) fn new(rt: Arc<Shared>, parcel: &Parcel) -> Self {
        Self {
            rt,
            target: parcel.target(),
            action: parcel.action(),
            source: parcel.source(),
        }
    }

    pub fn rank(&self) -> Rank {
        self.rt.here()
    }

    pub fn ranks(&self) -> u32 {
        self.rt.config.ranks
    }

    /// Address the current parcel was sent to.
    pub fn target(&self) -> GlobalAddr {
        self.target
    }

    pub fn action(&self) -> ActionId {
        self.action
    }

    /// Rank that sent the current parcel.
    pub fn source(&self) -> Rank {
        self.source
    }

    /// Worker running the caller, if called from one of this runtime's
    /// workers.
    pub fn worker(&self) -> Option<usize> {
        worker::current_worker(&self.rt)
    }

    pub fn workers(&self) -> usize {
        self.rt.workers.len()
    }

    /// Id of the parcel whose thread is calling. `None` off-worker.
    pub fn parcel_id(&self) -> Option<u64> {
        worker::current_parcel(&self.rt)
    }

    pub fn gas(&self) -> &Arc<dyn Gas> {
        &self.rt.gas
    }

    /// Pin a local object of type `T`.
    pub fn pin<T: Any + Send + Sync>(&self, addr: GlobalAddr) -> Option<Pinned<T>> {
        Pinned::new(&self.rt.gas, addr)
    }

    /// Start a closure thread on this worker.
    pub fn spawn<F, Fut>(&self, f: F)
    where
        F: FnOnce(Cx) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.rt.spawn(spawn_thread(&self.rt, f));
    }

    /// A new parcel for `action` at `target`.
    pub fn parcel(&self, target: GlobalAddr, action: ActionId) -> Parcel {
        Parcel::acquire(&self.rt, 0).with_target(target, action)
    }

    /// Send `action` to `target` with the result going to `c_action` at
    /// `c_target`.
    pub fn call(
        &self,
        target: GlobalAddr,
        action: ActionId,
        args: impl Into<Vec<u8>>,
        c_target: GlobalAddr,
        c_action: ActionId,
    ) -> Result<(), SendError> {
        self.parcel(target, action)
            .with_args(args)
            .with_continuation(c_target, c_action)
            .send()
    }

    /// Run `action` at `target` and wait for its result, at most `size`
    /// bytes.
    pub fn call_sync(
        &self,
        target: GlobalAddr,
        action: ActionId,
        args: impl Into<Vec<u8>>,
        size: usize,
    ) -> impl Future<Output = Result<Vec<u8>, Error>> + Send + 'static {
        let cx = self.clone();
        let args = args.into();
        async move {
            let result = lco::Future::new(size);
            let raddr = cx.alloc_lco(result.clone());
            let sent = cx
                .parcel(target, action)
                .with_args(args)
                .with_continuation(raddr, action::LCO_SET)
                .send();
            let out = match sent {
                Ok(()) => result.get(size, false).await,
                Err(e) => Err(e.error),
            };
            if let Err(e) = cx.rt.gas.free(raddr) {
                log::warn!("call_sync result {raddr} not freed: {e}");
            }
            out
        }
    }

    /// Suspend this thread and hand its parcel to `k`. Resolves to the
    /// status the parcel is resumed with.
    pub fn suspend<F>(&self, k: F) -> Suspend
    where
        F: FnOnce(Parcel) + Send + 'static,
    {
        suspend::suspend(k)
    }

    /// Let other local work run first.
    pub fn yield_now(&self) -> Yield {
        suspend::yield_now()
    }

    /// Finish `Runtime::run` with `status`.
    pub fn exit(&self, status: Status) {
        self.rt.request_exit(status);
    }

    /// A new future LCO on this rank.
    pub fn future_new(&self, size: usize) -> GlobalAddr {
        self.alloc_lco(lco::Future::new(size))
    }

    /// `n` futures of `size` bytes each on this rank, in index order.
    pub fn future_array_new(&self, n: usize, size: usize) -> Vec<GlobalAddr> {
        (0..n).map(|_| self.future_new(size)).collect()
    }

    /// A new generation counter on this rank.
    pub fn gencount_new(&self, ninplace: usize) -> GlobalAddr {
        self.alloc_lco(Gencount::new(ninplace))
    }

    pub fn lco_set(&self, addr: GlobalAddr, bytes: &[u8]) -> Status {
        match self.local_lco(addr)? {
            Some(lco) => {
                lco.0.set(bytes);
                Ok(())
            }
            None => self.send_to(addr, action::LCO_SET, bytes.to_vec()),
        }
    }

    pub fn lco_error(&self, addr: GlobalAddr, error: Error) -> Status {
        match self.local_lco(addr)? {
            Some(lco) => {
                lco.0.error(error);
                Ok(())
            }
            None => self.send_to(addr, action::LCO_ERROR, error.code().to_le_bytes().to_vec()),
        }
    }

    pub fn lco_reset(&self, addr: GlobalAddr) -> Status {
        match self.local_lco(addr)? {
            Some(lco) => {
                lco.0.reset();
                Ok(())
            }
            None => self.send_to(addr, action::LCO_RESET, Vec::new()),
        }
    }

    /// Free an LCO. Threads still waiting on it wake with `Error::Reset`.
    pub fn lco_delete(&self, addr: GlobalAddr) -> Status {
        match self.local_lco(addr)? {
            Some(lco) => {
                lco.0.abandon();
                drop(lco);
                self.rt.gas.free(addr)
            }
            None => self.send_to(addr, action::LCO_DELETE, Vec::new()),
        }
    }

    /// Send `parcel` once the LCO at `addr` triggers.
    ///
    /// For a remote LCO a local thread waits on it and sends the parcel
    /// if the wait succeeds.
    pub fn lco_attach(&self, addr: GlobalAddr, parcel: Parcel) -> Status {
        match self.local_lco(addr)? {
            Some(lco) => lco.0.attach(parcel),
            None => {
                self.spawn(move |cx| async move {
                    if cx.lco_wait(addr).await.is_ok() {
                        if let Err(e) = parcel.send() {
                            log::warn!("attached parcel {} not sent: {}", e.parcel.id(), e.error);
                        }
                    }
                });
                Ok(())
            }
        }
    }

    /// Wait for the LCO at `addr` and copy out `size` bytes.
    pub fn lco_get(
        &self,
        addr: GlobalAddr,
        size: usize,
    ) -> impl Future<Output = Result<Vec<u8>, Error>> + Send + 'static {
        self.get_with(addr, size, false)
    }

    /// Like [`Cx::lco_get`], then reset the LCO.
    pub fn lco_get_reset(
        &self,
        addr: GlobalAddr,
        size: usize,
    ) -> impl Future<Output = Result<Vec<u8>, Error>> + Send + 'static {
        self.get_with(addr, size, true)
    }

    pub fn lco_wait(&self, addr: GlobalAddr) -> impl Future<Output = Status> + Send + 'static {
        self.wait_with(addr, false)
    }

    pub fn lco_wait_reset(&self, addr: GlobalAddr) -> impl Future<Output = Status> + Send + 'static {
        self.wait_with(addr, true)
    }

    /// Wait until the generation counter at `addr` reaches `gen`.
    pub fn gencount_wait(&self, addr: GlobalAddr, gen: u64) -> impl Future<Output = Status> + Send + 'static {
        let cx = self.clone();
        async move {
            match cx.local_lco(addr)? {
                Some(lco) => {
                    let counter = lco
                        .0
                        .clone()
                        .as_any()
                        .downcast::<Gencount>()
                        .map_err(|_| Error::Failed)?;
                    counter.wait_for(gen).await
                }
                None => cx
                    .call_sync(addr, action::GENCOUNT_WAIT, gen.to_le_bytes(), 0)
                    .await
                    .map(drop),
            }
        }
    }

    fn get_with(
        &self,
        addr: GlobalAddr,
        size: usize,
        reset: bool,
    ) -> impl Future<Output = Result<Vec<u8>, Error>> + Send + 'static {
        let cx = self.clone();
        async move {
            match cx.local_lco(addr)? {
                Some(lco) => lco.0.clone().get(size, reset).await,
                None => {
                    cx.call_sync(addr, action::LCO_GET, get_args(size, reset), size)
                        .await
                }
            }
        }
    }

    fn wait_with(&self, addr: GlobalAddr, reset: bool) -> impl Future<Output = Status> + Send + 'static {
        let cx = self.clone();
        async move {
            match cx.local_lco(addr)? {
                Some(lco) => lco.0.clone().wait(reset).await,
                None => cx
                    .call_sync(addr, action::LCO_WAIT, wait_args(reset), 0)
                    .await
                    .map(drop),
            }
        }
    }

    fn alloc_lco<L: Lco>(&self, lco: Arc<L>) -> GlobalAddr {
        self.rt.gas.alloc_local(Arc::new(LcoEntry(lco)))
    }

    /// Pin `addr` if it lives here. `Ok(None)` means it is remote.
    fn local_lco(&self, addr: GlobalAddr) -> Result<Option<Pinned<LcoEntry>>, Error> {
        if self.rt.gas.owner_of(addr) != self.rank() {
            return Ok(None);
        }
        match Pinned::new(&self.rt.gas, addr) {
            Some(lco) => Ok(Some(lco)),
            None => {
                log::debug!("{addr} is not a live lco");
                Err(Error::Failed)
            }
        }
    }

    fn send_to(&self, addr: GlobalAddr, action: ActionId, args: Vec<u8>) -> Status {
        self.parcel(addr, action)
            .with_args(args)
            .send()
            .map_err(|e| e.error)
    }
}
