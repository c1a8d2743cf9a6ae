// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime facade.
//!
//! Owns the worker threads of one rank. Host threads enter the runtime
//! through [`Runtime::block_on`], [`Runtime::run`] or the spawn/mail
//! helpers, and leave it through [`Runtime::shutdown`] or by dropping it.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_utils::sync::Parker;
use parking_lot::{Condvar, Mutex};

use crate::action::{ActionId, Actions};
use crate::addr::{GlobalAddr, Rank};
use crate::config::Config;
use crate::cx::{spawn_thread, Cx};
use crate::error::{RuntimeError, Status};
use crate::gas::{Gas, LocalTable};
use crate::lco::LcoEntry;
use crate::net::{Fabric, Handle, Loopback, Network};
use crate::parcel::Parcel;
use crate::sched::deque;
use crate::sched::worker::{self, Shared, WorkerShared, WorkerState};
use crate::sched::Stats;

/// How often host threads blocked in the runtime re-check for shutdown.
const HOST_POLL: Duration = Duration::from_millis(20);

/// Runtime setup with optional collaborators.
pub struct Builder {
    config: Config,
    actions: Actions,
    gas: Option<Arc<dyn Gas>>,
    network: Option<Arc<dyn Network>>,
}

impl Builder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            actions: Actions::new(),
            gas: None,
            network: None,
        }
    }

    pub fn actions(mut self, actions: Actions) -> Self {
        self.actions = actions;
        self
    }

    /// Address space to use instead of a fresh [`LocalTable`].
    pub fn gas(mut self, gas: Arc<dyn Gas>) -> Self {
        self.gas = Some(gas);
        self
    }

    pub fn network(mut self, network: Arc<dyn Network>) -> Self {
        self.network = Some(network);
        self
    }

    /// Join an in-process fabric. The rank count follows the fabric.
    pub fn fabric(mut self, fabric: &Arc<Fabric>) -> Self {
        self.config.ranks = fabric.ranks();
        self.network = Some(fabric.clone());
        self
    }

    /// Spawn the workers and register with the network.
    pub fn start(self) -> Result<Runtime, RuntimeError> {
        let config = self.config;
        config.validate()?;
        let rank = config.rank;
        let n = config.resolved_workers();

        let mut workers = Vec::with_capacity(n);
        let mut locals = Vec::with_capacity(n);
        for _ in 0..n {
            let (work_first, wf_stealer) = deque::new(config.deque_capacity);
            let (help_first, hf_stealer) = deque::new(config.deque_capacity);
            let parker = Parker::new();
            workers.push(WorkerShared::new(
                [wf_stealer, hf_stealer],
                parker.unparker().clone(),
            ));
            locals.push(([work_first, help_first], parker));
        }

        let gas: Arc<dyn Gas> = match self.gas {
            Some(gas) => gas,
            None => Arc::new(LocalTable::new(rank)),
        };
        if gas.here() != rank {
            log::warn!("address space serves rank {} but runtime is rank {rank}", gas.here());
        }
        let network: Arc<dyn Network> = match self.network {
            Some(network) => network,
            None => Arc::new(Loopback),
        };
        let shared = Arc::new(Shared::new(config, self.actions, gas, network, workers));

        let mut threads = Vec::with_capacity(n);
        for (id, (queues, parker)) in locals.into_iter().enumerate() {
            let worker_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("parcelx-worker-{id}"))
                .spawn(move || worker::run(worker_shared, id, queues, parker));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    shared.begin_shutdown();
                    for handle in threads {
                        let _ = handle.join();
                    }
                    return Err(RuntimeError::Spawn(e));
                }
            }
        }

        shared.network.bind(rank, Handle::new(&shared));
        log::info!(
            "parcelx rank {rank}/{} started with {n} workers",
            shared.config.ranks
        );
        Ok(Runtime {
            shared,
            threads: Mutex::new(threads),
            stopped: AtomicBool::new(false),
        })
    }
}

/// One rank's scheduler.
pub struct Runtime {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Runtime {
    /// Start a standalone rank.
    pub fn new(config: Config, actions: Actions) -> Result<Self, RuntimeError> {
        Builder::new(config).actions(actions).start()
    }

    pub fn builder(config: Config) -> Builder {
        Builder::new(config)
    }

    pub fn here(&self) -> Rank {
        self.shared.here()
    }

    pub fn workers(&self) -> usize {
        self.shared.workers.len()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn gas(&self) -> &Arc<dyn Gas> {
        &self.shared.gas
    }

    /// Completion entry point for this rank's transport.
    pub fn handle(&self) -> Handle {
        Handle::new(&self.shared)
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.shared.workers.iter().map(|w| w.state()).collect()
    }

    /// Parcels waiting on each worker. A snapshot; it races with the
    /// workers.
    pub fn backlog(&self) -> Vec<usize> {
        self.shared.workers.iter().map(|w| w.backlog()).collect()
    }

    /// Run `f` as a root thread and block until it returns.
    ///
    /// A panic inside the root thread comes back as
    /// [`RuntimeError::Panicked`].
    pub fn block_on<F, Fut, T>(&self, f: F) -> Result<T, RuntimeError>
    where
        F: FnOnce(Cx) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_stopped() {
            return Err(RuntimeError::ShutDown);
        }
        if worker::any_worker().is_some() {
            log::warn!("block_on called from a worker thread; it may deadlock");
        }

        let slot = Arc::new(RootSlot::new());
        let root = Root {
            slot: slot.clone(),
            done: false,
        };
        let parcel = spawn_thread(&self.shared, move |cx| async move {
            let mut root = root;
            let out = CatchPanic(Box::pin(f(cx))).await;
            root.complete(out.map_err(RuntimeError::Panicked));
        });
        self.shared.spawn(parcel);

        let mut value = slot.value.lock();
        loop {
            if let Some(out) = value.take() {
                return out;
            }
            if self.is_stopped() {
                return Err(RuntimeError::ShutDown);
            }
            slot.ready.wait_for(&mut value, HOST_POLL);
        }
    }

    /// Launch `action` here and block until a thread calls
    /// [`Cx::exit`]. Returns the exit status.
    pub fn run(&self, action: ActionId, args: impl Into<Vec<u8>>) -> Result<Status, RuntimeError> {
        if self.is_stopped() {
            return Err(RuntimeError::ShutDown);
        }
        if self.shared.actions.handler(action).is_none() {
            return Err(RuntimeError::UnknownAction(action));
        }
        let (lock, cvar) = &self.shared.exit;
        *lock.lock() = None;
        self.parcel(GlobalAddr::there(self.here()), action)
            .with_args(args)
            .send()?;

        let mut exit = lock.lock();
        loop {
            if let Some(status) = exit.take() {
                return Ok(status);
            }
            if self.is_stopped() {
                return Err(RuntimeError::ShutDown);
            }
            cvar.wait_for(&mut exit, HOST_POLL);
        }
    }

    /// Start a closure thread on some worker.
    pub fn spawn<F, Fut>(&self, f: F)
    where
        F: FnOnce(Cx) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shared.spawn(spawn_thread(&self.shared, f));
    }

    /// Start a closure thread on `worker`. Thieves may still move it.
    pub fn spawn_on<F, Fut>(&self, worker: usize, f: F)
    where
        F: FnOnce(Cx) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.shared.mail(worker, spawn_thread(&self.shared, f));
    }

    /// A new parcel for `action` at `target`.
    pub fn parcel(&self, target: GlobalAddr, action: ActionId) -> Parcel {
        Parcel::acquire(&self.shared, 0).with_target(target, action)
    }

    /// Put `parcel` in `worker`'s mailbox.
    pub fn mail(&self, worker: usize, mut parcel: Parcel) {
        parcel.rebind(&self.shared);
        self.shared.mail(worker, parcel);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop the workers, discard queued work and wake anything still
    /// waiting on an LCO with `Error::Reset`. Returns the run's totals.
    pub fn shutdown(&self) -> Stats {
        let first = self.shared.begin_shutdown();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                log::error!("worker thread panicked during shutdown");
            }
        }
        if !first {
            return *self.shared.stats.lock();
        }

        for w in &self.shared.workers {
            drop(w.mailbox.take_all());
        }
        // LCO waiters hold parcels that hold the runtime; waking them
        // breaks the cycle.
        let objects = self.shared.gas.clear();
        let mut abandoned = 0usize;
        for obj in objects {
            if let Ok(entry) = obj.downcast::<LcoEntry>() {
                entry.0.abandon();
                abandoned += 1;
            }
        }
        self.stopped.store(true, Ordering::Release);

        let stats = *self.shared.stats.lock();
        log::info!(
            "parcelx rank {} shut down ({abandoned} lcos released): {stats}",
            self.here()
        );
        stats
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct RootSlot<T> {
    value: Mutex<Option<Result<T, RuntimeError>>>,
    ready: Condvar,
}

impl<T> RootSlot<T> {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn fill(&self, out: Result<T, RuntimeError>) {
        *self.value.lock() = Some(out);
        self.ready.notify_all();
    }
}

/// Reports the root thread's result. A root dropped before completing was
/// discarded by shutdown.
struct Root<T> {
    slot: Arc<RootSlot<T>>,
    done: bool,
}

impl<T> Root<T> {
    fn complete(&mut self, out: Result<T, RuntimeError>) {
        self.done = true;
        self.slot.fill(out);
    }
}

impl<T> Drop for Root<T> {
    fn drop(&mut self) {
        if !self.done {
            self.slot.fill(Err(RuntimeError::ShutDown));
        }
    }
}

/// Turns a panic while polling the inner future into an `Err` message.
struct CatchPanic<F>(F);

impl<F: Future + Unpin> Future for CatchPanic<F> {
    type Output = Result<F::Output, String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = &mut self.0;
        match panic::catch_unwind(AssertUnwindSafe(|| Pin::new(inner).poll(cx))) {
            Ok(Poll::Ready(out)) => Poll::Ready(Ok(out)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(worker::panic_message(payload.as_ref()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn runtime(workers: usize) -> Runtime {
        Runtime::new(Config::with_workers(workers), Actions::new()).unwrap()
    }

    #[test]
    fn block_on_returns_the_root_value() {
        let rt = runtime(2);
        assert_eq!(rt.block_on(|cx| async move { cx.rank() + 40 }).unwrap(), 40);
        assert_eq!(rt.workers(), 2);
    }

    #[test]
    fn root_panics_are_reported() {
        let rt = runtime(1);
        let err = rt
            .block_on(|_| async { panic!("root went wrong") })
            .unwrap_err();
        match err {
            RuntimeError::Panicked(msg) => assert_eq!(msg, "root went wrong"),
            other => panic!("unexpected {other:?}"),
        }
        // The worker survives.
        assert_eq!(rt.block_on(|_| async { 1 }).unwrap(), 1);
    }

    #[test]
    fn run_returns_exit_status() {
        let mut actions = Actions::new();
        let finish = actions.register("finish", |cx, args| async move {
            let code = i16::from_le_bytes([args[0], args[1]]);
            cx.exit(Error::from_code(code));
            Ok(Vec::new())
        });
        let rt = Runtime::new(Config::with_workers(2), actions).unwrap();
        assert_eq!(rt.run(finish, 0i16.to_le_bytes()).unwrap(), Ok(()));
        assert_eq!(
            rt.run(finish, Error::Timeout.code().to_le_bytes()).unwrap(),
            Err(Error::Timeout)
        );
        assert!(matches!(
            rt.run(ActionId(900), Vec::new()),
            Err(RuntimeError::UnknownAction(_))
        ));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let rt = runtime(2);
        rt.block_on(|_| async {}).unwrap();
        let first = rt.shutdown();
        assert!(first.executed >= 1);
        assert_eq!(rt.shutdown(), first);
        assert!(rt.is_stopped());
        assert!(matches!(rt.block_on(|_| async {}), Err(RuntimeError::ShutDown)));
        assert!(rt
            .worker_states()
            .iter()
            .all(|s| *s == WorkerState::Stopped));
        assert!(rt.backlog().iter().all(|&n| n == 0));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = Config {
            rank: 3,
            ranks: 2,
            ..Config::default()
        };
        assert!(matches!(
            Runtime::new(config, Actions::new()),
            Err(RuntimeError::Config(_))
        ));
    }
}
