// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker threads and the scheduling loop.
//!
//! Each worker owns two deques: work-first (spawns and resumes) and
//! help-first (yielded threads). Other workers only steal from the deque
//! tops or drop parcels into the mailbox. Everything else a worker owns
//! lives in the thread-local [`Local`], which is never borrowed while a
//! thread frame is polled or a suspend continuation runs.
//!
//! Frames are polled with an inert waker: a thread only leaves a worker
//! through [`suspend`](super::suspend::suspend) or a yield.

use std::cell::RefCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use crossbeam_utils::sync::{Parker, Unparker};
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

use super::deque::{Owner, Steal, Stealer};
use super::mailbox::Mailbox;
use super::stack::{Freelist, Stack};
use super::stats::Stats;
use super::suspend;
use crate::action::{self, ActionResult, Actions, ThreadFuture};
use crate::addr::{GlobalAddr, Rank};
use crate::config::Config;
use crate::cx::Cx;
use crate::error::{Error, Status};
use crate::gas::Gas;
use crate::net::Network;
use crate::parcel::{Envelope, Parcel};

const WORK_FIRST: usize = 0;
const HELP_FIRST: usize = 1;

/// Busy workers check their mailbox every this many local pops.
const MAIL_INTERVAL: u32 = 61;

/// Observable worker state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle = 0,
    Running = 1,
    Stealing = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Stealing,
            _ => Self::Stopped,
        }
    }
}

/// The parts of a worker other threads may touch.
pub(crate) struct WorkerShared {
    stealers: [Stealer<Parcel>; 2],
    pub mailbox: Mailbox<Parcel>,
    state: AtomicU8,
    unparker: Unparker,
}

impl WorkerShared {
    pub fn new(stealers: [Stealer<Parcel>; 2], unparker: Unparker) -> Self {
        Self {
            stealers,
            mailbox: Mailbox::new(),
            state: AtomicU8::new(WorkerState::Idle as u8),
            unparker,
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn unpark(&self) {
        self.unparker.unpark();
    }

    /// Parcels queued on this worker, including mail.
    pub fn backlog(&self) -> usize {
        self.stealers.iter().map(Stealer::len).sum::<usize>() + self.mailbox.len()
    }
}

/// State shared by all workers of one runtime, external spawners and the
/// network.
pub(crate) struct Shared {
    pub config: Config,
    pub actions: Actions,
    pub gas: Arc<dyn Gas>,
    pub network: Arc<dyn Network>,
    pub workers: Vec<WorkerShared>,
    shutdown: AtomicBool,
    sleepers: AtomicUsize,
    next_mail: AtomicUsize,
    next_id: AtomicU64,
    /// Status passed to `Cx::exit`, consumed by `Runtime::run`.
    pub exit: (Mutex<Option<Status>>, Condvar),
    /// Totals folded in by stopped workers.
    pub stats: Mutex<Stats>,
    waker: Waker,
}

struct Inert;

impl Wake for Inert {
    fn wake(self: Arc<Self>) {}
}

impl Shared {
    pub fn new(
        config: Config,
        actions: Actions,
        gas: Arc<dyn Gas>,
        network: Arc<dyn Network>,
        workers: Vec<WorkerShared>,
    ) -> Self {
        Self {
            config,
            actions,
            gas,
            network,
            workers,
            shutdown: AtomicBool::new(false),
            sleepers: AtomicUsize::new(0),
            next_mail: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            exit: (Mutex::new(None), Condvar::new()),
            stats: Mutex::new(Stats::default()),
            waker: Waker::from(Arc::new(Inert)),
        }
    }

    pub fn here(&self) -> Rank {
        self.config.rank
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Raise the shutdown flag. Returns false if it was already raised.
    pub fn begin_shutdown(&self) -> bool {
        let first = !self.shutdown.swap(true, Ordering::AcqRel);
        for w in &self.workers {
            w.unpark();
        }
        first
    }

    pub fn next_parcel_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run `parcel` here: on the current worker's deque when called from one
    /// of our workers, otherwise through a mailbox.
    pub fn spawn(self: &Arc<Self>, parcel: Parcel) {
        if current_worker(self).is_some() {
            with_local(|l| {
                l.stats.spawns += 1;
                l.queues[WORK_FIRST].push(parcel);
            });
            self.notify_idle();
        } else {
            let n = self.workers.len();
            let worker = self.next_mail.fetch_add(1, Ordering::Relaxed) % n;
            self.mail(worker, parcel);
        }
    }

    /// Re-admit a suspended parcel to `worker`.
    pub fn readmit(self: &Arc<Self>, worker: usize, parcel: Parcel) {
        if current_worker(self) == Some(worker) {
            with_local(|l| l.queues[WORK_FIRST].push(parcel));
            self.notify_idle();
        } else {
            self.mail(worker, parcel);
        }
    }

    /// Drop `parcel` into a worker's mailbox.
    pub fn mail(&self, worker: usize, parcel: Parcel) {
        if self.is_shutdown() {
            log::trace!("dropping parcel {} mailed after shutdown", parcel.id());
            return;
        }
        let w = &self.workers[worker % self.workers.len()];
        w.mailbox.send(parcel);
        w.unpark();
    }

    pub fn request_exit(&self, status: Status) {
        log::debug!("exit requested with {status:?}");
        let (lock, cvar) = &self.exit;
        *lock.lock() = Some(status);
        cvar.notify_all();
    }

    fn notify_idle(&self) {
        if self.sleepers.load(Ordering::SeqCst) == 0 {
            return;
        }
        if let Some(w) = self
            .workers
            .iter()
            .find(|w| w.state() == WorkerState::Idle)
        {
            w.unpark();
        }
    }
}

/// Worker-owned state, reachable only from the worker's own OS thread.
pub(crate) struct Local {
    shared: Arc<Shared>,
    id: usize,
    queues: [Owner<Parcel>; 2],
    stacks: Freelist,
    parcels: Vec<Box<Envelope>>,
    stats: Stats,
    rng: u64,
    last_victim: Option<usize>,
    parker: Parker,
    idle_rounds: u32,
    ticks: u32,
    /// Parcel whose thread is being polled.
    current: Option<u64>,
}

thread_local! {
    static LOCAL: RefCell<Option<Local>> = const { RefCell::new(None) };
}

fn with_local<R>(f: impl FnOnce(&mut Local) -> R) -> Option<R> {
    LOCAL
        .try_with(|slot| slot.borrow_mut().as_mut().map(f))
        .ok()
        .flatten()
}

/// Id of the current worker if it belongs to `rt`.
pub(crate) fn current_worker(rt: &Arc<Shared>) -> Option<usize> {
    with_local(|l| Arc::ptr_eq(&l.shared, rt).then_some(l.id)).flatten()
}

/// Id of the parcel running on the current worker, if it belongs to `rt`.
pub(crate) fn current_parcel(rt: &Arc<Shared>) -> Option<u64> {
    with_local(|l| if Arc::ptr_eq(&l.shared, rt) { l.current } else { None }).flatten()
}

fn set_current(parcel: Option<u64>) {
    with_local(|l| l.current = parcel);
}

/// Id of the current worker of any runtime.
pub(crate) fn any_worker() -> Option<usize> {
    with_local(|l| l.id)
}

/// A pooled envelope from the current worker, if it belongs to `rt`.
pub(crate) fn take_envelope(rt: &Arc<Shared>) -> Option<Box<Envelope>> {
    with_local(|l| {
        if Arc::ptr_eq(&l.shared, rt) {
            l.parcels.pop()
        } else {
            None
        }
    })
    .flatten()
}

/// Return a finished envelope to the current worker's pool.
pub(crate) fn recycle_envelope(rt: &Arc<Shared>, mut env: Box<Envelope>) {
    env.clear();
    let cap = rt.config.parcel_cache;
    with_local(|l| {
        if Arc::ptr_eq(&l.shared, rt) && l.parcels.len() < cap {
            l.parcels.push(env);
        }
    });
}

/// xorshift64 for victim selection.
fn xorshift64(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

/// Worker main loop.
pub(crate) fn run(shared: Arc<Shared>, id: usize, queues: [Owner<Parcel>; 2], parker: Parker) {
    let config = &shared.config;
    let local = Local {
        shared: shared.clone(),
        id,
        queues,
        stacks: Freelist::new(config.stack_cache),
        parcels: Vec::new(),
        stats: Stats::default(),
        rng: config
            .seed
            .wrapping_add((id as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15))
            | 1,
        last_victim: None,
        parker,
        idle_rounds: 0,
        ticks: 0,
        current: None,
    };
    LOCAL.with(|slot| *slot.borrow_mut() = Some(local));
    shared.workers[id].set_state(WorkerState::Running);
    log::debug!("worker {id} started");

    let backoff = Backoff::new();
    loop {
        if shared.is_shutdown() {
            break;
        }

        if let Some(parcel) = next_local(&shared, id) {
            busy(&backoff);
            execute(&shared, id, parcel);
            continue;
        }

        if let Some(parcel) = steal(&shared, id) {
            shared.workers[id].set_state(WorkerState::Running);
            busy(&backoff);
            execute(&shared, id, parcel);
            continue;
        }

        idle(&shared, id, &backoff);
    }

    stop(&shared, id);
}

fn busy(backoff: &Backoff) {
    backoff.reset();
    with_local(|l| l.idle_rounds = 0);
}

/// Work-first pop, then mail, then yielded work.
fn next_local(shared: &Shared, id: usize) -> Option<Parcel> {
    let tick = with_local(|l| {
        l.ticks = l.ticks.wrapping_add(1);
        l.ticks % MAIL_INTERVAL == 0
    })
    .unwrap_or(false);
    if tick {
        receive_mail(shared, id);
    }
    if let Some(parcel) = with_local(|l| l.queues[WORK_FIRST].pop()).flatten() {
        return Some(parcel);
    }
    receive_mail(shared, id);
    with_local(|l| {
        l.queues[WORK_FIRST]
            .pop()
            .or_else(|| l.queues[HELP_FIRST].pop())
    })
    .flatten()
}

fn receive_mail(shared: &Shared, id: usize) {
    let mail = shared.workers[id].mailbox.take_all();
    if mail.is_empty() {
        return;
    }
    with_local(|l| {
        l.stats.mail += mail.len() as u64;
        // Oldest mail ends up on top of the LIFO end.
        for parcel in mail.into_iter().rev() {
            l.queues[WORK_FIRST].push(parcel);
        }
    });
}

fn steal(shared: &Shared, id: usize) -> Option<Parcel> {
    let n = shared.workers.len();
    if n < 2 {
        return None;
    }
    shared.workers[id].set_state(WorkerState::Stealing);

    let (last, start) = with_local(|l| (l.last_victim, xorshift64(&mut l.rng) as usize % n))?;
    let victims = last
        .into_iter()
        .chain((0..n).map(|i| (start + i) % n))
        .filter(|&v| v != id);

    for victim in victims {
        if let Some(parcel) = steal_from(&shared.workers[victim]) {
            log::trace!("worker {id} stole parcel {} from worker {victim}", parcel.id());
            with_local(|l| {
                l.stats.steals += 1;
                l.last_victim = Some(victim);
            });
            return Some(parcel);
        }
    }

    with_local(|l| {
        l.stats.failed_steals += 1;
        l.last_victim = None;
    });
    None
}

fn steal_from(victim: &WorkerShared) -> Option<Parcel> {
    for stealer in &victim.stealers {
        loop {
            match stealer.steal() {
                Steal::Success(parcel) => return Some(parcel),
                Steal::Abort => continue,
                Steal::Empty => break,
            }
        }
    }
    None
}

fn idle(shared: &Shared, id: usize, backoff: &Backoff) {
    let rounds = with_local(|l| {
        l.idle_rounds = l.idle_rounds.saturating_add(1);
        l.idle_rounds
    })
    .unwrap_or(u32::MAX);
    if rounds <= shared.config.idle_spins {
        backoff.snooze();
        return;
    }

    let me = &shared.workers[id];
    me.set_state(WorkerState::Idle);
    shared.sleepers.fetch_add(1, Ordering::SeqCst);
    if me.mailbox.is_empty() && !shared.is_shutdown() {
        let timeout = shared.config.idle_park_max;
        with_local(|l| l.parker.park_timeout(timeout));
    }
    shared.sleepers.fetch_sub(1, Ordering::SeqCst);
    me.set_state(WorkerState::Running);
}

fn stop(shared: &Shared, id: usize) {
    let local = LOCAL.with(|slot| slot.borrow_mut().take());
    shared.workers[id].set_state(WorkerState::Stopped);
    let Some(local) = local else {
        return;
    };

    let mut discarded = 0usize;
    for queue in &local.queues {
        while let Some(parcel) = queue.pop() {
            drop(parcel);
            discarded += 1;
        }
    }
    for parcel in shared.workers[id].mailbox.take_all() {
        drop(parcel);
        discarded += 1;
    }
    *shared.stats.lock() += &local.stats;
    log::debug!("worker {id} stopped, {discarded} parcels discarded");
}

/// Run one parcel until it finishes, suspends or yields.
fn execute(shared: &Arc<Shared>, id: usize, mut parcel: Parcel) {
    let mut stack = match parcel.inner.stack.take() {
        Some(stack) => stack,
        None => with_local(|l| {
            let (stack, fresh) = l.stacks.acquire();
            if fresh {
                l.stats.stacks += 1;
            }
            stack
        })
        .unwrap_or_else(Stack::new),
    };

    set_current(Some(parcel.id()));
    let frame = match stack.frame.take() {
        Some(frame) => Ok(Some(frame)),
        None => panic::catch_unwind(AssertUnwindSafe(|| bind(shared, &mut parcel))),
    };
    let mut frame = match frame {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            set_current(None);
            return finish(shared, parcel, stack, Err(Error::Failed));
        }
        Err(payload) => {
            set_current(None);
            return panicked(shared, parcel, stack, None, payload);
        }
    };

    suspend::enter(stack.wake);
    let polled = panic::catch_unwind(AssertUnwindSafe(|| {
        frame
            .as_mut()
            .poll(&mut Context::from_waker(&shared.waker))
    }));
    suspend::leave();
    set_current(None);

    match polled {
        Ok(Poll::Ready(result)) => {
            drop(frame);
            finish(shared, parcel, stack, result);
        }
        Ok(Poll::Pending) => {
            stack.frame = Some(frame);
            stack.worker = id;
            parcel.inner.stack = Some(stack);
            match suspend::take_pending() {
                Some(k) => {
                    let pid = parcel.id();
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || k(parcel))) {
                        log::error!(
                            "suspend continuation of parcel {pid} panicked: {}",
                            panic_message(payload.as_ref())
                        );
                    }
                }
                None => {
                    with_local(|l| {
                        l.stats.yields += 1;
                        l.queues[HELP_FIRST].push(parcel);
                    });
                }
            }
        }
        Err(payload) => panicked(shared, parcel, stack, Some(frame), payload),
    }
}

/// Build the frame for a parcel that has not started yet.
fn bind(shared: &Arc<Shared>, parcel: &mut Parcel) -> Option<ThreadFuture> {
    let cx = Cx::new(shared.clone(), parcel);
    if let Some(thunk) = parcel.inner.thunk.take() {
        return Some(thunk(cx));
    }
    let action = parcel.inner.action;
    match shared.actions.handler(action) {
        Some(handler) => Some(handler(cx, std::mem::take(&mut parcel.inner.data))),
        None => {
            log::warn!("parcel {} names unregistered {action:?}", parcel.id());
            None
        }
    }
}

fn panicked(
    shared: &Arc<Shared>,
    parcel: Parcel,
    stack: Box<Stack>,
    frame: Option<ThreadFuture>,
    payload: Box<dyn std::any::Any + Send>,
) {
    let msg = panic_message(payload.as_ref());
    log::error!(
        "thread {} (parcel {}) panicked: {msg}",
        shared.actions.name(parcel.action()),
        parcel.id()
    );
    drop(suspend::take_pending());
    drop(frame);
    finish(shared, parcel, stack, Err(Error::Failed));
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Recycle the stack and envelope, and send the continuation.
fn finish(shared: &Arc<Shared>, parcel: Parcel, stack: Box<Stack>, result: ActionResult) {
    with_local(|l| {
        l.stacks.release(stack);
        l.stats.executed += 1;
    });

    let env = parcel.inner;
    let (c_target, c_action) = (env.c_target, env.c_action);
    match result {
        Ok(bytes) if !c_target.is_null() => continue_with(shared, c_target, c_action, bytes),
        Ok(_) => {}
        Err(e) if !c_target.is_null() && c_action == action::LCO_SET => {
            continue_with(
                shared,
                c_target,
                action::LCO_ERROR,
                e.code().to_le_bytes().to_vec(),
            );
        }
        Err(e) => log::debug!(
            "{} (parcel {}) finished with {e}",
            shared.actions.name(env.action),
            env.id
        ),
    }
    recycle_envelope(shared, env);
}

fn continue_with(shared: &Arc<Shared>, target: GlobalAddr, action: action::ActionId, bytes: Vec<u8>) {
    let parcel = Parcel::acquire(shared, 0)
        .with_target(target, action)
        .with_args(bytes);
    if let Err(e) = parcel.send() {
        log::warn!("continuation to {target} dropped: {}", e.error);
    }
}
