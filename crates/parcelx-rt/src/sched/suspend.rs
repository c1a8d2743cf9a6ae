// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative suspension.
//!
//! A lightweight thread suspends by awaiting [`Suspend`]. The first poll
//! parks the continuation in a worker-thread slot and returns `Pending`; the
//! worker then hands the thread's own parcel to that continuation, after the
//! poll has fully returned and before it looks for more work. Whoever ends
//! up owning the parcel resumes it with a status, which the second poll
//! returns.
//!
//! A `Pending` poll that leaves no continuation behind is a yield.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::{fatal, Misuse, Status};
use crate::parcel::Parcel;

/// Receives the suspended thread's parcel.
pub type Continuation = Box<dyn FnOnce(Parcel) + Send>;

thread_local! {
    /// Set while a worker is polling a thread frame.
    static POLLING: Cell<bool> = const { Cell::new(false) };
    static PENDING: RefCell<Option<Continuation>> = const { RefCell::new(None) };
    static WAKE: Cell<Status> = const { Cell::new(Ok(())) };
}

/// Suspend the running thread and hand its parcel to `k`.
///
/// Resolves to the status passed to [`Parcel::resume`].
pub fn suspend<F>(k: F) -> Suspend
where
    F: FnOnce(Parcel) + Send + 'static,
{
    Suspend {
        k: Some(Box::new(k)),
    }
}

#[must_use = "a suspension does nothing unless awaited"]
pub struct Suspend {
    k: Option<Continuation>,
}

impl Future for Suspend {
    type Output = Status;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Status> {
        let Some(k) = self.k.take() else {
            return Poll::Ready(WAKE.with(Cell::get));
        };
        if !POLLING.with(Cell::get) {
            fatal(Misuse::NotOnWorker);
        }
        PENDING.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                fatal(Misuse::DoubleSuspend);
            }
            *slot = Some(k);
        });
        Poll::Pending
    }
}

/// Requeue behind other local work once.
#[must_use = "a yield does nothing unless awaited"]
pub struct Yield {
    yielded: bool,
}

pub(crate) fn yield_now() -> Yield {
    Yield { yielded: false }
}

impl Future for Yield {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded || !POLLING.with(Cell::get) {
            return Poll::Ready(());
        }
        self.yielded = true;
        Poll::Pending
    }
}

/// Brackets one poll of a thread frame.
pub(crate) fn enter(wake: Status) {
    WAKE.with(|w| w.set(wake));
    POLLING.with(|p| p.set(true));
}

pub(crate) fn leave() {
    POLLING.with(|p| p.set(false));
}

/// Continuation left behind by the poll that just returned.
pub(crate) fn take_pending() -> Option<Continuation> {
    PENDING.with(|slot| slot.borrow_mut().take())
}
