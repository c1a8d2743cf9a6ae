// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Condition variable for lightweight threads.
//!
//! A FIFO of parcels blocked on some condition, plus a terminal error. Always
//! used under the owning LCO's lock. Signalling takes the waiters out as a
//! [`Released`] batch, which is launched only after the lock is dropped.

use std::collections::VecDeque;

use crate::error::{Error, Misuse, Status};
use crate::parcel::Parcel;

pub(crate) struct Cvar<T = Parcel> {
    waiters: VecDeque<T>,
    error: Status,
}

impl<T> Cvar<T> {
    pub fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
            error: Ok(()),
        }
    }

    /// Queue a waiter. Once an error is set the waiter is handed back with
    /// it instead.
    pub fn push(&mut self, waiter: T) -> Result<(), (T, Error)> {
        match self.error {
            Ok(()) => {
                self.waiters.push_back(waiter);
                Ok(())
            }
            Err(e) => Err((waiter, e)),
        }
    }

    /// Wake everyone with success.
    pub fn signal_all(&mut self) -> Released<T> {
        Released {
            waiters: std::mem::take(&mut self.waiters),
            status: Ok(()),
        }
    }

    /// Make `error` terminal and wake everyone with it. The first error
    /// sticks.
    pub fn signal_error(&mut self, error: Error) -> Released<T> {
        if self.error.is_ok() {
            self.error = Err(error);
        }
        Released {
            waiters: std::mem::take(&mut self.waiters),
            status: self.error,
        }
    }

    /// Clear the error. Fails while anyone is waiting.
    pub fn try_reset(&mut self) -> Result<(), Misuse> {
        if !self.waiters.is_empty() {
            return Err(Misuse::ResetWithWaiters);
        }
        self.error = Ok(());
        Ok(())
    }

    pub fn error(&self) -> Status {
        self.error
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Take every waiter without a signal.
    pub fn abandon(&mut self, status: Status) -> Released<T> {
        Released {
            waiters: std::mem::take(&mut self.waiters),
            status,
        }
    }
}

/// Waiters taken out of a cvar, with the status they wake to.
#[must_use = "released waiters must be launched"]
pub(crate) struct Released<T = Parcel> {
    waiters: VecDeque<T>,
    status: Status,
}

impl<T> Released<T> {
    pub fn none() -> Self {
        Self {
            waiters: VecDeque::new(),
            status: Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    #[cfg(test)]
    pub fn status(&self) -> Status {
        self.status
    }

    #[cfg(test)]
    pub fn into_waiters(self) -> VecDeque<T> {
        self.waiters
    }

    /// Merge another batch. Both must wake to the same status.
    pub fn chain(mut self, other: Released<T>) -> Self {
        debug_assert!(other.waiters.is_empty() || self.waiters.is_empty() || self.status == other.status);
        if self.waiters.is_empty() {
            self.status = other.status;
        }
        self.waiters.extend(other.waiters);
        self
    }
}

impl Released<Parcel> {
    /// Resume or send every waiter. Call with no LCO lock held.
    pub fn launch(self) {
        let status = self.status;
        for parcel in self.waiters {
            parcel.launch(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_all_releases_in_fifo_order() {
        let mut cv = Cvar::new();
        cv.push(1).unwrap();
        cv.push(2).unwrap();
        assert_eq!(cv.len(), 2);
        let released = cv.signal_all();
        assert_eq!(released.status(), Ok(()));
        assert_eq!(released.into_waiters(), [1, 2]);
        assert!(cv.is_empty());
    }

    #[test]
    fn error_is_terminal_for_later_waiters() {
        let mut cv = Cvar::new();
        cv.push(1).unwrap();
        let released = cv.signal_error(Error::Timeout);
        assert_eq!(released.status(), Err(Error::Timeout));
        assert_eq!(released.len(), 1);

        assert_eq!(cv.push(2), Err((2, Error::Timeout)));
        // The first error sticks.
        let released = cv.signal_error(Error::Lco);
        assert_eq!(released.status(), Err(Error::Timeout));
        assert_eq!(cv.error(), Err(Error::Timeout));
    }

    #[test]
    fn reset_refuses_waiters() {
        let mut cv = Cvar::new();
        let _ = cv.signal_error(Error::Lco);
        cv.try_reset().unwrap();
        assert_eq!(cv.error(), Ok(()));

        cv.push(7).unwrap();
        assert_eq!(cv.try_reset(), Err(Misuse::ResetWithWaiters));
        assert_eq!(cv.signal_all().len(), 1);
        assert!(cv.try_reset().is_ok());
    }

    #[test]
    fn chained_batches_keep_order() {
        let mut a = Cvar::new();
        let mut b = Cvar::new();
        a.push(1).unwrap();
        b.push(2).unwrap();
        let all = Released::none().chain(a.signal_all()).chain(b.signal_all());
        assert_eq!(all.into_waiters(), [1, 2]);
    }
}
