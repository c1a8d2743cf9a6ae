// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Lightweight-thread stacks.
//!
//! Threads are stackless coroutines, so a "stack" is the record that carries
//! a running thread between polls: the boxed coroutine frame, the status the
//! next resume delivers, and the worker it last suspended on. Stacks follow
//! their parcel across workers and land on the freelist of whichever worker
//! finishes the thread.

use crate::action::ThreadFuture;
use crate::error::Status;

pub(crate) struct Stack {
    pub frame: Option<ThreadFuture>,
    /// Delivered as the return value of the pending `suspend`.
    pub wake: Status,
    /// Worker the thread last suspended on; resumes are mailed there.
    pub worker: usize,
}

impl Stack {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            frame: None,
            wake: Ok(()),
            worker: 0,
        })
    }
}

/// Bounded per-worker cache of finished stacks.
pub(crate) struct Freelist {
    stacks: Vec<Box<Stack>>,
    cap: usize,
}

impl Freelist {
    pub fn new(cap: usize) -> Self {
        Self {
            stacks: Vec::with_capacity(cap.min(64)),
            cap,
        }
    }

    /// A clean stack, reused when possible. The flag reports a fresh
    /// allocation.
    pub fn acquire(&mut self) -> (Box<Stack>, bool) {
        match self.stacks.pop() {
            Some(stack) => (stack, false),
            None => (Stack::new(), true),
        }
    }

    /// Return a finished stack. Its frame must already be dropped.
    pub fn release(&mut self, mut stack: Box<Stack>) {
        debug_assert!(stack.frame.is_none());
        if self.stacks.len() < self.cap {
            stack.wake = Ok(());
            self.stacks.push(stack);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.stacks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn reuses_released_stacks() {
        let mut fl = Freelist::new(4);
        let (stack, fresh) = fl.acquire();
        assert!(fresh);
        fl.release(stack);
        let (stack, fresh) = fl.acquire();
        assert!(!fresh);
        assert_eq!(stack.wake, Ok(()));
    }

    #[test]
    fn bounded_by_capacity() {
        let mut fl = Freelist::new(2);
        for _ in 0..5 {
            let mut stack = Stack::new();
            stack.wake = Err(Error::Lco);
            fl.release(stack);
        }
        assert_eq!(fl.len(), 2);
        // Released stacks come back clean.
        assert_eq!(fl.acquire().0.wake, Ok(()));
    }
}
