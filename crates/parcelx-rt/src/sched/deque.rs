// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Chase-Lev work-stealing deque.
//!
//! The owner pushes and pops at the bottom without contention. Thieves take
//! from the top; a thief and the owner only race for the last element, and
//! that race is settled by a CAS on `top`. The ring grows by doubling; old
//! rings stay alive until the deque is dropped because a thief may still be
//! reading from one.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{fence, AtomicIsize, AtomicPtr, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

/// Outcome of a steal attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Steal<T> {
    Empty,
    /// Lost a race with the owner or another thief. Try again later.
    Abort,
    Success(T),
}

struct Ring<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
}

impl<T> Ring<T> {
    fn alloc(cap: usize) -> Box<Self> {
        debug_assert!(cap.is_power_of_two());
        let slots = (0..cap)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Box::new(Self {
            slots,
            mask: cap - 1,
        })
    }

    fn cap(&self) -> usize {
        self.mask + 1
    }

    fn slot(&self, i: isize) -> *mut MaybeUninit<T> {
        self.slots[(i as usize) & self.mask].get()
    }

    /// SAFETY: caller owns index `i` for writing.
    unsafe fn write(&self, i: isize, value: T) {
        ptr::write_volatile(self.slot(i), MaybeUninit::new(value));
    }

    /// Bitwise copy of slot `i`. Ownership is only taken once the caller
    /// wins the index.
    unsafe fn read(&self, i: isize) -> MaybeUninit<T> {
        ptr::read_volatile(self.slot(i))
    }
}

struct Inner<T> {
    top: CachePadded<AtomicIsize>,
    bottom: CachePadded<AtomicIsize>,
    ring: CachePadded<AtomicPtr<Ring<T>>>,
    retired: Mutex<Vec<Box<Ring<T>>>>,
}

// SAFETY: values move between threads only through the CAS protocol; each
// value is handed to exactly one side.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let t = *self.top.get_mut();
        let b = *self.bottom.get_mut();
        let ring = *self.ring.get_mut();
        // SAFETY: no other handle exists; [t, b) are initialized and owned.
        unsafe {
            for i in t..b {
                drop((*ring).read(i).assume_init());
            }
            drop(Box::from_raw(ring));
        }
    }
}

/// Owner end: push/pop at the bottom. One per deque, not shareable.
pub(crate) struct Owner<T> {
    inner: Arc<Inner<T>>,
    _not_sync: PhantomData<*mut ()>,
}

// SAFETY: the owner may move to its worker thread; `!Sync` keeps the bottom
// single-threaded.
unsafe impl<T: Send> Send for Owner<T> {}

/// Thief end: steal from the top. Cloneable, shared across workers.
pub(crate) struct Stealer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// New deque with room for `capacity` entries before the first grow.
pub(crate) fn new<T>(capacity: usize) -> (Owner<T>, Stealer<T>) {
    let cap = capacity.max(2).next_power_of_two();
    let inner = Arc::new(Inner {
        top: CachePadded::new(AtomicIsize::new(0)),
        bottom: CachePadded::new(AtomicIsize::new(0)),
        ring: CachePadded::new(AtomicPtr::new(Box::into_raw(Ring::alloc(cap)))),
        retired: Mutex::new(Vec::new()),
    });
    (
        Owner {
            inner: inner.clone(),
            _not_sync: PhantomData,
        },
        Stealer { inner },
    )
}

impl<T> Owner<T> {
    pub fn push(&self, value: T) {
        let inner = &*self.inner;
        let b = inner.bottom.load(Ordering::Relaxed);
        let t = inner.top.load(Ordering::Acquire);
        let mut ring = inner.ring.load(Ordering::Relaxed);

        // SAFETY: only the owner replaces the ring.
        if b - t >= unsafe { (*ring).cap() } as isize {
            ring = self.grow(b, t, ring);
        }

        // SAFETY: slot `b` is outside [t, b) so no thief reads it yet.
        unsafe { (*ring).write(b, value) };
        fence(Ordering::Release);
        inner.bottom.store(b + 1, Ordering::Relaxed);
    }

    /// LIFO pop from the bottom.
    pub fn pop(&self) -> Option<T> {
        let inner = &*self.inner;
        let b = inner.bottom.load(Ordering::Relaxed) - 1;
        let ring = inner.ring.load(Ordering::Relaxed);
        inner.bottom.store(b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = inner.top.load(Ordering::Relaxed);

        if t > b {
            inner.bottom.store(b + 1, Ordering::Relaxed);
            return None;
        }

        // SAFETY: b is in [t, b] and the owner wrote it.
        let value = unsafe { (*ring).read(b) };
        if t == b {
            // Last element: race thieves for it.
            let won = inner
                .top
                .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            inner.bottom.store(b + 1, Ordering::Relaxed);
            if !won {
                return None;
            }
        }
        // SAFETY: index b is ours, either uncontended or by winning the CAS.
        Some(unsafe { value.assume_init() })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    fn grow(&self, b: isize, t: isize, old: *mut Ring<T>) -> *mut Ring<T> {
        let inner = &*self.inner;
        // SAFETY: `old` is the live ring; [t, b) are initialized.
        unsafe {
            let bigger = Ring::alloc((*old).cap() * 2);
            for i in t..b {
                bigger.write(i, (*old).read(i).assume_init());
            }
            let fresh = Box::into_raw(bigger);
            inner.ring.store(fresh, Ordering::Release);
            // Thieves may still hold `old`; it stays allocated until drop.
            inner.retired.lock().push(Box::from_raw(old));
            fresh
        }
    }
}

impl<T> Stealer<T> {
    /// FIFO steal from the top.
    pub fn steal(&self) -> Steal<T> {
        let inner = &*self.inner;
        let t = inner.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = inner.bottom.load(Ordering::Acquire);
        if t >= b {
            return Steal::Empty;
        }

        let ring = inner.ring.load(Ordering::Acquire);
        // SAFETY: retired rings are never freed while the deque lives.
        let value = unsafe { (*ring).read(t) };
        if inner
            .top
            .compare_exchange(t, t + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            // The copy is not ours; MaybeUninit drops nothing.
            return Steal::Abort;
        }
        // SAFETY: winning the CAS hands index t to this thief.
        Steal::Success(unsafe { value.assume_init() })
    }

    /// Approximate; racy against the owner and other thieves.
    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

impl<T> Inner<T> {
    fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        (b - t).max(0) as usize
    }
}
