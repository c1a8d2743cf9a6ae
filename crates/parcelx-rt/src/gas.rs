// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Global address space collaborator.
//!
//! The scheduler only needs to pin an address to a local object, or learn
//! that it lives elsewhere. `LocalTable` is the in-process implementation:
//! one table per rank, objects stored as `Arc<dyn Any>`.

use std::any::Any;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::addr::{GlobalAddr, Rank};
use crate::error::{Error, Status};

/// A locally resident object.
pub type Object = Arc<dyn Any + Send + Sync>;

pub trait Gas: Send + Sync {
    /// The rank this instance serves.
    fn here(&self) -> Rank;

    fn owner_of(&self, addr: GlobalAddr) -> Rank {
        addr.rank()
    }

    /// Pin `addr` to its local object. `None` means the address is remote
    /// (or unallocated) and must be reached by sending a parcel.
    fn try_pin(&self, addr: GlobalAddr) -> Option<Object>;

    fn unpin(&self, addr: GlobalAddr);

    /// Place `obj` in this rank's segment.
    fn alloc_local(&self, obj: Object) -> GlobalAddr;

    /// Release `addr`. Remote addresses answer `Resend`.
    fn free(&self, addr: GlobalAddr) -> Status;

    /// Remove every object and hand them back. Called once the runtime has
    /// stopped.
    fn clear(&self) -> Vec<Object> {
        Vec::new()
    }
}

/// A pinned object. Unpins on drop.
pub struct Pinned<T: ?Sized> {
    gas: Arc<dyn Gas>,
    addr: GlobalAddr,
    obj: Arc<T>,
}

impl<T: Any + Send + Sync> Pinned<T> {
    /// Pin `addr` and downcast it to `T`.
    pub fn new(gas: &Arc<dyn Gas>, addr: GlobalAddr) -> Option<Self> {
        let obj = gas.try_pin(addr)?;
        match obj.downcast::<T>() {
            Ok(obj) => Some(Self {
                gas: gas.clone(),
                addr,
                obj,
            }),
            Err(_) => {
                gas.unpin(addr);
                None
            }
        }
    }
}

impl<T: ?Sized> Pinned<T> {
    pub fn addr(&self) -> GlobalAddr {
        self.addr
    }

    pub fn arc(&self) -> &Arc<T> {
        &self.obj
    }
}

impl<T: ?Sized> Deref for Pinned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.obj
    }
}

impl<T: ?Sized> Drop for Pinned<T> {
    fn drop(&mut self) {
        self.gas.unpin(self.addr);
    }
}

struct Entry {
    obj: Object,
    pins: usize,
}

/// Per-rank object table.
pub struct LocalTable {
    rank: Rank,
    next: AtomicU64,
    entries: Mutex<HashMap<u64, Entry>>,
}

/// First offset handed out; lower offsets are reserved (1 is the locality).
const FIRST_OFFSET: u64 = 0x10;

impl LocalTable {
    pub fn new(rank: Rank) -> Self {
        Self {
            rank,
            next: AtomicU64::new(FIRST_OFFSET),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Outstanding pins on `addr`.
    pub fn pins(&self, addr: GlobalAddr) -> usize {
        self.entries
            .lock()
            .get(&addr.offset())
            .map(|e| e.pins)
            .unwrap_or(0)
    }
}

impl Gas for LocalTable {
    fn here(&self) -> Rank {
        self.rank
    }

    fn try_pin(&self, addr: GlobalAddr) -> Option<Object> {
        if addr.is_null() || self.owner_of(addr) != self.rank {
            return None;
        }
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&addr.offset())?;
        entry.pins += 1;
        Some(entry.obj.clone())
    }

    fn unpin(&self, addr: GlobalAddr) {
        if let Some(entry) = self.entries.lock().get_mut(&addr.offset()) {
            debug_assert!(entry.pins > 0, "unpin of unpinned address {addr}");
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    fn alloc_local(&self, obj: Object) -> GlobalAddr {
        let offset = self.next.fetch_add(FIRST_OFFSET, Ordering::Relaxed);
        self.entries.lock().insert(offset, Entry { obj, pins: 0 });
        GlobalAddr::new(self.rank, offset)
    }

    fn free(&self, addr: GlobalAddr) -> Status {
        if self.owner_of(addr) != self.rank {
            return Err(Error::Resend);
        }
        match self.entries.lock().remove(&addr.offset()) {
            Some(entry) => {
                if entry.pins > 0 {
                    log::warn!("freeing {addr} with {} outstanding pins", entry.pins);
                }
                Ok(())
            }
            None => Err(Error::Failed),
        }
    }

    fn clear(&self) -> Vec<Object> {
        // Collected first so objects drop outside the lock.
        let drained: Vec<Entry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        drained.into_iter().map(|e| e.obj).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_counts_follow_guards() {
        let table: Arc<dyn Gas> = Arc::new(LocalTable::new(0));
        let addr = table.alloc_local(Arc::new(7u32));
        {
            let pinned = Pinned::<u32>::new(&table, addr).unwrap();
            assert_eq!(*pinned, 7);
        }
        assert!(table.try_pin(addr).is_some());
        table.unpin(addr);
    }

    #[test]
    fn wrong_type_does_not_stay_pinned() {
        let table = Arc::new(LocalTable::new(0));
        let gas: Arc<dyn Gas> = table.clone();
        let addr = gas.alloc_local(Arc::new(7u32));
        assert!(Pinned::<String>::new(&gas, addr).is_none());
        assert_eq!(table.pins(addr), 0);
    }

    #[test]
    fn remote_addresses_do_not_pin() {
        let table = LocalTable::new(1);
        assert!(table.try_pin(GlobalAddr::new(0, 0x10)).is_none());
        assert_eq!(table.free(GlobalAddr::new(0, 0x10)), Err(Error::Resend));
        assert!(table.try_pin(GlobalAddr::NULL).is_none());
    }

    #[test]
    fn free_removes_entry() {
        let table = LocalTable::new(0);
        let addr = table.alloc_local(Arc::new(()));
        assert_eq!(table.len(), 1);
        table.free(addr).unwrap();
        assert!(table.is_empty());
        assert!(table.try_pin(addr).is_none());
    }

    #[test]
    fn clear_hands_back_objects() {
        let table = LocalTable::new(2);
        table.alloc_local(Arc::new(1u8));
        table.alloc_local(Arc::new(2u8));
        let mut values: Vec<u8> = table
            .clear()
            .into_iter()
            .filter_map(|o| o.downcast::<u8>().ok().map(|v| *v))
            .collect();
        values.sort();
        assert_eq!(values, [1, 2]);
        assert!(table.is_empty());
    }
}
