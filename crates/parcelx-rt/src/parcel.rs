// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Parcels: addressable active messages.
//!
//! A parcel names a target address, an action and its argument bytes, plus
//! an optional continuation that receives the action's result. A running
//! parcel also carries its thread's stack, so suspending a thread is just
//! handing its parcel to whoever will resume it.

use std::fmt;
use std::sync::Arc;

use crate::action::{self, ActionId, ThreadFuture};
use crate::addr::{GlobalAddr, Rank};
use crate::cx::Cx;
use crate::error::{fatal, Misuse, SendError, Status};
use crate::sched::stack::Stack;
use crate::sched::worker::{self, Shared};

/// Body of a closure thread, built once the parcel first runs.
pub(crate) type Thunk = Box<dyn FnOnce(Cx) -> ThreadFuture + Send>;

pub(crate) struct Envelope {
    pub rt: Arc<Shared>,
    pub id: u64,
    pub target: GlobalAddr,
    pub action: ActionId,
    pub data: Vec<u8>,
    pub c_target: GlobalAddr,
    pub c_action: ActionId,
    pub src: Rank,
    pub stack: Option<Box<Stack>>,
    pub thunk: Option<Thunk>,
}

impl Envelope {
    fn blank(rt: Arc<Shared>) -> Box<Self> {
        Box::new(Self {
            rt,
            id: 0,
            target: GlobalAddr::NULL,
            action: action::NOP,
            data: Vec::new(),
            c_target: GlobalAddr::NULL,
            c_action: action::NOP,
            src: 0,
            stack: None,
            thunk: None,
        })
    }

    /// Reset for reuse, keeping the payload allocation.
    pub fn clear(&mut self) {
        self.id = 0;
        self.target = GlobalAddr::NULL;
        self.action = action::NOP;
        self.data.clear();
        self.c_target = GlobalAddr::NULL;
        self.c_action = action::NOP;
        self.stack = None;
        self.thunk = None;
    }
}

/// An active message. Owned by exactly one queue, cvar or thread at a time.
pub struct Parcel {
    pub(crate) inner: Box<Envelope>,
}

impl Parcel {
    /// An envelope with room for `size` payload bytes, pooled when the
    /// caller is one of `rt`'s workers.
    pub(crate) fn acquire(rt: &Arc<Shared>, size: usize) -> Parcel {
        let mut inner = worker::take_envelope(rt).unwrap_or_else(|| Envelope::blank(rt.clone()));
        inner.id = rt.next_parcel_id();
        inner.src = rt.here();
        inner.data.reserve(size);
        Parcel { inner }
    }

    /// A closure thread on this rank.
    pub(crate) fn thread(rt: &Arc<Shared>, thunk: Thunk) -> Parcel {
        let mut parcel = Self::acquire(rt, 0).with_target(GlobalAddr::there(rt.here()), action::THREAD);
        parcel.inner.thunk = Some(thunk);
        parcel
    }

    pub(crate) fn with_target(mut self, target: GlobalAddr, action: ActionId) -> Self {
        self.inner.target = target;
        self.inner.action = action;
        self
    }

    /// Replace the argument bytes.
    pub fn with_args(mut self, args: impl Into<Vec<u8>>) -> Self {
        self.inner.data = args.into();
        self
    }

    /// Send the action's result to `action` at `target` when it finishes.
    pub fn with_continuation(mut self, target: GlobalAddr, action: ActionId) -> Self {
        self.inner.c_target = target;
        self.inner.c_action = action;
        self
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn target(&self) -> GlobalAddr {
        self.inner.target
    }

    pub fn action(&self) -> ActionId {
        self.inner.action
    }

    pub fn args(&self) -> &[u8] {
        &self.inner.data
    }

    pub fn size(&self) -> usize {
        self.inner.data.len()
    }

    pub fn c_target(&self) -> GlobalAddr {
        self.inner.c_target
    }

    pub fn c_action(&self) -> ActionId {
        self.inner.c_action
    }

    /// Rank that created the parcel.
    pub fn source(&self) -> Rank {
        self.inner.src
    }

    /// True while the parcel carries a suspended thread.
    pub fn is_suspended(&self) -> bool {
        self.inner.stack.is_some()
    }

    /// Execute locally if the target lives on this rank, otherwise hand the
    /// parcel to the network.
    pub fn send(self) -> Result<(), SendError> {
        let rt = self.inner.rt.clone();
        let here = rt.here();
        let owner = rt.gas.owner_of(self.inner.target);
        if owner == here || self.inner.thunk.is_some() {
            rt.spawn(self);
            return Ok(());
        }
        if self.inner.stack.is_some() {
            fatal(Misuse::RemoteThread(owner));
        }
        log::trace!("parcel {} to rank {owner}", self.inner.id);
        rt.network.deliver(self, owner)
    }

    /// Re-admit a suspended parcel with `status` as the result of its
    /// pending `suspend`. The thread runs on the worker it suspended on.
    pub fn resume(mut self, status: Status) {
        let Some(stack) = self.inner.stack.as_mut() else {
            log::debug!("resume of parcel {} that never ran", self.inner.id);
            return self.launch(status);
        };
        stack.wake = status;
        let worker = stack.worker;
        let rt = self.inner.rt.clone();
        rt.readmit(worker, self);
    }

    /// Release a parcel that was waiting on a cvar. Suspended threads resume
    /// with `status`; attached parcels are sent on success and dropped on
    /// error.
    pub(crate) fn launch(self, status: Status) {
        if self.inner.stack.is_some() {
            return self.resume(status);
        }
        match status {
            Ok(()) => {
                let id = self.inner.id;
                if let Err(e) = self.send() {
                    log::warn!("attached parcel {id} could not be sent: {}", e.error);
                }
            }
            Err(e) => log::trace!("dropping attached parcel {} on {e}", self.inner.id),
        }
    }

    /// Move a parcel that arrived from another runtime onto `rt`.
    pub(crate) fn rebind(&mut self, rt: &Arc<Shared>) {
        if !Arc::ptr_eq(&self.inner.rt, rt) {
            self.inner.rt = rt.clone();
        }
    }
}

impl fmt::Debug for Parcel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parcel")
            .field("id", &self.inner.id)
            .field("target", &self.inner.target)
            .field("action", &self.inner.action)
            .field("size", &self.inner.data.len())
            .field("c_target", &self.inner.c_target)
            .field("c_action", &self.inner.c_action)
            .field("src", &self.inner.src)
            .field("suspended", &self.inner.stack.is_some())
            .finish()
    }
}
