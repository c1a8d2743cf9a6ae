// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Action ids and the handler table.
//!
//! Every parcel names an action. The table maps ids to handlers and is
//! fixed once the runtime starts. Every rank must register the same actions
//! in the same order so ids agree across ranks.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::cx::Cx;
use crate::error::Error;
use crate::lco;

/// What a lightweight thread produces: bytes for its continuation, or an
/// error code.
pub type ActionResult = Result<Vec<u8>, Error>;

/// Boxed body of a lightweight thread.
pub type ThreadFuture = Pin<Box<dyn Future<Output = ActionResult> + Send>>;

/// Fixed handler signature: context plus argument bytes.
pub type Handler = Arc<dyn Fn(Cx, Vec<u8>) -> ThreadFuture + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ActionId(pub u16);

impl fmt::Debug for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action#{}", self.0)
    }
}

/// Does nothing.
pub const NOP: ActionId = ActionId(0);
/// Set the target LCO with the argument bytes.
pub const LCO_SET: ActionId = ActionId(1);
/// Signal the target LCO with the `i16` status code in the arguments.
pub const LCO_ERROR: ActionId = ActionId(2);
/// Get `size: u32`, `reset: u8` bytes from the target LCO.
pub const LCO_GET: ActionId = ActionId(3);
/// Wait on the target LCO (`reset: u8`).
pub const LCO_WAIT: ActionId = ActionId(4);
pub const LCO_RESET: ActionId = ActionId(5);
pub const LCO_DELETE: ActionId = ActionId(6);
/// Wait for generation `gen: u64` on the target counter.
pub const GENCOUNT_WAIT: ActionId = ActionId(7);
/// Marks closure threads; never dispatched through the table.
pub const THREAD: ActionId = ActionId(8);

/// First id handed to user actions.
pub const FIRST_USER: u16 = 16;

struct Action {
    name: &'static str,
    handler: Handler,
}

/// Action id → handler table.
#[derive(Clone)]
pub struct Actions {
    table: Vec<Option<Arc<Action>>>,
}

impl Actions {
    /// A table holding only the built-in LCO actions.
    pub fn new() -> Self {
        let mut actions = Self {
            table: vec![None; FIRST_USER as usize],
        };
        actions.install(NOP, "nop", |_, _| async { Ok(Vec::new()) });
        lco::actions::install(&mut actions);
        actions
    }

    /// Register a user action and return its id.
    pub fn register<F, Fut>(&mut self, name: &'static str, f: F) -> ActionId
    where
        F: Fn(Cx, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        let id = ActionId(self.table.len() as u16);
        self.table.push(None);
        self.install(id, name, f);
        id
    }

    pub(crate) fn install<F, Fut>(&mut self, id: ActionId, name: &'static str, f: F)
    where
        F: Fn(Cx, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |cx, args| Box::pin(f(cx, args)) as ThreadFuture);
        self.table[id.0 as usize] = Some(Arc::new(Action { name, handler }));
    }

    pub fn handler(&self, id: ActionId) -> Option<Handler> {
        self.entry(id).map(|a| a.handler.clone())
    }

    pub fn name(&self, id: ActionId) -> &'static str {
        if id == THREAD {
            return "thread";
        }
        self.entry(id).map(|a| a.name).unwrap_or("<unknown>")
    }

    pub fn len(&self) -> usize {
        self.table.iter().filter(|a| a.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, id: ActionId) -> Option<&Arc<Action>> {
        self.table.get(id.0 as usize).and_then(|a| a.as_ref())
    }
}

impl Default for Actions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let actions = Actions::new();
        assert_eq!(actions.name(LCO_SET), "lco_set");
        assert_eq!(actions.name(GENCOUNT_WAIT), "gencount_wait");
        assert!(actions.handler(THREAD).is_none());
        assert_eq!(actions.name(THREAD), "thread");
    }

    #[test]
    fn user_ids_follow_registration_order() {
        let mut actions = Actions::new();
        let a = actions.register("a", |_, _| async { Ok(Vec::new()) });
        let b = actions.register("b", |_, args| async move { Ok(args) });
        assert_eq!(a, ActionId(FIRST_USER));
        assert_eq!(b, ActionId(FIRST_USER + 1));
        assert_eq!(actions.name(b), "b");
        assert!(actions.handler(ActionId(999)).is_none());
    }
}
