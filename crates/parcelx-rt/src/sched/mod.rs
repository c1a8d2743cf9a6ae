// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Lightweight-thread scheduler.
//!
//! Stackless threads on a work-stealing pool of OS worker threads.
//!
//! Components:
//! - `deque`: Chase-Lev work-stealing deque
//! - `mailbox`: cross-worker inbox
//! - `stack`: per-thread frame records and their freelist
//! - `suspend`: cooperative suspend/yield primitives
//! - `stats`: per-worker counters
//! - `worker`: shared runtime state and the scheduling loop

pub(crate) mod deque;
pub(crate) mod mailbox;
pub(crate) mod stack;
pub(crate) mod stats;
pub mod suspend;
pub(crate) mod worker;

pub use stats::Stats;
pub use suspend::{suspend, Continuation, Suspend, Yield};
pub use worker::WorkerState;
