// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! parcelx runtime: lightweight threads, work stealing and LCOs.
//!
//! Work arrives as parcels (active messages). Workers run each parcel as a
//! stackless lightweight thread, steal from each other when idle, and park
//! blocked threads on local control objects until they are signalled.
//!
//! Components:
//! - config/error: runtime settings, status codes and fatal misuse
//! - addr/gas: global addresses and the address-space collaborator
//! - action: action ids and the handler table
//! - parcel: the parcel envelope, send/acquire/resume
//! - cx: the context every lightweight thread receives
//! - lco: cvar, the `Lco` contract, futures and generation counters
//! - sched: deques, mailboxes, workers, suspend/resume
//! - net: network collaborator, completion commands, in-process fabric
//! - runtime: start/run/block_on/shutdown facade

pub mod action;
pub mod addr;
pub mod config;
pub mod cx;
pub mod error;
pub mod gas;
pub mod lco;
pub mod net;
pub mod parcel;
pub mod runtime;
pub mod sched;

pub use action::{ActionId, ActionResult, Actions};
pub use addr::{GlobalAddr, Rank};
pub use config::Config;
pub use cx::Cx;
pub use error::{ConfigError, Error, Misuse, RuntimeError, SendError, Status};
pub use lco::{Future, Gencount, Lco, LcoRef};
pub use net::{Command, Fabric, Handle, Loopback, Network};
pub use parcel::Parcel;
pub use runtime::{Builder, Runtime};
pub use sched::{Stats, WorkerState};
