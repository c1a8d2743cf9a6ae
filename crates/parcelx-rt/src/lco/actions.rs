// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Built-in actions that apply LCO operations to the parcel's target.
//!
//! Argument layouts (little-endian):
//! - `lco_set`       value bytes
//! - `lco_error`     `code: i16`
//! - `lco_get`       `size: u32, reset: u8`
//! - `lco_wait`      `reset: u8`
//! - `gencount_wait` `gen: u64`

use crate::action::{self, ActionResult, Actions};
use crate::cx::Cx;
use crate::error::Error;
use crate::gas::Pinned;

use super::{Gencount, Lco, LcoEntry};

pub(crate) fn install(actions: &mut Actions) {
    actions.install(action::LCO_SET, "lco_set", lco_set);
    actions.install(action::LCO_ERROR, "lco_error", lco_error);
    actions.install(action::LCO_GET, "lco_get", lco_get);
    actions.install(action::LCO_WAIT, "lco_wait", lco_wait);
    actions.install(action::LCO_RESET, "lco_reset", lco_reset);
    actions.install(action::LCO_DELETE, "lco_delete", lco_delete);
    actions.install(action::GENCOUNT_WAIT, "gencount_wait", gencount_wait);
}

async fn lco_set(cx: Cx, args: Vec<u8>) -> ActionResult {
    target(&cx)?.0.set(&args);
    Ok(Vec::new())
}

async fn lco_error(cx: Cx, args: Vec<u8>) -> ActionResult {
    let code = i16::from_le_bytes(field(&args, 0)?);
    let error = Error::from_code(code).err().unwrap_or(Error::Failed);
    target(&cx)?.0.error(error);
    Ok(Vec::new())
}

async fn lco_get(cx: Cx, args: Vec<u8>) -> ActionResult {
    let size = u32::from_le_bytes(field(&args, 0)?) as usize;
    let reset = field::<1>(&args, 4)?[0];
    let lco = target(&cx)?;
    lco.0.clone().get(size, reset != 0).await
}

async fn lco_wait(cx: Cx, args: Vec<u8>) -> ActionResult {
    let reset = args.first().is_some_and(|&r| r != 0);
    let lco = target(&cx)?;
    lco.0.clone().wait(reset).await?;
    Ok(Vec::new())
}

async fn lco_reset(cx: Cx, _args: Vec<u8>) -> ActionResult {
    target(&cx)?.0.reset();
    Ok(Vec::new())
}

async fn lco_delete(cx: Cx, _args: Vec<u8>) -> ActionResult {
    target(&cx)?.0.abandon();
    cx.gas().free(cx.target())?;
    Ok(Vec::new())
}

async fn gencount_wait(cx: Cx, args: Vec<u8>) -> ActionResult {
    let gen = u64::from_le_bytes(field(&args, 0)?);
    let lco = target(&cx)?;
    let counter = lco
        .0
        .clone()
        .as_any()
        .downcast::<Gencount>()
        .map_err(|_| Error::Failed)?;
    counter.wait_for(gen).await?;
    Ok(Vec::new())
}

pub(crate) fn get_args(size: usize, reset: bool) -> Vec<u8> {
    let mut args = (size as u32).to_le_bytes().to_vec();
    args.push(reset as u8);
    args
}

pub(crate) fn wait_args(reset: bool) -> Vec<u8> {
    vec![reset as u8]
}

/// Pin the parcel's target. An unpinnable target asks the sender to resend.
fn target(cx: &Cx) -> Result<Pinned<LcoEntry>, Error> {
    Pinned::new(cx.gas(), cx.target()).ok_or_else(|| {
        log::debug!("{} is not a local lco", cx.target());
        Error::Resend
    })
}

fn field<const N: usize>(args: &[u8], at: usize) -> Result<[u8; N], Error> {
    args.get(at..at + N)
        .and_then(|b| b.try_into().ok())
        .ok_or(Error::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_args_layout() {
        let args = get_args(8, true);
        assert_eq!(args, [8, 0, 0, 0, 1]);
        assert_eq!(u32::from_le_bytes(field(&args, 0).unwrap()), 8);
        assert_eq!(field::<1>(&args, 4).unwrap(), [1]);
    }

    #[test]
    fn short_args_fail() {
        assert_eq!(field::<8>(&[1, 2, 3], 0), Err(Error::Failed));
        assert_eq!(wait_args(false), [0]);
    }
}
