// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Several ranks in one process, joined by an in-process fabric.

use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use parcelx_rt::net::{Command, Fabric};
use parcelx_rt::{ActionId, Actions, Config, Error, GlobalAddr, Runtime};

struct Ranks {
    fabric: Arc<Fabric>,
    ranks: Vec<Runtime>,
    double: ActionId,
    whoami: ActionId,
}

fn ranks(n: u32) -> Ranks {
    let mut actions = Actions::new();
    let double = actions.register("double", |_, args| async move {
        Ok(args.iter().map(|b| b.wrapping_mul(2)).collect())
    });
    let whoami = actions.register("whoami", |cx, _| async move {
        Ok(cx.rank().to_le_bytes().to_vec())
    });

    let fabric = Fabric::new(n);
    let ranks = (0..n)
        .map(|rank| {
            let config = Config {
                rank,
                ..Config::with_workers(2)
            };
            Runtime::builder(config)
                .actions(actions.clone())
                .fabric(&fabric)
                .start()
                .unwrap()
        })
        .collect();
    Ranks {
        fabric,
        ranks,
        double,
        whoami,
    }
}

#[test]
fn call_sync_runs_on_the_target_rank() {
    let net = ranks(2);
    let (double, whoami) = (net.double, net.whoami);
    let (doubled, owner) = net.ranks[0]
        .block_on(move |cx| async move {
            let there = GlobalAddr::there(1);
            let doubled = cx.call_sync(there, double, vec![1, 2, 3], 3).await;
            let owner = cx.call_sync(there, whoami, Vec::new(), 4).await;
            (doubled, owner)
        })
        .unwrap();
    assert_eq!(doubled, Ok(vec![2, 4, 6]));
    assert_eq!(owner, Ok(1u32.to_le_bytes().to_vec()));
}

#[test]
fn remote_lcos_behave_like_local_ones() {
    let net = ranks(2);
    let f = net.ranks[1]
        .block_on(|cx| async move { cx.future_new(8) })
        .unwrap();
    let g = net.ranks[1]
        .block_on(|cx| async move { cx.gencount_new(2) })
        .unwrap();
    assert_eq!(f.rank(), 1);

    let (value, gen) = net.ranks[0]
        .block_on(move |cx| async move {
            cx.lco_set(f, &[7; 8]).unwrap();
            let value = cx.lco_get(f, 8).await;
            for _ in 0..3 {
                cx.lco_set(g, &[]).unwrap();
            }
            cx.gencount_wait(g, 3).await.unwrap();
            let gen = cx.lco_get(g, 8).await;
            cx.lco_delete(f).unwrap();
            (value, gen)
        })
        .unwrap();
    assert_eq!(value, Ok(vec![7; 8]));
    assert_eq!(gen, Ok(3u64.to_le_bytes().to_vec()));
}

#[test]
fn remote_errors_come_back_as_errors() {
    let net = ranks(2);
    let f = net.ranks[1]
        .block_on(|cx| async move { cx.future_new(8) })
        .unwrap();
    let got = net.ranks[0]
        .block_on(move |cx| async move {
            cx.lco_error(f, Error::Timeout).unwrap();
            cx.lco_get(f, 8).await
        })
        .unwrap();
    assert_eq!(got, Err(Error::Timeout));
}

#[test]
fn attach_to_a_remote_lco() {
    let net = ranks(2);
    let (f, done) = net.ranks[1]
        .block_on(|cx| async move { (cx.future_new(0), cx.future_new(4)) })
        .unwrap();
    let got = net.ranks[0]
        .block_on(move |cx| async move {
            let notify = cx
                .parcel(done, parcelx_rt::action::LCO_SET)
                .with_args(vec![9, 9, 9, 9]);
            cx.lco_attach(f, notify).unwrap();
            cx.lco_set(f, &[]).unwrap();
            cx.lco_get(done, 4).await
        })
        .unwrap();
    assert_eq!(got, Ok(vec![9, 9, 9, 9]));
}

#[test]
fn unbound_rank_asks_for_resend() {
    let mut net = ranks(2);
    let gone = net.ranks.pop().unwrap();
    drop(gone);
    assert!(net.fabric.handle(1).is_some_and(|h| !h.is_alive()));

    let double = net.double;
    let out = net.ranks[0]
        .block_on(move |cx| async move {
            cx.call_sync(GlobalAddr::there(1), double, vec![1], 1).await
        })
        .unwrap();
    assert_eq!(out, Err(Error::Resend));
}

#[test]
fn completion_resumes_a_suspended_thread() {
    let net = ranks(1);
    let handle = net.ranks[0].handle();
    let (tx, rx) = mpsc::channel();

    let helper = thread::spawn(move || {
        let parcel = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        thread::sleep(Duration::from_millis(5));
        handle.run_completion(Command::Resume(parcel, Err(Error::Timeout)))
    });

    let status = net.ranks[0]
        .block_on(move |cx| async move {
            cx.suspend(move |parcel| {
                let _ = tx.send(parcel);
            })
            .await
        })
        .unwrap();
    assert_eq!(helper.join().unwrap(), Ok(()));
    assert_eq!(status, Err(Error::Timeout));
}
