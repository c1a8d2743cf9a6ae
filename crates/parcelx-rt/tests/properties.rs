// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Randomized checks of the scheduler and LCO guarantees.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use parcelx_rt::{Actions, Config, Cx, Error, Future, Gencount, Lco, Misuse, Runtime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const WATCHDOG: Duration = Duration::from_secs(60);

fn runtime(workers: usize) -> Arc<Runtime> {
    Arc::new(Runtime::new(Config::with_workers(workers), Actions::new()).unwrap())
}

/// Run `f` on the runtime and fail the test if it does not finish in time.
fn watched<T, F, Fut>(rt: &Arc<Runtime>, f: F) -> T
where
    F: FnOnce(Cx) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let rt = rt.clone();
    thread::spawn(move || {
        let _ = tx.send(rt.block_on(f));
    });
    rx.recv_timeout(WATCHDOG)
        .expect("runtime stalled")
        .expect("root thread failed")
}

async fn yield_some(cx: &Cx, n: u32) {
    for _ in 0..n {
        cx.yield_now().await;
    }
}

#[test]
fn every_spawned_thread_runs_exactly_once() {
    const THREADS: usize = 5_000;
    let rt = runtime(4);
    let runs: Arc<Vec<AtomicU8>> = Arc::new((0..THREADS).map(|_| AtomicU8::new(0)).collect());

    let seen = runs.clone();
    watched(&rt, move |cx| async move {
        let done = cx.future_new(0);
        let left = Arc::new(AtomicUsize::new(THREADS));
        let mut rng = StdRng::seed_from_u64(7);
        for i in 0..THREADS {
            let (runs, left) = (seen.clone(), left.clone());
            let yields = rng.gen_range(0..3);
            cx.spawn(move |cx| async move {
                yield_some(&cx, yields).await;
                runs[i].fetch_add(1, Ordering::Relaxed);
                if left.fetch_sub(1, Ordering::AcqRel) == 1 {
                    cx.lco_set(done, &[]).unwrap();
                }
            });
        }
        cx.lco_wait(done).await.unwrap();
    });

    assert!(runs.iter().all(|r| r.load(Ordering::Relaxed) == 1));
}

#[test]
fn a_future_is_written_once() {
    const RACERS: u8 = 16;
    let rt = runtime(4);
    let f = Future::new(1);
    let winners = Arc::new(AtomicUsize::new(0));

    let (future, wins) = (f.clone(), winners.clone());
    let seen = watched(&rt, move |cx| async move {
        let done = Gencount::new(0);
        for id in 1..=RACERS {
            let (future, wins, done) = (future.clone(), wins.clone(), done.clone());
            cx.spawn(move |_| async move {
                match future.try_set(&[id]) {
                    Ok(()) => {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(misuse) => assert_eq!(misuse, Misuse::AlreadySet),
                }
                done.advance();
            });
        }
        done.wait_for(RACERS as u64).await.unwrap();
        future.get(1, false).await.unwrap()
    });

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert!((1..=RACERS).contains(&seen[0]));
    assert!(f.is_set());
}

#[test]
fn no_wakeup_is_lost_under_random_interleavings() {
    const ROUNDS: usize = 20;
    const FUTURES: usize = 50;
    const WAITERS: usize = 8;
    let rt = runtime(4);

    for round in 0..ROUNDS {
        let woken = Arc::new(AtomicUsize::new(0));
        let count = woken.clone();
        watched(&rt, move |cx| async move {
            let mut rng = StdRng::seed_from_u64(round as u64);
            let all = Gencount::new(0);
            for _ in 0..FUTURES {
                let f = cx.future_new(8);
                let value = rng.gen::<u64>();
                let setter_delay = rng.gen_range(0..4);
                for _ in 0..WAITERS {
                    let (count, all) = (count.clone(), all.clone());
                    let delay = rng.gen_range(0..4);
                    cx.spawn(move |cx| async move {
                        yield_some(&cx, delay).await;
                        let got = cx.lco_get(f, 8).await.unwrap();
                        assert_eq!(got, value.to_le_bytes());
                        count.fetch_add(1, Ordering::SeqCst);
                        all.advance();
                    });
                }
                cx.spawn(move |cx| async move {
                    yield_some(&cx, setter_delay).await;
                    cx.lco_set(f, &value.to_le_bytes()).unwrap();
                });
            }
            all.wait_for((FUTURES * WAITERS) as u64).await.unwrap();
        });
        assert_eq!(woken.load(Ordering::SeqCst), FUTURES * WAITERS);
    }
}

#[test]
fn reset_needs_an_empty_wait_queue() {
    let rt = runtime(2);
    let f = Future::new(4);

    let future = f.clone();
    watched(&rt, move |cx| async move {
        let (tx, rx) = mpsc::channel();
        let waiter = future.clone();
        cx.spawn(move |_| async move {
            let _ = tx.send(waiter.wait(false).await);
        });
        while future.waiting() == 0 {
            cx.yield_now().await;
        }
        assert_eq!(future.try_reset(), Err(Misuse::ResetWithWaiters));

        future.set(&[1, 2, 3, 4]);
        loop {
            if let Ok(status) = rx.try_recv() {
                assert_eq!(status, Ok(()));
                break;
            }
            cx.yield_now().await;
        }
        assert_eq!(future.waiting(), 0);
        future.try_reset().unwrap();
    });

    assert!(!f.is_set());
    f.set(&[5]);
    assert!(f.is_set());
}

#[test]
fn get_with_reset_hands_each_value_to_one_reader() {
    const VALUES: u64 = 200;
    let rt = runtime(3);
    let sum = watched(&rt, move |cx| async move {
        let slot = Future::new(8);
        let ready = Gencount::new(1);
        let total = Arc::new(AtomicU64::new(0));
        let reader_slot = slot.clone();
        let (acc, consumed) = (total.clone(), ready.clone());
        cx.spawn(move |_| async move {
            for _ in 0..VALUES {
                let bytes = reader_slot.clone().get(8, true).await.unwrap();
                acc.fetch_add(u64::from_le_bytes(bytes.try_into().unwrap()), Ordering::SeqCst);
                consumed.advance();
            }
        });
        for v in 1..=VALUES {
            slot.set(&v.to_le_bytes());
            ready.wait_for(v).await.unwrap();
        }
        total.load(Ordering::SeqCst)
    });
    assert_eq!(sum, VALUES * (VALUES + 1) / 2);
}

#[test]
fn generations_never_go_backwards() {
    const ADVANCES: u64 = 500;
    const WATCHERS: usize = 6;
    let rt = runtime(4);
    let g = Gencount::new(4);

    let counter = g.clone();
    watched(&rt, move |cx| async move {
        let finished = Gencount::new(0);
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..WATCHERS {
            let (g, finished) = (counter.clone(), finished.clone());
            let targets: Vec<u64> = (0..20).map(|_| rng.gen_range(1..=ADVANCES)).collect();
            cx.spawn(move |_| async move {
                let mut last = 0;
                for target in targets {
                    g.wait_for(target).await.unwrap();
                    let now = g.current();
                    assert!(now >= target, "woke at {now} waiting for {target}");
                    assert!(now >= last, "generation went from {last} to {now}");
                    last = now;
                }
                finished.advance();
            });
        }
        for _ in 0..ADVANCES {
            counter.advance();
            if rng.gen_bool(0.3) {
                cx.yield_now().await;
            }
        }
        finished.wait_for(WATCHERS as u64).await.unwrap();
    });

    assert_eq!(g.current(), ADVANCES);
    g.try_reset().unwrap();
    assert_eq!(g.current(), 0);
}

#[test]
fn errors_reach_every_waiter() {
    let rt = runtime(2);
    let statuses = watched(&rt, move |cx| async move {
        let f = cx.future_new(8);
        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            let tx = tx.clone();
            cx.spawn(move |cx| async move {
                let _ = tx.send(cx.lco_get(f, 8).await);
            });
        }
        drop(tx);
        yield_some(&cx, 10).await;
        cx.lco_error(f, Error::User(400)).unwrap();
        let mut out = Vec::new();
        while out.len() < 4 {
            match rx.try_recv() {
                Ok(status) => out.push(status),
                Err(_) => cx.yield_now().await,
            }
        }
        out
    });
    assert!(statuses.iter().all(|s| *s == Err(Error::User(400))));
}
