#![cfg(not(loom))]

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed};
use std::sync::Arc;
use std::thread;

use common::Ledger;
use parc::{AtomicOptionPairedArc, PairedArc};

#[test]
fn store_load_churn_balances() {
    const STORES: i64 = 20_000;

    let ledger = Ledger::new();
    let cell = Arc::new(AtomicOptionPairedArc::new(Some(
        PairedArc::new(ledger.entry(0)),
    )));

    let writer = {
        let cell = Arc::clone(&cell);
        let entries: Vec<_> = (1..=STORES).map(|i| ledger.entry(i)).collect();
        thread::spawn(move || {
            for e in entries {
                cell.store(Some(PairedArc::new(e)));
            }
        })
    };
    let reader = {
        let cell = Arc::clone(&cell);
        thread::spawn(move || {
            let mut last = 0;
            loop {
                let h = cell.load().unwrap();
                let v = h.get();
                assert!(v >= last, "values must move forward");
                last = v;
                if v == STORES {
                    break;
                }
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();

    // Exactly the resident survives.
    assert_eq!(ledger.live(), 1);
    drop(cell);
    assert_eq!(ledger.live(), 0);
}

#[test]
fn many_readers_one_writer() {
    const READERS: usize = 16;
    const STORES: i64 = 2_000;

    let ledger = Ledger::new();
    let cell = Arc::new(AtomicOptionPairedArc::new(Some(
        PairedArc::new(ledger.entry(0)),
    )));
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let cell = Arc::clone(&cell);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut reads = 0usize;
                while !done.load(Relaxed) {
                    let h = cell.load().unwrap();
                    // The canary inside `get` catches any dereference of a
                    // destroyed object.
                    let _ = h.get();
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    {
        let entries: Vec<_> = (1..=STORES).map(|i| ledger.entry(i)).collect();
        for e in entries {
            cell.store(Some(PairedArc::new(e)));
        }
        done.store(true, Relaxed);
    }

    for r in readers {
        assert!(r.join().unwrap() > 0);
    }
    assert_eq!(ledger.live(), 1);
    cell.store(None);
    assert_eq!(ledger.live(), 0);
}

#[test]
fn weak_race_settles_one_way() {
    const ROUNDS: usize = 2_000;

    let ledger = Ledger::new();
    for i in 0..ROUNDS {
        let strong = PairedArc::new(ledger.entry(i as i64));
        let weak = PairedArc::downgrade(&strong);

        let dropper = thread::spawn(move || drop(strong));
        let promoted = weak.upgrade();

        if let Some(h) = &promoted {
            // We won: the object must be intact for as long as we hold it.
            assert_eq!(h.get(), i as i64);
        }
        dropper.join().unwrap();
        drop(promoted);
        assert_eq!(ledger.live(), 0);
        assert!(weak.upgrade().is_none());
    }
}

#[test]
fn cas_contention_crowns_one_winner_per_round() {
    const THREADS: usize = 8;
    const SUCCESSES: usize = 4_000;

    let ledger = Ledger::new();
    let cell = Arc::new(AtomicOptionPairedArc::new(Some(
        PairedArc::new(ledger.entry(-1)),
    )));
    let total = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..THREADS)
        .map(|tid| {
            let cell = Arc::clone(&cell);
            let total = Arc::clone(&total);
            let entries: Vec<_> = (0..SUCCESSES)
                .map(|i| ledger.entry((tid * SUCCESSES + i) as i64))
                .collect();
            thread::spawn(move || {
                for e in entries {
                    let desired = Some(PairedArc::new(e));
                    let mut expected = cell.load();
                    while !cell.compare_exchange_ref(&mut expected, &desired) {}
                    total.fetch_add(1, Relaxed);
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(total.load(Relaxed), THREADS * SUCCESSES);
    // Exactly one desired value is resident at quiesce.
    assert_eq!(ledger.live(), 1);
    drop(cell);
    assert_eq!(ledger.live(), 0);
}

#[test]
fn moved_compare_exchange_reports_the_live_value() {
    let ledger = Ledger::new();
    let a = PairedArc::new(ledger.entry(1));
    let cell = AtomicOptionPairedArc::new(Some(a.clone()));

    // Successful exchange consumes desired into the cell.
    let mut expected = Some(a.clone());
    assert!(cell.compare_exchange(&mut expected, Some(PairedArc::new(ledger.entry(2)))));

    // Failure hands back the live value and drops desired.
    let mut stale = Some(a.clone());
    assert!(!cell.compare_exchange(&mut stale, Some(PairedArc::new(ledger.entry(3)))));
    assert_eq!(stale.as_ref().unwrap().get(), 2);

    drop(a);
    drop(expected);
    drop(stale);
    drop(cell);
    assert_eq!(ledger.live(), 0);
}

#[test]
fn wait_returns_after_a_store() {
    let ledger = Ledger::new();
    let first = PairedArc::new(ledger.entry(1));
    let cell = Arc::new(AtomicOptionPairedArc::new(Some(first.clone())));

    let waiter = {
        let cell = Arc::clone(&cell);
        let old = Some(first.clone());
        thread::spawn(move || {
            cell.wait(&old);
            cell.load().unwrap().get()
        })
    };

    // Give the waiter a chance to park; correctness does not depend on it.
    thread::sleep(std::time::Duration::from_millis(20));
    cell.store(Some(PairedArc::new(ledger.entry(2))));
    cell.notify_all();

    assert_eq!(waiter.join().unwrap(), 2);
    drop(first);
    drop(cell);
    assert_eq!(ledger.live(), 0);
}

#[test]
fn notify_one_wakes_a_waiter() {
    let ledger = Ledger::new();
    let cell = Arc::new(AtomicOptionPairedArc::new(None));

    let waiter = {
        let cell = Arc::clone(&cell);
        thread::spawn(move || {
            cell.wait(&None);
            cell.load().is_some()
        })
    };

    thread::sleep(std::time::Duration::from_millis(20));
    cell.store(Some(PairedArc::new(ledger.entry(1))));
    cell.notify_one();

    assert!(waiter.join().unwrap());
    drop(cell);
    assert_eq!(ledger.live(), 0);
}
