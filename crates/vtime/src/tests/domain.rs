use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::domain::{DummySynchronizationDomain, SyncDomain, SyncPointHook, SynchronizationDomain};
use crate::error::SyncError;

#[test]
fn phase_side_effects_are_visible_to_every_participant() {
    const PARTICIPANTS: usize = 4;
    const PHASES: usize = 50;

    let domain = Arc::new(SynchronizationDomain::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let phases = Arc::new(Mutex::new(Vec::new()));
    let probe = Arc::clone(&phases);
    let hook: SyncPointHook = Arc::new(move |phase: i64| probe.lock().unwrap().push(phase));
    domain.set_hook_on_sync_point(hook);

    let synchronizers: Vec<_> = (0..PARTICIPANTS).map(|_| domain.provide_synchronizer()).collect();
    let workers: Vec<_> = synchronizers
        .into_iter()
        .map(|synchronizer| {
            let domain = Arc::clone(&domain);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for phase in 0..PHASES {
                    let task_counter = Arc::clone(&counter);
                    domain.execute_on_nearest_sync(Box::new(move || {
                        task_counter.fetch_add(1, Ordering::SeqCst);
                    }));
                    synchronizer.sync().unwrap();
                    assert_eq!(counter.load(Ordering::SeqCst), (phase + 1) * PARTICIPANTS);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(domain.synchronizations_count(), PHASES as i64);
    assert_eq!(*phases.lock().unwrap(), (0..PHASES as i64).collect::<Vec<_>>());
}

#[test]
fn cancelled_participant_is_released_until_restored() {
    let domain = SynchronizationDomain::new();
    let waiting = domain.provide_synchronizer();
    let other = domain.provide_synchronizer();

    let blocked = {
        let waiting = Arc::clone(&waiting);
        thread::spawn(move || waiting.sync())
    };
    thread::sleep(Duration::from_millis(20));
    waiting.cancel_sync();
    assert_eq!(blocked.join().unwrap(), Err(SyncError::Cancelled));
    assert_eq!(domain.synchronizations_count(), 0);

    // Still cancelled: returns without waiting for the other participant.
    assert_eq!(waiting.sync(), Err(SyncError::Cancelled));

    waiting.restore_sync();
    let restored = {
        let waiting = Arc::clone(&waiting);
        thread::spawn(move || waiting.sync())
    };
    assert_eq!(other.sync(), Ok(()));
    assert_eq!(restored.join().unwrap(), Ok(()));
    assert_eq!(domain.synchronizations_count(), 1);
}

#[test]
fn exiting_participant_completes_the_phase() {
    let domain = Arc::new(SynchronizationDomain::new());
    let leaving = domain.provide_synchronizer();
    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let synchronizer = domain.provide_synchronizer();
            thread::spawn(move || synchronizer.sync())
        })
        .collect();

    assert_eq!(domain.participants(), 3);
    thread::sleep(Duration::from_millis(20));
    leaving.exit();
    assert_eq!(domain.participants(), 2);
    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    assert_eq!(domain.synchronizations_count(), 1);
    assert_eq!(leaving.sync(), Err(SyncError::Exited));
}

#[test]
fn sync_point_thread_is_flagged_only_inside_callbacks() {
    let domain = Arc::new(SynchronizationDomain::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook: SyncPointHook = {
        let domain = Arc::clone(&domain);
        let seen = Arc::clone(&seen);
        Arc::new(move |_: i64| seen.lock().unwrap().push(domain.on_sync_point_thread()))
    };
    domain.set_hook_on_sync_point(hook);

    let synchronizer = domain.provide_synchronizer();
    synchronizer.sync().unwrap();
    assert!(!domain.on_sync_point_thread());

    domain.clear_hook_on_sync_point();
    synchronizer.sync().unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![true]);
    assert_eq!(domain.synchronizations_count(), 2);
}

#[test]
fn actions_queued_by_actions_run_in_the_same_phase() {
    let domain = Arc::new(SynchronizationDomain::new());
    let order = Arc::new(Mutex::new(Vec::new()));
    {
        let inner_domain = Arc::clone(&domain);
        let order = Arc::clone(&order);
        domain.execute_on_nearest_sync(Box::new(move || {
            order.lock().unwrap().push("first");
            let order = Arc::clone(&order);
            inner_domain.execute_on_nearest_sync(Box::new(move || {
                order.lock().unwrap().push("second");
            }));
        }));
    }
    let listened = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&listened);
    domain.add_sync_point_listener(Arc::new(move |_: i64| {
        probe.fetch_add(1, Ordering::SeqCst);
    }));

    domain.provide_synchronizer().sync().unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    assert_eq!(listened.load(Ordering::SeqCst), 1);
}

#[test]
fn dummy_domain_never_blocks() {
    let domain = DummySynchronizationDomain::new();
    let synchronizer = domain.provide_synchronizer();
    let ran = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&ran);

    domain.execute_on_nearest_sync(Box::new(move || {
        probe.fetch_add(1, Ordering::SeqCst);
    }));
    synchronizer.cancel_sync();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(synchronizer.sync(), Ok(()));
    assert!(domain.is_dummy());
    assert_eq!(domain.synchronizations_count(), 0);
}

#[test]
fn cancelled_sync_does_not_wait_for_a_completing_phase() {
    let domain = Arc::new(SynchronizationDomain::new());
    let in_action = Arc::new(AtomicBool::new(false));
    {
        let in_action = Arc::clone(&in_action);
        domain.execute_on_nearest_sync(Box::new(move || {
            in_action.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(300));
        }));
    }
    let completing = {
        let synchronizer = domain.provide_synchronizer();
        thread::spawn(move || synchronizer.sync())
    };
    while !in_action.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }

    let late = domain.provide_synchronizer();
    late.cancel_sync();
    let started = Instant::now();
    assert_eq!(late.sync(), Err(SyncError::Cancelled));
    assert!(started.elapsed() < Duration::from_millis(100));

    assert_eq!(completing.join().unwrap(), Ok(()));
}

#[test]
fn clearing_the_hook_waits_for_a_running_sync_point() {
    let domain = Arc::new(SynchronizationDomain::new());
    let entered = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let hook: SyncPointHook = {
        let (entered, finished) = (Arc::clone(&entered), Arc::clone(&finished));
        Arc::new(move |_: i64| {
            entered.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            finished.store(true, Ordering::SeqCst);
        })
    };
    domain.set_hook_on_sync_point(hook);

    let syncing = {
        let synchronizer = domain.provide_synchronizer();
        thread::spawn(move || synchronizer.sync())
    };
    while !entered.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }
    domain.clear_hook_on_sync_point();
    assert!(finished.load(Ordering::SeqCst));

    assert_eq!(syncing.join().unwrap(), Ok(()));
}

#[test]
fn callbacks_may_replace_the_hook() {
    let domain = Arc::new(SynchronizationDomain::new());
    {
        let inner = Arc::clone(&domain);
        domain.execute_on_nearest_sync(Box::new(move || inner.clear_hook_on_sync_point()));
    }
    let called = Arc::new(AtomicUsize::new(0));
    let probe = Arc::clone(&called);
    domain.set_hook_on_sync_point(Arc::new(move |_: i64| {
        probe.fetch_add(1, Ordering::SeqCst);
    }));

    domain.provide_synchronizer().sync().unwrap();
    assert_eq!(called.load(Ordering::SeqCst), 0);
}
