//! Integration tests for the cross-thread executor

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use strand_core::{eval_later, promise_and_fulfiller, EventLoop, Executor, FailureKind};

/// Run an event loop on a helper thread and hand back its executor plus
/// the fulfiller that stops it. The loop keeps serving requests until
/// the shutdown promise settles; `stop` fulfills it from the loop's own
/// thread through the executor.
fn setup() -> (Executor, strand_core::Fulfiller<()>, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::Builder::new()
        .name("strand-test-loop".to_string())
        .spawn(move || {
            let el = EventLoop::new();
            let ws = el.wait_scope();
            let (shutdown, shutdown_fulfiller) = promise_and_fulfiller::<()>();
            tx.send((el.executor(), shutdown_fulfiller)).unwrap();
            shutdown.wait(&ws).unwrap();
        })
        .expect("failed to spawn loop thread");

    let (executor, shutdown_fulfiller) = rx.recv().unwrap();
    (executor, shutdown_fulfiller, handle)
}

fn stop(executor: &Executor, shutdown: strand_core::Fulfiller<()>) {
    executor
        .execute_sync(move || shutdown.fulfill(()))
        .expect("target loop vanished before shutdown");
}

#[test]
fn test_execute_sync_returns_value() {
    let (executor, shutdown, handle) = setup();

    let result = executor.execute_sync(|| 42).unwrap();
    assert_eq!(result, 42);

    stop(&executor, shutdown);
    handle.join().unwrap();
}

#[test]
fn test_execute_sync_promise_waits_for_target_side_promise() {
    let (executor, shutdown, handle) = setup();

    let result = executor
        .execute_sync_promise(|| eval_later(|| 6).map(|x| x * 7))
        .unwrap();
    assert_eq!(result, 42);

    stop(&executor, shutdown);
    handle.join().unwrap();
}

#[test]
fn test_execute_async_settles_on_requesting_loop() {
    let (executor, shutdown, handle) = setup();

    // The requesting side needs its own loop for the reply.
    let el = EventLoop::new();
    let ws = el.wait_scope();

    let result = executor.execute_async(|| 7).wait(&ws).unwrap();
    assert_eq!(result, 7);

    stop(&executor, shutdown);
    handle.join().unwrap();
}

#[test]
fn test_execute_sync_on_own_loop_runs_in_place() {
    let el = EventLoop::new();
    let _ws = el.wait_scope();
    let executor = el.executor();
    assert_eq!(executor.execute_sync(|| 5).unwrap(), 5);
}

#[test]
fn test_disconnected_before_submission() {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let el = EventLoop::new();
        tx.send(el.executor()).unwrap();
        // Loop drops immediately: the executor outlives it.
    });
    let executor = rx.recv().unwrap();
    handle.join().unwrap();

    assert!(!executor.is_live());
    let err = executor.execute_sync(|| 1).unwrap_err();
    assert_eq!(err.kind, FailureKind::Disconnected);
}

#[test]
fn test_disconnected_mid_call() {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let el = EventLoop::new();
        tx.send(el.executor()).unwrap();
        // Give the requester time to queue its call, then exit without
        // ever turning the loop.
        thread::sleep(Duration::from_millis(100));
    });
    let executor = rx.recv().unwrap();

    let err = executor.execute_sync(|| 1).unwrap_err();
    assert_eq!(err.kind, FailureKind::Disconnected);
    handle.join().unwrap();
}

#[test]
fn test_dropping_queued_async_promise_cancels_it() {
    let (tx, rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        tx.send(el.executor()).unwrap();
        // Hold the loop idle until the requester has canceled.
        release_rx.recv().unwrap();
        let (noop, f) = promise_and_fulfiller::<()>();
        f.fulfill(());
        noop.wait(&ws).unwrap();
    });
    let executor = rx.recv().unwrap();

    let el = EventLoop::new();
    let _ws = el.wait_scope();
    let ran = Arc::new(AtomicBool::new(false));

    let observed = ran.clone();
    let promise = executor.execute_async(move || observed.store(true, Ordering::SeqCst));
    // Cancel while still queued: unlinks without blocking.
    drop(promise);

    release_tx.send(()).unwrap();
    handle.join().unwrap();
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_execute_sync_from_many_threads() {
    let (executor, shutdown, handle) = setup();

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let executor = executor.clone();
            thread::spawn(move || executor.execute_sync(move || i * 10).unwrap())
        })
        .collect();
    let mut results: Vec<i32> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    results.sort_unstable();
    assert_eq!(results, vec![0, 10, 20, 30]);

    stop(&executor, shutdown);
    handle.join().unwrap();
}
