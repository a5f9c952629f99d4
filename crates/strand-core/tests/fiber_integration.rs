//! Integration tests for fibers and `Future` integration

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strand_core::{
    eval_later, join_promises, promise_and_fulfiller, start_fiber, yield_now, EventLoop, Failure,
    Promise,
};

#[test]
fn test_fiber_waits_on_promises() {
    let el = EventLoop::new();
    let ws = el.wait_scope();

    let result = start_fiber(|scope| {
        let a = scope.wait(eval_later(|| 10))?;
        let b = scope.wait(Promise::resolved(5))?;
        Ok(a + b)
    })
    .wait(&ws)
    .unwrap();

    assert_eq!(result, 15);
}

#[test]
fn test_fiber_sees_failures_at_wait() {
    let el = EventLoop::new();
    let ws = el.wait_scope();

    let result = start_fiber(|scope| {
        match scope.wait(Promise::<i32>::rejected(Failure::failed("inner"))) {
            Ok(value) => Ok(value),
            Err(failure) => Ok(if failure.message == "inner" { -1 } else { -2 }),
        }
    })
    .wait(&ws)
    .unwrap();

    assert_eq!(result, -1);
}

#[test]
fn test_fiber_failure_propagates() {
    let el = EventLoop::new();
    let ws = el.wait_scope();

    let err = start_fiber(|scope| {
        let value = scope.wait(eval_later(|| 1))?;
        let _ = value;
        Err::<i32, _>(Failure::failed("fiber gave up"))
    })
    .wait(&ws)
    .unwrap_err();

    assert_eq!(err.message, "fiber gave up");
}

#[test]
fn test_fiber_panic_becomes_failure() {
    let el = EventLoop::new();
    let ws = el.wait_scope();

    let err = start_fiber(|scope| -> Result<i32, Failure> {
        scope.wait(yield_now())?;
        panic!("kaboom");
    })
    .wait(&ws)
    .unwrap_err();

    assert!(err.message.contains("kaboom"));
}

#[test]
fn test_fiber_cancellation_unwinds_stack() {
    let el = EventLoop::new();
    let ws = el.wait_scope();

    struct UnwindProbe(Arc<AtomicBool>);
    impl Drop for UnwindProbe {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let unwound = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let probe = UnwindProbe(unwound.clone());
    let observed = finished.clone();
    let fiber = start_fiber(move |scope| {
        let _probe = probe;
        scope.wait(Promise::<i32>::never_done())?;
        observed.store(true, Ordering::SeqCst);
        Ok(0)
    });

    // Let the fiber start and suspend on the never-settling promise.
    yield_now().wait(&ws).unwrap();
    assert!(!unwound.load(Ordering::SeqCst));

    // Destruction mid-suspension unwinds the fiber stack.
    drop(fiber);
    assert!(unwound.load(Ordering::SeqCst));
    assert!(!finished.load(Ordering::SeqCst));
}

#[test]
fn test_fiber_can_build_promises_on_its_stack() {
    let el = EventLoop::new();
    let ws = el.wait_scope();

    let result = start_fiber(|scope| {
        let doubled = eval_later(|| 4).map(|x| x * 2);
        let sum = scope.wait(join_promises(vec![doubled, Promise::resolved(1)]))?;
        Ok(sum.into_iter().sum::<i32>())
    })
    .wait(&ws)
    .unwrap();

    assert_eq!(result, 9);
}

#[test]
fn test_nested_fibers() {
    let el = EventLoop::new();
    let ws = el.wait_scope();

    let result = start_fiber(|outer| {
        let inner = start_fiber(|inner_scope| inner_scope.wait(eval_later(|| 21)));
        let value = outer.wait(inner)?;
        Ok(value * 2)
    })
    .wait(&ws)
    .unwrap();

    assert_eq!(result, 42);
}

// ---------------------------------------------------------------------
// Future integration

#[test]
fn test_future_running_as_promise() {
    let el = EventLoop::new();
    let ws = el.wait_scope();

    let result = Promise::from_future(async {
        let x = Promise::resolved(2).await?;
        let y = eval_later(|| 3).await?;
        Ok(x + y)
    })
    .wait(&ws)
    .unwrap();

    assert_eq!(result, 5);
}

#[test]
fn test_future_without_awaits_completes_immediately() {
    let el = EventLoop::new();
    let ws = el.wait_scope();

    let result = Promise::from_future(async { Ok(1) }).wait(&ws).unwrap();
    assert_eq!(result, 1);
}

#[test]
fn test_future_observes_failures() {
    let el = EventLoop::new();
    let ws = el.wait_scope();

    let result = Promise::from_future(async {
        match Promise::<i32>::rejected(Failure::failed("await saw this")).await {
            Ok(value) => Ok(value),
            Err(failure) => Err(Failure::failed(format!("relayed: {}", failure.message))),
        }
    })
    .wait(&ws)
    .unwrap_err();

    assert_eq!(result.message, "relayed: await saw this");
}

#[test]
fn test_future_awaits_fulfiller_backed_promise() {
    let el = EventLoop::new();
    let ws = el.wait_scope();

    let (promise, fulfiller) = promise_and_fulfiller::<i32>();
    let running = Promise::from_future(async move { promise.await.map(|v| v + 1) });

    fulfiller.fulfill(41);
    assert_eq!(running.wait(&ws).unwrap(), 42);
}

#[test]
fn test_dropping_coroutine_cancels_awaited_work() {
    let el = EventLoop::new();
    let ws = el.wait_scope();
    let ran = Arc::new(AtomicBool::new(false));

    let observed = ran.clone();
    let running = Promise::from_future(async move {
        let value = eval_later(move || {
            observed.store(true, Ordering::SeqCst);
            1
        })
        .await?;
        Ok(value)
    });
    drop(running);

    yield_now().wait(&ws).unwrap();
    assert!(!ran.load(Ordering::SeqCst));
}
