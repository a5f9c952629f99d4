//! The public promise handle and its combinators
//!
//! A `Promise<T>` owns the root of a node graph. Dropping it cancels the
//! computation; `wait` drives the current thread's loop until the result
//! is available. Combinators consume the promise and return a new one
//! wrapping the old graph.

use crate::exec::event_loop::{current_loop, poll_impl, wait_impl, WaitScope};
use crate::failure::Failure;
use crate::node::{
    split_pair, ArrayJoinNode, AttachmentNode, BrokenNode, ChainNode, CoroutineNode, EagerNode,
    ExclusiveJoinNode, ForkedPromise, ImmediateNode, NeverNode, NodeBox, TransformNode, YieldNode,
};
use crate::outcome::Outcome;
use std::future::Future;

/// A deferred computation yielding `T` or a `Failure`, exactly once.
pub struct Promise<T> {
    node: NodeBox<T>,
}

/// Shared transform convention. A failure with no value short-circuits
/// past the continuation. A partial success — value plus recoverable
/// failure — still runs the continuation on the delivered value, and the
/// prior failure is carried into the result so it resurfaces downstream.
fn on_value<T, U>(outcome: Outcome<T>, f: impl FnOnce(T) -> Outcome<U>) -> Outcome<U> {
    let (value, failure) = outcome.into_parts();
    match value {
        Some(value) => {
            let mut result = f(value);
            if let Some(failure) = failure {
                result.add_failure(failure);
            }
            result
        }
        None => Outcome::from_failure(
            failure.expect("promise settled with neither value nor failure"),
        ),
    }
}

impl<T: Send + 'static> Promise<T> {
    pub(crate) fn from_node(node: NodeBox<T>) -> Self {
        Self { node }
    }

    pub(crate) fn into_node(self) -> NodeBox<T> {
        self.node
    }

    /// An already-resolved promise.
    pub fn resolved(value: T) -> Self {
        Self::from_node(Box::new(ImmediateNode::new(value)))
    }

    /// An already-failed promise.
    pub fn rejected(failure: Failure) -> Self {
        Self::from_node(Box::new(BrokenNode::new(failure)))
    }

    /// A promise that never settles.
    pub fn never_done() -> Self {
        Self::from_node(Box::new(NeverNode))
    }

    /// Run a future to completion on this thread's loop, starting now.
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, Failure>> + Send + 'static,
    {
        Self::from_node(Box::new(CoroutineNode::new(Box::pin(future))))
    }

    /// Apply `f` to the value; failures pass through untouched.
    pub fn map<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        Promise::from_node(Box::new(TransformNode::new(self.node, move |outcome| {
            on_value(outcome, |value| Outcome::from_value(f(value)))
        })))
    }

    /// Apply a fallible `f` to the value; an `Err` becomes the promise's
    /// failure.
    pub fn try_map<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Result<U, Failure> + Send + 'static,
    {
        Promise::from_node(Box::new(TransformNode::new(self.node, move |outcome| {
            on_value(outcome, |value| f(value).into())
        })))
    }

    /// Apply `f` to the value, letting the continuation report a partial
    /// success: an outcome carrying both a value and a recoverable
    /// failure is delivered as-is — downstream continuations still run
    /// on the value, and `wait_outcome` surfaces the failure alongside
    /// it.
    pub fn map_outcome<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Outcome<U> + Send + 'static,
    {
        Promise::from_node(Box::new(TransformNode::new(self.node, move |outcome| {
            on_value(outcome, f)
        })))
    }

    /// Chain a promise-returning continuation; the observer sees a flat
    /// `Promise<U>`, never a promise-of-promise.
    pub fn then<U, F>(self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        let transform = TransformNode::new(self.node, move |outcome| {
            on_value(outcome, |value| Outcome::from_value(f(value)))
        });
        Promise::from_node(Box::new(ChainNode::new(Box::new(transform))))
    }

    /// Handle a failure: recover with a value or re-raise. Values pass
    /// through untouched.
    pub fn catch_<F>(self, handler: F) -> Promise<T>
    where
        F: FnOnce(Failure) -> Result<T, Failure> + Send + 'static,
    {
        Promise::from_node(Box::new(TransformNode::new(self.node, move |outcome| {
            let (value, failure) = outcome.into_parts();
            match failure {
                Some(failure) => handler(failure).into(),
                None => Outcome::from_slots(value, None),
            }
        })))
    }

    /// Handle a failure with a promise-returning recovery.
    pub fn catch_then<F>(self, handler: F) -> Promise<T>
    where
        F: FnOnce(Failure) -> Promise<T> + Send + 'static,
    {
        let transform = TransformNode::new(self.node, move |outcome| {
            let (value, failure) = outcome.into_parts();
            match failure {
                Some(failure) => Outcome::from_value(handler(failure)),
                None => Outcome::from_value(Promise::resolved(
                    value.expect("promise settled with neither value nor failure"),
                )),
            }
        });
        Promise::from_node(Box::new(ChainNode::new(Box::new(transform))))
    }

    /// Keep `attachment` alive until this promise settles or is
    /// canceled.
    pub fn attach<A: Send + 'static>(self, attachment: A) -> Promise<T> {
        Promise::from_node(Box::new(AttachmentNode::new(self.node, attachment)))
    }

    /// Discard the value.
    pub fn ignore_result(self) -> Promise<()> {
        self.map(|_| ())
    }

    /// Begin evaluating now, even with no consumer registered yet.
    pub fn eagerly_evaluate(self) -> Promise<T> {
        Promise::from_node(Box::new(EagerNode::new(self.node)))
    }

    /// Whichever of the two settles first wins; the loser is canceled.
    pub fn exclusive_join(self, other: Promise<T>) -> Promise<T> {
        Promise::from_node(Box::new(ExclusiveJoinNode::new(self.node, other.node)))
    }

    /// Share this promise's result with any number of consumers.
    pub fn fork(self) -> ForkedPromise<T>
    where
        T: Clone,
    {
        ForkedPromise::new(self.node)
    }

    /// Hand the promise to the loop: it evaluates in the background and
    /// is canceled when the loop shuts down. Failures are reported to
    /// `on_failure`.
    pub fn detach<F>(self, on_failure: F)
    where
        F: FnOnce(Failure) + Send + 'static,
    {
        let guarded = self.ignore_result().catch_(move |failure| {
            on_failure(failure);
            Ok(())
        });
        let core = current_loop();
        core.add_daemon(Box::new(EagerNode::new(guarded.node)));
    }

    /// Block until settled; the loop keeps running underneath.
    pub fn wait(self, scope: &WaitScope<'_>) -> Result<T, Failure> {
        wait_impl(self.node, scope.core()).into_result()
    }

    /// Like `wait`, but exposes the raw outcome, including the
    /// partial-success case where a value arrives together with a
    /// recoverable failure.
    pub fn wait_outcome(self, scope: &WaitScope<'_>) -> Outcome<T> {
        wait_impl(self.node, scope.core())
    }

    /// Run the loop until idle; true if this promise became ready. Does
    /// not consume the promise.
    pub fn poll(&mut self, scope: &WaitScope<'_>) -> bool {
        poll_impl(&mut self.node, scope.core())
    }
}

impl<A: Send + 'static, B: Send + 'static> Promise<(A, B)> {
    /// Destructure a pair promise into a promise per component.
    pub fn split(self) -> (Promise<A>, Promise<B>) {
        split_pair(self.node)
    }
}

/// Wait for every promise; yields the values in order, or the first
/// failure observed across the inputs.
pub fn join_promises<T: Send + 'static>(promises: Vec<Promise<T>>) -> Promise<Vec<T>> {
    let nodes = promises.into_iter().map(Promise::into_node).collect();
    Promise::from_node(Box::new(ArrayJoinNode::new(nodes)))
}

/// Settle after everything currently scheduled has run (breadth-first
/// re-queue).
pub fn yield_now() -> Promise<()> {
    Promise::from_node(Box::new(YieldNode::breadth()))
}

/// Settle only once both regular queues are exhausted.
pub fn yield_last() -> Promise<()> {
    Promise::from_node(Box::new(YieldNode::last()))
}

/// Run `f` on a later loop turn, after work already queued.
pub fn eval_later<T, F>(f: F) -> Promise<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    yield_now().map(move |()| f())
}

/// Run `f` only once both regular queues are exhausted.
pub fn eval_last<T, F>(f: F) -> Promise<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    yield_last().map(move |()| f())
}

/// Invoke `f` and, if its promise fails with `Disconnected`, invoke it
/// one more time.
pub fn retry_on_disconnect<T, F>(f: F) -> Promise<T>
where
    T: Send + 'static,
    F: Fn() -> Promise<T> + Send + 'static,
{
    f().catch_then(move |failure| {
        if failure.is_disconnected() {
            f()
        } else {
            Promise::rejected(failure)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::event_loop::EventLoop;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_immediate_chain() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let result = Promise::resolved(1)
            .map(|x| x + 2)
            .map(|x| x * 3)
            .wait(&ws)
            .unwrap();
        assert_eq!(result, 9);
    }

    #[test]
    fn test_error_propagation_and_recovery() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let result = Promise::<i32>::rejected(Failure::failed("boom"))
            .map(|x| x + 1)
            .catch_(|_| Ok(-1))
            .wait(&ws)
            .unwrap();
        assert_eq!(result, -1);
    }

    #[test]
    fn test_rejection_surfaces_from_wait() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let err = Promise::<i32>::rejected(Failure::failed("boom"))
            .map(|x| x + 1)
            .wait(&ws)
            .unwrap_err();
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn test_try_map_failure() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let err = Promise::resolved(1)
            .try_map(|_| Err::<i32, _>(Failure::failed("mid-transform")))
            .wait(&ws)
            .unwrap_err();
        assert_eq!(err.message, "mid-transform");
    }

    #[test]
    fn test_then_flattens() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let result = Promise::resolved(2)
            .then(|x| Promise::resolved(x * 10).map(|y| y + 1))
            .wait(&ws)
            .unwrap();
        assert_eq!(result, 21);
    }

    #[test]
    fn test_catch_passes_values_through() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let result = Promise::resolved(5)
            .catch_(|_| Ok(0))
            .wait(&ws)
            .unwrap();
        assert_eq!(result, 5);
    }

    #[test]
    fn test_catch_can_reraise() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let err = Promise::<i32>::rejected(Failure::failed("original"))
            .catch_(|f| Err(Failure::failed(format!("wrapped: {}", f.message))))
            .wait(&ws)
            .unwrap_err();
        assert_eq!(err.message, "wrapped: original");
    }

    #[test]
    fn test_map_outcome_partial_success_reaches_wait_outcome() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let outcome = Promise::resolved(2)
            .map_outcome(|x| Outcome::from_parts(x * 10, Failure::failed("partial")))
            .wait_outcome(&ws);
        let (value, failure) = outcome.into_parts();
        assert_eq!(value, Some(20));
        assert_eq!(failure.unwrap().message, "partial");
    }

    #[test]
    fn test_partial_success_still_runs_downstream_continuations() {
        // The delivered value keeps flowing; the recoverable failure
        // rides along instead of short-circuiting the transform chain.
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let outcome = Promise::resolved(2)
            .map_outcome(|x| Outcome::from_parts(x, Failure::failed("partial")))
            .map(|x| x + 1)
            .wait_outcome(&ws);
        let (value, failure) = outcome.into_parts();
        assert_eq!(value, Some(3));
        assert_eq!(failure.unwrap().message, "partial");
    }

    #[test]
    fn test_partial_success_flows_through_chain() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let outcome = Promise::resolved(1)
            .map_outcome(|x| Outcome::from_parts(x + 1, Failure::failed("recoverable")))
            .then(|x| Promise::resolved(x * 2))
            .wait_outcome(&ws);
        let (value, failure) = outcome.into_parts();
        assert_eq!(value, Some(4));
        assert_eq!(failure.unwrap().message, "recoverable");
    }

    #[test]
    fn test_plain_wait_collapses_partial_success_to_failure() {
        // Callers that don't opt into the recoverable channel see the
        // failure, matching the default rethrow behavior.
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let err = Promise::resolved(7)
            .map_outcome(|x| Outcome::from_parts(x, Failure::failed("partial")))
            .wait(&ws)
            .unwrap_err();
        assert_eq!(err.message, "partial");
    }

    #[test]
    fn test_catch_recovers_partial_success_failure() {
        // An error continuation consumes the recoverable failure; the
        // result it produces replaces the partial outcome entirely.
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let outcome = Promise::resolved(7)
            .map_outcome(|x| Outcome::from_parts(x, Failure::failed("partial")))
            .catch_(|_| Ok(-1))
            .wait_outcome(&ws);
        let (value, failure) = outcome.into_parts();
        assert_eq!(value, Some(-1));
        assert!(failure.is_none());
    }

    #[test]
    fn test_recursive_then_stays_flat() {
        // A loop expressed as recursive promise-of-promise must not
        // accumulate forwarder nodes; this would blow the stack (or
        // memory) at depth 100_000 if each round left one behind.
        fn countdown(n: u64) -> Promise<u64> {
            if n == 0 {
                Promise::resolved(0)
            } else {
                yield_now().then(move |()| countdown(n - 1))
            }
        }
        let el = EventLoop::new();
        let ws = el.wait_scope();
        assert_eq!(countdown(100_000).wait(&ws).unwrap(), 0);
    }

    #[test]
    fn test_eval_later_defers() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let ran = Arc::new(AtomicUsize::new(0));
        let observed = ran.clone();
        let p = eval_later(move || observed.fetch_add(1, Ordering::SeqCst));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        p.wait(&ws).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_eval_last_runs_after_breadth_work() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let o = order.clone();
        let late = eval_last(move || o.lock().push("last"));
        let o = order.clone();
        let early = eval_later(move || o.lock().push("later"));

        join_promises(vec![late, early]).wait(&ws).unwrap();
        assert_eq!(*order.lock(), vec!["later", "last"]);
    }

    #[test]
    fn test_cancellation_is_prompt() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let ran = Arc::new(AtomicUsize::new(0));

        // Eager evaluation arms the underlying event; cancellation must
        // still silence it before it fires.
        let observed = ran.clone();
        let p = yield_now()
            .map(move |()| {
                observed.fetch_add(1, Ordering::SeqCst);
            })
            .eagerly_evaluate();
        drop(p);

        // Flush everything; the canceled continuation must not run.
        yield_now().wait(&ws).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_attachment_outlives_dependency() {
        struct DropOrder(Arc<parking_lot::Mutex<Vec<&'static str>>>, &'static str);
        impl Drop for DropOrder {
            fn drop(&mut self) {
                self.0.lock().push(self.1);
            }
        }

        let el = EventLoop::new();
        let _ws = el.wait_scope();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let dep_guard = DropOrder(order.clone(), "dependency");
        let attachment = DropOrder(order.clone(), "attachment");
        let p = yield_now()
            .map(move |()| drop(dep_guard))
            .attach(attachment);
        drop(p);

        assert_eq!(*order.lock(), vec!["dependency", "attachment"]);
    }

    #[test]
    fn test_poll_reports_pending_then_ready() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let (mut promise, fulfiller) = crate::node::promise_and_fulfiller::<i32>();

        assert!(!promise.poll(&ws));
        fulfiller.fulfill(7);
        assert!(promise.poll(&ws));
        assert_eq!(promise.wait(&ws).unwrap(), 7);
    }

    #[test]
    fn test_never_done_never_polls_ready() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let mut p = Promise::<i32>::never_done();
        assert!(!p.poll(&ws));
    }

    #[test]
    fn test_detach_runs_in_background() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let ran = Arc::new(AtomicUsize::new(0));

        let observed = ran.clone();
        eval_later(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        })
        .detach(|failure| panic!("unexpected failure: {failure}"));

        yield_now().wait(&ws).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_on_disconnect_retries_once() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = attempts.clone();
        let result = retry_on_disconnect(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Promise::rejected(Failure::disconnected("flaky"))
            } else {
                Promise::resolved(99)
            }
        })
        .wait(&ws)
        .unwrap();

        assert_eq!(result, 99);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_on_disconnect_propagates_other_failures() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = attempts.clone();
        let err = retry_on_disconnect(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Promise::<i32>::rejected(Failure::failed("fatal"))
        })
        .wait(&ws)
        .unwrap_err();

        assert_eq!(err.message, "fatal");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_split_pair() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let (a, b) = Promise::resolved((1, "two")).split();
        assert_eq!(a.wait(&ws).unwrap(), 1);
        assert_eq!(b.wait(&ws).unwrap(), "two");
    }

    #[test]
    fn test_split_pair_failure_reaches_both() {
        let el = EventLoop::new();
        let ws = el.wait_scope();
        let (a, b) = Promise::<(i32, i32)>::rejected(Failure::failed("boom")).split();
        assert_eq!(a.wait(&ws).unwrap_err().message, "boom");
        assert_eq!(b.wait(&ws).unwrap_err().message, "boom");
    }
}
