//! `Future` integration
//!
//! Two directions. `Promise::from_future` runs a Rust future as a node:
//! the future is polled immediately at construction (it starts running
//! right away, like any continuation chain) and re-polled whenever its
//! waker arms the coroutine's event. `promise.await` works inside such a
//! future through `IntoFuture`: the await hook lives outside the polled
//! future in its own allocation, so readiness may drop the future from
//! within the very fire that delivers the result.

use crate::exec::event::{Event, EventRef, Fire, OnReadyCell, QueueKind};
use crate::exec::event_loop::current_loop;
use crate::failure::Failure;
use crate::node::{NodeBox, PromiseNode};
use crate::outcome::Outcome;
use crate::promise::Promise;
use parking_lot::Mutex;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, Failure>> + Send>>;

struct CoroutineCore<T> {
    future: Option<BoxFuture<T>>,
    outcome: Option<Outcome<T>>,
    consumer: OnReadyCell,
    event: Option<EventRef>,
}

/// Arms the coroutine's event; safe to call from any thread, so the
/// future may hand its waker to foreign executors or helper threads.
struct CoroutineWaker {
    event: EventRef,
}

impl Wake for CoroutineWaker {
    fn wake(self: Arc<Self>) {
        self.event.arm(QueueKind::DepthFirst);
    }
}

fn poll_coroutine<T: Send + 'static>(core: &Mutex<CoroutineCore<T>>) {
    let (mut future, event) = {
        let mut guard = core.lock();
        match (guard.future.take(), guard.event.clone()) {
            (Some(future), Some(event)) => (future, event),
            _ => return,
        }
    };

    let waker = Waker::from(Arc::new(CoroutineWaker { event }));
    let mut cx = Context::from_waker(&waker);
    match future.as_mut().poll(&mut cx) {
        Poll::Pending => {
            core.lock().future = Some(future);
        }
        Poll::Ready(result) => {
            // The frame is dropped as soon as it returns.
            drop(future);
            let armed = {
                let mut guard = core.lock();
                guard.outcome = Some(result.into());
                guard.consumer.set_ready()
            };
            if let Some(event) = armed {
                event.arm(QueueKind::DepthFirst);
            }
        }
    }
}

impl<T: Send + 'static> Fire for Mutex<CoroutineCore<T>> {
    fn fire(&self) {
        poll_coroutine(self);
    }
}

/// Runs a boxed future as a promise node.
pub(crate) struct CoroutineNode<T> {
    core: Arc<Mutex<CoroutineCore<T>>>,
}

impl<T: Send + 'static> CoroutineNode<T> {
    pub(crate) fn new(future: BoxFuture<T>) -> Self {
        let core = Arc::new(Mutex::new(CoroutineCore {
            future: Some(future),
            outcome: None,
            consumer: OnReadyCell::new(),
            event: None,
        }));
        let event = Event::new(&current_loop(), Arc::downgrade(&core) as Weak<dyn Fire>);
        core.lock().event = Some(event);
        // Initial suspension is "never": run until the first pending await.
        poll_coroutine(&core);
        Self { core }
    }
}

impl<T: Send + 'static> PromiseNode<T> for CoroutineNode<T> {
    fn on_ready(&mut self, event: Option<EventRef>) {
        let armed = self.core.lock().consumer.register(event);
        if let Some(event) = armed {
            event.arm(QueueKind::BreadthFirst);
        }
    }

    fn get(&mut self) -> Outcome<T> {
        self.core
            .lock()
            .outcome
            .take()
            .expect("coroutine consumed before completion")
    }
}

/// Await hook: records readiness and pokes whatever waker last polled.
struct AwaitHook {
    ready: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl Fire for AwaitHook {
    fn fire(&self) {
        self.ready.store(true, Ordering::Release);
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

/// The future a `Promise` turns into when awaited.
///
/// Must be polled on the thread that owns the promise's event loop.
/// Dropping it cancels the underlying work.
pub struct PromiseFuture<T> {
    node: Option<NodeBox<T>>,
    hook: Option<Arc<AwaitHook>>,
}

impl<T: Send + 'static> Future for PromiseFuture<T> {
    type Output = Result<T, Failure>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.as_mut().get_mut();
        if this.hook.is_none() {
            let hook = Arc::new(AwaitHook {
                ready: AtomicBool::new(false),
                waker: Mutex::new(None),
            });
            let event = Event::new(&current_loop(), Arc::downgrade(&hook) as Weak<dyn Fire>);
            this.node
                .as_mut()
                .expect("promise future polled after completion")
                .on_ready(Some(event));
            this.hook = Some(hook);
        }

        let hook = this.hook.as_ref().expect("hook installed");
        // Publish the waker before checking readiness so a fire between
        // the two steps still wakes somebody.
        *hook.waker.lock() = Some(cx.waker().clone());
        if hook.ready.load(Ordering::Acquire) {
            let mut node = this
                .node
                .take()
                .expect("promise future polled after completion");
            Poll::Ready(node.get().into_result())
        } else {
            Poll::Pending
        }
    }
}

impl<T: Send + 'static> IntoFuture for Promise<T> {
    type Output = Result<T, Failure>;
    type IntoFuture = PromiseFuture<T>;

    fn into_future(self) -> PromiseFuture<T> {
        PromiseFuture {
            node: Some(self.into_node()),
            hook: None,
        }
    }
}
