//! Stackful suspension
//!
//! A fiber runs its body on a separate call stack and suspends whenever
//! it waits on a promise. The separate stack is a dedicated thread, but
//! execution alternates strictly: exactly one of the loop side and the
//! fiber side runs at any moment, with a condvar pair enforcing the
//! handoff. That preserves the loop's cooperative model — fiber code
//! never runs concurrently with loop code.
//!
//! State machine: WAITING → RUNNING (on fire) → WAITING (on wait) … →
//! FINISHED (on return), or CANCELED when the owning promise is dropped
//! mid-suspension. Cancellation raises a dedicated unwind payload inside
//! the fiber so its stack unwinds; the payload never escapes the fiber.

use crate::exec::event::{Event, EventRef, Fire, OnReadyCell, QueueKind};
use crate::exec::event_loop::{clear_current, current_loop, set_current, LoopCore};
use crate::failure::Failure;
use crate::node::{NodeBox, PromiseNode};
use crate::outcome::Outcome;
use crate::promise::Promise;
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Unwind payload for cancellation; caught by the fiber's stack wrapper.
struct FiberCanceled;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FiberState {
    Waiting,
    Running,
    Canceled,
    Finished,
}

#[derive(Copy, Clone, PartialEq)]
enum Turn {
    LoopSide,
    FiberSide,
}

struct FiberSync {
    state: FiberState,
    turn: Turn,
    /// Wait published by the fiber just before it yielded.
    pending: Option<Box<dyn ErasedWait>>,
    cancel: bool,
}

struct FiberShared {
    sync: Mutex<FiberSync>,
    to_fiber: Condvar,
    to_loop: Condvar,
}

/// A promise wait in flight, with its value type erased so the loop side
/// can register and complete it without knowing `U`.
trait ErasedWait: Send {
    fn register(&mut self, event: EventRef);
    fn complete(&mut self);
}

struct FiberWaitRequest<U> {
    node: Option<NodeBox<U>>,
    out: Arc<Mutex<Option<Outcome<U>>>>,
}

impl<U: Send + 'static> ErasedWait for FiberWaitRequest<U> {
    fn register(&mut self, event: EventRef) {
        self.node
            .as_mut()
            .expect("wait registered twice")
            .on_ready(Some(event));
    }

    fn complete(&mut self) {
        let mut node = self.node.take().expect("wait completed twice");
        *self.out.lock() = Some(node.get());
    }
}

/// Capability handed to a fiber body; the only way to block inside one.
pub struct FiberScope {
    shared: Arc<FiberShared>,
}

impl FiberScope {
    /// Suspend the fiber until `promise` settles; other loop work keeps
    /// running meanwhile.
    pub fn wait<U: Send + 'static>(&mut self, promise: Promise<U>) -> Result<U, Failure> {
        let out = Arc::new(Mutex::new(None));
        let request = FiberWaitRequest {
            node: Some(promise.into_node()),
            out: out.clone(),
        };

        let mut sync = self.shared.sync.lock();
        sync.state = FiberState::Waiting;
        sync.pending = Some(Box::new(request));
        sync.turn = Turn::LoopSide;
        self.shared.to_loop.notify_all();
        while sync.turn != Turn::FiberSide {
            self.shared.to_fiber.wait(&mut sync);
        }
        if sync.cancel {
            drop(sync);
            // resume_unwind skips the panic hook: this is control flow,
            // not a programmer error.
            panic::resume_unwind(Box::new(FiberCanceled));
        }
        sync.state = FiberState::Running;
        drop(sync);

        let result = out
            .lock()
            .take()
            .expect("fiber resumed without a result")
            .into_result();
        result
    }
}

type FiberEntry<T> = Box<dyn FnOnce(&mut FiberScope) -> Result<T, Failure> + Send>;

struct FiberCore<T> {
    shared: Arc<FiberShared>,
    loop_core: Arc<LoopCore>,
    entry: Option<FiberEntry<T>>,
    thread: Option<thread::JoinHandle<()>>,
    started: bool,
    current_wait: Option<Box<dyn ErasedWait>>,
    result: Arc<Mutex<Option<Outcome<T>>>>,
    consumer: OnReadyCell,
    event: Option<EventRef>,
}

/// Clears the fiber thread's loop registration even on unwind.
struct CurrentLoopGuard;

impl Drop for CurrentLoopGuard {
    fn drop(&mut self) {
        clear_current();
    }
}

fn fiber_thread_main<T: Send + 'static>(
    shared: Arc<FiberShared>,
    loop_core: Arc<LoopCore>,
    entry: FiberEntry<T>,
    result: Arc<Mutex<Option<Outcome<T>>>>,
) {
    // The fiber shares the loop's identity: promises built on this stack
    // belong to the same loop. Strict alternation keeps this sound.
    set_current(loop_core);
    let _guard = CurrentLoopGuard;

    {
        let mut sync = shared.sync.lock();
        while sync.turn != Turn::FiberSide {
            shared.to_fiber.wait(&mut sync);
        }
        sync.state = FiberState::Running;
    }

    let mut scope = FiberScope {
        shared: shared.clone(),
    };
    let body_result = panic::catch_unwind(AssertUnwindSafe(|| entry(&mut scope)));

    let mut sync = shared.sync.lock();
    match body_result {
        Ok(value) => {
            *result.lock() = Some(value.into());
            sync.state = FiberState::Finished;
        }
        Err(payload) => {
            if payload.is::<FiberCanceled>() {
                sync.state = FiberState::Canceled;
            } else {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "fiber panicked".to_string());
                *result.lock() = Some(Outcome::from_failure(Failure::failed(message)));
                sync.state = FiberState::Finished;
            }
        }
    }
    sync.turn = Turn::LoopSide;
    shared.to_loop.notify_all();
}

impl<T: Send + 'static> Fire for Mutex<FiberCore<T>> {
    fn fire(&self) {
        // Start the fiber on the first fire; afterwards each fire means
        // the awaited node settled.
        let shared;
        let event;
        {
            let mut core = self.lock();
            shared = core.shared.clone();
            event = core.event.clone().expect("fiber event installed");
            if !core.started {
                core.started = true;
                let entry = core.entry.take().expect("fiber entry present");
                let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
                let thread_shared = shared.clone();
                let loop_core = core.loop_core.clone();
                let result = core.result.clone();
                let handle = thread::Builder::new()
                    .name(format!("strand-fiber-{}", id))
                    .spawn(move || fiber_thread_main(thread_shared, loop_core, entry, result))
                    .expect("failed to spawn fiber thread");
                core.thread = Some(handle);
            } else if let Some(mut wait) = core.current_wait.take() {
                drop(core);
                // Extract the settled node's result before switching
                // stacks; this may run user continuations.
                wait.complete();
            }
        }

        // Hand control to the fiber and park until it yields back.
        let outcome = {
            let mut sync = shared.sync.lock();
            if matches!(sync.state, FiberState::Finished | FiberState::Canceled) {
                return;
            }
            sync.turn = Turn::FiberSide;
            shared.to_fiber.notify_all();
            while sync.turn != Turn::LoopSide {
                shared.to_loop.wait(&mut sync);
            }
            match sync.state {
                FiberState::Waiting => sync.pending.take(),
                FiberState::Finished | FiberState::Canceled => None,
                FiberState::Running => unreachable!("fiber yielded while running"),
            }
        };

        match outcome {
            Some(mut wait) => {
                wait.register(event);
                self.lock().current_wait = Some(wait);
            }
            None => {
                let armed = self.lock().consumer.set_ready();
                if let Some(event) = armed {
                    event.arm(QueueKind::DepthFirst);
                }
            }
        }
    }
}

struct FiberNode<T: Send + 'static> {
    core: Arc<Mutex<FiberCore<T>>>,
}

impl<T: Send + 'static> PromiseNode<T> for FiberNode<T> {
    fn on_ready(&mut self, event: Option<EventRef>) {
        let armed = self.core.lock().consumer.register(event);
        if let Some(event) = armed {
            event.arm(QueueKind::BreadthFirst);
        }
    }

    fn get(&mut self) -> Outcome<T> {
        self.core
            .lock()
            .result
            .lock()
            .take()
            .expect("fiber consumed before it finished")
    }
}

impl<T: Send + 'static> Drop for FiberNode<T> {
    fn drop(&mut self) {
        let (shared, thread) = {
            let mut core = self.core.lock();
            match core.thread.take() {
                Some(thread) => (core.shared.clone(), thread),
                // Never started: nothing to unwind.
                None => return,
            }
        };

        {
            let mut sync = shared.sync.lock();
            if sync.state == FiberState::Waiting {
                // Switch back into the fiber with the cancel flag set so
                // it unwinds its stack.
                sync.cancel = true;
                sync.turn = Turn::FiberSide;
                shared.to_fiber.notify_all();
                while !matches!(sync.state, FiberState::Canceled | FiberState::Finished) {
                    shared.to_loop.wait(&mut sync);
                }
            }
        }

        thread.join().expect("failed to join fiber thread");
    }
}

/// Run `f` on its own stack. The returned promise settles when the body
/// returns; dropping it cancels the fiber, unwinding its stack from the
/// innermost wait.
pub fn start_fiber<T, F>(f: F) -> Promise<T>
where
    T: Send + 'static,
    F: FnOnce(&mut FiberScope) -> Result<T, Failure> + Send + 'static,
{
    let loop_core = current_loop();
    let core = Arc::new(Mutex::new(FiberCore {
        shared: Arc::new(FiberShared {
            sync: Mutex::new(FiberSync {
                state: FiberState::Waiting,
                turn: Turn::LoopSide,
                pending: None,
                cancel: false,
            }),
            to_fiber: Condvar::new(),
            to_loop: Condvar::new(),
        }),
        loop_core: loop_core.clone(),
        entry: Some(Box::new(f)),
        thread: None,
        started: false,
        current_wait: None,
        result: Arc::new(Mutex::new(None)),
        consumer: OnReadyCell::new(),
        event: None,
    }));

    let event = Event::new(&loop_core, Arc::downgrade(&core) as Weak<dyn Fire>);
    core.lock().event = Some(event.clone());
    // Begin executing as soon as the loop turns over.
    event.arm(QueueKind::DepthFirst);

    Promise::from_node(Box::new(FiberNode { core }))
}
