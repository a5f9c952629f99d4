//! Cross-thread execution
//!
//! Each loop owns an executor handle that other threads use to run work
//! on it. A submitted task lives in the requesting thread's memory but
//! is queued in the target loop; its state walks
//! UNUSED → QUEUED → EXECUTING → DONE (with a CANCELING detour), every
//! transition serialized by the target executor's queue mutex. DONE is
//! additionally published with a release store so the requesting thread
//! can observe completion without taking any lock.

use crate::exec::event::{Event, EventRef, Fire, OnReadyCell, QueueKind};
use crate::exec::event_loop::{current_loop, try_current_loop, LoopCore, Notifier};
use crate::failure::Failure;
use crate::node::{NodeBox, PromiseNode};
use crate::outcome::Outcome;
use crate::promise::Promise;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

const UNUSED: u8 = 0;
const QUEUED: u8 = 1;
const EXECUTING: u8 = 2;
const CANCELING: u8 = 3;
const DONE: u8 = 4;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

fn disconnected_failure() -> Failure {
    Failure::disconnected("target event loop has shut down")
}

/// Type-erased view of a queued cross-thread task.
pub(crate) trait CrossThreadTask: Send + Sync {
    fn id(&self) -> u64;
    fn mark_queued(&self);
    fn mark_executing(&self);

    /// Target side: run the submitted function (or begin awaiting the
    /// promise it returns).
    fn run(self: Arc<Self>, core: &Arc<LoopCore>);

    /// Target side: the requester gave up; drop in-flight work and
    /// acknowledge with DONE.
    fn cancel(&self);

    /// Target side: the loop is exiting; fail the task.
    fn disconnect(&self);

    /// Requester side: the completed task's promise may now settle.
    fn arm_reply(&self);
}

struct ExecQueues {
    start: VecDeque<Arc<dyn CrossThreadTask>>,
    cancel: Vec<Arc<dyn CrossThreadTask>>,
    executing: Vec<Arc<dyn CrossThreadTask>>,
    reply: VecDeque<Arc<dyn CrossThreadTask>>,
    live: bool,
}

/// The shared half of an executor, owned by the target loop and by
/// every `Executor` handle cloned from it.
pub(crate) struct ExecutorShared {
    queues: Mutex<ExecQueues>,
    notifier: Arc<Notifier>,
}

impl ExecutorShared {
    pub(crate) fn new(notifier: Arc<Notifier>) -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(ExecQueues {
                start: VecDeque::new(),
                cancel: Vec::new(),
                executing: Vec::new(),
                reply: VecDeque::new(),
                live: true,
            }),
            notifier,
        })
    }

    fn submit(&self, task: Arc<dyn CrossThreadTask>) -> Result<(), Failure> {
        {
            let mut queues = self.queues.lock();
            if !queues.live {
                return Err(disconnected_failure());
            }
            task.mark_queued();
            queues.start.push_back(task);
        }
        self.notifier.notify();
        Ok(())
    }

    fn push_reply(&self, task: Arc<dyn CrossThreadTask>) {
        {
            let mut queues = self.queues.lock();
            if !queues.live {
                return;
            }
            queues.reply.push_back(task);
        }
        self.notifier.notify();
    }

    fn remove_executing(&self, id: u64) {
        self.queues.lock().executing.retain(|task| task.id() != id);
    }

    pub(crate) fn has_pending(&self) -> bool {
        let queues = self.queues.lock();
        !queues.start.is_empty() || !queues.cancel.is_empty() || !queues.reply.is_empty()
    }

    /// Process queued cross-thread work on the loop thread. Returns true
    /// if anything ran.
    pub(crate) fn drain(&self, core: &Arc<LoopCore>) -> bool {
        enum Item {
            Start(Arc<dyn CrossThreadTask>),
            Cancel(Arc<dyn CrossThreadTask>),
            Reply(Arc<dyn CrossThreadTask>),
        }

        let mut worked = false;
        loop {
            let item = {
                let mut queues = self.queues.lock();
                if let Some(task) = queues.cancel.pop() {
                    Item::Cancel(task)
                } else if let Some(task) = queues.start.pop_front() {
                    // EXECUTING is entered under the queue lock; the lock
                    // is released before any user code runs.
                    task.mark_executing();
                    queues.executing.push(task.clone());
                    Item::Start(task)
                } else if let Some(task) = queues.reply.pop_front() {
                    Item::Reply(task)
                } else {
                    return worked;
                }
            };
            match item {
                Item::Start(task) => task.run(core),
                Item::Cancel(task) => task.cancel(),
                Item::Reply(task) => task.arm_reply(),
            }
            worked = true;
        }
    }

    /// Called when the owning loop shuts down: fail everything pending
    /// and refuse future submissions.
    pub(crate) fn disconnect(&self) {
        let (start, executing, cancel) = {
            let mut queues = self.queues.lock();
            queues.live = false;
            queues.reply.clear();
            (
                std::mem::take(&mut queues.start),
                std::mem::take(&mut queues.executing),
                std::mem::take(&mut queues.cancel),
            )
        };
        for task in cancel {
            task.cancel();
        }
        for task in start.into_iter().chain(executing) {
            task.disconnect();
        }
    }
}

enum XTaskWork<T> {
    Value(Box<dyn FnOnce() -> T + Send>),
    Chained(Box<dyn FnOnce() -> Promise<T> + Send>),
}

struct XTaskInner<T> {
    work: Option<XTaskWork<T>>,
    inner_node: Option<NodeBox<T>>,
    inner_event: Option<EventRef>,
    outcome: Option<Outcome<T>>,
    consumer: OnReadyCell,
    reply_to: Option<Arc<ExecutorShared>>,
}

/// One cross-thread request. Shared between the requesting thread (as a
/// promise node or a blocked stack frame) and the target loop's queues.
struct XTask<T> {
    id: u64,
    state: AtomicU8,
    target: Arc<ExecutorShared>,
    inner: Mutex<XTaskInner<T>>,

    /// Condvar backing for the slow paths (sync waiters, cancel
    /// acknowledgement). The fast path never touches it.
    done_mutex: Mutex<()>,
    done_cv: Condvar,
}

impl<T: Send + 'static> XTask<T> {
    fn new(
        target: Arc<ExecutorShared>,
        work: XTaskWork<T>,
        reply_to: Option<Arc<ExecutorShared>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(UNUSED),
            target,
            inner: Mutex::new(XTaskInner {
                work: Some(work),
                inner_node: None,
                inner_event: None,
                outcome: None,
                consumer: OnReadyCell::new(),
                reply_to,
            }),
            done_mutex: Mutex::new(()),
            done_cv: Condvar::new(),
        })
    }

    fn is_done(&self) -> bool {
        // Release/acquire pairing with `mark_done`: once DONE is
        // observed, the outcome write is visible without a lock.
        self.state.load(Ordering::Acquire) == DONE
    }

    fn mark_done(&self) {
        self.state.store(DONE, Ordering::Release);
        let _guard = self.done_mutex.lock();
        self.done_cv.notify_all();
    }

    fn wait_done(&self) {
        if self.is_done() {
            return;
        }
        let mut guard = self.done_mutex.lock();
        while !self.is_done() {
            self.done_cv.wait(&mut guard);
        }
    }

    /// Deliver the result on the target side: hand it to the requester's
    /// reply queue (async) or publish DONE for the blocked waiter (sync).
    fn finish(this: &Arc<Self>, outcome: Outcome<T>) {
        let reply_to = {
            let mut inner = this.inner.lock();
            inner.inner_node = None;
            let _ = inner.inner_event.take();
            if this.state.load(Ordering::Acquire) != CANCELING {
                inner.outcome = Some(outcome);
            }
            inner.reply_to.take()
        };
        this.target.remove_executing(this.id);
        if let Some(reply_to) = reply_to {
            if this.state.load(Ordering::Acquire) != CANCELING {
                reply_to.push_reply(this.clone() as Arc<dyn CrossThreadTask>);
            }
        }
        this.mark_done();
    }

    fn take_result(&self) -> Result<T, Failure> {
        self.inner
            .lock()
            .outcome
            .take()
            .expect("cross-thread task completed without an outcome")
            .into_result()
    }

    /// Requester side: block until the target acknowledges that it will
    /// never touch this task again.
    fn ensure_done_or_canceled(&self) {
        if self.is_done() {
            return;
        }
        let must_wait = {
            let mut queues = self.target.queues.lock();
            match self.state.load(Ordering::Acquire) {
                UNUSED | DONE => false,
                QUEUED => {
                    let id = self.id;
                    queues.start.retain(|task| task.id() != id);
                    self.state.store(DONE, Ordering::Release);
                    false
                }
                EXECUTING => {
                    self.state.store(CANCELING, Ordering::Release);
                    let id = self.id;
                    let position = queues.executing.iter().position(|task| task.id() == id);
                    if let Some(position) = position {
                        let task = queues.executing.remove(position);
                        queues.cancel.push(task);
                    }
                    true
                }
                _ => true,
            }
        };
        if must_wait {
            self.target.notifier.notify();
            self.wait_done();
        }
    }
}

/// Target-side fire: the promise returned by the submitted function
/// settled.
impl<T: Send + 'static> Fire for XTask<T> {
    fn fire(&self) {
        let node = self.inner.lock().inner_node.take();
        let Some(mut node) = node else {
            return;
        };
        let outcome = node.get();
        drop(node);

        // `finish` needs an owning handle for the reply queue; recover
        // one from the target's executing list.
        let this = {
            let queues = self.target.queues.lock();
            queues
                .executing
                .iter()
                .find(|task| task.id() == self.id)
                .cloned()
        };
        let reply_to = {
            let mut inner = self.inner.lock();
            let _ = inner.inner_event.take();
            if self.state.load(Ordering::Acquire) != CANCELING {
                inner.outcome = Some(outcome);
            }
            inner.reply_to.take()
        };
        self.target.remove_executing(self.id);
        if let (Some(this), Some(reply_to)) = (this, reply_to) {
            if self.state.load(Ordering::Acquire) != CANCELING {
                reply_to.push_reply(this);
            }
        }
        self.mark_done();
    }
}

impl<T: Send + 'static> CrossThreadTask for XTask<T> {
    fn id(&self) -> u64 {
        self.id
    }

    fn mark_queued(&self) {
        self.state.store(QUEUED, Ordering::Release);
    }

    fn mark_executing(&self) {
        self.state.store(EXECUTING, Ordering::Release);
    }

    fn run(self: Arc<Self>, core: &Arc<LoopCore>) {
        if self.state.load(Ordering::Acquire) == CANCELING {
            Self::finish(&self, Outcome::from_failure(disconnected_failure()));
            return;
        }
        let work = self.inner.lock().work.take();
        let Some(work) = work else {
            return;
        };
        match work {
            XTaskWork::Value(f) => {
                let value = f();
                Self::finish(&self, Outcome::from_value(value));
            }
            XTaskWork::Chained(f) => {
                let promise = f();
                let mut node = promise.into_node();
                if self.state.load(Ordering::Acquire) == CANCELING {
                    drop(node);
                    Self::finish(&self, Outcome::from_failure(disconnected_failure()));
                    return;
                }
                let event = Event::new(core, Arc::downgrade(&self) as Weak<dyn Fire>);
                node.on_ready(Some(event.clone()));
                let mut inner = self.inner.lock();
                inner.inner_node = Some(node);
                inner.inner_event = Some(event);
            }
        }
    }

    fn cancel(&self) {
        if self.is_done() {
            return;
        }
        {
            let mut inner = self.inner.lock();
            inner.work = None;
            inner.inner_node = None;
            if let Some(event) = inner.inner_event.take() {
                event.disarm();
            }
            inner.reply_to = None;
        }
        self.target.remove_executing(self.id);
        self.mark_done();
    }

    fn disconnect(&self) {
        if self.is_done() {
            return;
        }
        let reply_to = {
            let mut inner = self.inner.lock();
            inner.work = None;
            inner.inner_node = None;
            if let Some(event) = inner.inner_event.take() {
                event.disarm();
            }
            inner.outcome = Some(Outcome::from_failure(disconnected_failure()));
            inner.reply_to.take()
        };
        if let Some(reply_to) = reply_to {
            let this = {
                let queues = self.target.queues.lock();
                queues
                    .executing
                    .iter()
                    .find(|task| task.id() == self.id)
                    .cloned()
            };
            if let Some(this) = this {
                reply_to.push_reply(this);
            }
        }
        self.mark_done();
    }

    fn arm_reply(&self) {
        let armed = self.inner.lock().consumer.set_ready();
        if let Some(event) = armed {
            event.arm(QueueKind::DepthFirst);
        }
    }
}

/// Requester-side promise node for `execute_async`.
struct XThreadNode<T: Send + 'static> {
    task: Arc<XTask<T>>,
}

impl<T: Send + 'static> PromiseNode<T> for XThreadNode<T> {
    fn on_ready(&mut self, event: Option<EventRef>) {
        let armed = self.task.inner.lock().consumer.register(event);
        if let Some(event) = armed {
            event.arm(QueueKind::BreadthFirst);
        }
    }

    fn get(&mut self) -> Outcome<T> {
        self.task
            .inner
            .lock()
            .outcome
            .take()
            .expect("cross-thread promise consumed before completion")
    }
}

impl<T: Send + 'static> Drop for XThreadNode<T> {
    fn drop(&mut self) {
        self.task.ensure_done_or_canceled();
    }
}

/// Thread-safe handle for enqueuing work into another thread's loop.
#[derive(Clone)]
pub struct Executor {
    shared: Arc<ExecutorShared>,
}

impl Executor {
    pub(crate) fn new(shared: Arc<ExecutorShared>) -> Self {
        Self { shared }
    }

    fn is_own_loop(&self) -> bool {
        try_current_loop()
            .map(|core| Arc::ptr_eq(core.executor_shared(), &self.shared))
            .unwrap_or(false)
    }

    /// True until the target loop shuts down.
    pub fn is_live(&self) -> bool {
        self.shared.queues.lock().live
    }

    /// Run `f` on the target loop and block until it returns.
    ///
    /// Fails with a `Disconnected` failure when the target loop has
    /// exited (or exits mid-call). Called from the target loop's own
    /// thread, the function simply runs in place.
    pub fn execute_sync<T, F>(&self, f: F) -> Result<T, Failure>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_own_loop() {
            return Ok(f());
        }
        let task = XTask::new(self.shared.clone(), XTaskWork::Value(Box::new(f)), None);
        self.shared.submit(task.clone())?;
        task.wait_done();
        task.take_result()
    }

    /// Run `f` on the target loop, wait for the promise it returns to
    /// settle there, and block until the result crosses back.
    pub fn execute_sync_promise<T, F>(&self, f: F) -> Result<T, Failure>
    where
        T: Send + 'static,
        F: FnOnce() -> Promise<T> + Send + 'static,
    {
        assert!(
            !self.is_own_loop(),
            "execute_sync_promise would deadlock on its own loop"
        );
        let task = XTask::new(self.shared.clone(), XTaskWork::Chained(Box::new(f)), None);
        self.shared.submit(task.clone())?;
        task.wait_done();
        task.take_result()
    }

    /// Run `f` on the target loop; settle the returned promise on the
    /// calling thread's loop. Dropping the promise cancels the remote
    /// work (unlinking it if still queued, interrupting it if running).
    pub fn execute_async<T, F>(&self, f: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let reply_to = current_loop().executor_shared().clone();
        let task = XTask::new(
            self.shared.clone(),
            XTaskWork::Value(Box::new(f)),
            Some(reply_to),
        );
        match self.shared.submit(task.clone()) {
            Ok(()) => Promise::from_node(Box::new(XThreadNode { task })),
            Err(failure) => Promise::rejected(failure),
        }
    }

    /// Like `execute_async`, for a promise-returning function.
    pub fn execute_async_promise<T, F>(&self, f: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Promise<T> + Send + 'static,
    {
        let reply_to = current_loop().executor_shared().clone();
        let task = XTask::new(
            self.shared.clone(),
            XTaskWork::Chained(Box::new(f)),
            Some(reply_to),
        );
        match self.shared.submit(task.clone()) {
            Ok(()) => Promise::from_node(Box::new(XThreadNode { task })),
            Err(failure) => Promise::rejected(failure),
        }
    }
}

/// The executor of the loop running on this thread.
pub fn current_thread_executor() -> Executor {
    Executor::new(current_loop().executor_shared().clone())
}
