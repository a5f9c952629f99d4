//! The cooperative event loop
//!
//! One loop per thread, registered in a thread local. The loop owns
//! three run queues and a condvar notifier; the notifier doubles as the
//! external wake source that cross-thread executor submissions (and
//! foreign-thread wakers) use to rouse a parked loop.

use crate::exec::event::{Event, EventRef, Fire, QueueKind};
use crate::exec::executor::ExecutorShared;
use crate::node::{NodeBox, OwnerSlot};
use crate::outcome::Outcome;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

thread_local! {
    static CURRENT: RefCell<Option<Arc<LoopCore>>> = const { RefCell::new(None) };
}

/// The loop registered on the calling thread.
///
/// Panics when none exists: combinators that schedule work can only be
/// built on a thread that owns an `EventLoop`.
pub(crate) fn current_loop() -> Arc<LoopCore> {
    try_current_loop().expect("no event loop on this thread")
}

pub(crate) fn try_current_loop() -> Option<Arc<LoopCore>> {
    CURRENT.with(|c| c.borrow().clone())
}

pub(crate) fn set_current(core: Arc<LoopCore>) {
    CURRENT.with(|c| {
        let mut slot = c.borrow_mut();
        assert!(
            slot.is_none(),
            "an event loop already exists on this thread"
        );
        *slot = Some(core);
    });
}

pub(crate) fn clear_current() {
    CURRENT.with(|c| c.borrow_mut().take());
}

/// Wakes a parked loop. The flag is sticky so a notification arriving
/// just before the park is not lost.
pub(crate) struct Notifier {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Notifier {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }

    pub(crate) fn notify(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.condvar.notify_all();
    }

    pub(crate) fn park(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
        *signaled = false;
    }
}

type QueueEntry = (EventRef, u64);

struct RunQueues {
    depth: VecDeque<QueueEntry>,
    breadth: VecDeque<QueueEntry>,
    last: VecDeque<QueueEntry>,

    /// Insertion cursor for depth-first arms. Reset to the queue head
    /// each time an event is popped, so events armed during one fire land
    /// at the front in arm order.
    depth_insert: usize,
}

/// Shared state of one event loop.
pub(crate) struct LoopCore {
    self_ref: Weak<LoopCore>,
    queues: Mutex<RunQueues>,
    seq: AtomicU64,
    notifier: Arc<Notifier>,
    executor: Arc<ExecutorShared>,

    /// Detached promises kept alive (and evaluating) until the loop
    /// shuts down.
    daemons: Mutex<Vec<NodeBox<()>>>,
}

impl LoopCore {
    fn new() -> Arc<Self> {
        let notifier = Notifier::new();
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            queues: Mutex::new(RunQueues {
                depth: VecDeque::new(),
                breadth: VecDeque::new(),
                last: VecDeque::new(),
                depth_insert: 0,
            }),
            seq: AtomicU64::new(1),
            executor: ExecutorShared::new(notifier.clone()),
            notifier,
            daemons: Mutex::new(Vec::new()),
        })
    }

    fn arc(&self) -> Arc<LoopCore> {
        self.self_ref.upgrade().expect("loop core alive")
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn executor_shared(&self) -> &Arc<ExecutorShared> {
        &self.executor
    }

    pub(crate) fn enqueue(&self, event: EventRef, seq: u64, kind: QueueKind) {
        {
            let mut queues = self.queues.lock();
            match kind {
                QueueKind::DepthFirst => {
                    let at = self.clamp_insert(&queues);
                    queues.depth.insert(at, (event, seq));
                    queues.depth_insert += 1;
                }
                QueueKind::BreadthFirst => queues.breadth.push_back((event, seq)),
                QueueKind::Last => queues.last.push_back((event, seq)),
            }
        }
        self.notifier.notify();
    }

    fn clamp_insert(&self, queues: &RunQueues) -> usize {
        queues.depth_insert.min(queues.depth.len())
    }

    /// Run one event. Cross-thread executor work is drained first;
    /// returns false when the loop is idle.
    pub(crate) fn turn(&self) -> bool {
        let this = self.arc();
        let drained = self.executor.drain(&this);
        loop {
            let entry = {
                let mut queues = self.queues.lock();
                let entry = queues
                    .depth
                    .pop_front()
                    .or_else(|| queues.breadth.pop_front())
                    .or_else(|| queues.last.pop_front());
                queues.depth_insert = 0;
                entry
            };
            let Some((event, seq)) = entry else {
                return drained;
            };
            if !event.begin_fire(seq) {
                // Stale entry from a disarm or re-arm.
                continue;
            }
            let fired = match event.target() {
                Some(target) => {
                    target.fire();
                    true
                }
                // Target destroyed: cancellation already happened.
                None => false,
            };
            event.end_fire();
            if fired {
                return true;
            }
        }
    }

    pub(crate) fn has_work(&self) -> bool {
        let queues = self.queues.lock();
        let queued =
            !queues.depth.is_empty() || !queues.breadth.is_empty() || !queues.last.is_empty();
        queued || self.executor.has_pending()
    }

    pub(crate) fn park(&self) {
        self.notifier.park();
    }

    pub(crate) fn add_daemon(&self, node: NodeBox<()>) {
        self.daemons.lock().push(node);
    }

    fn shutdown(&self) {
        self.executor.disconnect();
        self.daemons.lock().clear();
        // Queue entries hold strong event references, and events hold the
        // loop; clearing the queues breaks the cycle.
        let mut queues = self.queues.lock();
        queues.depth.clear();
        queues.breadth.clear();
        queues.last.clear();
    }
}

/// A single-threaded cooperative event loop.
///
/// Constructing one registers it as the thread's loop; promises,
/// fibers, and the executor are all tied to it. Dropping it cancels
/// detached work and disconnects the executor.
pub struct EventLoop {
    core: Arc<LoopCore>,
    _not_send: PhantomData<*const ()>,
}

impl EventLoop {
    /// Create the loop for the current thread.
    ///
    /// # Panics
    ///
    /// Panics if the thread already has an event loop.
    pub fn new() -> Self {
        let core = LoopCore::new();
        set_current(core.clone());
        Self {
            core,
            _not_send: PhantomData,
        }
    }

    /// The capability token for blocking calls (`wait` / `poll`).
    pub fn wait_scope(&self) -> WaitScope<'_> {
        WaitScope { event_loop: self }
    }

    /// A handle other threads can use to run work on this loop.
    pub fn executor(&self) -> crate::exec::executor::Executor {
        crate::exec::executor::Executor::new(self.core.executor.clone())
    }

    pub(crate) fn core(&self) -> &Arc<LoopCore> {
        &self.core
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.core.shutdown();
        clear_current();
    }
}

/// Per-thread capability permitting blocking calls on the loop.
pub struct WaitScope<'a> {
    event_loop: &'a EventLoop,
}

impl WaitScope<'_> {
    pub(crate) fn core(&self) -> &Arc<LoopCore> {
        self.event_loop.core()
    }
}

/// Fire target used by `wait` / `poll`: records readiness, nothing more.
struct WaitFlag {
    fired: AtomicBool,
}

impl WaitFlag {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fired: AtomicBool::new(false),
        })
    }

    fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl Fire for WaitFlag {
    fn fire(&self) {
        self.fired.store(true, Ordering::Release);
    }
}

/// Spin the loop until `node` is ready, then take its outcome.
///
/// Installs an owner slot for the node so a top-level chain can collapse
/// itself while the wait is in progress. Nested waits are permitted: a
/// continuation running inside a fire may call back in here.
pub(crate) fn wait_impl<T>(node: NodeBox<T>, core: &Arc<LoopCore>) -> Outcome<T> {
    let slot: OwnerSlot<T> = Arc::new(Mutex::new(Some(node)));
    slot.lock()
        .as_mut()
        .expect("node present")
        .set_owner_slot(&slot);

    let flag = WaitFlag::new();
    let event = Event::new(core, Arc::downgrade(&flag) as Weak<dyn Fire>);
    slot.lock()
        .as_mut()
        .expect("node present")
        .on_ready(Some(event));

    while !flag.fired() {
        if !core.turn() {
            if core.has_work() {
                continue;
            }
            core.park();
        }
    }

    let mut node = slot.lock().take().expect("node present");
    node.get()
}

/// Run the loop until idle; report whether `node` became ready without
/// consuming it.
pub(crate) fn poll_impl<T>(node: &mut NodeBox<T>, core: &Arc<LoopCore>) -> bool {
    let flag = WaitFlag::new();
    let event = Event::new(core, Arc::downgrade(&flag) as Weak<dyn Fire>);
    node.on_ready(Some(event));

    while !flag.fired() {
        if !core.turn() {
            break;
        }
    }

    if flag.fired() {
        true
    } else {
        node.on_ready(None);
        false
    }
}
