//! Multi-consumer fan-out
//!
//! The first `fork` replaces a promise's node with a refcounted hub that
//! eagerly evaluates the original inner node. Branches added afterwards
//! each observe the cached result; the hub holds only weak references to
//! branch state, so cycles are impossible, and the hub (with any still-
//! running inner work) is released when the last branch or handle drops.

use crate::exec::event::{Event, EventRef, Fire, OnReadyCell, QueueKind};
use crate::exec::event_loop::current_loop;
use crate::node::{NodeBox, PromiseNode};
use crate::outcome::Outcome;
use crate::promise::Promise;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Per-branch readiness state; the hub arms these in add order.
struct BranchCore {
    consumer: OnReadyCell,
}

impl BranchCore {
    fn new(ready: bool) -> Arc<Mutex<Self>> {
        let mut consumer = OnReadyCell::new();
        if ready {
            let _ = consumer.set_ready();
        }
        Arc::new(Mutex::new(Self { consumer }))
    }
}

struct ForkHub<T> {
    inner: Option<NodeBox<T>>,
    outcome: Option<Outcome<T>>,
    branches: Vec<Weak<Mutex<BranchCore>>>,
    event: Option<EventRef>,
}

impl<T: Clone + Send + 'static> Fire for Mutex<ForkHub<T>> {
    fn fire(&self) {
        let mut inner = {
            let mut hub = self.lock();
            match hub.inner.take() {
                Some(inner) => inner,
                None => return,
            }
        };
        let outcome = inner.get();
        drop(inner);

        let branches = {
            let mut hub = self.lock();
            hub.outcome = Some(outcome);
            let _ = hub.event.take();
            std::mem::take(&mut hub.branches)
        };

        // Arm every live branch in the order the branches were added.
        let mut to_arm = Vec::new();
        for branch in branches {
            if let Some(branch) = branch.upgrade() {
                if let Some(event) = branch.lock().consumer.set_ready() {
                    to_arm.push(event);
                }
            }
        }
        for event in to_arm {
            event.arm(QueueKind::DepthFirst);
        }
    }
}

/// A promise that has been forked; hand out as many branches as needed.
pub struct ForkedPromise<T: Clone + Send + 'static> {
    hub: Arc<Mutex<ForkHub<T>>>,
}

impl<T: Clone + Send + 'static> ForkedPromise<T> {
    pub(crate) fn new(inner: NodeBox<T>) -> Self {
        let hub = Arc::new(Mutex::new(ForkHub {
            inner: Some(inner),
            outcome: None,
            branches: Vec::new(),
            event: None,
        }));
        let event = Event::new(&current_loop(), Arc::downgrade(&hub) as Weak<dyn Fire>);
        {
            let mut guard = hub.lock();
            guard.event = Some(event.clone());
            guard
                .inner
                .as_mut()
                .expect("fresh hub")
                .on_ready(Some(event));
        }
        Self { hub }
    }

    /// A new consumer of the shared result. Branches settle in the order
    /// they were added.
    pub fn add_branch(&self) -> Promise<T> {
        let ready = self.hub.lock().outcome.is_some();
        let core = BranchCore::new(ready);
        if !ready {
            self.hub.lock().branches.push(Arc::downgrade(&core));
        }
        Promise::from_node(Box::new(ForkBranchNode {
            hub: self.hub.clone(),
            core,
        }))
    }
}

struct ForkBranchNode<T: Clone + Send + 'static> {
    hub: Arc<Mutex<ForkHub<T>>>,
    core: Arc<Mutex<BranchCore>>,
}

impl<T: Clone + Send + 'static> PromiseNode<T> for ForkBranchNode<T> {
    fn on_ready(&mut self, event: Option<EventRef>) {
        let armed = self.core.lock().consumer.register(event);
        if let Some(event) = armed {
            event.arm(QueueKind::BreadthFirst);
        }
    }

    fn get(&mut self) -> Outcome<T> {
        // Refcounted payloads (`Arc<..>`) clone by bumping the count.
        self.hub
            .lock()
            .outcome
            .as_ref()
            .expect("fork branch consumed before hub settled")
            .clone()
    }
}

// ---------------------------------------------------------------------
// Tuple destructuring (`split`)

struct SplitHub<A, B> {
    inner: Option<NodeBox<(A, B)>>,
    first: Option<Outcome<A>>,
    second: Option<Outcome<B>>,
    branches: Vec<Weak<Mutex<BranchCore>>>,
    event: Option<EventRef>,
}

impl<A, B> Fire for Mutex<SplitHub<A, B>>
where
    A: Send + 'static,
    B: Send + 'static,
{
    fn fire(&self) {
        let mut inner = {
            let mut hub = self.lock();
            match hub.inner.take() {
                Some(inner) => inner,
                None => return,
            }
        };
        let outcome = inner.get();
        drop(inner);

        let (value, failure) = outcome.into_parts();
        let (a, b) = match value {
            Some((a, b)) => (Some(a), Some(b)),
            None => (None, None),
        };

        let branches = {
            let mut hub = self.lock();
            hub.first = Some(Outcome::from_slots(a, failure.clone()));
            hub.second = Some(Outcome::from_slots(b, failure));
            let _ = hub.event.take();
            std::mem::take(&mut hub.branches)
        };

        let mut to_arm = Vec::new();
        for branch in branches {
            if let Some(branch) = branch.upgrade() {
                if let Some(event) = branch.lock().consumer.set_ready() {
                    to_arm.push(event);
                }
            }
        }
        for event in to_arm {
            event.arm(QueueKind::DepthFirst);
        }
    }
}

/// Destructure a pair promise into one promise per component; each
/// component is moved out exactly once.
pub(crate) fn split_pair<A, B>(inner: NodeBox<(A, B)>) -> (Promise<A>, Promise<B>)
where
    A: Send + 'static,
    B: Send + 'static,
{
    let hub = Arc::new(Mutex::new(SplitHub {
        inner: Some(inner),
        first: None,
        second: None,
        branches: Vec::new(),
        event: None,
    }));
    let event = Event::new(&current_loop(), Arc::downgrade(&hub) as Weak<dyn Fire>);
    let (first_core, second_core) = {
        let mut guard = hub.lock();
        guard.event = Some(event.clone());
        guard
            .inner
            .as_mut()
            .expect("fresh hub")
            .on_ready(Some(event.clone()));
        let first = BranchCore::new(false);
        let second = BranchCore::new(false);
        guard.branches.push(Arc::downgrade(&first));
        guard.branches.push(Arc::downgrade(&second));
        (first, second)
    };
    (
        Promise::from_node(Box::new(SplitFirstNode {
            hub: hub.clone(),
            core: first_core,
        })),
        Promise::from_node(Box::new(SplitSecondNode {
            hub,
            core: second_core,
        })),
    )
}

struct SplitFirstNode<A, B> {
    hub: Arc<Mutex<SplitHub<A, B>>>,
    core: Arc<Mutex<BranchCore>>,
}

impl<A, B> PromiseNode<A> for SplitFirstNode<A, B>
where
    A: Send + 'static,
    B: Send + 'static,
{
    fn on_ready(&mut self, event: Option<EventRef>) {
        let armed = self.core.lock().consumer.register(event);
        if let Some(event) = armed {
            event.arm(QueueKind::BreadthFirst);
        }
    }

    fn get(&mut self) -> Outcome<A> {
        self.hub
            .lock()
            .first
            .take()
            .expect("split branch consumed before hub settled")
    }
}

struct SplitSecondNode<A, B> {
    hub: Arc<Mutex<SplitHub<A, B>>>,
    core: Arc<Mutex<BranchCore>>,
}

impl<A, B> PromiseNode<B> for SplitSecondNode<A, B>
where
    A: Send + 'static,
    B: Send + 'static,
{
    fn on_ready(&mut self, event: Option<EventRef>) {
        let armed = self.core.lock().consumer.register(event);
        if let Some(event) = armed {
            event.arm(QueueKind::BreadthFirst);
        }
    }

    fn get(&mut self) -> Outcome<B> {
        self.hub
            .lock()
            .second
            .take()
            .expect("split branch consumed before hub settled")
    }
}
