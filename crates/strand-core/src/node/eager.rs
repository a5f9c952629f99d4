//! Forced evaluation without a consumer

use crate::exec::event::{Event, EventRef, Fire, OnReadyCell, QueueKind};
use crate::exec::event_loop::current_loop;
use crate::node::{NodeBox, PromiseNode};
use crate::outcome::Outcome;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

struct EagerCore<T> {
    dep: Option<NodeBox<T>>,
    outcome: Option<Outcome<T>>,
    consumer: OnReadyCell,
    event: Option<EventRef>,
}

impl<T: Send + 'static> Fire for Mutex<EagerCore<T>> {
    fn fire(&self) {
        let mut dep = {
            let mut core = self.lock();
            match core.dep.take() {
                Some(dep) => dep,
                None => return,
            }
        };
        let outcome = dep.get();
        drop(dep);

        let armed = {
            let mut core = self.lock();
            core.outcome = Some(outcome);
            let _ = core.event.take();
            core.consumer.set_ready()
        };
        if let Some(event) = armed {
            event.arm(QueueKind::DepthFirst);
        }
    }
}

/// Behaves as if someone were actively waiting on the dependency:
/// registers on it at construction, caches the result, and hands it to
/// whichever consumer shows up later.
pub(crate) struct EagerNode<T> {
    core: Arc<Mutex<EagerCore<T>>>,
}

impl<T: Send + 'static> EagerNode<T> {
    pub(crate) fn new(dep: NodeBox<T>) -> Self {
        let core = Arc::new(Mutex::new(EagerCore {
            dep: Some(dep),
            outcome: None,
            consumer: OnReadyCell::new(),
            event: None,
        }));
        let event = Event::new(&current_loop(), Arc::downgrade(&core) as Weak<dyn Fire>);
        {
            let mut guard = core.lock();
            guard.event = Some(event.clone());
            guard
                .dep
                .as_mut()
                .expect("fresh eager node")
                .on_ready(Some(event));
        }
        Self { core }
    }
}

impl<T: Send + 'static> PromiseNode<T> for EagerNode<T> {
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
            .expect("eager node consumed before ready")
    }
}
