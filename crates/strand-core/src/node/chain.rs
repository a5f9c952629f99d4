//! Flattening of promise-of-promise
//!
//! A chain node waits for the outer node to yield an inner promise
//! (stage 1), then stands aside and lets the consumer observe the inner
//! node directly (stage 2). When the chain knows the slot that owns it,
//! entering stage 2 swaps the inner node into that slot and retires the
//! chain in the same step — a loop written as recursive promise-of-
//! promise stays O(1) nodes instead of growing a spine of forwarders.

use crate::exec::event::{Event, EventRef, Fire, OnReadyCell, QueueKind};
use crate::exec::event_loop::current_loop;
use crate::failure::Failure;
use crate::node::{NodeBox, OwnerSlot, PromiseNode, TransformNode};
use crate::outcome::Outcome;
use crate::promise::Promise;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

enum ChainStage<T> {
    /// Waiting for the outer node; the chain's own event is registered
    /// on it.
    Step1 {
        outer: Option<NodeBox<Promise<T>>>,
    },
    /// Outer settled with a failure; latched until the consumer's `get`.
    Failed { failure: Option<Failure> },
    /// Outer yielded the inner node and no owner slot was available; the
    /// chain stays behind as a plain forwarder.
    Step2 { inner: Option<NodeBox<T>> },
    /// Replaced itself in the owner's slot; the shell is gone.
    Retired,
}

struct ChainCore<T> {
    stage: ChainStage<T>,
    consumer: OnReadyCell,
    owner: Option<Weak<Mutex<Option<NodeBox<T>>>>>,

    /// Own event, registered on the outer node. Held so the queue entry's
    /// weak target stays valid until the chain is done with it.
    event: Option<EventRef>,
}

pub(crate) struct ChainNode<T> {
    core: Arc<Mutex<ChainCore<T>>>,
}

impl<T: Send + 'static> ChainNode<T> {
    /// Build a chain over `outer` and begin listening on it immediately.
    pub(crate) fn new(outer: NodeBox<Promise<T>>) -> Self {
        let core = Arc::new(Mutex::new(ChainCore {
            stage: ChainStage::Step1 { outer: Some(outer) },
            consumer: OnReadyCell::new(),
            owner: None,
            event: None,
        }));
        let event = Event::new(&current_loop(), Arc::downgrade(&core) as Weak<dyn Fire>);
        {
            let mut core = core.lock();
            core.event = Some(event.clone());
            match &mut core.stage {
                ChainStage::Step1 { outer: Some(outer) } => outer.on_ready(Some(event)),
                _ => unreachable!(),
            }
        }
        Self { core }
    }
}

impl<T: Send + 'static> Fire for Mutex<ChainCore<T>> {
    fn fire(&self) {
        // Pull the outer node out before calling into it: its `get` runs
        // user continuations, and no core lock may be held across those.
        let mut outer = {
            let mut core = self.lock();
            match &mut core.stage {
                ChainStage::Step1 { outer } => match outer.take() {
                    Some(outer) => outer,
                    None => return,
                },
                _ => return,
            }
        };
        let result = outer.get();
        drop(outer);

        let (value, failure) = result.into_parts();
        let Some(promise) = value else {
            let armed = {
                let mut core = self.lock();
                core.stage = ChainStage::Failed {
                    failure: Some(
                        failure.expect("chain outer settled with neither value nor failure"),
                    ),
                };
                let _ = core.event.take();
                core.consumer.set_ready()
            };
            if let Some(event) = armed {
                event.arm(QueueKind::DepthFirst);
            }
            return;
        };

        let mut inner = promise.into_node();
        // Partial success: the inner node was delivered, so the chain
        // proceeds with it; the recoverable failure rides along and
        // resurfaces in the inner's result.
        if let Some(prior) = failure {
            inner = Box::new(TransformNode::new(inner, move |mut outcome: Outcome<T>| {
                outcome.add_failure(prior);
                outcome
            }));
        }

        let (consumer, owner) = {
            let mut core = self.lock();
            let _ = core.event.take();
            (core.consumer.take_registration(), core.owner.take())
        };

        match owner.and_then(|weak| weak.upgrade()) {
            Some(slot) => {
                self.lock().stage = ChainStage::Retired;
                inner.set_owner_slot(&slot);
                if let Some(event) = consumer {
                    inner.on_ready(Some(event));
                }
                // Swapping the slot drops this chain's shell; the core
                // outlives the assignment because the firing event still
                // holds a strong reference.
                *slot.lock() = Some(inner);
            }
            None => {
                if let Some(event) = consumer {
                    inner.on_ready(Some(event));
                }
                self.lock().stage = ChainStage::Step2 { inner: Some(inner) };
            }
        }
    }
}

impl<T: Send + 'static> PromiseNode<T> for ChainNode<T> {
    fn on_ready(&mut self, event: Option<EventRef>) {
        let mut core = self.core.lock();
        if let ChainStage::Step2 { inner: Some(inner) } = &mut core.stage {
            inner.on_ready(event);
            return;
        }
        let armed = core.consumer.register(event);
        drop(core);
        if let Some(armed) = armed {
            armed.arm(QueueKind::BreadthFirst);
        }
    }

    fn get(&mut self) -> Outcome<T> {
        let mut inner = {
            let mut core = self.core.lock();
            match &mut core.stage {
                ChainStage::Failed { failure } => {
                    return Outcome::from_failure(
                        failure.take().expect("chain failure consumed twice"),
                    );
                }
                ChainStage::Step2 { inner } => inner.take().expect("chain consumed twice"),
                _ => unreachable!("chain consumed before ready"),
            }
        };
        inner.get()
    }

    fn set_owner_slot(&mut self, slot: &OwnerSlot<T>) {
        self.core.lock().owner = Some(Arc::downgrade(slot));
    }
}
