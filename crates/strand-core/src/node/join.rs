//! Join combinators: first-settled-wins and wait-for-all

use crate::exec::event::{Event, EventRef, Fire, OnReadyCell, QueueKind};
use crate::exec::event_loop::current_loop;
use crate::failure::Failure;
use crate::node::{NodeBox, PromiseNode};
use crate::outcome::Outcome;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

// ---------------------------------------------------------------------
// Exclusive join

#[derive(Copy, Clone, PartialEq)]
enum Side {
    Left,
    Right,
}

struct ExclusiveBranch<T> {
    dep: Option<NodeBox<T>>,
    // The adapter is the branch event's fire target; the core owns it so
    // the event's weak reference stays valid.
    adapter: Option<Arc<ExclusiveBranchFire<T>>>,
    event: Option<EventRef>,
}

struct ExclusiveJoinCore<T> {
    left: ExclusiveBranch<T>,
    right: ExclusiveBranch<T>,
    outcome: Option<Outcome<T>>,
    consumer: OnReadyCell,
}

struct ExclusiveBranchFire<T> {
    core: Weak<Mutex<ExclusiveJoinCore<T>>>,
    side: Side,
}

impl<T: Send + 'static> Fire for ExclusiveBranchFire<T> {
    fn fire(&self) {
        let Some(core) = self.core.upgrade() else {
            return;
        };

        let mut dep = {
            let mut join = core.lock();
            if join.outcome.is_some() {
                // The other side won; this fire is a no-op.
                return;
            }
            let branch = match self.side {
                Side::Left => &mut join.left,
                Side::Right => &mut join.right,
            };
            match branch.dep.take() {
                Some(dep) => dep,
                None => return,
            }
        };
        let outcome = dep.get();
        drop(dep);

        let (loser, armed) = {
            let mut join = core.lock();
            if join.outcome.is_some() {
                // A nested wait inside our dependency's continuation let
                // the other side settle first.
                return;
            }
            join.outcome = Some(outcome);
            // Cancel the loser: drop its dependency (outside the lock)
            // and retire both branch events.
            let loser = match self.side {
                Side::Left => join.right.dep.take(),
                Side::Right => join.left.dep.take(),
            };
            if let Some(event) = join.left.event.take() {
                event.disarm();
            }
            if let Some(event) = join.right.event.take() {
                event.disarm();
            }
            let _ = join.left.adapter.take();
            let _ = join.right.adapter.take();
            (loser, join.consumer.set_ready())
        };
        drop(loser);
        if let Some(event) = armed {
            event.arm(QueueKind::DepthFirst);
        }
    }
}

/// First of two dependencies to settle wins; the loser is canceled on
/// the spot.
pub(crate) struct ExclusiveJoinNode<T> {
    core: Arc<Mutex<ExclusiveJoinCore<T>>>,
}

impl<T: Send + 'static> ExclusiveJoinNode<T> {
    pub(crate) fn new(left: NodeBox<T>, right: NodeBox<T>) -> Self {
        let core = Arc::new(Mutex::new(ExclusiveJoinCore {
            left: ExclusiveBranch {
                dep: Some(left),
                adapter: None,
                event: None,
            },
            right: ExclusiveBranch {
                dep: Some(right),
                adapter: None,
                event: None,
            },
            outcome: None,
            consumer: OnReadyCell::new(),
        }));

        let event_loop = current_loop();
        let mut join = core.lock();
        for side in [Side::Left, Side::Right] {
            let adapter = Arc::new(ExclusiveBranchFire {
                core: Arc::downgrade(&core),
                side,
            });
            let event = Event::new(&event_loop, Arc::downgrade(&adapter) as Weak<dyn Fire>);
            let branch = match side {
                Side::Left => &mut join.left,
                Side::Right => &mut join.right,
            };
            branch
                .dep
                .as_mut()
                .expect("fresh branch")
                .on_ready(Some(event.clone()));
            branch.adapter = Some(adapter);
            branch.event = Some(event);
        }
        drop(join);

        Self { core }
    }
}

impl<T: Send + 'static> PromiseNode<T> for ExclusiveJoinNode<T> {
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
            .expect("exclusive join consumed before ready")
    }
}

// ---------------------------------------------------------------------
// Array join

struct ArrayJoinSlot<T> {
    dep: Option<NodeBox<T>>,
    outcome: Option<Outcome<T>>,
    adapter: Option<Arc<ArrayJoinBranchFire<T>>>,
    event: Option<EventRef>,
}

struct ArrayJoinCore<T> {
    slots: Vec<ArrayJoinSlot<T>>,
    remaining: usize,
    failure: Option<Failure>,
    consumer: OnReadyCell,
}

struct ArrayJoinBranchFire<T> {
    core: Weak<Mutex<ArrayJoinCore<T>>>,
    index: usize,
}

impl<T: Send + 'static> Fire for ArrayJoinBranchFire<T> {
    fn fire(&self) {
        let Some(core) = self.core.upgrade() else {
            return;
        };

        let mut dep = {
            let mut join = core.lock();
            match join.slots[self.index].dep.take() {
                Some(dep) => dep,
                None => return,
            }
        };
        let outcome = dep.get();
        drop(dep);

        let armed = {
            let mut join = core.lock();
            if let Some(failure) = outcome.failure() {
                // The first failure is latched; later ones are dropped so
                // the consumer observes exactly one.
                if join.failure.is_none() {
                    join.failure = Some(failure.clone());
                }
            }
            let slot = &mut join.slots[self.index];
            slot.outcome = Some(outcome);
            let _ = slot.event.take();
            let _ = slot.adapter.take();
            join.remaining -= 1;
            if join.remaining == 0 {
                join.consumer.set_ready()
            } else {
                None
            }
        };
        if let Some(event) = armed {
            event.arm(QueueKind::DepthFirst);
        }
    }
}

/// Waits for all dependencies; yields the collected values, or the
/// first failure observed.
pub(crate) struct ArrayJoinNode<T> {
    core: Arc<Mutex<ArrayJoinCore<T>>>,
}

impl<T: Send + 'static> ArrayJoinNode<T> {
    pub(crate) fn new(deps: Vec<NodeBox<T>>) -> Self {
        let count = deps.len();
        let core = Arc::new(Mutex::new(ArrayJoinCore {
            slots: deps
                .into_iter()
                .map(|dep| ArrayJoinSlot {
                    dep: Some(dep),
                    outcome: None,
                    adapter: None,
                    event: None,
                })
                .collect(),
            remaining: count,
            failure: None,
            consumer: OnReadyCell::new(),
        }));

        if count == 0 {
            let _ = core.lock().consumer.set_ready();
            return Self { core };
        }

        let event_loop = current_loop();
        let mut join = core.lock();
        for index in 0..count {
            let adapter = Arc::new(ArrayJoinBranchFire {
                core: Arc::downgrade(&core),
                index,
            });
            let event = Event::new(&event_loop, Arc::downgrade(&adapter) as Weak<dyn Fire>);
            let slot = &mut join.slots[index];
            slot.dep
                .as_mut()
                .expect("fresh slot")
                .on_ready(Some(event.clone()));
            slot.adapter = Some(adapter);
            slot.event = Some(event);
        }
        drop(join);

        Self { core }
    }
}

impl<T: Send + 'static> PromiseNode<Vec<T>> for ArrayJoinNode<T> {
    fn on_ready(&mut self, event: Option<EventRef>) {
        let armed = self.core.lock().consumer.register(event);
        if let Some(event) = armed {
            event.arm(QueueKind::BreadthFirst);
        }
    }

    fn get(&mut self) -> Outcome<Vec<T>> {
        let mut join = self.core.lock();
        if let Some(failure) = join.failure.take() {
            return Outcome::from_failure(failure);
        }
        let values = join
            .slots
            .iter_mut()
            .map(|slot| {
                slot.outcome
                    .take()
                    .expect("array join consumed before ready")
                    .into_result()
                    .expect("failure latch missed a failed slot")
            })
            .collect();
        Outcome::from_value(values)
    }
}
