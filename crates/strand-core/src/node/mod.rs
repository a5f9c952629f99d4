//! Vertices of the promise graph
//!
//! A `Promise<T>` owns a boxed node; combinators compose nodes into a
//! DAG whose leaves are immediate values or adapter-backed external
//! producers. Nodes are singly owned — dropping the owning handle IS
//! cancellation, and every combinator propagates the drop to its
//! dependencies.

mod adapter;
mod chain;
mod coroutine;
mod eager;
mod fork;
mod immediate;
mod join;
mod transform;

pub(crate) use chain::ChainNode;
pub(crate) use coroutine::CoroutineNode;
pub(crate) use eager::EagerNode;
pub(crate) use fork::split_pair;
pub(crate) use immediate::{BrokenNode, ImmediateNode, NeverNode, YieldNode};
pub(crate) use join::{ArrayJoinNode, ExclusiveJoinNode};
pub(crate) use transform::{AttachmentNode, TransformNode};

pub use adapter::{promise_and_fulfiller, Fulfiller};
pub use coroutine::PromiseFuture;
pub use fork::ForkedPromise;

use crate::exec::event::EventRef;
use crate::outcome::Outcome;
use parking_lot::Mutex;
use std::sync::Arc;

/// Slot through which a node is owned when its owner opts into
/// replacement (chain collapse). The chain stores a weak reference and
/// swaps the boxed node under the owner's feet when it flattens itself.
pub(crate) type OwnerSlot<T> = Arc<Mutex<Option<NodeBox<T>>>>;

/// The node contract.
///
/// `on_ready` registers (or replaces, or with `None` detaches) the one
/// event to arm when the node becomes ready; the most recent call wins,
/// and registering after readiness arms immediately. `get` is called
/// exactly once, after readiness, directly from the loop. Implementors
/// must drop their dependency before any captured state.
pub(crate) trait PromiseNode<T>: Send {
    fn on_ready(&mut self, event: Option<EventRef>);

    fn get(&mut self) -> Outcome<T>;

    /// Hook for chain collapse; only the chain node implements it.
    fn set_owner_slot(&mut self, _slot: &OwnerSlot<T>) {}
}

pub(crate) type NodeBox<T> = Box<dyn PromiseNode<T>>;
