//! Owned computations: running a traced function and propagating changes.

use std::ptr;

use crate::node::{Link, SpNode};
use crate::scope::Scope;

/// Execute a traced function from scratch, recording its trace.
///
/// The returned [`Computation`] owns the trace; after writing new values
/// into input mods, [`Computation::propagate`] brings every output back to
/// what a from-scratch rerun would produce.
pub fn run<F: FnOnce(&mut Scope)>(f: F) -> Computation {
    let mut root: Link = Some(SpNode::seq_box(ptr::null_mut()));
    {
        let mut sc = Scope::new(&mut root as *mut Link, ptr::null_mut());
        f(&mut sc);
        sc.debug_check();
    }
    let root = match root {
        Some(node) => node,
        None => unreachable!("the root slot is never vacated"),
    };
    tracing::trace!(nodes = root.count_nodes(), "traced run recorded");
    Computation { root }
}

/// An owned handle to one traced run.
///
/// Dropping it destroys the trace and unsubscribes every read node, so all
/// mods the trace reads must outlive it.
pub struct Computation {
    root: Box<SpNode>,
}

impl Computation {
    /// Re-execute every read whose inputs changed since the last run or
    /// propagation, in trace order, in parallel across independent forks.
    /// Blocks until the whole trace is clean.
    pub fn propagate(&mut self) {
        tracing::debug!("change propagation pass");
        // SAFETY: `&mut self` gives exclusive structural access to the
        // whole trace, and the root is a live node.
        unsafe { SpNode::propagate(self.root.as_mut() as *mut SpNode) };
    }

    /// Number of nodes in the trace.
    pub fn tree_size(&self) -> usize {
        self.root.count_nodes()
    }

    /// Approximate bytes held by the trace's nodes.
    pub fn memory(&self) -> usize {
        self.root.memory_bytes()
    }

    /// Destroy the trace now.
    ///
    /// Equivalent to dropping, spelled out for call sites where the
    /// destruction order against input mods matters.
    pub fn destroy(self) {}
}
