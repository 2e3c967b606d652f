//! The tracing DSL: the cursor and the operators that grow the trace.
//!
//! A traced function is a plain `fn(&mut Scope, …)`. The [`Scope`] is the
//! tracing cursor: the pair of {current child slot, parent node} that every
//! operator reads and advances. Operators hang their node under the slot's
//! series node (materializing it on first use) and step the cursor into that
//! node's right link, so a function body becomes a series chain with one
//! read or fork hanging off the left of each element.

use std::ptr::{self, NonNull};

use smallvec::SmallVec;

use crate::modifiable::{ModCore, ModPtr, ModRange};
use crate::node::{ArrayBody, Link, ScopeBody, SpNode, TupleBody};

/// The tracing cursor threaded through every traced function.
///
/// Obtained from [`run`](crate::run) or passed to the callbacks of read and
/// fork operators. All trace growth happens through its methods.
pub struct Scope {
    slot: *mut Link,
    parent: *mut SpNode,
}

// SAFETY: a scope is two addresses into the trace being built; fork branches
// receive scopes for disjoint subtrees, and the runtime never aliases them.
unsafe impl Send for Scope {}

impl Scope {
    pub(crate) fn new(slot: *mut Link, parent: *mut SpNode) -> Self {
        Self { slot, parent }
    }

    /// Cursor for re-running a read node's callback: its owning slot is its
    /// parent's left link.
    ///
    /// # Safety
    ///
    /// `me` must be a live read node installed as its parent's left child.
    pub(crate) unsafe fn rebuild(me: *mut SpNode) -> Scope {
        let parent = (*me).parent_ptr();
        debug_assert!(!parent.is_null(), "a read node is never the trace root");
        Scope::new(&mut (*parent).left as *mut Link, ptr::null_mut())
    }

    /// The series node at the cursor, materialized on first use.
    fn ensure_node(&mut self) -> *mut SpNode {
        // SAFETY: the slot and parent pointers are valid for the lifetime of
        // the traced call that handed out this scope.
        unsafe {
            if (*self.slot).is_none() {
                debug_assert!(!self.parent.is_null());
                *self.slot = Some(SpNode::seq_box(self.parent));
            }
            match (*self.slot).as_mut() {
                Some(node) => node.as_mut() as *mut SpNode,
                None => unreachable!(),
            }
        }
    }

    /// Step the cursor into `node`'s continuation slot.
    fn advance(&mut self, node: *mut SpNode) {
        self.parent = node;
        // SAFETY: `node` was just returned by `ensure_node`.
        self.slot = unsafe { &mut (*node).right as *mut Link };
    }

    pub(crate) fn debug_check(&self) {
        #[cfg(debug_assertions)]
        // SAFETY: as in `ensure_node`.
        unsafe {
            match (*self.slot).as_ref() {
                None => assert!(!self.parent.is_null()),
                Some(node) => {
                    assert!(self.parent.is_null() || ptr::eq(node.parent_ptr(), self.parent));
                }
            }
        }
    }

    /// Invoke another traced function, inheriting and advancing the cursor.
    ///
    /// Sugar for a direct call, plus the cursor-shape check that every
    /// traced call boundary carries in debug builds.
    pub fn call<F: FnOnce(&mut Scope)>(&mut self, f: F) {
        f(self);
        self.debug_check();
    }

    /// Read one mod (or a tuple of up to four), then run `body` with their
    /// current values.
    ///
    /// The trace records the read: whenever a new value is written to any of
    /// the listed mods, the next [`propagate`](crate::Computation::propagate)
    /// discards the sub-trace `body` built and re-executes it against fresh
    /// values.
    pub fn read<D, F>(&mut self, deps: D, body: F)
    where
        D: ModTuple,
        F: FnMut(&mut Scope, D::Values) + Send + 'static,
    {
        let node = self.ensure_node();
        // SAFETY: `node` is the live cursor node; the read node is installed
        // as its left child before running.
        unsafe {
            let read = (*node).set_left(SpNode::read_box(
                Box::new(TupleBody {
                    deps,
                    f: body,
                    me: ptr::null_mut(),
                }),
                node,
            ));
            SpNode::attach_and_run(read);
        }
        self.advance(node);
    }

    /// Read a contiguous range of mods; `body` receives their values
    /// collected into a `Vec`, indexed as the range is.
    pub fn read_array<T, F>(&mut self, range: ModRange<T>, body: F)
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut(&mut Scope, Vec<T>) + Send + 'static,
    {
        let node = self.ensure_node();
        // SAFETY: as in `read`.
        unsafe {
            let read = (*node).set_left(SpNode::read_box(
                Box::new(ArrayBody {
                    range,
                    f: body,
                    me: ptr::null_mut(),
                }),
                node,
            ));
            SpNode::attach_and_run(read);
        }
        self.advance(node);
    }

    /// Open a dynamic read scope: `body` discovers its dependencies as it
    /// runs, by pulling values through [`DynamicReads::read`].
    ///
    /// On re-execution the newly discovered set replaces the old one
    /// differentially: only subscriptions that actually changed are
    /// touched. This is the shape for reads whose dependency set is
    /// control-flow dependent.
    pub fn dynamic<F>(&mut self, body: F)
    where
        F: FnMut(&mut Scope, &mut DynamicReads) + Send + 'static,
    {
        let node = self.ensure_node();
        // SAFETY: as in `read`.
        unsafe {
            let read = (*node).set_left(SpNode::read_box(
                Box::new(ScopeBody {
                    f: body,
                    deps: SmallVec::new(),
                    me: ptr::null_mut(),
                }),
                node,
            ));
            SpNode::attach_and_run(read);
        }
        self.advance(node);
    }

    /// Fork: run `left` and `right` in parallel, each building its own
    /// branch of the trace. Returns after both complete.
    ///
    /// During propagation the two branches re-execute in parallel as well
    /// (when both are dirty). The branches must write disjoint mods.
    pub fn par<L, R>(&mut self, left: L, right: R)
    where
        L: FnOnce(&mut Scope) + Send,
        R: FnOnce(&mut Scope) + Send,
    {
        let node = self.ensure_node();
        // SAFETY: as in `read`; the fork and its two series children are
        // fresh, so each branch sees a disjoint, unpopulated scope.
        unsafe {
            let fork = (*node).set_left(SpNode::par_box(node));
            let lslot = {
                let s = (*fork).set_left(SpNode::seq_box(fork));
                debug_assert!((*s).left.is_none() && (*s).right.is_none());
                &mut (*fork).left as *mut Link
            };
            let rslot = {
                let s = (*fork).set_right(SpNode::seq_box(fork));
                debug_assert!((*s).left.is_none() && (*s).right.is_none());
                &mut (*fork).right as *mut Link
            };
            debug_assert!(lslot != rslot);
            let mut lsc = Scope::new(lslot, ptr::null_mut());
            let mut rsc = Scope::new(rslot, ptr::null_mut());
            rayon::join(move || left(&mut lsc), move || right(&mut rsc));
        }
        self.advance(node);
    }

    /// Data-parallel loop: run `body(i)` for every `i` in `lo..hi`, forking
    /// down to `granularity` indices and running each chunk as a series
    /// chain.
    ///
    /// The trace records a balanced fork tree, so propagation of sparse
    /// updates descends only the branches that cover dirty leaves. An empty
    /// range records nothing.
    pub fn parallel_for<F>(&mut self, lo: usize, hi: usize, granularity: usize, body: F)
    where
        F: Fn(&mut Scope, usize) + Sync,
    {
        let node = self.ensure_node();
        if lo < hi {
            let sub = build_par_tree(node, lo, hi, granularity.max(1), &body);
            // SAFETY: as in `read`.
            unsafe {
                (*node).set_left(sub);
            }
        }
        self.advance(node);
    }

    /// Allocate a mod owned by the current trace node.
    ///
    /// The cell lives exactly as long as the node: when a surrounding read
    /// re-executes, the old cell is retired with the old sub-trace. The
    /// returned handle must not be used beyond that lifetime.
    pub fn alloc<T: Default + Send + Sync + 'static>(&mut self) -> ModPtr<T> {
        let node = self.ensure_node();
        // SAFETY: `node` is the live cursor node.
        unsafe { (*node).alloc_mod::<T>() }
    }

    /// Allocate an array of mods owned by the current trace node.
    pub fn alloc_array<T: Default + Send + Sync + 'static>(&mut self, len: usize) -> ModRange<T> {
        let node = self.ensure_node();
        // SAFETY: `node` is the live cursor node.
        unsafe { (*node).alloc_mod_array::<T>(len) }
    }
}

/// Balanced fork tree over `lo..hi`, series chains at or below the
/// granularity. Built in parallel, mirroring how it will later propagate.
fn build_par_tree<F>(
    parent: *mut SpNode,
    lo: usize,
    hi: usize,
    granularity: usize,
    body: &F,
) -> Box<SpNode>
where
    F: Fn(&mut Scope, usize) + Sync,
{
    if hi - lo <= granularity {
        build_seq_chain(parent, lo, hi, body)
    } else {
        let mut node = SpNode::par_box(parent);
        let me = crate::marked::SendPtr(node.as_mut() as *mut SpNode);
        let mid = lo + (hi - lo) / 2;
        let (l, r) = rayon::join(
            move || { let me = me; build_par_tree(me.0, lo, mid, granularity, body) },
            move || { let me = me; build_par_tree(me.0, mid, hi, granularity, body) },
        );
        node.left = Some(l);
        node.right = Some(r);
        node
    }
}

fn build_seq_chain<F>(parent: *mut SpNode, lo: usize, hi: usize, body: &F) -> Box<SpNode>
where
    F: Fn(&mut Scope, usize) + Sync,
{
    debug_assert!(lo < hi);
    if hi - lo == 1 {
        let mut link: Link = Some(SpNode::seq_box(parent));
        let mut sc = Scope::new(&mut link as *mut Link, parent);
        body(&mut sc, lo);
        match link {
            Some(node) => node,
            None => unreachable!(),
        }
    } else {
        let mut node = SpNode::seq_box(parent);
        let me = node.as_mut() as *mut SpNode;
        let mid = lo + (hi - lo) / 2;
        node.left = Some(build_seq_chain(me, lo, mid, body));
        node.right = Some(build_seq_chain(me, mid, hi, body));
        node
    }
}

/// Collector handed to [`Scope::dynamic`] bodies; each [`read`] both yields
/// the mod's current value and records the dependency.
///
/// [`read`]: DynamicReads::read
pub struct DynamicReads {
    mods: SmallVec<[NonNull<ModCore>; 8]>,
}

impl DynamicReads {
    pub(crate) fn new() -> Self {
        Self {
            mods: SmallVec::new(),
        }
    }

    pub(crate) fn into_mods(self) -> SmallVec<[NonNull<ModCore>; 8]> {
        self.mods
    }

    /// Read `m`'s current value and record it as a dependency of the
    /// enclosing dynamic scope.
    pub fn read<T: Clone>(&mut self, m: ModPtr<T>) -> T {
        // SAFETY: handle validity contract (see `ModPtr`).
        let target = unsafe { m.target() };
        self.mods.push(NonNull::from(target.core()));
        target.get()
    }
}

/// The identity of a read node, handed to dependency sets for subscription
/// bookkeeping. Constructed only by the runtime.
#[derive(Clone, Copy)]
pub struct ReaderToken(pub(crate) *mut SpNode);

mod sealed {
    use crate::modifiable::ModPtr;

    pub trait Sealed {}

    impl<T> Sealed for ModPtr<T> {}
    impl<A> Sealed for (ModPtr<A>,) {}
    impl<A, B> Sealed for (ModPtr<A>, ModPtr<B>) {}
    impl<A, B, C> Sealed for (ModPtr<A>, ModPtr<B>, ModPtr<C>) {}
    impl<A, B, C, D> Sealed for (ModPtr<A>, ModPtr<B>, ModPtr<C>, ModPtr<D>) {}
}

/// A fixed dependency set for [`Scope::read`]: a single [`ModPtr`] or a
/// tuple of up to four.
///
/// Sealed; the runtime implements it for the handle shapes the read
/// operator accepts.
pub trait ModTuple: sealed::Sealed + Copy + Send + 'static {
    /// The values yielded to the read callback.
    type Values;

    /// Subscribe `reader` to every mod in the set.
    #[doc(hidden)]
    fn subscribe(&self, reader: ReaderToken);

    /// Remove `reader` from every mod in the set.
    #[doc(hidden)]
    fn unsubscribe(&self, reader: ReaderToken);

    /// Clone out the current values.
    #[doc(hidden)]
    fn values(&self) -> Self::Values;
}

impl<T: Clone + Send + Sync + 'static> ModTuple for ModPtr<T> {
    type Values = T;

    fn subscribe(&self, reader: ReaderToken) {
        // SAFETY: handle validity contract.
        unsafe { self.target() }.core().add_reader(reader.0);
    }

    fn unsubscribe(&self, reader: ReaderToken) {
        // SAFETY: handle validity contract.
        unsafe { self.target() }.core().remove_reader(reader.0);
    }

    fn values(&self) -> T {
        self.get()
    }
}

macro_rules! mod_tuple_impl {
    ($(($T:ident, $idx:tt)),+) => {
        impl<$($T),+> ModTuple for ($(ModPtr<$T>,)+)
        where
            $($T: Clone + Send + Sync + 'static),+
        {
            type Values = ($($T,)+);

            fn subscribe(&self, reader: ReaderToken) {
                $(
                    // SAFETY: handle validity contract.
                    unsafe { self.$idx.target() }.core().add_reader(reader.0);
                )+
            }

            fn unsubscribe(&self, reader: ReaderToken) {
                $(
                    // SAFETY: handle validity contract.
                    unsafe { self.$idx.target() }.core().remove_reader(reader.0);
                )+
            }

            fn values(&self) -> Self::Values {
                ($(self.$idx.get(),)+)
            }
        }
    };
}

mod_tuple_impl!((A, 0));
mod_tuple_impl!((A, 0), (B, 1));
mod_tuple_impl!((A, 0), (B, 1), (C, 2));
mod_tuple_impl!((A, 0), (B, 1), (C, 2), (D, 3));
