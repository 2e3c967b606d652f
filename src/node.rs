//! Trace nodes and the change-propagation walk.
//!
//! The trace is a binary tree of series (`Seq`), fork (`Par`), and read
//! (`Read`) nodes. Each node owns its two children and the mods allocated in
//! its scope; its parent back-pointer carries the dirty mark in its low bit.
//! Read nodes additionally carry a replayable body (the user callback plus
//! its dependency set) behind a `dyn ReadBody`.

use std::any::Any;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};

use smallvec::SmallVec;

use crate::gc;
use crate::marked::{MarkedPtr, SendPtr};
use crate::modifiable::{Mod, ModArray, ModCore, ModPtr, ModRange};
use crate::scope::{DynamicReads, ModTuple, ReaderToken, Scope};

pub(crate) type Link = Option<Box<SpNode>>;

/// One node of the series-parallel trace.
pub(crate) struct SpNode {
    /// Parent back-pointer; the low bit marks a dirty subtree.
    parent: MarkedPtr<SpNode>,
    pub(crate) left: Link,
    pub(crate) right: Link,
    /// Mods allocated in this node's scope. They live exactly as long as the
    /// node (or its scratch stand-in on the GC pile).
    pub(crate) dynamic_mods: SmallVec<[Box<dyn Any + Send>; 1]>,
    pub(crate) kind: Kind,
}

pub(crate) enum Kind {
    Seq,
    Par,
    Read(ReadState),
}

pub(crate) struct ReadState {
    pending: AtomicBool,
    body: Box<dyn ReadBody>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum NodeTag {
    Seq,
    Par,
    Read,
}

impl SpNode {
    fn new_box(kind: Kind, parent: *mut SpNode) -> Box<SpNode> {
        Box::new(SpNode {
            parent: MarkedPtr::new(parent),
            left: None,
            right: None,
            dynamic_mods: SmallVec::new(),
            kind,
        })
    }

    pub(crate) fn seq_box(parent: *mut SpNode) -> Box<SpNode> {
        Self::new_box(Kind::Seq, parent)
    }

    pub(crate) fn par_box(parent: *mut SpNode) -> Box<SpNode> {
        Self::new_box(Kind::Par, parent)
    }

    pub(crate) fn read_box(body: Box<dyn ReadBody>, parent: *mut SpNode) -> Box<SpNode> {
        Self::new_box(
            Kind::Read(ReadState {
                pending: AtomicBool::new(false),
                body,
            }),
            parent,
        )
    }

    fn tag(&self) -> NodeTag {
        match self.kind {
            Kind::Seq => NodeTag::Seq,
            Kind::Par => NodeTag::Par,
            Kind::Read(_) => NodeTag::Read,
        }
    }

    pub(crate) fn parent_ptr(&self) -> *mut SpNode {
        self.parent.ptr()
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.parent.is_marked()
    }

    fn clear_dirty(&self) {
        self.parent.clear_mark();
    }

    /// Mark `node` and its ancestors dirty, stopping at the first node whose
    /// mark was already set (its path to the root is covered).
    ///
    /// # Safety
    ///
    /// `node` and all its ancestors must be live trace nodes.
    unsafe fn set_dirty_up(mut node: *mut SpNode) {
        while !node.is_null() {
            if !(*node).parent.mark() {
                return;
            }
            node = (*node).parent.ptr();
        }
    }

    /// A write landed on a mod this node reads: flag the pending update and
    /// dirty the path to the root. Called concurrently from writer threads;
    /// touches only atomic state.
    ///
    /// # Safety
    ///
    /// `me` must be a live read node (possibly one retired to the GC pile
    /// but not yet collected).
    pub(crate) unsafe fn set_modified(me: *mut SpNode) {
        if let Kind::Read(state) = &(*me).kind {
            state.pending.store(true, Ordering::Release);
        }
        Self::set_dirty_up(me);
    }

    /// Install `node` as the left child, retiring any replaced subtree to
    /// the GC pile.
    pub(crate) fn set_left(&mut self, node: Box<SpNode>) -> *mut SpNode {
        if let Some(old) = self.left.replace(node) {
            gc::retire(old);
        }
        match self.left.as_mut() {
            Some(b) => b.as_mut() as *mut SpNode,
            None => unreachable!(),
        }
    }

    /// As [`set_left`](SpNode::set_left), for the right child.
    pub(crate) fn set_right(&mut self, node: Box<SpNode>) -> *mut SpNode {
        if let Some(old) = self.right.replace(node) {
            gc::retire(old);
        }
        match self.right.as_mut() {
            Some(b) => b.as_mut() as *mut SpNode,
            None => unreachable!(),
        }
    }

    /// Allocate a mod owned by this node's scope.
    pub(crate) fn alloc_mod<T: Default + Send + Sync + 'static>(&mut self) -> ModPtr<T> {
        let boxed: Box<Mod<T>> = Box::new(Mod::default());
        let handle = boxed.ptr();
        self.dynamic_mods.push(boxed);
        handle
    }

    /// Allocate an array of mods owned by this node's scope.
    pub(crate) fn alloc_mod_array<T: Default + Send + Sync + 'static>(
        &mut self,
        len: usize,
    ) -> ModRange<T> {
        let boxed = Box::new(ModArray::<T>::new(len));
        let range = boxed.full();
        self.dynamic_mods.push(boxed);
        range
    }

    /// First execution of a read node: record its identity, subscribe to its
    /// fixed dependencies, and run the callback.
    ///
    /// # Safety
    ///
    /// `me` must be a live read node installed as its parent's left child.
    pub(crate) unsafe fn attach_and_run(me: *mut SpNode) {
        let body = Self::body_ptr(me);
        (*body).attach(me);
        (*body).execute(me);
    }

    unsafe fn body_ptr(me: *mut SpNode) -> *mut dyn ReadBody {
        match &mut (*me).kind {
            Kind::Read(state) => state.body.as_mut() as *mut dyn ReadBody,
            _ => unreachable!("read body requested on a non-read node"),
        }
    }

    /// The change-propagation walk.
    ///
    /// # Safety
    ///
    /// `me` must be a live trace node, with the caller holding exclusive
    /// structural access to its subtree (parallel calls only ever target
    /// disjoint subtrees).
    pub(crate) unsafe fn propagate(me: *mut SpNode) {
        match (*me).tag() {
            NodeTag::Seq => {
                if (*me).is_dirty() {
                    Self::propagate_children(me);
                    (*me).clear_dirty();
                }
            }
            NodeTag::Par => {
                if (*me).is_dirty() {
                    let l = link_ptr(&mut (*me).left);
                    let r = link_ptr(&mut (*me).right);
                    debug_assert!(!l.is_null() && !r.is_null(), "fork node missing a branch");
                    if !(*l).is_dirty() {
                        Self::propagate(r);
                    } else if !(*r).is_dirty() {
                        Self::propagate(l);
                    } else {
                        let (lp, rp) = (SendPtr(l), SendPtr(r));
                        rayon::join(
                            move || { let lp = lp; unsafe { Self::propagate(lp.0) } },
                            move || { let rp = rp; unsafe { Self::propagate(rp.0) } },
                        );
                    }
                    (*me).clear_dirty();
                }
            }
            NodeTag::Read => {
                let pending = match &(*me).kind {
                    Kind::Read(state) => state.pending.load(Ordering::Acquire),
                    _ => unreachable!(),
                };
                if pending {
                    // The inputs changed: the whole sub-trace is stale. Move
                    // the old children and scoped mods onto a scratch node
                    // and hand it to the GC pile rather than freeing them
                    // here -- their read nodes may still be mid-notification
                    // from the write that got us here.
                    let mut scratch = SpNode::seq_box(ptr::null_mut());
                    scratch.left = (*me).left.take();
                    scratch.right = (*me).right.take();
                    scratch.dynamic_mods = mem::take(&mut (*me).dynamic_mods);
                    gc::retire(scratch);

                    let body = Self::body_ptr(me);
                    (*body).execute(me);

                    if let Kind::Read(state) = &(*me).kind {
                        state.pending.store(false, Ordering::Release);
                    }
                    (*me).clear_dirty();
                } else if (*me).is_dirty() {
                    Self::propagate_children(me);
                    (*me).clear_dirty();
                }
            }
        }
    }

    unsafe fn propagate_children(me: *mut SpNode) {
        let l = link_ptr(&mut (*me).left);
        if !l.is_null() {
            Self::propagate(l);
        }
        let r = link_ptr(&mut (*me).right);
        if !r.is_null() {
            Self::propagate(r);
        }
    }

    /// Nodes in this subtree, including `self`.
    pub(crate) fn count_nodes(&self) -> usize {
        1 + self.left.as_ref().map_or(0, |n| n.count_nodes())
            + self.right.as_ref().map_or(0, |n| n.count_nodes())
    }

    /// Approximate bytes held by this subtree's nodes.
    pub(crate) fn memory_bytes(&self) -> usize {
        mem::size_of::<SpNode>()
            + self.left.as_ref().map_or(0, |n| n.memory_bytes())
            + self.right.as_ref().map_or(0, |n| n.memory_bytes())
    }
}

impl Drop for SpNode {
    fn drop(&mut self) {
        // Unsubscribe this node's reader before anything it might reference
        // (including our own scoped mods) is freed.
        let was_par = matches!(self.kind, Kind::Par);
        self.kind = Kind::Seq;
        // Large parallel forks retire their halves in parallel.
        if was_par {
            if let (Some(l), Some(r)) = (self.left.take(), self.right.take()) {
                rayon::join(move || drop(l), move || drop(r));
            }
        }
        // Remaining fields drop in declaration order: children before the
        // scoped mods they may still be subscribed to.
    }
}

fn link_ptr(link: &mut Link) -> *mut SpNode {
    match link {
        Some(b) => b.as_mut() as *mut SpNode,
        None => ptr::null_mut(),
    }
}

/// How a read node captures its dependencies and replays its callback.
pub(crate) trait ReadBody: Send {
    /// Record the node's identity and subscribe its fixed dependency set.
    ///
    /// # Safety
    ///
    /// `me` must be the live read node holding this body.
    unsafe fn attach(&mut self, me: *mut SpNode);

    /// (Re-)execute the callback, rebuilding the sub-trace beneath `me`.
    ///
    /// # Safety
    ///
    /// `me` must be the live read node holding this body, installed as its
    /// parent's left child, with its child links already cleared or fresh.
    unsafe fn execute(&mut self, me: *mut SpNode);
}

/// Read body over a fixed tuple of mods, known at trace-build time.
pub(crate) struct TupleBody<D: ModTuple, F> {
    pub(crate) deps: D,
    pub(crate) f: F,
    pub(crate) me: *mut SpNode,
}

// SAFETY: `me` is an identity, only dereferenced under the trace's own
// synchronization; `D: ModTuple` is `Send` by its supertraits.
unsafe impl<D: ModTuple, F: Send> Send for TupleBody<D, F> {}

impl<D, F> ReadBody for TupleBody<D, F>
where
    D: ModTuple,
    F: FnMut(&mut Scope, D::Values) + Send + 'static,
{
    unsafe fn attach(&mut self, me: *mut SpNode) {
        self.me = me;
        self.deps.subscribe(ReaderToken(me));
    }

    unsafe fn execute(&mut self, me: *mut SpNode) {
        debug_assert_eq!(self.me, me);
        let values = self.deps.values();
        let mut sc = Scope::rebuild(me);
        (self.f)(&mut sc, values);
    }
}

impl<D: ModTuple, F> Drop for TupleBody<D, F> {
    fn drop(&mut self) {
        if !self.me.is_null() {
            self.deps.unsubscribe(ReaderToken(self.me));
        }
    }
}

/// Read body over a contiguous range of mods; values are collected into a
/// `Vec` so one callback covers any number of elements.
pub(crate) struct ArrayBody<T, F> {
    pub(crate) range: ModRange<T>,
    pub(crate) f: F,
    pub(crate) me: *mut SpNode,
}

// SAFETY: as for `TupleBody`; the range is a raw view with the same
// validity contract as `ModPtr`.
unsafe impl<T: Send + Sync, F: Send> Send for ArrayBody<T, F> {}

impl<T, F> ReadBody for ArrayBody<T, F>
where
    T: Clone + Send + Sync + 'static,
    F: FnMut(&mut Scope, Vec<T>) + Send + 'static,
{
    unsafe fn attach(&mut self, me: *mut SpNode) {
        self.me = me;
        for i in 0..self.range.len() {
            self.range.get(i).core().add_reader(me);
        }
    }

    unsafe fn execute(&mut self, me: *mut SpNode) {
        debug_assert_eq!(self.me, me);
        let values: Vec<T> = (0..self.range.len())
            .map(|i| self.range.get(i).get())
            .collect();
        let mut sc = Scope::rebuild(me);
        (self.f)(&mut sc, values);
    }
}

impl<T, F> Drop for ArrayBody<T, F> {
    fn drop(&mut self) {
        if self.me.is_null() {
            return;
        }
        for i in 0..self.range.len() {
            // SAFETY: subscribed mods outlive the subscription (scope rule).
            unsafe { self.range.get(i).core().remove_reader(self.me) };
        }
    }
}

/// Read body whose dependencies are discovered as the callback runs.
///
/// Each re-execution diffs the newly collected set against the previous one
/// and adjusts only the subscriptions that actually changed.
pub(crate) struct ScopeBody<F> {
    pub(crate) f: F,
    pub(crate) deps: SmallVec<[NonNull<ModCore>; 8]>,
    pub(crate) me: *mut SpNode,
}

// SAFETY: as for `TupleBody`.
unsafe impl<F: Send> Send for ScopeBody<F> {}

impl<F> ReadBody for ScopeBody<F>
where
    F: FnMut(&mut Scope, &mut DynamicReads) + Send + 'static,
{
    unsafe fn attach(&mut self, me: *mut SpNode) {
        // Subscriptions accrue during execution.
        self.me = me;
    }

    unsafe fn execute(&mut self, me: *mut SpNode) {
        debug_assert_eq!(self.me, me);
        let mut ctx = DynamicReads::new();
        let mut sc = Scope::rebuild(me);
        (self.f)(&mut sc, &mut ctx);

        let mut new_deps = ctx.into_mods();
        new_deps.sort_unstable_by_key(|p| p.as_ptr() as usize);
        // A mod read twice in one scope still gets exactly one subscription.
        new_deps.dedup();

        // Merge against the previous set: unsubscribe only what is gone,
        // subscribe only what is new.
        let old = &self.deps;
        let (mut i, mut j) = (0, 0);
        while i < old.len() || j < new_deps.len() {
            if i == old.len() {
                new_deps[j].as_ref().add_reader(me);
                j += 1;
            } else if j == new_deps.len() {
                old[i].as_ref().remove_reader(me);
                i += 1;
            } else if old[i] == new_deps[j] {
                i += 1;
                j += 1;
            } else if (old[i].as_ptr() as usize) < (new_deps[j].as_ptr() as usize) {
                old[i].as_ref().remove_reader(me);
                i += 1;
            } else {
                new_deps[j].as_ref().add_reader(me);
                j += 1;
            }
        }
        self.deps = new_deps;
    }
}

impl<F> Drop for ScopeBody<F> {
    fn drop(&mut self) {
        if self.me.is_null() {
            return;
        }
        for core in &self.deps {
            // SAFETY: subscribed mods outlive the subscription (scope rule).
            unsafe { core.as_ref().remove_reader(self.me) };
        }
    }
}
