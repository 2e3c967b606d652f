//! Concurrent reader tree.
//!
//! The many-readers state is a binary search tree keyed by a hash of the
//! reader address. Inserts descend and CAS into a null child slot, so they
//! race safely with each other and with lazy removals. Iteration runs in
//! three phases (count survivors, flatten them into a buffer, apply the
//! callback) and finishes by rebuilding a balanced tree from the buffer,
//! which compacts tombstones and undoes insertion-order skew in one pass.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use rayon::prelude::*;

use super::TAG;
use crate::marked::SendPtr;

/// Subtree size above which iteration phases and destruction fork.
const GRANULARITY: usize = 1024;

/// Hash a reader address into the 64-bit key space of the tree.
///
/// Seeds are fixed: the same pointer must hash identically on the insert and
/// remove paths, whichever thread runs them.
fn hash_ptr<T>(ptr: *mut T) -> u64 {
    ahash::RandomState::with_seeds(
        0x9e37_79b9_7f4a_7c15,
        0x6a09_e667_f3bc_c909,
        0xbb67_ae85_84ca_a73b,
        0x3c6e_f372_fe94_f82b,
    )
    .hash_one(ptr as usize)
}

struct TreeNode<T> {
    /// Hash of the reader address; the BST key.
    key: u64,
    reader: *mut T,
    left: AtomicPtr<TreeNode<T>>,
    right: AtomicPtr<TreeNode<T>>,
    /// Surviving-descendant count, refreshed during iteration only.
    size: AtomicUsize,
    deleted: AtomicBool,
}

impl<T> TreeNode<T> {
    fn new(reader: *mut T) -> Self {
        Self {
            key: hash_ptr(reader),
            reader,
            left: AtomicPtr::new(ptr::null_mut()),
            right: AtomicPtr::new(ptr::null_mut()),
            size: AtomicUsize::new(1),
            deleted: AtomicBool::new(false),
        }
    }
}

/// Hybrid reader set: empty / single inline reader / concurrent BST.
pub(crate) struct ReaderSet<T> {
    state: AtomicUsize,
    _marker: PhantomData<AtomicPtr<T>>,
}

unsafe impl<T> Send for ReaderSet<T> {}
unsafe impl<T> Sync for ReaderSet<T> {}

impl<T> Default for ReaderSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReaderSet<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    fn root(state: usize) -> *mut TreeNode<T> {
        (state & !TAG) as *mut TreeNode<T>
    }

    /// Add a reader. Safe to race with other inserts and with removes, but
    /// not with `for_all`.
    pub(crate) fn insert(&self, value: *mut T) {
        debug_assert!(!value.is_null());
        loop {
            let curr = self.state.load(Ordering::Acquire);
            if curr == 0 {
                // Empty: try to become the single inline reader.
                if self
                    .state
                    .compare_exchange(0, value as usize, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
            } else if curr & TAG == 0 {
                // Single inline reader: promote it to a tree root and retry.
                // If the CAS loses, someone else promoted (or removed the
                // single reader) first; the orphan root was never visible.
                let node = Box::into_raw(Box::new(TreeNode::new(curr as *mut T)));
                if self
                    .state
                    .compare_exchange(curr, node as usize | TAG, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // SAFETY: `node` never became reachable.
                    unsafe { drop(Box::from_raw(node)) };
                }
            } else {
                self.insert_tree(curr, value);
                return;
            }
        }
    }

    fn insert_tree(&self, state: usize, value: *mut T) {
        let new_node = Box::into_raw(Box::new(TreeNode::new(value)));
        // SAFETY: tree nodes are only detached during `for_all`, which is
        // never concurrent with inserts.
        unsafe {
            let mut curr = Self::root(state);
            debug_assert!(!curr.is_null());
            loop {
                let slot = if (*new_node).key <= (*curr).key {
                    &(*curr).left
                } else {
                    &(*curr).right
                };
                let child = slot.load(Ordering::Acquire);
                if child.is_null() {
                    match slot.compare_exchange(
                        ptr::null_mut(),
                        new_node,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return,
                        Err(seen) => curr = seen,
                    }
                } else {
                    curr = child;
                }
            }
        }
    }

    /// Remove a reader, lazily: in the tree state the entry is tombstoned
    /// and discarded by the next `for_all`. Safe to race with inserts and
    /// other removes.
    pub(crate) fn remove(&self, value: *mut T) {
        debug_assert!(!value.is_null());
        let curr = self.state.load(Ordering::Acquire);
        debug_assert!(curr != 0, "removing a reader from an empty set");
        if curr & TAG == 0 {
            debug_assert_eq!(curr, value as usize, "single reader does not match");
            if self
                .state
                .compare_exchange(curr, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            // A concurrent insert promoted us into a tree in the meantime.
        }
        self.remove_tree(value);
    }

    fn remove_tree(&self, value: *mut T) {
        let state = self.state.load(Ordering::Acquire);
        debug_assert!(state & TAG != 0);
        let key = hash_ptr(value);
        // SAFETY: as in `insert_tree`.
        unsafe {
            let mut node = Self::root(state);
            while !node.is_null() {
                // Skip tombstones: the same reader may have been removed and
                // re-added since the last compaction, leaving a dead node
                // with this address on the search path.
                if (*node).reader == value && !(*node).deleted.load(Ordering::Acquire) {
                    (*node).deleted.store(true, Ordering::Release);
                    return;
                }
                node = if key <= (*node).key {
                    (*node).left.load(Ordering::Acquire)
                } else {
                    (*node).right.load(Ordering::Acquire)
                };
            }
        }
        debug_assert!(false, "reader not found in set");
    }

    /// Apply `f` to every surviving reader, then rebuild the set without
    /// tombstones (collapsing back to the single or empty state when small).
    /// Must not run concurrently with `insert` or `remove`.
    pub(crate) fn for_all<F>(&self, f: F)
    where
        F: Fn(*mut T) + Sync,
    {
        let curr = self.state.load(Ordering::Acquire);
        if curr == 0 {
            return;
        }
        if curr & TAG == 0 {
            f(curr as *mut T);
            return;
        }

        let root = Self::root(curr);
        // SAFETY: iteration is exclusive with mutation, so the tree shape is
        // frozen for the duration of the three phases.
        let size = unsafe { compute_size(root) };
        let mut buf: Vec<SendPtr<T>> = vec![SendPtr(ptr::null_mut()); size];
        if size > 0 {
            let base = SendPtr(buf.as_mut_ptr());
            unsafe { flatten(root, base, 0) };
        }

        buf.par_iter().with_min_len(GRANULARITY).for_each(|p| {
            debug_assert!(!p.0.is_null());
            f(p.0);
        });

        // SAFETY: the old tree is unreachable once we publish the new state
        // below, and nothing else traverses it during iteration.
        unsafe { drop_tree(root) };

        if size == 0 {
            self.state.store(0, Ordering::Release);
        } else if size == 1 {
            self.state.store(buf[0].0 as usize, Ordering::Release);
        } else {
            let new_root = build_tree(&buf);
            self.state.store(new_root as usize | TAG, Ordering::Release);
        }
    }

    /// Compact tombstones and report emptiness. Quiescent callers only.
    pub(crate) fn is_empty(&self) -> bool {
        self.for_all(|_| {});
        self.state.load(Ordering::Acquire) == 0
    }

    /// Number of surviving readers. Quiescent callers only.
    pub(crate) fn count(&self) -> usize {
        let n = AtomicUsize::new(0);
        self.for_all(|_| {
            n.fetch_add(1, Ordering::Relaxed);
        });
        n.load(Ordering::Relaxed)
    }
}

impl<T> Drop for ReaderSet<T> {
    fn drop(&mut self) {
        let curr = *self.state.get_mut();
        if curr & TAG != 0 {
            // SAFETY: dropping the set is exclusive access.
            unsafe { drop_tree(Self::root(curr)) };
        }
    }
}

/// Phase 1: count surviving readers per subtree, caching sizes for the
/// flatten phase. Forks when both children are present.
unsafe fn compute_size<T>(node: *mut TreeNode<T>) -> usize {
    let alive = !(*node).deleted.load(Ordering::Acquire) as usize;
    let l = (*node).left.load(Ordering::Acquire);
    let r = (*node).right.load(Ordering::Acquire);
    let total = match (l.is_null(), r.is_null()) {
        (true, true) => alive,
        (false, true) => alive + compute_size(l),
        (true, false) => alive + compute_size(r),
        (false, false) => {
            let (lp, rp) = (SendPtr(l), SendPtr(r));
            let (ls, rs) = rayon::join(
                move || { let lp = lp; unsafe { compute_size(lp.0) } },
                move || { let rp = rp; unsafe { compute_size(rp.0) } },
            );
            alive + ls + rs
        }
    };
    (*node).size.store(total, Ordering::Relaxed);
    total
}

/// Phase 2: write surviving readers into `base[offset..]` in key order.
/// Offsets derived from subtree sizes are disjoint across branches.
unsafe fn flatten<T>(node: *mut TreeNode<T>, base: SendPtr<SendPtr<T>>, offset: usize) {
    let alive = !(*node).deleted.load(Ordering::Acquire) as usize;
    let l = (*node).left.load(Ordering::Acquire);
    let r = (*node).right.load(Ordering::Acquire);
    let left_size = if l.is_null() {
        0
    } else {
        (*l).size.load(Ordering::Relaxed)
    };
    if alive == 1 {
        *base.0.add(offset + left_size) = SendPtr((*node).reader);
    }
    match (l.is_null(), r.is_null()) {
        (true, true) => {}
        (false, true) => flatten(l, base, offset),
        (true, false) => flatten(r, base, offset + left_size + alive),
        (false, false) => {
            let (lp, rp) = (SendPtr(l), SendPtr(r));
            rayon::join(
                move || { let lp = lp; unsafe { flatten(lp.0, base, offset) } },
                move || { let rp = rp; unsafe { flatten(rp.0, base, offset + left_size + alive) } },
            );
        }
    }
}

/// Rebuild a balanced tree over `items` (non-empty, in key order).
fn build_tree<T>(items: &[SendPtr<T>]) -> *mut TreeNode<T> {
    debug_assert!(!items.is_empty());
    let mid = items.len() / 2;
    let root = Box::into_raw(Box::new(TreeNode::new(items[mid].0)));
    let (lo, hi) = (&items[..mid], &items[mid + 1..]);
    let (l, r) = if items.len() <= GRANULARITY {
        (build_subtree(lo), build_subtree(hi))
    } else {
        let (l, r) = rayon::join(
            || SendPtr(build_subtree(lo)),
            || SendPtr(build_subtree(hi)),
        );
        (l.0, r.0)
    };
    // Relaxed: the new tree is published by the state store in `for_all`.
    unsafe {
        (*root).left.store(l, Ordering::Relaxed);
        (*root).right.store(r, Ordering::Relaxed);
    }
    root
}

fn build_subtree<T>(items: &[SendPtr<T>]) -> *mut TreeNode<T> {
    if items.is_empty() {
        ptr::null_mut()
    } else {
        build_tree(items)
    }
}

/// Free a subtree, forking for large ones (sizes are only trustworthy after
/// an iteration has refreshed them; stale sizes just cost parallelism).
unsafe fn drop_tree<T>(node: *mut TreeNode<T>) {
    if node.is_null() {
        return;
    }
    let l = (*node).left.load(Ordering::Relaxed);
    let r = (*node).right.load(Ordering::Relaxed);
    let size = (*node).size.load(Ordering::Relaxed);
    drop(Box::from_raw(node));
    if !l.is_null() && !r.is_null() && size >= GRANULARITY {
        let (lp, rp) = (SendPtr(l), SendPtr(r));
        rayon::join(
            move || { let lp = lp; unsafe { drop_tree(lp.0) } },
            move || { let rp = rp; unsafe { drop_tree(rp.0) } },
        );
    } else {
        drop_tree(l);
        drop_tree(r);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn dummies(n: usize) -> Vec<Box<u64>> {
        (0..n as u64).map(Box::new).collect()
    }

    fn collect(set: &ReaderSet<u64>) -> HashSet<usize> {
        let out = parking_lot::Mutex::new(HashSet::new());
        set.for_all(|p| {
            out.lock().insert(p as usize);
        });
        out.into_inner()
    }

    #[test]
    fn test_empty_set() {
        let set = ReaderSet::<u64>::new();
        assert!(set.is_empty());
        assert_eq!(set.count(), 0);
    }

    #[test]
    fn test_single_reader_inline() {
        let mut items = dummies(1);
        let p = &mut *items[0] as *mut u64;
        let set = ReaderSet::new();
        set.insert(p);
        assert_eq!(collect(&set), HashSet::from([p as usize]));
        assert_eq!(set.count(), 1);
        set.remove(p);
        assert!(set.is_empty());
    }

    #[test]
    fn test_grows_into_tree_and_back() {
        let mut items = dummies(50);
        let ptrs: Vec<*mut u64> = items.iter_mut().map(|b| &mut **b as *mut u64).collect();
        let set = ReaderSet::new();
        for &p in &ptrs {
            set.insert(p);
        }
        assert_eq!(set.count(), 50);
        assert_eq!(
            collect(&set),
            ptrs.iter().map(|&p| p as usize).collect::<HashSet<_>>()
        );

        // Tombstone all but one; the next iteration collapses to inline.
        for &p in &ptrs[1..] {
            set.remove(p);
        }
        assert_eq!(collect(&set), HashSet::from([ptrs[0] as usize]));
        set.remove(ptrs[0]);
        assert!(set.is_empty());
    }

    #[test]
    fn test_remove_all_collapses_to_empty() {
        let mut items = dummies(8);
        let ptrs: Vec<*mut u64> = items.iter_mut().map(|b| &mut **b as *mut u64).collect();
        let set = ReaderSet::new();
        for &p in &ptrs {
            set.insert(p);
        }
        for &p in &ptrs {
            set.remove(p);
        }
        assert!(set.is_empty());
        // Reusable after collapsing.
        set.insert(ptrs[0]);
        assert_eq!(set.count(), 1);
        set.remove(ptrs[0]);
    }

    #[test]
    fn test_iteration_visits_each_once() {
        let mut items = dummies(1000);
        let ptrs: Vec<*mut u64> = items.iter_mut().map(|b| &mut **b as *mut u64).collect();
        let set = ReaderSet::new();
        for &p in &ptrs {
            set.insert(p);
        }
        let visits = AtomicUsize::new(0);
        set.for_all(|_| {
            visits.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(visits.load(Ordering::Relaxed), 1000);
        // Rebuild kept everything.
        assert_eq!(set.count(), 1000);
        for &p in &ptrs {
            set.remove(p);
        }
        assert!(set.is_empty());
    }

    fn height(node: *mut TreeNode<u64>) -> usize {
        if node.is_null() {
            return 0;
        }
        // SAFETY: tests inspect the tree only at quiescent points.
        unsafe {
            let l = (*node).left.load(Ordering::Relaxed);
            let r = (*node).right.load(Ordering::Relaxed);
            1 + height(l).max(height(r))
        }
    }

    #[test]
    fn test_rebuild_balances_the_tree() {
        let mut items = dummies(2048);
        let ptrs: Vec<*mut u64> = items.iter_mut().map(|b| &mut **b as *mut u64).collect();
        let set = ReaderSet::new();
        for &p in &ptrs {
            set.insert(p);
        }
        // Tombstone a skewed subset: everything except every 20th reader.
        let survivors: Vec<*mut u64> = ptrs.iter().copied().step_by(20).collect();
        for (i, &p) in ptrs.iter().enumerate() {
            if i % 20 != 0 {
                set.remove(p);
            }
        }
        set.for_all(|_| {});

        let m = survivors.len();
        let state = set.state.load(Ordering::Acquire);
        assert!(state & TAG != 0, "many survivors stay in the tree state");
        let h = height(ReaderSet::root(state));
        // A mid-split rebuild yields floor(log2(m)) + 1 levels.
        let balanced = usize::BITS as usize - m.leading_zeros() as usize;
        assert!(
            h <= balanced,
            "rebuilt height {h} exceeds balanced bound {balanced} for {m} readers"
        );
        assert_eq!(set.count(), m);

        for &p in &survivors {
            set.remove(p);
        }
        assert!(set.is_empty());
    }

    #[test]
    fn test_concurrent_inserts_and_removes() {
        let mut items = dummies(4096);
        // Addresses, so slices of them can cross into scoped threads.
        let addrs: Vec<usize> = items
            .iter_mut()
            .map(|b| &mut **b as *mut u64 as usize)
            .collect();
        let set = ReaderSet::new();
        // First half pre-inserted, then removed concurrently with inserting
        // the second half.
        for &p in &addrs[..2048] {
            set.insert(p as *mut u64);
        }
        let (stay, go) = (&addrs[2048..], &addrs[..2048]);
        std::thread::scope(|s| {
            let set = &set;
            for chunk in stay.chunks(512) {
                s.spawn(move || {
                    for &p in chunk {
                        set.insert(p as *mut u64);
                    }
                });
            }
            for chunk in go.chunks(512) {
                s.spawn(move || {
                    for &p in chunk {
                        set.remove(p as *mut u64);
                    }
                });
            }
        });
        assert_eq!(collect(&set), stay.iter().copied().collect::<HashSet<_>>());
        for &p in stay {
            set.remove(p as *mut u64);
        }
        assert!(set.is_empty());
    }
}
