//! Linked-list reader set (the `list-reader-set` feature).
//!
//! Same interface and state machine as the tree variant, but the
//! many-readers state is a singly-linked list with push-front inserts.
//! Iteration is sequential and physically unlinks tombstones as it goes;
//! there is no rebuild phase. Suited to workloads where reader sets stay
//! small enough that tree balance never pays for itself.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use super::TAG;

struct ListNode<T> {
    reader: *mut T,
    next: AtomicPtr<ListNode<T>>,
    deleted: AtomicBool,
}

impl<T> ListNode<T> {
    fn new(reader: *mut T, next: *mut ListNode<T>) -> Self {
        Self {
            reader,
            next: AtomicPtr::new(next),
            deleted: AtomicBool::new(false),
        }
    }
}

/// Hybrid reader set: empty / single inline reader / linked list.
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

    fn head(state: usize) -> *mut ListNode<T> {
        (state & !TAG) as *mut ListNode<T>
    }

    /// Add a reader. Safe to race with other inserts and with removes, but
    /// not with `for_all`.
    pub(crate) fn insert(&self, value: *mut T) {
        debug_assert!(!value.is_null());
        loop {
            let curr = self.state.load(Ordering::Acquire);
            if curr == 0 {
                if self
                    .state
                    .compare_exchange(0, value as usize, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
            } else if curr & TAG == 0 {
                // Promote the single inline reader to a one-element list.
                let node =
                    Box::into_raw(Box::new(ListNode::new(curr as *mut T, ptr::null_mut())));
                if self
                    .state
                    .compare_exchange(curr, node as usize | TAG, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // SAFETY: `node` never became reachable.
                    unsafe { drop(Box::from_raw(node)) };
                }
            } else {
                // Push-front onto the list.
                let node = Box::into_raw(Box::new(ListNode::new(value, Self::head(curr))));
                if self
                    .state
                    .compare_exchange(curr, node as usize | TAG, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                // SAFETY: `node` never became reachable.
                unsafe { drop(Box::from_raw(node)) };
            }
        }
    }

    /// Remove a reader, lazily in the list state. Safe to race with inserts
    /// and other removes.
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
            // A concurrent insert promoted us into a list in the meantime.
        }
        self.remove_list(value);
    }

    fn remove_list(&self, value: *mut T) {
        let state = self.state.load(Ordering::Acquire);
        debug_assert!(state & TAG != 0);
        // SAFETY: list nodes are only unlinked during `for_all`, which is
        // never concurrent with removes.
        unsafe {
            let mut node = Self::head(state);
            while !node.is_null() {
                if (*node).reader == value && !(*node).deleted.load(Ordering::Acquire) {
                    (*node).deleted.store(true, Ordering::Release);
                    return;
                }
                node = (*node).next.load(Ordering::Acquire);
            }
        }
        debug_assert!(false, "reader not found in set");
    }

    /// Apply `f` to every surviving reader, physically unlinking tombstones.
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
        // SAFETY: iteration is exclusive with mutation.
        unsafe {
            let mut head = Self::head(curr);
            while !head.is_null() && (*head).deleted.load(Ordering::Acquire) {
                let next = (*head).next.load(Ordering::Acquire);
                drop(Box::from_raw(head));
                head = next;
            }
            if head.is_null() {
                self.state.store(0, Ordering::Release);
                return;
            }
            self.state.store(head as usize | TAG, Ordering::Release);
            f((*head).reader);
            let mut prev = head;
            let mut node = (*head).next.load(Ordering::Acquire);
            while !node.is_null() {
                let next = (*node).next.load(Ordering::Acquire);
                if (*node).deleted.load(Ordering::Acquire) {
                    (*prev).next.store(next, Ordering::Release);
                    drop(Box::from_raw(node));
                } else {
                    f((*node).reader);
                    prev = node;
                }
                node = next;
            }
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
            unsafe {
                let mut node = Self::head(curr);
                while !node.is_null() {
                    let next = (*node).next.load(Ordering::Relaxed);
                    drop(Box::from_raw(node));
                    node = next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

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
    fn test_single_and_list_transitions() {
        let mut items = dummies(10);
        let ptrs: Vec<*mut u64> = items.iter_mut().map(|b| &mut **b as *mut u64).collect();
        let set = ReaderSet::new();
        assert!(set.is_empty());
        for &p in &ptrs {
            set.insert(p);
        }
        assert_eq!(
            collect(&set),
            ptrs.iter().map(|&p| p as usize).collect::<HashSet<_>>()
        );
        for &p in &ptrs[..9] {
            set.remove(p);
        }
        assert_eq!(set.count(), 1);
        set.remove(ptrs[9]);
        assert!(set.is_empty());
    }

    #[test]
    fn test_concurrent_inserts() {
        let mut items = dummies(2048);
        // Addresses, so slices of them can cross into scoped threads.
        let addrs: Vec<usize> = items
            .iter_mut()
            .map(|b| &mut **b as *mut u64 as usize)
            .collect();
        let set = ReaderSet::new();
        std::thread::scope(|s| {
            let set = &set;
            for chunk in addrs.chunks(256) {
                s.spawn(move || {
                    for &p in chunk {
                        set.insert(p as *mut u64);
                    }
                });
            }
        });
        assert_eq!(set.count(), 2048);
        for &p in &addrs {
            set.remove(p as *mut u64);
        }
        assert!(set.is_empty());
    }
}
