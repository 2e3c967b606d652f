//! Modifiables: the single-writer cells whose reads the runtime tracks.

use std::cell::UnsafeCell;
use std::ops::Index;
use std::ptr::NonNull;

#[cfg(debug_assertions)]
use std::sync::atomic::AtomicBool;
#[cfg(debug_assertions)]
use std::sync::atomic::Ordering;

use rayon::prelude::*;

use crate::node::SpNode;
use crate::readers::ReaderSet;

/// The type-erased half of a modifiable: its reader set and debug state.
///
/// Read nodes subscribe here without knowing the value type, which is what
/// lets one trace node depend on mods of mixed types.
pub(crate) struct ModCore {
    readers: ReaderSet<SpNode>,
    #[cfg(debug_assertions)]
    written: AtomicBool,
}

impl ModCore {
    fn new(written: bool) -> Self {
        #[cfg(not(debug_assertions))]
        let _ = written;
        Self {
            readers: ReaderSet::new(),
            #[cfg(debug_assertions)]
            written: AtomicBool::new(written),
        }
    }

    #[cfg(debug_assertions)]
    fn assert_written(&self) {
        assert!(
            self.written.load(Ordering::Acquire),
            "modifiable used before its first write"
        );
    }

    /// Mark every subscribed read node as pending and dirty its path to the
    /// root. Runs on the writer's thread; the reader set contract makes this
    /// iteration exclusive per mod.
    pub(crate) fn notify_readers(&self) {
        self.readers.for_all(|reader| {
            // SAFETY: subscribed read nodes outlive their subscriptions; a
            // retired subtree stays alive on the GC pile until a quiescent
            // collect, so `reader` is a live node.
            unsafe { SpNode::set_modified(reader) };
        });
    }

    pub(crate) fn add_reader(&self, reader: *mut SpNode) {
        #[cfg(debug_assertions)]
        self.assert_written();
        self.readers.insert(reader);
    }

    pub(crate) fn remove_reader(&self, reader: *mut SpNode) {
        #[cfg(debug_assertions)]
        self.assert_written();
        self.readers.remove(reader);
    }

    pub(crate) fn reader_count(&self) -> usize {
        self.readers.count()
    }
}

#[cfg(debug_assertions)]
impl Drop for ModCore {
    fn drop(&mut self) {
        assert!(
            self.readers.is_empty(),
            "modifiable destroyed while readers are still subscribed; \
             run gc::collect() after propagation before dropping inputs"
        );
    }
}

/// A modifiable: a single-writer cell tracked by the runtime.
///
/// Traced reads subscribe to the cell; [`write`](Mod::write) notifies those
/// subscriptions when the value actually changes, and the next
/// [`propagate`](crate::Computation::propagate) re-executes exactly the
/// affected reads.
///
/// # Contract
///
/// A mod has at most one writer at a time, and a value written inside a
/// trace is written before it is read (the series order of the trace makes
/// this natural). Violations are assertion failures in debug builds and
/// undefined behavior in release builds.
pub struct Mod<T> {
    core: ModCore,
    value: UnsafeCell<T>,
}

// SAFETY: the single-writer / quiescent-reader contract serializes all value
// access; the reader set is internally synchronized.
unsafe impl<T: Send> Send for Mod<T> {}
unsafe impl<T: Send + Sync> Sync for Mod<T> {}

impl<T: Default> Default for Mod<T> {
    /// An unwritten cell; it must be written before its first read.
    fn default() -> Self {
        Self {
            core: ModCore::new(false),
            value: UnsafeCell::new(T::default()),
        }
    }
}

impl<T> Mod<T> {
    /// A cell holding `initial`, ready to be read.
    pub fn new(initial: T) -> Self {
        Self {
            core: ModCore::new(true),
            value: UnsafeCell::new(initial),
        }
    }

    /// A copyable handle for capturing this cell in traced closures.
    ///
    /// The handle is a raw reference: the cell must outlive every
    /// computation that reads or writes through it.
    pub fn ptr(&self) -> ModPtr<T> {
        ModPtr(NonNull::from(self))
    }

    /// Assign `new_value`; if it differs from the current value, notify all
    /// subscribed readers. Writing back the identical value is a no-op and
    /// triggers no propagation.
    pub fn write(&self, new_value: T)
    where
        T: PartialEq,
    {
        #[cfg(debug_assertions)]
        let first_write = !self.core.written.swap(true, Ordering::AcqRel);
        #[cfg(not(debug_assertions))]
        let first_write = false;
        // SAFETY: single-writer contract; no reader dereferences the value
        // concurrently with its writer.
        let slot = unsafe { &mut *self.value.get() };
        if first_write || *slot != new_value {
            *slot = new_value;
            self.core.notify_readers();
        }
    }

    /// Assign `new_value` and notify readers unconditionally.
    ///
    /// The fallback for types whose equality is missing or too expensive
    /// for the short-circuit in [`write`](Mod::write).
    pub fn write_always(&self, new_value: T) {
        #[cfg(debug_assertions)]
        self.core.written.store(true, Ordering::Release);
        // SAFETY: as in `write`.
        unsafe { *self.value.get() = new_value };
        self.core.notify_readers();
    }

    /// Clone out the current value.
    ///
    /// Outside tracing this observes only values produced by completed
    /// writes and propagations. Inside tracing, prefer a read operation so
    /// the dependency is recorded.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        #[cfg(debug_assertions)]
        self.core.assert_written();
        // SAFETY: as in `write`.
        unsafe { (*self.value.get()).clone() }
    }

    /// Number of read nodes currently subscribed to this cell.
    ///
    /// Compacts lazily-removed subscriptions as a side effect, so it must
    /// only be called at a quiescent point. Meant for tests and invariant
    /// checks.
    pub fn reader_count(&self) -> usize {
        self.core.reader_count()
    }

    pub(crate) fn core(&self) -> &ModCore {
        &self.core
    }
}

impl<T> std::fmt::Debug for Mod<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mod").finish_non_exhaustive()
    }
}

/// A copyable raw handle to a [`Mod`].
///
/// Traced closures must be `'static`, so they capture these instead of
/// borrowing cells. Validity is the scope rule: the target cell is either
/// owned by an enclosing trace node (see [`Scope::alloc`](crate::Scope::alloc))
/// or is user-owned and outlives the computation.
pub struct ModPtr<T>(NonNull<Mod<T>>);

impl<T> Clone for ModPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ModPtr<T> {}

// SAFETY: a handle is just an address; all access through it is governed by
// the same contract as `Mod` itself.
unsafe impl<T: Send> Send for ModPtr<T> {}
unsafe impl<T: Send + Sync> Sync for ModPtr<T> {}

impl<T> ModPtr<T> {
    /// See [`Mod::write`].
    pub fn write(&self, new_value: T)
    where
        T: PartialEq,
    {
        // SAFETY: handle validity contract.
        unsafe { self.target() }.write(new_value);
    }

    /// See [`Mod::write_always`].
    pub fn write_always(&self, new_value: T) {
        // SAFETY: handle validity contract.
        unsafe { self.target() }.write_always(new_value);
    }

    /// See [`Mod::get`].
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        // SAFETY: handle validity contract.
        unsafe { self.target() }.get()
    }

    /// Dereference the handle.
    ///
    /// # Safety
    ///
    /// The target cell must still be alive.
    pub(crate) unsafe fn target<'a>(&self) -> &'a Mod<T> {
        self.0.as_ref()
    }
}

impl<T> std::fmt::Debug for ModPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ModPtr").field(&self.0).finish()
    }
}

impl<'a, T> From<&'a Mod<T>> for ModPtr<T> {
    fn from(m: &'a Mod<T>) -> Self {
        m.ptr()
    }
}

/// A contiguous array of modifiables, initialized in parallel.
pub struct ModArray<T> {
    mods: Box<[Mod<T>]>,
}

impl<T> ModArray<T> {
    /// `len` unwritten cells; each must be written before its first read.
    pub fn new(len: usize) -> Self
    where
        T: Default + Send,
    {
        let mods: Vec<Mod<T>> = (0..len).into_par_iter().map(|_| Mod::default()).collect();
        Self {
            mods: mods.into_boxed_slice(),
        }
    }

    /// `len` cells each holding a clone of `initial`, ready to be read.
    pub fn with_value(len: usize, initial: T) -> Self
    where
        T: Clone + Send + Sync,
    {
        let mods: Vec<Mod<T>> = (0..len)
            .into_par_iter()
            .map(|_| Mod::new(initial.clone()))
            .collect();
        Self {
            mods: mods.into_boxed_slice(),
        }
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.mods.len()
    }

    /// True when the array holds no cells.
    pub fn is_empty(&self) -> bool {
        self.mods.is_empty()
    }

    /// Handle to the cell at `index`.
    pub fn ptr(&self, index: usize) -> ModPtr<T> {
        self.mods[index].ptr()
    }

    /// A range view over cells `lo..hi`.
    pub fn range(&self, lo: usize, hi: usize) -> ModRange<T> {
        self.full().slice(lo, hi)
    }

    /// A range view over the whole array.
    pub fn full(&self) -> ModRange<T> {
        ModRange {
            base: NonNull::from(&self.mods[..]).cast::<Mod<T>>(),
            len: self.mods.len(),
        }
    }

    /// Iterate over the cells.
    pub fn iter(&self) -> impl Iterator<Item = &Mod<T>> + '_ {
        self.mods.iter()
    }
}

impl<T> Index<usize> for ModArray<T> {
    type Output = Mod<T>;

    fn index(&self, index: usize) -> &Mod<T> {
        &self.mods[index]
    }
}

/// A copyable half-open view `[lo, hi)` over contiguous modifiables.
///
/// Like [`ModPtr`], a raw reference: the backing cells must outlive every
/// computation reading through the range.
pub struct ModRange<T> {
    base: NonNull<Mod<T>>,
    len: usize,
}

impl<T> Clone for ModRange<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ModRange<T> {}

// SAFETY: as for `ModPtr`.
unsafe impl<T: Send> Send for ModRange<T> {}
unsafe impl<T: Send + Sync> Sync for ModRange<T> {}

impl<T> ModRange<T> {
    /// Number of cells in the range.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the range is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handle to the cell at `index` within the range.
    pub fn ptr(&self, index: usize) -> ModPtr<T> {
        assert!(index < self.len, "mod range index out of bounds");
        // SAFETY: in-bounds offset into the backing allocation.
        unsafe { (*self.base.as_ptr().add(index)).ptr() }
    }

    /// The sub-range `lo..hi` of this range.
    pub fn slice(&self, lo: usize, hi: usize) -> ModRange<T> {
        assert!(lo <= hi && hi <= self.len, "mod range slice out of bounds");
        // SAFETY: in-bounds offset into the backing allocation.
        ModRange {
            base: unsafe { NonNull::new_unchecked(self.base.as_ptr().add(lo)) },
            len: hi - lo,
        }
    }

    /// Dereference the cell at `index`.
    ///
    /// # Safety
    ///
    /// The backing cells must still be alive and `index < len`.
    pub(crate) unsafe fn get<'a>(&self, index: usize) -> &'a Mod<T> {
        debug_assert!(index < self.len);
        &*self.base.as_ptr().add(index)
    }
}

impl<T> std::fmt::Debug for ModRange<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModRange").field("len", &self.len).finish()
    }
}
