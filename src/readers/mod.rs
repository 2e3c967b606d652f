//! Concurrent reader sets.
//!
//! Every modifiable carries a set of the read nodes subscribed to it. The
//! common case is zero or one reader, so the set is a tagged machine word:
//! zero means empty, an untagged pointer is a single inline reader, and a
//! tagged pointer (low bit set) is the root of a concurrent structure
//! holding many readers.
//!
//! Two representations of the many-readers state exist. The default is a
//! concurrent binary search tree keyed by a hash of the reader address;
//! the `list-reader-set` cargo feature swaps in a lazily-compacted linked
//! list instead. Both expose the same interface:
//!
//! - `insert` / `remove` may race freely with each other;
//! - `for_all` (iteration) must not run concurrently with either, which the
//!   runtime guarantees by only iterating from a mod's single writer.
//!
//! Removal is lazy in both: a tombstone flag is set, and dead entries are
//! physically discarded during the next iteration.

#[cfg(not(feature = "list-reader-set"))]
mod tree;
#[cfg(not(feature = "list-reader-set"))]
pub(crate) use tree::ReaderSet;

#[cfg(feature = "list-reader-set")]
mod list;
#[cfg(feature = "list-reader-set")]
pub(crate) use list::ReaderSet;

/// Low bit of the state word: set when it points at the many-readers
/// structure rather than a single inline reader.
const TAG: usize = 1;
