//! Deferred reclamation of retired trace subtrees.
//!
//! When propagation re-executes a read node, the stale sub-trace is not
//! freed on the spot: its read nodes may still be inside the notify-readers
//! iteration of the very write that made them stale. Retired subtrees are
//! instead stashed on a per-worker pile and destroyed together at a
//! quiescent point.
//!
//! [`collect`] is that quiescent-point trigger. Call it between rounds of
//! propagation, and always before dropping input mods, because destroying
//! a pile also unsubscribes its read nodes from the mods they were reading.

use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::node::SpNode;

struct Piles {
    shards: Box<[Mutex<Vec<Box<SpNode>>>]>,
}

static PILES: OnceLock<Piles> = OnceLock::new();

fn piles() -> &'static Piles {
    PILES.get_or_init(|| {
        // One shard per pool worker, plus one for threads outside the pool.
        let shards = rayon::current_num_threads() + 1;
        Piles {
            shards: (0..shards).map(|_| Mutex::new(Vec::new())).collect(),
        }
    })
}

/// Stash a retired subtree on the current worker's pile.
pub(crate) fn retire(node: Box<SpNode>) {
    let piles = piles();
    let worker_shards = piles.shards.len() - 1;
    let slot = match rayon::current_thread_index() {
        Some(i) => i % worker_shards,
        None => worker_shards,
    };
    piles.shards[slot].lock().push(node);
}

/// Destroy every retired subtree.
///
/// Callers must be at a quiescent point: no propagation in flight and no
/// write mid-notification. Destruction unsubscribes the retired read nodes,
/// so every mod they read must still be alive.
pub fn collect() {
    let mut nodes = 0usize;
    for shard in piles().shards.iter() {
        let drained = std::mem::take(&mut *shard.lock());
        nodes += drained.iter().map(|n| n.count_nodes()).sum::<usize>();
        drop(drained);
    }
    if nodes > 0 {
        tracing::debug!(nodes, "reclaimed retired trace nodes");
    }
}

/// Number of trace nodes currently awaiting reclamation.
///
/// Walks the piles; meant for tests and diagnostics at quiescent points.
pub fn retired_nodes() -> usize {
    piles()
        .shards
        .iter()
        .map(|shard| {
            shard
                .lock()
                .iter()
                .map(|n| n.count_nodes())
                .sum::<usize>()
        })
        .sum()
}

/// Approximate bytes held by subtrees awaiting reclamation.
///
/// Walks the piles; meant for tests and diagnostics at quiescent points.
pub fn retired_memory() -> usize {
    piles()
        .shards
        .iter()
        .map(|shard| {
            shard
                .lock()
                .iter()
                .map(|n| n.memory_bytes())
                .sum::<usize>()
        })
        .sum()
}
