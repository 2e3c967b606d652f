//! Shared test scaffolding.

use parking_lot::{Mutex, MutexGuard};

static LOCK: Mutex<()> = Mutex::new(());

/// Propagation and GC interact through process-global piles, so tests that
/// propagate or collect run one at a time. Each such test collects before
/// releasing the guard, leaving the piles empty for the next one.
pub fn quiesce() -> MutexGuard<'static, ()> {
    LOCK.lock()
}
