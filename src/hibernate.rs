//! Between-chunk state eviction and the spill-cleanup guard.
//!
//! Hibernation compacts leaf working state, hands freed pages back to the
//! OS, and boots the leaves again before the next chunk. Aggregator spill
//! is a separate lever, pulled before checkpoints and whenever aggregate
//! state exceeds its budget. The guard owns every registered spill
//! cleaner and fires exactly once on any exit path: normal return, error
//! unwind, or SIGINT/SIGTERM via a dedicated listener thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{debug, warn};

use crate::analyze::SpillCleaner;
use crate::error::Result;
use crate::memory::trim_native_allocator;
use crate::repo::Repository;
use crate::runner::Runner;

/// One full hibernation cycle: compact every hibernatable leaf, reclaim
/// native memory, boot the leaves again.
pub fn hibernate_and_boot(runner: &mut Runner, repo: &dyn Repository) -> Result<()> {
    let mut hibernated = 0usize;
    for leaf in runner.leaves_mut() {
        if let Some(h) = leaf.as_hibernatable() {
            h.hibernate()?;
            hibernated += 1;
        }
    }

    repo.release_native_memory();
    trim_native_allocator();

    for leaf in runner.leaves_mut() {
        if let Some(h) = leaf.as_hibernatable() {
            h.boot()?;
        }
    }
    debug!(hibernated, "hibernation cycle complete");
    Ok(())
}

/// Spill aggregators when their combined state exceeds `budget`.
/// A budget of zero means no forced spill. Returns bytes spilled.
pub fn spill_if_over_budget(runner: &mut Runner, budget: u64) -> Result<u64> {
    if budget == 0 {
        return Ok(0);
    }
    let state = runner.aggregator_state_size();
    if state <= budget {
        return Ok(0);
    }
    let spilled = runner.spill_aggregators()?;
    debug!(state, budget, spilled, "aggregator state over budget, spilled");
    trim_native_allocator();
    Ok(spilled)
}

struct GuardInner {
    cleaners: Mutex<Vec<Arc<dyn SpillCleaner>>>,
    cleaned: AtomicBool,
}

impl GuardInner {
    fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        for cleaner in self.cleaners.lock().iter() {
            cleaner.cleanup_spills();
        }
    }
}

/// Runs every registered spill cleaner exactly once, whichever exit path
/// fires first. Dropping the guard covers normal returns and error
/// unwinds; a listener thread covers SIGINT and SIGTERM, re-raising
/// default signal handling after cleanup.
pub struct SpillGuard {
    inner: Arc<GuardInner>,
    signals_handle: Option<signal_hook::iterator::backend::Handle>,
    listener: Option<JoinHandle<()>>,
}

impl SpillGuard {
    /// Install the signal listener and return the guard.
    pub fn install() -> Result<Self> {
        let inner = Arc::new(GuardInner {
            cleaners: Mutex::new(Vec::new()),
            cleaned: AtomicBool::new(false),
        });

        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let handle = signals.handle();
        let thread_inner = Arc::clone(&inner);
        let listener = std::thread::Builder::new()
            .name("spill-guard".into())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    warn!(signal, "signal received, cleaning spills");
                    thread_inner.cleanup();
                    // Hand the signal back to its default disposition so
                    // the process reports the conventional exit status.
                    let _ = signal_hook::low_level::emulate_default_handler(signal);
                }
            })?;

        Ok(Self {
            inner,
            signals_handle: Some(handle),
            listener: Some(listener),
        })
    }

    /// A guard with no signal listener. For tests that exercise the
    /// cleanup path without touching process-global signal state.
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(GuardInner {
                cleaners: Mutex::new(Vec::new()),
                cleaned: AtomicBool::new(false),
            }),
            signals_handle: None,
            listener: None,
        }
    }

    /// Register one cleaner.
    pub fn register(&self, cleaner: Arc<dyn SpillCleaner>) {
        self.inner.cleaners.lock().push(cleaner);
    }

    /// Run cleanup now. Later calls (and the eventual drop) are no-ops.
    pub fn cleanup(&self) {
        self.inner.cleanup();
    }
}

impl Drop for SpillGuard {
    fn drop(&mut self) {
        self.inner.cleanup();
        if let Some(handle) = self.signals_handle.take() {
            handle.close();
        }
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
    }
}
