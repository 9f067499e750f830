//! Cooperative cancellation for long-running operations (walk, glob, defrag).
//!
//! A [`CancellationSource`] owns a generation counter; every [`CancellationToken`] it issues
//! captures the generation at issue time and is cancelled the instant [`CancellationSource::cancel`]
//! bumps it, no matter how many tokens are outstanding or which thread is holding them.
//!
//! ## Sparse checking
//!
//! Tight scans over millions of rows only check every `CANCEL_CHECK_INTERVAL` iterations to
//! keep the atomic load off the hot path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Iterations between cancellation checks in a tight loop. A power of two so the check is a
/// bitwise AND rather than a modulo.
pub const CANCEL_CHECK_INTERVAL: usize = 0x10000; // 65,536

/// Issues [`CancellationToken`]s and can cancel every token it has issued, at once, from any
/// thread. A host keeps one of these around for as long as it wants to be able to abort an
/// in-flight `walk`/`glob`/`defrag` it handed a token to.
#[derive(Debug, Default)]
pub struct CancellationSource {
    generation: Arc<AtomicU64>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self {
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Issues a token tied to the current generation. The token is cancelled as soon as `cancel`
    /// is next called on this source, regardless of how many other tokens are outstanding.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            generation: self.generation.clone(),
            version: self.generation.load(Ordering::SeqCst),
        }
    }

    /// Cancels every token this source has ever issued.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// A handle that can observe whether the operation it was issued for has been cancelled.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    generation: Arc<AtomicU64>,
    version: u64,
}

impl CancellationToken {
    /// A token that is never cancelled. Used for sessions that don't wire up cancellation.
    #[inline]
    pub fn noop() -> Self {
        Self {
            generation: Arc::new(AtomicU64::new(0)),
            version: 0,
        }
    }

    /// `Some(())` while still active, `None` once cancelled — shaped so `?` short-circuits.
    #[inline]
    pub fn is_cancelled(&self) -> Option<()> {
        if self.version != self.generation.load(Ordering::SeqCst) {
            None
        } else {
            Some(())
        }
    }

    /// Checks only every `CANCEL_CHECK_INTERVAL` calls; cancellation latency is bounded by that
    /// many iterations.
    #[inline]
    pub fn is_cancelled_sparse(&self, counter: usize) -> Option<()> {
        if counter & (CANCEL_CHECK_INTERVAL - 1) == 0 {
            self.is_cancelled()
        } else {
            Some(())
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::noop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_token_is_never_cancelled() {
        let token = CancellationToken::noop();
        assert!(token.is_cancelled().is_some());
    }

    #[test]
    fn default_is_noop() {
        let token = CancellationToken::default();
        assert!(token.is_cancelled().is_some());
    }

    #[test]
    fn sparse_check_skips_between_intervals() {
        let token = CancellationToken::noop();
        for i in 0..CANCEL_CHECK_INTERVAL * 2 {
            assert!(token.is_cancelled_sparse(i).is_some());
        }
    }

    #[test]
    fn cancelling_the_source_trips_every_issued_token() {
        let source = CancellationSource::new();
        let early = source.token();
        let late = source.token();
        assert!(early.is_cancelled().is_some());

        source.cancel();

        assert!(early.is_cancelled().is_none());
        assert!(late.is_cancelled().is_none());
        // a token issued after cancellation starts fresh at the new generation
        assert!(source.token().is_cancelled().is_some());
    }

    #[test]
    fn cancelling_from_another_thread_is_observed() {
        let source = Arc::new(CancellationSource::new());
        let token = source.token();
        let other = source.clone();
        let handle = std::thread::spawn(move || other.cancel());
        handle.join().unwrap();
        assert!(token.is_cancelled().is_none());
    }
}
