//! Run-wide cancellation signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// How a cancellable wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Cancelled,
}

/// Set-once flag shared by every task of a run.
///
/// Cloning yields another handle on the same signal. Once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    token: CancellationToken,
    set: Arc<AtomicBool>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal. Returns `true` only for the call that set it.
    pub fn cancel(&self) -> bool {
        let first = !self.set.swap(true, Ordering::SeqCst);
        self.token.cancel();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal is set.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Sleep for `duration` unless the signal is set first. A signal that is
    /// already set wins over a zero-length wait.
    pub async fn wait_for(&self, duration: Duration) -> WaitOutcome {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => WaitOutcome::Cancelled,
            _ = tokio::time::sleep(duration) => WaitOutcome::Elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_set_once() {
        let signal = CancellationSignal::new();
        let other = signal.clone();
        assert!(!signal.is_cancelled());

        assert!(other.cancel());
        assert!(!signal.cancel());
        assert!(signal.is_cancelled());
        assert!(other.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_elapses_without_cancel() {
        let signal = CancellationSignal::new();
        let start = tokio::time::Instant::now();
        assert_eq!(signal.wait_for(Duration::from_secs(5)).await, WaitOutcome::Elapsed);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_early_on_cancel() {
        let signal = CancellationSignal::new();
        let canceller = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            canceller.cancel();
        });

        let start = tokio::time::Instant::now();
        assert_eq!(
            signal.wait_for(Duration::from_secs(60)).await,
            WaitOutcome::Cancelled
        );
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_already_cancelled_beats_zero_wait() {
        let signal = CancellationSignal::new();
        signal.cancel();
        assert_eq!(signal.wait_for(Duration::ZERO).await, WaitOutcome::Cancelled);
        signal.cancelled().await;
    }
}
