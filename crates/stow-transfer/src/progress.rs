//! Progress reporting and caller-initiated abort

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use stow_core::{StowError, StowResult};

/// Answer of a [`ProgressSink`]: keep going or stop the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressControl {
    Continue,
    Abort,
}

/// Receives `(bytes_completed, bytes_total)` after every transfer decision.
pub trait ProgressSink: Send + Sync {
    fn report(&self, completed: u64, total: u64) -> ProgressControl;
}

impl<F> ProgressSink for F
where
    F: Fn(u64, u64) -> ProgressControl + Send + Sync,
{
    fn report(&self, completed: u64, total: u64) -> ProgressControl {
        self(completed, total)
    }
}

/// Running byte count of one transfer, wired to its sink and cancel token.
pub(crate) struct ProgressTracker {
    completed: u64,
    total: u64,
    sink: Option<Arc<dyn ProgressSink>>,
    cancel: CancellationToken,
}

impl ProgressTracker {
    pub(crate) fn new(
        total: u64,
        sink: Option<Arc<dyn ProgressSink>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            completed: 0,
            total,
            sink,
            cancel,
        }
    }

    pub(crate) fn starting_at(mut self, completed: u64) -> Self {
        self.completed = completed;
        self
    }

    /// Count `bytes` as done and consult the sink.
    ///
    /// An abort answer cancels the transfer's token, so in-flight work
    /// observes it too.
    pub(crate) fn advance(&mut self, bytes: u64) -> StowResult<()> {
        self.completed += bytes;
        if let Some(sink) = &self.sink {
            if sink.report(self.completed, self.total) == ProgressControl::Abort {
                tracing::info!(
                    completed = self.completed,
                    total = self.total,
                    "transfer aborted by progress sink"
                );
                self.cancel.cancel();
                return Err(StowError::Canceled);
            }
        }
        Ok(())
    }

    pub(crate) fn check_canceled(&self) -> StowResult<()> {
        if self.cancel.is_cancelled() {
            return Err(StowError::Canceled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_closure_sink_sees_running_total() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let sink: Arc<dyn ProgressSink> = Arc::new(move |done: u64, total: u64| {
            log.lock().unwrap().push((done, total));
            ProgressControl::Continue
        });

        let mut tracker = ProgressTracker::new(10, Some(sink), CancellationToken::new());
        tracker.advance(4).unwrap();
        tracker.advance(6).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(4, 10), (10, 10)]);
    }

    #[test]
    fn test_abort_cancels_token() {
        let token = CancellationToken::new();
        let sink: Arc<dyn ProgressSink> =
            Arc::new(|done: u64, _: u64| if done > 5 { ProgressControl::Abort } else { ProgressControl::Continue });
        let mut tracker = ProgressTracker::new(10, Some(sink), token.clone());

        tracker.advance(5).unwrap();
        assert!(!token.is_cancelled());
        assert!(matches!(tracker.advance(1), Err(StowError::Canceled)));
        assert!(token.is_cancelled());
        assert!(tracker.check_canceled().is_err());
    }

    #[test]
    fn test_no_sink() {
        let mut tracker = ProgressTracker::new(3, None, CancellationToken::new()).starting_at(1);
        tracker.advance(2).unwrap();
        assert_eq!(tracker.completed, 3);
    }
}
