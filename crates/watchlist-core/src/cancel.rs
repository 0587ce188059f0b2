use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pipeline stages at which a task may be abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decode,
    Locate,
    Crop,
    Embed,
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Decode => "decode",
            Stage::Locate => "locate",
            Stage::Crop => "crop",
            Stage::Embed => "embed",
            Stage::Persist => "persist",
        };
        f.write_str(name)
    }
}

/// Why a task stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled(Stage),
    DeadlineExceeded(Stage),
}

/// Shared cancellation flag plus an optional run-time budget.
///
/// Clones observe the same flag, so the submitter keeps one half and the
/// worker checks the other between stages. The budget only starts counting
/// once the worker calls [`CancelToken::start`]; time spent waiting in a
/// queue is not charged to the task.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::default(),
            timeout: Some(timeout),
            deadline: None,
        }
    }

    /// Start the clock. A timeout too large to represent means no deadline.
    pub fn start(&mut self) {
        self.deadline = self
            .timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));
    }

    /// A started copy of this token.
    pub fn started(mut self) -> Self {
        self.start();
        self
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fail if the task was cancelled or ran past its deadline.
    pub fn checkpoint(&self, stage: Stage) -> Result<(), Interrupt> {
        if self.is_cancelled() {
            return Err(Interrupt::Cancelled(stage));
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Interrupt::DeadlineExceeded(stage)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_token_passes() {
        assert_eq!(CancelToken::new().checkpoint(Stage::Decode), Ok(()));
    }

    #[test]
    fn test_cancel_is_seen_by_clones() {
        let token = CancelToken::new();
        let worker_side = token.clone();
        token.cancel();
        assert_eq!(
            worker_side.checkpoint(Stage::Embed),
            Err(Interrupt::Cancelled(Stage::Embed))
        );
    }

    #[test]
    fn test_deadline_exceeded_once_started() {
        let token = CancelToken::with_timeout(Duration::ZERO).started();
        assert_eq!(
            token.checkpoint(Stage::Locate),
            Err(Interrupt::DeadlineExceeded(Stage::Locate))
        );
    }

    #[test]
    fn test_clock_does_not_run_before_start() {
        let mut token = CancelToken::with_timeout(Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(token.checkpoint(Stage::Decode), Ok(()));

        token.start();
        assert_eq!(token.checkpoint(Stage::Decode), Ok(()));
    }

    #[test]
    fn test_huge_timeout_means_no_deadline() {
        let token = CancelToken::with_timeout(Duration::from_secs(u64::MAX)).started();
        assert_eq!(token.checkpoint(Stage::Persist), Ok(()));
    }
}
