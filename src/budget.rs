use tokio::time::{Duration, Instant};

/// Remaining-time budget shared by every wait of one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    deadline: Option<Instant>,
}

impl Budget {
    /// `None` means no deadline.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn unbounded() -> Self {
        Self { deadline: None }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }

    /// `wait`, shortened to what is left of the budget.
    pub fn cap(&self, wait: Duration) -> Duration {
        match self.remaining() {
            Some(r) => wait.min(r),
            None => wait,
        }
    }

    /// Resolves when the budget runs out; never for an unbounded budget.
    pub async fn expired(&self) {
        match self.deadline {
            Some(d) => tokio::time::sleep_until(d).await,
            None => std::future::pending::<()>().await,
        }
    }
}
