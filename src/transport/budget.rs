/// Consecutive-failure counter for one stream
///
/// Any success resets the run. The budget is spent once `threshold`
/// failures occur back to back.
#[derive(Debug, Clone)]
pub struct ErrorBudget {
    threshold: u32,
    consecutive: u32,
    total: u64,
}

impl ErrorBudget {
    /// Create a budget that is spent after `threshold` consecutive failures
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
            total: 0,
        }
    }

    /// Record a failure; returns `true` once the threshold is reached
    pub fn record_failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.total += 1;
        self.is_exhausted()
    }

    /// Record a success, clearing the current run
    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Whether the current run has reached the threshold
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.consecutive >= self.threshold
    }

    /// Length of the current failure run
    #[must_use]
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Failures recorded over the budget's lifetime
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }
}
