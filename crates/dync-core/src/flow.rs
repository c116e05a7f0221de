//! Credit-based flow control constants and the server's aggregate debt
//! tracker.
//!
//! "Credit" is how many chunks a client may send before it must wait for
//! the server to grant more; "debt" is the server's running sum of credit
//! handed out across all active uploads, bounding how much unacknowledged
//! data the server has promised to buffer. Both concepts and their default
//! values come straight from the original implementation's server module.

/// Tunable flow-control parameters. The `Default` impl reproduces the
/// original implementation's module-level constants exactly.
#[derive(Debug, Clone, Copy)]
pub struct FlowConfig {
    /// Size, in bytes, of each `post-chunk` payload the client should send.
    pub chunk_size: u32,
    /// Idle seconds after which a session with no activity is canceled.
    pub timeout_secs: u64,
    /// Distribution pauses once aggregate debt reaches this ceiling.
    pub max_debt: u32,
    /// Distribution resumes once aggregate debt falls below this floor.
    pub min_debt: u32,
    /// No single upload may hold more credit than this.
    pub max_credit: u32,
    /// An upload already holding at least this much credit is skipped
    /// during a distribution pass; it doesn't need more yet.
    pub transfer_threshold: u32,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            chunk_size: 120 * 1024,
            timeout_secs: 3600,
            max_debt: 500,
            min_debt: 300,
            max_credit: 200,
            transfer_threshold: 100,
        }
    }
}

/// Tracks the server's aggregate outstanding credit across all sessions.
#[derive(Debug, Default)]
pub struct DebtTracker {
    debt: u32,
}

impl DebtTracker {
    /// Current aggregate debt.
    #[must_use]
    pub fn debt(&self) -> u32 {
        self.debt
    }

    /// Whether a new distribution pass should run, per `serve`'s
    /// `debt < MIN_DEBT` check.
    #[must_use]
    pub fn should_distribute(&self, config: &FlowConfig) -> bool {
        self.debt < config.min_debt
    }

    /// Credit available to grant a brand-new upload: as much as
    /// `MAX_CREDIT` allows, bounded by remaining room under `MAX_DEBT`.
    #[must_use]
    pub fn initial_credit(&self, config: &FlowConfig) -> u32 {
        config
            .max_credit
            .min(config.max_debt.saturating_sub(self.debt))
    }

    /// Record newly granted credit.
    pub fn add(&mut self, amount: u32) {
        self.debt += amount;
    }

    /// Record credit returned to the server (consumed, canceled, or timed
    /// out).
    pub fn subtract(&mut self, amount: u32) {
        self.debt = self.debt.saturating_sub(amount);
    }

    /// Remaining room under `MAX_DEBT` before distribution must stop.
    #[must_use]
    pub fn headroom(&self, config: &FlowConfig) -> u32 {
        config.max_debt.saturating_sub(self.debt)
    }
}
