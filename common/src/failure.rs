use log::warn;

use crate::config::FailureThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Too many rejected requests; drop any stuck connection.
    Soft,
    /// Link or server unusable; power-cycle the modem.
    Hard,
}

#[derive(Debug, Clone)]
pub struct FailureTracker {
    thresholds: FailureThresholds,
    comm_failures: u32,
    server_failures: u32,
    rejected_attempts: u32,
}

impl FailureTracker {
    pub fn new(thresholds: FailureThresholds) -> Self {
        Self {
            thresholds,
            comm_failures: 0,
            server_failures: 0,
            rejected_attempts: 0,
        }
    }

    pub fn comm_failures(&self) -> u32 {
        self.comm_failures
    }

    pub fn server_failures(&self) -> u32 {
        self.server_failures
    }

    pub fn rejected_attempts(&self) -> u32 {
        self.rejected_attempts
    }

    pub fn record_comm_failure(&mut self) {
        self.comm_failures = self.comm_failures.saturating_add(1);
    }

    pub fn record_server_failure(&mut self) {
        self.server_failures = self.server_failures.saturating_add(1);
    }

    /// Pushes the server counter straight to its threshold.
    pub fn saturate_server_failures(&mut self) {
        self.server_failures = self.server_failures.max(self.thresholds.max_server_failures);
    }

    pub fn record_rejected(&mut self) {
        self.rejected_attempts = self.rejected_attempts.saturating_add(1);
    }

    pub fn reset_rejected(&mut self) {
        self.rejected_attempts = 0;
    }

    pub fn server_ok(&mut self) {
        self.server_failures = 0;
    }

    pub fn reset(&mut self) {
        self.comm_failures = 0;
        self.server_failures = 0;
        self.rejected_attempts = 0;
    }

    /// Evaluates the thresholds once and clears whatever triggered.
    pub fn check(&mut self) -> Option<Recovery> {
        if self.server_failures >= self.thresholds.max_server_failures
            || self.comm_failures >= self.thresholds.max_comm_failures
        {
            warn!(
                "failure threshold reached (comm {}, server {}); hard recovery",
                self.comm_failures, self.server_failures
            );
            self.reset();
            return Some(Recovery::Hard);
        }
        if self.rejected_attempts >= self.thresholds.max_rejected_attempts {
            warn!(
                "{} requests rejected while offline; soft recovery",
                self.rejected_attempts
            );
            self.rejected_attempts = 0;
            return Some(Recovery::Soft);
        }
        None
    }
}
