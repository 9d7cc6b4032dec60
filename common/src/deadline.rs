use std::time::{Duration, Instant};

/// One-shot timeout owned by the call that armed it.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
    cancelled: bool,
}

impl Deadline {
    pub fn arm(timeout: Duration) -> Self {
        Self {
            expires_at: Instant::now() + timeout,
            cancelled: false,
        }
    }

    pub fn expired(&self) -> bool {
        !self.cancelled && Instant::now() >= self.expires_at
    }

    /// Time left before expiry; `None` once expired or cancelled.
    pub fn remaining(&self) -> Option<Duration> {
        if self.cancelled {
            return None;
        }
        let left = self.expires_at.saturating_duration_since(Instant::now());
        (!left.is_zero()).then_some(left)
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}
