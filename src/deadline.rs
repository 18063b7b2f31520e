//! Per-request time budget.

use crate::error::{IdentifyError, Result, Stage};
use std::time::{Duration, Instant};

/// Time budget for one identify request. Checked before every store round
/// trip; lock waits are bounded by it too.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            expires_at: Instant::now() + budget,
        }
    }

    pub fn instant(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn check(&self, stage: Stage) -> Result<()> {
        if self.is_expired() {
            return Err(IdentifyError::Timeout { stage });
        }
        Ok(())
    }
}
