use std::time::Duration;

use tokio::time::Instant;

use crate::{errors::IngestorError, Result};

/// Point in time after which a batch is abandoned. `Deadline::none()` never expires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    /// `None` is no deadline
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        timeout.map(Self::after).unwrap_or_default()
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Fails with [`IngestorError::Cancelled`] once expired
    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            Err(IngestorError::Cancelled)
        } else {
            Ok(())
        }
    }
}
