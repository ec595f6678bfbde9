//! Counting semaphore bounding concurrent session starts.
//!
//! Waiters are served in arrival order, and a permit returns its slot when
//! dropped, so every exit path of a start releases it.

use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;

use crate::error::SessionError;

#[derive(Clone, Debug)]
pub struct Semaphore {
    permits: Arc<tokio::sync::Semaphore>,
    limit: usize,
}

/// One held slot.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

impl Permit {
    pub fn release(self) {}
}

impl Semaphore {
    /// A limit of zero is treated as one.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(tokio::sync::Semaphore::new(limit)),
            limit,
        }
    }

    pub async fn acquire(&self) -> Result<Permit, SessionError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SessionError::ShuttingDown)?;
        Ok(Permit { _permit: permit })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots currently held.
    pub fn active(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    /// Fail all current and future waiters.
    pub fn close(&self) {
        self.permits.close();
    }
}
