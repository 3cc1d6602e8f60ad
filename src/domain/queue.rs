//! Idempotent, retryable operation queue over an `OperationStore`.
//!
//! # Semantics
//!
//! - `enqueue` is keyed by the caller's idempotency key. An existing key returns
//!   its id; a `failed` operation with retries left is put back to `pending`.
//! - `dequeue` and `claim` take ownership with one compare-and-swap update and
//!   a lease. Losing the race yields `None`/`false`, never a shared claim.
//! - `fail` counts a retry; exhausting `max_retries` leaves the operation in
//!   terminal `failed`.
//! - `complete` is terminal and idempotent.

use crate::domain::error::LifecycleError;
use crate::domain::operation::{EnqueueRequest, Operation, OperationStatus};
use crate::ports::clock_port::Clock;
use crate::ports::operation_store_port::OperationStore;
use chrono::Duration;
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;

pub const DEFAULT_LEASE_SECS: i64 = 300;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueSettings {
    pub lease: Duration,
    pub max_retries: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            lease: Duration::seconds(DEFAULT_LEASE_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

pub struct OperationQueue {
    store: Arc<dyn OperationStore>,
    clock: Arc<dyn Clock>,
    settings: QueueSettings,
}

impl OperationQueue {
    pub fn new(store: Arc<dyn OperationStore>, clock: Arc<dyn Clock>, settings: QueueSettings) -> Self {
        OperationQueue {
            store,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> QueueSettings {
        self.settings
    }

    pub fn enqueue(&self, request: &EnqueueRequest) -> Result<i64, LifecycleError> {
        let now = self.clock.now();
        let max_retries = request.max_retries.unwrap_or(self.settings.max_retries);
        if let Some(id) = self.store.insert_if_absent(request, max_retries, now)? {
            info!(
                "enqueued operation {id} ({}) key={}",
                request.payload.kind(),
                request.idempotency_key
            );
            return Ok(id);
        }

        let existing = self
            .store
            .find_by_key(&request.idempotency_key)?
            .ok_or_else(|| LifecycleError::DatabaseQuery {
                reason: format!(
                    "operation with key '{}' vanished after conflict",
                    request.idempotency_key
                ),
            })?;
        // `failed` is only written once retries are exhausted, so a matched
        // operation in any status is returned as is.
        debug!(
            "enqueue of key {} matched existing operation {} ({})",
            request.idempotency_key, existing.id, existing.status
        );
        Ok(existing.id)
    }

    /// Claim the next eligible operation. `Ok(None)` when the queue is empty
    /// or another worker claimed the candidate first.
    pub fn dequeue(&self) -> Result<Option<Operation>, LifecycleError> {
        let now = self.clock.now();
        let Some(id) = self.store.next_candidate(now)? else {
            return Ok(None);
        };
        if !self.store.claim(id, now, now + self.settings.lease)? {
            debug!("lost claim race for operation {id}");
            return Ok(None);
        }
        self.store.get(id)
    }

    /// Claim a specific operation. `Ok(false)` if it is not claimable.
    pub fn claim(&self, id: i64) -> Result<bool, LifecycleError> {
        let now = self.clock.now();
        self.store.claim(id, now, now + self.settings.lease)
    }

    pub fn complete(&self, id: i64, result: &Value) -> Result<(), LifecycleError> {
        if self.store.complete(id, result, self.clock.now())? {
            info!("operation {id} completed");
            return Ok(());
        }
        match self.store.get(id)? {
            Some(op) if op.status == OperationStatus::Completed => {
                debug!("operation {id} already completed");
                Ok(())
            }
            Some(op) => {
                warn!("operation {id} not completed, status is {}", op.status);
                Ok(())
            }
            None => Err(LifecycleError::OperationNotFound { id }),
        }
    }

    /// Record a failed attempt and return the resulting status.
    pub fn fail(&self, id: i64, error: &str) -> Result<OperationStatus, LifecycleError> {
        match self.store.record_failure(id, error, self.clock.now())? {
            Some(OperationStatus::Failed) => {
                warn!("operation {id} failed permanently: {error}");
                Ok(OperationStatus::Failed)
            }
            Some(status) => {
                warn!("operation {id} failed, will retry: {error}");
                Ok(status)
            }
            None => {
                let op = self
                    .store
                    .get(id)?
                    .ok_or(LifecycleError::OperationNotFound { id })?;
                warn!(
                    "ignoring failure for operation {id} in status {}: {error}",
                    op.status
                );
                Ok(op.status)
            }
        }
    }

    /// Cancel a pending operation. `Ok(false)` if it was no longer pending.
    pub fn cancel(&self, id: i64) -> Result<bool, LifecycleError> {
        let cancelled = self.store.cancel(id, self.clock.now())?;
        if cancelled {
            info!("operation {id} cancelled");
        }
        Ok(cancelled)
    }

    pub fn is_completed(&self, id: i64) -> Result<bool, LifecycleError> {
        Ok(self
            .store
            .get(id)?
            .is_some_and(|op| op.status == OperationStatus::Completed))
    }

    /// Stored result of a completed operation.
    pub fn get_result(&self, id: i64) -> Result<Option<Value>, LifecycleError> {
        let op = self
            .store
            .get(id)?
            .ok_or(LifecycleError::OperationNotFound { id })?;
        Ok(if op.status == OperationStatus::Completed {
            op.result
        } else {
            None
        })
    }

    pub fn get(&self, id: i64) -> Result<Option<Operation>, LifecycleError> {
        self.store.get(id)
    }

    /// Return expired in-progress leases to `pending`. Run at startup.
    pub fn release_stuck_locks(&self) -> Result<usize, LifecycleError> {
        let released = self.store.release_expired(self.clock.now())?;
        if released > 0 {
            warn!("recovered {released} operation(s) with expired leases");
        }
        Ok(released)
    }

    pub fn list(&self, status: Option<OperationStatus>) -> Result<Vec<Operation>, LifecycleError> {
        self.store.list(status)
    }
}
