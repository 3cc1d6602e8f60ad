//! Named mutual exclusion over a store's advisory lock primitive.
//!
//! String keys are mapped to lock ids with 64-bit FNV-1a. Two distinct keys
//! can map to the same id; when both are taken by this process the second is
//! rejected with `LockKeyCollision`. Across processes a collision is not
//! detectable and behaves as contention on a shared lock.

use crate::domain::error::LifecycleError;
use crate::ports::lock_port::AdvisoryLockPort;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a. Stable across processes and releases.
pub fn stable_hash(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Stable lock id for `key`.
pub fn lock_id(key: &str) -> i64 {
    stable_hash(key.as_bytes()) as i64
}

pub fn strategy_lock_key(strategy_id: i64) -> String {
    format!("strategy_lifecycle:{strategy_id}")
}

pub struct LockService {
    backend: Arc<dyn AdvisoryLockPort>,
    /// lock id -> key, for locks held or being acquired by this process.
    held: Mutex<HashMap<i64, String>>,
}

impl LockService {
    pub fn new(backend: Arc<dyn AdvisoryLockPort>) -> Self {
        LockService {
            backend,
            held: Mutex::new(HashMap::new()),
        }
    }

    fn held(&self) -> MutexGuard<'_, HashMap<i64, String>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reserve(&self, key: &str, id: i64) -> Result<(), LifecycleError> {
        let mut held = self.held();
        if let Some(existing) = held.get(&id) {
            if existing == key {
                return Err(LifecycleError::LockAlreadyHeld {
                    key: key.to_string(),
                });
            }
            return Err(LifecycleError::LockKeyCollision {
                key: key.to_string(),
                other: existing.clone(),
                lock_id: id,
            });
        }
        held.insert(id, key.to_string());
        Ok(())
    }

    /// Zero `timeout` is a single non-blocking attempt. Returns `Ok(false)`
    /// when the lock stays held elsewhere.
    pub fn acquire(&self, key: &str, timeout: Duration) -> Result<bool, LifecycleError> {
        let id = lock_id(key);
        self.reserve(key, id)?;

        let attempt = if timeout.is_zero() {
            self.backend.try_lock(id)
        } else {
            self.backend.lock_timeout(id, timeout)
        };
        match attempt {
            Ok(true) => {
                debug!("acquired lock '{key}' (id {id})");
                Ok(true)
            }
            Ok(false) => {
                self.held().remove(&id);
                debug!("lock '{key}' busy after {}ms", timeout.as_millis());
                Ok(false)
            }
            Err(e) => {
                self.held().remove(&id);
                Err(e)
            }
        }
    }

    /// Releasing a key this process does not hold is logged and ignored.
    pub fn release(&self, key: &str) -> Result<(), LifecycleError> {
        let id = lock_id(key);
        {
            let mut held = self.held();
            match held.get(&id) {
                Some(existing) if existing == key => {
                    held.remove(&id);
                }
                _ => {
                    warn!("release of lock '{key}' which is not held by this process");
                    return Ok(());
                }
            }
        }
        if !self.backend.unlock(id)? {
            warn!("store reported lock '{key}' (id {id}) was not held by this session");
        }
        debug!("released lock '{key}' (id {id})");
        Ok(())
    }

    /// Point-in-time check; the answer may be stale by the time it returns.
    pub fn is_locked(&self, key: &str) -> Result<bool, LifecycleError> {
        let id = lock_id(key);
        if self.held().contains_key(&id) {
            return Ok(true);
        }
        if self.backend.try_lock(id)? {
            self.backend.unlock(id)?;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    /// Keys currently held by this process.
    pub fn held_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.held().values().cloned().collect();
        keys.sort();
        keys
    }

    /// Acquire and return a guard that releases on drop. `Ok(None)` on timeout.
    pub fn acquire_guard(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<LockGuard<'_>>, LifecycleError> {
        if self.acquire(key, timeout)? {
            Ok(Some(LockGuard {
                service: self,
                key: key.to_string(),
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Run `f` while holding `key`. The lock is released on every exit path,
    /// including unwinding. Fails with `LockContention` on timeout.
    pub fn with_lock<T, F>(&self, key: &str, timeout: Duration, f: F) -> Result<T, LifecycleError>
    where
        F: FnOnce() -> Result<T, LifecycleError>,
    {
        let guard = self
            .acquire_guard(key, timeout)?
            .ok_or_else(|| LifecycleError::LockContention {
                key: key.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?;
        let result = f();
        guard.release()?;
        result
    }
}

#[must_use = "dropping the guard releases the lock immediately"]
pub struct LockGuard<'a> {
    service: &'a LockService,
    key: String,
    released: bool,
}

impl LockGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release now and surface any store error.
    pub fn release(mut self) -> Result<(), LifecycleError> {
        self.released = true;
        self.service.release(&self.key)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.service.release(&self.key) {
                warn!("failed to release lock '{}': {e}", self.key);
            }
        }
    }
}
