//! In-process advisory lock registry.
//!
//! Mirrors the session semantics of a relational store's advisory locks:
//! re-entrant per session, invisible ownership across sessions, and release
//! of everything a session holds when it is dropped. Only coordinates threads
//! of one process.

use crate::domain::error::LifecycleError;
use crate::ports::lock_port::AdvisoryLockPort;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Holder {
    session: u64,
    depth: u32,
}

#[derive(Default)]
struct Registry {
    held: Mutex<HashMap<i64, Holder>>,
    freed: Condvar,
    next_session: AtomicU64,
}

impl Registry {
    fn table(&self) -> MutexGuard<'_, HashMap<i64, Holder>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn take(table: &mut HashMap<i64, Holder>, lock_id: i64, session: u64) -> bool {
    match table.get_mut(&lock_id) {
        None => {
            table.insert(lock_id, Holder { session, depth: 1 });
            true
        }
        Some(holder) if holder.session == session => {
            holder.depth += 1;
            true
        }
        Some(_) => false,
    }
}

#[derive(Clone, Default)]
pub struct MemoryLockRegistry {
    inner: Arc<Registry>,
}

impl MemoryLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session. Its locks are released when it is dropped.
    pub fn session(&self) -> MemoryLockSession {
        MemoryLockSession {
            registry: Arc::clone(&self.inner),
            id: self.inner.next_session.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    pub fn is_held(&self, lock_id: i64) -> bool {
        self.inner.table().contains_key(&lock_id)
    }
}

pub struct MemoryLockSession {
    registry: Arc<Registry>,
    id: u64,
}

impl AdvisoryLockPort for MemoryLockSession {
    fn try_lock(&self, lock_id: i64) -> Result<bool, LifecycleError> {
        let mut table = self.registry.table();
        Ok(take(&mut table, lock_id, self.id))
    }

    fn lock_timeout(&self, lock_id: i64, timeout: Duration) -> Result<bool, LifecycleError> {
        let deadline = Instant::now() + timeout;
        let mut table = self.registry.table();
        loop {
            if take(&mut table, lock_id, self.id) {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            table = match self.registry.freed.wait_timeout(table, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn unlock(&self, lock_id: i64) -> Result<bool, LifecycleError> {
        let mut table = self.registry.table();
        let released = match table.get_mut(&lock_id) {
            Some(holder) if holder.session == self.id => {
                holder.depth -= 1;
                if holder.depth == 0 {
                    table.remove(&lock_id);
                }
                true
            }
            _ => false,
        };
        drop(table);
        if released {
            self.registry.freed.notify_all();
        }
        Ok(released)
    }
}

impl Drop for MemoryLockSession {
    fn drop(&mut self) {
        let mut table = self.registry.table();
        table.retain(|_, holder| holder.session != self.id);
        drop(table);
        self.registry.freed.notify_all();
    }
}
