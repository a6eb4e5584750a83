//! In-memory coordination store
//!
//! Keeps keys and leases in process. Leases never expire on their own;
//! call [`MemoryStore::expire_lease`] to simulate TTL expiry or revocation.
//! Faults can be queued per operation with [`MemoryStore::fail_next`].

use super::{CoordinationStore, LeaseId};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Store operations, used for fault injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GrantLease,
    KeepAlive,
    Put,
    Delete,
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

#[derive(Debug, Default)]
struct Inner {
    last_lease: i64,
    leases: HashMap<LeaseId, i64>,
    keys: HashMap<String, Entry>,
    faults: HashMap<StoreOp, VecDeque<StoreError>>,
    calls: HashMap<StoreOp, usize>,
}

impl Inner {
    /// Count the call and pop a queued fault for it, if any
    fn enter(&mut self, op: StoreOp) -> Result<(), StoreError> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Shared in-process store. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next call of `op` fail with `err`. Faults queue up in order.
    pub fn fail_next(&self, op: StoreOp, err: StoreError) {
        self.lock().faults.entry(op).or_default().push_back(err);
    }

    /// Drop a lease and every key bound to it, as if its TTL ran out.
    pub fn expire_lease(&self, lease: LeaseId) {
        let mut inner = self.lock();
        inner.leases.remove(&lease);
        inner.keys.retain(|_, entry| entry.lease != Some(lease));
    }

    /// Current value stored under `key`
    pub fn value(&self, key: &str) -> Option<String> {
        self.lock().keys.get(key).map(|entry| entry.value.clone())
    }

    /// Lease the key is bound to
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.lock().keys.get(key).and_then(|entry| entry.lease)
    }

    /// Granted leases that have not expired
    pub fn live_leases(&self) -> usize {
        self.lock().leases.len()
    }

    /// TTL a lease was granted with
    pub fn lease_ttl(&self, lease: LeaseId) -> Option<i64> {
        self.lock().leases.get(&lease).copied()
    }

    /// Number of times `op` was invoked, failed calls included
    pub fn calls(&self, op: StoreOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn grant_lease(&self, ttl_secs: i64, _timeout: Duration) -> Result<LeaseId, StoreError> {
        let mut inner = self.lock();
        inner.enter(StoreOp::GrantLease)?;
        if ttl_secs <= 0 {
            return Err(StoreError::rpc("grant_lease", "lease TTL must be positive"));
        }
        inner.last_lease += 1;
        let lease = LeaseId::new(inner.last_lease)
            .ok_or_else(|| StoreError::InvalidResponse("lease id overflow".to_string()))?;
        inner.leases.insert(lease, ttl_secs);
        Ok(lease)
    }

    async fn keep_alive_once(&self, lease: LeaseId, _timeout: Duration) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.enter(StoreOp::KeepAlive)?;
        if inner.leases.contains_key(&lease) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease))
        }
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
        _timeout: Duration,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.enter(StoreOp::Put)?;
        if let Some(lease) = lease {
            if !inner.leases.contains_key(&lease) {
                return Err(StoreError::rpc("put", "requested lease not found"));
            }
        }
        inner.keys.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str, _timeout: Duration) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.enter(StoreOp::Delete)?;
        inner.keys.remove(key);
        Ok(())
    }
}
