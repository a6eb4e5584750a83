//! Coordination Store Contract
//!
//! The lifecycle engine talks to the coordination store only through
//! [`CoordinationStore`]. Any store that can grant leases, keep them alive,
//! write a key bound to a lease and delete a key can back a registry:
//! - `etcd`: etcd v3 through `etcd-client`
//! - `memory`: in-process store for tests and etcd-less hosts

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::{MemoryStore, StoreOp};

use crate::error::StoreError;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Lease handle granted by the store. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(i64);

impl LeaseId {
    /// Wrap a raw store lease id; `None` for ids that do not name a lease
    pub fn new(raw: i64) -> Option<Self> {
        (raw > 0).then_some(Self(raw))
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // etcd prints lease ids in hex
        write!(f, "{:x}", self.0)
    }
}

/// Operations the registration lifecycle needs from a coordination store.
///
/// Every call carries its own deadline; implementations must give up with
/// [`StoreError::Timeout`] once it passes.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Short name of the backing store, e.g. `"etcd"`
    fn kind(&self) -> &'static str;

    /// Grant a lease that expires after `ttl_secs` without renewal.
    async fn grant_lease(&self, ttl_secs: i64, timeout: Duration) -> Result<LeaseId, StoreError>;

    /// Reset the remaining TTL of `lease` once.
    ///
    /// Must return [`StoreError::LeaseNotFound`] when the lease has expired
    /// or was revoked.
    async fn keep_alive_once(&self, lease: LeaseId, timeout: Duration) -> Result<(), StoreError>;

    /// Write `value` under `key`, bound to `lease` when given.
    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
        timeout: Duration,
    ) -> Result<(), StoreError>;

    /// Remove `key`. Deleting an absent key succeeds.
    async fn delete(&self, key: &str, timeout: Duration) -> Result<(), StoreError>;
}

/// Run a store future under `timeout`, mapping expiry to [`StoreError::Timeout`].
pub(crate) async fn with_deadline<T, F>(
    op: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { op, after: timeout }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_id_must_be_positive() {
        assert!(LeaseId::new(0).is_none());
        assert!(LeaseId::new(-3).is_none());
        assert_eq!(LeaseId::new(42).map(|l| l.get()), Some(42));
    }

    #[test]
    fn test_lease_id_display_hex() {
        assert_eq!(LeaseId::new(255).unwrap().to_string(), "ff");
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_times_out() {
        let result: Result<(), StoreError> =
            with_deadline("grant_lease", Duration::from_secs(5), async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert_eq!(
            result,
            Err(StoreError::Timeout {
                op: "grant_lease",
                after: Duration::from_secs(5)
            })
        );
    }

    #[tokio::test]
    async fn test_with_deadline_passes_result_through() {
        let result = with_deadline("put", Duration::from_secs(5), async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }
}
