//! Registration Lifecycle
//!
//! Lease acquisition, renewal and shutdown for one registered node.
//!
//! [`Renewal::renew`] is the single registration primitive. It runs once
//! synchronously when the node registers and then on every tick of the
//! refresher task:
//! 1. Lease held: keep it alive once. Done on success, fall through on
//!    "lease not found", fail on anything else.
//! 2. Grant a new lease with the configured TTL.
//! 3. Write the advertised address under the node key, bound to the lease.
//! 4. Record the new lease.
//!
//! There is no backoff. A failed renewal is retried on the next tick, so a
//! store outage shorter than the TTL heals without the record disappearing.

use crate::error::StoreError;
use crate::store::{CoordinationStore, LeaseId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

/// Lifecycle of a registry instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RegistrationState {
    /// Constructed, `register` not called yet
    Unregistered,
    /// First synchronous registration in progress
    Registering,
    /// Registered, refresher running
    Active,
    /// Deregistration in progress
    Stopping,
    /// Refresher stopped and key deleted (or deletion attempted)
    Deregistered,
    /// First registration failed; no refresher was started
    Failed,
}

impl RegistrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RegistrationState::Deregistered | RegistrationState::Failed
        )
    }
}

/// Result of one successful renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// The held lease was refreshed
    KeptAlive(LeaseId),
    /// A new lease was granted and the key rewritten under it
    Granted {
        lease: LeaseId,
        previous: Option<LeaseId>,
    },
}

impl RenewalOutcome {
    pub fn lease(&self) -> LeaseId {
        match self {
            RenewalOutcome::KeptAlive(lease) => *lease,
            RenewalOutcome::Granted { lease, .. } => *lease,
        }
    }
}

/// One-shot stop signal for refresher tasks.
///
/// Only the first [`trigger`](ShutdownSignal::trigger) has an effect; later
/// calls are no-ops.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    stopped: Arc<AtomicBool>,
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal shutdown. Returns `true` for the call that actually fired.
    pub fn trigger(&self) -> bool {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.token.cancel();
            true
        } else {
            false
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Resolves once the signal has fired
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Renewal state for one node key. The only writer of the lease handle.
pub struct Renewal<S> {
    store: Arc<S>,
    key: String,
    value: String,
    ttl_secs: i64,
    timeout: Duration,
    lease: Option<LeaseId>,
    lease_tx: watch::Sender<Option<LeaseId>>,
}

impl<S: CoordinationStore> Renewal<S> {
    pub fn new(
        store: Arc<S>,
        key: String,
        value: String,
        ttl_secs: i64,
        timeout: Duration,
        lease_tx: watch::Sender<Option<LeaseId>>,
    ) -> Self {
        Self {
            store,
            key,
            value,
            ttl_secs,
            timeout,
            lease: None,
            lease_tx,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lease currently held, if any
    pub fn lease(&self) -> Option<LeaseId> {
        self.lease
    }

    /// Register or refresh the node's record.
    pub async fn renew(&mut self) -> Result<RenewalOutcome, StoreError> {
        let previous = self.lease;

        if let Some(lease) = previous {
            match self.store.keep_alive_once(lease, self.timeout).await {
                Ok(()) => {
                    debug!(lease = %lease, key = %self.key, "Lease kept alive");
                    return Ok(RenewalOutcome::KeptAlive(lease));
                }
                Err(StoreError::LeaseNotFound(_)) => {
                    warn!(
                        lease = %lease,
                        key = %self.key,
                        "Lease expired or revoked, granting a new one"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let lease = self.store.grant_lease(self.ttl_secs, self.timeout).await?;
        debug!(lease = %lease, ttl = self.ttl_secs, "Lease granted");

        self.store
            .put(&self.key, &self.value, Some(lease), self.timeout)
            .await?;

        self.lease = Some(lease);
        self.lease_tx.send_replace(Some(lease));

        info!(
            key = %self.key,
            address = %self.value,
            lease = %lease,
            ttl = self.ttl_secs,
            "Node registered"
        );

        Ok(RenewalOutcome::Granted { lease, previous })
    }
}

/// Spawn the background task that calls [`Renewal::renew`] every `interval`
/// until `shutdown` fires.
///
/// A renewal that has started always runs to completion (bounded by the
/// store timeout); the shutdown signal is only observed between ticks.
/// Renewal errors are logged and retried on the next tick.
pub fn spawn_refresher<S: CoordinationStore>(
    mut renewal: Renewal<S>,
    interval: Duration,
    shutdown: ShutdownSignal,
    span: Span,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // Skip first immediate tick

            debug!(interval = ?interval, "Refresher started");

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        debug!("Refresher received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {}
                }

                if let Err(e) = renewal.renew().await {
                    error!(
                        key = %renewal.key(),
                        error = %e,
                        "Registration renewal failed, retrying next interval"
                    );
                }
            }

            debug!("Refresher stopped");
        }
        .instrument(span),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreOp};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn renewal(store: &MemoryStore) -> (Renewal<MemoryStore>, watch::Receiver<Option<LeaseId>>) {
        let (tx, rx) = watch::channel(None);
        let renewal = Renewal::new(
            Arc::new(store.clone()),
            "orders_node-1".to_string(),
            "10.1.160.78:8080".to_string(),
            30,
            TIMEOUT,
            tx,
        );
        (renewal, rx)
    }

    #[test]
    fn test_state_display_and_terminal() {
        assert_eq!(RegistrationState::Deregistered.to_string(), "deregistered");
        assert!(RegistrationState::Failed.is_terminal());
        assert!(RegistrationState::Deregistered.is_terminal());
        assert!(!RegistrationState::Active.is_terminal());
    }

    #[test]
    fn test_shutdown_signal_fires_once() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        assert!(!signal.is_triggered());
        assert!(signal.trigger());
        assert!(!clone.trigger());
        assert!(!signal.trigger());
        assert!(clone.is_triggered());
    }

    #[tokio::test]
    async fn test_first_renew_grants_and_writes() {
        let store = MemoryStore::new();
        let (mut renewal, rx) = renewal(&store);

        let outcome = renewal.renew().await.unwrap();
        let lease = outcome.lease();
        assert_eq!(
            outcome,
            RenewalOutcome::Granted {
                lease,
                previous: None
            }
        );
        assert_eq!(store.value("orders_node-1").as_deref(), Some("10.1.160.78:8080"));
        assert_eq!(store.lease_of("orders_node-1"), Some(lease));
        assert_eq!(store.lease_ttl(lease), Some(30));
        assert_eq!(*rx.borrow(), Some(lease));
    }

    #[tokio::test]
    async fn test_keep_alive_success_keeps_lease() {
        let store = MemoryStore::new();
        let (mut renewal, _rx) = renewal(&store);
        let lease = renewal.renew().await.unwrap().lease();

        for _ in 0..3 {
            assert_eq!(renewal.renew().await.unwrap(), RenewalOutcome::KeptAlive(lease));
        }
        assert_eq!(renewal.lease(), Some(lease));
        assert_eq!(store.calls(StoreOp::GrantLease), 1);
        assert_eq!(store.calls(StoreOp::Put), 1);
        assert_eq!(store.calls(StoreOp::KeepAlive), 3);
    }

    #[tokio::test]
    async fn test_expired_lease_is_regranted() {
        let store = MemoryStore::new();
        let (mut renewal, rx) = renewal(&store);
        let old = renewal.renew().await.unwrap().lease();

        store.expire_lease(old);
        assert_eq!(store.value("orders_node-1"), None);

        let outcome = renewal.renew().await.unwrap();
        let new = outcome.lease();
        assert_ne!(new, old);
        assert_eq!(
            outcome,
            RenewalOutcome::Granted {
                lease: new,
                previous: Some(old)
            }
        );
        assert_eq!(store.lease_of("orders_node-1"), Some(new));
        assert_eq!(store.value("orders_node-1").as_deref(), Some("10.1.160.78:8080"));
        assert_eq!(*rx.borrow(), Some(new));
    }

    #[tokio::test]
    async fn test_transient_keep_alive_error_does_not_regrant() {
        let store = MemoryStore::new();
        let (mut renewal, _rx) = renewal(&store);
        let lease = renewal.renew().await.unwrap().lease();

        store.fail_next(StoreOp::KeepAlive, StoreError::rpc("keep_alive", "unavailable"));
        let err = renewal.renew().await.unwrap_err();
        assert!(!err.is_lease_not_found());
        assert_eq!(renewal.lease(), Some(lease));
        assert_eq!(store.calls(StoreOp::GrantLease), 1);

        // The next attempt goes through the keep-alive branch again
        assert_eq!(renewal.renew().await.unwrap(), RenewalOutcome::KeptAlive(lease));
    }

    #[tokio::test]
    async fn test_grant_failure_commits_nothing() {
        let store = MemoryStore::new();
        let (mut renewal, rx) = renewal(&store);

        store.fail_next(StoreOp::GrantLease, StoreError::rpc("grant_lease", "no leader"));
        assert!(renewal.renew().await.is_err());
        assert_eq!(renewal.lease(), None);
        assert_eq!(*rx.borrow(), None);
        assert_eq!(store.calls(StoreOp::Put), 0);
        assert_eq!(store.value("orders_node-1"), None);
    }

    #[tokio::test]
    async fn test_put_failure_leaves_stale_lease_for_next_cycle() {
        let store = MemoryStore::new();
        let (mut renewal, _rx) = renewal(&store);
        let old = renewal.renew().await.unwrap().lease();

        store.expire_lease(old);
        store.fail_next(StoreOp::Put, StoreError::rpc("put", "connection reset"));
        assert!(renewal.renew().await.is_err());
        assert_eq!(renewal.lease(), Some(old));

        let recovered = renewal.renew().await.unwrap();
        assert!(matches!(
            recovered,
            RenewalOutcome::Granted { previous: Some(p), .. } if p == old
        ));
        assert_eq!(store.lease_of("orders_node-1"), Some(recovered.lease()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresher_ticks_on_interval_until_shutdown() {
        let store = MemoryStore::new();
        let (mut renewal, _rx) = renewal(&store);
        renewal.renew().await.unwrap();

        let shutdown = ShutdownSignal::new();
        let handle = spawn_refresher(
            renewal,
            Duration::from_secs(10),
            shutdown.clone(),
            Span::none(),
        );

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(store.calls(StoreOp::KeepAlive), 3);

        assert!(shutdown.trigger());
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(store.calls(StoreOp::KeepAlive), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresher_absorbs_errors_and_recovers() {
        let store = MemoryStore::new();
        let (mut renewal, rx) = renewal(&store);
        let old = renewal.renew().await.unwrap().lease();

        let shutdown = ShutdownSignal::new();
        let handle = spawn_refresher(
            renewal,
            Duration::from_secs(10),
            shutdown.clone(),
            Span::none(),
        );

        // Lease lost upstream and the store briefly refuses grants
        store.expire_lease(old);
        store.fail_next(StoreOp::GrantLease, StoreError::rpc("grant_lease", "unavailable"));

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(store.value("orders_node-1"), None);
        assert!(!handle.is_finished());

        tokio::time::sleep(Duration::from_secs(10)).await;
        let new = store.lease_of("orders_node-1").unwrap();
        assert_ne!(new, old);
        assert_eq!(*rx.borrow(), Some(new));

        shutdown.trigger();
        handle.await.unwrap();
    }
}
