//! Registry Façade
//!
//! Public entry point for hosts: construct a registry once, `register` when
//! the service is ready to take traffic, `deregister` on shutdown.

use crate::addr::{self, AddrError};
use crate::config::{RegisterOptions, RegistryConfig, ValidatedConfig};
use crate::error::{RegistryError, Result};
use crate::lifecycle::{spawn_refresher, RegistrationState, Renewal, ShutdownSignal};
use crate::node::Node;
use crate::store::{CoordinationStore, EtcdStore, LeaseId};
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument, Span};

/// Self-registration of one service instance.
#[async_trait]
pub trait Registry: Send + Sync + fmt::Display {
    /// Register the node once, then keep the registration alive in the
    /// background.
    ///
    /// Call once per instance. Calling again while active starts an
    /// additional refresher.
    async fn register(&self, options: RegisterOptions) -> Result<()>;

    /// Stop refreshing and delete the node's record. Safe to call more than
    /// once and concurrently.
    async fn deregister(&self) -> Result<()>;

    /// Kind of the backing store
    fn kind(&self) -> &'static str;
}

/// Lease-backed registry over any [`CoordinationStore`].
pub struct LeaseRegistry<S> {
    store: Arc<S>,
    config: ValidatedConfig,
    node: Node,
    key: String,
    span: Span,
    shutdown: ShutdownSignal,
    state_tx: watch::Sender<RegistrationState>,
    lease_rx: Mutex<watch::Receiver<Option<LeaseId>>>,
    refreshers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Registry backed by etcd
pub type EtcdRegistry = LeaseRegistry<EtcdStore>;

impl EtcdRegistry {
    /// Validate `config`, resolve the advertised address and connect to etcd.
    ///
    /// Fails with [`RegistryError::Config`] before touching the network when
    /// the service name is missing.
    pub async fn connect(config: RegistryConfig) -> Result<Self> {
        let config = config.validate()?;
        let node = build_node(&config, addr::extract)?;
        let store = EtcdStore::connect(&config).await?;
        Ok(Self::assemble(config, node, store))
    }
}

impl<S: CoordinationStore> LeaseRegistry<S> {
    /// Build a registry over an existing store, detecting the advertised IP
    /// from local interfaces when the configured host is empty.
    pub fn new(config: RegistryConfig, store: S) -> Result<Self> {
        Self::with_address_resolver(config, store, addr::extract)
    }

    /// Build a registry, asking `resolve` for the advertised host.
    pub fn with_address_resolver<F>(config: RegistryConfig, store: S, resolve: F) -> Result<Self>
    where
        F: FnOnce(&str) -> std::result::Result<String, AddrError>,
    {
        let config = config.validate()?;
        let node = build_node(&config, resolve)?;
        Ok(Self::assemble(config, node, store))
    }

    fn assemble(config: ValidatedConfig, node: Node, store: S) -> Self {
        let key = node.key(&config.service_name);
        let span = match &config.span {
            Some(parent) => info_span!(
                parent: parent,
                "registry",
                service = %config.service_name,
                node_id = %node.id
            ),
            None => info_span!(
                "registry",
                service = %config.service_name,
                node_id = %node.id
            ),
        };
        let (state_tx, _) = watch::channel(RegistrationState::Unregistered);
        let (_, lease_rx) = watch::channel(None);

        info!(
            parent: &span,
            key = %key,
            address = %node.address,
            store = store.kind(),
            "Registry created"
        );

        Self {
            store: Arc::new(store),
            config,
            node,
            key,
            span,
            shutdown: ShutdownSignal::new(),
            state_tx,
            lease_rx: Mutex::new(lease_rx),
            refreshers: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Store key holding the advertised address
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Lease the record is currently bound to
    pub fn lease_id(&self) -> Option<LeaseId> {
        *self
            .lease_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .borrow()
    }

    pub fn state(&self) -> RegistrationState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<RegistrationState> {
        self.state_tx.subscribe()
    }

    /// Move to `Registering`. Returns the state we came from.
    fn begin_registration(&self) -> Result<RegistrationState> {
        let mut previous = RegistrationState::Unregistered;
        let accepted = self.state_tx.send_if_modified(|state| {
            previous = *state;
            if state.is_terminal() || *state == RegistrationState::Stopping {
                false
            } else {
                *state = RegistrationState::Registering;
                true
            }
        });

        if accepted {
            Ok(previous)
        } else {
            Err(RegistryError::Terminal(previous))
        }
    }

    fn finish_registration(&self, next: RegistrationState) {
        self.state_tx.send_if_modified(|state| {
            if *state == RegistrationState::Registering {
                *state = next;
                true
            } else {
                false
            }
        });
    }
}

#[async_trait]
impl<S: CoordinationStore> Registry for LeaseRegistry<S> {
    async fn register(&self, options: RegisterOptions) -> Result<()> {
        let resolved = options.resolve();
        let previous = self.begin_registration()?;
        if previous == RegistrationState::Active {
            warn!(
                parent: &self.span,
                "register called while already active, starting another refresher"
            );
        }

        // Held until the refresher is recorded, so a concurrent deregister
        // deletes only after the first write has landed.
        let mut refreshers = self.refreshers.lock().await;
        if self.shutdown.is_triggered() {
            return Err(RegistryError::Terminal(self.state()));
        }

        let (lease_tx, lease_rx) = watch::channel(None);
        let mut renewal = Renewal::new(
            self.store.clone(),
            self.key.clone(),
            self.node.address.clone(),
            resolved.ttl_secs(),
            self.config.timeout,
            lease_tx,
        );

        if let Err(e) = renewal.renew().instrument(self.span.clone()).await {
            error!(parent: &self.span, key = %self.key, error = %e, "Registration failed");
            let next = if previous == RegistrationState::Active {
                RegistrationState::Active
            } else {
                RegistrationState::Failed
            };
            self.finish_registration(next);
            return Err(e.into());
        }

        *self.lease_rx.lock().unwrap_or_else(PoisonError::into_inner) = lease_rx;

        // Deregistered while the first write was in flight. The waiting
        // deregister deletes the key once the lock is released.
        if self.shutdown.is_triggered() {
            return Err(RegistryError::Terminal(self.state()));
        }

        let handle = spawn_refresher(
            renewal,
            resolved.interval,
            self.shutdown.clone(),
            self.span.clone(),
        );
        refreshers.push(handle);
        self.finish_registration(RegistrationState::Active);

        info!(
            parent: &self.span,
            key = %self.key,
            ttl = ?resolved.ttl,
            interval = ?resolved.interval,
            "Registration active"
        );
        Ok(())
    }

    async fn deregister(&self) -> Result<()> {
        if self.shutdown.trigger() {
            self.state_tx.send_replace(RegistrationState::Stopping);
            info!(parent: &self.span, key = %self.key, "Stopping registration refresher");
        }

        // Held through the delete so concurrent callers delete only after
        // every refresher has exited and cannot rewrite the key.
        let mut refreshers = self.refreshers.lock().await;
        for handle in refreshers.drain(..) {
            if let Err(e) = handle.await {
                warn!(parent: &self.span, error = %e, "Refresher task ended abnormally");
            }
        }

        let result = self
            .store
            .delete(&self.key, self.config.timeout)
            .instrument(self.span.clone())
            .await;
        drop(refreshers);

        self.state_tx.send_replace(RegistrationState::Deregistered);

        match result {
            Ok(()) => {
                info!(parent: &self.span, key = %self.key, "Node deregistered");
                Ok(())
            }
            Err(e) => {
                error!(parent: &self.span, key = %self.key, error = %e, "Failed to delete registration");
                Err(e.into())
            }
        }
    }

    fn kind(&self) -> &'static str {
        self.store.kind()
    }
}

impl<S: CoordinationStore> fmt::Display for LeaseRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.store.kind())
    }
}

impl<S> Drop for LeaseRegistry<S> {
    fn drop(&mut self) {
        // Stop background renewals; the record expires with its lease
        self.shutdown.trigger();
    }
}

fn build_node<F>(config: &ValidatedConfig, resolve: F) -> Result<Node>
where
    F: FnOnce(&str) -> std::result::Result<String, AddrError>,
{
    let address = addr::advertise_address_with(&config.service_addr, resolve)?;
    Ok(Node::new(address, config.metadata.clone()))
}
