//! Etcd Store
//!
//! etcd v3 implementation of the coordination store contract: connection
//! setup (TLS, credentials, bounded retry), lease grant, single keep-alive,
//! lease-bound put and delete.

use super::{with_deadline, CoordinationStore, LeaseId};
use crate::config::{BackoffConfig, TlsSettings, ValidatedConfig};
use crate::error::{RegistryError, StoreError};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{Certificate, Client, ConnectOptions, Identity, PutOptions, TlsOptions};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Client-side gRPC keep-alive, independent of lease keep-alive
const CHANNEL_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
const CHANNEL_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// etcd-backed coordination store
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to etcd and verify that at least one endpoint answers.
    pub async fn connect(config: &ValidatedConfig) -> Result<Self, RegistryError> {
        let options = connect_options(config)?;
        let scheme = if config.tls.is_some() { "https" } else { "http" };
        let endpoints: Vec<String> = config
            .endpoints
            .iter()
            .map(|endpoint| format!("{}://{}", scheme, endpoint))
            .collect();

        let client = retry(exponential_backoff(&config.connect_backoff), || async {
            let mut client = Client::connect(&endpoints, Some(options.clone()))
                .await
                .map_err(|e| {
                    warn!(error = %e, "etcd connection failed, retrying");
                    backoff::Error::transient(e)
                })?;
            match client.status().await {
                Ok(status) => {
                    debug!(version = %status.version(), "etcd connection verified");
                    Ok(client)
                }
                Err(e) => {
                    warn!(error = %e, "etcd status check failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await
        .map_err(|e| {
            RegistryError::Connection(format!(
                "failed to reach etcd at {:?}: {}",
                config.endpoints, e
            ))
        })?;

        Ok(Self { client })
    }

    /// Wrap an already connected client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Read the value stored under `key`, if any.
    pub async fn get(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let mut client = self.client.clone();
        let key = key.to_string();
        with_deadline("get", timeout, async move {
            let resp = client
                .get(key, None)
                .await
                .map_err(|e| map_etcd_error("get", None, e))?;
            match resp.kvs().first() {
                Some(kv) => kv
                    .value_str()
                    .map(|v| Some(v.to_string()))
                    .map_err(|e| StoreError::InvalidResponse(e.to_string())),
                None => Ok(None),
            }
        })
        .await
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    fn kind(&self) -> &'static str {
        "etcd"
    }

    async fn grant_lease(&self, ttl_secs: i64, timeout: Duration) -> Result<LeaseId, StoreError> {
        let mut client = self.client.clone();
        with_deadline("grant_lease", timeout, async move {
            let resp = client
                .lease_grant(ttl_secs, None)
                .await
                .map_err(|e| map_etcd_error("grant_lease", None, e))?;
            LeaseId::new(resp.id()).ok_or_else(|| {
                StoreError::InvalidResponse(format!("lease grant returned id {}", resp.id()))
            })
        })
        .await
    }

    async fn keep_alive_once(&self, lease: LeaseId, timeout: Duration) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        with_deadline("keep_alive", timeout, async move {
            // Opening the stream sends the first keep-alive request
            let (_keeper, mut stream) = client
                .lease_keep_alive(lease.get())
                .await
                .map_err(|e| map_etcd_error("keep_alive", Some(lease), e))?;

            match stream
                .message()
                .await
                .map_err(|e| map_etcd_error("keep_alive", Some(lease), e))?
            {
                Some(resp) if resp.ttl() > 0 => Ok(()),
                Some(_) => Err(StoreError::LeaseNotFound(lease)),
                None => Err(StoreError::InvalidResponse(
                    "keep-alive stream closed before responding".to_string(),
                )),
            }
        })
        .await
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        lease: Option<LeaseId>,
        timeout: Duration,
    ) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let key = key.to_string();
        let value = value.to_string();
        with_deadline("put", timeout, async move {
            let options = lease.map(|lease| PutOptions::new().with_lease(lease.get()));
            client
                .put(key, value, options)
                .await
                .map_err(|e| map_etcd_error("put", lease, e))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str, timeout: Duration) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let key = key.to_string();
        with_deadline("delete", timeout, async move {
            client
                .delete(key, None)
                .await
                .map_err(|e| map_etcd_error("delete", None, e))?;
            Ok(())
        })
        .await
    }
}

/// Translate an etcd client error, recognizing the server's lease-not-found
/// status.
fn map_etcd_error(op: &'static str, lease: Option<LeaseId>, err: etcd_client::Error) -> StoreError {
    if let (Some(lease), etcd_client::Error::GRpcStatus(status)) = (lease, &err) {
        if is_lease_not_found_message(status.message()) {
            return StoreError::LeaseNotFound(lease);
        }
    }
    StoreError::rpc(op, err.to_string())
}

fn is_lease_not_found_message(message: &str) -> bool {
    message.contains("requested lease not found") || message.contains("lease not found")
}

fn exponential_backoff(config: &BackoffConfig) -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: config.initial,
        max_interval: config.max,
        max_elapsed_time: Some(config.max_elapsed),
        multiplier: config.multiplier,
        ..Default::default()
    }
}

fn connect_options(config: &ValidatedConfig) -> Result<ConnectOptions, RegistryError> {
    let mut options = ConnectOptions::new()
        .with_timeout(config.timeout)
        .with_connect_timeout(config.timeout)
        .with_keep_alive(CHANNEL_KEEP_ALIVE_INTERVAL, CHANNEL_KEEP_ALIVE_TIMEOUT);

    if let Some(creds) = &config.credentials {
        options = options.with_user(creds.username.clone(), creds.password.clone());
    }

    if let Some(tls) = &config.tls {
        options = options.with_tls(tls_options(tls)?);
    }

    Ok(options)
}

fn tls_options(tls: &TlsSettings) -> Result<TlsOptions, RegistryError> {
    let mut options = TlsOptions::new();

    if let Some(ca) = &tls.ca_cert {
        options = options.ca_certificate(Certificate::from_pem(read_pem(ca)?));
    }

    match (&tls.client_cert, &tls.client_key) {
        (Some(cert), Some(key)) => {
            options = options.identity(Identity::from_pem(read_pem(cert)?, read_pem(key)?));
        }
        (None, None) => {}
        _ => {
            return Err(RegistryError::Config(
                "client certificate and client key must be set together".to_string(),
            ))
        }
    }

    if let Some(domain) = &tls.domain {
        options = options.domain_name(domain.clone());
    }

    Ok(options)
}

fn read_pem(path: &Path) -> Result<Vec<u8>, RegistryError> {
    std::fs::read(path).map_err(|e| {
        RegistryError::Connection(format!("failed to read TLS file {}: {}", path.display(), e))
    })
}
