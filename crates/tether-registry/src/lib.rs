//! Lease-backed service registration for tether
//!
//! A service instance publishes its reachable address under
//! `<service_name>_<node_id>` in a coordination store, bound to a
//! time-limited lease. A background refresher keeps the lease alive and
//! re-creates the record whenever the lease is lost, so the record
//! disappears on its own when the process dies without deregistering.
//!
//! ```no_run
//! use tether_registry::{EtcdRegistry, RegisterOptions, Registry, RegistryConfig};
//!
//! # async fn run() -> tether_registry::Result<()> {
//! let registry = EtcdRegistry::connect(
//!     RegistryConfig::new("billing").with_service_addr(":8080"),
//! )
//! .await?;
//! registry.register(RegisterOptions::new()).await?;
//! // serve traffic
//! registry.deregister().await?;
//! # Ok(())
//! # }
//! ```

pub mod addr;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod node;
pub mod registry;
pub mod store;

pub use config::{Credentials, RegisterOptions, RegistryConfig, TlsSettings};
pub use error::{RegistryError, Result, StoreError};
pub use lifecycle::RegistrationState;
pub use logging::{init_logging, LogConfig, LoggingGuard};
pub use node::Node;
pub use registry::{EtcdRegistry, LeaseRegistry, Registry};
pub use store::{CoordinationStore, EtcdStore, LeaseId, MemoryStore};
