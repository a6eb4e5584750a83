//! Node descriptor for the advertised service instance

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Identity, address and metadata of one registered service instance.
///
/// Built once when the registry is constructed and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Random instance identifier (UUID v4), unique per registry instance
    pub id: String,
    /// Advertised `host:port`
    pub address: String,
    /// Application-specific metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Node {
    /// Create a node with a freshly generated id
    pub fn new(address: String, metadata: HashMap<String, String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            address,
            metadata,
        }
    }

    /// Store key for this node under `service_name`
    pub fn key(&self, service_name: &str) -> String {
        format!("{}_{}", service_name, self.id)
    }
}
