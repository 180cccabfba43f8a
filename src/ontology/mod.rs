//! Resource ontology for cloud compliance assessment.
//!
//! Resources are modeled as a tagged union over the resource kinds we know
//! about. Each variant carries its typed properties and declares its
//! relationships to other resources by ID. The type hierarchy of each variant
//! is an explicit static list (most-specific first), so no runtime
//! introspection is needed to build metric applicability keys.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Automatic update settings of a compute resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomaticUpdates {
    pub enabled: bool,
    /// Update interval in days
    pub interval_days: u32,
    pub security_only: bool,
}

/// At-rest encryption settings of a storage resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtRestEncryption {
    pub enabled: bool,
    pub algorithm: Option<String>,
}

/// A virtual machine resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automatic_updates: Option<AutomaticUpdates>,
    pub block_storage_ids: Vec<String>,
    pub network_interface_ids: Vec<String>,
}

/// A block storage resource (e.g. a disk volume)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockStorage {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at_rest_encryption: Option<AtRestEncryption>,
}

/// An object storage resource (e.g. a bucket)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectStorage {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at_rest_encryption: Option<AtRestEncryption>,
    pub public_access: bool,
}

/// A network interface resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub id: String,
    pub name: String,
    pub access_restricted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

/// An account resource (e.g. a cloud subscription or project)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
}

/// A typed cloud resource discovered by a collector.
///
/// Immutable once produced; the policy engine consumes it as a flattened
/// property map via [`Resource::property_map`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Resource {
    VirtualMachine(VirtualMachine),
    BlockStorage(BlockStorage),
    ObjectStorage(ObjectStorage),
    NetworkInterface(NetworkInterface),
    Account(Account),
}

impl Resource {
    /// Globally unique identifier of this resource
    pub fn id(&self) -> &str {
        match self {
            Resource::VirtualMachine(r) => &r.id,
            Resource::BlockStorage(r) => &r.id,
            Resource::ObjectStorage(r) => &r.id,
            Resource::NetworkInterface(r) => &r.id,
            Resource::Account(r) => &r.id,
        }
    }

    /// Human readable name of this resource
    pub fn name(&self) -> &str {
        match self {
            Resource::VirtualMachine(r) => &r.name,
            Resource::BlockStorage(r) => &r.name,
            Resource::ObjectStorage(r) => &r.name,
            Resource::NetworkInterface(r) => &r.name,
            Resource::Account(r) => &r.name,
        }
    }

    /// Ordered list of type names, from most-specific to least-specific.
    /// Used to build metric applicability cache keys.
    pub fn type_hierarchy(&self) -> &'static [&'static str] {
        match self {
            Resource::VirtualMachine(_) => &["VirtualMachine", "Compute", "CloudResource"],
            Resource::BlockStorage(_) => &["BlockStorage", "Storage", "CloudResource"],
            Resource::ObjectStorage(_) => &["ObjectStorage", "Storage", "CloudResource"],
            Resource::NetworkInterface(_) => &["NetworkInterface", "Networking", "CloudResource"],
            Resource::Account(_) => &["Account", "CloudResource"],
        }
    }

    /// Named outbound relationship edges of this resource, as (edge name,
    /// target resource ID) pairs.
    pub fn relationships(&self) -> Vec<(&'static str, String)> {
        match self {
            Resource::VirtualMachine(r) => {
                let mut edges = Vec::new();
                for id in &r.block_storage_ids {
                    edges.push(("block_storage", id.clone()));
                }
                for id in &r.network_interface_ids {
                    edges.push(("network_interface", id.clone()));
                }
                edges
            }
            Resource::NetworkInterface(r) => r
                .parent_id
                .iter()
                .map(|id| ("parent", id.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Flatten this resource into a JSON property map suitable as policy
    /// evaluation input.
    pub fn property_map(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let value = serde_json::to_value(self)
            .with_context(|| format!("could not serialize resource {}", self.id()))?;

        match value {
            serde_json::Value::Object(map) => Ok(map),
            _ => anyhow::bail!("resource {} did not serialize to an object", self.id()),
        }
    }
}
