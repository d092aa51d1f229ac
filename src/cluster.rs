//! Desired-state model
//!
//! A [`Cluster`] is the user-supplied manifest: the nodes to manage, the
//! images to run, and per-service parameters. Manifests are YAML:
//!
//! ```yaml
//! name: stage0
//! nodes:
//!   - address: 10.0.0.1
//!     control_plane: true
//!   - address: 10.0.0.2
//!     control_plane: true
//!   - address: 10.0.0.3
//!     control_plane: true
//! options:
//!   etcd:
//!     volume_name: etcd-cke
//!     extra_arguments: ["--election-timeout=1500"]
//! ```

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_ETCD_IMAGE, DEFAULT_ETCD_VOLUME_NAME};

/// One managed host.
///
/// The address doubles as the node identity and as the etcd member name;
/// two nodes are equal iff their addresses are equal. Addresses are unique
/// within a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// IP address the node is reached at
    pub address: String,
    /// Optional display hostname; never used for identity
    #[serde(default)]
    pub hostname: String,
    /// Whether this node runs etcd and the Kubernetes master components
    #[serde(default)]
    pub control_plane: bool,
    /// Free-form labels propagated to the Kubernetes Node resource
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

/// A host-to-container mount descriptor
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mount {
    /// Host path or volume name
    pub source: String,
    /// Path inside the container
    pub destination: String,
    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
    /// Mount propagation mode (empty for the engine default)
    #[serde(default)]
    pub propagation: String,
    /// SELinux relabeling mode (empty for none)
    #[serde(default)]
    pub label: String,
}

impl Mount {
    /// Render as a container-engine `--volume` argument.
    pub fn to_volume_arg(&self) -> String {
        let mut flags = Vec::new();
        if self.read_only {
            flags.push("ro".to_string());
        }
        if !self.propagation.is_empty() {
            flags.push(self.propagation.clone());
        }
        if !self.label.is_empty() {
            flags.push(self.label.clone());
        }
        if flags.is_empty() {
            format!("--volume={}:{}", self.source, self.destination)
        } else {
            format!(
                "--volume={}:{}:{}",
                self.source,
                self.destination,
                flags.join(",")
            )
        }
    }
}

/// Service start-up parameters, both the system-required set and the
/// user-supplied extras.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceParams {
    /// CLI tokens appended to the service argv
    #[serde(default)]
    pub extra_arguments: Vec<String>,
    /// Additional host-to-container mounts
    #[serde(default)]
    pub extra_binds: Vec<Mount>,
    /// Additional environment variables
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
}

/// etcd service options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtcdParams {
    /// User-supplied service parameters
    #[serde(flatten)]
    pub service_params: ServiceParams,
    /// Named volume backing the data directory; empty means the default
    #[serde(default)]
    pub volume_name: String,
}

impl EtcdParams {
    /// The effective data volume name.
    pub fn volume_name(&self) -> &str {
        if self.volume_name.is_empty() {
            DEFAULT_ETCD_VOLUME_NAME
        } else {
            &self.volume_name
        }
    }
}

/// Container image references for the managed services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Images {
    /// etcd image reference
    #[serde(default = "default_etcd_image")]
    pub etcd: String,
    /// Kubernetes component image reference (consumed by the Kubernetes
    /// reconcilers, not by the etcd core)
    #[serde(default)]
    pub kubernetes: String,
}

fn default_etcd_image() -> String {
    DEFAULT_ETCD_IMAGE.to_string()
}

impl Default for Images {
    fn default() -> Self {
        Self {
            etcd: default_etcd_image(),
            kubernetes: String::new(),
        }
    }
}

/// Per-service cluster options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    /// etcd service options
    #[serde(default)]
    pub etcd: EtcdParams,
    /// Image references
    #[serde(default)]
    pub images: Images,
}

/// The desired cluster: an ordered sequence of nodes plus options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster name, used only for logging
    #[serde(default)]
    pub name: String,
    /// The managed nodes, in manifest order
    pub nodes: Vec<Node>,
    /// Service options
    #[serde(default)]
    pub options: Options,
}

impl Cluster {
    /// The control plane subset of [`Cluster::nodes`], in manifest order.
    pub fn control_plane_nodes(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.control_plane).collect()
    }

    /// True if `address` names a node of this cluster.
    pub fn contains_address(&self, address: &str) -> bool {
        self.nodes.iter().any(|n| n.address == address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(address: &str, control_plane: bool) -> Node {
        Node {
            address: address.to_string(),
            hostname: String::new(),
            control_plane,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn node_identity_is_the_address() {
        let mut a = node("10.0.0.1", true);
        let b = node("10.0.0.1", false);
        a.hostname = "cp1".to_string();
        assert_eq!(a, b);
        assert_ne!(a, node("10.0.0.2", true));
    }

    #[test]
    fn volume_name_defaults() {
        let params = EtcdParams::default();
        assert_eq!(params.volume_name(), DEFAULT_ETCD_VOLUME_NAME);

        let params = EtcdParams {
            volume_name: "data".to_string(),
            ..Default::default()
        };
        assert_eq!(params.volume_name(), "data");
    }

    #[test]
    fn mount_volume_arg_rendering() {
        let plain = Mount {
            source: "/etc/etcd/pki".to_string(),
            destination: "/etc/etcd/pki".to_string(),
            ..Default::default()
        };
        assert_eq!(plain.to_volume_arg(), "--volume=/etc/etcd/pki:/etc/etcd/pki");

        let full = Mount {
            source: "certs".to_string(),
            destination: "/certs".to_string(),
            read_only: true,
            propagation: "rslave".to_string(),
            label: "z".to_string(),
        };
        assert_eq!(full.to_volume_arg(), "--volume=certs:/certs:ro,rslave,z");
    }

    #[test]
    fn manifest_yaml_round_trip() {
        let yaml = r#"
name: stage0
nodes:
  - address: 10.0.0.1
    control_plane: true
  - address: 10.0.0.2
options:
  etcd:
    volume_name: etcd-data
    extra_arguments: ["--election-timeout=1500"]
"#;
        let cluster: Cluster = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cluster.name, "stage0");
        assert_eq!(cluster.nodes.len(), 2);
        assert_eq!(cluster.control_plane_nodes().len(), 1);
        assert!(cluster.contains_address("10.0.0.2"));
        assert!(!cluster.contains_address("10.0.0.9"));
        assert_eq!(cluster.options.etcd.volume_name(), "etcd-data");
        assert_eq!(
            cluster.options.etcd.service_params.extra_arguments,
            vec!["--election-timeout=1500".to_string()]
        );
        assert_eq!(cluster.options.images.etcd, DEFAULT_ETCD_IMAGE);
    }
}
