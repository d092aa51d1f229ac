//! Cluster-configuration store interface
//!
//! The operator reads its desired state and CA material from a
//! strongly-consistent key/value store maintained by external tooling.
//! Reads return the value together with its revision; writes are
//! compare-and-set against that revision so concurrent editors cannot
//! clobber each other.
//!
//! The production store is external to this crate. [`MemStorage`] backs
//! single-process deployments seeded from a manifest file, and the tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cluster::Cluster;
use crate::{Error, Result};

/// A value read from the store, with the revision it was written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revisioned {
    /// The stored value
    pub value: String,
    /// Store revision of the last write
    pub revision: i64,
}

/// The certificate authorities the operator consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaKind {
    /// Signs etcd server certificates; trusted by etcd clients
    Server,
    /// Signs etcd peer certificates
    EtcdPeer,
    /// Signs etcd client certificates; trusted by etcd servers
    EtcdClient,
    /// Signs Kubernetes API client certificates (consumed by the
    /// Kubernetes reconcilers, not by the etcd core)
    Kubernetes,
}

impl CaKind {
    fn slug(self) -> &'static str {
        match self {
            CaKind::Server => "server",
            CaKind::EtcdPeer => "etcd-peer",
            CaKind::EtcdClient => "etcd-client",
            CaKind::Kubernetes => "kubernetes",
        }
    }

    /// Store key of the CA certificate.
    pub fn cert_key(self) -> String {
        format!("ca/{}", self.slug())
    }

    /// Store key of the CA private key.
    pub fn key_key(self) -> String {
        format!("ca/{}-key", self.slug())
    }
}

impl std::fmt::Display for CaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

/// Scheduling limits for external tooling; stored alongside the manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    /// Expected number of control plane nodes
    #[serde(default)]
    pub control_plane_count: usize,
    /// Minimum number of worker nodes
    #[serde(default)]
    pub minimum_workers: usize,
    /// Maximum number of worker nodes
    #[serde(default)]
    pub maximum_workers: usize,
}

/// Store key of the cluster manifest
pub const KEY_CLUSTER: &str = "cluster";

/// Store key of the constraints record
pub const KEY_CONSTRAINTS: &str = "constraints";

/// Key/value reads and compare-and-set writes against the backing store
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read a key. `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Revisioned>>;

    /// Write a key.
    ///
    /// With `expected_revision`, the write succeeds only when the current
    /// revision matches (an absent key has revision 0); returns whether it
    /// was applied. Without, the write is unconditional.
    async fn put(&self, key: &str, value: String, expected_revision: Option<i64>) -> Result<bool>;

    /// Read a CA certificate in PEM format.
    async fn get_ca_certificate(&self, kind: CaKind) -> Result<String> {
        self.get(&kind.cert_key())
            .await?
            .map(|r| r.value)
            .ok_or_else(|| Error::precondition(format!("CA certificate {} not found", kind.slug())))
    }

    /// Read a CA private key in PEM format.
    async fn get_ca_key(&self, kind: CaKind) -> Result<String> {
        self.get(&kind.key_key())
            .await?
            .map(|r| r.value)
            .ok_or_else(|| Error::precondition(format!("CA key {} not found", kind.slug())))
    }

    /// Store CA certificate and key.
    async fn put_ca(&self, kind: CaKind, cert_pem: &str, key_pem: &str) -> Result<()> {
        self.put(&kind.cert_key(), cert_pem.to_string(), None).await?;
        self.put(&kind.key_key(), key_pem.to_string(), None).await?;
        Ok(())
    }

    /// Read the cluster manifest with its revision.
    async fn get_cluster(&self) -> Result<Option<(Cluster, i64)>> {
        match self.get(KEY_CLUSTER).await? {
            None => Ok(None),
            Some(r) => {
                let cluster = serde_json::from_str(&r.value)
                    .map_err(|e| Error::serialization(format!("stored cluster: {e}")))?;
                Ok(Some((cluster, r.revision)))
            }
        }
    }

    /// Write the cluster manifest, optionally compare-and-set.
    async fn put_cluster(&self, cluster: &Cluster, expected_revision: Option<i64>) -> Result<bool> {
        let value = serde_json::to_string(cluster)
            .map_err(|e| Error::serialization(format!("cluster: {e}")))?;
        self.put(KEY_CLUSTER, value, expected_revision).await
    }

    /// Read the constraints record with its revision.
    async fn get_constraints(&self) -> Result<Option<(Constraints, i64)>> {
        match self.get(KEY_CONSTRAINTS).await? {
            None => Ok(None),
            Some(r) => {
                let constraints = serde_json::from_str(&r.value)
                    .map_err(|e| Error::serialization(format!("stored constraints: {e}")))?;
                Ok(Some((constraints, r.revision)))
            }
        }
    }

    /// Write the constraints record, optionally compare-and-set.
    async fn put_constraints(
        &self,
        constraints: &Constraints,
        expected_revision: Option<i64>,
    ) -> Result<bool> {
        let value = serde_json::to_string(constraints)
            .map_err(|e| Error::serialization(format!("constraints: {e}")))?;
        self.put(KEY_CONSTRAINTS, value, expected_revision).await
    }
}

/// In-memory [`Storage`] implementation
#[derive(Default)]
pub struct MemStorage {
    inner: Mutex<MemInner>,
}

#[derive(Default)]
struct MemInner {
    entries: BTreeMap<String, Revisioned>,
    revision: i64,
}

impl MemStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn get(&self, key: &str) -> Result<Option<Revisioned>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String, expected_revision: Option<i64>) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(expected) = expected_revision {
            let current = inner.entries.get(key).map(|r| r.revision).unwrap_or(0);
            if current != expected {
                return Ok(false);
            }
        }
        inner.revision += 1;
        let revision = inner.revision;
        inner
            .entries
            .insert(key.to_string(), Revisioned { value, revision });
        Ok(true)
    }
}
