//! Infrastructure façade
//!
//! [`Infrastructure`] is the capability bundle handed to every commander:
//! per-address agents and container engines, an authenticated etcd client
//! factory, an HTTP client for health probes, and the configuration store.
//! One instance is built per tick and owns its agents; closing it releases
//! every connection.
//!
//! TLS material is shared across ticks through [`TlsContext`]: the server
//! CA and the HTTP client initialize exactly once per process, and the
//! root etcd client certificate is cached for 24 hours and reissued on
//! expiry. Keeping that context explicit (instead of process-wide
//! globals) lets tests substitute their own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Certificate, ConnectOptions, Identity, TlsOptions};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::agent::{Agent, SshAgent, SshConfig};
use crate::cluster::Cluster;
use crate::engine::{ContainerEngine, Docker};
use crate::op::gather;
use crate::pki::{CertCache, CertKeyPair, CertificateAuthority, ROOT_CERT_LIFETIME};
use crate::storage::{CaKind, Storage};
use crate::{Error, Result};

/// Default per-RPC timeout for etcd clients produced by the factory
const ETCD_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial timeout for etcd clients produced by the factory
const ETCD_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Common name on the root etcd client certificate
const ROOT_CLIENT_CN: &str = "anneal";

/// The capability bundle commanders run against
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Infrastructure: Send + Sync {
    /// The agent for `address`; `None` if the node is not connected.
    fn agent(&self, address: &str) -> Option<Arc<dyn Agent>>;

    /// The container engine for `address`; `None` if not connected.
    fn engine(&self, address: &str) -> Option<Arc<dyn ContainerEngine>>;

    /// A connected, authenticated etcd v3 client for `endpoints`.
    ///
    /// Clients are independent; callers drop them when done. RPCs inherit
    /// the factory-level timeout.
    async fn new_etcd_client(&self, endpoints: &[String]) -> Result<etcd_client::Client>;

    /// The shared HTTP client used for health probes, configured with the
    /// server CA and the cached root client certificate.
    async fn http_client(&self) -> Result<reqwest::Client>;

    /// The configuration store.
    fn storage(&self) -> Arc<dyn Storage>;

    /// Release every agent connection. Idempotent.
    async fn close(&self);
}

/// Process-wide TLS state shared by successive [`AnnealInfrastructure`]
/// instances
pub struct TlsContext {
    server_ca: OnceCell<String>,
    root_cert: CertCache,
    http: OnceCell<reqwest::Client>,
}

impl Default for TlsContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self {
            server_ca: OnceCell::new(),
            root_cert: CertCache::new(ROOT_CERT_LIFETIME),
            http: OnceCell::new(),
        }
    }

    async fn server_ca(&self, storage: &dyn Storage) -> Result<&str> {
        self.server_ca
            .get_or_try_init(|| storage.get_ca_certificate(CaKind::Server))
            .await
            .map(String::as_str)
    }

    async fn root_cert(&self, storage: &dyn Storage) -> Result<CertKeyPair> {
        self.root_cert
            .get(|| async {
                let cert = storage.get_ca_certificate(CaKind::EtcdClient).await?;
                let key = storage.get_ca_key(CaKind::EtcdClient).await?;
                let ca = CertificateAuthority::from_pem(&cert, &key)?;
                ca.issue_client(ROOT_CLIENT_CN)
            })
            .await
    }

    async fn http_client(&self, storage: &dyn Storage) -> Result<reqwest::Client> {
        let client = self
            .http
            .get_or_try_init(|| async {
                let server_ca = self.server_ca(storage).await?;
                let root = self.root_cert(storage).await?;
                let identity_pem = format!("{}{}", root.key_pem, root.cert_pem);
                let client = reqwest::Client::builder()
                    .add_root_certificate(reqwest::Certificate::from_pem(server_ca.as_bytes())?)
                    .identity(reqwest::Identity::from_pem(identity_pem.as_bytes())?)
                    .build()?;
                Ok::<_, Error>(client)
            })
            .await?;
        Ok(client.clone())
    }
}

/// Production [`Infrastructure`]: SSH agents, docker engines, mTLS etcd
/// clients
pub struct AnnealInfrastructure {
    agents: HashMap<String, Arc<dyn Agent>>,
    engines: HashMap<String, Arc<dyn ContainerEngine>>,
    storage: Arc<dyn Storage>,
    tls: Arc<TlsContext>,
}

impl AnnealInfrastructure {
    /// Connect to every node of `cluster` in parallel.
    ///
    /// A node with no configured SSH key fails construction (that is a
    /// manifest error); a node that cannot be reached is logged and
    /// skipped, so one dead host does not stall reconciliation of the
    /// rest. Commanders targeting a skipped node fail with a
    /// precondition error when they look its agent up.
    pub async fn new(
        ct: &CancellationToken,
        cluster: &Cluster,
        storage: Arc<dyn Storage>,
        ssh: &SshConfig,
        tls: Arc<TlsContext>,
    ) -> Result<Self> {
        let connected = gather(cluster.nodes.iter().map(|node| async move {
            match SshAgent::connect(ct, &node.address, ssh).await {
                Ok(agent) => Ok(Some((
                    node.address.clone(),
                    Arc::new(agent) as Arc<dyn Agent>,
                ))),
                Err(err @ (Error::Precondition(_) | Error::Cancelled)) => Err(err),
                Err(e) => {
                    warn!(node = %node.address, error = %e, "failed to connect; skipping node");
                    Ok(None)
                }
            }
        }))
        .await?;

        let agents: HashMap<String, Arc<dyn Agent>> = connected.into_iter().flatten().collect();
        let engines = agents
            .iter()
            .map(|(addr, agent)| {
                (
                    addr.clone(),
                    Arc::new(Docker::new(agent.clone(), addr.clone())) as Arc<dyn ContainerEngine>,
                )
            })
            .collect();

        Ok(Self {
            agents,
            engines,
            storage,
            tls,
        })
    }
}

#[async_trait]
impl Infrastructure for AnnealInfrastructure {
    fn agent(&self, address: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(address).cloned()
    }

    fn engine(&self, address: &str) -> Option<Arc<dyn ContainerEngine>> {
        self.engines.get(address).cloned()
    }

    async fn new_etcd_client(&self, endpoints: &[String]) -> Result<etcd_client::Client> {
        let server_ca = self.tls.server_ca(self.storage.as_ref()).await?;
        let root = self.tls.root_cert(self.storage.as_ref()).await?;

        let tls = TlsOptions::new()
            .ca_certificate(Certificate::from_pem(server_ca))
            .identity(Identity::from_pem(root.cert_pem, root.key_pem));
        let options = ConnectOptions::new()
            .with_tls(tls)
            .with_timeout(ETCD_RPC_TIMEOUT)
            .with_connect_timeout(ETCD_CONNECT_TIMEOUT);

        Ok(etcd_client::Client::connect(endpoints, Some(options)).await?)
    }

    async fn http_client(&self) -> Result<reqwest::Client> {
        self.tls.http_client(self.storage.as_ref()).await
    }

    fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    async fn close(&self) {
        futures::future::join_all(self.agents.values().map(|a| a.close())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    async fn seeded_storage() -> Arc<dyn Storage> {
        let storage = MemStorage::new();
        for kind in [CaKind::Server, CaKind::EtcdPeer, CaKind::EtcdClient] {
            let ca = CertificateAuthority::new(kind.cert_key().as_str()).unwrap();
            storage
                .put_ca(kind, ca.ca_cert_pem(), ca.ca_key_pem())
                .await
                .unwrap();
        }
        Arc::new(storage)
    }

    #[tokio::test]
    async fn root_cert_is_cached_across_calls() {
        let storage = seeded_storage().await;
        let tls = TlsContext::new();

        let first = tls.root_cert(storage.as_ref()).await.unwrap();
        let second = tls.root_cert(storage.as_ref()).await.unwrap();
        assert_eq!(first.cert_pem, second.cert_pem);
        assert!(first.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[tokio::test]
    async fn missing_server_ca_is_a_precondition_error() {
        let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
        let tls = TlsContext::new();
        let err = tls.server_ca(storage.as_ref()).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn http_client_builds_from_stored_material() {
        let storage = seeded_storage().await;
        let tls = TlsContext::new();
        tls.http_client(storage.as_ref()).await.unwrap();
        // second call returns the same shared client
        tls.http_client(storage.as_ref()).await.unwrap();
    }
}
