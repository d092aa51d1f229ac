//! Generic commanders shared by the service operators
//!
//! These are the declarative building blocks: pull an image, manage a
//! named volume, start or stop a service container, install etcd TLS
//! material. Multi-node commanders fan out in parallel and require every
//! node to succeed.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::cluster::{Node, ServiceParams};
use crate::infra::Infrastructure;
use crate::pki::CertificateAuthority;
use crate::storage::CaKind;
use crate::{Error, Result, ETCD_PKI_DIR};

use super::{addresses, engine_for, gather, Command, Commander};

/// Pull one image on a set of nodes, in parallel
pub struct ImagePull {
    nodes: Vec<Node>,
    image: String,
}

impl ImagePull {
    /// Pull `image` on every node of `nodes`.
    pub fn new(nodes: Vec<Node>, image: impl Into<String>) -> Self {
        Self {
            nodes,
            image: image.into(),
        }
    }
}

#[async_trait]
impl Commander for ImagePull {
    async fn run(&self, ct: &CancellationToken, inf: &dyn Infrastructure) -> Result<()> {
        gather(self.nodes.iter().map(|node| async move {
            engine_for(inf, &node.address)?
                .pull_image(ct, &self.image)
                .await
        }))
        .await?;
        Ok(())
    }

    fn command(&self) -> Command {
        Command::new("image-pull", addresses(&self.nodes))
    }
}

/// Create a named volume on a set of nodes
pub struct VolumeCreate {
    nodes: Vec<Node>,
    name: String,
}

impl VolumeCreate {
    /// Create volume `name` on every node of `nodes`.
    pub fn new(nodes: Vec<Node>, name: impl Into<String>) -> Self {
        Self {
            nodes,
            name: name.into(),
        }
    }
}

#[async_trait]
impl Commander for VolumeCreate {
    async fn run(&self, ct: &CancellationToken, inf: &dyn Infrastructure) -> Result<()> {
        gather(self.nodes.iter().map(|node| async move {
            engine_for(inf, &node.address)?
                .volume_create(ct, &self.name)
                .await
        }))
        .await?;
        Ok(())
    }

    fn command(&self) -> Command {
        Command::new("volume-create", addresses(&self.nodes))
    }
}

/// Remove a named volume on a set of nodes; an absent volume is success
pub struct VolumeRemove {
    nodes: Vec<Node>,
    name: String,
}

impl VolumeRemove {
    /// Remove volume `name` from every node of `nodes`.
    pub fn new(nodes: Vec<Node>, name: impl Into<String>) -> Self {
        Self {
            nodes,
            name: name.into(),
        }
    }
}

#[async_trait]
impl Commander for VolumeRemove {
    async fn run(&self, ct: &CancellationToken, inf: &dyn Infrastructure) -> Result<()> {
        gather(self.nodes.iter().map(|node| async move {
            engine_for(inf, &node.address)?
                .volume_remove(ct, &self.name)
                .await
        }))
        .await?;
        Ok(())
    }

    fn command(&self) -> Command {
        Command::new("volume-remove", addresses(&self.nodes))
    }
}

/// Stop and remove a named container on one node; absent is success
pub struct StopContainer {
    node: Node,
    name: String,
}

impl StopContainer {
    /// Stop container `name` on `node`.
    pub fn new(node: Node, name: impl Into<String>) -> Self {
        Self {
            node,
            name: name.into(),
        }
    }
}

#[async_trait]
impl Commander for StopContainer {
    async fn run(&self, ct: &CancellationToken, inf: &dyn Infrastructure) -> Result<()> {
        engine_for(inf, &self.node.address)?
            .stop(ct, &self.name)
            .await
    }

    fn command(&self) -> Command {
        Command::new("stop-container", self.node.address.clone())
    }
}

/// Launch a long-lived service container on a set of nodes
pub struct RunContainer {
    nodes: Vec<Node>,
    name: String,
    image: String,
    opts: Vec<String>,
    built_in: ServiceParams,
    extra: ServiceParams,
}

impl RunContainer {
    /// Launch container `name` from `image` on every node of `nodes`.
    pub fn new(
        nodes: Vec<Node>,
        name: impl Into<String>,
        image: impl Into<String>,
        opts: Vec<String>,
        built_in: ServiceParams,
        extra: ServiceParams,
    ) -> Self {
        Self {
            nodes,
            name: name.into(),
            image: image.into(),
            opts,
            built_in,
            extra,
        }
    }

}

#[async_trait]
impl Commander for RunContainer {
    async fn run(&self, ct: &CancellationToken, inf: &dyn Infrastructure) -> Result<()> {
        gather(self.nodes.iter().map(|node| async move {
            engine_for(inf, &node.address)?
                .run_system(ct, &self.name, &self.image, &self.opts, &self.built_in, &self.extra)
                .await
        }))
        .await?;
        Ok(())
    }

    fn command(&self) -> Command {
        Command::new("run-container", addresses(&self.nodes))
    }
}

/// Issue etcd server/peer certificates and install them on a set of nodes
pub struct IssueEtcdCertificates {
    nodes: Vec<Node>,
}

impl IssueEtcdCertificates {
    /// Install etcd TLS material on every node of `nodes`.
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl Commander for IssueEtcdCertificates {
    async fn run(&self, ct: &CancellationToken, inf: &dyn Infrastructure) -> Result<()> {
        let storage = inf.storage();
        let server_ca = CertificateAuthority::from_pem(
            &storage.get_ca_certificate(CaKind::Server).await?,
            &storage.get_ca_key(CaKind::Server).await?,
        )?;
        let peer_ca = CertificateAuthority::from_pem(
            &storage.get_ca_certificate(CaKind::EtcdPeer).await?,
            &storage.get_ca_key(CaKind::EtcdPeer).await?,
        )?;
        let client_ca_cert = storage.get_ca_certificate(CaKind::EtcdClient).await?;

        gather(self.nodes.iter().map(|node| {
            let server = server_ca.issue_server(&node.address);
            let peer = peer_ca.issue_peer(&node.address);
            let peer_ca_cert = peer_ca.ca_cert_pem().to_string();
            let client_ca_cert = client_ca_cert.clone();
            async move {
                let server = server?;
                let peer = peer?;
                let agent = inf.agent(&node.address).ok_or_else(|| {
                    Error::precondition(format!("agent not connected for {}", node.address))
                })?;

                run_ok(agent.as_ref(), ct, node, "mkdir", &["-p", ETCD_PKI_DIR], None).await?;
                for (file, pem, secret) in [
                    ("server.crt", server.cert_pem.as_str(), false),
                    ("server.key", server.key_pem.as_str(), true),
                    ("peer.crt", peer.cert_pem.as_str(), false),
                    ("peer.key", peer.key_pem.as_str(), true),
                    ("ca-client.crt", client_ca_cert.as_str(), false),
                    ("ca-peer.crt", peer_ca_cert.as_str(), false),
                ] {
                    let path = format!("{ETCD_PKI_DIR}/{file}");
                    let mode = if secret { "0600" } else { "0644" };
                    run_ok(
                        agent.as_ref(),
                        ct,
                        node,
                        "install",
                        &["-m", mode, "/dev/stdin", &path],
                        Some(pem.as_bytes()),
                    )
                    .await?;
                }
                Ok(())
            }
        }))
        .await?;
        Ok(())
    }

    fn command(&self) -> Command {
        Command::new("issue-etcd-certificates", addresses(&self.nodes))
    }
}

/// Run one remote command, mapping a non-zero exit to a typed error.
async fn run_ok(
    agent: &dyn Agent,
    ct: &CancellationToken,
    node: &Node,
    command: &str,
    args: &[&str],
    input: Option<&[u8]>,
) -> Result<()> {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let out = match input {
        Some(bytes) => agent.run_with_input(ct, command, &args, bytes).await?,
        None => agent.run(ct, command, &args).await?,
    };
    if out.success() {
        Ok(())
    } else {
        Err(Error::Remote {
            target: node.address.clone(),
            command: format!("{command} {}", args.join(" ")),
            detail: out.stderr_tail(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::engine::MockContainerEngine;
    use crate::infra::MockInfrastructure;

    fn node(address: &str) -> Node {
        Node {
            address: address.to_string(),
            hostname: String::new(),
            control_plane: true,
            labels: Default::default(),
        }
    }

    fn infra_with_engine(engine: MockContainerEngine) -> MockInfrastructure {
        let engine: Arc<dyn crate::engine::ContainerEngine> = Arc::new(engine);
        let mut inf = MockInfrastructure::new();
        inf.expect_engine().returning(move |_| Some(engine.clone()));
        inf
    }

    #[tokio::test]
    async fn image_pull_fans_out_to_every_node() {
        let mut engine = MockContainerEngine::new();
        engine
            .expect_pull_image()
            .times(2)
            .returning(|_, _| Ok(()));
        let inf = infra_with_engine(engine);

        let pull = ImagePull::new(vec![node("10.0.0.1"), node("10.0.0.2")], "etcd:v1");
        pull.run(&CancellationToken::new(), &inf).await.unwrap();
        assert_eq!(pull.command().name, "image-pull");
        assert!(pull.command().target.contains("10.0.0.1,10.0.0.2"));
    }

    #[tokio::test]
    async fn image_pull_fails_when_any_node_fails() {
        let mut engine = MockContainerEngine::new();
        let mut calls = 0;
        engine.expect_pull_image().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Ok(())
            } else {
                Err(Error::transport("pull failed"))
            }
        });
        let inf = infra_with_engine(engine);

        let pull = ImagePull::new(vec![node("10.0.0.1"), node("10.0.0.2")], "etcd:v1");
        let err = pull.run(&CancellationToken::new(), &inf).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn missing_engine_is_a_precondition_error() {
        let mut inf = MockInfrastructure::new();
        inf.expect_engine().returning(|_| None);

        let create = VolumeCreate::new(vec![node("10.0.0.9")], "etcd-cke");
        let err = create.run(&CancellationToken::new(), &inf).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn stop_container_targets_one_node() {
        let mut engine = MockContainerEngine::new();
        engine
            .expect_stop()
            .times(1)
            .returning(|_, name| {
                assert_eq!(name, "etcd");
                Ok(())
            });
        let inf = infra_with_engine(engine);

        let stop = StopContainer::new(node("10.0.0.3"), "etcd");
        stop.run(&CancellationToken::new(), &inf).await.unwrap();
        assert_eq!(stop.command(), Command::new("stop-container", "10.0.0.3"));
    }
}
