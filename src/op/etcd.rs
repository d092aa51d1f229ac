//! etcd operators and commanders
//!
//! The operators here implement the member lifecycle of the managed etcd
//! cluster: bootstrap, join, removal, destruction, rolling version
//! updates, and parameter-drift restarts. Ordering within each operator is
//! what keeps quorum alive; the sequences below are load-bearing, not
//! stylistic.
//!
//! Two rules run through all of them:
//!
//! - A member is only momentarily stopped behind a health gate
//!   ([`WaitEtcdSync`]) that demands quorum, or quorum plus one spare
//!   before destructive changes.
//! - A node rejoining the cluster has its volume wiped first so it cannot
//!   present stale raft state; a member merely restarting keeps its data
//!   directory untouched.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cluster::{EtcdParams, Node, ServiceParams};
use crate::infra::Infrastructure;
use crate::status::{etcd_endpoint, EtcdMember, EtcdNodeHealth};
use crate::{Error, Result, ETCD_CONTAINER_NAME, ETCD_PEER_PORT, ETCD_PKI_DIR};

use super::common::{
    ImagePull, IssueEtcdCertificates, RunContainer, StopContainer, VolumeCreate, VolumeRemove,
};
use super::{engine_for, Command, Commander, StepSequence};

/// Default number of health-wait attempts
pub const ETCD_SYNC_ATTEMPTS: usize = 3;

/// Pause between health-wait attempts
const SYNC_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Peer URL of the etcd member on `address`.
pub fn peer_url(address: &str) -> String {
    format!("https://{address}:{ETCD_PEER_PORT}")
}

/// Client endpoints for a control plane set.
pub fn etcd_endpoints(cp_nodes: &[&Node]) -> Vec<String> {
    cp_nodes.iter().map(|n| etcd_endpoint(&n.address)).collect()
}

/// `initial-cluster` entries naming every control plane node.
pub fn initial_cluster_all(cp_nodes: &[&Node]) -> Vec<String> {
    cp_nodes
        .iter()
        .map(|n| format!("{}={}", n.address, peer_url(&n.address)))
        .collect()
}

/// `initial-cluster` entries from a live member list.
///
/// A member that has not introduced itself yet has an empty name; it is
/// labeled with the address of the node being added, matching the `--name`
/// that node will start with. A member carrying more than one peer URL
/// would silently inflate the bootstrap string, so it is rejected instead.
pub fn initial_cluster_entries(members: &[EtcdMember], target_address: &str) -> Result<Vec<String>> {
    let mut entries = Vec::new();
    for member in members {
        if member.peer_urls.len() > 1 {
            return Err(Error::fatal(format!(
                "member {:x} has {} peer URLs",
                member.id,
                member.peer_urls.len()
            )));
        }
        for url in &member.peer_urls {
            let label = if member.name.is_empty() {
                target_address
            } else {
                &member.name
            };
            entries.push(format!("{label}={url}"));
        }
    }
    Ok(entries)
}

/// True if any of `urls` has `address` as its host component.
pub fn address_in_urls(address: &str, urls: &[String]) -> Result<bool> {
    for raw in urls {
        let url = url::Url::parse(raw)
            .map_err(|e| Error::fatal(format!("bad peer URL {raw}: {e}")))?;
        if url.host_str() == Some(address) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Engine options mounting the data volume and the TLS material.
fn etcd_container_opts(volname: &str) -> Vec<String> {
    vec![
        "--mount".to_string(),
        format!("type=volume,src={volname},dst=/var/lib/etcd"),
        format!("--volume={ETCD_PKI_DIR}:{ETCD_PKI_DIR}:ro"),
    ]
}

/// The system-required etcd argv for one member.
///
/// Every argument uses the `--flag=value` form: drift detection compares
/// tokens as strings, and the split form would never compare equal to what
/// a container reports.
pub fn etcd_built_in_params(node: &Node, initial_cluster: &[String], state: &str) -> ServiceParams {
    let addr = &node.address;
    let args = vec![
        format!("--name={addr}"),
        "--listen-peer-urls=https://0.0.0.0:2380".to_string(),
        "--listen-client-urls=https://0.0.0.0:2379".to_string(),
        format!("--initial-advertise-peer-urls=https://{addr}:2380"),
        format!("--advertise-client-urls=https://{addr}:2379"),
        format!("--cert-file={ETCD_PKI_DIR}/server.crt"),
        format!("--key-file={ETCD_PKI_DIR}/server.key"),
        "--client-cert-auth=true".to_string(),
        format!("--trusted-ca-file={ETCD_PKI_DIR}/ca-client.crt"),
        format!("--peer-cert-file={ETCD_PKI_DIR}/peer.crt"),
        format!("--peer-key-file={ETCD_PKI_DIR}/peer.key"),
        "--peer-client-cert-auth=true".to_string(),
        format!("--peer-trusted-ca-file={ETCD_PKI_DIR}/ca-peer.crt"),
        format!("--initial-cluster={}", initial_cluster.join(",")),
        "--initial-cluster-token=cke".to_string(),
        format!("--initial-cluster-state={state}"),
        "--enable-v2=false".to_string(),
        "--auto-compaction-mode=periodic".to_string(),
        "--auto-compaction-retention=24".to_string(),
    ];
    ServiceParams {
        extra_arguments: args,
        ..Default::default()
    }
}

// =============================================================================
// Commanders
// =============================================================================

/// Register a node with the etcd cluster and start its member process
pub struct AddEtcdMember {
    endpoints: Vec<String>,
    node: Node,
    opts: Vec<String>,
    extra: ServiceParams,
    image: String,
}

impl AddEtcdMember {
    /// Add `node` to the cluster reachable at `endpoints`.
    pub fn new(
        endpoints: Vec<String>,
        node: Node,
        opts: Vec<String>,
        extra: ServiceParams,
        image: impl Into<String>,
    ) -> Self {
        Self {
            endpoints,
            node,
            opts,
            extra,
            image: image.into(),
        }
    }
}

#[async_trait]
impl Commander for AddEtcdMember {
    async fn run(&self, ct: &CancellationToken, inf: &dyn Infrastructure) -> Result<()> {
        let mut client = inf.new_etcd_client(&self.endpoints).await?;

        let resp = tokio::select! {
            _ = ct.cancelled() => return Err(Error::Cancelled),
            resp = client.member_list() => resp?,
        };
        let mut members: Vec<EtcdMember> = resp
            .members()
            .iter()
            .map(|m| EtcdMember {
                id: m.id(),
                name: m.name().to_string(),
                peer_urls: m.peer_urls().to_vec(),
            })
            .collect();

        let mut in_member = false;
        for member in &members {
            if address_in_urls(&self.node.address, &member.peer_urls)? {
                in_member = true;
                break;
            }
        }

        if !in_member {
            let resp = tokio::select! {
                _ = ct.cancelled() => return Err(Error::Cancelled),
                resp = client.member_add([peer_url(&self.node.address)], None) => resp?,
            };
            members = resp
                .member_list()
                .iter()
                .map(|m| EtcdMember {
                    id: m.id(),
                    name: m.name().to_string(),
                    peer_urls: m.peer_urls().to_vec(),
                })
                .collect();
        }

        let engine = engine_for(inf, &self.node.address)?;
        if let Some(status) = engine.inspect(ct, ETCD_CONTAINER_NAME).await? {
            if status.running {
                return Ok(());
            }
        }

        let initial_cluster = initial_cluster_entries(&members, &self.node.address)?;
        engine
            .run_system(
                ct,
                ETCD_CONTAINER_NAME,
                &self.image,
                &self.opts,
                &etcd_built_in_params(&self.node, &initial_cluster, "existing"),
                &self.extra,
            )
            .await
    }

    fn command(&self) -> Command {
        Command::new("add-etcd-member", self.node.address.clone())
    }
}

/// Remove members from the etcd cluster by ID
pub struct RemoveEtcdMember {
    endpoints: Vec<String>,
    ids: Vec<u64>,
}

impl RemoveEtcdMember {
    /// Remove `ids` from the cluster reachable at `endpoints`. IDs are
    /// removed in ascending order regardless of input order.
    pub fn new(endpoints: Vec<String>, mut ids: Vec<u64>) -> Self {
        ids.sort_unstable();
        Self { endpoints, ids }
    }
}

#[async_trait]
impl Commander for RemoveEtcdMember {
    async fn run(&self, ct: &CancellationToken, inf: &dyn Infrastructure) -> Result<()> {
        if self.ids.is_empty() {
            return Ok(());
        }
        let mut client = inf.new_etcd_client(&self.endpoints).await?;
        for id in &self.ids {
            tokio::select! {
                _ = ct.cancelled() => return Err(Error::Cancelled),
                resp = client.member_remove(*id) => { resp?; }
            }
        }
        Ok(())
    }

    fn command(&self) -> Command {
        let ids: Vec<String> = self.ids.iter().map(|id| id.to_string()).collect();
        Command::new("remove-etcd-member", ids.join(","))
    }
}

/// Wait until enough endpoints report healthy
pub struct WaitEtcdSync {
    endpoints: Vec<String>,
    redundancy: usize,
    attempts: usize,
}

impl WaitEtcdSync {
    /// Wait for quorum plus `redundancy` healthy endpoints.
    pub fn new(endpoints: Vec<String>, redundancy: usize) -> Self {
        Self::with_attempts(endpoints, redundancy, ETCD_SYNC_ATTEMPTS)
    }

    /// Like [`WaitEtcdSync::new`] with an explicit attempt budget.
    pub fn with_attempts(endpoints: Vec<String>, redundancy: usize, attempts: usize) -> Self {
        Self {
            endpoints,
            redundancy,
            attempts,
        }
    }
}

#[async_trait]
impl Commander for WaitEtcdSync {
    async fn run(&self, ct: &CancellationToken, inf: &dyn Infrastructure) -> Result<()> {
        let http = inf.http_client().await?;
        let required = self.endpoints.len() / 2 + 1 + self.redundancy;

        for attempt in 0..self.attempts {
            if attempt > 0 {
                tokio::select! {
                    _ = ct.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(SYNC_RETRY_INTERVAL) => {}
                }
            }

            let probes = self
                .endpoints
                .iter()
                .map(|ep| crate::status::probe_endpoint_health(&http, ep));
            let healthy = futures::future::join_all(probes)
                .await
                .into_iter()
                .filter(|h| *h == EtcdNodeHealth::Healthy)
                .count();
            if healthy >= required {
                return Ok(());
            }
        }
        Err(Error::SyncTimeout)
    }

    fn command(&self) -> Command {
        Command::new("wait-etcd-sync", self.endpoints.join(","))
    }
}

// =============================================================================
// Operators
// =============================================================================

/// Bootstrap a fresh etcd cluster over the control plane nodes.
pub fn etcd_boot_op(
    endpoints: Vec<String>,
    cp_nodes: &[&Node],
    params: &EtcdParams,
    image: &str,
) -> StepSequence {
    let volname = params.volume_name();
    let opts = etcd_container_opts(volname);
    let all: Vec<Node> = cp_nodes.iter().map(|n| (*n).clone()).collect();
    let initial_cluster = initial_cluster_all(cp_nodes);

    let mut steps: Vec<Box<dyn Commander>> = vec![
        Box::new(ImagePull::new(all.clone(), image)),
        Box::new(IssueEtcdCertificates::new(all.clone())),
        Box::new(VolumeCreate::new(all.clone(), volname)),
    ];
    for node in &all {
        steps.push(Box::new(RunContainer::new(
            vec![node.clone()],
            ETCD_CONTAINER_NAME,
            image,
            opts.clone(),
            etcd_built_in_params(node, &initial_cluster, "new"),
            params.service_params.clone(),
        )));
    }
    steps.push(Box::new(WaitEtcdSync::new(endpoints, 0)));
    StepSequence::new("etcd-bootstrap", steps)
}

/// Join nodes to an existing etcd cluster, one at a time.
///
/// Each target is wiped (stop, volume-remove) before joining so a
/// rejoining node cannot present stale raft state, and the operator waits
/// for the new member to sync before moving to the next target.
pub fn etcd_add_member_op(
    endpoints: Vec<String>,
    targets: &[&Node],
    params: &EtcdParams,
    image: &str,
) -> StepSequence {
    let volname = params.volume_name();
    let opts = etcd_container_opts(volname);

    let mut steps: Vec<Box<dyn Commander>> = Vec::new();
    for target in targets {
        let node = (*target).clone();
        steps.push(Box::new(ImagePull::new(vec![node.clone()], image)));
        steps.push(Box::new(StopContainer::new(node.clone(), ETCD_CONTAINER_NAME)));
        steps.push(Box::new(VolumeRemove::new(vec![node.clone()], volname)));
        steps.push(Box::new(VolumeCreate::new(vec![node.clone()], volname)));
        steps.push(Box::new(IssueEtcdCertificates::new(vec![node.clone()])));
        steps.push(Box::new(AddEtcdMember::new(
            endpoints.clone(),
            node.clone(),
            opts.clone(),
            params.service_params.clone(),
            image,
        )));
        steps.push(Box::new(WaitEtcdSync::new(
            vec![etcd_endpoint(&node.address)],
            0,
        )));
    }
    StepSequence::new("etcd-add-member", steps)
}

/// Remove members that should not exist, by ID, ascending.
pub fn etcd_remove_member_op(
    endpoints: Vec<String>,
    targets: &BTreeMap<String, EtcdMember>,
) -> StepSequence {
    let ids: Vec<u64> = targets.values().map(|m| m.id).collect();
    StepSequence::new(
        "etcd-remove-member",
        vec![Box::new(RemoveEtcdMember::new(endpoints, ids))],
    )
}

/// Remove nodes from the cluster and tear their etcd processes down.
pub fn etcd_destroy_member_op(
    endpoints: Vec<String>,
    targets: &[&Node],
    members: &BTreeMap<String, EtcdMember>,
    params: &EtcdParams,
) -> StepSequence {
    let volname = params.volume_name();

    let mut steps: Vec<Box<dyn Commander>> = Vec::new();
    for target in targets {
        let node = (*target).clone();
        let ids: Vec<u64> = members
            .get(&node.address)
            .map(|m| vec![m.id])
            .unwrap_or_default();
        steps.push(Box::new(RemoveEtcdMember::new(endpoints.clone(), ids)));
        steps.push(Box::new(WaitEtcdSync::new(endpoints.clone(), 0)));
        steps.push(Box::new(StopContainer::new(node.clone(), ETCD_CONTAINER_NAME)));
        steps.push(Box::new(VolumeRemove::new(vec![node], volname)));
    }
    StepSequence::new("etcd-destroy-member", steps)
}

/// Roll the etcd image across targets, one member at a time.
///
/// The redundancy-1 gate means a momentarily stopped member still leaves
/// quorum plus one, so one concurrent failure cannot break the cluster.
/// The restarted member keeps its data directory; `initial-cluster` is
/// rebuilt from the control plane set with state `new`, which is valid
/// precisely because the member already exists and its volume is intact.
/// Do not wipe the volume here.
pub fn etcd_update_version_op(
    endpoints: Vec<String>,
    targets: &[&Node],
    cp_nodes: &[&Node],
    params: &EtcdParams,
    image: &str,
) -> StepSequence {
    rolling_restart_op("etcd-update-version", endpoints, targets, cp_nodes, params, image, true)
}

/// Restart targets to pick up changed parameters. Same shape as a version
/// update, minus the image pull.
pub fn etcd_restart_op(
    endpoints: Vec<String>,
    targets: &[&Node],
    cp_nodes: &[&Node],
    params: &EtcdParams,
    image: &str,
) -> StepSequence {
    rolling_restart_op("etcd-restart", endpoints, targets, cp_nodes, params, image, false)
}

fn rolling_restart_op(
    name: &'static str,
    endpoints: Vec<String>,
    targets: &[&Node],
    cp_nodes: &[&Node],
    params: &EtcdParams,
    image: &str,
    pull: bool,
) -> StepSequence {
    let volname = params.volume_name();
    let opts = etcd_container_opts(volname);
    let initial_cluster = initial_cluster_all(cp_nodes);

    let mut steps: Vec<Box<dyn Commander>> = Vec::new();
    for target in targets {
        let node = (*target).clone();
        steps.push(Box::new(WaitEtcdSync::new(endpoints.clone(), 1)));
        if pull {
            steps.push(Box::new(ImagePull::new(vec![node.clone()], image)));
        }
        steps.push(Box::new(StopContainer::new(node.clone(), ETCD_CONTAINER_NAME)));
        steps.push(Box::new(RunContainer::new(
            vec![node.clone()],
            ETCD_CONTAINER_NAME,
            image,
            opts.clone(),
            etcd_built_in_params(&node, &initial_cluster, "new"),
            params.service_params.clone(),
        )));
    }
    StepSequence::new(name, steps)
}

/// Wait for the cluster to become healthy before mutating anything.
pub fn etcd_wait_cluster_op(endpoints: Vec<String>) -> StepSequence {
    StepSequence::new(
        "etcd-wait-cluster",
        vec![Box::new(WaitEtcdSync::new(endpoints, 0))],
    )
}
