//! Observed-state model and the status probe
//!
//! [`ClusterStatus`] is what one tick observed: per-node service state and
//! the etcd quorum view. The probe in [`get_cluster_status`] builds it by
//! fanning out over the nodes (container inspect + data volume check) and
//! asking the etcd membership API once through the control plane
//! endpoints.
//!
//! Observed state is plain data. The decision function consumes it without
//! touching the network, which is what keeps reconciliation pure and
//! testable: tests hand-build a `ClusterStatus` and assert the decision.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

use crate::cluster::{Cluster, Node, ServiceParams};
use crate::infra::Infrastructure;
use crate::op::gather;
use crate::{Error, Result, ETCD_CLIENT_PORT, ETCD_CONTAINER_NAME};

/// Per-request timeout for health probes
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Health of one etcd member as seen from the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EtcdNodeHealth {
    /// The member's `/health` endpoint reported `"health":"true"`
    Healthy,
    /// The endpoint answered but did not report healthy
    Unhealthy,
    /// The endpoint could not be reached
    Unreachable,
}

/// One etcd cluster participant as reported by `MemberList`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtcdMember {
    /// Numeric member ID
    pub id: u64,
    /// Member name; empty until the process has introduced itself
    #[serde(default)]
    pub name: String,
    /// Peer URLs registered for the member
    #[serde(default)]
    pub peer_urls: Vec<String>,
}

/// Observed etcd quorum view
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtcdClusterStatus {
    /// Members keyed by node address
    #[serde(default)]
    pub members: BTreeMap<String, EtcdMember>,
    /// Per-address member health
    #[serde(default)]
    pub member_health: BTreeMap<String, EtcdNodeHealth>,
}

impl EtcdClusterStatus {
    /// True when a strict majority of members reported healthy.
    ///
    /// This is the gate mutating membership changes stand behind: the
    /// decision function refuses to add or remove members while the
    /// cluster cannot afford to lose one.
    pub fn is_healthy(&self) -> bool {
        let healthy = self
            .members
            .keys()
            .filter(|addr| self.member_health.get(*addr) == Some(&EtcdNodeHealth::Healthy))
            .count();
        healthy >= self.members.len() / 2 + 1
    }

    /// Health of the member at `address`, `Unreachable` when unknown.
    pub fn health_of(&self, address: &str) -> EtcdNodeHealth {
        self.member_health
            .get(address)
            .copied()
            .unwrap_or(EtcdNodeHealth::Unreachable)
    }
}

/// Statuses of one long-running service container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// The container is currently running
    #[serde(default)]
    pub running: bool,
    /// Image reference the container was created from
    #[serde(default)]
    pub image: String,
    /// System-required parameters the service was started with
    #[serde(default)]
    pub built_in_params: ServiceParams,
    /// User-supplied parameters the service was started with
    #[serde(default)]
    pub extra_params: ServiceParams,
}

/// Per-node observation of the etcd process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtcdStatus {
    /// Container state and parameter snapshot
    #[serde(flatten)]
    pub service: ServiceStatus,
    /// The persistent data volume exists on the node
    #[serde(default)]
    pub has_data: bool,
}

/// Status of one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// etcd process observation
    #[serde(default)]
    pub etcd: EtcdStatus,
}

/// The working cluster status; the structure mirrors [`Cluster`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStatus {
    /// Per-node statuses, keyed by IP address
    #[serde(default)]
    pub node_statuses: BTreeMap<String, NodeStatus>,
    /// etcd quorum view
    #[serde(default)]
    pub etcd: EtcdClusterStatus,
}

impl ClusterStatus {
    /// Status of the node at `address`, defaulting to "nothing observed".
    pub fn node(&self, address: &str) -> NodeStatus {
        self.node_statuses.get(address).cloned().unwrap_or_default()
    }
}

/// Wire format of the etcd `/health` response body
#[derive(Debug, Deserialize)]
pub struct HealthBody {
    /// `"true"` when the member considers itself healthy
    pub health: String,
    /// Optional explanation for an unhealthy report
    #[serde(default)]
    pub reason: Option<String>,
}

impl HealthBody {
    /// True if the body reports health.
    pub fn is_healthy(&self) -> bool {
        self.health == "true"
    }
}

/// Resolve a member record to a node address.
///
/// A member that has not introduced itself yet has an empty name; its
/// identity is then the host of its first peer URL. A member with no peer
/// URLs at all cannot be attributed to any node.
pub fn guess_member_name(member: &EtcdMember) -> Result<String> {
    if !member.name.is_empty() {
        return Ok(member.name.clone());
    }
    let first = member
        .peer_urls
        .first()
        .ok_or_else(|| Error::precondition("empty PeerURLs"))?;
    let url = Url::parse(first).map_err(|e| Error::fatal(format!("bad peer URL {first}: {e}")))?;
    url.host_str()
        .map(|h| h.to_string())
        .ok_or_else(|| Error::fatal(format!("peer URL {first} has no host")))
}

/// Client URL of the etcd member on `address`.
pub fn etcd_endpoint(address: &str) -> String {
    format!("https://{address}:{ETCD_CLIENT_PORT}")
}

/// Observe the cluster.
///
/// Per-node observation fans out in parallel; a node whose agent is not
/// connected fails the probe (acting on a partial view could look like a
/// fresh cluster and trigger a bootstrap over live data). The etcd quorum
/// view degrades instead: an unreachable membership API yields an empty
/// member map, which the decision function treats as "observe again next
/// tick".
pub async fn get_cluster_status(
    ct: &CancellationToken,
    cluster: &Cluster,
    inf: &dyn Infrastructure,
) -> Result<ClusterStatus> {
    let volname = cluster.options.etcd.volume_name();

    let statuses = gather(
        cluster
            .nodes
            .iter()
            .map(|node| node_status(ct, node, inf, volname)),
    )
    .await?;

    let node_statuses: BTreeMap<String, NodeStatus> = cluster
        .nodes
        .iter()
        .map(|n| n.address.clone())
        .zip(statuses)
        .collect();

    let cp_nodes = cluster.control_plane_nodes();
    let etcd = etcd_cluster_status(ct, &cp_nodes, inf).await?;

    Ok(ClusterStatus {
        node_statuses,
        etcd,
    })
}

async fn node_status(
    ct: &CancellationToken,
    node: &Node,
    inf: &dyn Infrastructure,
    volname: &str,
) -> Result<NodeStatus> {
    let engine = inf
        .engine(&node.address)
        .ok_or_else(|| Error::precondition(format!("agent not connected for {}", node.address)))?;

    let service = engine
        .inspect(ct, ETCD_CONTAINER_NAME)
        .await?
        .unwrap_or_default();
    let has_data = engine.volume_exists(ct, volname).await?;

    Ok(NodeStatus {
        etcd: EtcdStatus { service, has_data },
    })
}

async fn etcd_cluster_status(
    ct: &CancellationToken,
    cp_nodes: &[&Node],
    inf: &dyn Infrastructure,
) -> Result<EtcdClusterStatus> {
    if cp_nodes.is_empty() {
        return Ok(EtcdClusterStatus::default());
    }
    let endpoints: Vec<String> = cp_nodes.iter().map(|n| etcd_endpoint(&n.address)).collect();

    let mut client = match inf.new_etcd_client(&endpoints).await {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "cannot create etcd client; treating membership as unknown");
            return Ok(EtcdClusterStatus::default());
        }
    };

    let resp = tokio::select! {
        _ = ct.cancelled() => return Err(Error::Cancelled),
        resp = client.member_list() => resp,
    };
    let resp = match resp {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, "etcd member list failed; treating membership as unknown");
            return Ok(EtcdClusterStatus::default());
        }
    };

    let mut members = BTreeMap::new();
    for m in resp.members() {
        let member = EtcdMember {
            id: m.id(),
            name: m.name().to_string(),
            peer_urls: m.peer_urls().to_vec(),
        };
        let address = guess_member_name(&member)?;
        members.insert(address, member);
    }

    let http = inf.http_client().await?;
    let probes = members.keys().map(|address| {
        let http = http.clone();
        let address = address.clone();
        async move {
            let health = probe_member_health(&http, &address).await;
            (address, health)
        }
    });
    let member_health = tokio::select! {
        _ = ct.cancelled() => return Err(Error::Cancelled),
        results = futures::future::join_all(probes) => results.into_iter().collect(),
    };

    Ok(EtcdClusterStatus {
        members,
        member_health,
    })
}

async fn probe_member_health(http: &reqwest::Client, address: &str) -> EtcdNodeHealth {
    probe_endpoint_health(http, &etcd_endpoint(address)).await
}

/// Probe one etcd client endpoint's `/health`.
pub(crate) async fn probe_endpoint_health(
    http: &reqwest::Client,
    endpoint: &str,
) -> EtcdNodeHealth {
    let url = format!("{endpoint}/health");
    // an unhealthy member answers 503 with the same JSON body, so the
    // status code is not inspected; only an undeliverable request counts
    // as unreachable
    let resp = match http.get(&url).timeout(HEALTH_PROBE_TIMEOUT).send().await {
        Ok(resp) => resp,
        Err(_) => return EtcdNodeHealth::Unreachable,
    };
    match resp.json::<HealthBody>().await {
        Ok(body) if body.is_healthy() => EtcdNodeHealth::Healthy,
        Ok(body) => {
            if let Some(reason) = body.reason {
                warn!(%endpoint, %reason, "etcd member reports unhealthy");
            }
            EtcdNodeHealth::Unhealthy
        }
        Err(_) => EtcdNodeHealth::Unhealthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: u64, name: &str, peer_urls: &[&str]) -> EtcdMember {
        EtcdMember {
            id,
            name: name.to_string(),
            peer_urls: peer_urls.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn guessing_prefers_the_member_name() {
        let m = member(1, "10.0.0.1", &["https://10.9.9.9:2380"]);
        assert_eq!(guess_member_name(&m).unwrap(), "10.0.0.1");
    }

    #[test]
    fn guessing_falls_back_to_the_peer_url_host() {
        let m = member(1, "", &["https://10.0.0.2:2380"]);
        assert_eq!(guess_member_name(&m).unwrap(), "10.0.0.2");
    }

    #[test]
    fn guessing_rejects_members_without_peer_urls() {
        let m = member(1, "", &[]);
        let err = guess_member_name(&m).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn guessing_rejects_unparsable_peer_urls() {
        let m = member(1, "", &["not a url"]);
        let err = guess_member_name(&m).unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[test]
    fn majority_health_requires_quorum() {
        let mut status = EtcdClusterStatus::default();
        for (i, addr) in ["10.0.0.1", "10.0.0.2", "10.0.0.3"].iter().enumerate() {
            status
                .members
                .insert(addr.to_string(), member(i as u64 + 1, addr, &[]));
        }

        // no health data at all
        assert!(!status.is_healthy());

        status
            .member_health
            .insert("10.0.0.1".to_string(), EtcdNodeHealth::Healthy);
        status
            .member_health
            .insert("10.0.0.2".to_string(), EtcdNodeHealth::Healthy);
        status
            .member_health
            .insert("10.0.0.3".to_string(), EtcdNodeHealth::Unreachable);
        assert!(status.is_healthy());

        status
            .member_health
            .insert("10.0.0.2".to_string(), EtcdNodeHealth::Unhealthy);
        assert!(!status.is_healthy());
    }

    #[test]
    fn health_body_parses_the_reason_field() {
        let body: HealthBody = serde_json::from_str(r#"{"health":"true"}"#).unwrap();
        assert!(body.is_healthy());

        let body: HealthBody =
            serde_json::from_str(r#"{"health":"false","reason":"RAFT NO LEADER"}"#).unwrap();
        assert!(!body.is_healthy());
        assert_eq!(body.reason.as_deref(), Some("RAFT NO LEADER"));
    }
}
