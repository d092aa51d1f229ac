//! The etcd control policy
//!
//! [`etcd_decide_to_do`] is a pure function from `(desired, observed)` to
//! at most one operator. The rules below are ordered; earlier rules
//! outrank later ones, and the order is load-bearing:
//!
//! 1. bootstrap a data-less cluster
//! 2. purge unhealthy members that are not in the manifest
//! 3. destroy unhealthy members on non-control-plane nodes
//! 4. resume control plane members whose add never completed
//! 5. wait while the cluster is unhealthy
//! 6. join new control plane members
//! 7. purge healthy members that are not in the manifest
//! 8. destroy running etcd processes on non-control-plane nodes
//! 9. roll members running the wrong image
//! 10. restart members running with drifted parameters
//! 11. steady state
//!
//! Rule 5 must dominate every rule after it: rules 6 through 10 mutate
//! membership or momentarily stop members, and doing either without
//! quorum loses the cluster. Rules 2 through 4 run before the gate on
//! purpose; they are exactly the repairs that can bring an unhealthy
//! cluster back.

use tracing::warn;

use crate::cluster::{Cluster, EtcdParams, Node, ServiceParams};
use crate::op::etcd::{
    etcd_add_member_op, etcd_boot_op, etcd_built_in_params, etcd_destroy_member_op,
    etcd_endpoints, etcd_remove_member_op, etcd_restart_op, etcd_update_version_op,
    etcd_wait_cluster_op,
};
use crate::op::Operator;
use crate::status::{ClusterStatus, EtcdClusterStatus, EtcdMember, EtcdNodeHealth};

use std::collections::BTreeMap;

/// Decide the next etcd operation, if any.
///
/// Pure: identical inputs produce the identical decision, and nothing here
/// touches the network.
pub fn etcd_decide_to_do(cluster: &Cluster, status: &ClusterStatus) -> Option<Box<dyn Operator>> {
    let cp_nodes = cluster.control_plane_nodes();
    let params = &cluster.options.etcd;
    let image = &cluster.options.images.etcd;

    let bootstrap = cluster
        .nodes
        .iter()
        .all(|n| !status.node(&n.address).etcd.has_data);
    if bootstrap {
        let endpoints = etcd_endpoints(&cp_nodes);
        return Some(Box::new(etcd_boot_op(endpoints, &cp_nodes, params, image)));
    }

    if status.etcd.members.is_empty() {
        warn!("no members of etcd cluster");
        return None;
    }

    let endpoints = etcd_endpoints(&cp_nodes);

    let members = unhealthy_non_cluster_members(&cluster.nodes, &status.etcd);
    if !members.is_empty() {
        return Some(Box::new(etcd_remove_member_op(endpoints, &members)));
    }

    let nodes = unhealthy_non_control_plane_members(&cluster.nodes, &status.etcd);
    if !nodes.is_empty() {
        return Some(Box::new(etcd_destroy_member_op(
            endpoints,
            &nodes,
            &status.etcd.members,
            params,
        )));
    }

    let nodes = unstarted_member_control_planes(&cp_nodes, &status.etcd);
    if !nodes.is_empty() {
        return Some(Box::new(etcd_add_member_op(endpoints, &nodes, params, image)));
    }

    // Everything below mutates membership or momentarily stops members;
    // neither is safe without quorum.
    if !status.etcd.is_healthy() {
        return Some(Box::new(etcd_wait_cluster_op(endpoints)));
    }

    let nodes = new_member_control_planes(&cp_nodes, &status.etcd);
    if !nodes.is_empty() {
        return Some(Box::new(etcd_add_member_op(endpoints, &nodes, params, image)));
    }

    let members = healthy_non_cluster_members(&cluster.nodes, &status.etcd);
    if !members.is_empty() {
        return Some(Box::new(etcd_remove_member_op(endpoints, &members)));
    }

    let nodes = running_non_control_plane_members(&cluster.nodes, status);
    if !nodes.is_empty() {
        return Some(Box::new(etcd_destroy_member_op(
            endpoints,
            &nodes,
            &status.etcd.members,
            params,
        )));
    }

    let nodes = outdated_control_plane_members(&cp_nodes, status, image);
    if !nodes.is_empty() {
        return Some(Box::new(etcd_update_version_op(
            endpoints, &nodes, &cp_nodes, params, image,
        )));
    }

    let nodes = drifted_control_plane_members(&cp_nodes, status, params);
    if !nodes.is_empty() {
        return Some(Box::new(etcd_restart_op(
            endpoints, &nodes, &cp_nodes, params, image,
        )));
    }

    None
}

fn unhealthy_non_cluster_members(
    all_nodes: &[Node],
    etcd: &EtcdClusterStatus,
) -> BTreeMap<String, EtcdMember> {
    etcd.members
        .iter()
        .filter(|(address, _)| !all_nodes.iter().any(|n| &n.address == *address))
        .filter(|(address, _)| etcd.health_of(address) != EtcdNodeHealth::Healthy)
        .map(|(address, member)| (address.clone(), member.clone()))
        .collect()
}

fn healthy_non_cluster_members(
    all_nodes: &[Node],
    etcd: &EtcdClusterStatus,
) -> BTreeMap<String, EtcdMember> {
    etcd.members
        .iter()
        .filter(|(address, _)| !all_nodes.iter().any(|n| &n.address == *address))
        .filter(|(address, _)| etcd.health_of(address) == EtcdNodeHealth::Healthy)
        .map(|(address, member)| (address.clone(), member.clone()))
        .collect()
}

fn unhealthy_non_control_plane_members<'a>(
    all_nodes: &'a [Node],
    etcd: &EtcdClusterStatus,
) -> Vec<&'a Node> {
    all_nodes
        .iter()
        .filter(|n| !n.control_plane)
        .filter(|n| etcd.members.contains_key(&n.address))
        .filter(|n| etcd.health_of(&n.address) != EtcdNodeHealth::Healthy)
        .collect()
}

fn unstarted_member_control_planes<'a>(
    cp_nodes: &[&'a Node],
    etcd: &EtcdClusterStatus,
) -> Vec<&'a Node> {
    cp_nodes
        .iter()
        .filter(|n| {
            etcd.members
                .get(&n.address)
                .is_some_and(|m| m.name.is_empty())
        })
        .copied()
        .collect()
}

fn new_member_control_planes<'a>(
    cp_nodes: &[&'a Node],
    etcd: &EtcdClusterStatus,
) -> Vec<&'a Node> {
    cp_nodes
        .iter()
        .filter(|n| !etcd.members.contains_key(&n.address))
        .copied()
        .collect()
}

fn running_non_control_plane_members<'a>(
    all_nodes: &'a [Node],
    status: &ClusterStatus,
) -> Vec<&'a Node> {
    all_nodes
        .iter()
        .filter(|n| !n.control_plane)
        .filter(|n| status.node(&n.address).etcd.service.running)
        .collect()
}

fn outdated_control_plane_members<'a>(
    cp_nodes: &[&'a Node],
    status: &ClusterStatus,
    image: &str,
) -> Vec<&'a Node> {
    cp_nodes
        .iter()
        .filter(|n| status.node(&n.address).etcd.service.image != image)
        .copied()
        .collect()
}

fn drifted_control_plane_members<'a>(
    cp_nodes: &[&'a Node],
    status: &ClusterStatus,
    params: &EtcdParams,
) -> Vec<&'a Node> {
    cp_nodes
        .iter()
        .filter(|n| {
            let observed = status.node(&n.address).etcd.service;
            // the initial-cluster content is irrelevant here: every
            // --initial-* token is excluded from comparison
            let desired_built_in = etcd_built_in_params(n, &[], "new");
            !params_equal(&observed.built_in_params, &desired_built_in)
                || !params_equal(&observed.extra_params, &params.service_params)
        })
        .copied()
        .collect()
}

/// Compare two parameter sets for restart-relevant equality.
///
/// Arguments compare as multisets with every `--initial-*` token removed
/// (those take effect only at bootstrap and must not force restarts
/// thereafter). Binds compare as a multiset of full mount tuples, env as a
/// map.
pub fn params_equal(a: &ServiceParams, b: &ServiceParams) -> bool {
    arg_multiset(a) == arg_multiset(b)
        && bind_multiset(a) == bind_multiset(b)
        && a.extra_env == b.extra_env
}

fn arg_multiset(params: &ServiceParams) -> BTreeMap<&str, usize> {
    let mut set = BTreeMap::new();
    for arg in &params.extra_arguments {
        if arg.starts_with("--initial-") {
            continue;
        }
        *set.entry(arg.as_str()).or_insert(0) += 1;
    }
    set
}

fn bind_multiset(params: &ServiceParams) -> BTreeMap<&crate::cluster::Mount, usize> {
    let mut set = BTreeMap::new();
    for bind in &params.extra_binds {
        *set.entry(bind).or_insert(0) += 1;
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Mount, Options};
    use crate::status::{EtcdStatus, NodeStatus, ServiceStatus};

    fn node(address: &str, control_plane: bool) -> Node {
        Node {
            address: address.to_string(),
            hostname: String::new(),
            control_plane,
            labels: Default::default(),
        }
    }

    fn cluster(addresses: &[(&str, bool)]) -> Cluster {
        Cluster {
            name: "test".to_string(),
            nodes: addresses.iter().map(|(a, cp)| node(a, *cp)).collect(),
            options: Options::default(),
        }
    }

    fn member(id: u64, address: &str) -> EtcdMember {
        EtcdMember {
            id,
            name: address.to_string(),
            peer_urls: vec![format!("https://{address}:2380")],
        }
    }

    /// Status where every listed address is a named, healthy member whose
    /// container runs the desired image with the desired parameters.
    fn converged_status(cluster: &Cluster) -> ClusterStatus {
        let mut status = ClusterStatus::default();
        for (i, n) in cluster.nodes.iter().enumerate() {
            if !n.control_plane {
                continue;
            }
            status
                .etcd
                .members
                .insert(n.address.clone(), member(i as u64 + 1, &n.address));
            status
                .etcd
                .member_health
                .insert(n.address.clone(), EtcdNodeHealth::Healthy);
            status.node_statuses.insert(
                n.address.clone(),
                NodeStatus {
                    etcd: EtcdStatus {
                        service: ServiceStatus {
                            running: true,
                            image: cluster.options.images.etcd.clone(),
                            built_in_params: etcd_built_in_params(n, &[], "new"),
                            extra_params: cluster.options.etcd.service_params.clone(),
                        },
                        has_data: true,
                    },
                },
            );
        }
        status
    }

    fn decide_name(cluster: &Cluster, status: &ClusterStatus) -> Option<&'static str> {
        etcd_decide_to_do(cluster, status).map(|op| op.name())
    }

    #[test]
    fn data_less_cluster_bootstraps() {
        let c = cluster(&[("10.0.0.1", true), ("10.0.0.2", true), ("10.0.0.3", true)]);
        let status = ClusterStatus::default();
        assert_eq!(decide_name(&c, &status), Some("etcd-bootstrap"));
    }

    #[test]
    fn existing_data_without_members_refuses_to_bootstrap() {
        let c = cluster(&[("10.0.0.1", true), ("10.0.0.2", true)]);
        let mut status = ClusterStatus::default();
        status.node_statuses.insert(
            "10.0.0.1".to_string(),
            NodeStatus {
                etcd: EtcdStatus {
                    has_data: true,
                    ..Default::default()
                },
            },
        );
        assert_eq!(decide_name(&c, &status), None);
    }

    #[test]
    fn converged_cluster_is_steady_state() {
        let c = cluster(&[("10.0.0.1", true), ("10.0.0.2", true), ("10.0.0.3", true)]);
        let status = converged_status(&c);
        assert_eq!(decide_name(&c, &status), None);
    }

    #[test]
    fn the_decision_is_deterministic() {
        let c = cluster(&[("10.0.0.1", true), ("10.0.0.2", true), ("10.0.0.3", true)]);
        let mut status = converged_status(&c);
        status
            .etcd
            .members
            .insert("10.0.0.9".to_string(), member(9, "10.0.0.9"));
        assert_eq!(decide_name(&c, &status), decide_name(&c, &status));
    }

    #[test]
    fn unhealthy_foreign_member_is_purged_before_the_health_gate() {
        let c = cluster(&[("10.0.0.1", true), ("10.0.0.2", true), ("10.0.0.3", true)]);
        let mut status = converged_status(&c);
        status
            .etcd
            .members
            .insert("10.0.0.9".to_string(), member(9, "10.0.0.9"));
        status
            .etcd
            .member_health
            .insert("10.0.0.9".to_string(), EtcdNodeHealth::Unreachable);
        assert_eq!(decide_name(&c, &status), Some("etcd-remove-member"));
    }

    #[test]
    fn healthy_foreign_member_is_purged_only_with_quorum() {
        let c = cluster(&[("10.0.0.1", true), ("10.0.0.2", true), ("10.0.0.3", true)]);
        let mut status = converged_status(&c);
        status
            .etcd
            .members
            .insert("10.0.0.9".to_string(), member(9, "10.0.0.9"));
        status
            .etcd
            .member_health
            .insert("10.0.0.9".to_string(), EtcdNodeHealth::Healthy);
        assert_eq!(decide_name(&c, &status), Some("etcd-remove-member"));

        // drop quorum: the wait gate takes over
        status
            .etcd
            .member_health
            .insert("10.0.0.1".to_string(), EtcdNodeHealth::Unreachable);
        status
            .etcd
            .member_health
            .insert("10.0.0.2".to_string(), EtcdNodeHealth::Unreachable);
        assert_eq!(decide_name(&c, &status), Some("etcd-wait-cluster"));
    }

    #[test]
    fn unhealthy_worker_member_is_destroyed() {
        let c = cluster(&[("10.0.0.1", true), ("10.0.0.2", true), ("10.0.0.4", false)]);
        let mut status = converged_status(&c);
        status
            .etcd
            .members
            .insert("10.0.0.4".to_string(), member(4, "10.0.0.4"));
        status
            .etcd
            .member_health
            .insert("10.0.0.4".to_string(), EtcdNodeHealth::Unhealthy);
        assert_eq!(decide_name(&c, &status), Some("etcd-destroy-member"));
    }

    #[test]
    fn unstarted_member_is_resumed_even_while_unhealthy() {
        let c = cluster(&[("10.0.0.1", true), ("10.0.0.2", true), ("10.0.0.3", true)]);
        let mut status = converged_status(&c);
        // 10.0.0.3's MemberAdd went through but the process never joined
        status.etcd.members.insert(
            "10.0.0.3".to_string(),
            EtcdMember {
                id: 3,
                name: String::new(),
                peer_urls: vec!["https://10.0.0.3:2380".to_string()],
            },
        );
        status
            .etcd
            .member_health
            .insert("10.0.0.3".to_string(), EtcdNodeHealth::Unreachable);
        assert_eq!(decide_name(&c, &status), Some("etcd-add-member"));
    }

    #[test]
    fn new_control_plane_joins_only_with_quorum() {
        let mut c = cluster(&[("10.0.0.1", true), ("10.0.0.2", true), ("10.0.0.3", true)]);
        let status = converged_status(&c);
        c.nodes.push(node("10.0.0.4", true));
        assert_eq!(decide_name(&c, &status), Some("etcd-add-member"));
    }

    #[test]
    fn running_worker_etcd_is_destroyed() {
        let c = cluster(&[("10.0.0.1", true), ("10.0.0.2", true), ("10.0.0.4", false)]);
        let mut status = converged_status(&c);
        status.node_statuses.insert(
            "10.0.0.4".to_string(),
            NodeStatus {
                etcd: EtcdStatus {
                    service: ServiceStatus {
                        running: true,
                        ..Default::default()
                    },
                    has_data: true,
                },
            },
        );
        assert_eq!(decide_name(&c, &status), Some("etcd-destroy-member"));
    }

    #[test]
    fn image_drift_rolls_the_version() {
        let c = cluster(&[("10.0.0.1", true), ("10.0.0.2", true), ("10.0.0.3", true)]);
        let mut status = converged_status(&c);
        status
            .node_statuses
            .get_mut("10.0.0.2")
            .unwrap()
            .etcd
            .service
            .image = "etcd:old".to_string();
        assert_eq!(decide_name(&c, &status), Some("etcd-update-version"));
    }

    #[test]
    fn parameter_drift_restarts() {
        let mut c = cluster(&[("10.0.0.1", true), ("10.0.0.2", true), ("10.0.0.3", true)]);
        let status = converged_status(&c);
        c.options.etcd.service_params.extra_arguments = vec!["--election-timeout=1500".to_string()];
        assert_eq!(decide_name(&c, &status), Some("etcd-restart"));
    }

    #[test]
    fn image_drift_outranks_parameter_drift() {
        let mut c = cluster(&[("10.0.0.1", true), ("10.0.0.2", true), ("10.0.0.3", true)]);
        let mut status = converged_status(&c);
        c.options.etcd.service_params.extra_arguments = vec!["--foo=1".to_string()];
        status
            .node_statuses
            .get_mut("10.0.0.1")
            .unwrap()
            .etcd
            .service
            .image = "etcd:old".to_string();
        assert_eq!(decide_name(&c, &status), Some("etcd-update-version"));
    }

    #[test]
    fn initial_flags_never_count_as_drift() {
        let observed = ServiceParams {
            extra_arguments: vec![
                "--foo=1".to_string(),
                "--initial-cluster-token=cke".to_string(),
            ],
            ..Default::default()
        };
        let desired = ServiceParams {
            extra_arguments: vec!["--foo=1".to_string()],
            ..Default::default()
        };
        assert!(params_equal(&observed, &desired));
    }

    #[test]
    fn argument_comparison_is_a_multiset() {
        let twice = ServiceParams {
            extra_arguments: vec!["--foo=1".to_string(), "--foo=1".to_string()],
            ..Default::default()
        };
        let once = ServiceParams {
            extra_arguments: vec!["--foo=1".to_string()],
            ..Default::default()
        };
        assert!(!params_equal(&twice, &once));

        let reordered = ServiceParams {
            extra_arguments: vec!["--b=2".to_string(), "--a=1".to_string()],
            ..Default::default()
        };
        let ordered = ServiceParams {
            extra_arguments: vec!["--a=1".to_string(), "--b=2".to_string()],
            ..Default::default()
        };
        assert!(params_equal(&reordered, &ordered));
    }

    #[test]
    fn bind_comparison_ignores_order_but_not_flags() {
        let bind = |src: &str, ro: bool| Mount {
            source: src.to_string(),
            destination: "/data".to_string(),
            read_only: ro,
            propagation: String::new(),
            label: String::new(),
        };
        let a = ServiceParams {
            extra_binds: vec![bind("x", false), bind("y", true)],
            ..Default::default()
        };
        let b = ServiceParams {
            extra_binds: vec![bind("y", true), bind("x", false)],
            ..Default::default()
        };
        assert!(params_equal(&a, &b));

        let c = ServiceParams {
            extra_binds: vec![bind("x", true), bind("y", true)],
            ..Default::default()
        };
        assert!(!params_equal(&a, &c));
    }

    #[test]
    fn env_comparison_is_a_map() {
        let a = ServiceParams {
            extra_env: [("A".to_string(), "1".to_string())].into(),
            ..Default::default()
        };
        let b = ServiceParams {
            extra_env: [("A".to_string(), "2".to_string())].into(),
            ..Default::default()
        };
        assert!(!params_equal(&a, &b));
        assert!(params_equal(&a, &a.clone()));
    }
}
