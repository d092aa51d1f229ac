//! Anneal - declarative Kubernetes control plane operator for bare-metal nodes
//!
//! Anneal drives a set of plain nodes toward a desired cluster state. The
//! user supplies a cluster manifest (nodes and roles, image versions,
//! service parameters); anneal observes what is actually running on each
//! node and the health of the etcd quorum, and produces operations that
//! close the gap. Operations execute against nodes through a container
//! engine over SSH.
//!
//! # Architecture
//!
//! Each control tick runs `observe → decide → execute`:
//! - the status probe builds a [`status::ClusterStatus`] from the nodes and
//!   the etcd membership API
//! - the decision function in [`reconcile`] returns at most one
//!   [`op::Operator`] per tick
//! - the tick loop drains the operator, running each emitted
//!   [`op::Commander`] serially against the [`infra::Infrastructure`]
//!
//! Operators never outlive a tick. A crash mid-operator is indistinguishable
//! from an unfinished state; the next tick re-derives what to do from
//! observed status. That re-derivation is the recovery mechanism.
//!
//! # Modules
//!
//! - [`cluster`] - desired-state model (nodes, service parameters, options)
//! - [`status`] - observed-state model and the status probe
//! - [`agent`] - remote command execution on one node over SSH
//! - [`engine`] - typed container-engine wrapper built on an agent
//! - [`pki`] - certificate issuance for etcd server/peer/client TLS
//! - [`storage`] - cluster-configuration store interface
//! - [`infra`] - capability bundle handed to every commander
//! - [`op`] - operator/commander framework and the concrete commanders
//! - [`reconcile`] - the etcd control policy (pure decision function)
//! - [`server`] - the tick loop
//! - [`error`] - error types for the operator

#![deny(missing_docs)]

pub mod agent;
pub mod cluster;
pub mod engine;
pub mod error;
pub mod infra;
pub mod op;
pub mod pki;
pub mod reconcile;
pub mod server;
pub mod status;
pub mod storage;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// These constants define the wire-visible defaults used throughout anneal.
// Centralizing them here keeps the manifest defaults, the argv builders, and
// the test fixtures consistent.

/// Name of the etcd container on every control plane node
pub const ETCD_CONTAINER_NAME: &str = "etcd";

/// Default named volume backing /var/lib/etcd on each control plane node
pub const DEFAULT_ETCD_VOLUME_NAME: &str = "etcd-cke";

/// Default etcd container image
pub const DEFAULT_ETCD_IMAGE: &str = "gcr.io/etcd-development/etcd:v3.5.16";

/// etcd peer (raft) port
pub const ETCD_PEER_PORT: u16 = 2380;

/// etcd client port
pub const ETCD_CLIENT_PORT: u16 = 2379;

/// Directory on each node holding the etcd TLS material, bind-mounted
/// read-only into the container
pub const ETCD_PKI_DIR: &str = "/etc/etcd/pki";
