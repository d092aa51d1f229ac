//! Operator/commander framework
//!
//! An [`Operator`] is an ordered, resumable producer of commanders for one
//! reconciliation intent (`etcd-bootstrap`, `etcd-add-member`, ...). A
//! [`Commander`] is one atomic, idempotent remote action. The tick loop
//! drains an operator by asking for the next commander and running it
//! against the infrastructure, strictly serially, until the operator is
//! exhausted or a commander fails.
//!
//! Operators are deterministic: identical construction inputs produce the
//! identical commander sequence. They are built as a finite
//! [`StepSequence`] rather than a step-counter switch, so tests assert the
//! emitted [`Command`] descriptors directly and adding a step never means
//! renumbering.

pub mod common;
pub mod etcd;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::cluster::Node;
use crate::engine::ContainerEngine;
use crate::infra::Infrastructure;
use crate::{Error, Result};

/// Descriptor of one commander, emitted to the log stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Action name, e.g. `run-container`
    pub name: String,
    /// Target description, usually node addresses or member IDs
    pub target: String,
}

impl Command {
    /// Build a descriptor.
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.name, self.target)
    }
}

/// One atomic remote action
#[async_trait]
pub trait Commander: Send + Sync {
    /// Execute the action against the infrastructure.
    ///
    /// Honors `ct` at every suspension point. Declarative actions (pull,
    /// volume-create, run-system) are idempotent; actions whose
    /// precondition cannot be repaired fail with a typed error.
    async fn run(&self, ct: &CancellationToken, inf: &dyn Infrastructure) -> Result<()>;

    /// Pure metadata for logging.
    fn command(&self) -> Command;
}

/// Ordered producer of commanders for one reconciliation intent
pub trait Operator: Send {
    /// Operator name, e.g. `etcd-bootstrap`.
    fn name(&self) -> &'static str;

    /// The next commander, or `None` when the operator has finished.
    fn next_command(&mut self) -> Option<Box<dyn Commander>>;
}

/// An operator realized as a precomputed, finite commander sequence
pub struct StepSequence {
    name: &'static str,
    steps: VecDeque<Box<dyn Commander>>,
}

impl StepSequence {
    /// Build a named sequence.
    pub fn new(name: &'static str, steps: Vec<Box<dyn Commander>>) -> Self {
        Self {
            name,
            steps: steps.into(),
        }
    }
}

impl Operator for StepSequence {
    fn name(&self) -> &'static str {
        self.name
    }

    fn next_command(&mut self) -> Option<Box<dyn Commander>> {
        self.steps.pop_front()
    }
}

/// Run a set of futures to completion and aggregate their failures.
///
/// All futures run concurrently; all are driven to completion. On failure
/// the first non-cancellation error wins, so a real fault is reported
/// instead of the cancellations it induced in siblings. Success requires
/// every future to succeed.
pub async fn gather<T, Fut>(futures: impl IntoIterator<Item = Fut>) -> Result<Vec<T>>
where
    Fut: Future<Output = Result<T>>,
{
    let results = futures::future::join_all(futures).await;
    let mut values = Vec::with_capacity(results.len());
    let mut cancelled = false;
    let mut first_error: Option<Error> = None;
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) if e.is_cancelled() => cancelled = true,
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    if cancelled {
        return Err(Error::Cancelled);
    }
    Ok(values)
}

/// The container engine for `address`, or a precondition error when the
/// node is not connected.
pub(crate) fn engine_for(
    inf: &dyn Infrastructure,
    address: &str,
) -> Result<Arc<dyn ContainerEngine>> {
    inf.engine(address)
        .ok_or_else(|| Error::precondition(format!("agent not connected for {address}")))
}

/// Comma-joined addresses, for command targets.
pub(crate) fn addresses(nodes: &[Node]) -> String {
    nodes
        .iter()
        .map(|n| n.address.as_str())
        .collect::<Vec<_>>()
        .join(",")
}
