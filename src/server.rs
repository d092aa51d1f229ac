//! The tick loop
//!
//! One dedicated task runs `observe → decide → execute` forever. Each tick
//! builds a fresh [`AnnealInfrastructure`], probes status, asks the
//! decision function for at most one operator, and drains it by running
//! every emitted commander strictly serially. Two operators never run at
//! the same time.
//!
//! An error ends the tick: the operator is discarded, the failure is
//! logged with the offending commander's descriptor, and the next tick
//! re-derives what to do from fresh status. The loop backs off with
//! jitter after consecutive failures so a persistently broken node does
//! not turn the log into a firehose.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::agent::SshConfig;
use crate::infra::{AnnealInfrastructure, Infrastructure, TlsContext};
use crate::op::Operator;
use crate::reconcile::etcd_decide_to_do;
use crate::status::get_cluster_status;
use crate::storage::Storage;
use crate::{Error, Result};

/// Upper bound on the failure back-off
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Tick loop settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Delay between successful ticks
    pub interval: Duration,
    /// SSH settings for node agents
    pub ssh: SshConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            ssh: SshConfig::default(),
        }
    }
}

/// The reconciliation server
pub struct Server {
    storage: Arc<dyn Storage>,
    tls: Arc<TlsContext>,
    config: ServerConfig,
}

impl Server {
    /// Create a server reading desired state from `storage`.
    pub fn new(storage: Arc<dyn Storage>, config: ServerConfig) -> Self {
        Self {
            storage,
            tls: Arc::new(TlsContext::new()),
            config,
        }
    }

    /// Run ticks until `ct` fires.
    pub async fn run(&self, ct: CancellationToken) -> Result<()> {
        let mut failures: u32 = 0;
        loop {
            if ct.is_cancelled() {
                return Ok(());
            }
            match self.tick(&ct).await {
                Ok(()) => failures = 0,
                Err(Error::Cancelled) => return Ok(()),
                Err(e) => {
                    failures += 1;
                    error!(error = %e, failures, "tick failed");
                }
            }

            let delay = self.delay_after(failures);
            tokio::select! {
                _ = ct.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One full observe/decide/execute cycle.
    async fn tick(&self, ct: &CancellationToken) -> Result<()> {
        let Some((cluster, _revision)) = self.storage.get_cluster().await? else {
            debug!("no cluster configured");
            return Ok(());
        };

        let inf = AnnealInfrastructure::new(
            ct,
            &cluster,
            self.storage.clone(),
            &self.config.ssh,
            self.tls.clone(),
        )
        .await?;

        let result = async {
            let status = get_cluster_status(ct, &cluster, &inf).await?;
            match etcd_decide_to_do(&cluster, &status) {
                None => {
                    debug!("steady state");
                    Ok(())
                }
                Some(mut op) => {
                    info!(operator = op.name(), "operation chosen");
                    run_operator(ct, op.as_mut(), &inf).await
                }
            }
        }
        .await;

        inf.close().await;
        result
    }

    fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.config.interval;
        }
        let exp = self.config.interval.as_secs_f64() * 2f64.powi(failures.min(5) as i32);
        let capped = exp.min(MAX_BACKOFF.as_secs_f64());
        // jitter: 0.5x to 1.5x, so failing ticks across deployments do not
        // align
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Drain `op`, executing every commander in order.
///
/// Stops at the first failure; the caller discards the operator either
/// way. Progress and failures log the commander descriptor.
pub async fn run_operator(
    ct: &CancellationToken,
    op: &mut dyn Operator,
    inf: &dyn Infrastructure,
) -> Result<()> {
    while let Some(commander) = op.next_command() {
        let command = commander.command();
        info!(operator = op.name(), command = %command, "executing");
        if let Err(e) = commander.run(ct, inf).await {
            error!(operator = op.name(), command = %command, error = %e, "command failed");
            return Err(e);
        }
    }
    debug!(operator = op.name(), "operation finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::infra::MockInfrastructure;
    use crate::op::{Command, Commander, StepSequence};
    use crate::storage::MemStorage;

    struct Scripted {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Commander for Scripted {
        async fn run(&self, _ct: &CancellationToken, _inf: &dyn Infrastructure) -> Result<()> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                Err(Error::transport("scripted failure"))
            } else {
                Ok(())
            }
        }

        fn command(&self) -> Command {
            Command::new(self.name, "test")
        }
    }

    #[tokio::test]
    async fn operator_drains_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut op = StepSequence::new(
            "demo",
            vec![
                Box::new(Scripted {
                    name: "first",
                    fail: false,
                    log: log.clone(),
                }),
                Box::new(Scripted {
                    name: "second",
                    fail: false,
                    log: log.clone(),
                }),
            ],
        );
        let inf = MockInfrastructure::new();
        run_operator(&CancellationToken::new(), &mut op, &inf)
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn failure_stops_the_drain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut op = StepSequence::new(
            "demo",
            vec![
                Box::new(Scripted {
                    name: "first",
                    fail: true,
                    log: log.clone(),
                }),
                Box::new(Scripted {
                    name: "second",
                    fail: false,
                    log: log.clone(),
                }),
            ],
        );
        let inf = MockInfrastructure::new();
        let err = run_operator(&CancellationToken::new(), &mut op, &inf)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn tick_without_a_cluster_is_a_quiet_success() {
        let server = Server::new(Arc::new(MemStorage::new()), ServerConfig::default());
        server.tick(&CancellationToken::new()).await.unwrap();
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let server = Server::new(Arc::new(MemStorage::new()), ServerConfig::default());
        assert_eq!(server.delay_after(0), Duration::from_secs(10));
        let one = server.delay_after(1);
        assert!(one >= Duration::from_secs(10) && one <= Duration::from_secs(30));
        let many = server.delay_after(20);
        assert!(many <= Duration::from_secs(450));
    }
}
