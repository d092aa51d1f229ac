//! Typed container-engine wrapper
//!
//! A [`ContainerEngine`] drives the container runtime on one node through
//! that node's [`Agent`]. The shipped implementation speaks the `docker`
//! CLI; anything with OCI-equivalent semantics, named volumes, and a
//! restart policy that survives host reboots works.
//!
//! The hard primitive is [`ContainerEngine::run_system`]: it composes
//! engine options, system-required arguments, and user-supplied arguments
//! into one detached long-lived container, and it is idempotent: a running
//! container of the same name means success, not restart.
//!
//! The parameter snapshot needed to detect drift rides on the container as
//! labels written at start time, so a later inspect recovers the exact
//! [`ServiceParams`] the container was created with.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::agent::{Agent, AgentOutput};
use crate::cluster::ServiceParams;
use crate::status::ServiceStatus;
use crate::{Error, Result};

/// Container label carrying the JSON snapshot of the built-in parameters
pub const BUILTIN_PARAMS_LABEL: &str = "anneal.params.builtin";

/// Container label carrying the JSON snapshot of the extra parameters
pub const EXTRA_PARAMS_LABEL: &str = "anneal.params.extra";

/// Capability set of a container runtime on one node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Pull `image` onto the node.
    async fn pull_image(&self, ct: &CancellationToken, image: &str) -> Result<()>;

    /// Create the named volume. Succeeds if it already exists.
    async fn volume_create(&self, ct: &CancellationToken, name: &str) -> Result<()>;

    /// True if the named volume exists.
    async fn volume_exists(&self, ct: &CancellationToken, name: &str) -> Result<bool>;

    /// Remove the named volume. Succeeds if it is already absent.
    async fn volume_remove(&self, ct: &CancellationToken, name: &str) -> Result<()>;

    /// True if a container of this name exists, running or not.
    async fn exists(&self, ct: &CancellationToken, name: &str) -> Result<bool>;

    /// Inspect the named container; `None` if it does not exist.
    async fn inspect(&self, ct: &CancellationToken, name: &str) -> Result<Option<ServiceStatus>>;

    /// Start a detached long-lived service container.
    ///
    /// Argument order is fixed: engine `opts`, then `built_in` arguments,
    /// then `extra` arguments. Binds and env of both parameter sets are
    /// unioned. If a container of the same name is already running this
    /// returns success without restarting it.
    async fn run_system(
        &self,
        ct: &CancellationToken,
        name: &str,
        image: &str,
        opts: &[String],
        built_in: &ServiceParams,
        extra: &ServiceParams,
    ) -> Result<()>;

    /// Gracefully stop and remove the named container. Absent is success.
    async fn stop(&self, ct: &CancellationToken, name: &str) -> Result<()>;

    /// Forcibly remove the named container. Absent is success.
    async fn kill(&self, ct: &CancellationToken, name: &str) -> Result<()>;
}

/// `docker` CLI implementation of [`ContainerEngine`]
pub struct Docker {
    agent: Arc<dyn Agent>,
    address: String,
}

impl Docker {
    /// Wrap the agent for `address`.
    pub fn new(agent: Arc<dyn Agent>, address: impl Into<String>) -> Self {
        Self {
            agent,
            address: address.into(),
        }
    }

    async fn docker(&self, ct: &CancellationToken, args: &[String]) -> Result<AgentOutput> {
        self.agent.run(ct, "docker", args).await
    }

    fn ensure_success(&self, args: &[String], out: AgentOutput) -> Result<AgentOutput> {
        if out.success() {
            Ok(out)
        } else {
            Err(Error::Remote {
                target: self.address.clone(),
                command: format!("docker {}", args.join(" ")),
                detail: out.stderr_tail(),
            })
        }
    }

    async fn run_checked(&self, ct: &CancellationToken, args: Vec<String>) -> Result<AgentOutput> {
        let out = self.docker(ct, &args).await?;
        self.ensure_success(&args, out)
    }
}

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[derive(Deserialize)]
struct InspectEntry {
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "Config")]
    config: InspectConfig,
}

#[derive(Deserialize)]
struct InspectState {
    #[serde(rename = "Running")]
    running: bool,
}

#[derive(Deserialize)]
struct InspectConfig {
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "Labels", default)]
    labels: BTreeMap<String, String>,
}

fn params_from_label(labels: &BTreeMap<String, String>, label: &str) -> Result<ServiceParams> {
    match labels.get(label) {
        None => Ok(ServiceParams::default()),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| Error::serialization(format!("bad {label} label: {e}"))),
    }
}

#[async_trait]
impl ContainerEngine for Docker {
    async fn pull_image(&self, ct: &CancellationToken, image: &str) -> Result<()> {
        self.run_checked(ct, argv(&["image", "pull", image])).await?;
        Ok(())
    }

    async fn volume_create(&self, ct: &CancellationToken, name: &str) -> Result<()> {
        self.run_checked(ct, argv(&["volume", "create", name]))
            .await?;
        Ok(())
    }

    async fn volume_exists(&self, ct: &CancellationToken, name: &str) -> Result<bool> {
        let out = self
            .run_checked(ct, argv(&["volume", "ls", "--format", "{{.Name}}"]))
            .await?;
        Ok(out.stdout_utf8().lines().any(|l| l.trim() == name))
    }

    async fn volume_remove(&self, ct: &CancellationToken, name: &str) -> Result<()> {
        if !self.volume_exists(ct, name).await? {
            return Ok(());
        }
        self.run_checked(ct, argv(&["volume", "rm", name])).await?;
        Ok(())
    }

    async fn exists(&self, ct: &CancellationToken, name: &str) -> Result<bool> {
        let out = self
            .run_checked(ct, argv(&["ps", "-a", "--format", "{{.Names}}"]))
            .await?;
        Ok(out.stdout_utf8().lines().any(|l| l.trim() == name))
    }

    async fn inspect(&self, ct: &CancellationToken, name: &str) -> Result<Option<ServiceStatus>> {
        let args = argv(&["container", "inspect", name]);
        let out = self.docker(ct, &args).await?;
        if !out.success() {
            // inspect exits non-zero when the container does not exist
            return Ok(None);
        }
        let entries: Vec<InspectEntry> = serde_json::from_str(&out.stdout_utf8())
            .map_err(|e| Error::serialization(format!("bad inspect output for {name}: {e}")))?;
        let entry = match entries.into_iter().next() {
            Some(entry) => entry,
            None => return Ok(None),
        };
        Ok(Some(ServiceStatus {
            running: entry.state.running,
            image: entry.config.image,
            built_in_params: params_from_label(&entry.config.labels, BUILTIN_PARAMS_LABEL)?,
            extra_params: params_from_label(&entry.config.labels, EXTRA_PARAMS_LABEL)?,
        }))
    }

    async fn run_system(
        &self,
        ct: &CancellationToken,
        name: &str,
        image: &str,
        opts: &[String],
        built_in: &ServiceParams,
        extra: &ServiceParams,
    ) -> Result<()> {
        if self.exists(ct, name).await? {
            if let Some(status) = self.inspect(ct, name).await? {
                if status.running {
                    debug!(node = %self.address, container = name, "already running");
                    return Ok(());
                }
            }
            // a stopped leftover blocks the name
            self.run_checked(ct, argv(&["rm", name])).await?;
        }

        let builtin_label = serde_json::to_string(built_in)
            .map_err(|e| Error::serialization(format!("builtin params: {e}")))?;
        let extra_label = serde_json::to_string(extra)
            .map_err(|e| Error::serialization(format!("extra params: {e}")))?;

        let mut args = argv(&["run", "-d", "--restart=unless-stopped"]);
        args.push(format!("--name={name}"));
        args.push(format!("--label={BUILTIN_PARAMS_LABEL}={builtin_label}"));
        args.push(format!("--label={EXTRA_PARAMS_LABEL}={extra_label}"));
        args.extend(opts.iter().cloned());
        for bind in built_in.extra_binds.iter().chain(&extra.extra_binds) {
            args.push(bind.to_volume_arg());
        }
        for (key, value) in built_in.extra_env.iter().chain(&extra.extra_env) {
            args.push(format!("--env={key}={value}"));
        }
        args.push(image.to_string());
        args.extend(built_in.extra_arguments.iter().cloned());
        args.extend(extra.extra_arguments.iter().cloned());

        self.run_checked(ct, args).await?;
        Ok(())
    }

    async fn stop(&self, ct: &CancellationToken, name: &str) -> Result<()> {
        if !self.exists(ct, name).await? {
            return Ok(());
        }
        self.run_checked(ct, argv(&["stop", name])).await?;
        self.run_checked(ct, argv(&["rm", name])).await?;
        Ok(())
    }

    async fn kill(&self, ct: &CancellationToken, name: &str) -> Result<()> {
        if !self.exists(ct, name).await? {
            return Ok(());
        }
        self.run_checked(ct, argv(&["rm", "-f", name])).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Agent fake that serves canned outputs keyed by the joined command
    /// line and records every invocation.
    struct FakeAgent {
        responses: Mutex<BTreeMap<String, AgentOutput>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeAgent {
        fn new() -> Self {
            Self {
                responses: Mutex::new(BTreeMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn respond(&self, line: &str, stdout: &str, code: i32) {
            self.responses.lock().unwrap().insert(
                line.to_string(),
                AgentOutput {
                    stdout: stdout.as_bytes().to_vec(),
                    stderr: Vec::new(),
                    code,
                },
            );
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Agent for FakeAgent {
        async fn run(
            &self,
            _ct: &CancellationToken,
            command: &str,
            args: &[String],
        ) -> Result<AgentOutput> {
            let line = format!("{command} {}", args.join(" "));
            self.calls.lock().unwrap().push(line.clone());
            Ok(self
                .responses
                .lock()
                .unwrap()
                .get(&line)
                .cloned()
                .unwrap_or_default())
        }

        async fn run_with_input(
            &self,
            ct: &CancellationToken,
            command: &str,
            args: &[String],
            _input: &[u8],
        ) -> Result<AgentOutput> {
            self.run(ct, command, args).await
        }

        async fn close(&self) {}
    }

    fn docker_with(agent: FakeAgent) -> (Docker, Arc<FakeAgent>) {
        let agent = Arc::new(agent);
        (Docker::new(agent.clone(), "10.0.0.1"), agent)
    }

    #[tokio::test]
    async fn volume_remove_of_absent_volume_is_success() {
        let agent = FakeAgent::new();
        agent.respond("docker volume ls --format {{.Name}}", "other\n", 0);
        let (docker, agent) = docker_with(agent);

        docker
            .volume_remove(&CancellationToken::new(), "etcd-cke")
            .await
            .unwrap();
        assert!(!agent.calls().iter().any(|c| c.contains("volume rm")));
    }

    #[tokio::test]
    async fn volume_remove_removes_existing_volume() {
        let agent = FakeAgent::new();
        agent.respond("docker volume ls --format {{.Name}}", "etcd-cke\n", 0);
        let (docker, agent) = docker_with(agent);

        docker
            .volume_remove(&CancellationToken::new(), "etcd-cke")
            .await
            .unwrap();
        assert!(agent.calls().contains(&"docker volume rm etcd-cke".to_string()));
    }

    #[tokio::test]
    async fn inspect_of_missing_container_is_none() {
        let agent = FakeAgent::new();
        agent.respond("docker container inspect etcd", "", 1);
        let (docker, _) = docker_with(agent);

        let status = docker
            .inspect(&CancellationToken::new(), "etcd")
            .await
            .unwrap();
        assert!(status.is_none());
    }

    #[tokio::test]
    async fn inspect_recovers_the_params_snapshot() {
        let builtin = ServiceParams {
            extra_arguments: vec!["--name=10.0.0.1".to_string()],
            ..Default::default()
        };
        let json = format!(
            r#"[{{"State":{{"Running":true}},"Config":{{"Image":"etcd:v1","Labels":{{"{}":{},"{}":{}}}}}}}]"#,
            BUILTIN_PARAMS_LABEL,
            serde_json::to_string(&serde_json::to_string(&builtin).unwrap()).unwrap(),
            EXTRA_PARAMS_LABEL,
            serde_json::to_string(&serde_json::to_string(&ServiceParams::default()).unwrap())
                .unwrap(),
        );
        let agent = FakeAgent::new();
        agent.respond("docker container inspect etcd", &json, 0);
        let (docker, _) = docker_with(agent);

        let status = docker
            .inspect(&CancellationToken::new(), "etcd")
            .await
            .unwrap()
            .unwrap();
        assert!(status.running);
        assert_eq!(status.image, "etcd:v1");
        assert_eq!(status.built_in_params, builtin);
        assert_eq!(status.extra_params, ServiceParams::default());
    }

    #[tokio::test]
    async fn run_system_is_idempotent_for_a_running_container() {
        let agent = FakeAgent::new();
        agent.respond("docker ps -a --format {{.Names}}", "etcd\n", 0);
        agent.respond(
            "docker container inspect etcd",
            r#"[{"State":{"Running":true},"Config":{"Image":"etcd:v1","Labels":{}}}]"#,
            0,
        );
        let (docker, agent) = docker_with(agent);

        docker
            .run_system(
                &CancellationToken::new(),
                "etcd",
                "etcd:v1",
                &[],
                &ServiceParams::default(),
                &ServiceParams::default(),
            )
            .await
            .unwrap();
        assert!(!agent.calls().iter().any(|c| c.starts_with("docker run")));
    }

    #[tokio::test]
    async fn run_system_composes_argv_in_order() {
        let agent = FakeAgent::new();
        agent.respond("docker ps -a --format {{.Names}}", "", 0);
        let (docker, agent) = docker_with(agent);

        let built_in = ServiceParams {
            extra_arguments: vec!["--builtin=1".to_string()],
            extra_binds: vec![crate::cluster::Mount {
                source: "vol".to_string(),
                destination: "/data".to_string(),
                ..Default::default()
            }],
            extra_env: BTreeMap::from([("A".to_string(), "1".to_string())]),
        };
        let extra = ServiceParams {
            extra_arguments: vec!["--extra=2".to_string()],
            ..Default::default()
        };
        docker
            .run_system(
                &CancellationToken::new(),
                "etcd",
                "etcd:v1",
                &["--opt".to_string()],
                &built_in,
                &extra,
            )
            .await
            .unwrap();

        let run_line = agent
            .calls()
            .into_iter()
            .find(|c| c.starts_with("docker run"))
            .expect("run invoked");
        // rfind for the argument tokens: the same strings also appear
        // inside the params labels earlier in the argv
        let opt = run_line.find("--opt").unwrap();
        let bind = run_line.find("--volume=vol:/data").unwrap();
        let env = run_line.find("--env=A=1").unwrap();
        let image = run_line.find("etcd:v1").unwrap();
        let builtin_arg = run_line.rfind("--builtin=1").unwrap();
        let extra_arg = run_line.rfind("--extra=2").unwrap();
        assert!(opt < bind && bind < env && env < image);
        assert!(image < builtin_arg && builtin_arg < extra_arg);
    }

    #[tokio::test]
    async fn stop_of_absent_container_is_success() {
        let agent = FakeAgent::new();
        agent.respond("docker ps -a --format {{.Names}}", "", 0);
        let (docker, agent) = docker_with(agent);

        docker.stop(&CancellationToken::new(), "etcd").await.unwrap();
        assert!(!agent.calls().iter().any(|c| c.contains("docker stop")));
    }

    #[tokio::test]
    async fn remote_failure_carries_node_and_command() {
        let agent = FakeAgent::new();
        agent
            .responses
            .lock()
            .unwrap()
            .insert(
                "docker image pull etcd:v1".to_string(),
                AgentOutput {
                    stdout: Vec::new(),
                    stderr: b"manifest unknown".to_vec(),
                    code: 1,
                },
            );
        let (docker, _) = docker_with(agent);

        let err = docker
            .pull_image(&CancellationToken::new(), "etcd:v1")
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.1"));
        assert!(msg.contains("docker image pull etcd:v1"));
        assert!(msg.contains("manifest unknown"));
    }
}
