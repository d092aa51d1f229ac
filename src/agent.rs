//! Remote command execution on one node
//!
//! An [`Agent`] runs commands on a single host and reports the separated
//! stdout/stderr streams plus the exit code. Higher layers treat the
//! transport as opaque; the shipped implementation drives the system `ssh`
//! binary with connection multiplexing, so one master connection is
//! established per node and released when the agent closes.
//!
//! Cancellation is honored at the process boundary: when the token fires,
//! the in-flight child process is killed and [`crate::Error::Cancelled`]
//! is returned.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Captured result of one remote command
#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    /// Remote stdout, verbatim
    pub stdout: Vec<u8>,
    /// Remote stderr, verbatim
    pub stderr: Vec<u8>,
    /// Remote exit code
    pub code: i32,
}

impl AgentOutput {
    /// True if the remote command exited 0.
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// stdout as lossy UTF-8.
    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// The tail of stderr as lossy UTF-8, trimmed, for error messages.
    pub fn stderr_tail(&self) -> String {
        let s = String::from_utf8_lossy(&self.stderr);
        let s = s.trim();
        match s.char_indices().nth_back(399) {
            Some((idx, _)) => s[idx..].to_string(),
            None => s.to_string(),
        }
    }
}

/// Command execution on one remote host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Agent: Send + Sync {
    /// Run `command` with `args`, capturing both streams.
    ///
    /// A non-zero remote exit is NOT an error at this layer; callers
    /// inspect [`AgentOutput::code`]. Errors mean the command could not be
    /// delivered or was cancelled.
    async fn run(
        &self,
        ct: &CancellationToken,
        command: &str,
        args: &[String],
    ) -> Result<AgentOutput>;

    /// Like [`Agent::run`], but feeds `input` to the remote stdin.
    async fn run_with_input(
        &self,
        ct: &CancellationToken,
        command: &str,
        args: &[String],
        input: &[u8],
    ) -> Result<AgentOutput>;

    /// Release the underlying connection. Idempotent, best-effort.
    async fn close(&self);
}

/// SSH connection settings shared by all agents
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Login user
    pub user: String,
    /// SSH port
    pub port: u16,
    /// Default private key, used when no per-node key is configured
    pub key_path: Option<PathBuf>,
    /// Per-node private keys, keyed by node address
    pub keys: BTreeMap<String, PathBuf>,
    /// Directory for control-master sockets
    pub control_dir: PathBuf,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            key_path: None,
            keys: BTreeMap::new(),
            control_dir: std::env::temp_dir().join("anneal-ssh"),
        }
    }
}

impl SshConfig {
    /// The private key for `address`, falling back to the default key.
    pub fn key_for(&self, address: &str) -> Option<&Path> {
        self.keys
            .get(address)
            .map(PathBuf::as_path)
            .or(self.key_path.as_deref())
    }
}

/// ssh exit code meaning the connection itself failed
const SSH_TRANSPORT_EXIT: i32 = 255;

/// [`Agent`] implementation over the system `ssh` binary.
///
/// Connections multiplex through a control-master socket per node, so the
/// first command pays the handshake and later commands reuse the session.
/// [`SshAgent::close`] tears the master connection down.
pub struct SshAgent {
    address: String,
    user: String,
    port: u16,
    key_path: PathBuf,
    control_path: PathBuf,
}

impl SshAgent {
    /// Connect to `address`, verifying the node is reachable.
    ///
    /// Fails with a precondition error when no private key is configured
    /// for the node, and with a transport error when the probe command
    /// cannot reach it.
    pub async fn connect(ct: &CancellationToken, address: &str, cfg: &SshConfig) -> Result<Self> {
        let key_path = cfg
            .key_for(address)
            .ok_or_else(|| Error::precondition(format!("no ssh private key for {address}")))?
            .to_path_buf();

        tokio::fs::create_dir_all(&cfg.control_dir).await?;

        let agent = Self {
            address: address.to_string(),
            user: cfg.user.clone(),
            port: cfg.port,
            key_path,
            control_path: cfg.control_dir.join(format!("{address}.sock")),
        };

        let out = agent.run(ct, "true", &[]).await?;
        if !out.success() {
            return Err(Error::transport(format!(
                "ssh probe to {address} exited {}: {}",
                out.code,
                out.stderr_tail()
            )));
        }
        debug!(node = %address, "ssh agent connected");
        Ok(agent)
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg("ConnectTimeout=10")
            .arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg("ControlPersist=600")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-i")
            .arg(&self.key_path)
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-l")
            .arg(&self.user)
            .arg(&self.address)
            .arg("--");
        cmd.kill_on_drop(true);
        cmd
    }

    async fn exec(
        &self,
        ct: &CancellationToken,
        command: &str,
        args: &[String],
        input: Option<&[u8]>,
    ) -> Result<AgentOutput> {
        let mut cmd = self.base_command();
        cmd.arg(command).args(args);
        cmd.stdin(if input.is_some() {
            std::process::Stdio::piped()
        } else {
            std::process::Stdio::null()
        });
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn()?;
        if let Some(bytes) = input {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| Error::transport("child stdin unavailable"))?;
            stdin.write_all(bytes).await?;
            stdin.shutdown().await?;
            drop(stdin);
        }

        let output = tokio::select! {
            _ = ct.cancelled() => return Err(Error::Cancelled),
            out = child.wait_with_output() => out?,
        };

        let code = match output.status.code() {
            Some(code) => code,
            None => {
                return Err(Error::transport(format!(
                    "ssh to {} terminated by signal",
                    self.address
                )))
            }
        };
        let out = AgentOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            code,
        };
        if code == SSH_TRANSPORT_EXIT {
            return Err(Error::transport(format!(
                "ssh to {} failed: {}",
                self.address,
                out.stderr_tail()
            )));
        }
        Ok(out)
    }
}

#[async_trait]
impl Agent for SshAgent {
    async fn run(
        &self,
        ct: &CancellationToken,
        command: &str,
        args: &[String],
    ) -> Result<AgentOutput> {
        self.exec(ct, command, args, None).await
    }

    async fn run_with_input(
        &self,
        ct: &CancellationToken,
        command: &str,
        args: &[String],
        input: &[u8],
    ) -> Result<AgentOutput> {
        self.exec(ct, command, args, Some(input)).await
    }

    async fn close(&self) {
        // Tear down the control-master connection; a failure only means it
        // was never established or already expired.
        let _ = Command::new("ssh")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg("exit")
            .arg(&self.address)
            .output()
            .await;
        debug!(node = %self.address, "ssh agent closed");
    }
}
