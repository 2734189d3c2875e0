//! Remote transport to the device holding the location caches
//!
//! [`SshTransport`] drives the system OpenSSH client. All invocations share a
//! multiplexed master connection (`ControlMaster=auto`), so the session is
//! authenticated once by [`SshTransport::connect`] and reused by every
//! command and download afterwards.

use crate::infra::config::Config;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// ssh reserves this exit status for its own failures
const SSH_FAILURE_STATUS: i32 = 255;

/// How long the master connection outlives its last client (seconds)
const CONTROL_PERSIST_SECS: u64 = 600;

/// Any failure of the remote session. Fatal to the bridge process.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no remote host configured")]
    NoHost,
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("remote session failed while running `{command}`: {detail}")]
    Session { command: String, detail: String },
    #[error("download of {remote} failed: {detail}")]
    Fetch { remote: String, detail: String },
}

/// Operations the bridge needs from the remote host
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Run a command remotely. The command's own exit status is not an error.
    async fn exec(&self, command: &str) -> Result<(), TransportError>;

    /// Copy a remote file to a local path
    async fn fetch(&self, remote_path: &str, local_path: &Path) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct SshTransport {
    host: String,
    port: u16,
    username: String,
    key_file: PathBuf,
    known_hosts: PathBuf,
    control_path: PathBuf,
    /// Share one master connection across invocations
    multiplex: bool,
    connect_timeout_secs: u64,
}

impl SshTransport {
    pub fn from_config(config: &Config) -> Result<Self, TransportError> {
        if config.remote_host().is_empty() {
            return Err(TransportError::NoHost);
        }
        Ok(Self {
            host: config.remote_host().to_string(),
            port: config.remote_port(),
            username: config.remote_username().to_string(),
            key_file: config.remote_key_file().to_path_buf(),
            known_hosts: config.known_hosts().to_path_buf(),
            control_path: std::env::temp_dir()
                .join(format!("findmy-ssh-{}.sock", std::process::id())),
            multiplex: true,
            connect_timeout_secs: 10,
        })
    }

    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// One connection per invocation, no background master left behind
    ///
    /// For short-lived callers such as the health check.
    pub fn without_multiplexing(mut self) -> Self {
        self.multiplex = false;
        self
    }

    /// Authenticate and open the shared master connection
    pub async fn connect(&self) -> Result<(), TransportError> {
        let output = self.run_ssh("true").await?;
        if !output.status.success() {
            return Err(TransportError::Session {
                command: "true".to_string(),
                detail: failure_detail(&output),
            });
        }
        info!(host = %self.host, port = %self.port, user = %self.username, "ssh_session_ready");
        Ok(())
    }

    /// `user@host`
    fn target(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    fn common_options(&self) -> Vec<String> {
        let mut options = vec![
            "BatchMode=yes".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            format!("UserKnownHostsFile={}", self.known_hosts.display()),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ];
        if self.multiplex {
            options.push("ControlMaster=auto".to_string());
            options.push(format!("ControlPath={}", self.control_path.display()));
            options.push(format!("ControlPersist={}", CONTROL_PERSIST_SECS));
        } else {
            options.push("ControlMaster=no".to_string());
            options.push("ControlPath=none".to_string());
        }

        let mut args: Vec<String> =
            options.into_iter().flat_map(|opt| ["-o".to_string(), opt]).collect();
        args.push("-i".to_string());
        args.push(self.key_file.display().to_string());
        args
    }

    fn ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = self.common_options();
        args.push("-p".to_string());
        args.push(self.port.to_string());
        args.push(self.target());
        args.push(command.to_string());
        args
    }

    fn scp_args(&self, remote_path: &str, local_path: &Path) -> Vec<String> {
        let mut args = self.common_options();
        args.push("-q".to_string());
        args.push("-P".to_string());
        args.push(self.port.to_string());
        args.push(format!("{}:{}", self.target(), remote_path));
        args.push(local_path.display().to_string());
        args
    }

    async fn run_ssh(&self, command: &str) -> Result<Output, TransportError> {
        run("ssh", self.ssh_args(command)).await
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn exec(&self, command: &str) -> Result<(), TransportError> {
        let output = self.run_ssh(command).await?;
        match output.status.code() {
            Some(0) => debug!(command = %command, "remote_command_ok"),
            Some(code) if code != SSH_FAILURE_STATUS => {
                warn!(
                    command = %command,
                    status = %code,
                    stderr = %stderr_line(&output),
                    "remote_command_nonzero"
                );
            }
            _ => {
                return Err(TransportError::Session {
                    command: command.to_string(),
                    detail: failure_detail(&output),
                })
            }
        }
        Ok(())
    }

    async fn fetch(&self, remote_path: &str, local_path: &Path) -> Result<(), TransportError> {
        let output = run("scp", self.scp_args(remote_path, local_path)).await?;
        if !output.status.success() {
            return Err(TransportError::Fetch {
                remote: remote_path.to_string(),
                detail: failure_detail(&output),
            });
        }
        Ok(())
    }
}

async fn run(program: &'static str, args: Vec<String>) -> Result<Output, TransportError> {
    Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| TransportError::Spawn { program, source })
}

fn stderr_line(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().lines().last().unwrap_or("").to_string()
}

fn failure_detail(output: &Output) -> String {
    let status = match output.status.code() {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    };
    match stderr_line(output) {
        line if line.is_empty() => status,
        line => format!("{}: {}", status, line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> SshTransport {
        let mut config = Config::default();
        config.apply_env_with(|key| match key {
            "IOS_URL" => Some("10.0.0.5".to_string()),
            "IOS_PORT" => Some("2222".to_string()),
            _ => None,
        });
        SshTransport::from_config(&config).unwrap()
    }

    #[test]
    fn test_requires_host() {
        let result = SshTransport::from_config(&Config::default());
        assert!(matches!(result, Err(TransportError::NoHost)));
    }

    #[test]
    fn test_ssh_args() {
        let args = transport().ssh_args("open com.apple.findmy");
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"UserKnownHostsFile=/ssh/known_hosts".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/ssh/id_rsa"));
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        let n = args.len();
        assert_eq!(args[n - 2], "root@10.0.0.5");
        assert_eq!(args[n - 1], "open com.apple.findmy");
    }

    #[test]
    fn test_multiplexed_by_default() {
        let args = transport().ssh_args("true");
        assert!(args.windows(2).any(|w| w[0] == "-o" && w[1] == "ControlMaster=auto"));
        assert!(args.contains(&"ControlPersist=600".to_string()));
        assert!(args.iter().any(|a| a.starts_with("ControlPath=") && a.ends_with(".sock")));
    }

    #[test]
    fn test_one_shot_leaves_no_master() {
        let args = transport().without_multiplexing().ssh_args("true");
        assert!(args.windows(2).any(|w| w[0] == "-o" && w[1] == "ControlMaster=no"));
        assert!(args.contains(&"ControlPath=none".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("ControlPersist")));
        assert!(!args.contains(&"ControlMaster=auto".to_string()));
    }

    #[test]
    fn test_scp_args() {
        let args = transport().scp_args("/var/Items.data", Path::new("/tmp/Items.data"));
        assert!(args.windows(2).any(|w| w[0] == "-P" && w[1] == "2222"));
        let n = args.len();
        assert_eq!(args[n - 2], "root@10.0.0.5:/var/Items.data");
        assert_eq!(args[n - 1], "/tmp/Items.data");
    }
}
