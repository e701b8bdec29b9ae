use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{CommandOutput, RemoteCommand, RemoteError, RemoteShell};

/// ssh devuelve 255 cuando falla la conexión (no el comando remoto).
const SSH_TRANSPORT_FAILURE: i32 = 255;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub command_timeout: Duration,
    /// Reintentos ante fallos de transporte (estado 255).
    pub retries: u32,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_string(),
            identity_file: None,
            command_timeout: Duration::from_secs(600),
            retries: 1,
        }
    }
}

/// Shell remoto sobre los clientes `ssh`/`scp` del sistema.
#[derive(Debug, Clone)]
pub struct SshShell {
    opts: SshOptions,
}

impl SshShell {
    pub fn new(opts: SshOptions) -> Self {
        Self { opts }
    }

    fn destination(&self, host: &str) -> String {
        if self.opts.user.is_empty() {
            host.to_string()
        } else {
            format!("{}@{}", self.opts.user, host)
        }
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(key) = &self.opts.identity_file {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().to_string());
        }
        args
    }

    async fn run_program(
        &self,
        program: &str,
        args: &[String],
        host: &str,
        what: &str,
    ) -> Result<CommandOutput, RemoteError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RemoteError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let limit = self.opts.command_timeout;
        let output = tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| RemoteError::Timeout {
                host: host.to_string(),
                script: what.to_string(),
                timeout: limit,
            })?
            .map_err(|source| RemoteError::Spawn {
                program: program.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Reintenta mientras el fallo sea del transporte y queden intentos.
    async fn with_retries(
        &self,
        program: &str,
        args: &[String],
        host: &str,
        what: &str,
    ) -> Result<CommandOutput, RemoteError> {
        let mut attempt = 0;
        loop {
            let out = self.run_program(program, args, host, what).await?;
            if out.status != SSH_TRANSPORT_FAILURE || attempt >= self.opts.retries {
                return Ok(out);
            }
            attempt += 1;
            warn!(
                "{} a {} falló en el transporte ({}), reintento {}/{}",
                program,
                host,
                out.stderr.trim(),
                attempt,
                self.opts.retries
            );
            sleep(RETRY_BACKOFF).await;
        }
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, host: &str, cmd: &RemoteCommand) -> Result<CommandOutput, RemoteError> {
        let mut args = self.common_args();
        args.push(self.destination(host));
        args.push("--".to_string());
        args.push(cmd.to_shell());

        let out = self.with_retries("ssh", &args, host, &cmd.script).await?;
        debug!("[{}] `{}` -> {}", host, cmd.script, out.status);
        Ok(out)
    }

    async fn upload(&self, host: &str, local: &Path, remote_path: &str) -> Result<(), RemoteError> {
        let mut args = self.common_args();
        args.push("-p".to_string());
        args.push(local.to_string_lossy().to_string());
        args.push(format!("{}:{}", self.destination(host), remote_path));

        let what = format!("scp {:?}", local);
        let out = self.with_retries("scp", &args, host, &what).await?;
        if out.failed() {
            return Err(RemoteError::Transfer {
                host: host.to_string(),
                local: local.to_path_buf(),
                remote: remote_path.to_string(),
                reason: out.stderr.trim().to_string(),
            });
        }
        debug!("[{}] subido {:?} -> {}", host, local, remote_path);
        Ok(())
    }
}
