use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{CommandOutput, RemoteCommand, RemoteError, RemoteShell};

/// Ejecuta todo en la máquina del controlador con `sh -c`.
///
/// Sirve para clusters de un solo host (todos los roles en `localhost`) y
/// para los tests, apuntando `workdir` a un directorio temporal.
#[derive(Debug, Clone, Default)]
pub struct LocalShell {
    pub workdir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// Si es false, los comandos "elevados" se ejecutan sin sudo.
    pub use_sudo: bool,
}

impl LocalShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl RemoteShell for LocalShell {
    async fn exec(&self, host: &str, cmd: &RemoteCommand) -> Result<CommandOutput, RemoteError> {
        let script = if self.use_sudo {
            cmd.to_shell()
        } else {
            cmd.script.clone()
        };

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|source| RemoteError::Spawn {
            program: "sh".to_string(),
            source,
        })?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| RemoteError::Timeout {
                    host: host.to_string(),
                    script: cmd.script.clone(),
                    timeout: limit,
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|source| RemoteError::Spawn {
            program: "sh".to_string(),
            source,
        })?;

        let out = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        debug!("[local:{}] `{}` -> {}", host, cmd.script, out.status);
        Ok(out)
    }

    async fn upload(&self, host: &str, local: &Path, remote_path: &str) -> Result<(), RemoteError> {
        let target = match &self.workdir {
            Some(dir) => dir.join(remote_path),
            None => PathBuf::from(remote_path),
        };
        let transfer_err = |reason: String| RemoteError::Transfer {
            host: host.to_string(),
            local: local.to_path_buf(),
            remote: remote_path.to_string(),
            reason,
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| transfer_err(e.to_string()))?;
        }
        // fs::copy conserva los bits de permisos
        tokio::fs::copy(local, &target)
            .await
            .map_err(|e| transfer_err(e.to_string()))?;
        debug!("[local:{}] copiado {:?} -> {:?}", host, local, target);
        Ok(())
    }
}
