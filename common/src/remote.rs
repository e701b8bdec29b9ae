//! Primitiva de ejecución remota: "ejecuta el comando C en el host H y
//! devuelve estado y salida", más la copia de ficheros locales a un host.

mod local;
mod ssh;

pub use local::LocalShell;
pub use ssh::{SshOptions, SshShell};

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub script: String,
    /// Ejecutar con sudo.
    pub elevated: bool,
}

impl RemoteCommand {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            elevated: false,
        }
    }

    pub fn sudo(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            elevated: true,
        }
    }

    pub fn elevated_if(script: impl Into<String>, elevated: bool) -> Self {
        Self {
            script: script.into(),
            elevated,
        }
    }

    /// Script final tal y como se pasa al shell del host.
    pub fn to_shell(&self) -> String {
        if self.elevated {
            format!("sudo -n sh -c {}", shell_quote(&self.script))
        } else {
            self.script.clone()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn failed(&self) -> bool {
        !self.success()
    }

    /// Primera línea no vacía de stdout.
    pub fn first_line(&self) -> Option<&str> {
        self.stdout.lines().map(str::trim).find(|l| !l.is_empty())
    }

    /// Convierte un estado distinto de cero en error.
    pub fn check(self, host: &str, script: &str) -> Result<CommandOutput, RemoteError> {
        if self.success() {
            Ok(self)
        } else {
            Err(RemoteError::NonZeroExit {
                host: host.to_string(),
                script: script.to_string(),
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("no se pudo lanzar `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timeout de {timeout:?} ejecutando en {host}: {script}")]
    Timeout {
        host: String,
        script: String,
        timeout: Duration,
    },

    #[error("`{script}` en {host} terminó con estado {status}: {stderr}")]
    NonZeroExit {
        host: String,
        script: String,
        status: i32,
        stderr: String,
    },

    #[error("fallo copiando {local:?} a {host}:{remote}: {reason}")]
    Transfer {
        host: String,
        local: PathBuf,
        remote: String,
        reason: String,
    },
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn exec(&self, host: &str, cmd: &RemoteCommand) -> Result<CommandOutput, RemoteError>;

    /// Copia `local` a `remote_path` en `host` conservando el bit de ejecución.
    async fn upload(&self, host: &str, local: &Path, remote_path: &str) -> Result<(), RemoteError>;

    /// Ejecuta y trata cualquier fallo como "false". Para sondas (`test -f`...).
    async fn probe(&self, host: &str, cmd: &RemoteCommand) -> bool {
        match self.exec(host, cmd).await {
            Ok(out) => out.success(),
            Err(_) => false,
        }
    }

    /// Ejecuta y exige estado cero.
    async fn run(&self, host: &str, cmd: &RemoteCommand) -> Result<CommandOutput, RemoteError> {
        self.exec(host, cmd).await?.check(host, &cmd.script)
    }
}

/// Comillas simples de shell POSIX.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Directorio y nombre base de una ruta remota (siempre con `/`).
pub fn split_remote_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => (".", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_leaves_plain_words_alone() {
        assert_eq!(shell_quote("core-site.xml"), "core-site.xml");
        assert_eq!(shell_quote("hdfs://c:9000/"), "hdfs://c:9000/");
    }

    #[test]
    fn quoting_escapes_spaces_and_single_quotes() {
        assert_eq!(shell_quote("-Xmx768m -Xms1g"), "'-Xmx768m -Xms1g'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$PATH"), "'$PATH'");
    }

    #[test]
    fn sudo_wraps_the_whole_script() {
        let cmd = RemoteCommand::sudo("cp /etc/hosts /etc/hosts.bak0");
        assert_eq!(
            cmd.to_shell(),
            "sudo -n sh -c 'cp /etc/hosts /etc/hosts.bak0'"
        );
        assert_eq!(RemoteCommand::new("jps").to_shell(), "jps");
    }

    #[test]
    fn remote_paths_split_on_last_slash() {
        assert_eq!(split_remote_path("/etc/hosts"), ("/etc", "hosts"));
        assert_eq!(split_remote_path("/hosts"), ("/", "hosts"));
        assert_eq!(split_remote_path("zoo.cfg"), (".", "zoo.cfg"));
    }
}
