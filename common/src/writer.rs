//! Escritura de propiedades en ficheros de configuración remotos:
//! sincroniza el helper, archiva el fichero y delega el upsert en
//! `propmerge` dentro del host.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::backup::{ArchiveMode, ManagedFile};
use crate::merge::LineFormat;
use crate::properties::PropertySet;
use crate::remote::{shell_quote, split_remote_path, RemoteCommand, RemoteError, RemoteShell};
use crate::sync::{SyncError, SyncGate, SyncOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Se parte de un fichero vacío; el anterior se mueve al backup.
    Clean,
    /// Se actualiza el fichero existente; el backup es una copia.
    Merge,
}

impl MergePolicy {
    pub fn from_clean_flag(clean: bool) -> Self {
        if clean {
            MergePolicy::Clean
        } else {
            MergePolicy::Merge
        }
    }

    pub fn archive_mode(&self) -> ArchiveMode {
        match self {
            MergePolicy::Clean => ArchiveMode::Replace,
            MergePolicy::Merge => ArchiveMode::Preserve,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("no se pudo sincronizar el helper en {host}: {source}")]
    Helper {
        host: String,
        #[source]
        source: SyncError,
    },
    #[error("fallo escribiendo {file} en {host}: {source}")]
    Remote {
        host: String,
        file: String,
        #[source]
        source: RemoteError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Nada que escribir (sin propiedades o sin fichero).
    Skipped,
    Written { backup: Option<u64> },
}

/// Petición de escritura sobre un fichero concreto.
#[derive(Debug, Clone)]
pub struct ConfigTarget<'a> {
    pub file: &'a str,
    pub format: LineFormat,
    pub policy: MergePolicy,
    pub elevated: bool,
}

pub struct ConfigWriter {
    gate: Arc<SyncGate>,
    helper: PathBuf,
    helper_dir: String,
}

impl ConfigWriter {
    pub fn new(gate: Arc<SyncGate>, helper: impl Into<PathBuf>, helper_dir: impl Into<String>) -> Self {
        Self {
            gate,
            helper: helper.into(),
            helper_dir: helper_dir.into(),
        }
    }

    pub fn helper_remote_path(&self) -> String {
        let name = self
            .helper
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "propmerge".to_string());
        format!("{}/{}", self.helper_dir.trim_end_matches('/'), name)
    }

    /// Sube `propmerge` al host si su digest no coincide con el local.
    pub async fn ensure_helper(&self, shell: &dyn RemoteShell, host: &str) -> Result<SyncOutcome, WriteError> {
        self.gate
            .ensure_uploaded(shell, host, &self.helper, &self.helper_dir)
            .await
            .map_err(|source| WriteError::Helper {
                host: host.to_string(),
                source,
            })
    }

    pub async fn apply_properties(
        &self,
        shell: &dyn RemoteShell,
        host: &str,
        target: &ConfigTarget<'_>,
        props: &PropertySet,
    ) -> Result<WriteOutcome, WriteError> {
        if props.is_empty() || target.file.trim().is_empty() {
            debug!("[{}] nada que escribir en '{}'", host, target.file);
            return Ok(WriteOutcome::Skipped);
        }

        self.ensure_helper(shell, host).await?;

        let remote_err = |source: RemoteError| WriteError::Remote {
            host: host.to_string(),
            file: target.file.to_string(),
            source,
        };

        let managed = ManagedFile {
            path: target.file.to_string(),
            elevated: target.elevated,
        };
        let backup = managed
            .archive(shell, host, target.policy.archive_mode())
            .await
            .map_err(remote_err)?;

        let (dir, _) = split_remote_path(target.file);
        let touch = format!(
            "mkdir -p {} && touch {}",
            shell_quote(dir),
            shell_quote(target.file)
        );
        shell
            .run(host, &RemoteCommand::elevated_if(touch, target.elevated))
            .await
            .map_err(remote_err)?;

        let invocation = self.helper_invocation(target, props);
        shell
            .run(host, &RemoteCommand::elevated_if(invocation, target.elevated))
            .await
            .map_err(remote_err)?;

        info!(
            "[{}] {} actualizado ({} propiedades, formato {})",
            host,
            target.file,
            props.len(),
            target.format
        );
        Ok(WriteOutcome::Written { backup })
    }

    /// `propmerge --format <f> <fichero> <k1> <v1> ...`
    pub fn helper_invocation(&self, target: &ConfigTarget<'_>, props: &PropertySet) -> String {
        let mut parts = vec![
            shell_quote(&self.helper_remote_path()),
            "--format".to_string(),
            target.format.as_str().to_string(),
            shell_quote(target.file),
        ];
        for (k, v) in props.rendered() {
            parts.push(shell_quote(&k));
            parts.push(shell_quote(&v));
        }
        parts.join(" ")
    }
}
