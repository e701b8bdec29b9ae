//! Compuerta de sincronización por hash: un artefacto auxiliar solo se
//! vuelve a subir a un host cuando su digest remoto no coincide con el local.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::remote::{shell_quote, RemoteCommand, RemoteError, RemoteShell};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// El digest remoto coincide, no se transfirió nada.
    Current,
    Uploaded,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no se pudo leer el artefacto local {path:?}: {source}")]
    LocalArtifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("artefacto sin nombre de fichero: {0:?}")]
    NoFileName(PathBuf),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Guarda en caché el digest de cada artefacto local durante la sesión.
#[derive(Debug, Default)]
pub struct SyncGate {
    digests: Mutex<HashMap<PathBuf, String>>,
}

impl SyncGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_digest(&self, artifact: &Path) -> Result<String, SyncError> {
        if let Ok(cache) = self.digests.lock() {
            if let Some(d) = cache.get(artifact) {
                return Ok(d.clone());
            }
        }

        let bytes = std::fs::read(artifact).map_err(|source| SyncError::LocalArtifact {
            path: artifact.to_path_buf(),
            source,
        })?;
        let digest = sha256_hex(&bytes);

        if let Ok(mut cache) = self.digests.lock() {
            cache.insert(artifact.to_path_buf(), digest.clone());
        }
        Ok(digest)
    }

    /// Garantiza que `<remote_dir>/<nombre>` en `host` es idéntico al
    /// artefacto local y ejecutable.
    pub async fn ensure_uploaded(
        &self,
        shell: &dyn RemoteShell,
        host: &str,
        artifact: &Path,
        remote_dir: &str,
    ) -> Result<SyncOutcome, SyncError> {
        let name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| SyncError::NoFileName(artifact.to_path_buf()))?;
        let remote_path = format!("{}/{}", remote_dir.trim_end_matches('/'), name);

        let local = self.local_digest(artifact)?;
        let remote = remote_digest(shell, host, &remote_path).await;

        if remote.as_deref() == Some(local.as_str()) {
            debug!("[{}] {} al día ({})", host, remote_path, &local[..12]);
            return Ok(SyncOutcome::Current);
        }

        shell
            .run(
                host,
                &RemoteCommand::new(format!("mkdir -p {}", shell_quote(remote_dir))),
            )
            .await?;
        shell.upload(host, artifact, &remote_path).await?;
        shell
            .run(
                host,
                &RemoteCommand::new(format!("chmod +x {}", shell_quote(&remote_path))),
            )
            .await?;

        info!("[{}] subido {} ({})", host, remote_path, &local[..12]);
        Ok(SyncOutcome::Uploaded)
    }
}

/// Digest remoto, o `None` si el fichero no existe o el comando falla.
async fn remote_digest(shell: &dyn RemoteShell, host: &str, remote_path: &str) -> Option<String> {
    let cmd = RemoteCommand::new(format!(
        "sha256sum {} | cut -d ' ' -f 1",
        shell_quote(remote_path)
    ));
    match shell.exec(host, &cmd).await {
        Ok(out) if out.success() => out
            .first_line()
            .filter(|d| d.len() == 64)
            .map(|d| d.to_string()),
        _ => None,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
