//! Cadena de backups numerados (`<fichero>.bak0`, `.bak1`, ...) de un
//! fichero remoto. La generación más alta es siempre la versión anterior
//! más reciente.

use tracing::{debug, info};

use crate::remote::{shell_quote, split_remote_path, RemoteCommand, RemoteError, RemoteShell};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveMode {
    /// `cp -p`: el fichero vivo se mantiene (política merge).
    Preserve,
    /// `mv`: el fichero vivo desaparece (política clean).
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedFile {
    pub path: String,
    /// Ficheros del sistema como /etc/hosts necesitan sudo.
    pub elevated: bool,
}

impl ManagedFile {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            elevated: false,
        }
    }

    pub fn elevated(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            elevated: true,
        }
    }

    pub fn backup_path(&self, generation: u64) -> String {
        format!("{}.bak{}", self.path, generation)
    }

    fn cmd(&self, script: String) -> RemoteCommand {
        RemoteCommand::elevated_if(script, self.elevated)
    }

    /// Generación más alta existente o -1. Un listado fallido cuenta como
    /// "sin backups".
    pub async fn latest_generation(&self, shell: &dyn RemoteShell, host: &str) -> i64 {
        let (dir, base) = split_remote_path(&self.path);
        let listing = match shell
            .exec(host, &RemoteCommand::new(format!("ls -1 {}", shell_quote(dir))))
            .await
        {
            Ok(out) if out.success() => out.stdout,
            _ => return -1,
        };
        latest_from_listing(base, &listing)
    }

    pub async fn exists(&self, shell: &dyn RemoteShell, host: &str) -> bool {
        shell
            .probe(host, &self.cmd(format!("test -f {}", shell_quote(&self.path))))
            .await
    }

    /// Archiva el fichero vivo en la siguiente generación. Devuelve la
    /// generación creada, o `None` si el fichero no existía.
    pub async fn archive(
        &self,
        shell: &dyn RemoteShell,
        host: &str,
        mode: ArchiveMode,
    ) -> Result<Option<u64>, RemoteError> {
        if !self.exists(shell, host).await {
            debug!("[{}] {} no existe, nada que archivar", host, self.path);
            return Ok(None);
        }

        let next = (self.latest_generation(shell, host).await + 1) as u64;
        let op = match mode {
            ArchiveMode::Preserve => "cp -p",
            ArchiveMode::Replace => "mv",
        };
        let script = format!(
            "{} {} {}",
            op,
            shell_quote(&self.path),
            shell_quote(&self.backup_path(next))
        );
        shell.run(host, &self.cmd(script)).await?;
        info!("[{}] {} archivado como generación {}", host, self.path, next);
        Ok(Some(next))
    }

    /// Restaura solo el backup más reciente. `false` si no había ninguno.
    pub async fn revert(&self, shell: &dyn RemoteShell, host: &str) -> Result<bool, RemoteError> {
        let latest = self.latest_generation(shell, host).await;
        if latest < 0 {
            debug!("[{}] {} sin backups que restaurar", host, self.path);
            return Ok(false);
        }

        let script = format!(
            "mv {} {}",
            shell_quote(&self.backup_path(latest as u64)),
            shell_quote(&self.path)
        );
        shell.run(host, &self.cmd(script)).await?;
        info!("[{}] {} restaurado desde generación {}", host, self.path, latest);
        Ok(true)
    }
}

/// Máximo N numérico entre las entradas `<base>.bak<N>` del listado.
pub fn latest_from_listing(base: &str, listing: &str) -> i64 {
    let prefix = format!("{}.bak", base);
    listing
        .lines()
        .map(str::trim)
        .filter_map(|name| name.strip_prefix(prefix.as_str()))
        .filter(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|n| n.parse::<i64>().ok())
        .max()
        .unwrap_or(-1)
}

/// Borra todos los `*.bak*` de un directorio (usado por `reset`).
pub async fn purge_backups(
    shell: &dyn RemoteShell,
    host: &str,
    dir: &str,
    elevated: bool,
) -> Result<(), RemoteError> {
    let script = format!("rm -f {}/*.bak*", shell_quote(dir));
    shell
        .run(host, &RemoteCommand::elevated_if(script, elevated))
        .await?;
    Ok(())
}
