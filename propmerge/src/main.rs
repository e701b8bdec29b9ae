//! propmerge: upsert de propiedades en un fichero de configuración local.
//!
//! `propmerge --format <kv|xml|export|hosts> <fichero> <k1> <v1> [<k2> <v2> ...]`
//!
//! Se sube a cada host y lo invoca el controlador. Escribe en un temporal
//! del mismo directorio y lo renombra encima del original.

use anyhow::{bail, Context, Result};
use clap::Parser;
use common::merge::{upsert, LineFormat};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "propmerge")]
#[command(about = "Reemplaza o añade propiedades en un fichero de configuración")]
struct Args {
    /// Sintaxis de las líneas del fichero
    #[arg(long, default_value = "kv")]
    format: LineFormat,

    /// Fichero a modificar (se crea si no existe)
    file: PathBuf,

    /// Pares clave valor
    #[arg(value_name = "CLAVE VALOR", trailing_var_arg = true, allow_hyphen_values = true)]
    pairs: Vec<String>,
}

fn pairs(raw: &[String]) -> Result<Vec<(String, String)>> {
    if raw.len() % 2 != 0 {
        bail!("la clave '{}' no tiene valor", raw[raw.len() - 1]);
    }
    Ok(raw
        .chunks(2)
        .map(|kv| (kv[0].clone(), kv[1].clone()))
        .collect())
}

fn merge_file(path: &Path, props: &[(String, String)], format: LineFormat) -> Result<()> {
    let current = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("leyendo {}", path.display())),
    };
    let merged = upsert(&current, props, format)
        .with_context(|| format!("fusionando {}", path.display()))?;
    if merged == current {
        debug!("{} sin cambios", path.display());
        return Ok(());
    }

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("creando temporal en {}", dir.display()))?;
    tmp.write_all(merged.as_bytes())?;
    tmp.as_file().sync_all()?;
    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(tmp.path(), meta.permissions())?;
    }
    tmp.persist(path)
        .with_context(|| format!("reemplazando {}", path.display()))?;
    debug!("{} actualizado ({} propiedades)", path.display(), props.len());
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("propmerge=warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let props = pairs(&args.pairs)?;
    merge_file(&args.file, &props, args.format)
}
