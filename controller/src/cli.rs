use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::settings::{Settings, Transport};
use common::{
    resolve_from_cloud, resolve_static, AwsCliInventory, CloudQuery, ClusterTopology, HostRole,
    LocalShell, RemoteShell, SshOptions, SshShell,
};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::orchestrator::Orchestrator;
use crate::plan::{self, Operation};
use crate::sites::SiteProperties;
use crate::state::Session;

const HELPER_NAME: &str = "propmerge";
const WRAPPER_NAME: &str = "run-in-env.sh";

#[derive(Parser)]
#[command(name = "hafab")]
#[command(about = "Instala, configura y gobierna un cluster hadoop HA por ssh")]
pub struct Cli {
    /// Fichero de configuración TOML
    #[arg(long, env = "HAFAB_CONFIG", default_value = "hafab.toml", global = true)]
    config: PathBuf,

    /// Limita los pasos de varios hosts a estos (separados por comas)
    #[arg(long, value_delimiter = ',', global = true)]
    hosts: Vec<String>,

    /// Informe final en JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dependencias, entorno, hosts, instalación, configuración y zookeeper
    Bootstrap,
    /// Directorios de datos y paquetes
    Install,
    /// Ficheros *-site.xml, zoo.cfg y myid
    Configure,
    /// Arranca los daemons en orden
    Start,
    /// Para los daemons en orden inverso
    Stop {
        /// Mata además cualquier JVM que quede viva
        #[arg(long)]
        force: bool,
    },
    /// Inicialización HA destructiva (namenode, standby, zkfc)
    Format,
    /// Borra datos, logs y backups de configuración
    Reset,
    /// Vuelve al backup anterior de cada fichero de configuración
    Revert {
        /// Revierte también el fichero de entorno
        #[arg(long)]
        env: bool,
    },
    /// Lanza un job de prueba desde el coordinador
    Test {
        /// randomwriter en vez de distributed shell
        #[arg(long)]
        mapreduce: bool,
    },
    /// Muestra la topología resuelta
    Hosts,
}

impl Commands {
    fn operation(&self) -> Option<Operation> {
        Some(match self {
            Commands::Bootstrap => Operation::Bootstrap,
            Commands::Install => Operation::Install,
            Commands::Configure => Operation::Configure,
            Commands::Start => Operation::Start,
            Commands::Stop { force } => Operation::Stop { force: *force },
            Commands::Format => Operation::Format,
            Commands::Reset => Operation::Reset,
            Commands::Revert { env } => Operation::Revert { env: *env },
            Commands::Test { mapreduce } => Operation::Test {
                mapreduce: *mapreduce,
            },
            Commands::Hosts => return None,
        })
    }
}

/// Devuelve el código de salida del proceso.
pub async fn run() -> Result<i32> {
    let cli = Cli::parse();

    let settings = Settings::load(&cli.config)
        .with_context(|| format!("cargando {}", cli.config.display()))?;
    let topology = resolve_topology(&settings).await?;

    let Some(op) = cli.command.operation() else {
        print_topology(&topology, cli.json)?;
        return Ok(0);
    };

    let shell = build_shell(&settings);
    let helper = local_artifact(settings.paths.helper_artifact.as_deref(), HELPER_NAME)?;
    let wrapper = local_artifact(settings.paths.env_wrapper.as_deref(), WRAPPER_NAME)?;

    let mut sites = SiteProperties::derive(&topology, &settings);
    if let (Ok(id), Ok(secret)) = (env::var("AWS_ACCESS_KEY_ID"), env::var("AWS_SECRET_ACCESS_KEY")) {
        sites = sites.with_aws_credentials(&id, &secret);
    }

    let topology = Arc::new(topology);
    let settings = Arc::new(settings);
    let session = Session::new(shell, topology.clone(), settings.clone(), sites, helper, wrapper)
        .restrict_to(&cli.hosts)?;

    if op == Operation::Format {
        warn!(
            "format reinicializa el namespace en {} sin comprobar si ya estaba formateado",
            topology.coordinator()
        );
    }

    let plan = plan::build(op, &settings, &topology);
    info!("{}: {} pasos sobre {} hosts", op, plan.steps.len(), session.targets().len());

    let orchestrator = Orchestrator::new(Arc::new(session));
    let report = orchestrator.execute(&plan).await;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(report.exit_code())
}

async fn resolve_topology(settings: &Settings) -> Result<ClusterTopology> {
    if settings.ec2.enabled {
        let query = CloudQuery::from_settings(settings);
        let topology = resolve_from_cloud(&AwsCliInventory::default(), &query)
            .await
            .with_context(|| format!("consultando instancias con Cluster={}", query.cluster_tag))?;
        Ok(topology)
    } else {
        Ok(resolve_static(settings)?)
    }
}

fn build_shell(settings: &Settings) -> Arc<dyn RemoteShell> {
    match settings.cluster.transport {
        Transport::Ssh => Arc::new(SshShell::new(SshOptions {
            user: settings.cluster.ssh_user.clone(),
            identity_file: settings.cluster.identity_file.clone(),
            command_timeout: settings.command_timeout(),
            retries: settings.execution.ssh_retries,
        })),
        Transport::Local => {
            let mut shell = LocalShell::new().with_timeout(settings.command_timeout());
            shell.use_sudo = true;
            Arc::new(shell)
        }
    }
}

/// Artefacto local configurado, o el que está junto a este ejecutable.
fn local_artifact(configured: Option<&Path>, name: &str) -> Result<PathBuf> {
    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }
    let exe = env::current_exe().context("no se pudo localizar el ejecutable")?;
    let dir = exe
        .parent()
        .context("el ejecutable no tiene directorio padre")?;
    Ok(dir.join(name))
}

fn print_topology(topology: &ClusterTopology, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(topology)?);
        return Ok(());
    }
    for role in HostRole::ALL {
        println!("{:<18} {:?}", role.as_str(), topology.hosts_with(role));
    }
    println!("{:<18} {:?}", "quorum", topology.quorum());
    for host in topology.hosts() {
        if let Some(ip) = topology.private_address(host) {
            println!("{:<18} {} -> {}", "private", host, ip);
        }
    }
    Ok(())
}
