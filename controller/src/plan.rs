//! Planes de ciclo de vida: para cada operación, la secuencia ordenada de
//! pasos con su modo de ejecución y los hosts que participan.

use common::settings::Settings;
use common::{ClusterTopology, HostRole};
use serde::Serialize;
use std::fmt;

use crate::sites::SiteFile;

/// Qué hosts de la sesión participan en un paso.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    AllHosts,
    Role(HostRole),
    /// Miembros del quorum de coordinación.
    Quorum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// Solo el primer host con el rol, aunque no esté en el subconjunto
    /// objetivo de la sesión.
    Once(HostRole),
    /// Secuencial sobre los hosts seleccionados.
    All(Selector),
    /// Concurrente; todos terminan antes del siguiente paso.
    Parallel(Selector),
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecMode::Once(role) => write!(f, "once({})", role),
            ExecMode::All(sel) => write!(f, "all({:?})", sel),
            ExecMode::Parallel(sel) => write!(f, "parallel({:?})", sel),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Package {
    Hadoop,
    Zookeeper,
}

/// Trabajo que se ejecuta en cada host participante.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Comando de un daemon, dentro del entorno si éste no se autocarga.
    InEnv { dir: String, command: String },
    /// Comando tal cual.
    Shell { script: String, elevated: bool },
    /// Sube el helper de merge (y el wrapper de entorno si hace falta).
    SyncHelpers,
    InstallDependencies,
    CollectPublicKey,
    AuthorizeClusterKeys,
    ProbePrivateAddress,
    UpdateHostsFile,
    WritePrivateIps,
    MountInstanceStorage,
    EnsureDirectories,
    InstallPackage(Package),
    WriteSite(SiteFile),
    WriteMyid,
    RevertSite(SiteFile),
    Reset,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub mode: ExecMode,
    pub action: Action,
    /// Si falla en un host, los pasos siguientes se saltan en ese host.
    pub required: bool,
}

impl Step {
    pub fn new(name: impl Into<String>, mode: ExecMode, action: Action) -> Self {
        Self {
            name: name.into(),
            mode,
            action,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "operation")]
pub enum Operation {
    Bootstrap,
    Install,
    Configure,
    Start,
    Stop { force: bool },
    Format,
    Reset,
    Revert { env: bool },
    Test { mapreduce: bool },
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Bootstrap => "bootstrap",
            Operation::Install => "install",
            Operation::Configure => "configure",
            Operation::Start => "start",
            Operation::Stop { .. } => "stop",
            Operation::Format => "format",
            Operation::Reset => "reset",
            Operation::Revert { .. } => "revert",
            Operation::Test { .. } => "test",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub operation: Operation,
    pub steps: Vec<Step>,
}

/// Grupos de daemons en orden de arranque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Daemon {
    JournalNode,
    NameNode,
    StandbyNameNode,
    FailoverController,
    StandbyFailoverController,
    DataNode,
    ResourceManager,
    StandbyResourceManager,
    NodeManager,
    HistoryServer,
}

const START_ORDER: [Daemon; 10] = [
    Daemon::JournalNode,
    Daemon::NameNode,
    Daemon::StandbyNameNode,
    Daemon::FailoverController,
    Daemon::StandbyFailoverController,
    Daemon::DataNode,
    Daemon::ResourceManager,
    Daemon::StandbyResourceManager,
    Daemon::NodeManager,
    Daemon::HistoryServer,
];

impl Daemon {
    fn name(&self) -> &'static str {
        match self {
            Daemon::JournalNode => "journalnode",
            Daemon::NameNode | Daemon::StandbyNameNode => "namenode",
            Daemon::FailoverController | Daemon::StandbyFailoverController => "zkfc",
            Daemon::DataNode => "datanode",
            Daemon::ResourceManager | Daemon::StandbyResourceManager => "resourcemanager",
            Daemon::NodeManager => "nodemanager",
            Daemon::HistoryServer => "historyserver",
        }
    }

    fn script(&self) -> &'static str {
        match self {
            Daemon::ResourceManager | Daemon::StandbyResourceManager | Daemon::NodeManager => {
                "sbin/yarn-daemon.sh"
            }
            Daemon::HistoryServer => "sbin/mr-jobhistory-daemon.sh",
            _ => "sbin/hadoop-daemon.sh",
        }
    }

    fn mode(&self) -> ExecMode {
        match self {
            Daemon::JournalNode => ExecMode::Parallel(Selector::AllHosts),
            Daemon::NameNode | Daemon::FailoverController | Daemon::ResourceManager => {
                ExecMode::Once(HostRole::Coordinator)
            }
            Daemon::StandbyNameNode
            | Daemon::StandbyFailoverController
            | Daemon::StandbyResourceManager => ExecMode::Once(HostRole::PrimaryWorker),
            Daemon::DataNode | Daemon::NodeManager => ExecMode::All(Selector::Role(HostRole::Worker)),
            Daemon::HistoryServer => ExecMode::Once(HostRole::HistoryServer),
        }
    }

    fn step(&self, settings: &Settings, verb: &str) -> Step {
        let label = match self {
            Daemon::StandbyNameNode
            | Daemon::StandbyFailoverController
            | Daemon::StandbyResourceManager => format!("{} standby {}", verb, self.name()),
            _ => format!("{} {}", verb, self.name()),
        };
        Step::new(label, self.mode(), hadoop(settings, &format!("{} {} {}", self.script(), verb, self.name())))
    }
}

/// Comando relativo al prefijo de instalación de hadoop.
fn hadoop(settings: &Settings, command: &str) -> Action {
    let prefix = settings.hadoop_prefix();
    Action::InEnv {
        command: format!("{}/{}", prefix, command),
        dir: prefix,
    }
}

fn zookeeper(settings: &Settings, command: &str) -> Action {
    let prefix = settings.zookeeper_prefix();
    Action::InEnv {
        command: format!("{}/{}", prefix, command),
        dir: prefix,
    }
}

pub fn build(op: Operation, settings: &Settings, topology: &ClusterTopology) -> Plan {
    let steps = match op {
        Operation::Bootstrap => bootstrap_steps(settings),
        Operation::Install => install_steps(),
        Operation::Configure => configure_steps(),
        Operation::Start => start_steps(settings),
        Operation::Stop { force } => stop_steps(settings, force),
        Operation::Format => format_steps(settings),
        Operation::Reset => vec![Step::new("reset", ExecMode::Parallel(Selector::AllHosts), Action::Reset)],
        Operation::Revert { env } => revert_steps(env),
        Operation::Test { mapreduce } => test_steps(settings, topology, mapreduce),
    };
    // sin standby distinto del coordinador los ficheros site solo declaran
    // nn1/rm1: nada que arrancar ni sincronizar en espera
    let steps = if topology.standby().is_none() {
        steps
            .into_iter()
            .filter(|s| s.mode != ExecMode::Once(HostRole::PrimaryWorker))
            .collect()
    } else {
        steps
    };
    Plan { operation: op, steps }
}

fn install_steps() -> Vec<Step> {
    vec![
        Step::new("directorios", ExecMode::Parallel(Selector::AllHosts), Action::EnsureDirectories).required(),
        Step::new(
            "instalar hadoop",
            ExecMode::Parallel(Selector::AllHosts),
            Action::InstallPackage(Package::Hadoop),
        ),
        Step::new(
            "instalar zookeeper",
            ExecMode::Parallel(Selector::Quorum),
            Action::InstallPackage(Package::Zookeeper),
        ),
    ]
}

fn sync_step() -> Step {
    Step::new("helpers", ExecMode::Parallel(Selector::AllHosts), Action::SyncHelpers).required()
}

fn configure_steps() -> Vec<Step> {
    let mut steps = vec![sync_step()];
    steps.extend(SiteFile::HADOOP.iter().map(|f| {
        Step::new(
            format!("configurar {}", f),
            ExecMode::Parallel(Selector::AllHosts),
            Action::WriteSite(*f),
        )
    }));
    steps.push(Step::new(
        "configurar zoo.cfg",
        ExecMode::Parallel(Selector::Quorum),
        Action::WriteSite(SiteFile::Zoo),
    ));
    steps.push(Step::new("myid", ExecMode::Parallel(Selector::Quorum), Action::WriteMyid));
    steps
}

/// Propagación de direcciones privadas al fichero de hosts.
pub fn propagation_steps() -> Vec<Step> {
    vec![
        Step::new(
            "ip privada",
            ExecMode::Parallel(Selector::AllHosts),
            Action::ProbePrivateAddress,
        ),
        Step::new(
            "actualizar hosts",
            ExecMode::Parallel(Selector::AllHosts),
            Action::UpdateHostsFile,
        ),
        Step::new(
            "inventario de ips",
            ExecMode::Once(HostRole::Coordinator),
            Action::WritePrivateIps,
        ),
    ]
}

fn bootstrap_steps(settings: &Settings) -> Vec<Step> {
    let all = ExecMode::Parallel(Selector::AllHosts);
    let quorum = ExecMode::Parallel(Selector::Quorum);

    let mut steps = vec![
        Step::new("dependencias", all, Action::InstallDependencies),
        sync_step(),
        Step::new("clave ssh", all, Action::CollectPublicKey),
        Step::new("ssh sin contraseña", all, Action::AuthorizeClusterKeys),
        Step::new("entorno", all, Action::WriteSite(SiteFile::Env)),
    ];
    steps.extend(propagation_steps());
    steps.push(Step::new("almacenamiento de instancia", all, Action::MountInstanceStorage));
    steps.extend(install_steps());
    steps.extend(configure_steps());
    steps.push(Step::new("start zookeeper", quorum, zookeeper(settings, "bin/zkServer.sh start")));
    steps.push(Daemon::JournalNode.step(settings, "start"));
    steps
}

fn start_steps(settings: &Settings) -> Vec<Step> {
    START_ORDER.iter().map(|d| d.step(settings, "start")).collect()
}

fn stop_steps(settings: &Settings, force: bool) -> Vec<Step> {
    let mut steps: Vec<Step> = START_ORDER.iter().rev().map(|d| d.step(settings, "stop")).collect();
    steps.push(Step::new(
        "stop zookeeper",
        ExecMode::Parallel(Selector::Quorum),
        zookeeper(settings, "bin/zkServer.sh stop"),
    ));
    if force {
        steps.push(Step::new(
            "matar JVMs",
            ExecMode::Parallel(Selector::AllHosts),
            Action::Shell {
                script: "jps | grep -vi jps | cut -d ' ' -f 1 | xargs -L1 -r kill".to_string(),
                elevated: false,
            },
        ));
    }
    steps
}

fn format_steps(settings: &Settings) -> Vec<Step> {
    vec![
        Step::new(
            "format namenode",
            ExecMode::Once(HostRole::Coordinator),
            hadoop(settings, "bin/hdfs namenode -format -nonInteractive"),
        )
        .required(),
        Daemon::NameNode.step(settings, "start"),
        Step::new(
            "bootstrap standby",
            ExecMode::Once(HostRole::PrimaryWorker),
            hadoop(settings, "bin/hdfs namenode -bootstrapStandby -nonInteractive"),
        )
        .required(),
        Daemon::StandbyNameNode.step(settings, "start"),
        Step::new(
            "format zkfc",
            ExecMode::Once(HostRole::Coordinator),
            hadoop(settings, "bin/hdfs zkfc -formatZK -nonInteractive"),
        ),
    ]
}

fn revert_steps(env: bool) -> Vec<Step> {
    let mut steps: Vec<Step> = SiteFile::HADOOP
        .iter()
        .map(|f| {
            Step::new(
                format!("revertir {}", f),
                ExecMode::Parallel(Selector::AllHosts),
                Action::RevertSite(*f),
            )
        })
        .collect();
    steps.push(Step::new(
        "revertir zoo.cfg",
        ExecMode::Parallel(Selector::Quorum),
        Action::RevertSite(SiteFile::Zoo),
    ));
    if env {
        steps.push(Step::new(
            "revertir entorno",
            ExecMode::Parallel(Selector::AllHosts),
            Action::RevertSite(SiteFile::Env),
        ));
    }
    steps
}

fn test_steps(settings: &Settings, topology: &ClusterTopology, mapreduce: bool) -> Vec<Step> {
    let once = ExecMode::Once(HostRole::Coordinator);
    let version = &settings.packages.hadoop_version;
    let prefix = settings.hadoop_prefix();

    if mapreduce {
        let jar = format!("{}/share/hadoop/mapreduce/hadoop-mapreduce-examples-{}.jar", prefix, version);
        return vec![
            Step::new("limpiar salida", once, hadoop(settings, "bin/hadoop fs -rm -f -r out")),
            Step::new("randomwriter", once, hadoop(settings, &format!("bin/hadoop jar {} randomwriter out", jar))),
        ];
    }

    let jar = format!(
        "{}/share/hadoop/yarn/hadoop-yarn-applications-distributedshell-{}.jar",
        prefix, version
    );
    let containers = topology.hosts_with(HostRole::Worker).len().max(1);
    let command = format!(
        "bin/hadoop jar {jar} org.apache.hadoop.yarn.applications.distributedshell.Client \
         --jar {jar} --shell_command date --num_containers {containers} --master_memory 1024"
    );
    vec![Step::new("distributed shell", once, hadoop(settings, &command))]
}
