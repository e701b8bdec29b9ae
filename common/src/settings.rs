//! Configuración de la sesión, leída de un fichero TOML (`hafab.toml`).
//! Todo tiene valor por defecto salvo los hosts.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::properties::PropertySet;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("no se pudo leer {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("configuración inválida: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cluster: ClusterSection,
    pub hosts: HostsSection,
    pub ec2: Ec2Section,
    pub paths: PathsSection,
    pub packages: PackagesSection,
    pub policy: PolicySection,
    pub execution: ExecutionSection,
    pub bootstrap: BootstrapSection,
    pub overrides: Overrides,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn hadoop_prefix(&self) -> String {
        format!(
            "{}/{}",
            self.paths.install_root.trim_end_matches('/'),
            self.packages.hadoop_package()
        )
    }

    pub fn hadoop_conf(&self) -> String {
        format!("{}/etc/hadoop", self.hadoop_prefix())
    }

    pub fn zookeeper_prefix(&self) -> String {
        format!(
            "{}/{}",
            self.paths.install_root.trim_end_matches('/'),
            self.packages.zookeeper_package()
        )
    }

    pub fn zookeeper_conf(&self) -> String {
        format!("{}/conf", self.zookeeper_prefix())
    }

    /// Directorios que deben existir antes de arrancar los daemons.
    pub fn important_dirs(&self) -> Vec<String> {
        vec![
            self.paths.hadoop_tmp.clone(),
            self.paths.hdfs_data.clone(),
            self.paths.hdfs_name.clone(),
            self.paths.zookeeper_data.clone(),
        ]
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.command_timeout_secs)
    }

    /// Etiqueta `Cluster=<valor>` para el inventario en la nube.
    pub fn cloud_cluster_tag(&self) -> &str {
        self.ec2
            .cluster_tag
            .as_deref()
            .unwrap_or(self.cluster.name.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Ssh,
    /// Todo se ejecuta en la máquina del controlador.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub name: String,
    pub ssh_user: String,
    pub identity_file: Option<PathBuf>,
    pub transport: Transport,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            name: "hafab".to_string(),
            ssh_user: "ubuntu".to_string(),
            identity_file: None,
            transport: Transport::Ssh,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostsSection {
    pub coordinator: Option<String>,
    pub workers: Vec<String>,
    /// Por defecto el primer worker.
    pub primary_worker: Option<String>,
    /// Por defecto el segundo worker.
    pub secondary_worker: Option<String>,
    /// Por defecto el primer worker.
    pub history_server: Option<String>,
    /// Host del job tracker; por defecto el primer worker.
    pub jobtracker: Option<String>,
    pub jobtracker_port: u16,
    pub jobhistory_port: u16,
    /// Interfaz de la que se lee la IP privada de cada host.
    pub net_interface: String,
}

impl Default for HostsSection {
    fn default() -> Self {
        Self {
            coordinator: None,
            workers: Vec::new(),
            primary_worker: None,
            secondary_worker: None,
            history_server: None,
            jobtracker: None,
            jobtracker_port: 8021,
            jobhistory_port: 10020,
            net_interface: "ens5".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Ec2Section {
    pub enabled: bool,
    pub region: String,
    /// Valor de la etiqueta `Cluster`; por defecto `cluster.name`.
    pub cluster_tag: Option<String>,
    /// Si el coordinador también hace de worker.
    pub coordinator_is_worker: bool,
}

impl Default for Ec2Section {
    fn default() -> Self {
        Self {
            enabled: false,
            region: "eu-west-1".to_string(),
            cluster_tag: None,
            coordinator_is_worker: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub install_root: String,
    /// Directorio remoto donde viven `propmerge` y `run-in-env.sh`.
    pub helper_dir: String,
    /// Binario local de `propmerge`; por defecto junto al ejecutable.
    pub helper_artifact: Option<PathBuf>,
    /// `run-in-env.sh` local; por defecto junto al ejecutable.
    pub env_wrapper: Option<PathBuf>,
    pub env_file: String,
    /// Si el fichero de entorno se carga solo en cada sesión (p.ej. .bashrc).
    pub env_file_autoloaded: bool,
    pub hosts_file: String,
    pub private_ips_file: String,
    pub java_home: String,
    pub hadoop_tmp: String,
    pub hdfs_data: String,
    pub hdfs_name: String,
    pub journal_dir: String,
    pub zookeeper_data: String,
    pub fencing_key: String,
    /// Disco extra sin montar de algunas instancias (p.ej. /dev/xvdb).
    pub instance_storage_device: Option<String>,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            install_root: "/home/ubuntu/Programs".to_string(),
            helper_dir: "/home/ubuntu/.hafab/bin".to_string(),
            helper_artifact: None,
            env_wrapper: None,
            env_file: "/home/ubuntu/hadoop2_env.sh".to_string(),
            env_file_autoloaded: false,
            hosts_file: "/etc/hosts".to_string(),
            private_ips_file: "/home/ubuntu/privateIps".to_string(),
            java_home: "/usr/lib/jvm/java-1.8.0-openjdk-amd64".to_string(),
            hadoop_tmp: "/HA/data/tmp".to_string(),
            hdfs_data: "/HA/data/datanode".to_string(),
            hdfs_name: "/HA/data/namenode".to_string(),
            journal_dir: "/home/ubuntu/HA/data/jn".to_string(),
            zookeeper_data: "/HA/data/zookeeper".to_string(),
            fencing_key: "/home/ubuntu/.ssh/id_rsa".to_string(),
            instance_storage_device: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagesSection {
    pub hadoop_version: String,
    /// `{name}` se sustituye por `hadoop-<versión>`.
    pub hadoop_url: String,
    pub zookeeper_version: String,
    pub zookeeper_url: String,
}

impl Default for PackagesSection {
    fn default() -> Self {
        Self {
            hadoop_version: "2.8.5".to_string(),
            hadoop_url: "https://archive.apache.org/dist/hadoop/common/{name}/{name}.tar.gz"
                .to_string(),
            zookeeper_version: "3.4.6".to_string(),
            zookeeper_url: "https://archive.apache.org/dist/zookeeper/{name}/{name}.tar.gz"
                .to_string(),
        }
    }
}

impl PackagesSection {
    pub fn hadoop_package(&self) -> String {
        format!("hadoop-{}", self.hadoop_version)
    }

    pub fn zookeeper_package(&self) -> String {
        format!("zookeeper-{}", self.zookeeper_version)
    }

    pub fn hadoop_package_url(&self) -> String {
        self.hadoop_url.replace("{name}", &self.hadoop_package())
    }

    pub fn zookeeper_package_url(&self) -> String {
        self.zookeeper_url.replace("{name}", &self.zookeeper_package())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    pub config_files_clean: bool,
    pub env_file_clean: bool,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            config_files_clean: true,
            env_file_clean: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    pub command_timeout_secs: u64,
    pub ssh_retries: u32,
    pub abort_on_first_failure: bool,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            command_timeout_secs: 600,
            ssh_retries: 1,
            abort_on_first_failure: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapSection {
    /// Se ejecutan como root antes de instalar los requisitos.
    pub pre_commands: Vec<String>,
    pub requirements: Vec<String>,
    /// `{}` se sustituye por cada requisito.
    pub package_install: String,
}

impl Default for BootstrapSection {
    fn default() -> Self {
        Self {
            pre_commands: vec![
                "service iptables stop".to_string(),
                "service ufw stop".to_string(),
            ],
            requirements: vec![
                "wget".to_string(),
                "openjdk-8-jdk".to_string(),
                "ntp".to_string(),
            ],
            package_install: "apt-get -qq install {}".to_string(),
        }
    }
}

/// Propiedades del usuario que pisan a las derivadas de la topología.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Overrides {
    pub core: PropertySet,
    pub hdfs: PropertySet,
    pub yarn: PropertySet,
    pub mapred: PropertySet,
    pub zoo: PropertySet,
    pub env: PropertySet,
}
