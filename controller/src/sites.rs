//! Propiedades de cada fichero de configuración, derivadas de la topología
//! y de los ajustes. Se calculan una vez por sesión.

use common::settings::Settings;
use common::{ClusterTopology, HostRole, LineFormat, MergePolicy, PropertySet};
use std::fmt;

const ZK_CLIENT_PORT: i64 = 2181;
const ZK_PEER_PORTS: &str = "2888:3888";
const JOURNAL_PORT: u16 = 8485;
const NAMENODE_RPC_PORT: u16 = 9000;
const NAMENODE_HTTP_PORT: u16 = 50070;
const RM_WEBAPP_PORT: u16 = 8088;

/// Ficheros gestionados por `configure` / `revert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteFile {
    Core,
    Hdfs,
    Yarn,
    Mapred,
    Zoo,
    Env,
}

impl SiteFile {
    pub const HADOOP: [SiteFile; 4] = [SiteFile::Core, SiteFile::Hdfs, SiteFile::Yarn, SiteFile::Mapred];

    pub fn path(&self, settings: &Settings) -> String {
        match self {
            SiteFile::Core => format!("{}/core-site.xml", settings.hadoop_conf()),
            SiteFile::Hdfs => format!("{}/hdfs-site.xml", settings.hadoop_conf()),
            SiteFile::Yarn => format!("{}/yarn-site.xml", settings.hadoop_conf()),
            SiteFile::Mapred => format!("{}/mapred-site.xml", settings.hadoop_conf()),
            SiteFile::Zoo => format!("{}/zoo.cfg", settings.zookeeper_conf()),
            SiteFile::Env => settings.paths.env_file.clone(),
        }
    }

    pub fn format(&self) -> LineFormat {
        match self {
            SiteFile::Zoo => LineFormat::KeyValue,
            SiteFile::Env => LineFormat::Export,
            _ => LineFormat::HadoopXml,
        }
    }

    pub fn policy(&self, settings: &Settings) -> MergePolicy {
        match self {
            SiteFile::Env => MergePolicy::from_clean_flag(settings.policy.env_file_clean),
            _ => MergePolicy::from_clean_flag(settings.policy.config_files_clean),
        }
    }
}

impl fmt::Display for SiteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SiteFile::Core => "core-site",
            SiteFile::Hdfs => "hdfs-site",
            SiteFile::Yarn => "yarn-site",
            SiteFile::Mapred => "mapred-site",
            SiteFile::Zoo => "zoo.cfg",
            SiteFile::Env => "environment",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SiteProperties {
    pub core: PropertySet,
    pub hdfs: PropertySet,
    pub yarn: PropertySet,
    pub mapred: PropertySet,
    pub zoo: PropertySet,
    pub env: PropertySet,
}

impl SiteProperties {
    pub fn derive(topology: &ClusterTopology, settings: &Settings) -> Self {
        let mut sites = SiteProperties {
            core: core_site(settings),
            hdfs: hdfs_site(topology, settings),
            yarn: yarn_site(topology, settings),
            mapred: mapred_site(topology, settings),
            zoo: zoo_cfg(topology, settings),
            env: environment(settings),
        };

        // lo del usuario siempre gana
        let o = &settings.overrides;
        sites.core.extend(&o.core);
        sites.hdfs.extend(&o.hdfs);
        sites.yarn.extend(&o.yarn);
        sites.mapred.extend(&o.mapred);
        sites.zoo.extend(&o.zoo);
        sites.env.extend(&o.env);
        sites
    }

    /// Credenciales S3 en core-site, salvo que el usuario ya las fije.
    pub fn with_aws_credentials(mut self, access_key: &str, secret_key: &str) -> Self {
        if self.core.get("fs.s3n.awsAccessKeyId").is_none() {
            self.core.set("fs.s3n.awsAccessKeyId", access_key);
        }
        if self.core.get("fs.s3n.awsSecretAccessKey").is_none() {
            self.core.set("fs.s3n.awsSecretAccessKey", secret_key);
        }
        self
    }

    pub fn get(&self, file: SiteFile) -> &PropertySet {
        match file {
            SiteFile::Core => &self.core,
            SiteFile::Hdfs => &self.hdfs,
            SiteFile::Yarn => &self.yarn,
            SiteFile::Mapred => &self.mapred,
            SiteFile::Zoo => &self.zoo,
            SiteFile::Env => &self.env,
        }
    }
}

fn core_site(settings: &Settings) -> PropertySet {
    let name = &settings.cluster.name;
    PropertySet::new()
        .with("fs.defaultFS", format!("hdfs://{}/", name))
        .with("hadoop.tmp.dir", settings.paths.hadoop_tmp.as_str())
        .with("dfs.journalnode.edits.dir", settings.paths.journal_dir.as_str())
}

/// Naming services en orden de id: nn1 en el coordinador, nn2 en el
/// primary worker si existe y es otro host.
fn ha_pair(topology: &ClusterTopology) -> Vec<String> {
    let mut pair = vec![topology.coordinator().to_string()];
    if let Some(standby) = topology.standby() {
        pair.push(standby.to_string());
    }
    pair
}

fn zookeeper_quorum(topology: &ClusterTopology) -> String {
    topology
        .quorum()
        .iter()
        .map(|h| format!("{}:{}", h, ZK_CLIENT_PORT))
        .collect::<Vec<_>>()
        .join(",")
}

fn hdfs_site(topology: &ClusterTopology, settings: &Settings) -> PropertySet {
    let name = settings.cluster.name.as_str();
    let pair = ha_pair(topology);
    let ids: Vec<String> = (1..=pair.len()).map(|i| format!("nn{}", i)).collect();

    let journals = topology
        .quorum()
        .iter()
        .map(|h| format!("{}:{}", h, JOURNAL_PORT))
        .collect::<Vec<_>>()
        .join(";");

    let mut props = PropertySet::new()
        .with("dfs.datanode.data.dir", format!("file://{}", settings.paths.hdfs_data))
        .with("dfs.namenode.name.dir", format!("file://{}", settings.paths.hdfs_name))
        .with("dfs.nameservices", name)
        .with("dfs.replication", 1_i64)
        .with("dfs.permissions", false)
        .with(format!("dfs.ha.namenodes.{}", name), ids.join(","))
        .with("dfs.namenode.shared.edits.dir", format!("qjournal://{}/{}", journals, name))
        .with(
            format!("dfs.client.failover.proxy.provider.{}", name),
            "org.apache.hadoop.hdfs.server.namenode.ha.ConfiguredFailoverProxyProvider",
        )
        .with("dfs.ha.automatic-failover.enabled", true)
        .with("ha.zookeeper.quorum", zookeeper_quorum(topology))
        .with("dfs.ha.fencing.methods", "sshfence")
        .with("dfs.ha.fencing.ssh.private-key-files", settings.paths.fencing_key.as_str())
        .with("dfs.namenode.datanode.registration.ip-hostname-check", false);

    for (id, host) in ids.iter().zip(&pair) {
        props.set(
            format!("dfs.namenode.rpc-address.{}.{}", name, id),
            format!("{}:{}", host, NAMENODE_RPC_PORT),
        );
        props.set(
            format!("dfs.namenode.http-address.{}.{}", name, id),
            format!("{}:{}", host, NAMENODE_HTTP_PORT),
        );
    }
    props
}

fn yarn_site(topology: &ClusterTopology, settings: &Settings) -> PropertySet {
    let pair = ha_pair(topology);
    let ids: Vec<String> = (1..=pair.len()).map(|i| format!("rm{}", i)).collect();
    let tmp = settings.paths.hadoop_tmp.trim_end_matches('/');

    let mut props = PropertySet::new()
        .with("yarn.resourcemanager.hostname", topology.coordinator())
        .with("yarn.scheduler.minimum-allocation-mb", 128_i64)
        .with("yarn.scheduler.maximum-allocation-mb", 1024_i64)
        .with("yarn.scheduler.minimum-allocation-vcores", 1_i64)
        .with("yarn.scheduler.maximum-allocation-vcores", 2_i64)
        .with("yarn.nodemanager.resource.memory-mb", 4096_i64)
        .with("yarn.nodemanager.resource.cpu-vcores", 4_i64)
        .with("yarn.log-aggregation-enable", true)
        .with("yarn.nodemanager.aux-services", "mapreduce_shuffle")
        .with("yarn.nodemanager.vmem-pmem-ratio", 3.1_f64)
        .with("yarn.nodemanager.remote-app-log-dir", format!("{}/logs", tmp))
        .with("yarn.nodemanager.log-dirs", format!("{}/userlogs", tmp))
        .with("yarn.resourcemanager.ha.enabled", pair.len() > 1)
        .with("yarn.resourcemanager.cluster-id", format!("{}_rm", settings.cluster.name))
        .with("yarn.resourcemanager.ha.rm-ids", ids.join(","))
        .with("yarn.resourcemanager.zk-address", zookeeper_quorum(topology));

    for (id, host) in ids.iter().zip(&pair) {
        props.set(format!("yarn.resourcemanager.hostname.{}", id), host.as_str());
        props.set(
            format!("yarn.resourcemanager.webapp.address.{}", id),
            format!("{}:{}", host, RM_WEBAPP_PORT),
        );
    }
    props
}

fn mapred_site(topology: &ClusterTopology, settings: &Settings) -> PropertySet {
    let mut props = PropertySet::new()
        .with("yarn.app.mapreduce.am.resource.mb", 1024_i64)
        .with("yarn.app.mapreduce.am.command-opts", "-Xmx768m")
        .with("mapreduce.framework.name", "yarn")
        .with("mapreduce.map.cpu.vcores", 1_i64)
        .with("mapreduce.map.memory.mb", 1024_i64)
        .with("mapreduce.map.java.opts", "-Xmx768m")
        .with("mapreduce.reduce.cpu.vcores", 1_i64)
        .with("mapreduce.reduce.memory.mb", 1024_i64)
        .with("mapreduce.reduce.java.opts", "-Xmx768m");

    let jobtracker = settings
        .hosts
        .jobtracker
        .as_deref()
        .or_else(|| topology.first_with(HostRole::Worker));
    if let Some(host) = jobtracker {
        props.set(
            "mapreduce.jobtracker.address",
            format!("{}:{}", host, settings.hosts.jobtracker_port),
        );
    }
    if let Some(host) = topology.first_with(HostRole::HistoryServer) {
        props.set(
            "mapreduce.jobhistory.address",
            format!("{}:{}", host, settings.hosts.jobhistory_port),
        );
    }
    props
}

fn zoo_cfg(topology: &ClusterTopology, settings: &Settings) -> PropertySet {
    let mut props = PropertySet::new()
        .with("tickTime", 2000_i64)
        .with("initLimit", 10_i64)
        .with("syncLimit", 5_i64)
        .with("dataDir", settings.paths.zookeeper_data.as_str())
        .with("clientPort", ZK_CLIENT_PORT);
    for (idx, host) in topology.quorum().iter().enumerate() {
        props.set(format!("server.{}", idx + 1), format!("{}:{}", host, ZK_PEER_PORTS));
    }
    props
}

/// Variables del fichero de entorno. Se escriben ya expandidas: el fichero
/// sale ordenado por nombre y no puede depender de variables anteriores.
fn environment(settings: &Settings) -> PropertySet {
    let prefix = settings.hadoop_prefix();
    let conf = settings.hadoop_conf();
    let zk = settings.zookeeper_prefix();
    let pid_dir = format!("/tmp/hadoop_{}", settings.packages.hadoop_version);

    PropertySet::new()
        .with("JAVA_HOME", settings.paths.java_home.as_str())
        .with("HADOOP_PREFIX", prefix.as_str())
        .with("HADOOP_HOME", prefix.as_str())
        .with("HADOOP_COMMON_HOME", prefix.as_str())
        .with("HADOOP_HDFS_HOME", prefix.as_str())
        .with("HADOOP_MAPRED_HOME", prefix.as_str())
        .with("HADOOP_YARN_HOME", prefix.as_str())
        .with("HADOOP_CONF_DIR", conf.as_str())
        .with("HADOOP_YARN_CONF_DIR", conf.as_str())
        .with("HADOOP_PID_DIR", pid_dir.as_str())
        .with("YARN_PID_DIR", pid_dir.as_str())
        .with("ZOOKEEPER_HOME", zk.as_str())
        .with("PATH", format!("{zk}/bin:{prefix}/bin:{prefix}/sbin:$PATH"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::PropertyValue;

    fn topology() -> ClusterTopology {
        ClusterTopology::builder()
            .assign(HostRole::Coordinator, "a")
            .assign_all(HostRole::Worker, ["b", "c"])
            .assign(HostRole::PrimaryWorker, "b")
            .assign(HostRole::SecondaryWorker, "c")
            .assign(HostRole::HistoryServer, "b")
            .build()
            .unwrap()
    }

    fn text(props: &PropertySet, key: &str) -> String {
        props.get(key).map(|v| v.to_string()).unwrap_or_default()
    }

    #[test]
    fn ha_keys_follow_roles() {
        let mut settings = Settings::default();
        settings.cluster.name = "wisilica".to_string();
        let sites = SiteProperties::derive(&topology(), &settings);

        assert_eq!(text(&sites.core, "fs.defaultFS"), "hdfs://wisilica/");
        assert_eq!(text(&sites.hdfs, "dfs.ha.namenodes.wisilica"), "nn1,nn2");
        assert_eq!(text(&sites.hdfs, "dfs.namenode.rpc-address.wisilica.nn1"), "a:9000");
        assert_eq!(text(&sites.hdfs, "dfs.namenode.rpc-address.wisilica.nn2"), "b:9000");
        assert_eq!(
            text(&sites.hdfs, "dfs.namenode.shared.edits.dir"),
            "qjournal://a:8485;b:8485;c:8485/wisilica"
        );
        assert_eq!(text(&sites.hdfs, "ha.zookeeper.quorum"), "a:2181,b:2181,c:2181");
        assert_eq!(text(&sites.yarn, "yarn.resourcemanager.hostname.rm2"), "b");
        assert_eq!(text(&sites.yarn, "yarn.resourcemanager.ha.enabled"), "true");
    }

    #[test]
    fn zoo_lists_one_server_per_quorum_member() {
        let sites = SiteProperties::derive(&topology(), &Settings::default());
        assert_eq!(text(&sites.zoo, "server.1"), "a:2888:3888");
        assert_eq!(text(&sites.zoo, "server.3"), "c:2888:3888");
        assert!(sites.zoo.get("server.4").is_none());
        assert_eq!(text(&sites.zoo, "dataDir"), "/HA/data/zookeeper");
    }

    #[test]
    fn single_host_cluster_has_no_standby() {
        let topo = ClusterTopology::builder()
            .assign(HostRole::Coordinator, "solo")
            .build()
            .unwrap();
        let sites = SiteProperties::derive(&topo, &Settings::default());
        assert_eq!(text(&sites.hdfs, "dfs.ha.namenodes.hafab"), "nn1");
        assert_eq!(text(&sites.yarn, "yarn.resourcemanager.ha.enabled"), "false");
        assert!(sites.mapred.get("mapreduce.jobtracker.address").is_none());
    }

    #[test]
    fn job_addresses_use_configured_ports() {
        let sites = SiteProperties::derive(&topology(), &Settings::default());
        assert_eq!(text(&sites.mapred, "mapreduce.jobtracker.address"), "b:8021");
        assert_eq!(text(&sites.mapred, "mapreduce.jobhistory.address"), "b:10020");
    }

    #[test]
    fn overrides_win_over_derived_values() {
        let mut settings = Settings::default();
        settings.overrides.yarn.set("yarn.nodemanager.resource.memory-mb", 8192_i64);
        settings.overrides.env.set("EXTRA", "1");
        let sites = SiteProperties::derive(&topology(), &settings);
        assert_eq!(
            sites.yarn.get("yarn.nodemanager.resource.memory-mb"),
            Some(&PropertyValue::Int(8192))
        );
        assert_eq!(text(&sites.env, "EXTRA"), "1");
    }

    #[test]
    fn environment_is_fully_expanded() {
        let sites = SiteProperties::derive(&topology(), &Settings::default());
        assert_eq!(
            text(&sites.env, "HADOOP_CONF_DIR"),
            "/home/ubuntu/Programs/hadoop-2.8.5/etc/hadoop"
        );
        assert_eq!(text(&sites.env, "YARN_PID_DIR"), "/tmp/hadoop_2.8.5");
        assert!(text(&sites.env, "PATH").ends_with("/hadoop-2.8.5/sbin:$PATH"));
    }

    #[test]
    fn aws_credentials_do_not_replace_user_values() {
        let mut settings = Settings::default();
        settings.overrides.core.set("fs.s3n.awsAccessKeyId", "mine");
        let sites = SiteProperties::derive(&topology(), &settings).with_aws_credentials("env-id", "env-secret");
        assert_eq!(text(&sites.core, "fs.s3n.awsAccessKeyId"), "mine");
        assert_eq!(text(&sites.core, "fs.s3n.awsSecretAccessKey"), "env-secret");
    }

    #[test]
    fn file_classes_map_to_formats_and_policies() {
        let settings = Settings::default();
        assert_eq!(SiteFile::Zoo.format(), LineFormat::KeyValue);
        assert_eq!(SiteFile::Env.format(), LineFormat::Export);
        assert_eq!(SiteFile::Core.policy(&settings), MergePolicy::Clean);
        assert_eq!(SiteFile::Env.policy(&settings), MergePolicy::Merge);
        assert_eq!(
            SiteFile::Hdfs.path(&settings),
            "/home/ubuntu/Programs/hadoop-2.8.5/etc/hadoop/hdfs-site.xml"
        );
    }
}
