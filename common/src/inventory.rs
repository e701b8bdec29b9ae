//! Resolución del inventario de hosts: desde la configuración estática o
//! consultando las instancias etiquetadas de un proveedor cloud.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

use crate::settings::Settings;
use crate::topology::{ClusterTopology, HostRole, TopologyError};

/// Etiquetas que marcan al coordinador.
const COORDINATOR_TAGS: [&str; 3] = ["coordinator", "namenode", "resourcemanager"];
const PRIMARY_WORKER_TAG: &str = "standby";
const SECONDARY_WORKER_TAG: &str = "quorum";
const HISTORY_TAG: &str = "jobhistory";
const CLUSTER_TAG_KEY: &str = "Cluster";

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("no hay coordinador configurado en [hosts]")]
    MissingCoordinator,
    #[error("ninguna instancia con la etiqueta Cluster={0}")]
    NoInstances(String),
    #[error("consulta de inventario fallida: {0}")]
    Query(String),
    #[error("respuesta de inventario ilegible: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Topología a partir de `[hosts]`. Duplicados fuera, orden de primera
/// aparición.
pub fn resolve_static(settings: &Settings) -> Result<ClusterTopology, InventoryError> {
    let hosts = &settings.hosts;
    let coordinator = hosts
        .coordinator
        .as_deref()
        .filter(|h| !h.trim().is_empty())
        .ok_or(InventoryError::MissingCoordinator)?;

    let workers: Vec<&str> = hosts
        .workers
        .iter()
        .map(|w| w.as_str())
        .filter(|w| !w.trim().is_empty())
        .collect();

    let (default_primary, default_secondary) = standby_defaults(coordinator, &workers);
    let primary = hosts.primary_worker.as_deref().or(default_primary);
    let secondary = hosts
        .secondary_worker
        .as_deref()
        .or_else(|| default_secondary.filter(|s| Some(*s) != primary));
    let history = hosts
        .history_server
        .as_deref()
        .or_else(|| workers.first().copied())
        .unwrap_or(coordinator);

    let mut builder = ClusterTopology::builder()
        .assign(HostRole::Coordinator, coordinator)
        .assign(HostRole::HistoryServer, history)
        .assign_all(HostRole::Worker, workers.iter().copied());
    if let Some(p) = primary {
        builder = builder.assign(HostRole::PrimaryWorker, p);
    }
    if let Some(s) = secondary {
        builder = builder.assign(HostRole::SecondaryWorker, s);
    }

    let topology = builder.build()?;
    info!(
        "topología estática: {} hosts, coordinador {}",
        topology.hosts().len(),
        topology.coordinator()
    );
    Ok(topology)
}

/// Workers por defecto para los roles PrimaryWorker y SecondaryWorker: el
/// primero y el segundo que no son el coordinador.
fn standby_defaults<'a, S: AsRef<str>>(
    coordinator: &str,
    workers: &'a [S],
) -> (Option<&'a str>, Option<&'a str>) {
    let mut others = workers
        .iter()
        .map(|w| w.as_ref())
        .filter(|w| *w != coordinator);
    let primary = others.next();
    let secondary = others.find(|w| Some(*w) != primary);
    (primary, secondary)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudInstance {
    pub id: String,
    pub public_address: String,
    pub private_address: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl CloudInstance {
    /// Dirección con la que el controlador llega al host.
    pub fn address(&self) -> Option<&str> {
        if !self.public_address.is_empty() {
            Some(self.public_address.as_str())
        } else {
            self.private_address.as_deref()
        }
    }

    pub fn has_tag(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }
}

#[derive(Debug, Clone)]
pub struct CloudQuery {
    pub region: String,
    pub cluster_tag: String,
    pub coordinator_is_worker: bool,
}

impl CloudQuery {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            region: settings.ec2.region.clone(),
            cluster_tag: settings.cloud_cluster_tag().to_string(),
            coordinator_is_worker: settings.ec2.coordinator_is_worker,
        }
    }
}

#[async_trait]
pub trait CloudInventory: Send + Sync {
    async fn instances(&self, query: &CloudQuery) -> Result<Vec<CloudInstance>, InventoryError>;
}

/// Topología a partir de las etiquetas de las instancias.
pub async fn resolve_from_cloud(
    provider: &dyn CloudInventory,
    query: &CloudQuery,
) -> Result<ClusterTopology, InventoryError> {
    let instances: Vec<CloudInstance> = provider
        .instances(query)
        .await?
        .into_iter()
        .filter(|i| i.tags.get(CLUSTER_TAG_KEY).map(|v| v.as_str()) == Some(query.cluster_tag.as_str()))
        .filter(|i| i.address().is_some())
        .collect();

    if instances.is_empty() {
        return Err(InventoryError::NoInstances(query.cluster_tag.clone()));
    }

    let tagged = |tags: &[&str]| -> Option<String> {
        instances
            .iter()
            .find(|i| tags.iter().any(|t| i.has_tag(t)))
            .and_then(|i| i.address())
            .map(|a| a.to_string())
    };

    let mut coordinator = tagged(&COORDINATOR_TAGS);
    let mut workers: Vec<String> = instances
        .iter()
        .filter_map(|i| i.address())
        .filter(|a| query.coordinator_is_worker || coordinator.as_deref() != Some(*a))
        .map(|a| a.to_string())
        .collect();

    if coordinator.is_none() {
        // sin etiqueta: el primer worker asciende a coordinador y, si no
        // debe ser worker, se quita de la lista por posición
        let promoted = workers.first().cloned().ok_or_else(|| {
            InventoryError::NoInstances(query.cluster_tag.clone())
        })?;
        warn!("ninguna instancia etiquetada como coordinador, uso {}", promoted);
        if !query.coordinator_is_worker {
            workers.remove(0);
        }
        coordinator = Some(promoted);
    }
    let coordinator = coordinator.unwrap_or_default();

    let (default_primary, default_secondary) = standby_defaults(&coordinator, &workers);
    let primary = tagged(&[PRIMARY_WORKER_TAG]).or_else(|| default_primary.map(str::to_string));
    let secondary = tagged(&[SECONDARY_WORKER_TAG]).or_else(|| {
        default_secondary
            .filter(|s| primary.as_deref() != Some(*s))
            .map(str::to_string)
    });
    let history = tagged(&[HISTORY_TAG])
        .or_else(|| workers.first().cloned())
        .unwrap_or_else(|| coordinator.clone());

    let mut builder = ClusterTopology::builder()
        .assign(HostRole::Coordinator, coordinator.clone())
        .assign(HostRole::HistoryServer, history)
        .assign_all(HostRole::Worker, workers.iter().cloned());
    if let Some(p) = primary {
        builder = builder.assign(HostRole::PrimaryWorker, p);
    }
    if let Some(s) = secondary {
        builder = builder.assign(HostRole::SecondaryWorker, s);
    }
    for inst in &instances {
        if let (Some(addr), Some(private)) = (inst.address(), inst.private_address.as_deref()) {
            builder = builder.private_address(addr, private);
        }
    }

    let topology = builder.build()?;
    info!(
        "topología cloud (Cluster={}): {} hosts, coordinador {}",
        query.cluster_tag,
        topology.hosts().len(),
        coordinator
    );
    Ok(topology)
}

/// Inventario EC2 vía `aws ec2 describe-instances`.
#[derive(Debug, Clone, Default)]
pub struct AwsCliInventory {
    pub program: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Instance {
    instance_id: String,
    #[serde(default)]
    public_dns_name: Option<String>,
    #[serde(default)]
    public_ip_address: Option<String>,
    #[serde(default)]
    private_ip_address: Option<String>,
    #[serde(default)]
    tags: Vec<Ec2Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Tag {
    key: String,
    #[serde(default)]
    value: String,
}

pub fn parse_describe_instances(raw: &str) -> Result<Vec<CloudInstance>, InventoryError> {
    let parsed: DescribeInstances = serde_json::from_str(raw)?;
    Ok(parsed
        .reservations
        .into_iter()
        .flat_map(|r| r.instances)
        .map(|i| {
            let public = i
                .public_dns_name
                .filter(|d| !d.is_empty())
                .or(i.public_ip_address)
                .unwrap_or_default();
            CloudInstance {
                id: i.instance_id,
                public_address: public,
                private_address: i.private_ip_address,
                tags: i.tags.into_iter().map(|t| (t.key, t.value)).collect(),
            }
        })
        .collect())
}

#[async_trait]
impl CloudInventory for AwsCliInventory {
    async fn instances(&self, query: &CloudQuery) -> Result<Vec<CloudInstance>, InventoryError> {
        let program = self.program.clone().unwrap_or_else(|| "aws".to_string());
        let tag_filter = format!("Name=tag:{},Values={}", CLUSTER_TAG_KEY, query.cluster_tag);
        let output = Command::new(&program)
            .args([
                "ec2",
                "describe-instances",
                "--region",
                query.region.as_str(),
                "--filters",
                tag_filter.as_str(),
                "Name=instance-state-name,Values=running",
                "--output",
                "json",
            ])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| InventoryError::Query(format!("no se pudo lanzar {}: {}", program, e)))?;

        if !output.status.success() {
            return Err(InventoryError::Query(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        parse_describe_instances(&String::from_utf8_lossy(&output.stdout))
    }
}
