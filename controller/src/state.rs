// controller/src/state.rs

use anyhow::{bail, Result};
use common::settings::Settings;
use common::{ClusterTopology, ConfigWriter, Host, RemoteShell, SyncGate};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::sites::SiteProperties;

/// Todo lo que comparte una ejecución. Se construye una vez; lo único
/// mutable es lo que los pasos van recogiendo de los hosts.
pub struct Session {
    pub shell: Arc<dyn RemoteShell>,
    pub topology: Arc<ClusterTopology>,
    pub settings: Arc<Settings>,
    pub sites: Arc<SiteProperties>,
    pub gate: Arc<SyncGate>,
    pub writer: Arc<ConfigWriter>,
    /// Script local que carga el fichero de entorno antes de un comando.
    pub env_wrapper: PathBuf,
    targets: Vec<Host>,
    collected: Mutex<Collected>,
}

#[derive(Debug, Default)]
struct Collected {
    private_addresses: BTreeMap<Host, String>,
    public_keys: BTreeMap<Host, String>,
}

impl Session {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        topology: Arc<ClusterTopology>,
        settings: Arc<Settings>,
        sites: SiteProperties,
        helper: PathBuf,
        env_wrapper: PathBuf,
    ) -> Self {
        let gate = Arc::new(SyncGate::new());
        let writer = Arc::new(ConfigWriter::new(
            gate.clone(),
            helper,
            settings.paths.helper_dir.clone(),
        ));
        Self {
            shell,
            targets: topology.hosts().to_vec(),
            topology,
            settings,
            sites: Arc::new(sites),
            gate,
            writer,
            env_wrapper,
            collected: Mutex::new(Collected::default()),
        }
    }

    /// Limita los pasos `All`/`Parallel` a un subconjunto de hosts. Los
    /// pasos `Once` no se ven afectados.
    pub fn restrict_to(mut self, subset: &[String]) -> Result<Self> {
        if subset.is_empty() {
            return Ok(self);
        }
        for h in subset {
            if !self.topology.hosts().contains(h) {
                warn!("{} no pertenece al cluster, se ignora", h);
            }
        }
        self.targets.retain(|h| subset.contains(h));
        if self.targets.is_empty() {
            bail!("ningún host de --hosts pertenece al cluster");
        }
        Ok(self)
    }

    pub fn targets(&self) -> &[Host] {
        &self.targets
    }

    pub fn record_private_address(&self, host: &str, addr: &str) {
        if let Ok(mut c) = self.collected.lock() {
            c.private_addresses.insert(host.to_string(), addr.to_string());
        }
    }

    /// Direcciones privadas conocidas: las del inventario y las sondeadas.
    pub fn private_addresses(&self) -> BTreeMap<Host, String> {
        let mut all = self.topology.private_addresses().clone();
        if let Ok(c) = self.collected.lock() {
            all.extend(c.private_addresses.iter().map(|(h, a)| (h.clone(), a.clone())));
        }
        all
    }

    pub fn record_public_key(&self, host: &str, key: &str) {
        if let Ok(mut c) = self.collected.lock() {
            c.public_keys.insert(host.to_string(), key.to_string());
        }
    }

    pub fn public_keys(&self) -> BTreeMap<Host, String> {
        self.collected
            .lock()
            .map(|c| c.public_keys.clone())
            .unwrap_or_default()
    }
}
