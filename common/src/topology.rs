use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

pub type Host = String;

/// Papel de un host dentro del cluster. Un host puede tener varios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostRole {
    /// Naming service activo, primer resource manager, zkfc y miembro 1 del quorum.
    Coordinator,
    /// Worker que además aloja el naming service standby, el segundo
    /// resource manager, el segundo zkfc y el miembro 2 del quorum.
    PrimaryWorker,
    /// Worker que es el miembro 3 del quorum de coordinación.
    SecondaryWorker,
    /// Daemons de almacenamiento y cómputo.
    Worker,
    HistoryServer,
}

impl HostRole {
    pub const ALL: [HostRole; 5] = [
        HostRole::Coordinator,
        HostRole::PrimaryWorker,
        HostRole::SecondaryWorker,
        HostRole::Worker,
        HostRole::HistoryServer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HostRole::Coordinator => "coordinator",
            HostRole::PrimaryWorker => "primary_worker",
            HostRole::SecondaryWorker => "secondary_worker",
            HostRole::Worker => "worker",
            HostRole::HistoryServer => "history_server",
        }
    }
}

impl fmt::Display for HostRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topología resuelta para una sesión. Se construye una vez y no se modifica.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterTopology {
    hosts: Vec<Host>,
    roles: BTreeMap<HostRole, Vec<Host>>,
    private_addresses: BTreeMap<Host, String>,
}

impl ClusterTopology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    /// Todos los hosts, sin duplicados, en orden de primera aparición.
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn has_role(&self, host: &str, role: HostRole) -> bool {
        self.roles
            .get(&role)
            .map(|hs| hs.iter().any(|h| h == host))
            .unwrap_or(false)
    }

    pub fn hosts_with(&self, role: HostRole) -> &[Host] {
        self.roles.get(&role).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn first_with(&self, role: HostRole) -> Option<&str> {
        self.hosts_with(role).first().map(|h| h.as_str())
    }

    pub fn roles_of(&self, host: &str) -> BTreeSet<HostRole> {
        HostRole::ALL
            .iter()
            .copied()
            .filter(|role| self.has_role(host, *role))
            .collect()
    }

    pub fn coordinator(&self) -> &str {
        // el builder garantiza que existe
        self.first_with(HostRole::Coordinator).unwrap_or_default()
    }

    /// Host del namenode y resourcemanager en espera, si hay uno distinto del
    /// coordinador.
    pub fn standby(&self) -> Option<&str> {
        self.first_with(HostRole::PrimaryWorker)
            .filter(|h| *h != self.coordinator())
    }

    /// Miembros del quorum de coordinación en orden de id (1, 2, 3...).
    pub fn quorum(&self) -> Vec<Host> {
        let mut seen = HashSet::new();
        [
            HostRole::Coordinator,
            HostRole::PrimaryWorker,
            HostRole::SecondaryWorker,
        ]
        .iter()
        .filter_map(|role| self.first_with(*role))
        .filter(|h| seen.insert(h.to_string()))
        .map(|h| h.to_string())
        .collect()
    }

    pub fn private_address(&self, host: &str) -> Option<&str> {
        self.private_addresses.get(host).map(|s| s.as_str())
    }

    pub fn private_addresses(&self) -> &BTreeMap<Host, String> {
        &self.private_addresses
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("la topología no tiene hosts")]
    NoHosts,
    #[error("ningún host tiene el rol coordinator")]
    NoCoordinator,
}

#[derive(Debug, Default)]
pub struct TopologyBuilder {
    order: Vec<Host>,
    roles: BTreeMap<HostRole, Vec<Host>>,
    private_addresses: BTreeMap<Host, String>,
}

impl TopologyBuilder {
    pub fn assign(mut self, role: HostRole, host: impl Into<String>) -> Self {
        let host = host.into();
        if host.trim().is_empty() {
            return self;
        }
        self.order.push(host.clone());
        let holders = self.roles.entry(role).or_default();
        if !holders.contains(&host) {
            holders.push(host);
        }
        self
    }

    pub fn assign_all<I, S>(mut self, role: HostRole, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for h in hosts {
            self = self.assign(role, h);
        }
        self
    }

    pub fn private_address(mut self, host: impl Into<String>, addr: impl Into<String>) -> Self {
        self.private_addresses.insert(host.into(), addr.into());
        self
    }

    pub fn build(self) -> Result<ClusterTopology, TopologyError> {
        let mut seen = HashSet::new();
        let hosts: Vec<Host> = self
            .order
            .into_iter()
            .filter(|h| seen.insert(h.clone()))
            .collect();

        if hosts.is_empty() {
            return Err(TopologyError::NoHosts);
        }
        if self
            .roles
            .get(&HostRole::Coordinator)
            .map(|v| v.is_empty())
            .unwrap_or(true)
        {
            return Err(TopologyError::NoCoordinator);
        }

        Ok(ClusterTopology {
            hosts,
            roles: self.roles,
            private_addresses: self.private_addresses,
        })
    }
}
