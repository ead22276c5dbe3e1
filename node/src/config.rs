use common::policy::{BootstrapPolicy, LocationPolicy, SelectionPolicy, TransferPolicy};
use common::{NodeError, NodeId, NodeResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 60001;

/// Par del cluster: id y dirección `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    pub addr: String,
}

impl FromStr for PeerConfig {
    type Err = NodeError;

    /// Formato "id:host:port".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || NodeError::Config(format!("par inválido '{}' (se espera id:host:port)", s));
        let (id, addr) = s.trim().split_once(':').ok_or_else(bad)?;
        let id = id.parse::<u32>().map_err(|_| bad())?;
        let (host, port) = addr.rsplit_once(':').ok_or_else(bad)?;
        if host.is_empty() || port.parse::<u16>().map(|p| p == 0).unwrap_or(true) {
            return Err(bad());
        }
        Ok(PeerConfig {
            id: NodeId(id),
            addr: addr.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub port: u16,
    pub peers: Vec<PeerConfig>,
    /// Por defecto `/tmp/node<id>`.
    pub fs_root_dir: Option<PathBuf>,
    pub te_num_threads: usize,
    pub te_throttle: f64,
    pub te_status_update_interval_ms: u64,
    pub lb_status_update_interval_ms: u64,
    pub lb_migration_cancel_timeout_ms: u64,
    pub lb_bootstrap_policy: BootstrapPolicy,
    pub lb_transfer_policy: TransferPolicy,
    pub lb_location_policy: LocationPolicy,
    pub lb_selection_policy: SelectionPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(1),
            port: DEFAULT_PORT,
            peers: Vec::new(),
            fs_root_dir: None,
            te_num_threads: 1,
            te_throttle: 0.0,
            te_status_update_interval_ms: 5000,
            lb_status_update_interval_ms: 5000,
            lb_migration_cancel_timeout_ms: 1000,
            lb_bootstrap_policy: BootstrapPolicy::default(),
            lb_transfer_policy: TransferPolicy::default(),
            lb_location_policy: LocationPolicy::default(),
            lb_selection_policy: SelectionPolicy::default(),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> NodeResult<T>
where
    T: FromStr,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| NodeError::Config(format!("{} inválido: {}", key, raw))),
        _ => Ok(default),
    }
}

fn parse_peers(raw: &str) -> NodeResult<Vec<PeerConfig>> {
    raw.split_whitespace().map(str::parse).collect()
}

impl NodeConfig {
    /// Lee la configuración de variables de entorno.
    pub fn from_env() -> NodeResult<Self> {
        let d = NodeConfig::default();
        let config = NodeConfig {
            node_id: NodeId(env_or("NODE_ID", d.node_id.0)?),
            port: env_or("NODE_PORT", d.port)?,
            peers: parse_peers(&env::var("NODE_PEERS").unwrap_or_default())?,
            fs_root_dir: env::var("FS_ROOT_DIR").ok().map(PathBuf::from),
            te_num_threads: env_or("TE_NUM_THREADS", d.te_num_threads)?,
            te_throttle: env_or("TE_THROTTLE", d.te_throttle)?,
            te_status_update_interval_ms: env_or(
                "TE_STATUS_UPDATE_INTERVAL_MS",
                d.te_status_update_interval_ms,
            )?,
            lb_status_update_interval_ms: env_or(
                "LB_STATUS_UPDATE_INTERVAL_MS",
                d.lb_status_update_interval_ms,
            )?,
            lb_migration_cancel_timeout_ms: env_or(
                "LB_MIGRATION_CANCEL_TIMEOUT_MS",
                d.lb_migration_cancel_timeout_ms,
            )?,
            lb_bootstrap_policy: env_or("LB_BOOTSTRAP_POLICY", d.lb_bootstrap_policy)?,
            lb_transfer_policy: env_or("LB_TRANSFER_POLICY", d.lb_transfer_policy)?,
            lb_location_policy: env_or("LB_LOCATION_POLICY", d.lb_location_policy)?,
            lb_selection_policy: env_or("LB_SELECTION_POLICY", d.lb_selection_policy)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Lee un archivo JSON; las claves ausentes toman el valor por defecto.
    pub fn from_file(path: &Path) -> NodeResult<Self> {
        let raw = std::fs::read(path)?;
        let config: NodeConfig = serde_json::from_slice(&raw)
            .map_err(|e| NodeError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NodeResult<()> {
        if self.node_id.0 == 0 {
            return Err(NodeError::Config("NODE_ID debe ser positivo".into()));
        }
        if self.port == 0 {
            return Err(NodeError::Config("NODE_PORT fuera de rango".into()));
        }
        if !(0.0..=100.0).contains(&self.te_throttle) {
            return Err(NodeError::Config(format!(
                "TE_THROTTLE fuera de [0,100]: {}",
                self.te_throttle
            )));
        }
        if self.te_num_threads == 0 {
            return Err(NodeError::Config("TE_NUM_THREADS debe ser >= 1".into()));
        }
        for (i, peer) in self.peers.iter().enumerate() {
            if peer.id.0 == 0 {
                return Err(NodeError::Config(format!("id de par inválido: {}", peer.id)));
            }
            if peer.id == self.node_id {
                return Err(NodeError::Config(format!(
                    "el nodo {} figura como su propio par",
                    peer.id
                )));
            }
            if self.peers[..i].iter().any(|p| p.id == peer.id) {
                return Err(NodeError::Config(format!("par duplicado: {}", peer.id)));
            }
        }
        Ok(())
    }

    pub fn root_dir(&self) -> PathBuf {
        self.fs_root_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/tmp/node{}", self.node_id.0)))
    }

    /// Ids de todo el cluster, incluido este nodo, en orden.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers.iter().map(|p| p.id).collect();
        ids.push(self.node_id);
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn te_status_update_interval(&self) -> Duration {
        Duration::from_millis(self.te_status_update_interval_ms.max(1))
    }

    pub fn lb_status_update_interval(&self) -> Duration {
        Duration::from_millis(self.lb_status_update_interval_ms.max(1))
    }

    pub fn lb_migration_cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.lb_migration_cancel_timeout_ms)
    }
}
