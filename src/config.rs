use ethers::types::{Address, U256};
use eyre::{ensure, eyre, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Per-container configuration. Runtime management fields (`image`, `env`,
/// `command`, `volumes`, `gpu`) are passed through to the container runtime
/// collaborator; the node itself only needs ids, ports, auth and policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    pub id: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// External URL for containers the node does not manage; overrides
    /// host/port resolution entirely.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub bearer: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub gpu: bool,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub allowed_addresses: Vec<Address>,
    #[serde(default)]
    pub allowed_delegate_addresses: Vec<Address>,
    /// token address -> minimum payment in base units. Empty means the
    /// container accepts any job, paid or not.
    #[serde(default)]
    pub accepted_payments: HashMap<Address, U256>,
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub generates_proofs: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletConfig {
    /// Hex private key. Prefer leaving this unset and exporting
    /// `INFERNET_PRIVATE_KEY` instead of committing keys to config files.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default = "default_max_gas_limit")]
    pub max_gas_limit: u64,
    /// Escrow wallet receiving payments; distinct from the signing key.
    #[serde(default)]
    pub payment_address: Option<Address>,
    /// Revert-message substrings tolerated during delivery simulation (gas
    /// estimation falls back to `max_gas_limit`).
    #[serde(default)]
    pub allowed_sim_errors: Vec<String>,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            max_gas_limit: default_max_gas_limit(),
            payment_address: None,
            allowed_sim_errors: Vec::new(),
        }
    }
}

fn default_max_gas_limit() -> u64 {
    5_000_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSyncConfig {
    /// Seconds between batch reads, and the seed for per-batch retry backoff.
    #[serde(default = "default_sync_sleep")]
    pub sleep: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// First subscription id to sync from; earlier ids are never read.
    #[serde(default)]
    pub starting_sub_id: u32,
    /// Seconds between head-follower ticks.
    #[serde(default = "default_sync_period")]
    pub sync_period: f64,
}

impl Default for SnapshotSyncConfig {
    fn default() -> Self {
        Self {
            sleep: default_sync_sleep(),
            batch_size: default_batch_size(),
            starting_sub_id: 0,
            sync_period: default_sync_period(),
        }
    }
}

fn default_sync_sleep() -> f64 {
    1.0
}

fn default_batch_size() -> u32 {
    200
}

fn default_sync_period() -> f64 {
    0.5
}

impl SnapshotSyncConfig {
    pub fn sleep_duration(&self) -> Duration {
        Duration::from_secs_f64(self.sleep.max(0.0))
    }

    pub fn sync_period_duration(&self) -> Duration {
        Duration::from_secs_f64(self.sync_period.max(0.0))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rpc_url: Option<String>,
    /// Optional guard against pointing a config at the wrong network.
    #[serde(default)]
    pub chain_id: Option<u64>,
    /// Blocks to trail behind head; the sole reorg-safety mechanism.
    #[serde(default = "default_trail_head_blocks")]
    pub trail_head_blocks: u64,
    #[serde(default)]
    pub registry_address: Option<Address>,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub snapshot_sync: SnapshotSyncConfig,
}

fn default_trail_head_blocks() -> u64 {
    1
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rpc_url: None,
            chain_id: None,
            trail_head_blocks: default_trail_head_blocks(),
            registry_address: None,
            wallet: WalletConfig::default(),
            snapshot_sync: SnapshotSyncConfig::default(),
        }
    }
}

/// Top-level node configuration.
///
/// Intentionally loose: sections owned by collaborators (the REST server,
/// the log shipper) are ignored rather than rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub containers: Vec<ContainerConfig>,
    #[serde(default = "default_true")]
    pub manage_containers: bool,
    /// Seconds to wait after startup before serving work, giving managed
    /// containers time to come up.
    #[serde(default)]
    pub startup_wait: Option<f64>,
    #[serde(default = "default_true")]
    pub forward_stats: bool,
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| eyre!("failed to read config file {}: {e}", path.display()))?;
        let cfg: Config = serde_json::from_str(&raw)
            .map_err(|e| eyre!("failed to parse config file {}: {e}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Startup-fatal checks. Anything that passes here is safe to run with.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for container in &self.containers {
            ensure!(!container.id.is_empty(), "container with empty id");
            ensure!(
                seen.insert(container.id.as_str()),
                "duplicate container id '{}'",
                container.id
            );
            if self.manage_containers && !container.external {
                ensure!(
                    container.image.is_some(),
                    "manageContainers is on but container '{}' has no image",
                    container.id
                );
            }
        }

        if self.chain.enabled {
            ensure!(
                self.chain.rpc_url.is_some(),
                "chain.enabled requires chain.rpcUrl"
            );
            ensure!(
                self.chain.registry_address.is_some(),
                "chain.enabled requires chain.registryAddress"
            );
            ensure!(
                self.chain.snapshot_sync.batch_size > 0,
                "chain.snapshotSync.batchSize must be > 0"
            );
        }

        Ok(())
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.containers.iter().map(|c| c.id.clone()).collect()
    }

    pub fn container(&self, id: &str) -> Option<&ContainerConfig> {
        self.containers.iter().find(|c| c.id == id)
    }

    /// Resolves the signing key: explicit config value first, then the
    /// `INFERNET_PRIVATE_KEY` environment variable.
    pub fn resolve_private_key(&self) -> Result<String> {
        if let Some(pk) = &self.chain.wallet.private_key {
            if !pk.trim().is_empty() {
                return Ok(pk.trim().to_string());
            }
        }
        std::env::var("INFERNET_PRIVATE_KEY").map_err(|_| {
            eyre!("no private key: set chain.wallet.privateKey or export INFERNET_PRIVATE_KEY")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_config() -> serde_json::Value {
        json!({
            "chain": {
                "enabled": true,
                "rpcUrl": "http://localhost:8545",
                "trailHeadBlocks": 2,
                "registryAddress": "0x0000000000000000000000000000000000000011",
                "wallet": {
                    "privateKey": "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
                    "maxGasLimit": 4000000,
                    "allowedSimErrors": ["out of gas"]
                },
                "snapshotSync": { "sleep": 1.5, "batchSize": 100, "startingSubId": 5, "syncPeriod": 2.0 }
            },
            "containers": [
                { "id": "echo", "image": "example/echo:latest", "port": 3000 }
            ],
            "manageContainers": true,
            "startupWait": 1.0,
            "forwardStats": true
        })
    }

    #[test]
    fn parses_full_config() {
        let cfg: Config = serde_json::from_value(base_config()).unwrap();
        cfg.validate().unwrap();
        assert!(cfg.chain.enabled);
        assert_eq!(cfg.chain.trail_head_blocks, 2);
        assert_eq!(cfg.chain.snapshot_sync.batch_size, 100);
        assert_eq!(cfg.chain.snapshot_sync.starting_sub_id, 5);
        assert_eq!(cfg.chain.wallet.max_gas_limit, 4_000_000);
        assert_eq!(cfg.containers.len(), 1);
        assert_eq!(cfg.container_ids(), vec!["echo".to_string()]);
    }

    #[test]
    fn chain_enabled_requires_rpc_and_registry() {
        let mut raw = base_config();
        raw["chain"]["rpcUrl"] = json!(null);
        let cfg: Config = serde_json::from_value(raw).unwrap();
        assert!(cfg.validate().is_err());

        let mut raw = base_config();
        raw["chain"]["registryAddress"] = json!(null);
        let cfg: Config = serde_json::from_value(raw).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn managed_container_requires_image() {
        let mut raw = base_config();
        raw["containers"][0]["image"] = json!(null);
        let cfg: Config = serde_json::from_value(raw).unwrap();
        assert!(cfg.validate().is_err());

        // external containers are exempt
        let mut raw = base_config();
        raw["containers"][0]["image"] = json!(null);
        raw["containers"][0]["external"] = json!(true);
        raw["containers"][0]["url"] = json!("https://example.com/echo");
        let cfg: Config = serde_json::from_value(raw).unwrap();
        cfg.validate().unwrap();
    }

    #[test]
    fn duplicate_container_ids_rejected() {
        let mut raw = base_config();
        raw["containers"]
            .as_array_mut()
            .unwrap()
            .push(json!({ "id": "echo", "image": "example/echo:2" }));
        let cfg: Config = serde_json::from_value(raw).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn defaults_apply_when_sections_missing() {
        let cfg: Config = serde_json::from_value(json!({})).unwrap();
        cfg.validate().unwrap();
        assert!(!cfg.chain.enabled);
        assert_eq!(cfg.chain.snapshot_sync.batch_size, 200);
        assert!(cfg.manage_containers);
        assert!(cfg.forward_stats);
    }
}
