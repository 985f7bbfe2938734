//! Gateway configuration.
//!
//! Two layers: environment variables read once at startup (fatal when the
//! pay-to address is missing), and a JSON config document persisted by the
//! admin surface (API key, agent blocklist, route groups) merged over
//! defaults and rewritten atomically.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::network::Network;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("PAY_TO_ADDRESS is required")]
    MissingPayTo,
    #[error("invalid PAY_TO_ADDRESS: {0}")]
    InvalidPayTo(String),
    #[error("invalid {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    FileParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

mod config_defaults {
    use std::time::Duration;

    pub const DEFAULT_PORT: u16 = 4402;
    pub const DEFAULT_FACILITATOR_URL: &str = "https://x402.org/facilitator";
    pub const DEFAULT_ROUTES_FILE: &str = "routes.json";
    pub const DEFAULT_CONFIG_FILE: &str = "tollgate.config.json";
    pub const DEFAULT_REPLAY_TTL: Duration = Duration::from_millis(300_000);
}

/// Optional anchor-writer wiring, present only when all three env vars are.
#[derive(Debug, Clone)]
pub struct AnchorConfig {
    pub rpc_url: Url,
    pub private_key: String,
    pub contract: Address,
}

/// Facilitator API key pair for bearer-token minting.
#[derive(Debug, Clone)]
pub struct FacilitatorKey {
    pub key_id: String,
    pub secret: String,
}

/// Environment-derived gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub pay_to: Address,
    pub port: u16,
    pub facilitator_url: String,
    pub network: Network,
    pub admin_key: Option<String>,
    pub routes_file: PathBuf,
    pub config_file: PathBuf,
    pub replay_ttl: Duration,
    pub facilitator_key: Option<FacilitatorKey>,
    pub anchor: Option<AnchorConfig>,
}

impl GatewayConfig {
    /// Read configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let pay_to_raw = std::env::var("PAY_TO_ADDRESS").map_err(|_| ConfigError::MissingPayTo)?;
        let pay_to =
            Address::from_str(&pay_to_raw).map_err(|_| ConfigError::InvalidPayTo(pay_to_raw))?;

        let port = match std::env::var("PORT") {
            Ok(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                name: "PORT",
                value,
            })?,
            Err(_) => config_defaults::DEFAULT_PORT,
        };

        let network = match std::env::var("BASE_NETWORK") {
            Ok(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                name: "BASE_NETWORK",
                value,
            })?,
            Err(_) => Network::BaseSepolia,
        };

        let replay_ttl = match std::env::var("REPLAY_TTL_MS") {
            Ok(value) => Duration::from_millis(value.parse().map_err(|_| {
                ConfigError::InvalidValue {
                    name: "REPLAY_TTL_MS",
                    value,
                }
            })?),
            Err(_) => config_defaults::DEFAULT_REPLAY_TTL,
        };

        let facilitator_key = match (
            std::env::var("FACILITATOR_KEY_ID"),
            std::env::var("FACILITATOR_KEY_SECRET"),
        ) {
            (Ok(key_id), Ok(secret)) => Some(FacilitatorKey { key_id, secret }),
            _ => None,
        };

        let anchor = match (
            std::env::var("ANCHOR_RPC_URL"),
            std::env::var("ANCHOR_PRIVATE_KEY"),
            std::env::var("ANCHOR_CONTRACT"),
        ) {
            (Ok(rpc), Ok(private_key), Ok(contract)) => Some(AnchorConfig {
                rpc_url: rpc.parse().map_err(|_| ConfigError::InvalidValue {
                    name: "ANCHOR_RPC_URL",
                    value: rpc,
                })?,
                private_key,
                contract: Address::from_str(&contract).map_err(|_| {
                    ConfigError::InvalidValue {
                        name: "ANCHOR_CONTRACT",
                        value: contract,
                    }
                })?,
            }),
            _ => None,
        };

        Ok(GatewayConfig {
            pay_to,
            port,
            facilitator_url: std::env::var("FACILITATOR_URL")
                .unwrap_or_else(|_| config_defaults::DEFAULT_FACILITATOR_URL.to_string()),
            network,
            admin_key: std::env::var("ADMIN_KEY").ok(),
            routes_file: std::env::var("ROUTES_FILE")
                .unwrap_or_else(|_| config_defaults::DEFAULT_ROUTES_FILE.to_string())
                .into(),
            config_file: std::env::var("CONFIG_FILE")
                .unwrap_or_else(|_| config_defaults::DEFAULT_CONFIG_FILE.to_string())
                .into(),
            replay_ttl,
            facilitator_key,
            anchor,
        })
    }
}

/// The admin-persisted configuration document, merged over defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pay_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub agent_blocklist: Vec<String>,
    pub route_groups: BTreeMap<String, String>,
}

impl ConfigDoc {
    /// Load the document; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::FileRead {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&content).map_err(|source| ConfigError::FileParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Persist atomically: write a temp sibling, then rename over the target.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_vec_pretty(self).expect("config document serializes");
        let tmp = path.with_extension("json.tmp");
        let write = |tmp: &Path| -> std::io::Result<()> {
            let mut file = fs::File::create(tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
            fs::rename(tmp, path)
        };
        write(&tmp).map_err(|source| ConfigError::FileWrite {
            path: path.to_path_buf(),
            source,
        })
    }
}
