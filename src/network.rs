//! Supported settlement networks and their CAIP-2 identifiers.
//!
//! The gateway quotes and settles on a single EVM network chosen at startup
//! via `BASE_NETWORK`. Payment requirements carry the network as a CAIP-2
//! chain id of the form `eip155:<chain-id>`.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt;
use std::str::FromStr;

/// Networks the gateway knows how to quote payments on.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    /// Base Sepolia testnet (chain ID 84532).
    #[serde(rename = "base-sepolia")]
    BaseSepolia,
    /// Base mainnet (chain ID 8453).
    #[serde(rename = "base")]
    Base,
    /// XDC mainnet (chain ID 50).
    #[serde(rename = "xdc")]
    XdcMainnet,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::BaseSepolia => write!(f, "base-sepolia"),
            Network::Base => write!(f, "base"),
            Network::XdcMainnet => write!(f, "xdc"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown network name {0:?}")]
pub struct UnknownNetworkError(pub String);

impl FromStr for Network {
    type Err = UnknownNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base-sepolia" => Ok(Network::BaseSepolia),
            "base" => Ok(Network::Base),
            "xdc" => Ok(Network::XdcMainnet),
            other => Err(UnknownNetworkError(other.to_string())),
        }
    }
}

impl Network {
    /// Numeric EIP-155 chain id of the network.
    pub fn chain_id(&self) -> u64 {
        match self {
            Network::BaseSepolia => 84532,
            Network::Base => 8453,
            Network::XdcMainnet => 50,
        }
    }

    /// CAIP-2 identifier, e.g. `eip155:84532`.
    pub fn caip2(&self) -> ChainId {
        ChainId::eip155(self.chain_id())
    }

    /// All known [`Network`] variants.
    pub fn variants() -> &'static [Network] {
        &[Network::BaseSepolia, Network::Base, Network::XdcMainnet]
    }
}

/// A CAIP-2 chain identifier: `<namespace>:<reference>`.
///
/// Serialized as the joined string form; the gateway only mints `eip155`
/// identifiers but accepts any well-formed pair when deserializing
/// facilitator responses.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChainId {
    pub namespace: String,
    pub reference: String,
}

impl ChainId {
    pub fn eip155(chain_id: u64) -> Self {
        Self {
            namespace: "eip155".to_string(),
            reference: chain_id.to_string(),
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.reference)
    }
}

impl fmt::Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid chain id format {0:?}, expected namespace:reference")]
pub struct ChainIdError(pub String);

impl FromStr for ChainId {
    type Err = ChainIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((namespace, reference)) if !namespace.is_empty() && !reference.is_empty() => {
                Ok(ChainId {
                    namespace: namespace.to_string(),
                    reference: reference.to_string(),
                })
            }
            _ => Err(ChainIdError(s.to_string())),
        }
    }
}

impl Serialize for ChainId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChainId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ChainId::from_str(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_maps_to_caip2() {
        assert_eq!(Network::BaseSepolia.caip2().to_string(), "eip155:84532");
        assert_eq!(Network::Base.caip2().to_string(), "eip155:8453");
    }

    #[test]
    fn network_parses_by_name() {
        assert_eq!("base".parse::<Network>().unwrap(), Network::Base);
        assert!("mainnet".parse::<Network>().is_err());
    }

    #[test]
    fn chain_id_round_trips_through_serde() {
        let chain: ChainId = serde_json::from_str("\"eip155:84532\"").unwrap();
        assert_eq!(chain, ChainId::eip155(84532));
        assert_eq!(serde_json::to_string(&chain).unwrap(), "\"eip155:84532\"");
    }

    #[test]
    fn chain_id_rejects_bare_names() {
        assert!("base".parse::<ChainId>().is_err());
        assert!(":84532".parse::<ChainId>().is_err());
    }
}
