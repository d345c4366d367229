use crate::routing::address::Ipv4Cidr;
use crate::topology::compiler::{CompilerConfig, DEFAULT_ASN, ResourceWeights};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Engine-wide settings, read from a JSON file where every field is optional
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// The pool link addresses are carved from
    #[serde_as(as = "DisplayFromStr")]
    pub address_pool: Ipv4Cidr,
    /// How long a single driver call may take before it counts as failed, in milliseconds
    pub driver_call_timeout_ms: u64,
    /// The ASN given to routers that don't declare one (`null` to leave them without)
    pub default_asn: Option<u32>,
    pub resource_weights: ResourceWeights,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            address_pool: Ipv4Cidr {
                address: Ipv4Addr::new(10, 0, 0, 0),
                network_prefix: 16,
            },
            driver_call_timeout_ms: 5_000,
            default_asn: Some(DEFAULT_ASN),
            resource_weights: ResourceWeights::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at `{}`", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("invalid engine config at `{}`", path.display()))
    }

    pub fn driver_call_timeout(&self) -> Duration {
        Duration::from_millis(self.driver_call_timeout_ms)
    }

    pub fn compiler_config(&self) -> CompilerConfig {
        CompilerConfig {
            default_asn: self.default_asn,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_missing_fields_are_defaulted() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "address_pool": "172.16.0.0/12" }"#).unwrap();

        assert_eq!(config.address_pool.to_string(), "172.16.0.0/12");
        assert_eq!(config.driver_call_timeout(), Duration::from_secs(5));
        assert_eq!(config.compiler_config().default_asn, Some(65000));
        assert_eq!(config.resource_weights.router_memory_mb, 128);
    }

    #[test]
    fn test_no_default_asn() {
        let config: EngineConfig = serde_json::from_str(
            r#"{ "default_asn": null, "driver_call_timeout_ms": 250, "resource_weights": { "host_cpu": 1.0 } }"#,
        )
        .unwrap();

        assert_eq!(config.compiler_config().default_asn, None);
        assert_eq!(config.driver_call_timeout(), Duration::from_millis(250));
        assert_eq!(config.resource_weights.host_cpu, 1.0);
        assert_eq!(config.resource_weights.switch_memory_mb, 32);
    }

    #[test]
    fn test_invalid_pool() {
        let result = serde_json::from_str::<EngineConfig>(r#"{ "address_pool": "10.0.0.0/40" }"#);
        assert!(result.is_err());

        let result = serde_json::from_str::<EngineConfig>(r#"{ "pool": "10.0.0.0/8" }"#);
        assert!(result.is_err());
    }
}
