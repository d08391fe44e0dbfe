//! Runtime configuration (spec §6 "Configuration keys"), loaded from TOML the
//! same way `game::core::config::GameConfig` is: a `Default` impl plus a
//! `::load<P: AsRef<Path>>` constructor backed by `serdeconv`.

use std::path::Path;

use ember_core::logging::LogConfig;
use serde_derive::{Deserialize, Serialize};

/// One entry of the `services` table: what to instantiate, where, and with
/// what free-form parameters (spec §6 "Per-service").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub enable_update: bool,
    #[serde(default = "default_params")]
    pub params: serde_json::Value,
}

fn default_params() -> serde_json::Value {
    serde_json::Value::Null
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_worker_num")]
    pub worker_num: u8,
    #[serde(default)]
    pub machine_id: u8,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

fn default_worker_num() -> u8 {
    1
}

impl Default for RuntimeConfig {
    fn default() -> RuntimeConfig {
        RuntimeConfig {
            worker_num: default_worker_num(),
            machine_id: 0,
            log: LogConfig::default(),
            services: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> RuntimeConfig {
        serdeconv::from_toml_file(path).expect("error loading runtime configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_one_worker_and_no_services() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.worker_num, 1);
        assert_eq!(cfg.machine_id, 0);
        assert!(cfg.services.is_empty());
    }

    #[test]
    fn service_spec_defaults_enable_update_false_and_params_null() {
        let json = serde_json::json!({"name": "echo", "source": "native:echo"});
        let spec: ServiceSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.name, "echo");
        assert!(!spec.enable_update);
        assert!(spec.params.is_null());
    }
}
