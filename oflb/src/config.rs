use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use oflb_common::ofp::OFPP_MAX;
use oflb_common::MacAddr;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize, Clone)]
pub struct Backend {
    pub id: String,
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    /// Switch port the backend's link is attached to.
    pub port: u32,
    #[serde(default = "default_weight")]
    pub weight: u16,
}

fn default_weight() -> u16 {
    1
}

/// The virtual service and the static pool behind it.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize, Clone)]
pub struct Topology {
    pub vip: Ipv4Addr,
    #[serde(alias = "lbMac")]
    pub lb_mac: MacAddr,
    pub backends: Vec<Backend>,
    #[serde(alias = "clientPorts")]
    pub client_ports: Vec<u32>,
}

impl Topology {
    pub fn validate(&self, ring_size: u32) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        if self.client_ports.is_empty() {
            return Err(ConfigError::NoClientPorts);
        }
        if self.lb_mac.is_multicast() {
            return Err(ConfigError::LbMacNotUnicast(self.lb_mac));
        }
        let mut client_ports = HashSet::new();
        for port in &self.client_ports {
            check_port(*port)?;
            if !client_ports.insert(*port) {
                return Err(ConfigError::DuplicateClientPort(*port));
            }
        }

        let mut ids = HashSet::new();
        let mut ips = HashSet::new();
        let mut macs = HashSet::new();
        let mut ports = HashSet::new();
        let mut total_weight = 0u64;
        for backend in &self.backends {
            if !ids.insert(backend.id.as_str()) {
                return Err(ConfigError::DuplicateBackendId(backend.id.clone()));
            }
            if !ips.insert(backend.ip) {
                return Err(ConfigError::DuplicateBackendIp(backend.ip));
            }
            if !macs.insert(backend.mac) {
                return Err(ConfigError::DuplicateBackendMac(backend.mac));
            }
            check_port(backend.port)?;
            if !ports.insert(backend.port) {
                return Err(ConfigError::DuplicateBackendPort(backend.port));
            }
            if client_ports.contains(&backend.port) {
                return Err(ConfigError::BackendPortIsClientPort {
                    backend: backend.id.clone(),
                    port: backend.port,
                });
            }
            if backend.ip == self.vip {
                return Err(ConfigError::VipIsBackend(self.vip));
            }
            if backend.mac == self.lb_mac {
                return Err(ConfigError::LbMacIsBackend(self.lb_mac));
            }
            if backend.weight == 0 {
                return Err(ConfigError::ZeroWeight(backend.id.clone()));
            }
            total_weight += u64::from(backend.weight);
        }
        if total_weight > u64::from(ring_size) {
            return Err(ConfigError::WeightExceedsRing {
                total: total_weight,
                ring_size,
            });
        }
        Ok(())
    }

    /// Every port the switch forwards on, client-facing first.
    pub fn all_ports(&self) -> Vec<u32> {
        self.client_ports
            .iter()
            .copied()
            .chain(self.backends.iter().map(|b| b.port))
            .collect()
    }
}

fn check_port(port: u32) -> Result<(), ConfigError> {
    if port == 0 || port > OFPP_MAX {
        return Err(ConfigError::InvalidPort(port));
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq, Deserialize, Clone)]
#[serde(default)]
pub struct ControllerSettings {
    /// Address to accept the switch's connection on.
    pub listen: String,
    /// When set, dial the switch instead of listening.
    pub connect: Option<String>,
    pub timeout_ms: u64,
    pub echo_interval_ms: u64,
    pub handshake_attempts: u32,
    pub sync_attempts: u32,
    pub reconnect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub ring_size: u32,
    pub hash_seed: u32,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        ControllerSettings {
            listen: "0.0.0.0:6653".to_string(),
            connect: None,
            timeout_ms: 10_000,
            echo_interval_ms: 5_000,
            handshake_attempts: 5,
            sync_attempts: 3,
            reconnect_attempts: 10,
            backoff_base_ms: 250,
            backoff_max_ms: 8_000,
            ring_size: 65537,
            hash_seed: 0,
        }
    }
}

impl ControllerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("timeout_ms", self.timeout_ms == 0),
            ("echo_interval_ms", self.echo_interval_ms == 0),
            ("handshake_attempts", self.handshake_attempts == 0),
            ("sync_attempts", self.sync_attempts == 0),
            ("reconnect_attempts", self.reconnect_attempts == 0),
            ("ring_size", self.ring_size == 0),
        ];
        match checks.iter().find(|(_, zero)| *zero) {
            Some((name, _)) => Err(ConfigError::ZeroSetting(*name)),
            None => Ok(()),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn echo_interval(&self) -> Duration {
        Duration::from_millis(self.echo_interval_ms)
    }

    /// Exponential backoff before retry number `attempt` (1-based), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self.backoff_base_ms.saturating_mul(1 << shift);
        Duration::from_millis(ms.min(self.backoff_max_ms))
    }
}

#[derive(Debug, PartialEq, Deserialize, Clone)]
pub struct Config {
    #[serde(flatten)]
    pub topology: Topology,
    #[serde(default)]
    pub controller: ControllerSettings,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, anyhow::Error> {
        let path = path.as_ref();
        let mut config_file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut config_contents = String::new();
        config_file.read_to_string(&mut config_contents)?;
        let config: Config = serde_yaml::from_str(&config_contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller.validate()?;
        self.topology.validate(self.controller.ring_size)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use super::*;

    pub(crate) const SAMPLE: &str = r#"
vip: 10.0.0.100
lb_mac: "00:00:00:00:00:ff"
backends:
  - { id: h3, ip: 10.0.0.3, mac: "00:00:00:00:00:03", port: 3 }
  - { id: h4, ip: 10.0.0.4, mac: "00:00:00:00:00:04", port: 4 }
  - { id: h5, ip: 10.0.0.5, mac: "00:00:00:00:00:05", port: 5 }
client_ports: [1, 2]
"#;

    pub(crate) fn sample_topology() -> Topology {
        serde_yaml::from_str::<Config>(SAMPLE).unwrap().topology
    }

    #[test]
    fn parses_sample_with_defaults() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.topology.vip, Ipv4Addr::new(10, 0, 0, 100));
        assert_eq!(config.topology.backends.len(), 3);
        assert_eq!(config.topology.backends[0].weight, 1);
        assert_eq!(config.controller, ControllerSettings::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn accepts_camel_case_aliases_and_overrides() {
        let yaml = r#"
vip: 10.0.0.100
lbMac: "00:00:00:00:00:ff"
backends:
  - { id: a, ip: 10.0.0.3, mac: "00:00:00:00:00:03", port: 3, weight: 2 }
clientPorts: [2, 1, 2]
controller:
  connect: 127.0.0.1:6633
  timeout_ms: 500
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.topology.client_ports.len(), 2);
        assert_eq!(config.topology.backends[0].weight, 2);
        assert_eq!(config.controller.connect.as_deref(), Some("127.0.0.1:6633"));
        assert_eq!(config.controller.timeout(), Duration::from_millis(500));
        assert_eq!(config.controller.sync_attempts, 3);
    }

    #[test]
    fn rejects_empty_backend_set() {
        let mut topology = sample_topology();
        topology.backends.clear();
        assert_eq!(topology.validate(65537), Err(ConfigError::NoBackends));
    }

    #[test]
    fn rejects_backend_port_listed_as_client() {
        let mut topology = sample_topology();
        topology.client_ports.push(4);
        assert_eq!(
            topology.validate(65537),
            Err(ConfigError::BackendPortIsClientPort {
                backend: "h4".into(),
                port: 4
            })
        );
    }

    #[test]
    fn rejects_overlapping_backends() {
        let mut topology = sample_topology();
        topology.backends[1].ip = topology.backends[0].ip;
        assert!(matches!(
            topology.validate(65537),
            Err(ConfigError::DuplicateBackendIp(_))
        ));

        let mut topology = sample_topology();
        topology.backends[2].mac = topology.backends[0].mac;
        assert!(matches!(
            topology.validate(65537),
            Err(ConfigError::DuplicateBackendMac(_))
        ));

        let mut topology = sample_topology();
        topology.backends[2].port = 3;
        assert_eq!(
            topology.validate(65537),
            Err(ConfigError::DuplicateBackendPort(3))
        );

        let mut topology = sample_topology();
        topology.backends[2].id = "h3".into();
        assert_eq!(
            topology.validate(65537),
            Err(ConfigError::DuplicateBackendId("h3".into()))
        );
    }

    #[test]
    fn rejects_vip_and_mac_collisions() {
        let mut topology = sample_topology();
        topology.vip = topology.backends[0].ip;
        assert!(matches!(
            topology.validate(65537),
            Err(ConfigError::VipIsBackend(_))
        ));

        let mut topology = sample_topology();
        topology.lb_mac = topology.backends[0].mac;
        assert!(matches!(
            topology.validate(65537),
            Err(ConfigError::LbMacIsBackend(_))
        ));

        let mut topology = sample_topology();
        topology.lb_mac = MacAddr::BROADCAST;
        assert!(matches!(
            topology.validate(65537),
            Err(ConfigError::LbMacNotUnicast(_))
        ));
    }

    #[test]
    fn rejects_repeated_client_ports() {
        let yaml = SAMPLE.replace("client_ports: [1, 2]", "client_ports: [1, 2, 1]");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.topology.client_ports, vec![1, 2, 1]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateClientPort(1))
        );
    }

    #[test]
    fn rejects_reserved_ports_and_bad_weights() {
        let mut topology = sample_topology();
        topology.client_ports.push(0);
        assert_eq!(topology.validate(65537), Err(ConfigError::InvalidPort(0)));

        let mut topology = sample_topology();
        topology.backends[0].port = oflb_common::ofp::OFPP_FLOOD;
        assert!(matches!(
            topology.validate(65537),
            Err(ConfigError::InvalidPort(_))
        ));

        let mut topology = sample_topology();
        topology.backends[0].weight = 0;
        assert_eq!(
            topology.validate(65537),
            Err(ConfigError::ZeroWeight("h3".into()))
        );

        let topology = sample_topology();
        assert!(matches!(
            topology.validate(2),
            Err(ConfigError::WeightExceedsRing { total: 3, .. })
        ));
    }

    #[test]
    fn rejects_zero_settings() {
        let settings = ControllerSettings {
            sync_attempts: 0,
            ..Default::default()
        };
        assert_eq!(
            settings.validate(),
            Err(ConfigError::ZeroSetting("sync_attempts"))
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let settings = ControllerSettings::default();
        assert_eq!(settings.backoff(1), Duration::from_millis(250));
        assert_eq!(settings.backoff(2), Duration::from_millis(500));
        assert_eq!(settings.backoff(4), Duration::from_millis(2000));
        assert_eq!(settings.backoff(30), Duration::from_millis(8000));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.topology, sample_topology());

        assert!(Config::load("/nonexistent/oflb.yaml").is_err());
    }

    #[test]
    fn all_ports_lists_clients_then_backends() {
        assert_eq!(sample_topology().all_ports(), vec![1, 2, 3, 4, 5]);
    }
}
