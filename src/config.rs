//! YAML configuration schema (spec.md §6) and loading. External
//! collaborator: specified only to the depth the core needs it parsed into
//! typed structs.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::model::{PayloadType, RegisterType};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub modbus: ModbusConfig,
    pub mqtt: MqttConfig,
}

#[derive(Debug, Deserialize)]
pub struct ModbusConfig {
    pub networks: Vec<NetworkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    // TCP
    pub address: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    // RTU
    pub device: Option<String>,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_parity")]
    pub parity: SerialParity,
    #[serde(default = "default_data_bit")]
    pub data_bit: u8,
    #[serde(default = "default_stop_bit")]
    pub stop_bit: u8,
    #[serde(default)]
    pub rtu_serial_mode: RtuSerialMode,
    #[serde(default)]
    pub rts_mode: RtsMode,
    #[serde(default)]
    pub rts_delay_us: u32,
}

fn default_port() -> u16 {
    502
}
fn default_baud() -> u32 {
    9600
}
fn default_parity() -> SerialParity {
    SerialParity::None
}
fn default_data_bit() -> u8 {
    8
}
fn default_stop_bit() -> u8 {
    1
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SerialParity {
    None,
    Even,
    Odd,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub enum RtuSerialMode {
    #[default]
    RS232,
    RS485,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub enum RtsMode {
    #[default]
    UP,
    DOWN,
}

/// Which transport a `NetworkConfig` resolves to.
pub enum Transport {
    Tcp { address: String, port: u16 },
    Rtu { device: String },
}

impl NetworkConfig {
    pub fn transport(&self) -> Result<Transport, ConfigError> {
        match (&self.address, &self.device) {
            (Some(address), None) => Ok(Transport::Tcp { address: address.clone(), port: self.port }),
            (None, Some(device)) => Ok(Transport::Rtu { device: device.clone() }),
            _ => Err(ConfigError::AmbiguousNetwork(self.name.clone())),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MqttConfig {
    pub client_id: String,
    pub broker: BrokerConfig,
    pub objects: Vec<ObjectConfig>,
}

#[derive(Debug, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}
fn default_keepalive() -> u64 {
    60
}

impl BrokerConfig {
    pub fn keepalive_duration(&self) -> Duration {
        Duration::from_secs(self.keepalive)
    }
}

#[derive(Debug, Deserialize)]
pub struct ObjectConfig {
    pub topic: String,
    pub state: RegisterRef,
    #[serde(default)]
    pub commands: Vec<CommandConfig>,
    #[serde(default)]
    pub rpc: Vec<CommandConfig>,
    pub availability: Option<AvailabilityConfig>,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityConfig {
    #[serde(default)]
    pub registers: Vec<RegisterRef>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CommandConfig {
    pub name: String,
    pub register: String,
    pub register_type: RegisterType,
    #[serde(default)]
    pub payload_type: PayloadType,
    #[serde(default)]
    pub range: bool,
    pub size: Option<u16>,
    #[serde(default = "default_refresh_msec")]
    pub refresh_msec: u64,
}

/// `<network>.<slave>.<address>` register reference as written in YAML.
#[derive(Debug, Deserialize, Clone)]
pub struct RegisterRef {
    pub register: String,
    pub register_type: RegisterType,
    /// spec.md's distilled schema omits a poll interval entirely; the
    /// original gateway's config carries one per register (its config
    /// loader is not in `original_source/`, only `register_poll.*`, which
    /// requires `refresh > 0`). Supplemented here with a sensible default —
    /// see DESIGN.md's Open Question resolution.
    #[serde(default = "default_refresh_msec")]
    pub refresh_msec: u64,
}

pub fn default_refresh_msec() -> u64 {
    1000
}

/// Parsed form of a `network.slave.address` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRegister {
    pub network: String,
    pub slave_id: u8,
    pub address: u16,
}

pub fn parse_register_ref(s: &str) -> Result<ParsedRegister, ConfigError> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 3 {
        return Err(ConfigError::UnknownNetwork {
            object: s.to_string(),
            network: s.to_string(),
        });
    }
    let network = parts[0].to_string();
    let slave_id: u16 = parts[1]
        .parse()
        .map_err(|_| ConfigError::SlaveIdOutOfRange(0))?;
    if slave_id > 247 {
        return Err(ConfigError::SlaveIdOutOfRange(slave_id));
    }
    let address: u16 = parts[2]
        .parse()
        .map_err(|_| ConfigError::SlaveIdOutOfRange(0))?;
    Ok(ParsedRegister {
        network,
        slave_id: slave_id as u8,
        address,
    })
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let config: Config = serde_yaml::from_str(&text)?;
    validate(&config)?;
    Ok(config)
}

/// Cross-checks that don't fit naturally in serde: every register
/// reference must name a configured network (spec.md §3, "MqttObject"
/// invariant — "every bound address must be known to the configuration at
/// startup").
fn validate(config: &Config) -> Result<(), ConfigError> {
    let networks: HashMap<&str, &NetworkConfig> =
        config.modbus.networks.iter().map(|n| (n.name.as_str(), n)).collect();

    for network in config.modbus.networks.iter() {
        network.transport()?;
    }

    let check_ref = |object_topic: &str, register: &str| -> Result<(), ConfigError> {
        let parsed = parse_register_ref(register)?;
        if !networks.contains_key(parsed.network.as_str()) {
            return Err(ConfigError::UnknownNetwork {
                object: object_topic.to_string(),
                network: parsed.network,
            });
        }
        Ok(())
    };

    for object in &config.mqtt.objects {
        check_ref(&object.topic, &object.state.register)?;
        for cmd in object.commands.iter().chain(object.rpc.iter()) {
            check_ref(&object.topic, &cmd.register)?;
            if (cmd.range || cmd.payload_type == PayloadType::Binary) && cmd.size.is_none() {
                return Err(ConfigError::MissingSize(cmd.name.clone()));
            }
        }
        if let Some(avail) = &object.availability {
            for r in &avail.registers {
                check_ref(&object.topic, &r.register)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_register_ref() {
        let r = parse_register_ref("tcptest.1.2").unwrap();
        assert_eq!(r.network, "tcptest");
        assert_eq!(r.slave_id, 1);
        assert_eq!(r.address, 2);
    }

    #[test]
    fn rejects_slave_id_out_of_range() {
        assert!(parse_register_ref("net.300.2").is_err());
    }

    #[test]
    fn loads_minimal_document() {
        let yaml = r#"
modbus:
  networks:
    - name: tcptest
      address: 127.0.0.1
      port: 5020
mqtt:
  client_id: bridge
  broker:
    host: localhost
  objects:
    - topic: test_switch
      state: { register: tcptest.1.2, register_type: holding }
      commands:
        - name: set
          register: tcptest.1.2
          register_type: holding
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.mqtt.objects.len(), 1);
    }

    #[test]
    fn rejects_unknown_network_reference() {
        let yaml = r#"
modbus:
  networks:
    - name: tcptest
      address: 127.0.0.1
mqtt:
  client_id: bridge
  broker:
    host: localhost
  objects:
    - topic: test_switch
      state: { register: other.1.2, register_type: holding }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(validate(&config).is_err());
    }
}
