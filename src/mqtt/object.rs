//! `MqttObject` / `ObjectState` (spec.md §3) — held only by `MqttClient`.
//! One object binds a topic to a set of Modbus registers; its availability
//! is derived, never set directly.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::config::{parse_register_ref, ObjectConfig};
use crate::error::ConfigError;
use crate::model::{AvailableFlag, PayloadType, RegisterAddress};

/// One configured command or RPC, resolved to a concrete register address.
#[derive(Clone, Debug)]
pub struct CommandBinding {
    pub name: String,
    pub addr: RegisterAddress,
    pub payload_type: PayloadType,
    pub range: bool,
    pub size: Option<u16>,
    pub is_rpc: bool,
    pub refresh_msec: u64,
}

impl CommandBinding {
    /// How many consecutive registers this command addresses — 1 unless
    /// configured as a multi-register range.
    pub fn span(&self) -> u16 {
        if self.range {
            self.size.unwrap_or(1)
        } else {
            1
        }
    }
}

pub struct MqttObject {
    pub topic: String,
    pub state_addr: RegisterAddress,
    /// Every register address whose value or failure state this object
    /// tracks (spec.md §3, "MqttObject" — "a set of bound register
    /// addresses"), mapped to the poll interval it should be scheduled at.
    /// Includes the state register, any explicit availability registers,
    /// and every command/rpc register.
    pub bound: HashMap<RegisterAddress, Duration>,
    pub commands: Vec<CommandBinding>,
    pub rpcs: Vec<CommandBinding>,
    pub networks: HashSet<String>,
    state: HashMap<RegisterAddress, u16>,
    failed: HashSet<RegisterAddress>,
    network_up: HashMap<String, bool>,
    pub last_published_availability: Option<AvailableFlag>,
}

impl MqttObject {
    pub fn from_config(config: &ObjectConfig) -> Result<Self, ConfigError> {
        let state_ref = parse_register_ref(&config.state.register)?;
        let state_addr = RegisterAddress::new(state_ref.network.clone(), state_ref.slave_id, config.state.register_type, state_ref.address);

        let mut bound = HashMap::new();
        let mut networks = HashSet::new();
        bound.insert(state_addr.clone(), Duration::from_millis(config.state.refresh_msec.max(1)));
        networks.insert(state_ref.network.clone());

        let resolve = |cmd: &crate::config::CommandConfig, is_rpc: bool| -> Result<CommandBinding, ConfigError> {
            let r = parse_register_ref(&cmd.register)?;
            Ok(CommandBinding {
                name: cmd.name.clone(),
                addr: RegisterAddress::new(r.network, r.slave_id, cmd.register_type, r.address),
                payload_type: cmd.payload_type,
                range: cmd.range,
                size: cmd.size,
                is_rpc,
                refresh_msec: cmd.refresh_msec,
            })
        };

        let mut commands = Vec::new();
        for cmd in &config.commands {
            let binding = resolve(cmd, false)?;
            add_span(&mut bound, &binding);
            networks.insert(binding.addr.network.clone());
            commands.push(binding);
        }

        let mut rpcs = Vec::new();
        for cmd in &config.rpc {
            let binding = resolve(cmd, true)?;
            add_span(&mut bound, &binding);
            networks.insert(binding.addr.network.clone());
            rpcs.push(binding);
        }

        if let Some(avail) = &config.availability {
            for r in &avail.registers {
                let parsed = parse_register_ref(&r.register)?;
                let addr = RegisterAddress::new(parsed.network.clone(), parsed.slave_id, r.register_type, parsed.address);
                networks.insert(addr.network.clone());
                let refresh = Duration::from_millis(r.refresh_msec.max(1));
                bound
                    .entry(addr)
                    .and_modify(|d| *d = (*d).min(refresh))
                    .or_insert(refresh);
            }
        }

        Ok(Self {
            topic: config.topic.clone(),
            state_addr,
            bound,
            commands,
            rpcs,
            networks,
            state: HashMap::new(),
            failed: HashSet::new(),
            network_up: HashMap::new(),
            last_published_availability: None,
        })
    }

    pub fn command_named(&self, name: &str) -> Option<&CommandBinding> {
        self.commands.iter().chain(self.rpcs.iter()).find(|c| c.name == name)
    }

    pub fn references(&self, addr: &RegisterAddress) -> bool {
        self.bound.contains_key(addr)
    }

    pub fn references_network(&self, network: &str) -> bool {
        self.networks.contains(network)
    }

    pub fn record_value(&mut self, addr: &RegisterAddress, value: u16) {
        self.state.insert(addr.clone(), value);
        self.failed.remove(addr);
    }

    pub fn record_read_failed(&mut self, addr: &RegisterAddress) {
        self.failed.insert(addr.clone());
    }

    pub fn record_network_state(&mut self, network: &str, is_up: bool) {
        self.network_up.insert(network.to_string(), is_up);
    }

    pub fn has_any_value(&self) -> bool {
        !self.state.is_empty()
    }

    pub fn state_value(&self) -> Option<u16> {
        self.state.get(&self.state_addr).copied()
    }

    /// Derived availability (spec.md §3, "ObjectState"): `True` iff every
    /// referenced network is up and no bound register has failed; `False`
    /// iff any network is down or any bound register failed; `NotSet`
    /// until at least one reading has arrived.
    pub fn availability(&self) -> AvailableFlag {
        if self.state.is_empty() && self.failed.is_empty() {
            return AvailableFlag::NotSet;
        }
        let any_network_down = self.networks.iter().any(|n| self.network_up.get(n) == Some(&false));
        let any_register_failed = !self.failed.is_empty();
        if any_network_down || any_register_failed {
            AvailableFlag::False
        } else {
            AvailableFlag::True
        }
    }
}

fn add_span(bound: &mut HashMap<RegisterAddress, Duration>, binding: &CommandBinding) {
    let refresh = Duration::from_millis(binding.refresh_msec.max(1));
    for offset in 0..binding.span() {
        let addr = RegisterAddress::new(binding.addr.network.clone(), binding.addr.slave_id, binding.addr.register_type, binding.addr.address + offset);
        bound.entry(addr).and_modify(|d| *d = (*d).min(refresh)).or_insert(refresh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandConfig, ObjectConfig};
    use crate::model::RegisterType;

    fn base_config() -> ObjectConfig {
        ObjectConfig {
            topic: "test_switch".to_string(),
            state: crate::config::RegisterRef { register: "tcptest.1.2".to_string(), register_type: RegisterType::Holding, refresh_msec: 1000 },
            commands: vec![CommandConfig {
                name: "set".to_string(),
                register: "tcptest.1.2".to_string(),
                register_type: RegisterType::Holding,
                payload_type: PayloadType::Unspecified,
                range: false,
                size: None,
                refresh_msec: 1000,
            }],
            rpc: vec![],
            availability: None,
        }
    }

    #[test]
    fn not_set_until_first_reading() {
        let obj = MqttObject::from_config(&base_config()).unwrap();
        assert_eq!(obj.availability(), AvailableFlag::NotSet);
    }

    #[test]
    fn becomes_true_after_value_and_network_up() {
        let mut obj = MqttObject::from_config(&base_config()).unwrap();
        obj.record_network_state("tcptest", true);
        obj.record_value(&obj.state_addr.clone(), 32);
        assert_eq!(obj.availability(), AvailableFlag::True);
        assert_eq!(obj.state_value(), Some(32));
    }

    #[test]
    fn false_when_register_read_failed() {
        let mut obj = MqttObject::from_config(&base_config()).unwrap();
        obj.record_network_state("tcptest", true);
        obj.record_value(&obj.state_addr.clone(), 32);
        obj.record_read_failed(&obj.state_addr.clone());
        assert_eq!(obj.availability(), AvailableFlag::False);
    }

    #[test]
    fn false_when_network_down_even_with_known_value() {
        let mut obj = MqttObject::from_config(&base_config()).unwrap();
        obj.record_value(&obj.state_addr.clone(), 32);
        obj.record_network_state("tcptest", false);
        assert_eq!(obj.availability(), AvailableFlag::False);
    }
}
