//! Shared data model: register addressing, queue messages and the
//! availability tri-state. Held by value everywhere — no entity here is
//! ever shared by pointer across a thread boundary (see DESIGN.md, "pointer
//! graphs").

use std::time::Instant;

/// The four Modbus register spaces. Declaration order doubles as the
/// scheduler's tie-break rank (derived `Ord`) — see `RegisterAddress::
/// schedule_key`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Coil,
    Bit,
    Holding,
    Input,
}

impl RegisterType {
    pub fn is_writable(self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Holding)
    }

    pub fn is_bit(self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Bit)
    }
}

impl std::fmt::Display for RegisterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RegisterType::Coil => "coil",
            RegisterType::Bit => "bit",
            RegisterType::Holding => "holding",
            RegisterType::Input => "input",
        };
        f.write_str(s)
    }
}

/// Globally-unique register identity: `(network, slave, type, address)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RegisterAddress {
    pub network: String,
    pub slave_id: u8,
    pub register_type: RegisterType,
    pub address: u16,
}

impl RegisterAddress {
    pub fn new(network: impl Into<String>, slave_id: u8, register_type: RegisterType, address: u16) -> Self {
        Self {
            network: network.into(),
            slave_id,
            register_type,
            address,
        }
    }

    /// Lexicographic scheduling key: `(slaveId, regType, address)` — the
    /// network is fixed per worker so it is not part of the tie-break
    /// (spec.md §4.1, "Scheduling algorithm").
    pub fn schedule_key(&self) -> (u8, RegisterType, u16) {
        (self.slave_id, self.register_type, self.address)
    }
}

impl std::fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.network, self.slave_id, self.register_type, self.address)
    }
}

/// Ternary availability flag (spec.md §3, "AvailableFlag").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AvailableFlag {
    NotSet,
    True,
    False,
}

impl AvailableFlag {
    pub fn as_published_byte(self) -> Option<u8> {
        match self {
            AvailableFlag::NotSet => None,
            AvailableFlag::True => Some(b'1'),
            AvailableFlag::False => Some(b'0'),
        }
    }
}

/// MQTT publish metadata carried alongside RPC and command traffic
/// (spec.md §3, "MqttPublishProps").
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MqttPublishProps {
    pub payload_type: PayloadType,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadType {
    #[default]
    Unspecified,
    String,
    Binary,
}

/// Messages flowing ModbusWorker → Orchestrator → MqttClient. One tagged
/// enum per direction rather than a class hierarchy — see DESIGN.md,
/// "polymorphism of messages".
#[derive(Clone, Debug)]
pub enum WorkerEvent {
    RegisterValue { addr: RegisterAddress, values: Vec<u16> },
    RegisterReadFailed { addr: RegisterAddress },
    RegisterWriteFailed { addr: RegisterAddress },
    ModbusNetworkState { network: String, is_up: bool },
    RpcResponse { addr: RegisterAddress, props: MqttPublishProps, data: Vec<u8> },
    RpcError { addr: RegisterAddress, props: MqttPublishProps, error: String },
}

/// Messages Orchestrator/MqttClient → a specific ModbusWorker.
#[derive(Clone, Debug)]
pub enum WorkerCommand {
    Configure { polls: Vec<PollSpec> },
    /// `range` forces the multi-register/multi-coil function code even for
    /// a single value (spec.md §4.1, "Write semantics").
    Write { addr: RegisterAddress, values: Vec<u16>, range: bool },
    RpcRead { addr: RegisterAddress, size: u16, props: MqttPublishProps },
    RpcWrite { addr: RegisterAddress, values: Vec<u16>, props: MqttPublishProps },
    /// Broadcast by MqttClient on broker connect/disconnect (spec.md §3,
    /// "MqttNetworkState"; §4.2, "emits `MqttNetworkState(false)` to every
    /// worker").
    MqttNetworkState { is_up: bool },
    EndWork,
}

/// One entry of a worker's poll list, as carried by `Configure`.
#[derive(Clone, Debug)]
pub struct PollSpec {
    pub slave_id: u8,
    pub register_type: RegisterType,
    pub address: u16,
    pub refresh: std::time::Duration,
}

/// Scheduling record owned exclusively by a ModbusWorker (spec.md §3,
/// "RegisterPoll"). `last_read`/`first_error_time` use `Instant` since the
/// scheduler only ever compares durations, never wall-clock time.
#[derive(Debug)]
pub struct RegisterPoll {
    pub slave_id: u8,
    pub register_type: RegisterType,
    pub address: u16,
    pub refresh: std::time::Duration,
    pub last_read: Instant,
    /// `None` until the first successful read arrives — distinguishes "never
    /// read" from "last read as 0" so the first poll always emits, even when
    /// the register happens to hold 0 (spec.md §2, "on change it emits").
    pub last_value: Option<u16>,
    pub read_error_count: u32,
    pub first_error_time: Option<Instant>,
    pub last_error_log: Option<Instant>,
}

impl RegisterPoll {
    pub fn new(slave_id: u8, register_type: RegisterType, address: u16, refresh: std::time::Duration) -> Self {
        assert!(refresh > std::time::Duration::ZERO, "refresh must be > 0");
        Self {
            slave_id,
            register_type,
            address,
            refresh,
            // due immediately on first tick
            last_read: Instant::now() - refresh,
            last_value: None,
            read_error_count: 0,
            first_error_time: None,
            last_error_log: None,
        }
    }

    pub fn due_at(&self) -> Instant {
        self.last_read + self.refresh
    }

    pub fn schedule_key(&self) -> (u8, RegisterType, u16) {
        (self.slave_id, self.register_type, self.address)
    }

    pub fn address_of(&self, network: &str) -> RegisterAddress {
        RegisterAddress::new(network, self.slave_id, self.register_type, self.address)
    }
}

/// Default consecutive-failure threshold before `RegisterReadFailed` fires
/// (grounded in `examples/original_source/libmodmqttsrv/register_poll.hpp`).
pub const DEFAULT_READ_ERROR_COUNT: u32 = 3;

/// Minimum spacing between repeated error logs for the same register.
pub const DURATION_BETWEEN_LOG_ERROR: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Hard cap on a single binary RPC/command payload (16 registers).
pub const MAX_DATA_LEN: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_key_orders_by_slave_then_type_then_address() {
        let a = RegisterAddress::new("net", 1, RegisterType::Holding, 10);
        let b = RegisterAddress::new("net", 1, RegisterType::Input, 5);
        let c = RegisterAddress::new("net", 2, RegisterType::Coil, 0);
        assert!(a.schedule_key() < b.schedule_key());
        assert!(b.schedule_key() < c.schedule_key());
    }

    #[test]
    fn available_flag_publishes_only_once_set() {
        assert_eq!(AvailableFlag::NotSet.as_published_byte(), None);
        assert_eq!(AvailableFlag::True.as_published_byte(), Some(b'1'));
        assert_eq!(AvailableFlag::False.as_published_byte(), Some(b'0'));
    }
}
