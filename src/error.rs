//! The three error kinds of spec.md §7. None of these unwind past the
//! component that produces them — the queue carries events, not exceptions;
//! these types exist for the narrow boundaries where a `Result` is still
//! the right shape (config loading, a single read/write call).

use thiserror::Error;

/// Fatal at startup only — surfaced to stderr and a non-zero exit.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("object \"{object}\" references unknown network \"{network}\"")]
    UnknownNetwork { object: String, network: String },
    #[error("network \"{0}\" must set either address/port (TCP) or device (RTU)")]
    AmbiguousNetwork(String),
    #[error("slave id {0} out of range [0,247]")]
    SlaveIdOutOfRange(u16),
    #[error("command \"{0}\" needs \"size\" when range or binary payloads are used")]
    MissingSize(String),
}

/// Modbus transport-level errors — connection lost, timeout, protocol
/// desync — versus per-register errors (illegal data address, slave
/// exception). Only the former brings the network down (spec.md §4.1,
/// "Failure semantics"). Message shape grounded in
/// `examples/original_source/libmodmqttsrv/modbus_context.cpp`'s
/// `ModbusReadException`/`ModbusWriteException` strings.
#[derive(Debug, Error, Clone)]
pub enum ModbusTransportError {
    #[error("libmodbus: connect failed: {0}")]
    Connect(String),
    #[error("libmodbus: {op} fn {addr} failed: {reason}")]
    Transport { op: &'static str, addr: u16, reason: String },
    #[error("libmodbus: {op} fn {addr} failed: {reason}")]
    Exception { op: &'static str, addr: u16, reason: String },
}

impl ModbusTransportError {
    /// Whether this should bring the whole network down, vs. failing only
    /// the one register/operation it was raised for.
    pub fn is_transport_level(&self) -> bool {
        matches!(self, ModbusTransportError::Connect(_) | ModbusTransportError::Transport { .. })
    }
}

/// Per-register / per-message operation errors. Logged, the offending
/// message is dropped, never fatal.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not a valid decimal integer in [0,65535]: {0}")]
    InvalidInteger(String),
    #[error("binary payload must be >= 2 bytes and a multiple of 2, got {0}")]
    InvalidBinaryLength(usize),
    #[error("binary payload length {actual} does not match configured range size {expected}")]
    RangeSizeMismatch { expected: usize, actual: usize },
    #[error("payload exceeds MAX_DATA_LEN ({max} bytes): {actual}")]
    TooLarge { max: usize, actual: usize },
    #[error("value {0} is not a valid coil/bit value (must be 0 or 1)")]
    InvalidBitValue(u16),
    #[error("payload type mismatch: command expects {expected:?}, got {actual:?}")]
    PayloadTypeMismatch { expected: crate::model::PayloadType, actual: crate::model::PayloadType },
    #[error("unknown object/command topic: {0}")]
    UnknownTopic(String),
    #[error("RPC command \"{0}\" received with no responseTopic")]
    MissingResponseTopic(String),
}
