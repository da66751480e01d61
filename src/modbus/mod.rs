pub mod transport;
pub mod worker;

pub use transport::{ModbusTransport, TokioModbusTransport};
pub use worker::{Connector, ModbusWorker};
