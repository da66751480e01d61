pub mod client;
pub mod object;
pub mod payload;

pub use client::MqttClient;
pub use object::MqttObject;
