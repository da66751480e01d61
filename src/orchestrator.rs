//! Wires configuration into a running system: one `ModbusWorker` task per
//! configured network, one `MqttClient` task, bounded mpsc queues between
//! them, and cooperative shutdown on SIGINT/SIGTERM (spec.md §5).

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::config::Config;
use crate::error::ConfigError;
use crate::model::{PollSpec, RegisterType, WorkerCommand, WorkerEvent};
use crate::modbus::worker::ModbusWorker;
use crate::modbus::transport::TokioModbusTransport;
use crate::mqtt::client::MqttClient;
use crate::mqtt::object::MqttObject;

use async_trait::async_trait;

/// Bound chosen to absorb a burst of commands/events without back-pressuring
/// a worker mid-poll; generous relative to any realistic object count.
const QUEUE_CAPACITY: usize = 256;

struct NetworkConnector {
    network: crate::config::NetworkConfig,
}

#[async_trait]
impl crate::modbus::worker::Connector for NetworkConnector {
    type Transport = TokioModbusTransport;

    async fn connect(&self) -> Result<TokioModbusTransport, crate::error::ModbusTransportError> {
        TokioModbusTransport::connect(&self.network).await
    }
}

pub struct Orchestrator {
    config: Config,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Builds every object, every worker's poll list, spawns the worker and
    /// client tasks, and blocks until shutdown is requested.
    pub async fn run(self) -> Result<(), ConfigError> {
        let objects = self
            .config
            .mqtt
            .objects
            .iter()
            .map(MqttObject::from_config)
            .collect::<Result<Vec<_>, _>>()?;

        let (event_tx, event_rx) = mpsc::channel::<WorkerEvent>(QUEUE_CAPACITY);
        let mut worker_txs: HashMap<String, mpsc::Sender<WorkerCommand>> = HashMap::new();
        let mut worker_handles = Vec::new();

        for network in &self.config.modbus.networks {
            let (cmd_tx, cmd_rx) = mpsc::channel::<WorkerCommand>(QUEUE_CAPACITY);
            let polls = polls_for_network(&objects, &network.name);
            let max_backoff = polls.iter().map(|p| p.refresh).max().unwrap_or(Duration::from_secs(60));

            let connector = NetworkConnector { network: network.clone() };
            let worker = ModbusWorker::new(network.name.clone(), connector, cmd_rx, event_tx.clone(), max_backoff);

            if !polls.is_empty() {
                let _ = cmd_tx.send(WorkerCommand::Configure { polls }).await;
            }

            worker_txs.insert(network.name.clone(), cmd_tx);
            worker_handles.push(tokio::spawn(worker.run()));
        }
        drop(event_tx);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let client = MqttClient::new(&self.config.mqtt, worker_txs.clone(), event_rx, shutdown_rx)?;
        let client_handle = tokio::spawn(client.run());

        wait_for_shutdown_signal().await;
        info!("shutdown requested, stopping workers and mqtt client");

        for tx in worker_txs.values() {
            let _ = tx.send(WorkerCommand::EndWork).await;
        }
        let _ = shutdown_tx.send(()).await;

        for handle in worker_handles {
            let _ = handle.await;
        }
        let _ = client_handle.await;

        Ok(())
    }
}

/// Every register an object binds to becomes a poll entry on that
/// register's network, at the smallest refresh interval requested by any
/// binding that references it (spec.md §3, "MqttObject" bound-address
/// invariant).
fn polls_for_network(objects: &[MqttObject], network: &str) -> Vec<PollSpec> {
    let mut by_key: HashMap<(u8, RegisterType, u16), Duration> = HashMap::new();

    for object in objects {
        for (addr, refresh) in &object.bound {
            if addr.network != network {
                continue;
            }
            let key = addr.schedule_key();
            by_key.entry(key).and_modify(|d| *d = (*d).min(*refresh)).or_insert(*refresh);
        }
    }

    let mut specs: Vec<PollSpec> = by_key
        .into_iter()
        .map(|((slave_id, register_type, address), refresh)| PollSpec { slave_id, register_type, address, refresh })
        .collect();
    specs.sort_by_key(|s| (s.slave_id, s.register_type, s.address));
    specs
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
