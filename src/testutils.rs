//! Helpers shared by the tests of the crate.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use crate::{
    constraints::{
        BatteryState,
        ConstraintMonitor,
        ConstraintPolicy,
        DeviceState,
        DeviceStateUpdater,
        NetworkClass,
        NetworkState,
    },
    job::JobStatusEvent,
    model::{ComputationError, Diff, ModelComputation, ModelState},
    protocol::{
        socket::{Connection, Connector, TransportError, TransportEvent},
        DownloadRequest,
        Downloader,
        Material,
        ProtocolClient,
        ProtocolError,
    },
    settings::WorkerSettings,
    worker::{Worker, WorkerBuilder},
};

const WAIT: Duration = Duration::from_secs(5);

/// A [`Connector`] handing the server side of every channel over to a
/// [`MemoryServer`].
pub struct MemoryConnector {
    connections: mpsc::UnboundedSender<ServerChannel>,
    count: Arc<AtomicUsize>,
}

pub struct MemoryServer {
    connections: mpsc::UnboundedReceiver<ServerChannel>,
    count: Arc<AtomicUsize>,
}

/// The coordinator side of a channel.
pub struct ServerChannel {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let count = Arc::new(AtomicUsize::new(0));
        (
            Self {
                connections: tx,
                count: Arc::clone(&count),
            },
            MemoryServer { connections: rx, count },
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        let _ = to_client.send(TransportEvent::Open);
        self.connections
            .send(ServerChannel { from_client, to_client })
            .map_err(|_| TransportError("server shut down".into()))?;
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(Connection { outbound, inbound })
    }
}

impl MemoryServer {
    pub async fn accept(&mut self) -> ServerChannel {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("no connection opened")
            .expect("connector dropped")
    }

    /// Number of channels opened so far.
    pub fn connections(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl ServerChannel {
    pub async fn next_message(&mut self) -> serde_json::Value {
        let text = tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("no message received")
            .expect("channel closed");
        serde_json::from_str(&text).expect("invalid message")
    }

    /// Check that the client sends nothing for `wait`.
    pub async fn assert_silent(&mut self, wait: Duration) {
        if let Ok(Some(text)) = tokio::time::timeout(wait, self.from_client.recv()).await {
            panic!("unexpected message: {}", text);
        }
    }

    pub fn reply(&self, message: serde_json::Value) {
        self.send_event(TransportEvent::Message(message.to_string()));
    }

    pub fn send_event(&self, event: TransportEvent) {
        self.to_client.send(event).expect("client gone");
    }
}

pub fn cycle_accept(model: &str, version: Option<&str>, request_key: &str) -> serde_json::Value {
    json!({
        "type": "model-centric/cycle-request",
        "data": {
            "status": "accepted",
            "model": model,
            "version": version,
            "request_key": request_key,
            "plans": {"training_plan": 1},
            "protocols": {},
            "client_config": {"name": model, "batch_size": 64, "lr": 0.005},
            "model_id": 10,
        }
    })
}

/// Serves `model-<id>` for models and `<material>-<id>` for the others.
pub struct FixedDownloader;

pub const MODEL_STATE: &[u8] = &[1, 2, 3, 4];

#[async_trait]
impl Downloader for FixedDownloader {
    async fn download(&self, request: DownloadRequest) -> Result<Vec<u8>, ProtocolError> {
        Ok(match request.material {
            Material::Model(_) => MODEL_STATE.to_vec(),
            Material::Plan(id) => format!("plan-{}", id).into_bytes(),
            Material::Protocol(id) => format!("protocol-{}", id).into_bytes(),
        })
    }
}

/// Computes byte-wise differences.
pub struct Subtraction;

impl ModelComputation for Subtraction {
    fn create_diff(&self, original: &ModelState, trained: &ModelState) -> Result<Diff, ComputationError> {
        let (original, trained) = (original.as_ref(), trained.as_ref());
        if original.len() != trained.len() {
            return Err(ComputationError("mismatched model sizes".into()));
        }
        Ok(Diff::from(
            original
                .iter()
                .zip(trained.iter())
                .map(|(a, b)| b.wrapping_sub(*a))
                .collect::<Vec<u8>>(),
        ))
    }
}

pub fn eligible_state() -> DeviceState {
    DeviceState {
        network: NetworkState {
            class: Some(NetworkClass::Wifi),
            internet: true,
            metered: false,
            restricted: false,
        },
        battery: BatteryState {
            charging: true,
            level: 100,
        },
    }
}

pub fn monitor(state: DeviceState) -> (ConstraintMonitor, DeviceStateUpdater) {
    ConstraintMonitor::new(ConstraintPolicy::default(), state)
}

pub fn worker_settings(files_dir: &Path, max_concurrent_jobs: usize) -> WorkerSettings {
    WorkerSettings {
        max_concurrent_jobs,
        files_dir: files_dir.to_path_buf(),
        ..WorkerSettings::default()
    }
}

/// A worker downloading with [`FixedDownloader`] and computing with [`Subtraction`].
pub fn worker(
    client: Arc<dyn ProtocolClient>,
    monitor: ConstraintMonitor,
    files_dir: &Path,
    max_concurrent_jobs: usize,
) -> Worker {
    WorkerBuilder::new(worker_settings(files_dir, max_concurrent_jobs), monitor)
        .protocol_client(client)
        .downloader(Arc::new(FixedDownloader))
        .computation(Arc::new(Subtraction))
        .build()
        .unwrap()
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<JobStatusEvent>) -> JobStatusEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("no event received")
        .expect("subscription ended")
}

/// Skip the progress notifications.
pub async fn next_milestone(events: &mut mpsc::UnboundedReceiver<JobStatusEvent>) -> JobStatusEvent {
    loop {
        match next_event(events).await {
            JobStatusEvent::Progress { .. } => continue,
            event => return event,
        }
    }
}

/// Check that the subscription ends without any other event.
pub async fn assert_ended(events: &mut mpsc::UnboundedReceiver<JobStatusEvent>) {
    let next = tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("subscription did not end");
    assert_eq!(next, None);
}
