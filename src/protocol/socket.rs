//! A protocol client multiplexing every call over one persistent channel.
//!
//! The channel is opened lazily on the first call. A reader task decodes the inbound
//! messages and routes each of them to the call waiting for it:
//!
//! - only the latest authentication call is answered, an earlier one is superseded
//! - cycle responses go to the oldest call issued for a matching job
//! - the other responses are delivered in the order the calls were made
//!
//! When the channel breaks, every pending call fails and the next call opens a new
//! channel.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    job::JobIdentity,
    protocol::{
        messages::{ClientMessage, ServerMessage},
        response::{response_channel, Response, ResponseSender},
        AuthenticationRequest,
        AuthenticationResponse,
        CycleRequest,
        CycleResponse,
        DecodeError,
        InternalMessageRequest,
        InternalMessageResponse,
        JoinRoomRequest,
        JoinRoomResponse,
        MessageKind,
        ProtocolClient,
        ProtocolError,
        RelayClient,
        ReportRequest,
        ReportResponse,
    },
};

/// Error returned when a channel cannot be opened.
#[derive(Debug, Error)]
#[error("failed to open a channel to the coordinator: {0}")]
pub struct TransportError(pub String);

/// What the transport observed on an open channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Error(String),
    Closed,
}

/// The two halves of an open channel.
pub struct Connection {
    /// Text frames to send to the coordinator
    pub outbound: mpsc::UnboundedSender<String>,
    /// Events observed on the channel
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens channels to the coordinator.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Connection, TransportError>;
}

#[derive(Default)]
struct PendingCalls {
    authenticate: Option<ResponseSender<AuthenticationResponse>>,
    cycles: VecDeque<(JobIdentity, ResponseSender<CycleResponse>)>,
    reports: VecDeque<ResponseSender<ReportResponse>>,
    join_room: VecDeque<ResponseSender<JoinRoomResponse>>,
    internal: VecDeque<ResponseSender<InternalMessageResponse>>,
}

/// Deliver to the oldest caller still waiting.
fn deliver_in_order<R>(queue: &mut VecDeque<ResponseSender<R>>, kind: MessageKind, response: Response<R>) {
    while let Some(tx) = queue.pop_front() {
        if tx.is_closed() {
            continue;
        }
        if tx.send(response) {
            return;
        }
        break;
    }
    warn!("no pending call for {} response, dropping it", kind);
}

impl PendingCalls {
    fn dispatch(&mut self, message: ServerMessage) {
        let kind = message.kind();
        match message {
            ServerMessage::Authenticate(response) => {
                let delivered = match self.authenticate.take() {
                    Some(tx) => tx.send(Ok(response)),
                    None => false,
                };
                if !delivered {
                    warn!("no pending call for {} response, dropping it", kind);
                }
            }
            ServerMessage::CycleRequest(response) => self.deliver_cycle(Ok(response)),
            ServerMessage::Report(response) => deliver_in_order(&mut self.reports, kind, Ok(response)),
            ServerMessage::JoinRoom(response) => deliver_in_order(&mut self.join_room, kind, Ok(response)),
            ServerMessage::InternalMessage(response) => {
                deliver_in_order(&mut self.internal, kind, Ok(response))
            }
        }
    }

    /// Route a cycle response, or a failure to decode one, to the oldest matching call.
    fn deliver_cycle(&mut self, response: Response<CycleResponse>) {
        self.cycles.retain(|(_, tx)| !tx.is_closed());
        let position = match &response {
            Ok(response) => self.cycles.iter().position(|(job, _)| response.matches(job)),
            Err(_) => (!self.cycles.is_empty()).then(|| 0),
        };
        match position.and_then(|i| self.cycles.remove(i)) {
            Some((job, tx)) => {
                if !tx.send(response) {
                    warn!(job = %job, "caller stopped waiting for its cycle response");
                }
            }
            None => warn!("no pending cycle request matches the response, dropping it"),
        }
    }

    /// Fail the oldest call of the given kind.
    fn fail(&mut self, kind: MessageKind, error: ProtocolError) {
        fn fail_first<R>(queue: &mut VecDeque<ResponseSender<R>>, error: ProtocolError) {
            if let Some(tx) = queue.iter().position(|tx| !tx.is_closed()).and_then(|i| queue.remove(i)) {
                tx.fail(error);
            }
        }

        match kind {
            MessageKind::Authenticate => {
                if let Some(tx) = self.authenticate.take() {
                    tx.fail(error);
                }
            }
            MessageKind::CycleRequest => self.deliver_cycle(Err(error)),
            MessageKind::Report => fail_first(&mut self.reports, error),
            MessageKind::JoinRoom => fail_first(&mut self.join_room, error),
            MessageKind::InternalMessage => fail_first(&mut self.internal, error),
        }
    }

    fn fail_all(&mut self, error: ProtocolError) {
        let pending = std::mem::take(self);
        if let Some(tx) = pending.authenticate {
            tx.fail(error.clone());
        }
        for (_, tx) in pending.cycles {
            tx.fail(error.clone());
        }
        for tx in pending.reports {
            tx.fail(error.clone());
        }
        for tx in pending.join_room {
            tx.fail(error.clone());
        }
        for tx in pending.internal {
            tx.fail(error.clone());
        }
    }
}

struct OpenChannel {
    outbound: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    generation: u64,
}

#[derive(Default)]
struct SocketState {
    channel: Option<OpenChannel>,
    pending: PendingCalls,
    generation: u64,
}

type SharedState = Arc<Mutex<SocketState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, SocketState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A [`ProtocolClient`] and [`RelayClient`] over a persistent channel.
pub struct SocketClient {
    connector: Arc<dyn Connector>,
    timeout: Duration,
    state: SharedState,
    connecting: tokio::sync::Mutex<()>,
}

impl SocketClient {
    /// Create a client. No channel is opened until the first call.
    pub fn new<C: Connector>(connector: C, timeout: Duration) -> Self {
        Self {
            connector: Arc::new(connector),
            timeout,
            state: Arc::new(Mutex::new(SocketState::default())),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    async fn ensure_open(&self) -> Result<(), ProtocolError> {
        if self.is_active() {
            return Ok(());
        }
        let _connecting = self.connecting.lock().await;
        if self.is_active() {
            return Ok(());
        }

        info!("opening a channel to the coordinator");
        let Connection { outbound, inbound } = self
            .connector
            .connect()
            .await
            .map_err(|e| ProtocolError::Connectivity(e.to_string()))?;

        let mut state = lock(&self.state);
        state.generation += 1;
        let generation = state.generation;
        let reader = tokio::spawn(read_loop(Arc::clone(&self.state), generation, inbound));
        let stale = state.channel.replace(OpenChannel {
            outbound,
            reader,
            generation,
        });
        if let Some(stale) = stale {
            stale.reader.abort();
        }
        Ok(())
    }

    /// Send a message and wait for the response routed to `register`'s sender.
    async fn call<R: Clone>(
        &self,
        message: ClientMessage,
        register: impl FnOnce(&mut PendingCalls, ResponseSender<R>),
    ) -> Result<R, ProtocolError> {
        let kind = message.kind();
        let text = message.encode().map_err(|e| ProtocolError::Parse {
            kind,
            detail: e.to_string(),
        })?;
        self.ensure_open().await?;

        let (tx, rx) = response_channel(kind.backpressure());
        {
            let mut state = lock(&self.state);
            let outbound = match state.channel {
                Some(ref channel) => channel.outbound.clone(),
                None => return Err(ProtocolError::Closed),
            };
            // register before sending so that the response cannot overtake the caller
            register(&mut state.pending, tx);
            outbound
                .send(text)
                .map_err(|_| ProtocolError::Connectivity("channel closed while sending".into()))?;
        }
        debug!("sent {} message", kind);

        match tokio::time::timeout(self.timeout, rx.recv()).await {
            Ok(response) => response,
            Err(_) => {
                warn!("no response to {} message after {:?}", kind, self.timeout);
                Err(ProtocolError::Timeout(self.timeout))
            }
        }
    }
}

async fn read_loop(state: SharedState, generation: u64, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = inbound.recv().await {
        match event {
            TransportEvent::Open => debug!("channel to the coordinator open"),
            TransportEvent::Message(text) => handle_message(&state, &text),
            TransportEvent::Error(e) => {
                error!("channel to the coordinator failed: {}", e);
                disconnect(&state, generation, ProtocolError::Connectivity(e));
                return;
            }
            TransportEvent::Closed => {
                info!("channel closed by the coordinator");
                disconnect(&state, generation, ProtocolError::Connectivity("channel closed by peer".into()));
                return;
            }
        }
    }
    disconnect(&state, generation, ProtocolError::Connectivity("transport shut down".into()));
}

fn handle_message(state: &SharedState, text: &str) {
    match ServerMessage::decode(text) {
        Ok(message) => {
            debug!("received {} message", message.kind());
            lock(state).pending.dispatch(message);
        }
        Err(DecodeError::InvalidData { kind, detail }) => {
            warn!("invalid {} message: {}", kind, detail);
            lock(state)
                .pending
                .fail(kind, ProtocolError::Parse { kind, detail });
        }
        Err(e) => warn!("ignoring inbound message: {}", e),
    }
}

/// Tear down the channel of the given generation, failing every pending call.
fn disconnect(state: &SharedState, generation: u64, error: ProtocolError) {
    let mut state = lock(state);
    match state.channel {
        Some(ref channel) if channel.generation == generation => {
            state.channel = None;
            state.pending.fail_all(error);
        }
        // the channel was already closed or replaced
        _ => {}
    }
}

#[async_trait]
impl ProtocolClient for SocketClient {
    async fn authenticate(
        &self,
        request: AuthenticationRequest,
    ) -> Result<AuthenticationResponse, ProtocolError> {
        self.call(ClientMessage::Authenticate(request), |pending, tx| {
            if let Some(previous) = pending.authenticate.replace(tx) {
                previous.fail(ProtocolError::Superseded);
            }
        })
        .await
    }

    async fn request_cycle(&self, request: CycleRequest) -> Result<CycleResponse, ProtocolError> {
        let job = request.identity();
        self.call(ClientMessage::CycleRequest(request), move |pending, tx| {
            pending.cycles.push_back((job, tx))
        })
        .await
    }

    async fn report(&self, request: ReportRequest) -> Result<ReportResponse, ProtocolError> {
        self.call(ClientMessage::Report(request), |pending, tx| {
            pending.reports.push_back(tx)
        })
        .await
    }

    fn is_active(&self) -> bool {
        lock(&self.state)
            .channel
            .as_ref()
            .map_or(false, |channel| !channel.outbound.is_closed() && !channel.reader.is_finished())
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        match state.channel.take() {
            Some(channel) => {
                channel.reader.abort();
                state.pending.fail_all(ProtocolError::Closed);
                info!("channel to the coordinator closed");
            }
            None => debug!("channel to the coordinator already closed"),
        }
    }
}

#[async_trait]
impl RelayClient for SocketClient {
    async fn join_room(&self, request: JoinRoomRequest) -> Result<JoinRoomResponse, ProtocolError> {
        self.call(ClientMessage::JoinRoom(request), |pending, tx| {
            pending.join_room.push_back(tx)
        })
        .await
    }

    async fn relay_message(
        &self,
        request: InternalMessageRequest,
    ) -> Result<InternalMessageResponse, ProtocolError> {
        self.call(ClientMessage::InternalMessage(request), |pending, tx| {
            pending.internal.push_back(tx)
        })
        .await
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        if let Some(channel) = lock(&self.state).channel.take() {
            channel.reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        protocol::Capabilities,
        testutils::{cycle_accept, MemoryConnector},
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn cycle_request(model: &str, version: Option<&str>) -> CycleRequest {
        CycleRequest::new(
            "worker".into(),
            &JobIdentity::new(model, version.map(String::from)),
            Capabilities::default(),
        )
    }

    #[tokio::test]
    async fn test_opens_lazily() {
        let (connector, mut server) = MemoryConnector::new();
        let client = SocketClient::new(connector, TIMEOUT);
        assert!(!client.is_active());

        let call = tokio::spawn(async move {
            let response = client.authenticate(AuthenticationRequest::default()).await;
            (client.is_active(), response)
        });
        let mut channel = server.accept().await;
        let sent = channel.next_message().await;
        assert_eq!(sent["type"], "model-centric/authenticate");
        channel.reply(json!({
            "type": "model-centric/authenticate",
            "data": {"worker_id": "w1"}
        }));

        let (active, response) = call.await.unwrap();
        assert!(active);
        assert_eq!(
            response.unwrap(),
            AuthenticationResponse::Success {
                worker_id: "w1".into(),
                requires_speed_test: false,
            }
        );
    }

    #[tokio::test]
    async fn test_cycle_responses_are_routed_by_model() {
        let (connector, mut server) = MemoryConnector::new();
        let client = Arc::new(SocketClient::new(connector, TIMEOUT));

        let mnist = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.request_cycle(cycle_request("mnist", Some("1"))).await }
        });
        let mut channel = server.accept().await;
        channel.next_message().await;
        let cifar = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.request_cycle(cycle_request("cifar", None)).await }
        });
        channel.next_message().await;

        // answer in the opposite order
        channel.reply(cycle_accept("cifar", None, "key-cifar"));
        channel.reply(cycle_accept("mnist", Some("1"), "key-mnist"));

        match cifar.await.unwrap().unwrap() {
            CycleResponse::Accepted(accept) => assert_eq!(accept.request_key, "key-cifar"),
            other => panic!("unexpected response {:?}", other),
        }
        match mnist.await.unwrap().unwrap() {
            CycleResponse::Accepted(accept) => assert_eq!(accept.request_key, "key-mnist"),
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_payload_fails_only_its_caller() {
        let (connector, mut server) = MemoryConnector::new();
        let client = Arc::new(SocketClient::new(connector, TIMEOUT));

        let cycle = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.request_cycle(cycle_request("mnist", None)).await }
        });
        let mut channel = server.accept().await;
        channel.next_message().await;
        let report = tokio::spawn({
            let client = Arc::clone(&client);
            async move {
                client
                    .report(ReportRequest {
                        worker_id: "worker".into(),
                        request_key: "key".into(),
                        diff: "ZGlmZg==".into(),
                    })
                    .await
            }
        });
        channel.next_message().await;

        channel.reply(json!({
            "type": "model-centric/cycle-request",
            "data": {"status": "unknown"}
        }));
        channel.reply(json!({
            "type": "model-centric/report",
            "data": {"status": "success"}
        }));

        assert!(matches!(
            cycle.await.unwrap(),
            Err(ProtocolError::Parse {
                kind: MessageKind::CycleRequest,
                ..
            })
        ));
        assert_eq!(
            report.await.unwrap().unwrap().status.as_deref(),
            Some("success")
        );
        assert!(client.is_active());
    }

    #[tokio::test]
    async fn test_out_of_range_retry_delay_keeps_channel_usable() {
        let (connector, mut server) = MemoryConnector::new();
        let client = Arc::new(SocketClient::new(connector, TIMEOUT));

        let first = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.request_cycle(cycle_request("mnist", None)).await }
        });
        let mut channel = server.accept().await;
        channel.next_message().await;
        channel.reply(json!({
            "type": "model-centric/cycle-request",
            "data": {"status": "rejected", "model": "mnist", "timeout": 1e300}
        }));
        assert!(matches!(
            first.await.unwrap(),
            Err(ProtocolError::Parse {
                kind: MessageKind::CycleRequest,
                ..
            })
        ));
        assert!(client.is_active());

        let second = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.request_cycle(cycle_request("mnist", None)).await }
        });
        channel.next_message().await;
        channel.reply(json!({
            "type": "model-centric/cycle-request",
            "data": {"status": "rejected", "model": "mnist", "timeout": 30}
        }));
        match second.await.unwrap().unwrap() {
            CycleResponse::Rejected(reject) => assert_eq!(reject.retry_after, Duration::from_secs(30)),
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_calls_and_reconnects() {
        let (connector, mut server) = MemoryConnector::new();
        let client = Arc::new(SocketClient::new(connector, TIMEOUT));

        let cycle = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.request_cycle(cycle_request("mnist", None)).await }
        });
        let mut channel = server.accept().await;
        channel.next_message().await;
        channel.send_event(TransportEvent::Closed);
        assert!(matches!(
            cycle.await.unwrap(),
            Err(ProtocolError::Connectivity(_))
        ));

        let cycle = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.request_cycle(cycle_request("mnist", None)).await }
        });
        let mut channel = server.accept().await;
        channel.next_message().await;
        channel.reply(cycle_accept("mnist", None, "key"));
        assert!(cycle.await.unwrap().is_ok());
        assert_eq!(server.connections(), 2);
    }

    #[tokio::test]
    async fn test_timeout() {
        let (connector, mut server) = MemoryConnector::new();
        let client = SocketClient::new(connector, Duration::from_millis(50));
        let call = tokio::spawn(async move { client.request_cycle(cycle_request("mnist", None)).await });
        let _channel = server.accept().await;
        assert_eq!(
            call.await.unwrap(),
            Err(ProtocolError::Timeout(Duration::from_millis(50)))
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (connector, mut server) = MemoryConnector::new();
        let client = Arc::new(SocketClient::new(connector, TIMEOUT));
        // closing a client that never opened a channel
        client.close();

        let call = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.authenticate(AuthenticationRequest::default()).await }
        });
        let mut channel = server.accept().await;
        channel.next_message().await;

        client.close();
        client.close();
        assert!(!client.is_active());
        assert_eq!(call.await.unwrap(), Err(ProtocolError::Closed));
    }

    #[tokio::test]
    async fn test_unmatched_cycle_response_is_dropped() {
        let (connector, mut server) = MemoryConnector::new();
        let client = Arc::new(SocketClient::new(connector, TIMEOUT));

        let cycle = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.request_cycle(cycle_request("mnist", Some("2"))).await }
        });
        let mut channel = server.accept().await;
        channel.next_message().await;
        channel.reply(cycle_accept("mnist", Some("1"), "wrong"));
        channel.reply(cycle_accept("mnist", Some("2"), "right"));

        match cycle.await.unwrap().unwrap() {
            CycleResponse::Accepted(accept) => assert_eq!(accept.request_key, "right"),
            other => panic!("unexpected response {:?}", other),
        }
    }
}
