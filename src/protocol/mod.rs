//! Clients speaking the cycle protocol with the coordinator.
//!
//! Two variants are provided:
//!
//! - [`socket::SocketClient`] keeps a single persistent channel open and correlates
//!   inbound messages with the calls awaiting them. It also carries the peer-to-peer
//!   signalling messages ([`RelayClient`]).
//! - [`http::HttpClient`] maps each call to a request/response exchange. It also
//!   implements the download endpoints ([`Downloader`]) and the bandwidth measurement
//!   endpoints ([`SpeedTest`]).

pub mod http;
pub mod messages;
pub mod response;
pub mod socket;
#[cfg(feature = "websocket")]
#[cfg_attr(docsrs, doc(cfg(feature = "websocket")))]
pub mod websocket;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::{
    messages::{
        AuthenticationRequest,
        AuthenticationResponse,
        Capabilities,
        ClientConfig,
        CycleAccept,
        CycleReject,
        CycleRequest,
        CycleResponse,
        DecodeError,
        InternalMessageRequest,
        InternalMessageResponse,
        JoinRoomRequest,
        JoinRoomResponse,
        MessageKind,
        ReportRequest,
        ReportResponse,
        WorkerIdentity,
    },
    response::Backpressure,
};

/// Error returned by the protocol clients.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("connection to the coordinator failed: {0}")]
    Connectivity(String),
    #[error("no response from the coordinator after {0:?}")]
    Timeout(Duration),
    #[error("the channel to the coordinator was closed")]
    Closed,
    #[error("superseded by a more recent request")]
    Superseded,
    #[error("failed to process {kind} message: {detail}")]
    Parse { kind: MessageKind, detail: String },
    #[error("the coordinator answered with an error: {0}")]
    Server(String),
}

impl From<DecodeError> for ProtocolError {
    fn from(error: DecodeError) -> Self {
        match error {
            DecodeError::InvalidData { kind, detail } => Self::Parse { kind, detail },
            // without a message type, there is no caller to attribute the failure to
            other => Self::Server(other.to_string()),
        }
    }
}

/// The calls a worker makes to take part in training cycles.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Obtain a worker identity from the coordinator.
    async fn authenticate(
        &self,
        request: AuthenticationRequest,
    ) -> Result<AuthenticationResponse, ProtocolError>;

    /// Apply for a training cycle.
    async fn request_cycle(&self, request: CycleRequest) -> Result<CycleResponse, ProtocolError>;

    /// Send the result of local training.
    async fn report(&self, request: ReportRequest) -> Result<ReportResponse, ProtocolError>;

    /// Whether the client currently holds an open channel to the coordinator.
    fn is_active(&self) -> bool;

    /// Release the resources held by the client. Calling it more than once is harmless
    /// and a later call reopens the client lazily.
    fn close(&self);
}

/// Signalling messages relayed by the coordinator between workers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn join_room(&self, request: JoinRoomRequest) -> Result<JoinRoomResponse, ProtocolError>;

    async fn relay_message(
        &self,
        request: InternalMessageRequest,
    ) -> Result<InternalMessageResponse, ProtocolError>;
}

/// A material handed out to the workers accepted in a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Material {
    Plan(String),
    Protocol(String),
    Model(String),
}

impl Material {
    /// The identifier of the material in the coordinator.
    pub fn id(&self) -> &str {
        match self {
            Self::Plan(id) | Self::Protocol(id) | Self::Model(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub worker_id: WorkerIdentity,
    pub request_key: String,
    pub material: Material,
}

/// Fetches the cycle materials.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, request: DownloadRequest) -> Result<Vec<u8>, ProtocolError>;
}

/// Endpoints used to estimate the quality of the link with the coordinator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeedTest: Send + Sync {
    async fn ping(&self, worker_id: WorkerIdentity) -> Result<(), ProtocolError>;

    /// Download a sample, returning its size in bytes.
    async fn download_sample(&self, worker_id: WorkerIdentity) -> Result<usize, ProtocolError>;

    async fn upload_sample(&self, worker_id: WorkerIdentity, sample: Vec<u8>) -> Result<(), ProtocolError>;
}
