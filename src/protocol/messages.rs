//! Messages exchanged with the coordinator.
//!
//! Every message on a persistent channel is a JSON object with a `type` discriminant
//! and a `data` payload:
//!
//! ```text
//! {"type": "model-centric/cycle-request", "data": {"worker_id": "...", ...}}
//! ```
//!
//! Over HTTP, the discriminant becomes the request path and only the `data` payload is
//! sent.

use std::{collections::HashMap, fmt, time::Duration};

use derive_more::{AsRef, Display, From};
use serde::{
    de::{self, DeserializeOwned, Deserializer, Visitor},
    Deserialize,
    Serialize,
};
use thiserror::Error;

use crate::job::JobIdentity;

/// The identifier assigned to this worker by the coordinator upon authentication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, From, AsRef, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerIdentity(String);

impl WorkerIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerIdentity {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Discriminant of the messages of the cycle protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Authenticate,
    CycleRequest,
    Report,
    JoinRoom,
    InternalMessage,
}

impl MessageKind {
    /// The value of the `type` field for this kind of message.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authenticate => "model-centric/authenticate",
            Self::CycleRequest => "model-centric/cycle-request",
            Self::Report => "model-centric/report",
            Self::JoinRoom => "webrtc: join-room",
            Self::InternalMessage => "webrtc: internal-message",
        }
    }

    /// Parse a `type` field.
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "model-centric/authenticate" => Some(Self::Authenticate),
            "model-centric/cycle-request" => Some(Self::CycleRequest),
            "model-centric/report" => Some(Self::Report),
            "webrtc: join-room" => Some(Self::JoinRoom),
            "webrtc: internal-message" => Some(Self::InternalMessage),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuthenticationRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum AuthenticationResponse {
    Success {
        worker_id: WorkerIdentity,
        /// Whether the coordinator expects bandwidth measurements with the cycle request
        #[serde(default)]
        requires_speed_test: bool,
    },
    Error {
        error: String,
    },
}

/// Bandwidth measurements sent along with a cycle request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Capabilities {
    /// Round trip time, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping: Option<f64>,
    /// Download bandwidth, in Mbps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<f64>,
    /// Upload bandwidth, in Mbps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleRequest {
    pub worker_id: WorkerIdentity,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(flatten)]
    pub capabilities: Capabilities,
}

impl CycleRequest {
    pub fn new(worker_id: WorkerIdentity, job: &JobIdentity, capabilities: Capabilities) -> Self {
        Self {
            worker_id,
            model: job.model_name.clone(),
            version: job.version.clone(),
            capabilities,
        }
    }

    /// The identity of the job this request was issued for.
    pub fn identity(&self) -> JobIdentity {
        JobIdentity::new(self.model.clone(), self.version.clone())
    }
}

/// Training parameters sent by the coordinator when a worker is accepted in a cycle.
///
/// The well-known fields are exposed directly, any other key is kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub name: Option<String>,
    pub version: Option<String>,
    pub batch_size: Option<u64>,
    pub lr: Option<f64>,
    pub max_updates: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CycleAccept {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub request_key: String,
    #[serde(default, deserialize_with = "deserialize_id_map")]
    pub plans: HashMap<String, String>,
    #[serde(default, deserialize_with = "deserialize_id_map")]
    pub protocols: HashMap<String, String>,
    #[serde(default)]
    pub client_config: ClientConfig,
    #[serde(deserialize_with = "deserialize_id")]
    pub model_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CycleReject {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Time after which the worker may apply again
    #[serde(rename = "timeout", deserialize_with = "deserialize_seconds")]
    pub retry_after: Duration,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CycleResponse {
    Accepted(CycleAccept),
    Rejected(CycleReject),
}

impl CycleResponse {
    /// Model name and version the response refers to, if the coordinator included them.
    pub fn model(&self) -> (Option<&str>, Option<&str>) {
        let (model, version) = match self {
            Self::Accepted(accept) => (&accept.model, &accept.version),
            Self::Rejected(reject) => (&reject.model, &reject.version),
        };
        (model.as_deref(), version.as_deref())
    }

    /// Whether this response may be delivered to a request issued for `job`.
    pub fn matches(&self, job: &JobIdentity) -> bool {
        match self.model() {
            (Some(model), version) => job.matches(model, version),
            (None, _) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRequest {
    pub worker_id: WorkerIdentity,
    pub request_key: String,
    /// Base64 encoded diff
    pub diff: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReportResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinRoomRequest {
    pub worker_id: WorkerIdentity,
    pub scope_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JoinRoomResponse {
    pub worker_id: String,
    pub scope_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InternalMessageRequest {
    pub worker_id: WorkerIdentity,
    pub scope_id: String,
    /// Worker the message is relayed to
    pub target: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InternalMessageResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "worker_id")]
    pub from_worker: String,
    #[serde(rename = "sdp_string")]
    pub session_description: String,
}

/// A message sent to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "model-centric/authenticate")]
    Authenticate(AuthenticationRequest),
    #[serde(rename = "model-centric/cycle-request")]
    CycleRequest(CycleRequest),
    #[serde(rename = "model-centric/report")]
    Report(ReportRequest),
    #[serde(rename = "webrtc: join-room")]
    JoinRoom(JoinRoomRequest),
    #[serde(rename = "webrtc: internal-message")]
    InternalMessage(InternalMessageRequest),
}

impl ClientMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Authenticate(_) => MessageKind::Authenticate,
            Self::CycleRequest(_) => MessageKind::CycleRequest,
            Self::Report(_) => MessageKind::Report,
            Self::JoinRoom(_) => MessageKind::JoinRoom,
            Self::InternalMessage(_) => MessageKind::InternalMessage,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A message received from the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Authenticate(AuthenticationResponse),
    CycleRequest(CycleResponse),
    Report(ReportResponse),
    JoinRoom(JoinRoomResponse),
    InternalMessage(InternalMessageResponse),
}

/// Error returned when an inbound message cannot be decoded.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown message type: {0}")]
    UnknownKind(String),
    #[error("invalid {kind} payload: {detail}")]
    InvalidData { kind: MessageKind, detail: String },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl ServerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Authenticate(_) => MessageKind::Authenticate,
            Self::CycleRequest(_) => MessageKind::CycleRequest,
            Self::Report(_) => MessageKind::Report,
            Self::JoinRoom(_) => MessageKind::JoinRoom,
            Self::InternalMessage(_) => MessageKind::InternalMessage,
        }
    }

    /// Decode a message received on a persistent channel.
    ///
    /// The `type` field is decoded first, so that a payload that doesn't match its
    /// declared type can be reported as [`DecodeError::InvalidData`] for that type.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let Envelope { kind, data } =
            serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let kind = MessageKind::from_wire(&kind).ok_or(DecodeError::UnknownKind(kind))?;
        let message = match kind {
            MessageKind::Authenticate => Self::Authenticate(from_value(kind, data)?),
            MessageKind::CycleRequest => Self::CycleRequest(from_value(kind, data)?),
            MessageKind::Report => Self::Report(from_value(kind, data)?),
            MessageKind::JoinRoom => Self::JoinRoom(from_value(kind, data)?),
            MessageKind::InternalMessage => Self::InternalMessage(from_value(kind, data)?),
        };
        Ok(message)
    }
}

fn from_value<T: DeserializeOwned>(kind: MessageKind, data: serde_json::Value) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|e| DecodeError::InvalidData {
        kind,
        detail: e.to_string(),
    })
}

/// Decode the body of a response received over HTTP.
pub(crate) fn decode_payload<T: DeserializeOwned>(kind: MessageKind, body: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(body).map_err(|e| DecodeError::InvalidData {
        kind,
        detail: e.to_string(),
    })
}

/// Identifiers are sometimes sent as numbers, sometimes as strings.
struct IdVisitor;

impl<'de> Visitor<'de> for IdVisitor {
    type Value = String;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a string or an integer identifier")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
        Ok(value.to_string())
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
        Ok(value.to_string())
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
        Ok(value.to_string())
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(IdVisitor)
}

fn deserialize_id_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Id(#[serde(deserialize_with = "deserialize_id")] String);

    let map = HashMap::<String, Id>::deserialize(deserializer)?;
    Ok(map.into_iter().map(|(name, Id(id))| (name, id)).collect())
}

/// Retry delays are expressed in seconds, either as a number or as a numeric string.
fn deserialize_seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct SecondsVisitor;

    impl<'de> Visitor<'de> for SecondsVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a non-negative number of seconds")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
            if value < 0 {
                return Err(de::Error::invalid_value(de::Unexpected::Signed(value), &self));
            }
            Ok(Duration::from_secs(value as u64))
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
            Duration::try_from_secs_f64(value)
                .map_err(|_| de::Error::invalid_value(de::Unexpected::Float(value), &self))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
            value
                .trim()
                .parse::<f64>()
                .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(value), &self))
                .and_then(|seconds| self.visit_f64(seconds))
        }
    }

    deserializer.deserialize_any(SecondsVisitor)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_client_message_type_matches_kind() {
        let messages = vec![
            ClientMessage::Authenticate(AuthenticationRequest::default()),
            ClientMessage::Report(ReportRequest {
                worker_id: "w".into(),
                request_key: "k".into(),
                diff: "ZGlmZg==".into(),
            }),
            ClientMessage::JoinRoom(JoinRoomRequest {
                worker_id: "w".into(),
                scope_id: "s".into(),
            }),
        ];
        for message in messages {
            let encoded: serde_json::Value =
                serde_json::from_str(&message.encode().unwrap()).unwrap();
            assert_eq!(encoded["type"], message.kind().as_str());
        }
    }

    #[test]
    fn test_cycle_request_flattens_capabilities() {
        let job = JobIdentity::new("mnist", Some("1.0".into()));
        let request = CycleRequest::new(
            "worker".into(),
            &job,
            Capabilities {
                ping: Some(12.5),
                download: Some(30.0),
                upload: None,
            },
        );
        let encoded = serde_json::to_value(ClientMessage::CycleRequest(request)).unwrap();
        assert_eq!(
            encoded,
            json!({
                "type": "model-centric/cycle-request",
                "data": {
                    "worker_id": "worker",
                    "model": "mnist",
                    "version": "1.0",
                    "ping": 12.5,
                    "download": 30.0,
                }
            })
        );
    }

    #[test]
    fn test_decode_cycle_accept() {
        let text = json!({
            "type": "model-centric/cycle-request",
            "data": {
                "status": "accepted",
                "model": "mnist",
                "version": "1.0",
                "request_key": "key",
                "plans": {"avg_plan": 1, "training_plan": "p2"},
                "protocols": {},
                "client_config": {"batch_size": 64, "lr": 0.01, "custom": true},
                "model_id": 7
            }
        })
        .to_string();
        let message = ServerMessage::decode(&text).unwrap();
        let accept = match message {
            ServerMessage::CycleRequest(CycleResponse::Accepted(accept)) => accept,
            other => panic!("unexpected message {:?}", other),
        };
        assert_eq!(accept.plans["avg_plan"], "1");
        assert_eq!(accept.plans["training_plan"], "p2");
        assert_eq!(accept.model_id, "7");
        assert_eq!(accept.client_config.batch_size, Some(64));
        assert_eq!(accept.client_config.extra["custom"], json!(true));
    }

    #[test]
    fn test_decode_cycle_reject_timeout() {
        for timeout in vec![json!(600), json!("600"), json!(600.0)] {
            let text = json!({
                "type": "model-centric/cycle-request",
                "data": {"status": "rejected", "timeout": timeout}
            })
            .to_string();
            let message = ServerMessage::decode(&text).unwrap();
            match message {
                ServerMessage::CycleRequest(CycleResponse::Rejected(reject)) => {
                    assert_eq!(reject.retry_after, Duration::from_secs(600))
                }
                other => panic!("unexpected message {:?}", other),
            }
        }
    }

    #[test]
    fn test_decode_cycle_reject_invalid_timeout() {
        for timeout in vec![json!(1e300), json!("1e30"), json!(-1), json!(-0.5), json!("nan"), json!("soon")] {
            let text = json!({
                "type": "model-centric/cycle-request",
                "data": {"status": "rejected", "timeout": timeout}
            })
            .to_string();
            assert!(
                matches!(
                    ServerMessage::decode(&text),
                    Err(DecodeError::InvalidData {
                        kind: MessageKind::CycleRequest,
                        ..
                    })
                ),
                "accepted timeout {}",
                timeout
            );
        }
    }

    #[test]
    fn test_decode_authentication() {
        let success = json!({
            "type": "model-centric/authenticate",
            "data": {"status": "success", "worker_id": "abc", "requires_speed_test": true}
        });
        assert_eq!(
            ServerMessage::decode(&success.to_string()).unwrap(),
            ServerMessage::Authenticate(AuthenticationResponse::Success {
                worker_id: "abc".into(),
                requires_speed_test: true,
            })
        );

        let error = json!({
            "type": "model-centric/authenticate",
            "data": {"error": "invalid token"}
        });
        assert_eq!(
            ServerMessage::decode(&error.to_string()).unwrap(),
            ServerMessage::Authenticate(AuthenticationResponse::Error {
                error: "invalid token".into(),
            })
        );
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            ServerMessage::decode("not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert_eq!(
            ServerMessage::decode(r#"{"type": "unknown", "data": {}}"#),
            Err(DecodeError::UnknownKind("unknown".into()))
        );
        assert!(matches!(
            ServerMessage::decode(r#"{"type": "model-centric/cycle-request", "data": {"status": "maybe"}}"#),
            Err(DecodeError::InvalidData {
                kind: MessageKind::CycleRequest,
                ..
            })
        ));
    }

    #[test]
    fn test_cycle_response_matching() {
        let reject = |model: Option<&str>, version: Option<&str>| {
            CycleResponse::Rejected(CycleReject {
                model: model.map(String::from),
                version: version.map(String::from),
                retry_after: Duration::from_secs(1),
            })
        };
        let job = JobIdentity::new("mnist", Some("1".into()));
        assert!(reject(Some("mnist"), None).matches(&job));
        assert!(reject(Some("mnist"), Some("1")).matches(&job));
        assert!(!reject(Some("mnist"), Some("2")).matches(&job));
        assert!(reject(None, None).matches(&job));
    }
}
