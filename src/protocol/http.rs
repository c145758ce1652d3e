//! A protocol client mapping every call to an HTTP request.
//!
//! The message type gives the request path, relative to the address of the
//! coordinator, and the message payload is sent as a JSON body. This client also
//! implements the endpoints serving the cycle materials and the bandwidth measurement
//! endpoints, which only exist over HTTP.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::protocol::{
    messages::decode_payload,
    AuthenticationRequest,
    AuthenticationResponse,
    CycleRequest,
    CycleResponse,
    DownloadRequest,
    Downloader,
    Material,
    MessageKind,
    ProtocolClient,
    ProtocolError,
    ReportRequest,
    ReportResponse,
    SpeedTest,
    WorkerIdentity,
};

/// A basic HTTP interface that [`HttpClient`] backends must implement.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform an HTTP `GET` on the given URL.
    ///
    /// If the response is `NO_CONTENT`, the implementor must return `Ok(None)`. Otherwise, the
    /// response body must be returned
    async fn get(&self, url: &str) -> Result<Option<Bytes>, ProtocolError>;

    /// Perform an HTTP `POST` on the given URL, with the given body, and return the response
    /// body.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Bytes, ProtocolError>;
}

/// Error returned when trying to create an [`HttpClient`] with an invalid
/// address for the coordinator.
#[derive(Debug, Error)]
#[error("Invalid base URL: {}", .0)]
pub struct InvalidBaseUrl(String);

#[derive(Debug, Clone)]
/// A client that communicates with the coordinator's API via HTTP(S).
pub struct HttpClient<C> {
    /// HTTP(S) client
    client: C,
    /// Coordinator URL
    base_url: Url,
    /// Maximum duration of a call
    timeout: Duration,
}

/// Size of the sample sent by [`SpeedTest::upload_sample`] when the caller doesn't
/// provide one.
pub const DEFAULT_UPLOAD_SAMPLE_SIZE: usize = 64 * 1024;

impl<C> HttpClient<C>
where
    C: HttpTransport,
{
    /// Create a new client.
    ///
    /// # Args
    ///
    /// - `client` is the HTTP client that will be used to perform the HTTP requests. Any HTTP
    ///   client can be used, as long as it implements the [`HttpTransport`] trait.
    /// - `base_url` is the URL to the coordinator
    /// - `timeout` bounds the duration of every call
    ///
    /// # Errors
    ///
    /// An error is returned if `base_url` is not a valid URL
    pub fn new(client: C, base_url: &str, timeout: Duration) -> Result<Self, InvalidBaseUrl> {
        let base_url = Url::parse(base_url).map_err(|e| InvalidBaseUrl(format!("{}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(InvalidBaseUrl(String::from("cannot be a base URL")));
        }
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// Append the given path to the client base URL
    fn url(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        // `new` rejects the URLs that cannot be a base
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(path.split('/'));
        }
        url
    }

    async fn with_timeout<T, F>(&self, call: F) -> Result<T, ProtocolError>
    where
        F: Future<Output = Result<T, ProtocolError>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| ProtocolError::Timeout(self.timeout))?
    }

    async fn call<Req, Resp>(&self, kind: MessageKind, request: &Req) -> Result<Resp, ProtocolError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self.url(kind.as_str());
        let body = serde_json::to_vec(request).map_err(|e| ProtocolError::Parse {
            kind,
            detail: e.to_string(),
        })?;
        debug!("POST {}", url);
        let response = self.with_timeout(self.client.post(url.as_str(), body)).await?;
        Ok(decode_payload(kind, &response)?)
    }

    async fn get(&self, url: &Url) -> Result<Bytes, ProtocolError> {
        debug!("GET {}", url);
        self.with_timeout(self.client.get(url.as_str()))
            .await?
            .ok_or_else(|| ProtocolError::Server(format!("empty response from {}", url.path())))
    }

    fn speed_test_url(&self, worker_id: &WorkerIdentity) -> Url {
        let mut url = self.url("model-centric/speed-test");
        url.query_pairs_mut()
            .append_pair("worker_id", worker_id.as_str())
            .append_pair("random", &rand::thread_rng().gen::<u64>().to_string());
        url
    }
}

#[async_trait]
impl<C> ProtocolClient for HttpClient<C>
where
    C: HttpTransport,
{
    async fn authenticate(
        &self,
        request: AuthenticationRequest,
    ) -> Result<AuthenticationResponse, ProtocolError> {
        self.call(MessageKind::Authenticate, &request).await
    }

    async fn request_cycle(&self, request: CycleRequest) -> Result<CycleResponse, ProtocolError> {
        self.call(MessageKind::CycleRequest, &request).await
    }

    async fn report(&self, request: ReportRequest) -> Result<ReportResponse, ProtocolError> {
        self.call(MessageKind::Report, &request).await
    }

    /// Every call opens its own exchange, so there is never anything to keep open.
    fn is_active(&self) -> bool {
        false
    }

    fn close(&self) {}
}

#[async_trait]
impl<C> Downloader for HttpClient<C>
where
    C: HttpTransport,
{
    async fn download(&self, request: DownloadRequest) -> Result<Vec<u8>, ProtocolError> {
        let (path, key) = match request.material {
            Material::Plan(_) => ("model-centric/get-plan", "plan_id"),
            Material::Protocol(_) => ("model-centric/get-protocol", "protocol_id"),
            Material::Model(_) => ("model-centric/get-model", "model_id"),
        };
        let mut url = self.url(path);
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("worker_id", request.worker_id.as_str())
                .append_pair("request_key", &request.request_key)
                .append_pair(key, request.material.id());
            if let Material::Plan(_) = request.material {
                query.append_pair("receive_operations_as", "torchscript");
            }
        }
        Ok(self.get(&url).await?.to_vec())
    }
}

#[async_trait]
impl<C> SpeedTest for HttpClient<C>
where
    C: HttpTransport,
{
    async fn ping(&self, worker_id: WorkerIdentity) -> Result<(), ProtocolError> {
        let mut url = self.speed_test_url(&worker_id);
        url.query_pairs_mut().append_pair("is_ping", "1");
        self.with_timeout(self.client.get(url.as_str())).await?;
        Ok(())
    }

    async fn download_sample(&self, worker_id: WorkerIdentity) -> Result<usize, ProtocolError> {
        let url = self.speed_test_url(&worker_id);
        Ok(self.get(&url).await?.len())
    }

    async fn upload_sample(&self, worker_id: WorkerIdentity, sample: Vec<u8>) -> Result<(), ProtocolError> {
        let url = self.speed_test_url(&worker_id);
        self.with_timeout(self.client.post(url.as_str(), sample)).await?;
        Ok(())
    }
}

#[cfg(feature = "reqwest-client")]
mod reqwest_transport {
    use std::{fs::File, io::Read, path::Path, time::Duration};

    use async_trait::async_trait;
    use bytes::Bytes;
    use thiserror::Error;

    use super::{HttpClient, HttpTransport};
    use crate::protocol::ProtocolError;

    fn http_error(e: reqwest::Error) -> ProtocolError {
        if e.is_timeout() {
            ProtocolError::Connectivity(format!("request timed out: {}", e))
        } else if e.is_status() {
            ProtocolError::Server(format!("{}", e))
        } else {
            ProtocolError::Connectivity(format!("{}", e))
        }
    }

    #[async_trait]
    impl HttpTransport for reqwest::Client {
        async fn get(&self, url: &str) -> Result<Option<Bytes>, ProtocolError> {
            let resp = reqwest::Client::get(self, url)
                .send()
                .await
                .map_err(http_error)?
                .error_for_status()
                .map_err(http_error)?;
            match resp.status() {
                reqwest::StatusCode::NO_CONTENT => Ok(None),
                _ => Ok(Some(resp.bytes().await.map_err(http_error)?)),
            }
        }

        async fn post(&self, url: &str, body: Vec<u8>) -> Result<Bytes, ProtocolError> {
            reqwest::Client::post(self, url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
                .map_err(http_error)?
                .error_for_status()
                .map_err(http_error)?
                .bytes()
                .await
                .map_err(http_error)
        }
    }

    /// Error returned upon failing to instantiate a new [`HttpClient`]
    #[derive(Debug, Error)]
    pub enum ClientError {
        #[error("invalid URL: {0}")]
        InvalidUrl(String),
        #[error("failed to read trust anchor {0}: {1}")]
        TrustAnchor(String, String),
        #[error("{0}")]
        Other(String),
    }

    /// Build a new [`HttpClient`] backed by `reqwest`.
    ///
    /// # Args
    ///
    /// - `address`: URL of the coordinator to connect to
    /// - `trust_anchor_path`: path the to root certificate for TLS server authentication. The
    ///   certificate must be PEM encoded.
    /// - `timeout`: maximum duration of a call
    pub fn new_client(
        address: &str,
        trust_anchor_path: Option<&Path>,
        timeout: Duration,
    ) -> Result<HttpClient<reqwest::Client>, ClientError> {
        let builder = reqwest::ClientBuilder::new().use_rustls_tls();

        let builder = if let Some(path) = trust_anchor_path {
            let display = path.display().to_string();
            let mut buf = Vec::new();
            File::open(path)
                .and_then(|mut file| file.read_to_end(&mut buf))
                .map_err(|e| ClientError::TrustAnchor(display.clone(), e.to_string()))?;
            let root_cert = reqwest::Certificate::from_pem(&buf)
                .map_err(|e| ClientError::TrustAnchor(display, e.to_string()))?;
            builder.add_root_certificate(root_cert)
        } else {
            builder
        };

        let reqwest_client = builder
            .build()
            .map_err(|e| ClientError::Other(e.to_string()))?;
        HttpClient::new(reqwest_client, address, timeout)
            .map_err(|_| ClientError::InvalidUrl(address.to_string()))
    }
}

#[cfg(feature = "reqwest-client")]
#[cfg_attr(docsrs, doc(cfg(feature = "reqwest-client")))]
pub use self::reqwest_transport::{new_client, ClientError};
