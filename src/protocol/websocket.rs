//! A [`Connector`] opening websockets with `tokio-tungstenite`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::protocol::socket::{Connection, Connector, TransportError, TransportEvent};

/// Opens a websocket to the given address for every channel.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    /// Derive the websocket address from the HTTP address of the coordinator.
    pub fn from_http_url(url: &Url) -> Result<Self, TransportError> {
        let mut url = url.clone();
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => return Err(TransportError(format!("unsupported scheme: {}", other))),
        };
        url.set_scheme(scheme)
            .map_err(|_| TransportError(format!("cannot use {} with {}", scheme, url)))?;
        Ok(Self { url })
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        debug!("websocket open on {}", self.url);
        let (mut sink, mut frames) = stream.split();

        let (outbound, mut outgoing) = mpsc::unbounded_channel::<String>();
        let (events, inbound) = mpsc::unbounded_channel();
        let _ = events.send(TransportEvent::Open);

        tokio::spawn(async move {
            while let Some(text) = outgoing.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("failed to send websocket frame: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => TransportEvent::Message(text),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => TransportEvent::Message(text),
                        Err(_) => {
                            warn!("ignoring non UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => TransportEvent::Closed,
                    Ok(_) => continue,
                    Err(e) => TransportEvent::Error(e.to_string()),
                };
                let last = matches!(event, TransportEvent::Closed | TransportEvent::Error(_));
                if events.send(event).is_err() || last {
                    return;
                }
            }
            let _ = events.send(TransportEvent::Closed);
        });

        Ok(Connection { outbound, inbound })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_http_url() {
        let url = Url::parse("https://grid.example.com:5000/").unwrap();
        let connector = WebSocketConnector::from_http_url(&url).unwrap();
        assert_eq!(connector.url.as_str(), "wss://grid.example.com:5000/");

        let url = Url::parse("http://localhost:5000").unwrap();
        let connector = WebSocketConnector::from_http_url(&url).unwrap();
        assert_eq!(connector.url.scheme(), "ws");

        let url = Url::parse("ftp://localhost").unwrap();
        assert!(WebSocketConnector::from_http_url(&url).is_err());
    }
}
