//! Channels carrying responses from the socket reader task to the callers awaiting them.
//!
//! Each kind of request comes with a policy describing what happens to responses the
//! caller has not consumed yet.

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::protocol::{MessageKind, ProtocolError};

/// How responses are queued until the caller consumes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Only the most recent response is kept
    Latest,
    /// Every response is kept, in order
    Buffer,
    /// A single response is kept, later ones are discarded
    Drop,
}

impl MessageKind {
    pub fn backpressure(self) -> Backpressure {
        match self {
            Self::Authenticate => Backpressure::Latest,
            Self::CycleRequest | Self::JoinRoom | Self::InternalMessage => Backpressure::Buffer,
            Self::Report => Backpressure::Drop,
        }
    }
}

pub(crate) type Response<R> = Result<R, ProtocolError>;

pub(crate) fn response_channel<R>(policy: Backpressure) -> (ResponseSender<R>, ResponseReceiver<R>) {
    match policy {
        Backpressure::Latest => {
            let (tx, rx) = watch::channel(None);
            (ResponseSender::Latest(tx), ResponseReceiver::Latest(rx))
        }
        Backpressure::Buffer => {
            let (tx, rx) = mpsc::unbounded_channel();
            (ResponseSender::Buffer(tx), ResponseReceiver::Buffer(rx))
        }
        Backpressure::Drop => {
            let (tx, rx) = mpsc::channel(1);
            (ResponseSender::Drop(tx), ResponseReceiver::Drop(rx))
        }
    }
}

pub(crate) enum ResponseSender<R> {
    Latest(watch::Sender<Option<Response<R>>>),
    Buffer(mpsc::UnboundedSender<Response<R>>),
    Drop(mpsc::Sender<Response<R>>),
}

impl<R> ResponseSender<R> {
    /// Hand a response over to the caller. Returns `false` if the caller is gone.
    pub fn send(&self, response: Response<R>) -> bool {
        match self {
            Self::Latest(tx) => tx.send(Some(response)).is_ok(),
            Self::Buffer(tx) => tx.send(response).is_ok(),
            Self::Drop(tx) => match tx.try_send(response) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("discarding response: a response is already pending");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
        }
    }

    /// Whether the caller stopped waiting, for instance after a timeout.
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Latest(tx) => tx.is_closed(),
            Self::Buffer(tx) => tx.is_closed(),
            Self::Drop(tx) => tx.is_closed(),
        }
    }

    /// Fail the pending call, logging if nobody is waiting for it anymore.
    pub fn fail(&self, error: ProtocolError) {
        if !self.send(Err(error)) {
            warn!("failed to deliver error: receiver shut down");
        }
    }
}

pub(crate) enum ResponseReceiver<R> {
    Latest(watch::Receiver<Option<Response<R>>>),
    Buffer(mpsc::UnboundedReceiver<Response<R>>),
    Drop(mpsc::Receiver<Response<R>>),
}

impl<R: Clone> ResponseReceiver<R> {
    /// Wait for the first response. Fails with [`ProtocolError::Closed`] if the sender is
    /// dropped before responding.
    pub async fn recv(self) -> Response<R> {
        match self {
            Self::Latest(mut rx) => loop {
                if let Some(response) = rx.borrow_and_update().clone() {
                    return response;
                }
                rx.changed().await.map_err(|_| ProtocolError::Closed)?;
            },
            Self::Buffer(mut rx) => rx.recv().await.unwrap_or(Err(ProtocolError::Closed)),
            Self::Drop(mut rx) => rx.recv().await.unwrap_or(Err(ProtocolError::Closed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    #[test]
    fn test_recv_waits_for_response() {
        for policy in vec![Backpressure::Latest, Backpressure::Buffer, Backpressure::Drop] {
            let (tx, rx) = response_channel::<u32>(policy);
            let mut recv = task::spawn(rx.recv());
            assert_pending!(recv.poll());

            assert!(tx.send(Ok(3)));
            assert!(recv.is_woken());
            assert_eq!(assert_ready!(recv.poll()), Ok(3));
        }
    }

    #[tokio::test]
    async fn test_latest_keeps_most_recent() {
        let (tx, rx) = response_channel::<u32>(Backpressure::Latest);
        assert!(tx.send(Ok(1)));
        assert!(tx.send(Ok(2)));
        assert_eq!(rx.recv().await, Ok(2));
    }

    #[tokio::test]
    async fn test_buffer_keeps_first() {
        let (tx, rx) = response_channel::<u32>(Backpressure::Buffer);
        assert!(tx.send(Ok(1)));
        assert!(tx.send(Ok(2)));
        assert_eq!(rx.recv().await, Ok(1));
    }

    #[tokio::test]
    async fn test_drop_discards_overflow() {
        let (tx, rx) = response_channel::<u32>(Backpressure::Drop);
        assert!(tx.send(Ok(1)));
        // accepted but discarded
        assert!(tx.send(Ok(2)));
        assert_eq!(rx.recv().await, Ok(1));
    }

    #[tokio::test]
    async fn test_closed_receiver() {
        for policy in vec![Backpressure::Latest, Backpressure::Buffer, Backpressure::Drop] {
            let (tx, rx) = response_channel::<u32>(policy);
            drop(rx);
            assert!(tx.is_closed());
            assert!(!tx.send(Ok(1)));
        }
    }

    #[tokio::test]
    async fn test_dropped_sender() {
        let (tx, rx) = response_channel::<u32>(Backpressure::Buffer);
        drop(tx);
        assert_eq!(rx.recv().await, Err(ProtocolError::Closed));
    }
}
