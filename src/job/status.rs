//! Delivery of job events to subscribers.
//!
//! Each subscription gets its own queue and delivery task, so callbacks of a
//! subscription run one after the other, in the order events were published. After the
//! first terminal event (an error or the completion of the job), nothing else is
//! delivered.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{runtime::Handle, sync::mpsc};
use tracing::{debug, warn};

use crate::{
    job::JobError,
    model::{Plan, SyftModel},
    protocol::ClientConfig,
};

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatusEvent {
    /// The materials of the cycle are available locally
    Ready {
        model: SyftModel,
        plans: HashMap<String, Plan>,
        client_config: ClientConfig,
    },
    /// A material was downloaded
    Progress { downloaded: usize, total: usize },
    /// The job was not admitted in the cycle. It may apply again after `retry_after`
    Rejected { retry_after: Duration },
    Error(JobError),
    Complete,
}

impl JobStatusEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Complete)
    }
}

/// A trait used by a [`Job`](crate::Job) to notify its subscribers. Every method
/// defaults to doing nothing.
pub trait JobStatusSubscriber: Send + 'static {
    /// Receive an event. By default, the event is dispatched to the method handling its
    /// kind.
    fn on_event(&mut self, event: JobStatusEvent) {
        match event {
            JobStatusEvent::Ready {
                model,
                plans,
                client_config,
            } => self.on_ready(model, plans, client_config),
            JobStatusEvent::Progress { downloaded, total } => self.on_progress(downloaded, total),
            JobStatusEvent::Rejected { retry_after } => self.on_rejected(retry_after),
            JobStatusEvent::Error(error) => self.on_error(error),
            JobStatusEvent::Complete => self.on_complete(),
        }
    }

    /// Emit a notification when the model, plans and training configuration of the
    /// cycle are available
    fn on_ready(&mut self, _model: SyftModel, _plans: HashMap<String, Plan>, _client_config: ClientConfig) {}
    /// Emit a notification when one of the `total` materials of the cycle is downloaded
    fn on_progress(&mut self, _downloaded: usize, _total: usize) {}
    /// Emit a notification when the coordinator turned the job down
    fn on_rejected(&mut self, _retry_after: Duration) {}
    fn on_error(&mut self, _error: JobError) {}
    fn on_complete(&mut self) {}
}

/// Ignores every event.
impl JobStatusSubscriber for () {}

/// Forwards every event to a channel.
impl JobStatusSubscriber for mpsc::UnboundedSender<JobStatusEvent> {
    fn on_event(&mut self, event: JobStatusEvent) {
        if let Err(e) = self.send(event) {
            warn!("failed to notify subscriber: {}", e);
        }
    }
}

#[derive(Default)]
struct PublisherState {
    subscribers: Vec<mpsc::UnboundedSender<JobStatusEvent>>,
    /// The terminal event, once published
    terminal: Option<JobStatusEvent>,
    ready_sent: bool,
    rejected_sent: bool,
}

pub(crate) struct StatusPublisher {
    state: Mutex<PublisherState>,
    handle: Handle,
}

impl StatusPublisher {
    /// Create a publisher running the callbacks on the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self {
            state: Mutex::new(PublisherState::default()),
            handle,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PublisherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscriber. If the terminal event was already published, the
    /// subscriber only receives that event.
    pub fn subscribe<S: JobStatusSubscriber>(&self, subscriber: S) {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            match state.terminal {
                Some(ref terminal) => {
                    let _ = tx.send(terminal.clone());
                }
                None => state.subscribers.push(tx),
            }
        }
        self.handle.spawn(deliver(subscriber, rx));
    }

    /// Publish an event to every subscriber. Returns `false` if the event was discarded.
    pub fn publish(&self, event: JobStatusEvent) -> bool {
        let mut state = self.lock();
        if state.terminal.is_some() {
            debug!("discarding {:?}: the job already terminated", event);
            return false;
        }
        match event {
            JobStatusEvent::Ready { .. } if state.ready_sent => {
                debug!("discarding duplicate ready event");
                return false;
            }
            JobStatusEvent::Ready { .. } => state.ready_sent = true,
            JobStatusEvent::Rejected { .. } if state.rejected_sent => {
                debug!("discarding duplicate rejection");
                return false;
            }
            JobStatusEvent::Rejected { .. } => state.rejected_sent = true,
            _ => {}
        }

        state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if event.is_terminal() {
            // dropping the senders ends the delivery tasks once their queues are drained
            state.subscribers.clear();
            state.terminal = Some(event);
        }
        true
    }
}

async fn deliver<S: JobStatusSubscriber>(mut subscriber: S, mut events: mpsc::UnboundedReceiver<JobStatusEvent>) {
    while let Some(event) = events.recv().await {
        let terminal = event.is_terminal();
        subscriber.on_event(event);
        if terminal {
            break;
        }
    }
}
