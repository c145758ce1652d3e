//! Jobs: the participation of this worker in the training cycles of one model.
//!
//! A job goes through the following states:
//!
//! ```text
//!               accepted            report sent / error / dispose
//!   Applying ------------> Accepted -------------------------------> Disposed
//!       |
//!       | rejected
//!       v
//!   Rejected(retry after) ---------------- dispose --------------------^
//! ```
//!
//! Independently, the download of the cycle materials moves from `NotStarted` to
//! `InProgress` to `Complete`.

mod error;
mod identity;
pub(crate) mod repository;
pub(crate) mod status;

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

pub use self::{
    error::{DiffError, JobError},
    identity::JobIdentity,
    repository::{DownloadState, LocalMaterials},
    status::{JobStatusEvent, JobStatusSubscriber},
};
use self::{repository::JobRepository, status::StatusPublisher};
use crate::{
    model::{Diff, ModelState},
    protocol::{ClientConfig, CycleAccept, CycleReject, ReportRequest, ReportResponse, WorkerIdentity},
    worker::WorkerShared,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// No cycle response was received yet
    Applying,
    Accepted,
    Rejected { retry_after: Duration },
    Disposed,
}

/// What the coordinator handed out when accepting the job in a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleMaterials {
    /// Plan ids, by plan name
    pub plans: HashMap<String, String>,
    /// Protocol ids, by protocol name
    pub protocols: HashMap<String, String>,
    pub model_id: String,
    /// Key authenticating the downloads and the report of this cycle
    pub request_key: String,
    pub client_config: ClientConfig,
}

impl From<CycleAccept> for CycleMaterials {
    fn from(accept: CycleAccept) -> Self {
        Self {
            plans: accept.plans,
            protocols: accept.protocols,
            model_id: accept.model_id,
            request_key: accept.request_key,
            client_config: accept.client_config,
        }
    }
}

struct JobState {
    cycle: CycleState,
    /// Set at most once, upon acceptance
    materials: Option<CycleMaterials>,
}

pub(crate) struct JobInner {
    identity: JobIdentity,
    worker: Arc<WorkerShared>,
    state: Mutex<JobState>,
    /// Serializes the handling of cycle responses
    transition: tokio::sync::Mutex<()>,
    repository: JobRepository,
    status: StatusPublisher,
    cancel: CancellationToken,
}

/// A handle to a job. Handles are cheap to clone and all refer to the same job.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    pub(crate) fn new(identity: JobIdentity, worker: Arc<WorkerShared>) -> Self {
        let repository = JobRepository::new(worker.downloader(), worker.storage(), worker.download_concurrency());
        let status = StatusPublisher::new(worker.notification_handle());
        Self {
            inner: Arc::new(JobInner {
                identity,
                worker,
                state: Mutex::new(JobState {
                    cycle: CycleState::Applying,
                    materials: None,
                }),
                transition: tokio::sync::Mutex::new(()),
                repository,
                status,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<JobInner> {
        &self.inner
    }

    pub(crate) fn from_inner(inner: Arc<JobInner>) -> Self {
        Self { inner }
    }

    fn lock_state(&self) -> MutexGuard<'_, JobState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn identity(&self) -> &JobIdentity {
        &self.inner.identity
    }

    pub fn cycle_state(&self) -> CycleState {
        self.lock_state().cycle
    }

    pub fn download_state(&self) -> DownloadState {
        self.inner.repository.status()
    }

    /// The materials announced by the coordinator, once the job is accepted.
    pub fn cycle_materials(&self) -> Option<CycleMaterials> {
        self.lock_state().materials.clone()
    }

    /// The model, plans and protocols of the cycle, once downloaded.
    pub fn local_materials(&self) -> Option<LocalMaterials> {
        self.inner.repository.materials()
    }

    pub fn is_disposed(&self) -> bool {
        self.cycle_state() == CycleState::Disposed
    }

    /// Register a subscriber without applying for a cycle.
    pub fn subscribe<S: JobStatusSubscriber>(&self, subscriber: S) {
        self.inner.status.subscribe(subscriber);
    }

    /// Same as [`Job::subscribe`], with the events forwarded to a channel.
    pub fn events(&self) -> tokio::sync::mpsc::UnboundedReceiver<JobStatusEvent> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.subscribe(tx);
        rx
    }

    /// Subscribe to the job and apply for a cycle.
    ///
    /// A disposed job only notifies `subscriber` of a
    /// [`JobError::RunningDisposedJob`] error. A rejected job does nothing until it is
    /// disposed: applying again is up to a new job, after the retry delay.
    pub fn start<S: JobStatusSubscriber>(&self, mut subscriber: S) {
        match self.cycle_state() {
            CycleState::Disposed => {
                error!(job = %self.identity(), "cannot start a disposed job");
                subscriber.on_event(JobStatusEvent::Error(JobError::RunningDisposedJob));
                return;
            }
            CycleState::Rejected { retry_after } => {
                debug!(
                    job = %self.identity(),
                    "job was rejected, waiting {:?} before applying again", retry_after
                );
                return;
            }
            CycleState::Applying | CycleState::Accepted => {}
        }

        self.subscribe(subscriber);
        let job = self.clone();
        let span = tracing::info_span!("cycle_request", job = %self.identity());
        self.spawn(async move {
            let worker = Arc::clone(&job.inner.worker);
            worker.execute_cycle_request(job).await
        }
        .instrument(span));
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.worker.spawn(future);
    }

    /// Record the acceptance in a cycle. Returns `false` if the acceptance was ignored,
    /// because the job is disposed or was already accepted.
    pub(crate) async fn cycle_accepted(&self, accept: CycleAccept) -> bool {
        let _transition = self.inner.transition.lock().await;
        let mut state = self.lock_state();
        match state.cycle {
            CycleState::Applying if state.materials.is_none() => {
                info!(job = %self.identity(), request_key = %accept.request_key, "accepted in cycle");
                state.materials = Some(CycleMaterials::from(accept));
                state.cycle = CycleState::Accepted;
                true
            }
            CycleState::Disposed => {
                debug!(job = %self.identity(), "ignoring cycle acceptance: job disposed");
                false
            }
            _ => {
                warn!(job = %self.identity(), "ignoring cycle acceptance: already handled a cycle response");
                false
            }
        }
    }

    /// Record the rejection from a cycle and notify the subscribers.
    pub(crate) async fn cycle_rejected(&self, reject: CycleReject) {
        let _transition = self.inner.transition.lock().await;
        {
            let mut state = self.lock_state();
            match state.cycle {
                CycleState::Applying => {
                    state.cycle = CycleState::Rejected {
                        retry_after: reject.retry_after,
                    }
                }
                CycleState::Disposed => {
                    debug!(job = %self.identity(), "ignoring cycle rejection: job disposed");
                    return;
                }
                _ => {
                    warn!(job = %self.identity(), "ignoring cycle rejection: already handled a cycle response");
                    return;
                }
            }
        }
        info!(job = %self.identity(), "rejected from cycle, retry after {:?}", reject.retry_after);
        self.inner.status.publish(JobStatusEvent::Rejected {
            retry_after: reject.retry_after,
        });
    }

    /// Download the materials of the cycle the job was accepted in.
    pub(crate) async fn download_materials(&self, worker_id: WorkerIdentity) {
        let materials = {
            let state = self.lock_state();
            match state.cycle {
                CycleState::Accepted => state.materials.clone(),
                _ => None,
            }
        };
        let materials = match materials {
            Some(materials) => materials,
            None => {
                self.publish_error(JobError::CycleNotAccepted(
                    "cycle not accepted, download cannot start".into(),
                ));
                return;
            }
        };

        let download = self.inner.repository.download_cycle_materials(
            self.identity(),
            &worker_id,
            &materials,
            &self.inner.status,
        );
        tokio::select! {
            _ = self.inner.cancel.cancelled() => {
                debug!(job = %self.identity(), "download abandoned: job disposed");
            }
            result = download => {
                if let Err(e) = result {
                    self.publish_error(e);
                }
            }
        }
    }

    /// Compute the diff between the downloaded model and `trained`, and stage it
    /// locally until it is reported.
    pub fn create_diff(&self, trained: &ModelState) -> Result<Diff, DiffError> {
        if self.is_disposed() {
            return Err(JobError::RunningDisposedJob.into());
        }
        let (materials, cycle) = match (self.inner.repository.materials(), self.cycle_materials()) {
            (Some(materials), Some(cycle)) if self.download_state() == DownloadState::Complete => {
                (materials, cycle)
            }
            _ => {
                return Err(JobError::CycleNotAccepted("the cycle materials are not downloaded".into()).into())
            }
        };
        let diff = self
            .inner
            .worker
            .computation()
            .create_diff(&materials.model.state, trained)?;
        let path = self.inner.repository.stage_diff(&cycle.request_key, diff.as_bytes())?;
        debug!(job = %self.identity(), "diff staged in {}", path.display());
        Ok(diff)
    }

    /// Send the diff to the coordinator. The device constraints are checked first:
    /// if they are not satisfied, nothing is sent and the job fails.
    ///
    /// Once the coordinator acknowledges the report, the job completes.
    pub fn report(&self, diff: Diff) {
        if self.is_disposed() {
            warn!(job = %self.identity(), "cannot report: job disposed");
            return;
        }
        if !self.check_network() || !self.check_battery() {
            return;
        }
        let (worker_id, request_key) = match (self.inner.worker.worker_id(), self.cycle_materials()) {
            (Some(worker_id), Some(materials)) => (worker_id, materials.request_key),
            _ => {
                self.publish_error(JobError::CycleNotAccepted("cannot report outside of a cycle".into()));
                return;
            }
        };

        let request = ReportRequest {
            worker_id,
            request_key,
            diff: diff.to_base64(),
        };
        let job = self.clone();
        let span = tracing::info_span!("report", job = %self.identity());
        self.spawn(async move { job.send_report(request).await }.instrument(span));
    }

    async fn send_report(&self, request: ReportRequest) {
        info!("sending report");
        match self.inner.worker.client().report(request).await {
            Err(e) => self.publish_error(e.into()),
            Ok(ReportResponse { error: Some(error), .. }) => {
                self.publish_error(JobError::NetworkResponseFailure(error))
            }
            Ok(ReportResponse {
                status: Some(status), ..
            }) => {
                info!("report acknowledged: {}", status);
                self.dispose();
            }
            Ok(_) => self.publish_error(JobError::NetworkResponseFailure("empty report response".into())),
        }
    }

    /// Fail the job if the network constraints are not satisfied.
    pub(crate) fn check_network(&self) -> bool {
        if self.inner.worker.monitor().is_network_eligible() {
            return true;
        }
        self.publish_error(JobError::NetworkConstraintsFailure);
        false
    }

    /// Fail the job if the battery constraints are not satisfied.
    pub(crate) fn check_battery(&self) -> bool {
        if self.inner.worker.monitor().is_battery_eligible() {
            return true;
        }
        self.publish_error(JobError::BatteryConstraintsFailure);
        false
    }

    /// Dispose of the job: the subscribers are notified of its completion, and the job
    /// stops reacting to responses. Disposing more than once does nothing.
    pub fn dispose(&self) {
        if !self.mark_disposed() {
            debug!(job = %self.identity(), "job already disposed");
            return;
        }
        self.inner.status.publish(JobStatusEvent::Complete);
        info!(job = %self.identity(), "job disposed");
    }

    /// Notify the subscribers of an error and dispose of the job.
    pub(crate) fn publish_error(&self, error: JobError) {
        if !self.mark_disposed() {
            debug!(job = %self.identity(), "ignoring error for disposed job: {}", error);
            return;
        }
        warn!(job = %self.identity(), "job failed: {}", error);
        self.inner.status.publish(JobStatusEvent::Error(error));
    }

    /// Move to `Disposed`. Returns `false` if the job already was.
    fn mark_disposed(&self) -> bool {
        {
            let mut state = self.lock_state();
            if state.cycle == CycleState::Disposed {
                return false;
            }
            state.cycle = CycleState::Disposed;
        }
        self.inner.cancel.cancel();
        self.inner.worker.forget(&self.inner);
        true
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("identity", &self.inner.identity)
            .field("cycle", &self.cycle_state())
            .field("download", &self.download_state())
            .finish()
    }
}
