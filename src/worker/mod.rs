//! The worker: the entry point of the engine.
//!
//! A [`Worker`] owns the connection to the coordinator and the jobs created through it.
//! It authenticates once on behalf of all its jobs, applies for cycles, and routes the
//! cycle responses back to the jobs they concern.

use std::{
    future::Future,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        Weak,
    },
};

use thiserror::Error;
use tokio::{runtime::Handle, sync::OnceCell};
use tracing::{debug, info, warn};

use crate::{
    constraints::ConstraintMonitor,
    job::{Job, JobError, JobIdentity},
    model::ModelComputation,
    protocol::{
        AuthenticationRequest,
        AuthenticationResponse,
        Capabilities,
        CycleRequest,
        CycleResponse,
        Downloader,
        ProtocolClient,
        RelayClient,
        SpeedTest,
        WorkerIdentity,
    },
    settings::WorkerSettings,
    speed_test,
    storage::{LocalStorage, Storage},
};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("cannot run more than {0} jobs at the same time")]
    TooManyJobs(usize),
    #[error("the worker is disposed")]
    Disposed,
    #[error("no {0} was provided")]
    MissingComponent(&'static str),
    #[error("a worker must be built within a tokio runtime")]
    NoRuntime,
}

/// The runtimes on which the worker runs its network calls and notifies the job
/// subscribers.
#[derive(Debug, Clone)]
pub struct Schedulers {
    pub network: Handle,
    pub notification: Handle,
}

impl Schedulers {
    /// Use the runtime of the caller for everything.
    pub fn current() -> Result<Self, WorkerError> {
        let handle = Handle::try_current().map_err(|_| WorkerError::NoRuntime)?;
        Ok(Self {
            network: handle.clone(),
            notification: handle,
        })
    }
}

#[derive(Debug, Clone)]
struct Authentication {
    worker_id: WorkerIdentity,
    requires_speed_test: bool,
}

pub(crate) struct WorkerShared {
    client: Arc<dyn ProtocolClient>,
    relay: Option<Arc<dyn RelayClient>>,
    downloader: Arc<dyn Downloader>,
    speed_test: Option<Arc<dyn SpeedTest>>,
    storage: Arc<dyn Storage>,
    computation: Arc<dyn ModelComputation>,
    monitor: ConstraintMonitor,
    schedulers: Schedulers,
    settings: WorkerSettings,
    /// Set by the first successful authentication
    authentication: OnceCell<Authentication>,
    /// Jobs are looked up by identity matching, which is not an equivalence
    jobs: Mutex<Vec<(JobIdentity, Weak<crate::job::JobInner>)>>,
    disposed: AtomicBool,
}

impl WorkerShared {
    pub(crate) fn client(&self) -> Arc<dyn ProtocolClient> {
        Arc::clone(&self.client)
    }

    pub(crate) fn downloader(&self) -> Arc<dyn Downloader> {
        Arc::clone(&self.downloader)
    }

    pub(crate) fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    pub(crate) fn computation(&self) -> &dyn ModelComputation {
        self.computation.as_ref()
    }

    pub(crate) fn monitor(&self) -> &ConstraintMonitor {
        &self.monitor
    }

    pub(crate) fn download_concurrency(&self) -> usize {
        self.settings.download_concurrency
    }

    pub(crate) fn notification_handle(&self) -> Handle {
        self.schedulers.notification.clone()
    }

    pub(crate) fn worker_id(&self) -> Option<WorkerIdentity> {
        self.authentication.get().map(|auth| auth.worker_id.clone())
    }

    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedulers.network.spawn(future);
    }

    fn lock_jobs(&self) -> MutexGuard<'_, Vec<(JobIdentity, Weak<crate::job::JobInner>)>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove a disposed job from the index.
    pub(crate) fn forget(&self, job: &Arc<crate::job::JobInner>) {
        let target = Arc::downgrade(job);
        self.lock_jobs()
            .retain(|(_, inner)| inner.strong_count() > 0 && !inner.ptr_eq(&target));
    }

    /// The first live job matching the given model name and version.
    fn find_job(&self, model_name: &str, version: Option<&str>) -> Option<Job> {
        self.lock_jobs()
            .iter()
            .filter(|(identity, _)| identity.matches(model_name, version))
            .find_map(|(_, inner)| inner.upgrade())
            .map(Job::from_inner)
    }

    /// Authenticate once on behalf of every job. Concurrent callers share the same
    /// attempt, and a failed attempt is retried by the next caller.
    async fn authenticate(&self) -> Result<Authentication, JobError> {
        self.authentication
            .get_or_try_init(|| self.request_authentication())
            .await
            .map(Clone::clone)
    }

    async fn request_authentication(&self) -> Result<Authentication, JobError> {
        info!("authenticating with the coordinator");
        let request = AuthenticationRequest {
            auth_token: self.settings.auth_token.clone(),
        };
        match self.client.authenticate(request).await? {
            AuthenticationResponse::Success {
                worker_id,
                requires_speed_test,
            } => {
                info!(worker = %worker_id, "authenticated");
                Ok(Authentication {
                    worker_id,
                    requires_speed_test,
                })
            }
            AuthenticationResponse::Error { error } => Err(JobError::NetworkResponseFailure(error)),
        }
    }

    async fn capabilities(&self, auth: &Authentication) -> Result<Capabilities, JobError> {
        if !auth.requires_speed_test {
            return Ok(Capabilities::default());
        }
        match self.speed_test {
            Some(ref tester) => {
                speed_test::measure(tester.as_ref(), &auth.worker_id, self.settings.speed_test_sample_size)
                    .await
                    .map_err(|e| JobError::ConnectivityFailure(format!("speed test failed: {}", e)))
            }
            None => {
                warn!("the coordinator requires a speed test, but none is available");
                Ok(Capabilities::default())
            }
        }
    }

    /// Apply for a cycle on behalf of `job`, and hand the response over to the job it
    /// concerns.
    pub(crate) async fn execute_cycle_request(&self, job: Job) {
        if job.is_disposed() {
            debug!("job disposed before applying");
            return;
        }
        if !job.check_network() || !job.check_battery() {
            return;
        }

        let auth = match self.authenticate().await {
            Ok(auth) => auth,
            Err(e) => return job.publish_error(e),
        };
        if job.is_disposed() {
            debug!("job disposed while authenticating");
            return;
        }
        let capabilities = match self.capabilities(&auth).await {
            Ok(capabilities) => capabilities,
            Err(e) => return job.publish_error(e),
        };
        if job.is_disposed() {
            debug!("job disposed while measuring the capabilities");
            return;
        }

        let request = CycleRequest::new(auth.worker_id.clone(), job.identity(), capabilities);
        match self.client.request_cycle(request).await {
            Ok(response) => self.route_cycle_response(response, &job, auth.worker_id).await,
            Err(e) => job.publish_error(e.into()),
        }
    }

    /// Deliver a cycle response to the job it concerns. Responses that don't name a
    /// model concern the job that applied.
    async fn route_cycle_response(&self, response: CycleResponse, applicant: &Job, worker_id: WorkerIdentity) {
        let target = match response.model() {
            (Some(model), version) => self.find_job(model, version),
            (None, _) => Some(applicant.clone()).filter(|job| !job.is_disposed()),
        };
        let job = match target {
            Some(job) => job,
            None => {
                warn!("no job matches the cycle response, dropping it");
                return;
            }
        };

        match response {
            CycleResponse::Accepted(accept) => {
                if job.cycle_accepted(accept).await {
                    job.download_materials(worker_id).await;
                }
            }
            CycleResponse::Rejected(reject) => job.cycle_rejected(reject).await,
        }
    }
}

/// Builds a [`Worker`] from its components.
pub struct WorkerBuilder {
    settings: WorkerSettings,
    monitor: ConstraintMonitor,
    client: Option<Arc<dyn ProtocolClient>>,
    relay: Option<Arc<dyn RelayClient>>,
    downloader: Option<Arc<dyn Downloader>>,
    speed_test: Option<Arc<dyn SpeedTest>>,
    storage: Option<Arc<dyn Storage>>,
    computation: Option<Arc<dyn ModelComputation>>,
    schedulers: Option<Schedulers>,
}

impl WorkerBuilder {
    pub fn new(settings: WorkerSettings, monitor: ConstraintMonitor) -> Self {
        Self {
            settings,
            monitor,
            client: None,
            relay: None,
            downloader: None,
            speed_test: None,
            storage: None,
            computation: None,
            schedulers: None,
        }
    }

    /// The client carrying the cycle protocol. Required.
    pub fn protocol_client(mut self, client: Arc<dyn ProtocolClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn relay_client(mut self, relay: Arc<dyn RelayClient>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// The client fetching the cycle materials. Required.
    pub fn downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn speed_test(mut self, speed_test: Arc<dyn SpeedTest>) -> Self {
        self.speed_test = Some(speed_test);
        self
    }

    /// Where the materials are persisted. Defaults to the files directory of the
    /// settings.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// How diffs are computed. Required.
    pub fn computation(mut self, computation: Arc<dyn ModelComputation>) -> Self {
        self.computation = Some(computation);
        self
    }

    /// Defaults to the runtime of the caller of [`WorkerBuilder::build`].
    pub fn schedulers(mut self, schedulers: Schedulers) -> Self {
        self.schedulers = Some(schedulers);
        self
    }

    pub fn build(self) -> Result<Worker, WorkerError> {
        let client = self.client.ok_or(WorkerError::MissingComponent("protocol client"))?;
        let downloader = self.downloader.ok_or(WorkerError::MissingComponent("downloader"))?;
        let computation = self.computation.ok_or(WorkerError::MissingComponent("model computation"))?;
        let schedulers = match self.schedulers {
            Some(schedulers) => schedulers,
            None => Schedulers::current()?,
        };
        let files_dir: PathBuf = self.settings.files_dir.clone();
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(LocalStorage::new(files_dir)));

        Ok(Worker {
            shared: Arc::new(WorkerShared {
                client,
                relay: self.relay,
                downloader,
                speed_test: self.speed_test,
                storage,
                computation,
                monitor: self.monitor,
                schedulers,
                settings: self.settings,
                authentication: OnceCell::new(),
                jobs: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
            }),
        })
    }
}

/// Creates jobs and applies for cycles on their behalf.
#[derive(Clone)]
pub struct Worker {
    shared: Arc<WorkerShared>,
}

impl Worker {
    /// Create a job for the given model.
    ///
    /// # Errors
    /// Fails if the worker is disposed, or if it already runs as many jobs as allowed.
    pub fn new_job<S: Into<String>>(&self, model_name: S, version: Option<String>) -> Result<Job, WorkerError> {
        if self.is_disposed() {
            return Err(WorkerError::Disposed);
        }
        let identity = JobIdentity::new(model_name, version);
        let mut jobs = self.shared.lock_jobs();
        jobs.retain(|(_, inner)| inner.strong_count() > 0);
        let max = self.shared.settings.max_concurrent_jobs;
        if jobs.len() >= max {
            warn!(job = %identity, "cannot create job: {} jobs already running", jobs.len());
            return Err(WorkerError::TooManyJobs(max));
        }
        let job = Job::new(identity.clone(), Arc::clone(&self.shared));
        jobs.push((identity, Arc::downgrade(job.inner())));
        debug!(job = %job.identity(), "job created");
        Ok(job)
    }

    /// A live job matching the given model name and version, if any.
    pub fn job(&self, model_name: &str, version: Option<&str>) -> Option<Job> {
        self.shared.find_job(model_name, version)
    }

    /// The identity assigned by the coordinator, once authenticated.
    pub fn worker_id(&self) -> Option<WorkerIdentity> {
        self.shared.worker_id()
    }

    /// The client carrying the signalling messages between workers, if any.
    pub fn relay(&self) -> Option<Arc<dyn RelayClient>> {
        self.shared.relay.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    /// Dispose of every job and close the connection to the coordinator. Disposing more
    /// than once does nothing.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            debug!("worker already disposed");
            return;
        }
        let jobs: Vec<Job> = self
            .shared
            .lock_jobs()
            .drain(..)
            .filter_map(|(_, inner)| inner.upgrade())
            .map(Job::from_inner)
            .collect();
        for job in jobs {
            job.dispose();
        }
        self.shared.client.close();
        info!("worker disposed");
    }
}

#[cfg(all(feature = "reqwest-client", feature = "websocket"))]
mod clients {
    use std::sync::Arc;

    use thiserror::Error;
    use url::Url;

    use super::WorkerBuilder;
    use crate::{
        protocol::{
            http::{new_client, ClientError},
            socket::{SocketClient, TransportError},
            websocket::WebSocketConnector,
            ProtocolClient,
        },
        settings::{ApiSettings, Transport},
    };

    #[derive(Debug, Error)]
    pub enum ClientSetupError {
        #[error(transparent)]
        Http(#[from] ClientError),
        #[error(transparent)]
        Socket(#[from] TransportError),
        #[error("invalid socket URL: {0}")]
        SocketUrl(#[from] url::ParseError),
    }

    impl WorkerBuilder {
        /// Use the `reqwest` and websocket clients configured by `api`.
        ///
        /// The downloads and the speed test always go over HTTP, and the signalling
        /// messages always go over the websocket.
        pub fn with_default_clients(self, api: &ApiSettings) -> Result<Self, ClientSetupError> {
            let http = Arc::new(new_client(&api.url, api.trust_anchor.as_deref(), api.timeout())?);
            let connector = match api.socket_url {
                Some(ref url) => WebSocketConnector::new(Url::parse(url)?),
                None => WebSocketConnector::from_http_url(&Url::parse(&api.url)?)?,
            };
            let socket = Arc::new(SocketClient::new(connector, api.timeout()));
            let client: Arc<dyn ProtocolClient> = match api.transport {
                Transport::Socket => socket.clone(),
                Transport::Http => http.clone(),
            };
            Ok(self
                .protocol_client(client)
                .relay_client(socket)
                .downloader(http.clone())
                .speed_test(http))
        }
    }
}

#[cfg(all(feature = "reqwest-client", feature = "websocket"))]
pub use self::clients::ClientSetupError;
