//! Download and local persistence of the materials of a cycle.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::{stream, StreamExt};
use tracing::{debug, info};

use crate::{
    job::{status::StatusPublisher, CycleMaterials, JobError, JobIdentity, JobStatusEvent},
    model::{ModelState, Plan, Protocol, SyftModel},
    protocol::{DownloadRequest, Downloader, Material, WorkerIdentity},
    storage::{Storage, StorageError},
};

pub(crate) const PLANS_DIRECTORY: &str = "plans";
pub(crate) const PROTOCOLS_DIRECTORY: &str = "protocols";
pub(crate) const MODELS_DIRECTORY: &str = "models";
pub(crate) const DIFFS_DIRECTORY: &str = "diffs";

/// Progress of the download of the cycle materials. It only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DownloadState {
    NotStarted,
    InProgress,
    Complete,
}

/// The materials of a cycle, once persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalMaterials {
    pub model: SyftModel,
    pub plans: HashMap<String, Plan>,
    pub protocols: HashMap<String, Protocol>,
}

pub(crate) struct JobRepository {
    state: Mutex<DownloadState>,
    materials: Mutex<Option<LocalMaterials>>,
    downloader: Arc<dyn Downloader>,
    storage: Arc<dyn Storage>,
    max_in_flight: usize,
}

/// Where a downloaded material goes.
enum Slot {
    Plan(String),
    Protocol(String),
    Model,
}

impl JobRepository {
    pub fn new(downloader: Arc<dyn Downloader>, storage: Arc<dyn Storage>, max_in_flight: usize) -> Self {
        Self {
            state: Mutex::new(DownloadState::NotStarted),
            materials: Mutex::new(None),
            downloader,
            storage,
            max_in_flight: max_in_flight.max(1),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, DownloadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> DownloadState {
        *self.lock_state()
    }

    /// Move to `InProgress`. Returns `false` if the download already started.
    fn begin(&self) -> bool {
        let mut state = self.lock_state();
        if *state != DownloadState::NotStarted {
            return false;
        }
        *state = DownloadState::InProgress;
        true
    }

    pub fn materials(&self) -> Option<LocalMaterials> {
        self.materials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Download every material of the cycle, persist them, and publish
    /// [`JobStatusEvent::Ready`]. Does nothing if a download already started.
    ///
    /// On failure, the state stays `InProgress`: a job only downloads once.
    pub async fn download_cycle_materials(
        &self,
        job: &JobIdentity,
        worker_id: &WorkerIdentity,
        cycle: &CycleMaterials,
        status: &StatusPublisher,
    ) -> Result<(), JobError> {
        if !self.begin() {
            debug!(job = %job, "download already started");
            return Ok(());
        }

        let mut requests = Vec::new();
        for (name, id) in &cycle.plans {
            requests.push((Slot::Plan(name.clone()), Material::Plan(id.clone())));
        }
        for (name, id) in &cycle.protocols {
            requests.push((Slot::Protocol(name.clone()), Material::Protocol(id.clone())));
        }
        requests.push((Slot::Model, Material::Model(cycle.model_id.clone())));
        let total = requests.len();
        info!(job = %job, "downloading {} materials", total);

        let downloads = requests.into_iter().map(|(slot, material)| {
            let downloader = Arc::clone(&self.downloader);
            let request = DownloadRequest {
                worker_id: worker_id.clone(),
                request_key: cycle.request_key.clone(),
                material: material.clone(),
            };
            async move { (slot, material, downloader.download(request).await) }
        });
        let mut downloads = stream::iter(downloads).buffer_unordered(self.max_in_flight);

        let mut plans = HashMap::new();
        let mut protocols = HashMap::new();
        let mut model = None;
        let mut downloaded = 0;
        while let Some((slot, material, result)) = downloads.next().await {
            let bytes = result.map_err(|e| JobError::DownloadFailure(format!("{}: {}", material.id(), e)))?;
            match slot {
                Slot::Plan(name) => {
                    let path = self.persist(PLANS_DIRECTORY, material.id(), bytes).await?;
                    let id = material.id().to_string();
                    plans.insert(name.clone(), Plan { name, id, path });
                }
                Slot::Protocol(name) => {
                    let path = self.persist(PROTOCOLS_DIRECTORY, material.id(), bytes).await?;
                    let id = material.id().to_string();
                    protocols.insert(name.clone(), Protocol { name, id, path });
                }
                Slot::Model => {
                    let path = self.persist(MODELS_DIRECTORY, material.id(), bytes.clone()).await?;
                    model = Some(SyftModel {
                        name: job.model_name.clone(),
                        version: job.version.clone(),
                        model_id: material.id().to_string(),
                        path,
                        state: ModelState::from(bytes),
                    });
                }
            }
            downloaded += 1;
            status.publish(JobStatusEvent::Progress { downloaded, total });
        }
        let model = model.ok_or_else(|| JobError::DownloadFailure("no model downloaded".into()))?;

        *self.materials.lock().unwrap_or_else(PoisonError::into_inner) = Some(LocalMaterials {
            model: model.clone(),
            plans: plans.clone(),
            protocols,
        });
        *self.lock_state() = DownloadState::Complete;
        info!(job = %job, "cycle materials ready");
        status.publish(JobStatusEvent::Ready {
            model,
            plans,
            client_config: cycle.client_config.clone(),
        });
        Ok(())
    }

    /// Keep the diff computed in the cycle of `request_key` until it is reported.
    pub fn stage_diff(&self, request_key: &str, diff: &[u8]) -> Result<PathBuf, StorageError> {
        self.storage.persist(DIFFS_DIRECTORY, &format!("{}.diff", request_key), diff)
    }

    async fn persist(&self, directory: &'static str, id: &str, data: Vec<u8>) -> Result<PathBuf, JobError> {
        self.persist_to_local_storage(directory, format!("{}.pb", id), data)
            .await
    }

    /// Write `data` under the storage root without blocking the runtime.
    pub async fn persist_to_local_storage(
        &self,
        directory: &'static str,
        name: String,
        data: Vec<u8>,
    ) -> Result<PathBuf, JobError> {
        let storage = Arc::clone(&self.storage);
        tokio::task::spawn_blocking(move || storage.persist(directory, &name, &data))
            .await
            .map_err(|e| JobError::DownloadFailure(format!("storage task failed: {}", e)))?
            .map_err(JobError::from)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::{runtime::Handle, sync::mpsc};

    use super::*;
    use crate::{
        protocol::{ClientConfig, MockDownloader, ProtocolError},
        storage::LocalStorage,
    };

    fn cycle() -> CycleMaterials {
        let mut plans = HashMap::new();
        plans.insert("training_plan".to_string(), "1".to_string());
        plans.insert("avg_plan".to_string(), "2".to_string());
        CycleMaterials {
            plans,
            protocols: HashMap::new(),
            model_id: "7".into(),
            request_key: "key".into(),
            client_config: ClientConfig::default(),
        }
    }

    fn job() -> JobIdentity {
        JobIdentity::new("mnist", Some("1.0".into()))
    }

    #[tokio::test]
    async fn test_download_persists_and_publishes_ready() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut downloader = MockDownloader::new();
        let counter = Arc::clone(&calls);
        downloader.expect_download().returning(move |request| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("content-{}", request.material.id()).into_bytes())
        });
        let repository = JobRepository::new(Arc::new(downloader), Arc::new(LocalStorage::new(dir.path())), 2);
        let status = StatusPublisher::new(Handle::current());
        let (tx, mut rx) = mpsc::unbounded_channel();
        status.subscribe(tx);

        repository
            .download_cycle_materials(&job(), &"w1".into(), &cycle(), &status)
            .await
            .unwrap();
        assert_eq!(repository.status(), DownloadState::Complete);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let mut progress = 0;
        let (model, plans) = loop {
            match rx.recv().await.unwrap() {
                JobStatusEvent::Progress { total, .. } => {
                    assert_eq!(total, 3);
                    progress += 1;
                }
                JobStatusEvent::Ready { model, plans, .. } => break (model, plans),
                other => panic!("unexpected event {:?}", other),
            }
        };
        assert_eq!(progress, 3);
        assert_eq!(model.model_id, "7");
        assert_eq!(model.path, dir.path().join("models").join("7.pb"));
        assert_eq!(model.state, ModelState::from(b"content-7".to_vec()));
        assert_eq!(plans["training_plan"].path, dir.path().join("plans").join("1.pb"));
        assert_eq!(std::fs::read(&plans["avg_plan"].path).unwrap(), b"content-2");

        // a second download is a no-op
        repository
            .download_cycle_materials(&job(), &"w1".into(), &cycle(), &status)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_download_stays_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let mut downloader = MockDownloader::new();
        downloader.expect_download().returning(|request| match request.material {
            Material::Model(_) => Err(ProtocolError::Server("not found".into())),
            _ => Ok(b"plan".to_vec()),
        });
        let repository = JobRepository::new(Arc::new(downloader), Arc::new(LocalStorage::new(dir.path())), 1);
        let status = StatusPublisher::new(Handle::current());

        let result = repository
            .download_cycle_materials(&job(), &"w1".into(), &cycle(), &status)
            .await;
        assert!(matches!(result, Err(JobError::DownloadFailure(_))));
        assert_eq!(repository.status(), DownloadState::InProgress);
        assert!(repository.materials().is_none());

        // no retry within the same job
        repository
            .download_cycle_materials(&job(), &"w1".into(), &cycle(), &status)
            .await
            .unwrap();
        assert_eq!(repository.status(), DownloadState::InProgress);
    }
}
