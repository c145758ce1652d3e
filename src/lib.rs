#![cfg_attr(docsrs, feature(doc_cfg))]
//! This crate provides the engine of a worker taking part in federated learning cycles
//! run by a coordinator.
//!
//! In any given cycle, a worker applies on behalf of a job, that is a model it wants to
//! help train. The coordinator either accepts the job in the cycle, or rejects it and
//! tells the worker when to apply again. Accepted jobs download the plans and the model
//! of the cycle, train locally, and report the difference between the trained model and
//! the downloaded one.
//!
//! # Running a job
//!
//! A [`Worker`] is built from its components:
//!
//! - a [`ProtocolClient`] speaking the cycle protocol with the coordinator, over a
//!   persistent socket ([`protocol::socket::SocketClient`]) or over HTTP
//!   ([`protocol::http::HttpClient`])
//! - a [`Downloader`] fetching the cycle materials
//! - a [`ModelComputation`] computing diffs
//! - a [`ConstraintMonitor`] telling whether the device may take part in a cycle
//!
//! With the `reqwest-client` and `websocket` features, the clients can be created from
//! the settings with [`WorkerBuilder::with_default_clients`].
//!
//! The worker then creates jobs. A job notifies its subscriber of its progress through
//! [`JobStatusEvent`]s:
//!
//! ```rust,ignore
//! let worker = WorkerBuilder::new(settings.worker, monitor)
//!     .with_default_clients(&settings.api)?
//!     .computation(Arc::new(computation))
//!     .build()?;
//! let job = worker.new_job("mnist", Some("1.0".into()))?;
//! let mut events = job.events();
//! job.start(());
//! while let Some(event) = events.recv().await {
//!     match event {
//!         JobStatusEvent::Ready { model, .. } => {
//!             let trained = train(&model);
//!             let diff = job.create_diff(&trained)?;
//!             job.report(diff);
//!         }
//!         JobStatusEvent::Rejected { retry_after } => {
//!             job.dispose();
//!             // apply again with a new job after `retry_after`
//!         }
//!         _ => {}
//!     }
//! }
//! ```
//!
//! [`ProtocolClient`]: crate::protocol::ProtocolClient
//! [`Downloader`]: crate::protocol::Downloader
//! [`ModelComputation`]: crate::model::ModelComputation
//! [`ConstraintMonitor`]: crate::constraints::ConstraintMonitor

pub mod constraints;
pub mod job;
pub mod model;
pub mod protocol;
pub mod settings;
pub mod storage;
#[cfg(test)]
pub(crate) mod testutils;
pub mod worker;

pub use self::{
    constraints::{ConstraintMonitor, DeviceStateUpdater},
    job::{Job, JobError, JobIdentity, JobStatusEvent, JobStatusSubscriber},
    model::{Diff, ModelComputation, ModelState},
    settings::{Settings, SettingsError},
    worker::{Worker, WorkerBuilder, WorkerError},
};
