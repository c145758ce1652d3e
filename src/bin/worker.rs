use std::{convert::TryInto, path::PathBuf, process, sync::Arc};

use structopt::StructOpt;
use syft_worker::{
    constraints::{BatteryState, ConstraintMonitor, DeviceState, NetworkClass, NetworkState},
    model::{ComputationError, Diff, ModelComputation, ModelState},
    settings::Settings,
    JobStatusEvent,
    WorkerBuilder,
};
use tokio::{signal, sync::mpsc::UnboundedReceiver};
use tracing::{error, info, warn};
use tracing_subscriber::*;

#[derive(Debug, StructOpt)]
#[structopt(name = "Worker")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
    /// Name of the model to train
    #[structopt(short, long)]
    model: String,
    /// Version of the model, any version if omitted
    #[structopt(short, long)]
    version: Option<String>,
    /// Path of the trained model: little endian `f32` weights
    #[structopt(short, long, parse(from_os_str))]
    trained: PathBuf,
}

/// Diffs between models serialized as little endian `f32` weights.
struct WeightsDiff;

fn weights(state: &ModelState) -> Result<Vec<f32>, ComputationError> {
    let bytes: &[u8] = state.as_ref();
    if bytes.len() % 4 != 0 {
        return Err(ComputationError(format!(
            "{} bytes is not a whole number of weights",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .filter_map(|chunk| chunk.try_into().ok())
        .map(f32::from_le_bytes)
        .collect())
}

impl ModelComputation for WeightsDiff {
    fn create_diff(&self, original: &ModelState, trained: &ModelState) -> Result<Diff, ComputationError> {
        let (original, trained) = (weights(original)?, weights(trained)?);
        if original.len() != trained.len() {
            return Err(ComputationError(format!(
                "expected {} weights, got {}",
                original.len(),
                trained.len()
            )));
        }
        Ok(Diff::from(
            original
                .iter()
                .zip(trained.iter())
                .flat_map(|(original, trained)| (original - trained).to_le_bytes())
                .collect::<Vec<u8>>(),
        ))
    }
}

/// Follow the job until it ends. Returns whether it completed.
async fn run_job(job: syft_worker::Job, mut events: UnboundedReceiver<JobStatusEvent>, trained: PathBuf) -> bool {
    while let Some(event) = events.recv().await {
        match event {
            JobStatusEvent::Progress { downloaded, total } => info!("downloaded {}/{}", downloaded, total),
            JobStatusEvent::Ready { model, .. } => {
                info!("model {} ready in {}", model.model_id, model.path.display());
                let trained = match tokio::fs::read(&trained).await {
                    Ok(bytes) => ModelState::from(bytes),
                    Err(e) => {
                        error!("failed to read the trained model: {}", e);
                        job.dispose();
                        continue;
                    }
                };
                match job.create_diff(&trained) {
                    Ok(diff) => job.report(diff),
                    Err(e) => {
                        error!("failed to create the diff: {}", e);
                        job.dispose();
                    }
                }
            }
            JobStatusEvent::Rejected { retry_after } => {
                warn!("rejected from the cycle, retry in {:?}", retry_after);
                job.dispose();
            }
            JobStatusEvent::Error(e) => {
                error!("job failed: {}", e);
                return false;
            }
            JobStatusEvent::Complete => return true,
        }
    }
    false
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        api: api_settings,
        constraints,
        worker: worker_settings,
        log: log_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    // a command line worker runs on a wired, plugged machine
    let (monitor, _updater) = ConstraintMonitor::new(
        constraints,
        DeviceState {
            network: NetworkState {
                class: Some(NetworkClass::Ethernet),
                internet: true,
                metered: false,
                restricted: false,
            },
            battery: BatteryState {
                charging: true,
                level: 100,
            },
        },
    );

    let builder = WorkerBuilder::new(worker_settings, monitor)
        .with_default_clients(&api_settings)
        .unwrap_or_else(|err| {
            eprintln!("{}", err);
            process::exit(1);
        });
    let worker = builder
        .computation(Arc::new(WeightsDiff))
        .build()
        .unwrap_or_else(|err| {
            eprintln!("{}", err);
            process::exit(1);
        });
    let job = worker.new_job(opt.model, opt.version).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let events = job.events();
    job.start(());

    let completed = tokio::select! {
        completed = run_job(job, events, opt.trained) => completed,
        _ = signal::ctrl_c() => {
            warn!("shutting down: interrupted");
            false
        }
    };
    worker.dispose();
    if !completed {
        process::exit(1);
    }
}
