pub mod distributed;
pub mod local;
pub mod slurm;

use crate::{
    config::{ConfigErrors, RunnerConfig},
    distributed::broker::BrokerError,
    job::{Backend, Job, JobStatus},
    launch::LaunchError,
    logs::LogMap,
};
use std::{
    collections::BTreeMap,
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to launch job")]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("Broker failure")]
    Broker(#[from] BrokerError),
    #[error("Timed out after {after:?} waiting for {waiting_for}")]
    Timeout { waiting_for: String, after: Duration },
    #[error("Remote command failed with status {status:?}: {stderr}")]
    Remote { status: Option<i32>, stderr: String },
    #[error("Backend {0} is not configured")]
    Unavailable(Backend),
    #[error("No job with handle {0} is known to this platform")]
    UnknownHandle(String),
    #[error("Job {0} has no output directory to resume from")]
    MissingOutput(String),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

/// Outcome of a successful submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub handle: String,
    pub status: JobStatus,
}

/// An execution backend
///
/// Implementations never touch the job store. They report through return values and through the
/// job slices they are handed, the orchestrator decides what gets persisted.
pub trait ComputePlatform: Send + Sync + fmt::Debug {
    /// Start a job. A first submission assigns `job.output_path`, a resume reuses it.
    fn submit(&self, job: &mut Job, resume: bool) -> Result<Submission, PlatformError>;

    /// Request cancellation. `Some` if the platform could settle the status right away.
    fn cancel(&self, job: &Job) -> Result<Option<JobStatus>, PlatformError>;

    /// Refresh `status` (and where known `worker`/`output_path`) of all `jobs` in one round trip
    fn update_statuses(&self, jobs: &mut [Job]) -> Result<(), PlatformError>;

    fn fetch_logs(&self, job: &Job) -> Result<LogMap, PlatformError>;

    /// Drop all platform bookkeeping and the output directory
    fn delete(&self, job: &Job) -> Result<(), PlatformError>;
}

/// `<root>/<job uuid>` for a first submission, the recorded path for a resume
pub(crate) fn output_path_for(root: &Path, job: &Job, resume: bool) -> Result<PathBuf, PlatformError> {
    match (&job.output_path, resume) {
        (Some(path), true) => Ok(path.clone()),
        (None, true) => Err(PlatformError::MissingOutput(job.name.clone())),
        (_, false) => Ok(root.join(job.uuid.to_string())),
    }
}

/// All configured backends, built once at startup
#[derive(Debug, Default)]
pub struct Platforms {
    platforms: BTreeMap<Backend, Box<dyn ComputePlatform>>,
}

impl Platforms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RunnerConfig) -> Result<Self, ConfigErrors> {
        let mut platforms = Self::new();

        platforms.register(
            Backend::Local,
            local::LocalPlatform::new(
                config.output_root.clone(),
                config.interpreter.clone(),
                config.scripts_path.clone(),
            ),
        );

        for (backend, slurm) in [
            (Backend::SlurmA, &config.slurm_a),
            (Backend::SlurmB, &config.slurm_b),
        ] {
            if let Some(slurm) = slurm {
                platforms.register(backend, slurm::SlurmPlatform::from_config(slurm)?);
            }
        }

        if let Some(distributed) = &config.distributed {
            let broker = crate::distributed::broker::Broker::open(
                &distributed.broker,
                distributed.poll_interval(),
            )?;

            platforms.register(
                Backend::Distributed,
                distributed::DistributedPlatform::new(
                    Arc::new(broker),
                    config.output_root.clone(),
                    distributed,
                ),
            );
        }

        info!(backends = ?platforms.backends(), "Configured platforms");

        Ok(platforms)
    }

    /// add or replace the implementation of `backend`
    pub fn register(&mut self, backend: Backend, platform: impl ComputePlatform + 'static) {
        self.platforms.insert(backend, Box::new(platform));
    }

    pub fn get(&self, backend: Backend) -> Result<&dyn ComputePlatform, PlatformError> {
        self.platforms
            .get(&backend)
            .map(|platform| platform.as_ref())
            .ok_or(PlatformError::Unavailable(backend))
    }

    pub fn backends(&self) -> Vec<Backend> {
        self.platforms.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRequest;

    fn job() -> Job {
        Job::new(JobRequest {
            name: "a".into(),
            backend: Backend::Local,
            script: "train.py".into(),
            config: serde_yaml::Value::Null,
        })
    }

    #[test]
    fn output_path_is_named_after_the_job_uuid() {
        let mut job = job();
        let root = Path::new("/out");

        let path = output_path_for(root, &job, false).unwrap();
        assert_eq!(path, root.join(job.uuid.to_string()));

        assert!(matches!(
            output_path_for(root, &job, true),
            Err(PlatformError::MissingOutput(_))
        ));

        job.output_path = Some(PathBuf::from("/elsewhere"));
        assert_eq!(
            output_path_for(root, &job, true).unwrap(),
            PathBuf::from("/elsewhere")
        );
    }

    #[test]
    fn unconfigured_backends_are_unavailable() {
        let mut config = RunnerConfig::default();
        config.output_root = PathBuf::from("/out");
        let platforms = Platforms::from_config(&config).unwrap();

        assert_eq!(platforms.backends(), vec![Backend::Local]);
        assert!(platforms.get(Backend::Local).is_ok());
        assert!(matches!(
            platforms.get(Backend::SlurmB),
            Err(PlatformError::Unavailable(Backend::SlurmB))
        ));
    }
}
