use crate::logs::{LogMap, Metrics, Progress};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::{fmt, path::PathBuf, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

/// Sequential id assigned by the job store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown backend `{0}`, expected one of local, slurm-a, slurm-b, distributed")]
pub struct UnknownBackend(pub String);

/// Execution backend a job is bound to for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    Local,
    SlurmA,
    SlurmB,
    Distributed,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::SlurmA => "slurm-a",
            Self::SlurmB => "slurm-b",
            Self::Distributed => "distributed",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = UnknownBackend;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "slurm-a" | "slurm_a" => Ok(Self::SlurmA),
            "slurm-b" | "slurm_b" => Ok(Self::SlurmB),
            "distributed" => Ok(Self::Distributed),
            _ => Err(UnknownBackend(value.to_owned())),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown job status `{0}`")]
pub struct UnknownStatus(pub String);

/// Authoritative job status
///
/// `Waiting`, `Running` and `Unknown` form the active set, every other status is terminal and
/// frozen for reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Waiting,
    Running,
    Finished,
    Crashed,
    Cancelled,
    /// failed before the job process was started
    RunFailed,
    /// removed by the scheduler, e.g. time limit exceeded
    Removed,
    /// can neither be confirmed dead nor alive, never updated again
    Lost,
    /// temporarily unknown, e.g. consumed by a worker that did not report it yet
    Unknown,
}

impl JobStatus {
    pub const ACTIVE: [JobStatus; 3] = [JobStatus::Waiting, JobStatus::Running, JobStatus::Unknown];

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// whether a reconciliation pass may move a job from `self` to `next`
    pub fn accepts(self, next: JobStatus) -> bool {
        match (self, next) {
            (current, _) if current.is_terminal() => false,
            // a late queue report must not roll back a started job
            (JobStatus::Running, JobStatus::Waiting) => false,
            _ => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Finished => "Finished",
            Self::Crashed => "Crashed",
            Self::Cancelled => "Cancelled",
            Self::RunFailed => "RunFailed",
            Self::Removed => "Removed",
            Self::Lost => "Lost",
            Self::Unknown => "Unknown",
        }
    }

    pub fn abbrev(&self) -> &'static str {
        &self.as_str()[..4]
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        [
            Self::Waiting,
            Self::Running,
            Self::Finished,
            Self::Crashed,
            Self::Cancelled,
            Self::RunFailed,
            Self::Removed,
            Self::Lost,
            Self::Unknown,
        ]
        .into_iter()
        .find(|status| status.as_str() == value)
        .ok_or_else(|| UnknownStatus(value.to_owned()))
    }
}

/// Submission request handed over by the dashboard or CLI
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub name: String,
    pub backend: Backend,
    pub script: PathBuf,
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub uuid: Uuid,
    pub name: String,
    pub backend: Backend,
    pub script: PathBuf,
    pub config: Value,
    /// platform specific id, empty until submitted
    pub handle: String,
    /// worker that last reported on this job
    pub worker: String,
    pub output_path: Option<PathBuf>,
    pub status: JobStatus,
    pub progress: Progress,
    pub metrics: Metrics,
    /// raw logs that were not consumed by the interpreter (stdout, stderr, ...)
    pub logs: LogMap,
    pub is_archived: bool,
    /// consecutive reconciliation passes spent in `Unknown`
    pub missed_passes: u32,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        Self {
            id: JobId(0),
            uuid: Uuid::new_v4(),
            name: request.name,
            backend: request.backend,
            script: request.script,
            config: request.config,
            handle: String::new(),
            worker: String::new(),
            output_path: None,
            status: JobStatus::Waiting,
            progress: Progress::default(),
            metrics: Metrics::default(),
            logs: LogMap::new(),
            is_archived: false,
            missed_passes: 0,
        }
    }

    pub fn is_submitted(&self) -> bool {
        !self.handle.is_empty()
    }

    /// look up a dotted path such as `training.num_epochs` in the job configuration
    pub fn config_value(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.config, |value, key| value.get(key))
    }
}
