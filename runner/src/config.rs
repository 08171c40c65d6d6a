use serde::{Deserialize, Serialize};
use std::{
    env,
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info, warn};

pub const OUTPUT_ROOT_VAR: &str = "DROVER_OUTPUT";
pub const SCRIPTS_PATH_VAR: &str = "DROVER_SCRIPTS_PATH";

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

/// Find `script` either as given or below one of the `search_path` directories
pub fn resolve_script(script: &Path, search_path: &[PathBuf]) -> Result<PathBuf, ConfigErrors> {
    if script.is_absolute() {
        return if script.is_file() {
            Ok(script.to_path_buf())
        } else {
            Err(ConfigErrors::ScriptNotFound(script.to_path_buf()))
        };
    }

    search_path
        .iter()
        .map(|directory| directory.join(script))
        .chain(std::iter::once(script.to_path_buf()))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| ConfigErrors::ScriptNotFound(script.to_path_buf()))
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file")]
    ReadConfig(#[source] Error),
    #[error("Failed to parse config file")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Script {0:?} was not found in the scripts path")]
    ScriptNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
    #[error("Failed to load template {path:?}")]
    Template {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("Failed to open the broker database")]
    Broker(#[from] crate::distributed::broker::BrokerError),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // root directory for all job output directories, overridden by $DROVER_OUTPUT
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    // directories searched for relative script paths, extended by $DROVER_SCRIPTS_PATH
    #[serde(default)]
    pub scripts_path: Vec<PathBuf>,
    // command prefixed to every script, e.g. ["python"], empty to execute scripts directly
    #[serde(default)]
    pub interpreter: Vec<String>,
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    pub slurm_a: Option<SlurmConfig>,
    pub slurm_b: Option<SlurmConfig>,
    pub distributed: Option<DistributedConfig>,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SlurmConfig {
    // ssh destination, e.g. user@cluster.example.org
    pub server: String,
    // directory on the cluster holding the job directories
    pub remote_root: String,
    // custom templates, the bundled ones are used if not set
    pub submission_template: Option<PathBuf>,
    pub setup_template: Option<PathBuf>,
    #[serde(default = "default_ssh_timeout")]
    pub timeout_secs: u64,
    // command prefixed to the script inside the batch job, the cluster has its own environment
    #[serde(default = "default_remote_interpreter")]
    pub interpreter: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DistributedConfig {
    // SQLite file on storage shared by the orchestrator and all workers
    pub broker: PathBuf,
    // names of all workers consuming the job queue
    #[serde(default)]
    pub workers: Vec<String>,
    #[serde(default = "default_status_timeout")]
    pub status_timeout_ms: u64,
    #[serde(default = "default_status_timeout")]
    pub logs_timeout_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    // number of jobs a single worker runs at the same time
    #[serde(default = "default_slots")]
    pub slots: usize,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,
    // SIGKILL a cancelled job that ignored SIGTERM for this long, null disables escalation
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: Option<u64>,
    // worker-local record database, defaults to ~/drover/<hostname>_<worker>.db
    pub records: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ReconcileConfig {
    // consecutive passes a job may stay Unknown before it is marked Lost, 0 disables
    #[serde(default = "default_lost_after_passes")]
    pub lost_after_passes: u32,
    // dotted path to the total number of epochs inside a job config
    #[serde(default = "default_epochs_key")]
    pub epochs_key: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
            scripts_path: Vec::new(),
            interpreter: Vec::new(),
            lock_dir: default_lock_dir(),
            slurm_a: None,
            slurm_b: None,
            distributed: None,
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            slots: default_slots(),
            monitor_interval_ms: default_monitor_interval(),
            kill_grace_secs: default_kill_grace(),
            records: None,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            lost_after_passes: default_lost_after_passes(),
            epochs_key: default_epochs_key(),
        }
    }
}

impl RunnerConfig {
    /// load a YAML config file and apply the environment overrides
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(ConfigErrors::ReadConfig)?;
        let mut config: Self = serde_yaml::from_reader(file)?;
        config.apply_env();

        info!(path = ?path, output_root = ?config.output_root, "Loaded config");

        Ok(config)
    }

    /// defaults with the environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();

        config
    }

    fn apply_env(&mut self) {
        if let Some(root) = env::var_os(OUTPUT_ROOT_VAR) {
            self.output_root = PathBuf::from(root);
        }

        if let Some(paths) = env::var_os(SCRIPTS_PATH_VAR) {
            self.scripts_path.extend(env::split_paths(&paths));
        }
    }

    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if !self.output_root.is_absolute() {
            warn!(
                "output_root {:?} is relative, job directories will depend on the working directory",
                self.output_root
            );
        }

        for directory in self.scripts_path.iter() {
            if !directory.is_dir() {
                warn!("scripts_path entry {directory:?} is not a directory");
            }
        }

        if let Some(interpreter) = self.interpreter.first() {
            let path = PathBuf::from(interpreter);

            if path.is_absolute() {
                match check_executable(&path) {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("interpreter {path:?} is not executable");
                        contains_error = true;
                    }
                    Err(e) => {
                        error!("Failed to check interpreter {path:?}: {e}");
                        contains_error = true;
                    }
                }
            }
        }

        for (name, slurm) in [("slurm_a", &self.slurm_a), ("slurm_b", &self.slurm_b)] {
            let Some(slurm) = slurm else { continue };

            if slurm.server.is_empty() {
                error!("{name}.server must be an ssh destination");
                contains_error = true;
            }

            if slurm.timeout_secs == 0 {
                error!("{name}.timeout_secs cannot be 0, remote calls must be bounded");
                contains_error = true;
            }

            for template in [&slurm.submission_template, &slurm.setup_template]
                .into_iter()
                .flatten()
            {
                if !template.is_file() {
                    error!("{name} template {template:?} was not found");
                    contains_error = true;
                }
            }
        }

        if let Some(distributed) = &self.distributed {
            if distributed.workers.is_empty() {
                warn!("distributed.workers is empty, every distributed job will stay Unknown");
            }

            if distributed.status_timeout_ms == 0 || distributed.logs_timeout_ms == 0 {
                error!("distributed timeouts cannot be 0");
                contains_error = true;
            }

            if distributed.worker.slots == 0 {
                error!("distributed.worker.slots cannot be 0, the worker would never run a job");
                contains_error = true;
            }
        }

        contains_error
    }
}

impl SlurmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl DistributedConfig {
    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn logs_timeout(&self) -> Duration {
        Duration::from_millis(self.logs_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// `~/drover`, or `/tmp/drover` without a home directory
pub fn drover_home() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or(PathBuf::from("/tmp"))
        .join("drover")
}

fn default_output_root() -> PathBuf {
    drover_home().join("output")
}

fn default_lock_dir() -> PathBuf {
    drover_home().join("locks")
}

fn default_ssh_timeout() -> u64 {
    60
}

fn default_remote_interpreter() -> Vec<String> {
    vec!["python".to_owned()]
}

fn default_status_timeout() -> u64 {
    5000
}

fn default_poll_interval() -> u64 {
    250
}

fn default_slots() -> usize {
    1
}

fn default_monitor_interval() -> u64 {
    2000
}

fn default_kill_grace() -> Option<u64> {
    Some(30)
}

fn default_lost_after_passes() -> u32 {
    30
}

fn default_epochs_key() -> String {
    "training.num_epochs".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: RunnerConfig = serde_yaml::from_str(
            "output_root: /srv/out
distributed:
  broker: /shared/broker.db
  workers: [gpu01, gpu02]
  worker:
    kill_grace_secs: null
",
        )
        .unwrap();
        let distributed = config.distributed.as_ref().unwrap();

        assert_eq!(config.output_root, PathBuf::from("/srv/out"));
        assert_eq!(distributed.status_timeout(), Duration::from_secs(5));
        assert_eq!(distributed.worker.slots, 1);
        assert_eq!(distributed.worker.kill_grace_secs, None);
        assert_eq!(config.reconcile.lost_after_passes, 30);
        assert_eq!(config.reconcile.epochs_key, "training.num_epochs");
        assert!(config.slurm_a.is_none());
        assert!(!config.preflight_checks());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_yaml::from_str::<RunnerConfig>("output_rot: /x\n").is_err());
    }

    #[test]
    fn zero_timeouts_fail_preflight() {
        let mut config = RunnerConfig::default();
        config.slurm_a = Some(SlurmConfig {
            server: "me@cluster".into(),
            remote_root: "/home/me/drover".into(),
            submission_template: None,
            setup_template: None,
            timeout_secs: 0,
            interpreter: Vec::new(),
        });

        assert!(config.preflight_checks());
    }

    #[test]
    fn scripts_are_resolved_through_the_search_path() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = dir.path().join("scripts");
        fs::create_dir(&scripts).unwrap();
        fs::write(scripts.join("train.sh"), "echo hi\n").unwrap();

        let found = resolve_script(Path::new("train.sh"), &[dir.path().to_path_buf(), scripts.clone()])
            .unwrap();

        assert_eq!(found, scripts.join("train.sh"));
        assert!(matches!(
            resolve_script(Path::new("missing.sh"), &[scripts]),
            Err(ConfigErrors::ScriptNotFound(_))
        ));
        assert!(!check_executable(&found).unwrap());
    }
}
