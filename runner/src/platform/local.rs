use super::{output_path_for, ComputePlatform, PlatformError, Submission};
use crate::{
    config::resolve_script,
    job::{Job, JobStatus},
    launch::{self, collect_logs, prepare_output, remove_output, render_config, LaunchError},
    logs::LogMap,
};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use parking_lot::FairMutex;
use std::{
    collections::HashMap,
    path::PathBuf,
    process::Child,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug)]
struct LocalProcess {
    /// pid at spawn time, the OS may hand it to another process once this one is reaped
    handle: String,
    child: Child,
    cancelled: bool,
}

/// Runs every job as a child process of the orchestrator
///
/// The process table lives in memory only, after a restart every formerly local job is Lost.
/// It is keyed by job uuid, a handle only counts if it also matches the process spawned for it.
#[derive(Debug)]
pub struct LocalPlatform {
    output_root: PathBuf,
    interpreter: Vec<String>,
    scripts_path: Vec<PathBuf>,
    processes: FairMutex<HashMap<Uuid, LocalProcess>>,
}

impl LocalPlatform {
    pub fn new(output_root: PathBuf, interpreter: Vec<String>, scripts_path: Vec<PathBuf>) -> Self {
        Self {
            output_root,
            interpreter,
            scripts_path,
            processes: FairMutex::new(HashMap::new()),
        }
    }

    fn process_of<'a>(
        processes: &'a mut HashMap<Uuid, LocalProcess>,
        job: &Job,
    ) -> Option<&'a mut LocalProcess> {
        processes
            .get_mut(&job.uuid)
            .filter(|process| process.handle == job.handle)
    }

    fn status_of(handle: &str, process: &mut LocalProcess) -> JobStatus {
        match process.child.try_wait() {
            Ok(None) => JobStatus::Running,
            Ok(Some(_)) if process.cancelled => JobStatus::Cancelled,
            Ok(Some(exit)) if exit.success() => JobStatus::Finished,
            Ok(Some(_)) => JobStatus::Crashed,
            Err(error) => {
                warn!(handle = handle, error = ?error, "Failed to poll job process");
                JobStatus::Unknown
            }
        }
    }
}

impl ComputePlatform for LocalPlatform {
    #[instrument(skip_all, fields(job = %job.uuid, resume = resume), level = "info")]
    fn submit(&self, job: &mut Job, resume: bool) -> Result<Submission, PlatformError> {
        let output_path = output_path_for(&self.output_root, job, resume)?;
        let config = render_config(&job.config, &output_path).map_err(LaunchError::from)?;
        let config_file = prepare_output(&output_path, &config, resume)?;
        job.output_path = Some(output_path.clone());

        let script = resolve_script(&job.script, &self.scripts_path)?;
        let child = launch::command(&self.interpreter, &script, &config_file, &output_path)?
            .spawn()
            .map_err(LaunchError::Spawn)?;
        let handle = child.id().to_string();

        info!(handle = %handle, script = ?script, "Started local job");
        // a resumed job replaces its earlier, already exited process
        self.processes.lock().insert(
            job.uuid,
            LocalProcess {
                handle: handle.clone(),
                child,
                cancelled: false,
            },
        );

        Ok(Submission {
            handle,
            status: JobStatus::Running,
        })
    }

    fn cancel(&self, job: &Job) -> Result<Option<JobStatus>, PlatformError> {
        let mut processes = self.processes.lock();
        let process = Self::process_of(&mut processes, job)
            .ok_or_else(|| PlatformError::UnknownHandle(job.handle.clone()))?;

        if process.child.try_wait()?.is_some() {
            debug!(handle = %job.handle, "Job already exited, nothing to cancel");
            return Ok(None);
        }

        if let Ok(pid) = i32::try_from(process.child.id()) {
            if let Err(errno) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                warn!(handle = %job.handle, errno = ?errno, "Failed to signal job");
                return Err(PlatformError::Io(errno.into()));
            }
        }
        process.cancelled = true;
        info!(handle = %job.handle, "Sent SIGTERM");

        Ok(None)
    }

    fn update_statuses(&self, jobs: &mut [Job]) -> Result<(), PlatformError> {
        let mut processes = self.processes.lock();

        for job in jobs.iter_mut() {
            job.status = match Self::process_of(&mut processes, job) {
                Some(process) => Self::status_of(&job.handle, process),
                None => JobStatus::Lost,
            };
        }

        Ok(())
    }

    fn fetch_logs(&self, job: &Job) -> Result<LogMap, PlatformError> {
        match &job.output_path {
            Some(path) => Ok(collect_logs(path)?),
            None => Ok(LogMap::new()),
        }
    }

    fn delete(&self, job: &Job) -> Result<(), PlatformError> {
        let process = {
            let mut processes = self.processes.lock();
            if Self::process_of(&mut processes, job).is_some() {
                processes.remove(&job.uuid)
            } else {
                None
            }
        };

        if let Some(mut process) = process {
            if process.child.try_wait()?.is_none() {
                warn!(handle = %job.handle, "Killing a job that is deleted while running");
                process.child.kill()?;
                process.child.wait()?;
            }
        }

        if let Some(path) = &job.output_path {
            remove_output(path)?;
        }
        info!(job = %job.uuid, "Deleted local job");

        Ok(())
    }
}
