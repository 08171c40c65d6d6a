use super::{
    broker::{Broker, BrokerError},
    records::{RecordError, RecordStore},
    worker_queue, Reply, Request, UnitOfWork, JOBS_QUEUE, REPLY_TTL,
};
use crate::{
    config::{resolve_script, ConfigErrors},
    gpu::{GpuLock, GpuLockManager, LockError, VISIBLE_DEVICES_VAR},
    job::JobStatus,
    launch::{self, collect_logs, prepare_output, remove_output, LaunchError},
    logs::LogMap,
};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use parking_lot::FairMutex;
use serde_yaml::Value;
use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, sleep, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Broker failure")]
    Broker(#[from] BrokerError),
    #[error("Record store failure")]
    Records(#[from] RecordError),
}

/// Reasons a unit of work ends as RunFailed
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error("Failed to acquire a GPU")]
    Lock(#[from] LockError),
    #[error(transparent)]
    Records(#[from] RecordError),
    #[error("Failed to parse the job config")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("Jobs can use at most one GPU, {0} were requested")]
    TooManyGpus(u64),
    #[error("num_gpus must be a non-negative integer")]
    InvalidGpuCount,
    #[error("Failed to wait for the job process")]
    Wait(#[source] io::Error),
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub name: String,
    pub slots: usize,
    pub poll_interval: Duration,
    pub monitor_interval: Duration,
    pub kill_grace: Option<Duration>,
    pub interpreter: Vec<String>,
    pub scripts_path: Vec<PathBuf>,
}

/// Consumes units of work from the shared queue and answers requests on its private queue
#[derive(Debug, Clone)]
pub struct Worker {
    broker: Arc<Broker>,
    records: Arc<RecordStore>,
    gpus: GpuLockManager,
    settings: Arc<WorkerSettings>,
    // handle -> instant the cancellation was requested
    cancellations: Arc<FairMutex<HashMap<String, Instant>>>,
    active: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        broker: Arc<Broker>,
        records: Arc<RecordStore>,
        gpus: GpuLockManager,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            broker,
            records,
            gpus,
            settings: Arc::new(settings),
            cancellations: Arc::new(FairMutex::new(HashMap::new())),
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// set to true to let `run` return once the running jobs are done
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    #[instrument(skip(self), fields(worker = %self.settings.name), level = "info")]
    pub fn run(&self) -> Result<(), WorkerError> {
        let control = worker_queue(&self.settings.name);
        let mut running: Vec<JoinHandle<()>> = Vec::new();

        info!(slots = self.settings.slots, "Worker started");

        while !self.shutdown.load(Ordering::SeqCst) {
            let mut idle = true;

            // control requests are answered even when every slot is busy
            while let Some(request) = skip_broken(self.broker.try_consume::<Request>(&control))? {
                idle = false;
                self.handle_request(request);
            }

            if self.active.load(Ordering::SeqCst) < self.settings.slots {
                if let Some(unit) = skip_broken(self.broker.try_consume::<UnitOfWork>(JOBS_QUEUE))? {
                    idle = false;
                    running.push(self.start(unit)?);
                }
            }

            running.retain(|handle| !handle.is_finished());

            if idle {
                sleep(self.settings.poll_interval);
            }
        }

        info!(running = running.len(), "Worker stopping, waiting for running jobs");
        for handle in running {
            if handle.join().is_err() {
                error!("A job thread panicked");
            }
        }

        Ok(())
    }

    fn start(&self, unit: UnitOfWork) -> Result<JoinHandle<()>, WorkerError> {
        self.records.insert(&unit.handle, &unit.output_path)?;
        self.active.fetch_add(1, Ordering::SeqCst);
        info!(handle = %unit.handle, job = %unit.job_uuid, "Accepted job");

        let worker = self.clone();

        Ok(thread::spawn(move || {
            let status = match worker.run_unit(&unit) {
                Ok(status) => status,
                Err(error) => {
                    error!(handle = %unit.handle, error = ?error, "Failed to run job: {error}");
                    JobStatus::RunFailed
                }
            };

            if let Err(error) = worker.records.set_status(&unit.handle, status) {
                error!(handle = %unit.handle, error = ?error, "Failed to record final status");
            }
            info!(handle = %unit.handle, status = %status, "Job ended");

            worker.cancellations.lock().remove(&unit.handle);
            worker.active.fetch_sub(1, Ordering::SeqCst);
        }))
    }

    fn is_cancelled(&self, handle: &str) -> Option<Instant> {
        self.cancellations.lock().get(handle).copied()
    }

    /// Run a single unit to completion, the returned status is final
    fn run_unit(&self, unit: &UnitOfWork) -> Result<JobStatus, RunError> {
        let config_file = prepare_output(&unit.output_path, &unit.config, unit.resume)?;

        let config: Value = serde_yaml::from_str(&unit.config)?;
        let mut gpu: Option<GpuLock> = match config.get("num_gpus") {
            None | Some(Value::Null) => None,
            Some(value) => match value.as_u64() {
                Some(0) => None,
                Some(1) => Some(self.gpus.acquire_one()?),
                Some(count) => return Err(RunError::TooManyGpus(count)),
                None => return Err(RunError::InvalidGpuCount),
            },
        };

        let script = resolve_script(&unit.script, &self.settings.scripts_path)?;
        let mut command = launch::command(&self.settings.interpreter, &script, &config_file, &unit.output_path)?;

        if let Some(gpu) = &gpu {
            command.env(VISIBLE_DEVICES_VAR, gpu.device());
            self.records.set_gpu(&unit.handle, Some(gpu.device()))?;
        }

        if self.is_cancelled(&unit.handle).is_some() {
            info!(handle = %unit.handle, "Cancelled before start");
            return Ok(JobStatus::Cancelled);
        }

        let mut child = command.spawn().map_err(LaunchError::Spawn)?;
        self.records.set_pid(&unit.handle, child.id())?;
        self.records.set_status(&unit.handle, JobStatus::Running)?;
        debug!(handle = %unit.handle, pid = child.id(), "Spawned job");

        // a cancel may have arrived between the check above and the pid being recorded
        if self.is_cancelled(&unit.handle).is_some() {
            terminate(child.id(), Signal::SIGTERM);
        }

        let mut killed = false;
        let exit = loop {
            if let Some(exit) = child
                .wait_timeout(self.settings.monitor_interval)
                .map_err(RunError::Wait)?
            {
                break exit;
            }

            self.records.set_status(&unit.handle, JobStatus::Running)?;

            if let (Some(grace), Some(requested), false) =
                (self.settings.kill_grace, self.is_cancelled(&unit.handle), killed)
            {
                if requested.elapsed() >= grace {
                    warn!(handle = %unit.handle, "Job ignored SIGTERM, killing it");
                    if let Err(error) = child.kill() {
                        warn!(handle = %unit.handle, error = ?error, "Failed to kill job");
                    }
                    killed = true;
                }
            }
        };

        if let Some(mut gpu) = gpu.take() {
            if let Err(error) = gpu.release() {
                warn!(handle = %unit.handle, error = ?error, "Failed to release GPU");
            }
        }

        Ok(if self.is_cancelled(&unit.handle).is_some() {
            JobStatus::Cancelled
        } else if exit.success() {
            JobStatus::Finished
        } else {
            JobStatus::Crashed
        })
    }

    fn handle_request(&self, request: Request) {
        debug!(request = ?request, "Handling request");

        let reply = match request {
            Request::Snapshot { reply_to } => match self.records.snapshot() {
                Ok(records) => Some((
                    reply_to,
                    Reply::Snapshot {
                        worker: self.settings.name.clone(),
                        records,
                    },
                )),
                Err(error) => {
                    // no reply lets the requester time out instead of trusting an empty snapshot
                    error!(error = ?error, "Failed to read records for a snapshot");
                    None
                }
            },
            Request::FetchLogs { handle, reply_to } => Some((
                reply_to,
                Reply::Logs {
                    worker: self.settings.name.clone(),
                    logs: self.logs(&handle),
                },
            )),
            Request::Cancel { handle } => {
                self.cancel(&handle);
                None
            }
            Request::Delete { handle, reply_to } => Some((
                reply_to,
                Reply::Deleted {
                    worker: self.settings.name.clone(),
                    found: self.delete(&handle),
                },
            )),
            Request::Ping { reply_to } => Some((
                reply_to,
                Reply::Pong {
                    worker: self.settings.name.clone(),
                },
            )),
        };

        if let Some((queue, reply)) = reply {
            if let Err(error) = self.broker.publish_expiring(&queue, &reply, REPLY_TTL) {
                warn!(queue = %queue, error = ?error, "Failed to publish reply");
            }
        }
    }

    fn logs(&self, handle: &str) -> LogMap {
        match self.records.get(handle) {
            Ok(Some(record)) => collect_logs(&record.output_path).unwrap_or_else(|error| {
                warn!(handle = handle, error = ?error, "Failed to collect logs");
                LogMap::new()
            }),
            Ok(None) => LogMap::new(),
            Err(error) => {
                warn!(handle = handle, error = ?error, "Failed to look up record");
                LogMap::new()
            }
        }
    }

    fn cancel(&self, handle: &str) {
        let record = match self.records.get(handle) {
            Ok(Some(record)) => record,
            // cancels are broadcast while the owner is unknown
            Ok(None) => return,
            Err(error) => {
                warn!(handle = handle, error = ?error, "Failed to look up record");
                return;
            }
        };

        if !record.status.is_active() {
            debug!(handle = handle, status = %record.status, "Ignoring cancel of an ended job");
            return;
        }

        self.cancellations
            .lock()
            .entry(handle.to_owned())
            .or_insert_with(Instant::now);
        info!(handle = handle, "Cancelling job");

        if let Some(pid) = record.pid {
            terminate(pid, Signal::SIGTERM);
        }
    }

    fn delete(&self, handle: &str) -> bool {
        let record = match self.records.get(handle) {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(error) => {
                warn!(handle = handle, error = ?error, "Failed to look up record");
                return false;
            }
        };

        if record.status == JobStatus::Running {
            if let Some(pid) = record.pid {
                terminate(pid, Signal::SIGKILL);
            }
        }

        if let Err(error) = self.records.remove(handle) {
            warn!(handle = handle, error = ?error, "Failed to remove record");
        }
        if let Err(error) = remove_output(&record.output_path) {
            warn!(path = ?record.output_path, error = ?error, "Failed to remove output directory");
        }
        info!(handle = handle, "Deleted job");

        true
    }
}

fn terminate(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };

    if let Err(errno) = kill(Pid::from_raw(raw), signal) {
        debug!(pid = pid, errno = ?errno, "Failed to signal job process");
    }
}

/// Log and drop undecodable messages, every other error is fatal to the worker
fn skip_broken<T>(result: Result<Option<T>, BrokerError>) -> Result<Option<T>, BrokerError> {
    match result {
        Err(error @ BrokerError::Decode { .. }) => {
            warn!(error = ?error, "{error}");
            Ok(None)
        }
        other => other,
    }
}
