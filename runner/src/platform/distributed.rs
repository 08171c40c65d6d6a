use super::{output_path_for, ComputePlatform, PlatformError, Submission};
use crate::{
    config::DistributedConfig,
    distributed::{
        broker::Broker, is_worker_status, records::WorkerRecord, reply_queue, worker_queue, Reply,
        Request, UnitOfWork, JOBS_QUEUE,
    },
    job::{Job, JobStatus},
    launch::{remove_output, render_config, LaunchError},
    logs::LogMap,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Jobs executed by workers consuming a shared queue
#[derive(Debug)]
pub struct DistributedPlatform {
    broker: Arc<Broker>,
    output_root: PathBuf,
    workers: Vec<String>,
    status_timeout: Duration,
    logs_timeout: Duration,
}

impl DistributedPlatform {
    pub fn new(broker: Arc<Broker>, output_root: PathBuf, config: &DistributedConfig) -> Self {
        Self {
            broker,
            output_root,
            workers: config.workers.clone(),
            status_timeout: config.status_timeout(),
            logs_timeout: config.logs_timeout(),
        }
    }

    /// Send `request` to every worker and collect one reply each until `timeout`
    ///
    /// Returns the replies together with the workers that stayed silent.
    fn broadcast(
        &self,
        request: impl Fn(String) -> Request,
        timeout: Duration,
    ) -> Result<(Vec<Reply>, BTreeSet<String>), PlatformError> {
        let reply_to = reply_queue();
        let mut missing: BTreeSet<String> = self.workers.iter().cloned().collect();

        // a worker that is down must not find a backlog of stale requests when it comes back
        for worker in missing.iter() {
            self.broker
                .publish_expiring(&worker_queue(worker), &request(reply_to.clone()), timeout)?;
        }

        let deadline = Instant::now() + timeout;
        let mut replies = Vec::new();

        while !missing.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let Some(reply) = self.broker.consume::<Reply>(&reply_to, remaining)? else {
                break;
            };
            if missing.remove(reply.worker()) {
                replies.push(reply);
            } else {
                debug!(worker = reply.worker(), "Ignoring reply of an unexpected worker");
            }
        }

        if !missing.is_empty() {
            // late replies would otherwise pile up in a queue nobody reads anymore
            self.broker.purge(&reply_to)?;
        }

        Ok((replies, missing))
    }

    /// Ask the owner of `job` a question that expects exactly one reply
    fn ask(&self, worker: &str, request: Request, reply_to: &str) -> Result<Reply, PlatformError> {
        self.broker
            .publish_expiring(&worker_queue(worker), &request, self.logs_timeout)?;

        match self.broker.consume::<Reply>(reply_to, self.logs_timeout)? {
            Some(reply) => Ok(reply),
            None => {
                self.broker.purge(reply_to)?;

                Err(PlatformError::Timeout {
                    waiting_for: format!("worker {worker}"),
                    after: self.logs_timeout,
                })
            }
        }
    }

    /// Names of the workers that answer a ping within the status timeout
    pub fn ping_workers(&self) -> Result<Vec<String>, PlatformError> {
        let (replies, missing) =
            self.broadcast(|reply_to| Request::Ping { reply_to }, self.status_timeout)?;

        if !missing.is_empty() {
            warn!(missing = ?missing, "Workers did not answer the ping");
        }

        Ok(replies
            .iter()
            .map(|reply| reply.worker().to_owned())
            .collect())
    }
}

impl ComputePlatform for DistributedPlatform {
    #[instrument(skip_all, fields(job = %job.uuid, resume = resume), level = "info")]
    fn submit(&self, job: &mut Job, resume: bool) -> Result<Submission, PlatformError> {
        let output_path = output_path_for(&self.output_root, job, resume)?;
        let config = render_config(&job.config, &output_path).map_err(LaunchError::from)?;
        let handle = Uuid::new_v4().to_string();

        let unit = UnitOfWork {
            handle: handle.clone(),
            job_uuid: job.uuid,
            script: job.script.clone(),
            config,
            output_path: output_path.clone(),
            resume,
        };
        self.broker.publish_keyed(JOBS_QUEUE, Some(&handle), &unit)?;
        job.output_path = Some(output_path);
        info!(handle = %handle, "Queued job");

        Ok(Submission {
            handle,
            status: JobStatus::Waiting,
        })
    }

    fn cancel(&self, job: &Job) -> Result<Option<JobStatus>, PlatformError> {
        if self.broker.withdraw(JOBS_QUEUE, &job.handle)? {
            info!(handle = %job.handle, "Withdrew queued job");
            return Ok(Some(JobStatus::Cancelled));
        }

        let request = Request::Cancel {
            handle: job.handle.clone(),
        };
        if job.worker.is_empty() {
            // the owner is not known yet, only the owner acts on it
            for worker in self.workers.iter() {
                self.broker.publish(&worker_queue(worker), &request)?;
            }
        } else {
            self.broker.publish(&worker_queue(&job.worker), &request)?;
        }
        info!(handle = %job.handle, worker = %job.worker, "Requested cancellation");

        Ok(None)
    }

    #[instrument(skip_all, fields(jobs = jobs.len()), level = "debug")]
    fn update_statuses(&self, jobs: &mut [Job]) -> Result<(), PlatformError> {
        if jobs.is_empty() {
            return Ok(());
        }

        let (replies, missing) = self.broadcast(
            |reply_to| Request::Snapshot { reply_to },
            self.status_timeout,
        )?;
        if !missing.is_empty() {
            return Err(PlatformError::Timeout {
                waiting_for: format!(
                    "snapshots of {}",
                    missing.into_iter().collect::<Vec<_>>().join(", ")
                ),
                after: self.status_timeout,
            });
        }

        let snapshots: BTreeMap<String, BTreeMap<String, WorkerRecord>> = replies
            .into_iter()
            .filter_map(|reply| match reply {
                Reply::Snapshot { worker, records } => Some((worker, records)),
                _ => None,
            })
            .collect();

        for job in jobs.iter_mut() {
            let owners: Vec<(&String, &WorkerRecord)> = snapshots
                .iter()
                .filter_map(|(worker, records)| records.get(&job.handle).map(|record| (worker, record)))
                .collect();

            match owners.as_slice() {
                [(worker, record)] if is_worker_status(record.status) => {
                    job.status = record.status;
                    job.worker = (*worker).clone();
                    job.output_path = Some(record.output_path.clone());
                }
                [] if self.broker.contains(JOBS_QUEUE, &job.handle)? => {
                    job.status = JobStatus::Waiting;
                }
                [] => job.status = JobStatus::Unknown,
                owners => {
                    warn!(
                        handle = %job.handle,
                        owners = owners.len(),
                        "No single usable worker report for job"
                    );
                    job.status = JobStatus::Unknown;
                }
            }
        }

        Ok(())
    }

    fn fetch_logs(&self, job: &Job) -> Result<LogMap, PlatformError> {
        if job.worker.is_empty() {
            return Ok(LogMap::new());
        }

        let reply_to = reply_queue();
        let request = Request::FetchLogs {
            handle: job.handle.clone(),
            reply_to: reply_to.clone(),
        };

        match self.ask(&job.worker, request, &reply_to)? {
            Reply::Logs { logs, .. } => Ok(logs),
            other => {
                warn!(reply = ?other, "Unexpected reply to a log request");
                Ok(LogMap::new())
            }
        }
    }

    fn delete(&self, job: &Job) -> Result<(), PlatformError> {
        self.broker.withdraw(JOBS_QUEUE, &job.handle)?;

        if job.worker.is_empty() {
            // never picked up, the output directory may still exist from an earlier run
            if let Some(path) = &job.output_path {
                remove_output(path)?;
            }
            return Ok(());
        }

        let reply_to = reply_queue();
        let request = Request::Delete {
            handle: job.handle.clone(),
            reply_to: reply_to.clone(),
        };

        if let Reply::Deleted { found: false, worker } = self.ask(&job.worker, request, &reply_to)? {
            warn!(handle = %job.handle, worker = %worker, "Worker had no record of the job");
            if let Some(path) = &job.output_path {
                remove_output(path)?;
            }
        }

        Ok(())
    }
}
