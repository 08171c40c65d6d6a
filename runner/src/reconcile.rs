//! The orchestrator owns the job store and the platform registry and is the only component that
//! writes job statuses.
//!
//! A reconciliation pass asks every backend for the current status of its active jobs, all
//! backends concurrently, then merges the answers into the store job by job. Each merge re-reads
//! the stored record, so a job that was cancelled or resubmitted while the pass was running is
//! never overwritten with a stale answer.

use crate::{
    config::ReconcileConfig,
    job::{Backend, Job, JobId, JobRequest, JobStatus},
    logs::{interpret, Interpretation, LogMap},
    platform::{PlatformError, Platforms},
    store::{JobStore, StoreError},
    sweep::{self, SweepError},
};
use itertools::Itertools;
use rand::Rng;
use rayon::prelude::*;
use serde_yaml::Value;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("Failed to submit job {id}, it is kept as RunFailed")]
    Submission {
        id: JobId,
        #[source]
        source: PlatformError,
    },
    #[error(transparent)]
    Sweep(#[from] SweepError),
    #[error("Job {0} does not exist")]
    NotFound(JobId),
    #[error("Job {id} is {status}, only active jobs can be cancelled")]
    NotActive { id: JobId, status: JobStatus },
    #[error("Job {id} is still {status}, only ended jobs can be resumed")]
    StillActive { id: JobId, status: JobStatus },
    #[error("Job {0} must be archived before it can be deleted")]
    NotArchived(JobId),
}

/// Outcome of a reconciliation pass
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// (job, old status, new status) for every status change
    pub updated: Vec<(JobId, JobStatus, JobStatus)>,
    /// backends whose query failed, their jobs kept the last known status
    pub failures: Vec<(Backend, PlatformError)>,
    /// per job problems that did not fail the pass (logs, interpretation)
    pub diagnostics: Vec<(JobId, String)>,
}

/// what a backend reported for one job during a pass
struct Observation {
    job: Job,
    interpretation: Option<(LogMap, Interpretation)>,
    diagnostics: Vec<String>,
}

pub struct Orchestrator<S: JobStore> {
    store: S,
    platforms: Platforms,
    settings: ReconcileConfig,
}

impl<S: JobStore> Orchestrator<S> {
    pub fn new(store: S, platforms: Platforms, settings: ReconcileConfig) -> Self {
        Self {
            store,
            platforms,
            settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn platforms(&self) -> &Platforms {
        &self.platforms
    }

    fn load(&self, id: JobId) -> Result<Job, OrchestratorError> {
        self.store.get(id)?.ok_or(OrchestratorError::NotFound(id))
    }

    pub fn get(&self, id: JobId) -> Result<Option<Job>, OrchestratorError> {
        Ok(self.store.get(id)?)
    }

    /// archived or non-archived jobs ordered by id
    pub fn list(&self, archived: bool) -> Result<Vec<Job>, OrchestratorError> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .filter(|job| job.is_archived == archived)
            .collect())
    }

    /// Create a job and submit it to its backend
    ///
    /// A failed submission still leaves the job in the store, as RunFailed without a handle.
    #[instrument(skip(self, request), fields(name = %request.name, backend = %request.backend), level = "info")]
    pub fn submit(&self, request: JobRequest) -> Result<JobId, OrchestratorError> {
        let id = self.store.insert(Job::new(request))?;
        self.launch(id, false)?;

        Ok(id)
    }

    /// Expand an `hpsearch` section into one job per trial, or submit the request as is
    pub fn submit_sweep<R: Rng>(
        &self,
        request: JobRequest,
        rng: &mut R,
    ) -> Result<Vec<Result<JobId, OrchestratorError>>, OrchestratorError> {
        if !sweep::is_sweep(&request.config) {
            return Ok(vec![self.submit(request)]);
        }

        let trials = sweep::generate(&request.config, &request.name, rng)?;
        info!(trials = trials.len(), name = %request.name, "Submitting sweep");

        Ok(trials
            .into_iter()
            .map(|(name, config)| {
                self.submit(JobRequest {
                    name,
                    config,
                    ..request.clone()
                })
            })
            .collect())
    }

    /// Resubmit an ended job to the same backend, reusing its output directory
    #[instrument(skip(self), level = "info")]
    pub fn resume(&self, id: JobId) -> Result<(), OrchestratorError> {
        let job = self.load(id)?;
        if job.status.is_active() {
            return Err(OrchestratorError::StillActive {
                id,
                status: job.status,
            });
        }

        self.launch(id, true)
    }

    fn launch(&self, id: JobId, resume: bool) -> Result<(), OrchestratorError> {
        let mut job = self.load(id)?;

        let result = self
            .platforms
            .get(job.backend)
            .and_then(|platform| platform.submit(&mut job, resume));

        match result {
            Ok(submission) => {
                info!(job = %id, handle = %submission.handle, status = %submission.status, "Submitted job");
                self.store.modify(id, &mut |stored| {
                    stored.handle = submission.handle.clone();
                    stored.status = submission.status;
                    stored.output_path = job.output_path.clone();
                    stored.worker.clear();
                    stored.missed_passes = 0;
                })?;

                Ok(())
            }
            Err(source) => {
                error!(job = %id, error = ?source, "Submission failed: {source}");
                self.store.modify(id, &mut |stored| {
                    stored.handle.clear();
                    stored.status = JobStatus::RunFailed;
                    if stored.output_path.is_none() {
                        stored.output_path = job.output_path.clone();
                    }
                })?;

                Err(OrchestratorError::Submission { id, source })
            }
        }
    }

    /// Request cancellation, the returned status is set if the backend could settle it right away
    #[instrument(skip(self), level = "info")]
    pub fn cancel(&self, id: JobId) -> Result<Option<JobStatus>, OrchestratorError> {
        let job = self.load(id)?;
        if !job.status.is_active() {
            return Err(OrchestratorError::NotActive {
                id,
                status: job.status,
            });
        }

        let settled = self.platforms.get(job.backend)?.cancel(&job)?;

        if let Some(status) = settled {
            self.store.modify(id, &mut |stored| {
                if stored.status.is_active() && stored.handle == job.handle {
                    stored.status = status;
                }
            })?;
        }

        Ok(settled)
    }

    pub fn archive(&self, id: JobId) -> Result<(), OrchestratorError> {
        self.set_archived(id, true)
    }

    pub fn unarchive(&self, id: JobId) -> Result<(), OrchestratorError> {
        self.set_archived(id, false)
    }

    fn set_archived(&self, id: JobId, archived: bool) -> Result<(), OrchestratorError> {
        if self.store.modify(id, &mut |job| job.is_archived = archived)? {
            Ok(())
        } else {
            Err(OrchestratorError::NotFound(id))
        }
    }

    /// Remove an archived job from its backend and the store
    #[instrument(skip(self), level = "info")]
    pub fn delete(&self, id: JobId) -> Result<(), OrchestratorError> {
        let job = self.load(id)?;
        if !job.is_archived {
            return Err(OrchestratorError::NotArchived(id));
        }

        self.platforms.get(job.backend)?.delete(&job)?;
        self.store.remove(id)?;
        info!(job = %id, "Deleted job");

        Ok(())
    }

    /// Fetch and interpret the logs of a single job, e.g. when it is opened in a dashboard
    pub fn refresh_logs(&self, id: JobId) -> Result<Vec<String>, OrchestratorError> {
        let job = self.load(id)?;
        let logs = self.platforms.get(job.backend)?.fetch_logs(&job)?;
        let interpretation = interpret(&logs, self.total_epochs(&job));

        let diagnostics = describe(&interpretation);
        self.store.modify(id, &mut |stored| apply_logs(stored, &logs, &interpretation))?;

        Ok(diagnostics)
    }

    fn total_epochs(&self, job: &Job) -> Option<u64> {
        job.config_value(&self.settings.epochs_key)
            .and_then(Value::as_u64)
    }

    /// Run one reconciliation pass over all active jobs
    #[instrument(skip(self), level = "info")]
    pub fn reconcile(&self) -> Result<ReconcileReport, OrchestratorError> {
        let groups = self
            .store
            .list()?
            .into_iter()
            .filter(|job| job.status.is_active() && job.is_submitted())
            .into_group_map_by(|job| job.backend);

        let results: Vec<(Backend, Result<Vec<Observation>, PlatformError>)> = groups
            .into_par_iter()
            .map(|(backend, jobs)| (backend, self.observe(backend, jobs)))
            .collect();

        let mut report = ReconcileReport::default();

        for (backend, result) in results {
            match result {
                Ok(observations) => {
                    for observation in observations {
                        self.merge(observation, &mut report)?;
                    }
                }
                Err(error) => {
                    warn!(backend = %backend, error = ?error, "Status query failed: {error}");
                    report.failures.push((backend, error));
                }
            }
        }

        info!(
            updated = report.updated.len(),
            failures = report.failures.len(),
            "Reconciliation pass done"
        );

        Ok(report)
    }

    /// Query one backend for `jobs`, then fetch the logs of every job that has some
    fn observe(&self, backend: Backend, mut jobs: Vec<Job>) -> Result<Vec<Observation>, PlatformError> {
        let platform = self.platforms.get(backend)?;
        platform.update_statuses(&mut jobs)?;
        debug!(backend = %backend, jobs = jobs.len(), "Received statuses");

        Ok(jobs
            .into_iter()
            .map(|job| {
                if matches!(
                    job.status,
                    JobStatus::Waiting | JobStatus::Unknown | JobStatus::Lost
                ) {
                    return Observation {
                        job,
                        interpretation: None,
                        diagnostics: Vec::new(),
                    };
                }

                match platform.fetch_logs(&job) {
                    Ok(logs) => {
                        let interpretation = interpret(&logs, self.total_epochs(&job));
                        let diagnostics = describe(&interpretation);

                        Observation {
                            job,
                            interpretation: Some((logs, interpretation)),
                            diagnostics,
                        }
                    }
                    Err(error) => Observation {
                        job,
                        interpretation: None,
                        diagnostics: vec![format!("Failed to fetch logs: {error}")],
                    },
                }
            })
            .collect())
    }

    fn merge(&self, observation: Observation, report: &mut ReconcileReport) -> Result<(), StoreError> {
        let Observation {
            job: reported,
            interpretation,
            diagnostics,
        } = observation;
        let lost_after = self.settings.lost_after_passes;
        let mut change = None;

        self.store.modify(reported.id, &mut |stored| {
            // cancelled, resubmitted or ended while the pass was running
            if !stored.status.is_active() || stored.handle != reported.handle {
                return;
            }

            let before = stored.status;

            if reported.status == JobStatus::Unknown {
                stored.missed_passes += 1;
                stored.status = if lost_after > 0 && stored.missed_passes >= lost_after {
                    JobStatus::Lost
                } else {
                    JobStatus::Unknown
                };
            } else {
                stored.missed_passes = 0;
                if stored.status.accepts(reported.status) {
                    stored.status = reported.status;
                } else {
                    debug!(job = %stored.id, from = %stored.status, to = %reported.status, "Ignoring status report");
                }
            }

            if !reported.worker.is_empty() {
                stored.worker = reported.worker.clone();
            }
            if reported.output_path.is_some() {
                stored.output_path = reported.output_path.clone();
            }
            if let Some((logs, interpretation)) = &interpretation {
                apply_logs(stored, logs, interpretation);
            }

            if stored.status != before {
                change = Some((before, stored.status));
            }
        })?;

        if let Some((before, after)) = change {
            info!(job = %reported.id, from = %before, to = %after, "Status changed");
            report.updated.push((reported.id, before, after));
        }
        report
            .diagnostics
            .extend(diagnostics.into_iter().map(|diagnostic| (reported.id, diagnostic)));

        Ok(())
    }
}

fn describe(interpretation: &Interpretation) -> Vec<String> {
    interpretation
        .diagnostics
        .iter()
        .map(|(log, error)| format!("{log}: {error}"))
        .collect()
}

/// derived data only, never the status
fn apply_logs(job: &mut Job, logs: &LogMap, interpretation: &Interpretation) {
    if let Some(progress) = &interpretation.progress {
        job.progress = progress.clone();
    }
    job.metrics = interpretation.metrics.clone();
    job.logs = interpretation.remaining(logs);
}
