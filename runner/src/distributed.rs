/*
 * Distributed execution over a shared queue:
 * 1. The orchestrator publishes a unit of work on the global `jobs` queue
 * 2. Any worker with a free slot consumes it, runs the job and keeps a worker-local record
 * 3. Status, logs, cancel and delete requests go to the private queue of a worker, answers come
 *    back on a short-lived reply queue owned by the requester
 *
 * The broker is a SQLite file on storage every participant can reach, so no extra service has
 * to be operated next to the workers.
 */

pub mod broker;
pub mod records;
pub mod util;
pub mod worker;

#[cfg(test)]
mod util_test;

use crate::{job::JobStatus, logs::LogMap};
use records::WorkerRecord;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, time::Duration};
use uuid::Uuid;

/// global queue all workers consume jobs from
pub const JOBS_QUEUE: &str = "jobs";

/// replies nobody consumed within this are dropped, their requester has timed out long before
pub const REPLY_TTL: Duration = Duration::from_secs(300);

/// private control queue of a single worker
pub fn worker_queue(worker: &str) -> String {
    format!("worker.{worker}")
}

/// fresh reply queue for one request round
pub fn reply_queue() -> String {
    format!("reply.{}", Uuid::new_v4())
}

/// Everything a worker needs to run a job without access to the central job store
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct UnitOfWork {
    pub handle: String,
    pub job_uuid: Uuid,
    pub script: PathBuf,
    /// serialized YAML config
    pub config: String,
    pub output_path: PathBuf,
    pub resume: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Snapshot { reply_to: String },
    FetchLogs { handle: String, reply_to: String },
    Cancel { handle: String },
    Delete { handle: String, reply_to: String },
    Ping { reply_to: String },
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Snapshot {
        worker: String,
        records: BTreeMap<String, WorkerRecord>,
    },
    Logs {
        worker: String,
        logs: LogMap,
    },
    Deleted {
        worker: String,
        found: bool,
    },
    Pong {
        worker: String,
    },
}

impl Reply {
    pub fn worker(&self) -> &str {
        match self {
            Self::Snapshot { worker, .. }
            | Self::Logs { worker, .. }
            | Self::Deleted { worker, .. }
            | Self::Pong { worker } => worker,
        }
    }
}

/// statuses a worker writes into its records
pub fn is_worker_status(status: JobStatus) -> bool {
    !matches!(status, JobStatus::Lost | JobStatus::Unknown | JobStatus::Removed)
}
