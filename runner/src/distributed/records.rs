use crate::job::JobStatus;
use parking_lot::FairMutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::{Path, PathBuf}, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("SQLite error")]
    SQLite(#[from] rusqlite::Error),
    #[error("Corrupted record for {handle}: unknown status `{status}`")]
    Corrupted { handle: String, status: String },
}

/// What a worker knows about one of its jobs
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct WorkerRecord {
    pub status: JobStatus,
    pub output_path: PathBuf,
    pub pid: Option<u32>,
    pub gpu: Option<String>,
}

/// Durable, worker-local key/value store of job records keyed by platform handle
///
/// Every update is a single statement on a single connection, which makes each
/// read-modify-write atomic for the worker process.
#[derive(Debug)]
pub struct RecordStore {
    connection: FairMutex<Connection>,
}

pub const SQL_SCHEMA: &str = "create table if not exists records (
    handle text primary key,
    status text not null,
    output_path text not null,
    pid integer,
    gpu text
);";

impl RecordStore {
    pub fn open(path: &Path) -> Result<Self, RecordError> {
        if let Some(parent) = path.parent() {
            if let Err(error) = std::fs::create_dir_all(parent) {
                error!(error = ?error, path = ?parent, "Failed to create record directory");
            }
        }

        let store = Self::init(Connection::open(path)?)?;
        info!(path = ?path, "Opened worker records");

        Ok(store)
    }

    pub fn in_memory() -> Result<Self, RecordError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(connection: Connection) -> Result<Self, RecordError> {
        connection.busy_timeout(Duration::from_secs(10))?;
        connection.execute(SQL_SCHEMA, [])?;

        Ok(Self {
            connection: FairMutex::new(connection),
        })
    }

    /// create (or reset, for a redelivered unit) the record of a freshly consumed job
    pub fn insert(&self, handle: &str, output_path: &Path) -> Result<(), RecordError> {
        self.connection
            .lock()
            .prepare_cached(
                "insert into records (handle, status, output_path) values (?, ?, ?)
                 on conflict (handle) do update
                 set status = excluded.status, output_path = excluded.output_path,
                     pid = null, gpu = null",
            )?
            .execute(params![
                handle,
                JobStatus::Waiting.as_str(),
                output_path.to_string_lossy().as_ref()
            ])?;
        debug!(handle = handle, "Inserted record");

        Ok(())
    }

    pub fn set_status(&self, handle: &str, status: JobStatus) -> Result<bool, RecordError> {
        let updated = self
            .connection
            .lock()
            .prepare_cached("update records set status = ? where handle = ?")?
            .execute(params![status.as_str(), handle])?;

        Ok(updated > 0)
    }

    pub fn set_pid(&self, handle: &str, pid: u32) -> Result<bool, RecordError> {
        let updated = self
            .connection
            .lock()
            .prepare_cached("update records set pid = ? where handle = ?")?
            .execute(params![pid, handle])?;

        Ok(updated > 0)
    }

    pub fn set_gpu(&self, handle: &str, gpu: Option<&str>) -> Result<bool, RecordError> {
        let updated = self
            .connection
            .lock()
            .prepare_cached("update records set gpu = ? where handle = ?")?
            .execute(params![gpu, handle])?;

        Ok(updated > 0)
    }

    pub fn get(&self, handle: &str) -> Result<Option<WorkerRecord>, RecordError> {
        let row = self
            .connection
            .lock()
            .prepare_cached("select handle, status, output_path, pid, gpu from records where handle = ?")?
            .query_row(params![handle], read_row)
            .optional()?;

        row.map(into_record).transpose().map(|record| record.map(|(_, record)| record))
    }

    pub fn remove(&self, handle: &str) -> Result<bool, RecordError> {
        let removed = self
            .connection
            .lock()
            .prepare_cached("delete from records where handle = ?")?
            .execute(params![handle])?;

        Ok(removed > 0)
    }

    pub fn snapshot(&self) -> Result<BTreeMap<String, WorkerRecord>, RecordError> {
        let rows = self
            .connection
            .lock()
            .prepare_cached("select handle, status, output_path, pid, gpu from records")?
            .query_map([], read_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(into_record).collect()
    }
}

type RawRecord = (String, String, String, Option<u32>, Option<String>);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_record(
    (handle, status, output_path, pid, gpu): RawRecord,
) -> Result<(String, WorkerRecord), RecordError> {
    let status = JobStatus::from_str(&status)
        .map_err(|_| RecordError::Corrupted {
            handle: handle.clone(),
            status,
        })?;

    Ok((
        handle,
        WorkerRecord {
            status,
            output_path: PathBuf::from(output_path),
            pid,
            gpu,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_lifecycle() {
        let store = RecordStore::in_memory().unwrap();
        store.insert("h1", Path::new("/out/a")).unwrap();

        assert!(store.set_pid("h1", 4242).unwrap());
        assert!(store.set_gpu("h1", Some("1")).unwrap());
        assert!(store.set_status("h1", JobStatus::Running).unwrap());
        assert!(!store.set_status("nope", JobStatus::Running).unwrap());

        assert_eq!(
            store.get("h1").unwrap(),
            Some(WorkerRecord {
                status: JobStatus::Running,
                output_path: PathBuf::from("/out/a"),
                pid: Some(4242),
                gpu: Some("1".into()),
            })
        );

        assert!(store.remove("h1").unwrap());
        assert!(!store.remove("h1").unwrap());
        assert_eq!(store.get("h1").unwrap(), None);
    }

    #[test]
    fn records_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("records.db");

        {
            let store = RecordStore::open(&path).unwrap();
            store.insert("h1", Path::new("/out/a")).unwrap();
            store.set_status("h1", JobStatus::Finished).unwrap();
            store.insert("h2", Path::new("/out/b")).unwrap();
        }

        let snapshot = RecordStore::open(&path).unwrap().snapshot().unwrap();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["h1"].status, JobStatus::Finished);
        assert_eq!(snapshot["h2"].status, JobStatus::Waiting);
        assert_eq!(snapshot["h2"].pid, None);
    }
}
