use parking_lot::{FairMutex, FairMutexGuard};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    path::Path,
    thread::sleep,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("SQLite error")]
    SQLite(#[from] rusqlite::Error),
    #[error("Failed to encode message")]
    Encode(#[source] serde_json::Error),
    #[error("Dropped undecodable message {id} from queue {queue}")]
    Decode {
        id: i64,
        queue: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Named FIFO queues stored in a single SQLite file
///
/// Several processes may open the same file, every consume runs in an immediate transaction so a
/// message is handed to exactly one consumer.
#[derive(Debug)]
pub struct Broker {
    connection: FairMutex<Connection>,
    poll_interval: Duration,
}

pub const SQL_SCHEMA: [&str; 3] = [
    "create table if not exists messages (
    id integer primary key autoincrement,
    queue text not null,
    key text,
    body text not null,
    -- unix milliseconds, null never expires
    expires integer
);",
    "create index if not exists messages_queue on messages (queue, id);",
    "create index if not exists messages_expires on messages (expires) where expires is not null;",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

impl Broker {
    pub fn open(path: &Path, poll_interval: Duration) -> Result<Self, BrokerError> {
        Self::init(Connection::open(path)?, poll_interval)
    }

    pub fn in_memory(poll_interval: Duration) -> Result<Self, BrokerError> {
        Self::init(Connection::open_in_memory()?, poll_interval)
    }

    fn init(connection: Connection, poll_interval: Duration) -> Result<Self, BrokerError> {
        connection.busy_timeout(Duration::from_secs(10))?;

        for (counter, table) in SQL_SCHEMA.iter().enumerate() {
            if let Err(error) = connection.execute(table, []) {
                error!(error = ?error, "Failed to apply broker schema ({}/{SQL_SCHEMA_NUMBER}): {error}", counter + 1);

                return Err(error.into());
            }
        }
        info!("Opened broker");

        Ok(Self {
            connection: FairMutex::new(connection),
            poll_interval,
        })
    }

    fn lock(&self) -> FairMutexGuard<'_, Connection> {
        self.connection.lock()
    }

    pub fn publish<T: Serialize>(&self, queue: &str, message: &T) -> Result<(), BrokerError> {
        self.insert(queue, None, None, message)
    }

    /// publish with a key that allows to withdraw the message later on
    pub fn publish_keyed<T: Serialize>(
        &self,
        queue: &str,
        key: Option<&str>,
        message: &T,
    ) -> Result<(), BrokerError> {
        self.insert(queue, key, None, message)
    }

    /// Publish a message that is dropped unconsumed once `ttl` has passed
    ///
    /// Used for requests and replies that are worthless after their requester gave up waiting.
    pub fn publish_expiring<T: Serialize>(
        &self,
        queue: &str,
        message: &T,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        let expires = now_millis().saturating_add(ttl.as_millis().try_into().unwrap_or(i64::MAX));
        self.insert(queue, None, Some(expires), message)
    }

    fn insert<T: Serialize>(
        &self,
        queue: &str,
        key: Option<&str>,
        expires: Option<i64>,
        message: &T,
    ) -> Result<(), BrokerError> {
        let body = serde_json::to_string(message).map_err(BrokerError::Encode)?;

        self.lock()
            .prepare_cached("insert into messages (queue, key, body, expires) values (?, ?, ?, ?)")?
            .execute(params![queue, key, body, expires])?;
        debug!(queue = queue, "Published message");

        Ok(())
    }

    /// Take the oldest message of `queue` if there is one
    pub fn try_consume<T: DeserializeOwned>(&self, queue: &str) -> Result<Option<T>, BrokerError> {
        let mut connection = self.lock();
        let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // expired messages of every queue go, including those of consumers that are gone
        let expired = tx
            .prepare_cached("delete from messages where expires is not null and expires <= ?")?
            .execute(params![now_millis()])?;
        if expired > 0 {
            debug!(expired = expired, "Dropped expired messages");
        }

        let message: Option<(i64, String)> = tx
            .prepare_cached("select id, body from messages where queue = ? order by id limit 1")?
            .query_row(params![queue], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;

        let Some((id, body)) = message else {
            tx.commit()?;
            return Ok(None);
        };

        tx.prepare_cached("delete from messages where id = ?")?
            .execute(params![id])?;
        tx.commit()?;

        // the message is gone either way, a broken one must not block the queue
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|source| BrokerError::Decode {
                id,
                queue: queue.to_owned(),
                source,
            })
    }

    /// Wait up to `timeout` for a message on `queue`
    pub fn consume<T: DeserializeOwned>(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<T>, BrokerError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(message) = self.try_consume(queue)? {
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            sleep(self.poll_interval.min(deadline - now));
        }
    }

    /// Remove a not yet consumed message by key, true if it was still queued
    pub fn withdraw(&self, queue: &str, key: &str) -> Result<bool, BrokerError> {
        let removed = self
            .lock()
            .prepare_cached("delete from messages where queue = ? and key = ?")?
            .execute(params![queue, key])?;

        Ok(removed > 0)
    }

    pub fn contains(&self, queue: &str, key: &str) -> Result<bool, BrokerError> {
        let count: i64 = self
            .lock()
            .prepare_cached("select count(*) from messages where queue = ? and key = ?")?
            .query_row(params![queue, key], |row| row.get(0))?;

        Ok(count > 0)
    }

    pub fn purge(&self, queue: &str) -> Result<usize, BrokerError> {
        Ok(self
            .lock()
            .prepare_cached("delete from messages where queue = ?")?
            .execute(params![queue])?)
    }

    pub fn len(&self, queue: &str) -> Result<usize, BrokerError> {
        let count: i64 = self
            .lock()
            .prepare_cached("select count(*) from messages where queue = ?")?
            .query_row(params![queue], |row| row.get(0))?;

        Ok(count as usize)
    }

    pub fn is_empty(&self, queue: &str) -> Result<bool, BrokerError> {
        Ok(self.len(queue)? == 0)
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis().try_into().unwrap_or(i64::MAX))
        .unwrap_or(0)
}
