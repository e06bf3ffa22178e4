//! Spool module: the durable local FIFO of samples awaiting upload.
//!
//! Samples are committed to a SQLite database file before any upload is
//! attempted and are only deleted when the uploader acknowledges them after
//! a confirmed server receipt. The database runs in WAL mode with
//! `synchronous=FULL`, so a committed insert survives a crash immediately
//! after `enqueue` returns.
//!
//! Mutations (`enqueue`, `ack`) go through a single writer connection, each
//! in its own immediate transaction. Reads (`peek`, `count`) use a separate
//! read-only connection and proceed while the writer is committing.
//!
//! # Concurrency
//!
//! The core API is synchronous and performs blocking SQLite I/O (fsyncs,
//! and up to the busy timeout when the file is locked). Async callers use
//! the `*_async` variants, which run the same operation on tokio's blocking
//! pool through [`tokio::task::spawn_blocking`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags, TransactionBehavior};
use thiserror::Error;
use tracing::{debug, info};

use crate::sample::{QueuedSample, Sample};

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS spool (
    sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    ts TEXT NOT NULL,
    power_w INTEGER NOT NULL,
    import_power_w INTEGER NOT NULL,
    energy_import_kwh REAL,
    energy_export_kwh REAL,
    enqueued_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);";

const INSERT_SQL: &str = "
INSERT INTO spool (device_id, ts, power_w, import_power_w, energy_import_kwh, energy_export_kwh)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

const PEEK_SQL: &str = "
SELECT sequence_id, device_id, ts, power_w, import_power_w,
       energy_import_kwh, energy_export_kwh, enqueued_at
FROM spool
ORDER BY sequence_id ASC
LIMIT ?1";

const DELETE_SQL: &str = "DELETE FROM spool WHERE sequence_id = ?1";

const COUNT_SQL: &str = "SELECT COUNT(*) FROM spool";

/// Errors that can occur during spool operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The SQLite layer reported a failure (unreachable, locked or corrupted file)
    #[error("spool database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The spool directory could not be prepared
    #[error("spool I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `close()` has already been called
    #[error("spool has been closed")]
    Closed,

    /// The blocking task running the operation was cancelled or panicked
    #[error("spool task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Durable FIFO queue of samples, backed by a single SQLite file.
///
/// # Example
///
/// ```no_run
/// use p1_edge::sample::Sample;
/// use p1_edge::spool::Spool;
///
/// let spool = Spool::open("/data/spool.db").expect("open spool");
/// spool.enqueue(&Sample::new("hw-p1-001", "2026-02-13T10:00:00+00:00", 1500)).unwrap();
///
/// let rows = spool.peek(30).unwrap();
/// let ids: Vec<i64> = rows.iter().map(|r| r.sequence_id).collect();
/// // ... deliver rows, then:
/// spool.ack(&ids).unwrap();
/// spool.close().unwrap();
/// ```
pub struct Spool {
    /// Location of the database file
    path: PathBuf,

    /// Connection used for inserts and deletes
    writer: Mutex<Option<Connection>>,

    /// Read-only connection used for peek and count
    reader: Mutex<Option<Connection>>,
}

impl Spool {
    /// Open the spool at `path`, creating the file and schema if needed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the directory cannot be created or the
    /// database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let writer = Connection::open(&path)?;
        writer.busy_timeout(BUSY_TIMEOUT)?;
        writer.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;",
        )?;
        writer.execute_batch(SCHEMA_SQL)?;

        let reader = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(BUSY_TIMEOUT)?;

        let spool = Self {
            path,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
        };

        let pending = spool.count()?;
        if pending > 0 {
            info!(
                path = %spool.path.display(),
                pending = pending,
                "Spool opened with pending samples"
            );
        } else {
            debug!(path = %spool.path.display(), "Spool opened (empty)");
        }

        Ok(spool)
    }

    /// Append one sample. The insert is committed before this returns.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the write did not commit; in that case no
    /// partial row exists.
    pub fn enqueue(&self, sample: &Sample) -> Result<(), StorageError> {
        let mut guard = lock(&self.writer);
        let conn = guard.as_mut().ok_or(StorageError::Closed)?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            INSERT_SQL,
            params![
                sample.device_id,
                sample.ts,
                sample.power_w,
                sample.import_power_w,
                sample.energy_import_kwh,
                sample.energy_export_kwh,
            ],
        )?;
        let sequence_id = tx.last_insert_rowid();
        tx.commit()?;

        debug!(sequence_id = sequence_id, device_id = %sample.device_id, "Sample spooled");
        Ok(())
    }

    /// Return up to `n` samples with the lowest `sequence_id`, oldest first.
    ///
    /// Does not modify the spool. `n == 0` returns an empty vector.
    pub fn peek(&self, n: usize) -> Result<Vec<QueuedSample>, StorageError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(n).unwrap_or(i64::MAX);

        let guard = lock(&self.reader);
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;

        let mut stmt = conn.prepare_cached(PEEK_SQL)?;
        let rows = stmt.query_map([limit], |row| {
            Ok(QueuedSample {
                sequence_id: row.get(0)?,
                sample: Sample {
                    device_id: row.get(1)?,
                    ts: row.get(2)?,
                    power_w: row.get(3)?,
                    import_power_w: row.get(4)?,
                    energy_import_kwh: row.get(5)?,
                    energy_export_kwh: row.get(6)?,
                },
                enqueued_at: row.get(7)?,
            })
        })?;

        let mut out = Vec::with_capacity(n.min(1024));
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Delete exactly the rows whose `sequence_id` is in `sequence_ids`.
    ///
    /// Unknown ids are ignored, so repeating an ack is harmless. Returns the
    /// number of rows actually removed.
    pub fn ack(&self, sequence_ids: &[i64]) -> Result<usize, StorageError> {
        if sequence_ids.is_empty() {
            return Ok(0);
        }

        let mut guard = lock(&self.writer);
        let conn = guard.as_mut().ok_or(StorageError::Closed)?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare_cached(DELETE_SQL)?;
            for id in sequence_ids {
                removed += stmt.execute([id])?;
            }
        }
        tx.commit()?;

        debug!(
            requested = sequence_ids.len(),
            removed = removed,
            "Acknowledged spool rows"
        );
        Ok(removed)
    }

    /// Number of samples not yet acknowledged.
    pub fn count(&self) -> Result<u64, StorageError> {
        let guard = lock(&self.reader);
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;
        let count: i64 = conn.query_row(COUNT_SQL, [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Release both connections. Every later call fails with
    /// [`StorageError::Closed`]; closing twice is a no-op.
    pub fn close(&self) -> Result<(), StorageError> {
        let reader = lock(&self.reader).take();
        let writer = lock(&self.writer).take();

        if let Some(conn) = reader {
            conn.close().map_err(|(_, e)| StorageError::Database(e))?;
        }
        if let Some(conn) = writer {
            conn.close().map_err(|(_, e)| StorageError::Database(e))?;
            info!(path = %self.path.display(), "Spool closed");
        }
        Ok(())
    }

    /// Get the database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Spool {
    /// [`Spool::enqueue`] on the blocking pool.
    pub async fn enqueue_async(self: &Arc<Self>, sample: Sample) -> Result<(), StorageError> {
        self.run_blocking(move |spool| spool.enqueue(&sample)).await
    }

    /// [`Spool::peek`] on the blocking pool.
    pub async fn peek_async(self: &Arc<Self>, n: usize) -> Result<Vec<QueuedSample>, StorageError> {
        self.run_blocking(move |spool| spool.peek(n)).await
    }

    /// [`Spool::ack`] on the blocking pool.
    pub async fn ack_async(self: &Arc<Self>, sequence_ids: Vec<i64>) -> Result<usize, StorageError> {
        self.run_blocking(move |spool| spool.ack(&sequence_ids)).await
    }

    /// [`Spool::count`] on the blocking pool.
    pub async fn count_async(self: &Arc<Self>) -> Result<u64, StorageError> {
        self.run_blocking(Spool::count).await
    }

    async fn run_blocking<T, F>(self: &Arc<Self>, op: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Spool) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let spool = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&spool)).await?
    }
}

fn lock(conn: &Mutex<Option<Connection>>) -> MutexGuard<'_, Option<Connection>> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}
