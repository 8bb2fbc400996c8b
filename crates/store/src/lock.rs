//! The durable reader–writer lock table.
//!
//! Locks are rows in the `locks` table, shared across processes through the
//! database file. A write lock on a key excludes every other lock on that
//! key; read locks coexist but exclude writers. Each acquisition attempt
//! runs inside a `BEGIN IMMEDIATE` transaction so the compatibility check
//! and the inserted row commit atomically; a busy database counts as
//! contention and is retried after `retry_interval`.
//!
//! One acquisition state machine serves both scheduling domains: `acquire`
//! sleeps on the thread, `acquire_async` suspends on the tokio timer. The
//! semantics are identical.

use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use noodle_primitives::{AccessLevel, AccessMode, LockKind, NodeKey, NoodleError, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::error;

use crate::records::LockRecord;
use crate::store_err;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct LockTable {
    db_path: Utf8PathBuf,
}

impl LockTable {
    #[must_use]
    pub fn new(db_path: impl AsRef<Utf8Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_owned(),
        }
    }

    fn connect(&self) -> Result<Connection> {
        Connection::open(self.db_path.as_std_path()).map_err(store_err)
    }

    /// Creates the lock table if absent.
    pub fn init(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| NoodleError::Store(err.to_string()))?;
        }
        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS locks (
                node_key TEXT NOT NULL,
                lock_type TEXT NOT NULL,
                lock_id TEXT PRIMARY KEY,
                access_level TEXT NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_lock_node_key ON locks(node_key);",
        )
        .map_err(store_err)
    }

    /// Wipes every lock. Used at startup to drop stale locks; a missing
    /// database file is a no-op.
    pub fn clear_all(&self) -> Result<()> {
        if !self.db_path.exists() {
            return Ok(());
        }
        let conn = self.connect()?;
        let _ = conn.execute("DELETE FROM locks", []).map_err(store_err)?;
        Ok(())
    }

    pub fn is_node_locked(&self, node_key: &NodeKey) -> Result<bool> {
        let conn = self.connect()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM locks WHERE node_key = ?1",
                params![node_key.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        Ok(found.is_some())
    }

    pub fn has_lock(&self, lock_id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM locks WHERE lock_id = ?1",
                params![lock_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        Ok(found.is_some())
    }

    pub fn get_info(&self, lock_id: &str) -> Result<Option<LockRecord>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT lock_id, node_key, lock_type, access_level, created_at
             FROM locks WHERE lock_id = ?1",
            params![lock_id],
            row_to_lock,
        )
        .optional()
        .map_err(store_err)
    }

    pub fn get_lock_type(&self, lock_id: &str) -> Result<Option<LockKind>> {
        Ok(self.get_info(lock_id)?.map(|record| record.kind))
    }

    /// Rewrites a lock's id in place. Used when a proxy link adopts the
    /// remote peer's lock id so that later operations can address both
    /// sides with one identifier.
    pub fn update_lock_id(&self, old_id: &str, new_id: &str) -> Result<()> {
        let conn = self.connect()?;
        let _ = conn
            .execute(
                "UPDATE locks SET lock_id = ?2 WHERE lock_id = ?1",
                params![old_id, new_id],
            )
            .map_err(store_err)?;
        Ok(())
    }

    pub fn remove_lock(&self, lock_id: &str) -> Result<()> {
        let conn = self.connect()?;
        let _ = conn
            .execute("DELETE FROM locks WHERE lock_id = ?1", params![lock_id])
            .map_err(store_err)?;
        Ok(())
    }

    /// Bulk release by node key, used by the unmount walk to drop its
    /// pre-locks.
    pub fn unlock_nodes(&self, node_keys: &[NodeKey]) -> Result<()> {
        if node_keys.is_empty() {
            return Ok(());
        }
        let conn = self.connect()?;
        let placeholders = vec!["?"; node_keys.len()].join(", ");
        let sql = format!("DELETE FROM locks WHERE node_key IN ({placeholders})");
        let key_strs: Vec<&str> = node_keys.iter().map(|key| key.as_str()).collect();
        let values: Vec<&dyn rusqlite::types::ToSql> = key_strs
            .iter()
            .map(|key| {
                let value: &dyn rusqlite::types::ToSql = key;
                value
            })
            .collect();
        let _ = conn.execute(&sql, values.as_slice()).map_err(store_err)?;
        Ok(())
    }

    /// Every recorded lock. The graceful-shutdown sweep filters this for
    /// process-level entries and shuts their CRM servers down.
    pub fn all_locks(&self) -> Result<Vec<LockRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                "SELECT lock_id, node_key, lock_type, access_level, created_at FROM locks",
            )
            .map_err(store_err)?;
        let records = stmt
            .query_map([], row_to_lock)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        Ok(records)
    }

    /// Acquires a lock for a node, blocking until available or timeout.
    pub fn lock_node(
        &self,
        node_key: &NodeKey,
        kind: LockKind,
        level: AccessLevel,
        timeout: Option<Duration>,
        retry_interval: Duration,
    ) -> Result<RwLock> {
        let lock = RwLock::new(
            self.clone(),
            node_key.clone(),
            AccessMode::new(level, kind),
            timeout,
            retry_interval,
        );
        lock.acquire()?;
        Ok(lock)
    }

    /// The cooperative counterpart of [`Self::lock_node`].
    pub async fn lock_node_async(
        &self,
        node_key: &NodeKey,
        kind: LockKind,
        level: AccessLevel,
        timeout: Option<Duration>,
        retry_interval: Duration,
    ) -> Result<RwLock> {
        let lock = RwLock::new(
            self.clone(),
            node_key.clone(),
            AccessMode::new(level, kind),
            timeout,
            retry_interval,
        );
        lock.acquire_async().await?;
        Ok(lock)
    }
}

fn row_to_lock(row: &rusqlite::Row<'_>) -> rusqlite::Result<LockRecord> {
    let kind: String = row.get(2)?;
    let level: String = row.get(3)?;
    Ok(LockRecord {
        lock_id: row.get(0)?,
        node_key: NodeKey::new(row.get::<_, String>(1)?),
        kind: if kind == "w" {
            LockKind::Write
        } else {
            LockKind::Read
        },
        level: if level == "p" {
            AccessLevel::Process
        } else {
            AccessLevel::Local
        },
        created_at: row.get(4)?,
    })
}

/// One acquisition attempt either grabs the lock or observes contention.
enum Attempt {
    Acquired,
    Contended,
}

/// A single reader–writer lock over one node key.
///
/// The id carries the owning process and thread plus randomness, so a
/// crashed peer's stale rows are attributable.
#[derive(Debug)]
pub struct RwLock {
    table: LockTable,
    node_key: NodeKey,
    mode: AccessMode,
    timeout: Option<Duration>,
    retry_interval: Duration,
    id: String,
}

impl RwLock {
    #[must_use]
    pub fn new(
        table: LockTable,
        node_key: NodeKey,
        mode: AccessMode,
        timeout: Option<Duration>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            table,
            node_key,
            mode,
            timeout,
            retry_interval,
            id: new_lock_id(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn node_key(&self) -> &NodeKey {
        &self.node_key
    }

    #[must_use]
    pub const fn mode(&self) -> AccessMode {
        self.mode
    }

    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether this lock's row is currently present.
    pub fn acquired(&self) -> Result<bool> {
        self.table.has_lock(&self.id)
    }

    /// One compatibility check plus insert under a reserved-writer
    /// transaction. A busy database is contention, not an error.
    fn try_acquire(&self) -> Result<Attempt> {
        let mut conn = self.table.connect()?;
        let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(tx) => tx,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) =>
            {
                return Ok(Attempt::Contended);
            }
            Err(err) => return Err(store_err(err)),
        };

        let conflicting: i64 = match self.mode.kind {
            LockKind::Write => tx.query_row(
                "SELECT COUNT(*) FROM locks WHERE node_key = ?1",
                params![self.node_key.as_str()],
                |row| row.get(0),
            ),
            LockKind::Read => tx.query_row(
                "SELECT COUNT(*) FROM locks WHERE node_key = ?1 AND lock_type = 'w'",
                params![self.node_key.as_str()],
                |row| row.get(0),
            ),
        }
        .map_err(store_err)?;

        if conflicting > 0 {
            // Dropping the transaction rolls it back.
            return Ok(Attempt::Contended);
        }

        let _ = tx
            .execute(
                "INSERT INTO locks (node_key, lock_type, lock_id, access_level)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    self.node_key.as_str(),
                    self.mode.kind.as_char().to_string(),
                    self.id,
                    self.mode.level.as_char().to_string(),
                ],
            )
            .map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        Ok(Attempt::Acquired)
    }

    fn timed_out(&self, start: Instant) -> Option<NoodleError> {
        let timeout = self.timeout?;
        (start.elapsed() >= timeout).then(|| NoodleError::LockTimeout {
            node_key: self.node_key.clone(),
            kind: self.mode.kind,
            timeout_secs: timeout.as_secs_f64(),
        })
    }

    /// Acquires the lock, blocking the thread between retries.
    pub fn acquire(&self) -> Result<()> {
        if self.acquired()? {
            return Ok(());
        }
        let start = Instant::now();
        loop {
            if let Attempt::Acquired = self.try_acquire()? {
                return Ok(());
            }
            if let Some(err) = self.timed_out(start) {
                return Err(err);
            }
            thread::sleep(self.retry_interval);
        }
    }

    /// Acquires the lock, suspending on the tokio timer between retries.
    /// Same state machine and invariants as [`Self::acquire`].
    pub async fn acquire_async(&self) -> Result<()> {
        if self.acquired()? {
            return Ok(());
        }
        let start = Instant::now();
        loop {
            if let Attempt::Acquired = self.try_acquire()? {
                return Ok(());
            }
            if let Some(err) = self.timed_out(start) {
                return Err(err);
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Releases the lock. Idempotent; failures are logged and swallowed (a
    /// failed release leaves the row visible until the startup sweep).
    pub fn release(&self) {
        if let Err(err) = self.table.remove_lock(&self.id) {
            error!(lock_id = %self.id, node_key = %self.node_key, %err, "error releasing lock");
        }
    }
}

fn new_lock_id() -> String {
    let tid: String = format!("{:?}", thread::current().id())
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    format!(
        "pid_{}_tid_{}_{:032x}",
        std::process::id(),
        tid,
        rand::random::<u128>()
    )
}
