//! SQLite-based state store for the operator.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use obsidian_chain::Address;
use obsidian_reconcile::RequestStatus;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

use crate::request::{InstanceRequest, RequestId};

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("State not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    Invalid(String),

    #[error("State store lock poisoned")]
    Poisoned,
}

/// Result of recording an observed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First sighting; recorded as `Pending`.
    New,
    /// Already known, with its current status.
    Existing(RequestStatus),
}

/// Result of claiming a request for provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// Now `Provisioning`; the caller owns it.
    Claimed(RequestRecord),
    /// Already resolved on the ledger; nothing to do.
    Resolved(RequestStatus),
    /// A ledger write for this request is owed by the outbox.
    Deferred,
}

/// A request as recorded in the local log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub request_id: RequestId,
    pub requester: Address,
    /// Ledger timestamp (Unix seconds).
    pub timestamp: u64,
    pub status: RequestStatus,
    pub cloud_instance_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestRecord {
    pub fn to_request(&self) -> InstanceRequest {
        InstanceRequest {
            request_id: self.request_id,
            requester: self.requester,
            timestamp: self.timestamp,
            status: self.status,
        }
    }
}

/// A ledger write still owed for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteBack {
    RegisterInstance { requester: Address },
    ReportError { message: String },
}

impl WriteBack {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RegisterInstance { .. } => "register_instance",
            Self::ReportError { .. } => "report_error",
        }
    }

    /// Status the request reaches once this write is confirmed.
    pub fn resolves_to(&self) -> RequestStatus {
        match self {
            Self::RegisterInstance { .. } => RequestStatus::Registered,
            Self::ReportError { .. } => RequestStatus::Failed,
        }
    }
}

/// Outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub id: i64,
    pub request_id: RequestId,
    pub write: WriteBack,
    /// Failed attempts so far, including the one that created the entry.
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// SQLite state store.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StateStoreError> {
        self.conn.lock().map_err(|_| StateStoreError::Poisoned)
    }

    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS monitor_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_block INTEGER,
                updated_at INTEGER NOT NULL DEFAULT 0
            );

            INSERT OR IGNORE INTO monitor_state (id) VALUES (1);

            CREATE TABLE IF NOT EXISTS requests (
                request_id TEXT PRIMARY KEY,
                requester TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                status TEXT NOT NULL,
                cloud_instance_id TEXT,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_requests_status ON requests(status);

            CREATE TABLE IF NOT EXISTS outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                requester TEXT,
                message TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                UNIQUE (request_id, kind)
            );

            CREATE INDEX IF NOT EXISTS idx_outbox_due ON outbox(next_attempt_at);
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Last block whose events were all enqueued.
    pub fn last_block(&self) -> Result<Option<u64>, StateStoreError> {
        let block: Option<i64> = self.conn()?.query_row(
            "SELECT last_block FROM monitor_state WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        block.map(|b| to_u64(b, "last_block")).transpose()
    }

    pub fn set_last_block(&self, block: u64) -> Result<(), StateStoreError> {
        self.conn()?.execute(
            "UPDATE monitor_state SET last_block = ?1, updated_at = ?2 WHERE id = 1",
            params![to_i64(block, "last_block")?, now_millis()],
        )?;
        Ok(())
    }

    /// Records a freshly observed request as `Pending` unless it is known.
    pub fn record_observed(&self, request: &InstanceRequest) -> Result<Observation, StateStoreError> {
        let conn = self.conn()?;
        let now = now_millis();
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO requests
                (request_id, requester, timestamp, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
            params![
                request.request_id.to_string(),
                request.requester.to_string(),
                to_i64(request.timestamp, "timestamp")?,
                RequestStatus::Pending.as_str(),
                now,
            ],
        )?;
        if inserted == 1 {
            return Ok(Observation::New);
        }

        let status: String = conn.query_row(
            "SELECT status FROM requests WHERE request_id = ?1",
            params![request.request_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(Observation::Existing(parse_status(&status)?))
    }

    /// Get a request record.
    pub fn get_request(&self, request_id: RequestId) -> Result<Option<RequestRecord>, StateStoreError> {
        let conn = self.conn()?;
        select_request(&conn, request_id)
    }

    /// Moves a request to `Provisioning`.
    ///
    /// Succeeds from `Pending`, and from `Provisioning` for requests
    /// interrupted by a restart, unless the outbox still holds a write for
    /// the request. The check and update are one statement.
    pub fn claim(&self, request_id: RequestId) -> Result<Claim, StateStoreError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            r#"
            UPDATE requests SET status = ?1, updated_at = ?2
            WHERE request_id = ?3 AND status IN (?4, ?1)
              AND NOT EXISTS (SELECT 1 FROM outbox WHERE outbox.request_id = ?3)
            "#,
            params![
                RequestStatus::Provisioning.as_str(),
                now_millis(),
                request_id.to_string(),
                RequestStatus::Pending.as_str(),
            ],
        )?;

        let record = select_request(&conn, request_id)?
            .ok_or_else(|| StateStoreError::NotFound(format!("request {request_id}")))?;
        if updated == 1 {
            Ok(Claim::Claimed(record))
        } else if record.status.is_terminal() {
            Ok(Claim::Resolved(record.status))
        } else {
            Ok(Claim::Deferred)
        }
    }

    /// Remembers the cloud server backing a request.
    pub fn set_cloud_instance(
        &self,
        request_id: RequestId,
        cloud_instance_id: &str,
    ) -> Result<(), StateStoreError> {
        let updated = self.conn()?.execute(
            "UPDATE requests SET cloud_instance_id = ?1, updated_at = ?2 WHERE request_id = ?3",
            params![cloud_instance_id, now_millis(), request_id.to_string()],
        )?;
        if updated == 0 {
            return Err(StateStoreError::NotFound(format!("request {request_id}")));
        }
        Ok(())
    }

    /// Records the most recent error without changing status.
    pub fn set_last_error(&self, request_id: RequestId, error: &str) -> Result<(), StateStoreError> {
        self.conn()?.execute(
            "UPDATE requests SET last_error = ?1, updated_at = ?2 WHERE request_id = ?3",
            params![error, now_millis(), request_id.to_string()],
        )?;
        Ok(())
    }

    /// Moves a request to a terminal status after its write-back confirmed.
    pub fn resolve(
        &self,
        request_id: RequestId,
        status: RequestStatus,
        last_error: Option<&str>,
    ) -> Result<(), StateStoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        resolve_in(&tx, request_id, status, last_error)?;
        tx.commit()?;
        Ok(())
    }

    /// Requests not yet resolved on the ledger, oldest first.
    pub fn unresolved(&self) -> Result<Vec<RequestRecord>, StateStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT request_id, requester, timestamp, status, cloud_instance_id, last_error, created_at, updated_at
            FROM requests WHERE status IN (?1, ?2) ORDER BY created_at, rowid
            "#,
        )?;
        let records = stmt
            .query_map(
                params![
                    RequestStatus::Pending.as_str(),
                    RequestStatus::Provisioning.as_str()
                ],
                request_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn count_by_status(&self, status: RequestStatus) -> Result<i64, StateStoreError> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM requests WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Queues a failed write-back for retry.
    ///
    /// At most one entry exists per request and kind; enqueuing again only
    /// refreshes the error.
    pub fn enqueue_outbox(
        &self,
        request_id: RequestId,
        write: &WriteBack,
        last_error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StateStoreError> {
        let (requester, message) = match write {
            WriteBack::RegisterInstance { requester } => (Some(requester.to_string()), None),
            WriteBack::ReportError { message } => (None, Some(message.as_str())),
        };
        self.conn()?.execute(
            r#"
            INSERT INTO outbox
                (request_id, kind, requester, message, attempts, next_attempt_at, last_error, created_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7)
            ON CONFLICT(request_id, kind) DO UPDATE SET last_error = excluded.last_error
            "#,
            params![
                request_id.to_string(),
                write.kind(),
                requester,
                message,
                next_attempt_at.timestamp_millis(),
                last_error,
                now_millis(),
            ],
        )?;
        Ok(())
    }

    /// Entries due at `now`, oldest due first.
    pub fn due_outbox(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEntry>, StateStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, request_id, kind, requester, message, attempts, next_attempt_at, last_error
            FROM outbox WHERE next_attempt_at <= ?1 ORDER BY next_attempt_at, id LIMIT ?2
            "#,
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let entries = stmt
            .query_map(params![now.timestamp_millis(), limit], outbox_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Records another failed attempt.
    pub fn reschedule_outbox(
        &self,
        id: i64,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), StateStoreError> {
        self.conn()?.execute(
            "UPDATE outbox SET attempts = ?1, next_attempt_at = ?2, last_error = ?3 WHERE id = ?4",
            params![attempts, next_attempt_at.timestamp_millis(), last_error, id],
        )?;
        Ok(())
    }

    /// Resolves the request and drops the entry in one transaction.
    pub fn complete_outbox(&self, entry: &OutboxEntry) -> Result<(), StateStoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let current = select_request(&tx, entry.request_id)?
            .ok_or_else(|| StateStoreError::NotFound(format!("request {}", entry.request_id)))?;
        if !current.status.is_terminal() {
            let last_error = match &entry.write {
                WriteBack::ReportError { message } => Some(message.as_str()),
                WriteBack::RegisterInstance { .. } => None,
            };
            resolve_in(&tx, entry.request_id, entry.write.resolves_to(), last_error)?;
        }
        tx.execute("DELETE FROM outbox WHERE id = ?1", params![entry.id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn outbox_len(&self) -> Result<i64, StateStoreError> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn resolve_in(
    conn: &Connection,
    request_id: RequestId,
    status: RequestStatus,
    last_error: Option<&str>,
) -> Result<(), StateStoreError> {
    let current = select_request(conn, request_id)?
        .ok_or_else(|| StateStoreError::NotFound(format!("request {request_id}")))?;
    current
        .status
        .transition(request_id.get(), status)
        .map_err(|e| StateStoreError::Invalid(e.to_string()))?;

    conn.execute(
        r#"
        UPDATE requests SET status = ?1, last_error = COALESCE(?2, last_error), updated_at = ?3
        WHERE request_id = ?4
        "#,
        params![status.as_str(), last_error, now_millis(), request_id.to_string()],
    )?;
    Ok(())
}

fn select_request(conn: &Connection, request_id: RequestId) -> Result<Option<RequestRecord>, StateStoreError> {
    conn.query_row(
        r#"
        SELECT request_id, requester, timestamp, status, cloud_instance_id, last_error, created_at, updated_at
        FROM requests WHERE request_id = ?1
        "#,
        params![request_id.to_string()],
        request_from_row,
    )
    .optional()
    .map_err(Into::into)
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<RequestRecord> {
    let request_id: String = row.get(0)?;
    let requester: String = row.get(1)?;
    let timestamp: i64 = row.get(2)?;
    let status: String = row.get(3)?;

    Ok(RequestRecord {
        request_id: request_id.parse::<RequestId>().map_err(|e| conversion(0, e))?,
        requester: Address::parse(&requester).map_err(|e| conversion(1, e))?,
        timestamp: u64::try_from(timestamp).map_err(|e| conversion(2, e))?,
        status: status.parse::<RequestStatus>().map_err(|e| conversion(3, e))?,
        cloud_instance_id: row.get(4)?,
        last_error: row.get(5)?,
        created_at: from_millis(row.get(6)?),
        updated_at: from_millis(row.get(7)?),
    })
}

fn outbox_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxEntry> {
    let request_id: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let requester: Option<String> = row.get(3)?;
    let message: Option<String> = row.get(4)?;

    let write = match kind.as_str() {
        "register_instance" => {
            let requester = requester.unwrap_or_default();
            WriteBack::RegisterInstance {
                requester: Address::parse(&requester).map_err(|e| conversion(3, e))?,
            }
        }
        "report_error" => WriteBack::ReportError {
            message: message.unwrap_or_default(),
        },
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                2,
                Type::Text,
                format!("unknown outbox kind {other}").into(),
            ))
        }
    };

    Ok(OutboxEntry {
        id: row.get(0)?,
        request_id: request_id.parse::<RequestId>().map_err(|e| conversion(1, e))?,
        write,
        attempts: row.get(5)?,
        next_attempt_at: from_millis(row.get(6)?),
        last_error: row.get(7)?,
    })
}

fn conversion<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn parse_status(s: &str) -> Result<RequestStatus, StateStoreError> {
    s.parse()
        .map_err(|e: obsidian_reconcile::ReconcileError| StateStoreError::Invalid(e.to_string()))
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn to_i64(value: u64, field: &str) -> Result<i64, StateStoreError> {
    i64::try_from(value).map_err(|_| StateStoreError::Invalid(format!("{field} {value} out of range")))
}

fn to_u64(value: i64, field: &str) -> Result<u64, StateStoreError> {
    u64::try_from(value).map_err(|_| StateStoreError::Invalid(format!("{field} {value} out of range")))
}
