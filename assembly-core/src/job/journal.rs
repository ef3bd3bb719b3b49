use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, Row};
use serde::Serialize;
use tokio::sync::oneshot;

use super::error::{JournalError, JournalResult};
use super::models::{Job, JobStatus};

const JOURNAL_SCHEMA: &str = include_str!("../../../sql/jobs.sql");

fn configure_connection(conn: &Connection, read_only: bool) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    if read_only {
        return Ok(());
    }
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.pragma_update(None, "synchronous", "NORMAL")
}

#[derive(Debug, Clone)]
pub struct SqliteJobJournalBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteJobJournalBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteJobJournalBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> JournalResult<SqliteJobJournal> {
        let path = self.path.ok_or(JournalError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteJobJournal { path, flags })
    }
}

/// Append-only record of job state transitions.
#[derive(Debug, Clone)]
pub struct SqliteJobJournal {
    path: PathBuf,
    flags: OpenFlags,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub id: i64,
    pub job_id: String,
    pub episode_id: String,
    pub from_status: Option<String>,
    pub to_status: String,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub segment_index: Option<i64>,
    pub result_ref: Option<String>,
    pub recorded_at: Option<DateTime<Utc>>,
}

impl TransitionRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let recorded_at: Option<String> = row.get("recorded_at")?;
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            episode_id: row.get("episode_id")?,
            from_status: row.get("from_status")?,
            to_status: row.get("to_status")?,
            error_kind: row.get("error_kind")?,
            error_message: row.get("error_message")?,
            segment_index: row.get("segment_index")?,
            result_ref: row.get("result_ref")?,
            recorded_at: recorded_at.as_deref().and_then(parse_recorded_at),
        })
    }
}

fn parse_recorded_at(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| Utc.from_utc_datetime(&dt))
        })
}

impl SqliteJobJournal {
    pub fn builder() -> SqliteJobJournalBuilder {
        SqliteJobJournalBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> JournalResult<Self> {
        SqliteJobJournalBuilder::new().path(path).build()
    }

    fn open(&self) -> JournalResult<Connection> {
        let read_only = self.flags.contains(OpenFlags::SQLITE_OPEN_READ_ONLY);
        if let Some(parent) = self.path.parent() {
            if !read_only && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            JournalError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn, read_only).map_err(|source| JournalError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> JournalResult<()> {
        let conn = self.open()?;
        conn.execute_batch(JOURNAL_SCHEMA)?;
        Ok(())
    }

    pub fn record(&self, from: Option<JobStatus>, job: &Job) -> JournalResult<i64> {
        let conn = self.open()?;
        Ok(insert_transition(&conn, from, job)?)
    }

    /// Reuses `conn` across writes and drops it after a failed insert so the
    /// next write reopens the database.
    fn record_on(
        &self,
        conn: &mut Option<Connection>,
        from: Option<JobStatus>,
        job: &Job,
    ) -> JournalResult<i64> {
        let open = match conn.take() {
            Some(open) => open,
            None => self.open()?,
        };
        let id = insert_transition(&open, from, job)?;
        *conn = Some(open);
        Ok(id)
    }

    pub fn history(&self, job_id: &str) -> JournalResult<Vec<TransitionRecord>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT * FROM job_transitions WHERE job_id = ?1 ORDER BY id ASC")?;
        let mut rows = stmt.query([job_id])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(TransitionRecord::from_row(row)?);
        }
        Ok(records)
    }
}

fn insert_transition(
    conn: &Connection,
    from: Option<JobStatus>,
    job: &Job,
) -> rusqlite::Result<i64> {
    let error = job.error.as_ref();
    conn.execute(
        "INSERT INTO job_transitions (
            job_id, episode_id, from_status, to_status, error_kind, error_message,
            segment_index, result_ref
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            &job.id,
            &job.episode_id,
            from.map(|status| status.as_str()),
            job.status.as_str(),
            error.map(|failure| failure.kind.as_str()),
            error.map(|failure| failure.message.as_str()),
            error.and_then(|failure| failure.segment_index).map(|index| index as i64),
            &job.result_ref,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

struct WriteRequest {
    from: Option<JobStatus>,
    job: Job,
    reply: oneshot::Sender<JournalResult<i64>>,
}

/// Owns the journal connection on a dedicated thread. Writes are applied in
/// the order they were requested, whether or not the caller awaits them.
#[derive(Debug)]
pub(crate) struct JournalWriter {
    requests: mpsc::Sender<WriteRequest>,
}

impl JournalWriter {
    pub(crate) fn spawn(journal: SqliteJobJournal) -> std::io::Result<Self> {
        let (requests, inbox) = mpsc::channel::<WriteRequest>();
        thread::Builder::new()
            .name("job-journal".into())
            .spawn(move || {
                let mut conn = None;
                for request in inbox {
                    let result = journal.record_on(&mut conn, request.from, &request.job);
                    let _ = request.reply.send(result);
                }
            })?;
        Ok(Self { requests })
    }

    /// Queues the write immediately; the returned future only reports the outcome.
    pub(crate) fn record(
        &self,
        from: Option<JobStatus>,
        job: &Job,
    ) -> impl Future<Output = JournalResult<i64>> {
        let (reply, outcome) = oneshot::channel();
        let queued = self
            .requests
            .send(WriteRequest {
                from,
                job: job.clone(),
                reply,
            })
            .map_err(|_| JournalError::WriterClosed);
        async move {
            queued?;
            outcome.await.map_err(|_| JournalError::WriterClosed)?
        }
    }
}
