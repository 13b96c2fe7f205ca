//! SQLite-backed metadata store
//!
//! One connection behind a mutex; every call runs on the blocking pool.
//! Timestamps are stored as fixed-width RFC 3339 text so they compare
//! correctly as strings.

use super::{MetadataError, MetadataStore};
use crate::types::{FileRecord, NewFileRecord, UploadIntent, UserId};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, instrument};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS file_metadata (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id          INTEGER NOT NULL,
        file_name        TEXT NOT NULL,
        object_key       TEXT NOT NULL UNIQUE,
        object_reference TEXT NOT NULL,
        size_bytes       INTEGER NOT NULL,
        sha256           TEXT NOT NULL,
        uploaded_at      TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_file_metadata_user
        ON file_metadata(user_id, uploaded_at);

    CREATE TABLE IF NOT EXISTS upload_intents (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id     INTEGER NOT NULL,
        file_name   TEXT NOT NULL,
        object_key  TEXT NOT NULL UNIQUE,
        created_at  TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_upload_intents_created
        ON upload_intents(created_at);
";

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, MetadataError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| MetadataError::Corrupt(format!("bad timestamp {:?}: {}", raw, e)))
}

// u64 ids are stored as the bit-identical i64.
fn user_to_sql(user: UserId) -> i64 {
    user.0 as i64
}

fn user_from_sql(raw: i64) -> UserId {
    UserId(raw as u64)
}

/// Raw file row; timestamps are parsed after the statement finishes.
struct FileRow {
    id: i64,
    user_id: i64,
    file_name: String,
    object_key: String,
    object_reference: String,
    size_bytes: i64,
    sha256: String,
    uploaded_at: String,
}

impl FileRow {
    const COLUMNS: &'static str =
        "id, user_id, file_name, object_key, object_reference, size_bytes, sha256, uploaded_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            file_name: row.get(2)?,
            object_key: row.get(3)?,
            object_reference: row.get(4)?,
            size_bytes: row.get(5)?,
            sha256: row.get(6)?,
            uploaded_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<FileRecord, MetadataError> {
        Ok(FileRecord {
            id: self.id,
            user_id: user_from_sql(self.user_id),
            file_name: self.file_name,
            object_key: self.object_key,
            object_reference: self.object_reference,
            size_bytes: self.size_bytes.max(0) as u64,
            sha256: self.sha256,
            uploaded_at: parse_ts(&self.uploaded_at)?,
        })
    }
}

struct IntentRow {
    id: i64,
    user_id: i64,
    file_name: String,
    object_key: String,
    created_at: String,
}

impl IntentRow {
    const COLUMNS: &'static str = "id, user_id, file_name, object_key, created_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            file_name: row.get(2)?,
            object_key: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_intent(self) -> Result<UploadIntent, MetadataError> {
        Ok(UploadIntent {
            id: self.id,
            user_id: user_from_sql(self.user_id),
            file_name: self.file_name,
            object_key: self.object_key,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

/// Metadata store backed by a single SQLite database.
#[derive(Clone)]
pub struct SqliteMetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// `":memory:"` opens a private in-memory database.
    pub fn open(path: &Path) -> Result<Self, MetadataError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, MetadataError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, MetadataError> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        // journal_mode returns a row, so it cannot go through execute_batch.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, MetadataError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, MetadataError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| MetadataError::Join(e.to_string()))?
    }

    fn query_intents(
        conn: &Connection,
        filter: &str,
        param: &dyn rusqlite::ToSql,
    ) -> Result<Vec<UploadIntent>, MetadataError> {
        let sql = format!(
            "SELECT {} FROM upload_intents WHERE {} ORDER BY created_at, id",
            IntentRow::COLUMNS,
            filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([param], IntentRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(IntentRow::into_intent).collect()
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    #[instrument(skip(self))]
    async fn record_intent(
        &self,
        user: UserId,
        file_name: &str,
        object_key: &str,
    ) -> Result<i64, MetadataError> {
        let file_name = file_name.to_string();
        let object_key = object_key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO upload_intents (user_id, file_name, object_key, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    user_to_sql(user),
                    file_name,
                    object_key,
                    format_ts(&Utc::now())
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    #[instrument(skip(self, record), fields(object_key = %record.object_key))]
    async fn commit_file(
        &self,
        intent_id: i64,
        record: NewFileRecord,
    ) -> Result<FileRecord, MetadataError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM upload_intents WHERE id = ?1",
                params![intent_id],
            )?;
            if removed == 0 {
                // Dropping the transaction rolls back.
                return Err(MetadataError::IntentMissing(intent_id));
            }
            tx.execute(
                "INSERT INTO file_metadata
                    (user_id, file_name, object_key, object_reference, size_bytes, sha256, uploaded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    user_to_sql(record.user_id),
                    record.file_name,
                    record.object_key,
                    record.object_reference,
                    record.size_bytes as i64,
                    record.sha256,
                    format_ts(&record.uploaded_at)
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            debug!("Committed file record {} for {}", id, record.object_key);

            Ok(FileRecord {
                id,
                user_id: record.user_id,
                file_name: record.file_name,
                object_key: record.object_key,
                object_reference: record.object_reference,
                size_bytes: record.size_bytes,
                sha256: record.sha256,
                uploaded_at: record.uploaded_at,
            })
        })
        .await
    }

    async fn discard_intent(&self, intent_id: i64) -> Result<(), MetadataError> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM upload_intents WHERE id = ?1",
                params![intent_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn stale_intents(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<UploadIntent>, MetadataError> {
        let cutoff = format_ts(&before);
        self.with_conn(move |conn| Self::query_intents(conn, "created_at < ?1", &cutoff))
            .await
    }

    async fn user_intents(&self, user: UserId) -> Result<Vec<UploadIntent>, MetadataError> {
        let user = user_to_sql(user);
        self.with_conn(move |conn| Self::query_intents(conn, "user_id = ?1", &user))
            .await
    }

    async fn list_files(&self, user: UserId) -> Result<Vec<FileRecord>, MetadataError> {
        let user = user_to_sql(user);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM file_metadata WHERE user_id = ?1
                 ORDER BY uploaded_at DESC, id DESC",
                FileRow::COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![user], FileRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(FileRow::into_record).collect()
        })
        .await
    }

    async fn count_files(&self) -> Result<u64, MetadataError> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM file_metadata", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }
}
