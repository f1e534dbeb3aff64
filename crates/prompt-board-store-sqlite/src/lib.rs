use std::path::Path;

use prompt_board_core::{Record, RecordBody, ResponseEntry};
use rusqlite::{params, Connection, ErrorCode};

pub const DEFAULT_TABLE: &str = "prompt_responses";

/// Store-level failure taxonomy. An empty indexed query is a valid branch
/// and returns an empty `Vec`, never an error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store throttled: {0}")]
    Throttled(String),
    #[error("invalid table name: {0:?}")]
    InvalidTable(String),
    #[error("malformed record {key:?}: {reason}")]
    MalformedRecord { key: String, reason: String },
    #[error("failed to encode record body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{op}: {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },
}

fn classify(op: &'static str, err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                return StoreError::Throttled(format!("{op}: {err}"));
            }
            ErrorCode::CannotOpen | ErrorCode::NotADatabase => {
                return StoreError::Unavailable(format!("{op}: {err}"));
            }
            _ => {}
        }
    }
    StoreError::Backend { op, source: err }
}

fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let mut chars = table.chars();
    let starts_ok = chars.next().is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_');
    if starts_ok && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        Ok(())
    } else {
        Err(StoreError::InvalidTable(table.to_string()))
    }
}

/// Key-value record table over SQLite. Rows are addressed by `key`; a
/// secondary index on `prompt` backs the indexed lookup the index-lookup
/// write strategy depends on. Record bodies are stored as JSON text in
/// either of the two shapes `prompt_board_core::RecordBody` decodes.
pub struct SqliteStore {
    conn: Connection,
    table: String,
}

impl SqliteStore {
    /// Open the backing database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidTable`] when the table name is not a
    /// plain identifier, or [`StoreError::Unavailable`] when the database
    /// cannot be opened or configured.
    pub fn open(path: &Path, table: &str) -> Result<Self, StoreError> {
        validate_table_name(table)?;

        let conn = Connection::open(path).map_err(|err| {
            StoreError::Unavailable(format!("failed to open database at {}: {err}", path.display()))
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|err| StoreError::Unavailable(format!("failed to configure pragmas: {err}")))?;

        Ok(Self { conn, table: table.to_string() })
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the record table and its prompt index if they do not exist.
    /// Safe to call on every startup; this is the whole provisioning story.
    ///
    /// # Errors
    /// Returns an error when the DDL cannot be applied.
    pub fn provision(&self) -> Result<(), StoreError> {
        let table = &self.table;
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                   key TEXT PRIMARY KEY,
                   prompt TEXT NOT NULL DEFAULT '',
                   body_json TEXT NOT NULL,
                   last_updated TEXT
                 );
                 CREATE INDEX IF NOT EXISTS idx_{table}_prompt ON {table}(prompt);"
            ))
            .map_err(|err| classify("failed to provision record table", err))
    }

    /// Whether the record table has been provisioned in this database.
    ///
    /// # Errors
    /// Returns an error when the schema catalog cannot be queried.
    pub fn is_provisioned(&self) -> Result<bool, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .map_err(|err| classify("failed to inspect schema catalog", err))?;
        stmt.exists(params![self.table])
            .map_err(|err| classify("failed to inspect schema catalog", err))
    }

    /// Load every record, in insertion order so first-seen grouping is
    /// stable across reads.
    ///
    /// # Errors
    /// Returns [`StoreError::MalformedRecord`] when a row's body cannot be
    /// decoded, or a classified backend error when rows cannot be read.
    pub fn scan(&self) -> Result<Vec<Record>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT key, prompt, body_json, last_updated FROM {} ORDER BY rowid ASC",
                self.table
            ))
            .map_err(|err| classify("failed to prepare scan", err))?;

        let mut rows = stmt.query([]).map_err(|err| classify("failed to run scan", err))?;
        let mut records = Vec::new();

        while let Some(row) = rows.next().map_err(|err| classify("failed to read scan row", err))? {
            records.push(decode_row(
                row.get(0).map_err(|err| classify("failed to read key column", err))?,
                row.get(1).map_err(|err| classify("failed to read prompt column", err))?,
                &row.get::<_, String>(2)
                    .map_err(|err| classify("failed to read body column", err))?,
                row.get(3).map_err(|err| classify("failed to read last_updated column", err))?,
            )?);
        }

        Ok(records)
    }

    /// Insert or replace one record under its key.
    ///
    /// # Errors
    /// Returns an error when encoding or the write fails.
    pub fn put_item(&mut self, record: &Record) -> Result<(), StoreError> {
        let body_json = serde_json::to_string(&record.body)?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {}(key, prompt, body_json, last_updated)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(key) DO UPDATE SET
                       prompt = excluded.prompt,
                       body_json = excluded.body_json,
                       last_updated = excluded.last_updated",
                    self.table
                ),
                params![record.key, record.prompt, body_json, record.last_updated],
            )
            .map_err(|err| classify("failed to put record", err))?;
        Ok(())
    }

    /// Write a full response list back under an existing record's key.
    ///
    /// # Errors
    /// Returns an error when encoding or the write fails.
    pub fn update_responses(
        &mut self,
        key: &str,
        responses: &[ResponseEntry],
        last_updated: &str,
    ) -> Result<(), StoreError> {
        let body_json = serde_json::to_string(responses)?;
        self.conn
            .execute(
                &format!(
                    "UPDATE {} SET body_json = ?2, last_updated = ?3 WHERE key = ?1",
                    self.table
                ),
                params![key, body_json, last_updated],
            )
            .map_err(|err| classify("failed to update record responses", err))?;
        Ok(())
    }

    /// Atomic list-append addressed by prompt as primary key: one statement
    /// appends the entry, creating the row and the list if absent. A flat
    /// body already stored under the prompt key is folded into a list so no
    /// response is lost.
    ///
    /// # Errors
    /// Returns an error when encoding or the write fails.
    pub fn append_response(
        &mut self,
        prompt: &str,
        entry: &ResponseEntry,
        last_updated: &str,
    ) -> Result<(), StoreError> {
        let entry_json = serde_json::to_string(entry)?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {}(key, prompt, body_json, last_updated)
                     VALUES (?1, ?1, json_array(json(?2)), ?3)
                     ON CONFLICT(key) DO UPDATE SET
                       body_json = CASE json_type(body_json)
                         WHEN 'array' THEN json_insert(body_json, '$[#]', json(?2))
                         ELSE json_array(json(body_json), json(?2))
                       END,
                       last_updated = ?3",
                    self.table
                ),
                params![prompt, entry_json, last_updated],
            )
            .map_err(|err| classify("failed to append response", err))?;
        Ok(())
    }

    /// Indexed lookup of all records whose prompt equals the input. An empty
    /// result is the not-found branch, not an error.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn query_by_prompt(&self, prompt: &str) -> Result<Vec<Record>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT key, prompt, body_json, last_updated FROM {}
                 WHERE prompt = ?1 ORDER BY rowid ASC",
                self.table
            ))
            .map_err(|err| classify("failed to prepare prompt query", err))?;

        let mut rows =
            stmt.query(params![prompt]).map_err(|err| classify("failed to run prompt query", err))?;
        let mut records = Vec::new();

        while let Some(row) =
            rows.next().map_err(|err| classify("failed to read prompt query row", err))?
        {
            records.push(decode_row(
                row.get(0).map_err(|err| classify("failed to read key column", err))?,
                row.get(1).map_err(|err| classify("failed to read prompt column", err))?,
                &row.get::<_, String>(2)
                    .map_err(|err| classify("failed to read body column", err))?,
                row.get(3).map_err(|err| classify("failed to read last_updated column", err))?,
            )?);
        }

        Ok(records)
    }
}

fn decode_row(
    key: String,
    prompt: Option<String>,
    body_json: &str,
    last_updated: Option<String>,
) -> Result<Record, StoreError> {
    let body: RecordBody = serde_json::from_str(body_json)
        .map_err(|err| StoreError::MalformedRecord { key: key.clone(), reason: err.to_string() })?;

    Ok(Record { key, prompt: prompt.unwrap_or_default(), body, last_updated })
}
