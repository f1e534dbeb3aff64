use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use prompt_board_core::{
    group_for_display, normalize_submission, now_rfc3339, reconcile, record_key, PromptGroup,
    Reconciliation, Record, RecordBody, ResponseEntry, WriteStrategy,
};
use prompt_board_store_sqlite::SqliteStore;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

/// What a submission did to the table. The atomic-append strategy never
/// reads before writing, so it always reports `Appended` even for the write
/// that created the row.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Created { key: String },
    Appended { key: String },
    Skipped,
}

/// One configured store handle plus the operations the binaries compose:
/// submit, board, seed. Constructed once at startup and passed around as a
/// dependency; the underlying connection is reused for every call.
#[derive(Clone)]
pub struct PromptBoardApi {
    store: Arc<Mutex<SqliteStore>>,
    strategy: WriteStrategy,
}

impl PromptBoardApi {
    /// Open the store, provision the table, and wrap the handle for reuse.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or provisioned.
    pub fn open(db_path: &Path, table: &str, strategy: WriteStrategy) -> Result<Self> {
        let store = SqliteStore::open(db_path, table)
            .with_context(|| format!("failed to open store at {}", db_path.display()))?;
        store.provision().context("failed to provision record table")?;

        Ok(Self { store: Arc::new(Mutex::new(store)), strategy })
    }

    #[must_use]
    pub fn strategy(&self) -> WriteStrategy {
        self.strategy
    }

    fn lock_store(&self) -> Result<MutexGuard<'_, SqliteStore>> {
        self.store.lock().map_err(|_| anyhow!("store lock poisoned"))
    }

    /// Record one prompt/response submission under the configured strategy.
    /// Empty fields (after trimming) are a no-op with no store call.
    ///
    /// # Errors
    /// Returns an error when the store rejects the write; callers on the web
    /// path log and swallow this, everyone else sees it.
    pub fn submit(&self, prompt: &str, response: &str) -> Result<SubmitOutcome> {
        let Some((prompt, text)) = normalize_submission(prompt, response) else {
            return Ok(SubmitOutcome::Skipped);
        };
        let now = now_rfc3339()?;
        let mut store = self.lock_store()?;

        match self.strategy {
            WriteStrategy::IndexLookup => {
                let existing = store
                    .query_by_prompt(&prompt)
                    .context("indexed lookup by prompt failed")?;
                match reconcile(existing.first(), &prompt, &text, &now) {
                    Reconciliation::Append { key, responses } => {
                        store
                            .update_responses(&key, &responses, &now)
                            .context("failed to write appended responses")?;
                        Ok(SubmitOutcome::Appended { key })
                    }
                    Reconciliation::Insert(record) => {
                        store.put_item(&record).context("failed to insert new record")?;
                        Ok(SubmitOutcome::Created { key: record.key })
                    }
                }
            }
            WriteStrategy::AtomicAppend => {
                let entry = ResponseEntry { text, timestamp: now.clone() };
                store
                    .append_response(&prompt, &entry, &now)
                    .context("atomic append failed")?;
                Ok(SubmitOutcome::Appended { key: prompt })
            }
            WriteStrategy::FlatInsert => {
                let record = Record {
                    key: record_key(&prompt, &now),
                    prompt,
                    body: RecordBody::Flat(ResponseEntry { text, timestamp: now.clone() }),
                    last_updated: Some(now),
                };
                store.put_item(&record).context("failed to insert flat record")?;
                Ok(SubmitOutcome::Created { key: record.key })
            }
        }
    }

    /// Scan the table and group everything for display.
    ///
    /// # Errors
    /// Returns an error when the scan fails or a row is malformed.
    pub fn board(&self) -> Result<Vec<PromptGroup>> {
        let store = self.lock_store()?;
        let records = store.scan().context("failed to scan record table")?;
        Ok(group_for_display(&records))
    }

    /// All stored records, in insertion order.
    ///
    /// # Errors
    /// Returns an error when the scan fails or a row is malformed.
    pub fn records(&self) -> Result<Vec<Record>> {
        let store = self.lock_store()?;
        store.scan().context("failed to scan record table")
    }

    /// Seed the sample prompts the original data loader shipped with,
    /// back-dated so the board shows a meaningful ordering. Returns how many
    /// records were written.
    ///
    /// # Errors
    /// Returns an error when a seed record cannot be written.
    pub fn seed_samples(&self) -> Result<usize> {
        let samples = sample_records(OffsetDateTime::now_utc())?;
        let mut store = self.lock_store()?;
        for record in &samples {
            store
                .put_item(record)
                .with_context(|| format!("failed to seed record {}", record.key))?;
        }
        Ok(samples.len())
    }
}

fn sample_records(now: OffsetDateTime) -> Result<Vec<Record>> {
    let stamp = |offset: Duration| -> Result<String> {
        (now - offset).format(&Rfc3339).context("failed to format seed timestamp")
    };
    let entry = |text: &str, timestamp: String| ResponseEntry { text: text.to_string(), timestamp };
    let now_stamp = stamp(Duration::ZERO)?;

    let samples = [
        (
            "Tell me a joke",
            vec![
                entry(
                    "Why don't scientists trust atoms? Because they make up everything!",
                    stamp(Duration::days(2))?,
                ),
                entry("What do you call a fake noodle? An impasta!", stamp(Duration::days(1))?),
            ],
        ),
        (
            "What is the weather today?",
            vec![
                entry("It's sunny with a high of 75°F", stamp(Duration::hours(5))?),
                entry(
                    "Currently cloudy with light rain, temperature around 68°F",
                    now_stamp.clone(),
                ),
            ],
        ),
        (
            "Give me a book recommendation",
            vec![entry(
                "Try 'The Hitchhiker's Guide to the Galaxy' by Douglas Adams",
                stamp(Duration::days(3))?,
            )],
        ),
    ];

    Ok(samples
        .into_iter()
        .map(|(prompt, responses)| Record {
            key: record_key(prompt, &now_stamp),
            prompt: prompt.to_string(),
            body: RecordBody::Responses(responses),
            last_updated: Some(now_stamp.clone()),
        })
        .collect())
}
