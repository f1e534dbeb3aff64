use serde::{Deserialize, Serialize};
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{OffsetDateTime, PrimitiveDateTime};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("clock error: {0}")]
    Clock(String),
}

/// One timestamped response to a prompt. Timestamps are RFC 3339 strings and
/// are compared lexicographically; an absent timestamp reads as the empty
/// string and sorts after every real one.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResponseEntry {
    pub text: String,
    #[serde(default)]
    pub timestamp: String,
}

/// Stored body of a record. Two shapes exist in the table: a list of
/// responses (index-lookup and atomic-append writers) and a single flat
/// response (flat-insert writer). Serialized untagged so a JSON array decodes
/// as the list shape and a JSON object as the flat shape.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum RecordBody {
    Responses(Vec<ResponseEntry>),
    Flat(ResponseEntry),
}

impl RecordBody {
    #[must_use]
    pub fn response_count(&self) -> usize {
        match self {
            Self::Responses(entries) => entries.len(),
            Self::Flat(_) => 1,
        }
    }
}

/// A stored unit associating a prompt with one or more timestamped responses.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Record {
    pub key: String,
    #[serde(default)]
    pub prompt: String,
    pub body: RecordBody,
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum WriteStrategy {
    /// Query the secondary index for the prompt; append to the first match
    /// or insert a new composite-keyed record. Subject to a read-modify-write
    /// race when two writers see the same prompt as new.
    IndexLookup,
    /// Address the record by prompt as primary key and append in a single
    /// store operation, creating the list if absent. Race-free.
    AtomicAppend,
    /// Insert a new flat record per submission; grouping happens at read
    /// time.
    FlatInsert,
}

impl WriteStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IndexLookup => "index-lookup",
            Self::AtomicAppend => "atomic-append",
            Self::FlatInsert => "flat-insert",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "index-lookup" => Some(Self::IndexLookup),
            "atomic-append" => Some(Self::AtomicAppend),
            "flat-insert" => Some(Self::FlatInsert),
            _ => None,
        }
    }
}

/// Synthetic composite key for records that are not addressed by prompt.
#[must_use]
pub fn record_key(prompt: &str, timestamp: &str) -> String {
    format!("{prompt}_{timestamp}")
}

/// Current UTC time rendered as RFC 3339.
///
/// # Errors
/// Returns [`CoreError::Clock`] when the current time cannot be formatted.
pub fn now_rfc3339() -> Result<String, CoreError> {
    OffsetDateTime::now_utc().format(&Rfc3339).map_err(|err| CoreError::Clock(err.to_string()))
}

/// Trim a raw submission. Returns `None` when either field is empty after
/// trimming; such submissions are a no-op with no store call.
#[must_use]
pub fn normalize_submission(prompt: &str, response: &str) -> Option<(String, String)> {
    let prompt = prompt.trim();
    let response = response.trim();
    if prompt.is_empty() || response.is_empty() {
        return None;
    }
    Some((prompt.to_string(), response.to_string()))
}

/// Outcome of the create-vs-append decision for one accepted submission.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Reconciliation {
    /// Write `responses` back under the existing record's key.
    Append { key: String, responses: Vec<ResponseEntry> },
    /// No record exists for the prompt; insert a fresh one.
    Insert(Record),
}

/// Decide whether a submission extends an existing record or creates a new
/// one. `existing` is the first match of an indexed lookup by prompt, if any.
/// A flat record found by the lookup is promoted to the list shape so its
/// original response is preserved ahead of the new entry.
#[must_use]
pub fn reconcile(
    existing: Option<&Record>,
    prompt: &str,
    text: &str,
    timestamp: &str,
) -> Reconciliation {
    let entry = ResponseEntry { text: text.to_string(), timestamp: timestamp.to_string() };

    match existing {
        Some(record) => {
            let mut responses = match &record.body {
                RecordBody::Responses(entries) => entries.clone(),
                RecordBody::Flat(first) => vec![first.clone()],
            };
            responses.push(entry);
            Reconciliation::Append { key: record.key.clone(), responses }
        }
        None => Reconciliation::Insert(Record {
            key: record_key(prompt, timestamp),
            prompt: prompt.to_string(),
            body: RecordBody::Responses(vec![entry]),
            last_updated: Some(timestamp.to_string()),
        }),
    }
}

/// One display bucket: a prompt and its responses, newest first.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct PromptGroup {
    pub prompt: String,
    pub responses: Vec<ResponseEntry>,
}

fn flatten(records: &[Record]) -> Vec<(String, ResponseEntry)> {
    let mut tuples = Vec::new();
    for record in records {
        match &record.body {
            RecordBody::Responses(entries) => {
                for entry in entries {
                    tuples.push((record.prompt.clone(), entry.clone()));
                }
            }
            RecordBody::Flat(entry) => tuples.push((record.prompt.clone(), entry.clone())),
        }
    }
    tuples
}

fn well_formed_timestamp(value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    OffsetDateTime::parse(value, &Rfc3339).is_ok()
        || PrimitiveDateTime::parse(value, &Iso8601::DEFAULT).is_ok()
}

/// Group stored records by prompt for display.
///
/// Records are normalized into flat (prompt, response) tuples regardless of
/// stored shape, bucketed by prompt in first-seen order (a missing prompt
/// lands in the empty-string bucket), and each bucket is sorted by timestamp
/// descending. A bucket containing a malformed timestamp keeps its original
/// order instead of sorting, so one bad group never breaks the whole page.
#[must_use]
pub fn group_for_display(records: &[Record]) -> Vec<PromptGroup> {
    let mut groups: Vec<PromptGroup> = Vec::new();

    for (prompt, entry) in flatten(records) {
        match groups.iter_mut().find(|group| group.prompt == prompt) {
            Some(group) => group.responses.push(entry),
            None => groups.push(PromptGroup { prompt, responses: vec![entry] }),
        }
    }

    for group in &mut groups {
        let sortable =
            group.responses.iter().all(|entry| well_formed_timestamp(&entry.timestamp));
        if sortable {
            group.responses.sort_by(|lhs, rhs| rhs.timestamp.cmp(&lhs.timestamp));
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(text: &str, timestamp: &str) -> ResponseEntry {
        ResponseEntry { text: text.to_string(), timestamp: timestamp.to_string() }
    }

    fn list_record(key: &str, prompt: &str, entries: Vec<ResponseEntry>) -> Record {
        Record {
            key: key.to_string(),
            prompt: prompt.to_string(),
            body: RecordBody::Responses(entries),
            last_updated: None,
        }
    }

    fn flat_record(key: &str, prompt: &str, text: &str, timestamp: &str) -> Record {
        Record {
            key: key.to_string(),
            prompt: prompt.to_string(),
            body: RecordBody::Flat(entry(text, timestamp)),
            last_updated: None,
        }
    }

    #[test]
    fn grouping_orders_responses_newest_first() {
        let records = vec![
            list_record("X_1", "X", vec![entry("a", "2024-01-01T00:00:00Z")]),
            list_record("X_2", "X", vec![entry("b", "2024-01-02T00:00:00Z")]),
        ];

        let groups = group_for_display(&records);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].prompt, "X");
        assert_eq!(groups[0].responses[0].text, "b");
        assert_eq!(groups[0].responses[1].text, "a");
    }

    #[test]
    fn buckets_keep_first_seen_creation_order() {
        let records = vec![
            flat_record("b_1", "beta", "1", "2024-03-01T00:00:00Z"),
            flat_record("a_1", "alpha", "2", "2024-03-02T00:00:00Z"),
            flat_record("b_2", "beta", "3", "2024-03-03T00:00:00Z"),
        ];

        let groups = group_for_display(&records);
        let prompts: Vec<&str> = groups.iter().map(|group| group.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["beta", "alpha"]);
    }

    #[test]
    fn missing_prompt_groups_under_empty_string() {
        let records = vec![
            flat_record("k1", "", "orphan", "2024-01-01T00:00:00Z"),
            flat_record("k2", "named", "kept", "2024-01-01T00:00:00Z"),
        ];

        let groups = group_for_display(&records);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].prompt, "");
        assert_eq!(groups[0].responses[0].text, "orphan");
    }

    #[test]
    fn missing_timestamp_sorts_last() {
        let records = vec![list_record(
            "X_1",
            "X",
            vec![
                entry("undated", ""),
                entry("old", "2024-01-01T00:00:00Z"),
                entry("new", "2024-02-01T00:00:00Z"),
            ],
        )];

        let groups = group_for_display(&records);
        let texts: Vec<&str> =
            groups[0].responses.iter().map(|response| response.text.as_str()).collect();
        assert_eq!(texts, vec!["new", "old", "undated"]);
    }

    #[test]
    fn malformed_timestamp_preserves_original_order_for_that_bucket_only() {
        let records = vec![
            list_record(
                "bad_1",
                "bad",
                vec![entry("first", "not-a-timestamp"), entry("second", "2024-01-05T00:00:00Z")],
            ),
            list_record(
                "good_1",
                "good",
                vec![
                    entry("old", "2024-01-01T00:00:00Z"),
                    entry("new", "2024-01-02T00:00:00Z"),
                ],
            ),
        ];

        let groups = group_for_display(&records);

        let bad: Vec<&str> =
            groups[0].responses.iter().map(|response| response.text.as_str()).collect();
        assert_eq!(bad, vec!["first", "second"]);

        let good: Vec<&str> =
            groups[1].responses.iter().map(|response| response.text.as_str()).collect();
        assert_eq!(good, vec!["new", "old"]);
    }

    #[test]
    fn bare_iso_8601_timestamps_still_sort() {
        // The hosted variants wrote naive local timestamps with no offset.
        let records = vec![list_record(
            "X_1",
            "X",
            vec![entry("a", "2024-01-01T00:00:00"), entry("b", "2024-01-02T00:00:00")],
        )];

        let groups = group_for_display(&records);
        assert_eq!(groups[0].responses[0].text, "b");
    }

    #[test]
    fn flat_and_list_records_share_a_group() {
        let records = vec![
            flat_record("X_1", "X", "flat", "2024-01-03T00:00:00Z"),
            list_record("X_2", "X", vec![entry("listed", "2024-01-01T00:00:00Z")]),
        ];

        let groups = group_for_display(&records);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].responses.len(), 2);
        assert_eq!(groups[0].responses[0].text, "flat");
    }

    #[test]
    fn grouping_is_idempotent() {
        let records = vec![
            list_record(
                "X_1",
                "X",
                vec![entry("a", "2024-01-01T00:00:00Z"), entry("b", "2024-01-02T00:00:00Z")],
            ),
            flat_record("Y_1", "Y", "c", "2024-01-03T00:00:00Z"),
        ];

        let first = group_for_display(&records);
        let reflattened: Vec<Record> = first
            .iter()
            .map(|group| Record {
                key: group.prompt.clone(),
                prompt: group.prompt.clone(),
                body: RecordBody::Responses(group.responses.clone()),
                last_updated: None,
            })
            .collect();
        let second = group_for_display(&reflattened);

        assert_eq!(first, second);
    }

    #[test]
    fn reconcile_inserts_for_unseen_prompt() {
        let decision = reconcile(None, "Tell me a joke", "An impasta!", "2024-01-01T00:00:00Z");

        let Reconciliation::Insert(record) = decision else {
            panic!("expected an insert for an unseen prompt");
        };
        assert_eq!(record.key, "Tell me a joke_2024-01-01T00:00:00Z");
        assert_eq!(record.body.response_count(), 1);
        assert_eq!(record.last_updated.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn reconcile_appends_to_existing_record() {
        let existing = list_record(
            "Tell me a joke_2024-01-01T00:00:00Z",
            "Tell me a joke",
            vec![entry("first", "2024-01-01T00:00:00Z")],
        );

        let decision =
            reconcile(Some(&existing), "Tell me a joke", "second", "2024-01-02T00:00:00Z");

        let Reconciliation::Append { key, responses } = decision else {
            panic!("expected an append onto the existing record");
        };
        assert_eq!(key, existing.key);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].text, "first");
        assert_eq!(responses[1].text, "second");
    }

    #[test]
    fn reconcile_promotes_flat_record_to_list() {
        let existing = flat_record("X_1", "X", "flat original", "2024-01-01T00:00:00Z");

        let decision = reconcile(Some(&existing), "X", "appended", "2024-01-02T00:00:00Z");

        let Reconciliation::Append { responses, .. } = decision else {
            panic!("expected an append onto the flat record");
        };
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].text, "flat original");
    }

    #[test]
    fn normalize_submission_trims_and_rejects_empty_fields() {
        assert_eq!(
            normalize_submission("  prompt  ", "  response  "),
            Some(("prompt".to_string(), "response".to_string()))
        );
        assert_eq!(normalize_submission("   ", "response"), None);
        assert_eq!(normalize_submission("prompt", ""), None);
    }

    #[test]
    fn strategy_names_round_trip() {
        for strategy in
            [WriteStrategy::IndexLookup, WriteStrategy::AtomicAppend, WriteStrategy::FlatInsert]
        {
            assert_eq!(WriteStrategy::parse(strategy.as_str()), Some(strategy));
        }
        assert_eq!(WriteStrategy::parse("single-table"), None);
    }

    #[test]
    fn record_body_decodes_both_stored_shapes() {
        let list: RecordBody = match serde_json::from_str(
            r#"[{"text":"a","timestamp":"2024-01-01T00:00:00Z"},{"text":"b"}]"#,
        ) {
            Ok(body) => body,
            Err(err) => panic!("list body should decode: {err}"),
        };
        let RecordBody::Responses(entries) = &list else {
            panic!("array should decode as the list shape");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].timestamp, "");

        let flat: RecordBody = match serde_json::from_str(r#"{"text":"only"}"#) {
            Ok(body) => body,
            Err(err) => panic!("flat body should decode: {err}"),
        };
        assert_eq!(flat, RecordBody::Flat(entry("only", "")));
    }
}
