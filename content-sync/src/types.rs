use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ─── Enumerations ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    Article,
    CaseStudy,
}

impl ContentType {
    pub const ALL: [ContentType; 2] = [ContentType::Article, ContentType::CaseStudy];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Article => "article",
            ContentType::CaseStudy => "case-study",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "article" => Ok(ContentType::Article),
            "case-study" => Ok(ContentType::CaseStudy),
            other => Err(format!("unknown content type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
    Publish,
    Unpublish,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Create => "create",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
            ChangeAction::Publish => "publish",
            ChangeAction::Unpublish => "unpublish",
        }
    }

    /// Visibility-affecting actions always invalidate, and do so immediately.
    pub fn strength(&self) -> InvalidationStrength {
        match self {
            ChangeAction::Delete | ChangeAction::Publish | ChangeAction::Unpublish => {
                InvalidationStrength::Immediate
            }
            ChangeAction::Create | ChangeAction::Update => InvalidationStrength::Standard,
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ChangeAction::Create),
            "update" => Ok(ChangeAction::Update),
            "delete" => Ok(ChangeAction::Delete),
            "publish" => Ok(ChangeAction::Publish),
            "unpublish" => Ok(ChangeAction::Unpublish),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    Draft,
    Published,
    Archived,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationStrength {
    /// Mark entries stale; consumers refetch on their next read.
    Standard,
    /// Evict and refetch before returning.
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationTrigger {
    Webhook,
    Drift,
    Manual,
    /// Announced by another instance over a transport.
    Remote,
}

// ─── Change events ───────────────────────────────────────────────────────────

/// Canonical notification of a content mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub action: ChangeAction,
    pub content_type: ContentType,
    pub content_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ChangeEvent {
    pub fn new(action: ChangeAction, content_type: ContentType, content_id: impl Into<String>) -> Self {
        Self {
            action,
            content_type,
            content_id: content_id.into(),
            timestamp: Utc::now(),
            retry_count: 0,
            signature: None,
        }
    }

    /// The deduplication key: identical fingerprints are the same logical change.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.action,
            self.content_type,
            self.content_id,
            self.timestamp.timestamp_millis()
        )
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }
}

/// A change event as it arrives over the wire, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChangeEvent {
    pub action: Option<String>,
    pub content_type: Option<String>,
    pub content_id: Option<String>,
    /// RFC 3339 string or milliseconds since the epoch.
    pub timestamp: Option<serde_json::Value>,
    pub retry_count: Option<u32>,
    pub signature: Option<String>,
}

impl TryFrom<RawChangeEvent> for ChangeEvent {
    type Error = Vec<String>;

    fn try_from(raw: RawChangeEvent) -> Result<Self, Self::Error> {
        let mut errors = Vec::new();

        let action = match raw.action.as_deref() {
            None => {
                errors.push("missing required field: action".to_string());
                None
            }
            Some(a) => a.parse::<ChangeAction>().map_err(|e| errors.push(e)).ok(),
        };

        let content_type = match raw.content_type.as_deref() {
            None => {
                errors.push("missing required field: contentType".to_string());
                None
            }
            Some(t) => t.parse::<ContentType>().map_err(|e| errors.push(e)).ok(),
        };

        let content_id = match raw.content_id {
            None => {
                errors.push("missing required field: contentId".to_string());
                None
            }
            Some(id) if id.trim().is_empty() => {
                errors.push("contentId must not be empty".to_string());
                None
            }
            Some(id) => Some(id),
        };

        let timestamp = match raw.timestamp {
            None | Some(serde_json::Value::Null) => {
                errors.push("missing required field: timestamp".to_string());
                None
            }
            Some(value) => parse_timestamp(&value).map_err(|e| errors.push(e)).ok(),
        };

        match (action, content_type, content_id, timestamp) {
            (Some(action), Some(content_type), Some(content_id), Some(timestamp))
                if errors.is_empty() =>
            {
                Ok(ChangeEvent {
                    action,
                    content_type,
                    content_id,
                    timestamp,
                    retry_count: raw.retry_count.unwrap_or(0),
                    signature: raw.signature,
                })
            }
            _ => Err(errors),
        }
    }
}

fn parse_timestamp(value: &serde_json::Value) -> Result<DateTime<Utc>, String> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| format!("invalid timestamp {s:?}: {e}")),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| format!("invalid timestamp: {n}")),
        other => Err(format!("invalid timestamp: {other}")),
    }
}

// ─── Snapshots and drift ─────────────────────────────────────────────────────

/// One row of an admin-level listing of the authoritative store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRecord {
    pub id: String,
    pub last_modified: DateTime<Utc>,
    pub status: ContentStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSnapshot {
    pub taken_at: DateTime<Utc>,
    /// Records per content type, ordered by id.
    pub items: BTreeMap<ContentType, Vec<ContentRecord>>,
}

impl ContentSnapshot {
    pub fn new(taken_at: DateTime<Utc>) -> Self {
        Self {
            taken_at,
            items: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, content_type: ContentType, mut records: Vec<ContentRecord>) {
        records.sort_by(|a, b| a.id.cmp(&b.id));
        self.items.insert(content_type, records);
    }

    pub fn records(&self, content_type: ContentType) -> &[ContentRecord] {
        self.items
            .get(&content_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    StatusChanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedChange {
    pub id: String,
    pub action: ChangeKind,
    /// Status in the newer snapshot; `None` for deletions.
    pub status: Option<ContentStatus>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeDetectionResult {
    pub changes: BTreeMap<ContentType, Vec<DetectedChange>>,
}

impl ChangeDetectionResult {
    pub fn len(&self) -> usize {
        self.changes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (ContentType, &DetectedChange)> {
        self.changes
            .iter()
            .flat_map(|(ty, list)| list.iter().map(move |c| (*ty, c)))
    }
}

// ─── Records flowing to subscribers and the monitor ──────────────────────────

/// Outcome of one processing attempt of a change event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    pub webhook_id: String,
    pub success: bool,
    pub cache_invalidated: bool,
    pub retry_count: u32,
    pub processing_time_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Set when the event was already processed or is being processed.
    #[serde(default)]
    pub duplicate: bool,
    /// Delay before the next attempt, when one was scheduled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_in_ms: Option<u64>,
    /// Retries are exhausted; no further attempt will be made.
    #[serde(default)]
    pub terminal: bool,
}

/// Notification fanned out by the broadcast bus after an invalidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheUpdate {
    pub content_type: ContentType,
    /// `None` when the whole content type was invalidated.
    pub content_id: Option<String>,
    pub action: Option<ChangeAction>,
    pub strength: InvalidationStrength,
    pub keys: Vec<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheOperation {
    pub keys: Vec<String>,
    pub trigger: InvalidationTrigger,
    pub strength: InvalidationStrength,
    pub success: bool,
    pub duration_ms: u64,
}

/// Structured records every stage emits for the monitor.
#[derive(Debug, Clone)]
pub enum SyncRecord {
    Webhook(ProcessingResult),
    CacheOperation(CacheOperation),
    CacheAccess { hit: bool },
    SecurityEvent { reason: String },
    Poll { success: bool, changes: usize, duration_ms: u64 },
    RetryQueue { pending: usize },
}

pub type RecordSender = tokio::sync::mpsc::UnboundedSender<SyncRecord>;
pub type RecordReceiver = tokio::sync::mpsc::UnboundedReceiver<SyncRecord>;

pub fn record_channel() -> (RecordSender, RecordReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawChangeEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn raw_event_with_all_fields_converts() {
        let event = ChangeEvent::try_from(raw(json!({
            "action": "publish",
            "contentType": "case-study",
            "contentId": "C7",
            "timestamp": "2026-10-19T10:00:00Z",
        })))
        .unwrap();
        assert_eq!(event.action, ChangeAction::Publish);
        assert_eq!(event.content_type, ContentType::CaseStudy);
        assert_eq!(event.retry_count, 0);
    }

    #[test]
    fn epoch_millis_timestamp_is_accepted() {
        let event = ChangeEvent::try_from(raw(json!({
            "action": "update",
            "contentType": "article",
            "contentId": "A1",
            "timestamp": 1_760_000_000_000i64,
        })))
        .unwrap();
        assert_eq!(event.timestamp.timestamp_millis(), 1_760_000_000_000);
    }

    #[test]
    fn all_validation_errors_are_collected() {
        let errors = ChangeEvent::try_from(raw(json!({
            "action": "archive",
            "contentType": "podcast",
            "contentId": "  ",
        })))
        .unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("unknown action")));
        assert!(errors.iter().any(|e| e.contains("unknown content type")));
        assert!(errors.iter().any(|e| e.contains("contentId")));
        assert!(errors.iter().any(|e| e.contains("timestamp")));
    }

    #[test]
    fn visibility_actions_are_immediate() {
        assert_eq!(ChangeAction::Delete.strength(), InvalidationStrength::Immediate);
        assert_eq!(ChangeAction::Unpublish.strength(), InvalidationStrength::Immediate);
        assert_eq!(ChangeAction::Update.strength(), InvalidationStrength::Standard);
    }

    #[test]
    fn unknown_status_deserializes_as_other() {
        let record: ContentRecord = serde_json::from_value(json!({
            "id": "X",
            "lastModified": "2026-10-19T10:00:00Z",
            "status": "scheduled",
        }))
        .unwrap();
        assert_eq!(record.status, ContentStatus::Other);
    }
}
