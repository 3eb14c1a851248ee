//! Data-source connectors feeding the indexing pipeline.
//!
//! OS-level sources (contacts, calendar, photos, call log) live outside this
//! crate and plug in through [`DataConnector`]; [`DirectoryConnector`] covers
//! plain document folders.

mod directory;
mod markdown;

pub use directory::DirectoryConnector;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Contacts,
    Calendar,
    Photos,
    CallLog,
    Documents,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Contacts => "contacts",
            SourceType::Calendar => "calendar",
            SourceType::Photos => "photos",
            SourceType::CallLog => "call_log",
            SourceType::Documents => "documents",
        }
    }

    /// Records of this type carry structured fields and are extracted
    /// without the text generator.
    pub fn is_structured(&self) -> bool {
        !matches!(self, SourceType::Documents)
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One item fetched from a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Stable per source.
    pub id: String,
    pub source: SourceType,
    pub title: String,
    /// Free text (document body, notes, event description).
    pub content: String,
    /// Source-specific structured fields, e.g. `organization`, `attendees`.
    pub fields: BTreeMap<String, String>,
    pub modified_at: DateTime<Utc>,
}

impl SourceRecord {
    pub fn new(id: impl Into<String>, source: SourceType, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source,
            title: title.into(),
            content: String::new(),
            fields: BTreeMap::new(),
            modified_at: Utc::now(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_modified_at(mut self, modified_at: DateTime<Utc>) -> Self {
        self.modified_at = modified_at;
        self
    }

    /// Trimmed, non-empty field value.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    /// Comma- or semicolon-separated field values.
    pub fn field_list(&self, key: &str) -> Vec<&str> {
        self.field(key)
            .map(|v| v.split([',', ';']).map(str::trim).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

/// A source of records for the indexing pipeline.
///
/// A connector without the access it needs reports `false` from the
/// permission checks or fails `fetch` with `GraphRagError::PermissionDenied`;
/// the pipeline skips it in either case.
#[async_trait]
pub trait DataConnector: Send + Sync {
    fn name(&self) -> &str;

    fn source_type(&self) -> SourceType;

    async fn check_permissions(&self) -> Result<bool>;

    /// Ask for access. Connectors that cannot prompt return the current status.
    async fn request_permissions(&self) -> Result<bool> {
        self.check_permissions().await
    }

    async fn has_required_permissions(&self) -> bool {
        self.check_permissions().await.unwrap_or(false)
    }

    /// Records changed after `since` (all records when `None`), in the
    /// connector's stable fetch order, at most `limit` of them.
    async fn fetch(&self, since: Option<DateTime<Utc>>, limit: Option<usize>) -> Result<Vec<SourceRecord>>;

    async fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>>;

    /// Record a completed sync; `None` resets incremental state.
    async fn set_last_sync_time(&self, time: Option<DateTime<Utc>>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_type_serde_names() {
        assert_eq!(serde_json::to_string(&SourceType::CallLog).unwrap(), "\"call_log\"");
        assert_eq!(SourceType::CallLog.to_string(), "call_log");
        assert!(SourceType::Contacts.is_structured());
        assert!(!SourceType::Documents.is_structured());
    }

    #[test]
    fn test_field_helpers() {
        let record = SourceRecord::new("1", SourceType::Calendar, "Standup")
            .with_field("attendees", "Alice, Bob;  ; Carol")
            .with_field("location", "   ");
        assert_eq!(record.field_list("attendees"), vec!["Alice", "Bob", "Carol"]);
        assert_eq!(record.field("location"), None);
        assert!(record.field_list("missing").is_empty());
    }
}
