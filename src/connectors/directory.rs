use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

use super::markdown::markdown_to_text;
use super::{DataConnector, SourceRecord, SourceType};
use crate::error::{GraphRagError, Result};
use crate::graph::stable_id;

const SUPPORTED_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "json"];

#[derive(Debug, Default, Serialize, Deserialize)]
struct SyncState {
    last_sync_time: Option<DateTime<Utc>>,
}

/// Generic documents connector over a local folder.
///
/// Walks the tree recursively and emits one record per `.txt`, `.md`,
/// `.markdown` or `.json` file, oldest modification first. The last-sync
/// timestamp is kept in memory and, when a state file is configured,
/// persisted as JSON.
pub struct DirectoryConnector {
    name: String,
    root: PathBuf,
    state_path: Option<PathBuf>,
    last_sync: Mutex<Option<DateTime<Utc>>>,
}

impl DirectoryConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            name: format!("documents:{}", root.display()),
            root,
            state_path: None,
            last_sync: Mutex::new(None),
        }
    }

    /// Persist sync state at `path`, loading any state already there.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let state: SyncState = serde_json::from_str(&raw)?;
            *self.last_sync.get_mut().unwrap_or_else(|e| e.into_inner()) = state.last_sync_time;
        }
        self.state_path = Some(path);
        Ok(self)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DataConnector for DirectoryConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_type(&self) -> SourceType {
        SourceType::Documents
    }

    async fn check_permissions(&self) -> Result<bool> {
        let root = self.root.clone();
        let readable = tokio::task::spawn_blocking(move || root.is_dir() && std::fs::read_dir(&root).is_ok())
            .await
            .map_err(|e| GraphRagError::Io(std::io::Error::other(e)))?;
        Ok(readable)
    }

    async fn fetch(&self, since: Option<DateTime<Utc>>, limit: Option<usize>) -> Result<Vec<SourceRecord>> {
        if !self.check_permissions().await? {
            return Err(GraphRagError::PermissionDenied(format!(
                "Cannot read documents folder {}",
                self.root.display()
            )));
        }
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || scan_directory(&root, since, limit))
            .await
            .map_err(|e| GraphRagError::Io(std::io::Error::other(e)))?
    }

    async fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read_last_sync())
    }

    async fn set_last_sync_time(&self, time: Option<DateTime<Utc>>) -> Result<()> {
        *self.last_sync.lock().unwrap_or_else(|e| e.into_inner()) = time;
        if let Some(path) = &self.state_path {
            let state = serde_json::to_string_pretty(&SyncState { last_sync_time: time })?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, state).await?;
        }
        Ok(())
    }
}

fn scan_directory(root: &Path, since: Option<DateTime<Utc>>, limit: Option<usize>) -> Result<Vec<SourceRecord>> {
    let mut records = Vec::new();

    for entry in WalkDir::new(root).follow_links(true).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_lowercase();
        if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
            continue;
        }

        let modified_at: DateTime<Utc> = std::fs::metadata(path)?.modified()?.into();
        if since.is_some_and(|since| modified_at <= since) {
            continue;
        }

        let relative_path = path
            .strip_prefix(root)
            .map_err(|_| GraphRagError::InvalidInput(format!("Path outside root: {}", path.display())))?
            .to_string_lossy()
            .replace('\\', "/");

        let bytes = std::fs::read(path)?;
        let raw = String::from_utf8_lossy(&bytes);
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&relative_path)
            .to_string();

        let (title, content) = match extension.as_str() {
            "md" | "markdown" => {
                let doc = markdown_to_text(&raw);
                (doc.title.unwrap_or(stem), doc.text)
            }
            _ => (stem, raw.trim().to_string()),
        };
        if content.is_empty() {
            log::debug!("Skipping empty document {}", relative_path);
            continue;
        }

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let hash = format!("{:x}", hasher.finalize());

        records.push(
            SourceRecord::new(stable_id("doc", &[&relative_path]), SourceType::Documents, title)
                .with_content(content)
                .with_field("path", relative_path)
                .with_field("extension", extension)
                .with_field("content_hash", hash)
                .with_modified_at(modified_at),
        );
    }

    records.sort_by(|a, b| {
        a.modified_at
            .cmp(&b.modified_at)
            .then_with(|| a.fields.get("path").cmp(&b.fields.get("path")))
    });
    if let Some(limit) = limit {
        records.truncate(limit);
    }

    log::info!("Discovered {} documents in {}", records.len(), root.display());
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("projects/atlas")).unwrap();
        fs::write(root.join("notes.txt"), "Alice met Bob in Oslo.").unwrap();
        fs::write(root.join("projects/atlas/README.md"), "# Atlas\n\nRun by **Carol**.").unwrap();
        fs::write(root.join("people.json"), r#"{"name": "Dave"}"#).unwrap();
        fs::write(root.join("empty.txt"), "   ").unwrap();
        fs::write(root.join("photo.png"), b"\x89PNG\r\n\x1a\n").unwrap();
        temp_dir
    }

    #[tokio::test]
    async fn test_fetch_supported_documents() {
        let dir = sample_tree();
        let connector = DirectoryConnector::new(dir.path());
        assert!(connector.check_permissions().await.unwrap());

        let records = connector.fetch(None, None).await.unwrap();
        assert_eq!(records.len(), 3);

        let readme = records
            .iter()
            .find(|r| r.field("path") == Some("projects/atlas/README.md"))
            .unwrap();
        assert_eq!(readme.title, "Atlas");
        assert!(readme.content.contains("Run by Carol."));
        assert_eq!(readme.field("content_hash").unwrap().len(), 64);
        assert!(records.iter().all(|r| r.source == SourceType::Documents));
    }

    #[tokio::test]
    async fn test_ids_are_stable_across_fetches() {
        let dir = sample_tree();
        let connector = DirectoryConnector::new(dir.path());
        let mut first: Vec<String> = connector.fetch(None, None).await.unwrap().into_iter().map(|r| r.id).collect();
        let mut second: Vec<String> = connector.fetch(None, None).await.unwrap().into_iter().map(|r| r.id).collect();
        first.sort();
        second.sort();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_since_and_limit() {
        let dir = sample_tree();
        let connector = DirectoryConnector::new(dir.path());
        assert_eq!(connector.fetch(None, Some(2)).await.unwrap().len(), 2);

        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(connector.fetch(Some(future), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_root_is_permission_denied() {
        let dir = TempDir::new().unwrap();
        let connector = DirectoryConnector::new(dir.path().join("missing"));
        assert!(!connector.has_required_permissions().await);
        let err = connector.fetch(None, None).await.unwrap_err();
        assert!(matches!(err, GraphRagError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_sync_state_persists() {
        let dir = sample_tree();
        let state = dir.path().join("state/sync.json");
        let stamp = Utc::now();

        let connector = DirectoryConnector::new(dir.path()).with_state_file(&state).unwrap();
        assert_eq!(connector.last_sync_time().await.unwrap(), None);
        connector.set_last_sync_time(Some(stamp)).await.unwrap();

        let reloaded = DirectoryConnector::new(dir.path()).with_state_file(&state).unwrap();
        assert_eq!(reloaded.last_sync_time().await.unwrap(), Some(stamp));

        reloaded.set_last_sync_time(None).await.unwrap();
        let reset = DirectoryConnector::new(dir.path()).with_state_file(&state).unwrap();
        assert_eq!(reset.last_sync_time().await.unwrap(), None);
    }
}
