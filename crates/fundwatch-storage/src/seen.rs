//! Flat-file record of ids that were already notified, one file per source.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Context;
use fundwatch_core::DEFAULT_RETENTION;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Ordered, append-only set of dispatched ids for one source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeenSet {
    ids: Vec<String>,
    index: HashSet<String>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    /// Appends `id`; ids already present keep their original position.
    pub fn record(&mut self, id: impl Into<String>) {
        let id = id.into();
        if self.index.insert(id.clone()) {
            self.ids.push(id);
        }
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The most recent `keep` ids, oldest first.
    pub fn retained(&self, keep: usize) -> &[String] {
        let start = self.ids.len().saturating_sub(keep);
        &self.ids[start..]
    }
}

impl<S: Into<String>> FromIterator<S> for SeenSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = Self::new();
        for id in iter {
            set.record(id);
        }
        set
    }
}

/// Directory holding one `.<state_key>_pushed` file per source.
#[derive(Debug, Clone)]
pub struct SeenStore {
    root: PathBuf,
    retention: usize,
}

impl SeenStore {
    pub fn new(root: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            root: root.into(),
            retention,
        }
    }

    pub fn with_default_retention(root: impl Into<PathBuf>) -> Self {
        Self::new(root, DEFAULT_RETENTION)
    }

    pub fn path_for(&self, state_key: &str) -> PathBuf {
        self.root.join(format!(".{state_key}_pushed"))
    }

    /// Missing or unreadable state means no prior history.
    pub async fn load(&self, state_key: &str) -> SeenSet {
        let path = self.path_for(state_key);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no seen-set yet");
                return SeenSet::new();
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable seen-set, starting empty");
                return SeenSet::new();
            }
        };

        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect()
    }

    /// Replaces the state file with the last `retention` ids, newline-joined.
    pub async fn persist(&self, state_key: &str, seen: &SeenSet) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating state directory {}", self.root.display()))?;

        let path = self.path_for(state_key);
        let contents = seen.retained(self.retention).join("\n");
        let temp_path = self
            .root
            .join(format!(".{state_key}_pushed.{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp seen-set file {}", temp_path.display()))?;
        file.write_all(contents.as_bytes())
            .await
            .with_context(|| format!("writing temp seen-set file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp seen-set file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp seen-set {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        debug!(path = %path.display(), ids = seen.retained(self.retention).len(), "persisted seen-set");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn record_keeps_insertion_order_and_ignores_repeats() {
        let mut seen: SeenSet = ["1", "2"].into_iter().collect();
        seen.record("3");
        seen.record("1");
        assert_eq!(seen.ids(), ["1", "2", "3"]);
        assert!(seen.contains("2"));
        assert!(!seen.contains("4"));
    }

    #[test]
    fn retained_drops_oldest_first() {
        let seen: SeenSet = (0..150).map(|i| i.to_string()).collect();
        let kept = seen.retained(100);
        assert_eq!(kept.len(), 100);
        assert_eq!(kept.first().map(String::as_str), Some("50"));
        assert_eq!(kept.last().map(String::as_str), Some("149"));
        assert_eq!(SeenSet::new().retained(100).len(), 0);
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = SeenStore::with_default_retention(dir.path());
        assert!(store.load("sourceb").await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = SeenStore::with_default_retention(dir.path());
        std::fs::write(store.path_for("sourcea"), [0xff, 0xfe, 0x00, 0xc3]).unwrap();
        assert!(store.load("sourcea").await.is_empty());
    }

    #[tokio::test]
    async fn load_trims_lines_and_skips_blanks() {
        let dir = tempdir().expect("tempdir");
        let store = SeenStore::with_default_retention(dir.path());
        std::fs::write(store.path_for("sourcea"), "1\r\n 2 \n\n3\n").unwrap();
        let seen = store.load("sourcea").await;
        assert_eq!(seen.ids(), ["1", "2", "3"]);
    }

    #[tokio::test]
    async fn persist_writes_newline_joined_ids_without_trailing_newline() {
        let dir = tempdir().expect("tempdir");
        let store = SeenStore::with_default_retention(dir.path());
        let seen: SeenSet = ["a", "b", "c"].into_iter().collect();
        let path = store.persist("sourceb", &seen).await.expect("persist");
        assert_eq!(path, dir.path().join(".sourceb_pushed"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\nc");
    }

    #[tokio::test]
    async fn persist_replaces_file_and_enforces_retention() {
        let dir = tempdir().expect("tempdir");
        let store = SeenStore::new(dir.path(), 100);
        std::fs::write(store.path_for("sourcea"), "old\nstale\nlines\nthat\nare\nlong").unwrap();

        let seen: SeenSet = (0..250).map(|i| format!("id-{i}")).collect();
        store.persist("sourcea", &seen).await.expect("persist");

        let reloaded = store.load("sourcea").await;
        assert_eq!(reloaded.len(), 100);
        assert_eq!(reloaded.ids()[0], "id-150");
        assert_eq!(reloaded.ids()[99], "id-249");
        assert!(!reloaded.contains("old"));

        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn sources_use_independent_files() {
        let dir = tempdir().expect("tempdir");
        let store = SeenStore::with_default_retention(dir.path());
        store
            .persist("sourcea", &["1"].into_iter().collect())
            .await
            .unwrap();
        store
            .persist("sourceb", &["2"].into_iter().collect())
            .await
            .unwrap();
        assert_eq!(store.load("sourcea").await.ids(), ["1"]);
        assert_eq!(store.load("sourceb").await.ids(), ["2"]);
    }

    #[tokio::test]
    async fn persist_creates_missing_state_directory() {
        let dir = tempdir().expect("tempdir");
        let store = SeenStore::with_default_retention(dir.path().join("nested/state"));
        store
            .persist("sourcea", &["x"].into_iter().collect())
            .await
            .expect("persist");
        assert_eq!(store.load("sourcea").await.ids(), ["x"]);
    }
}
