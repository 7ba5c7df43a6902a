//! Atomic JSON document persistence and the debounced writer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};
use tracing::warn;

use crate::Result;

/// Atomically replace `path` with the JSON rendering of `value`.
///
/// The document is written to a `.tmp` sibling, fsync'd, then renamed over
/// the original. A crash before the rename leaves the original untouched; a
/// crash after leaves a consistent new file. The `.tmp` file is removed on
/// every error path.
pub async fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp_path = {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "state.json".to_string());
        path.with_file_name(format!("{filename}.tmp"))
    };

    let rendered = serde_json::to_vec_pretty(value)?;

    let write_result: Result<()> = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(&rendered).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(err) = write_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err);
    }

    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }

    Ok(())
}

/// Read a JSON document, returning `None` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

// ── Debounced writer ──────────────────────────────────────────────────────────

struct DebounceInner<T> {
    pending: Mutex<Option<T>>,
    notify: Notify,
    path: PathBuf,
}

/// Coalesces rapid state updates into at most one disk write per debounce
/// window. The final pending value is always flushed — `flush_now` is called
/// during shutdown to guarantee nothing is lost.
pub struct DebouncedWriter<T> {
    inner: Arc<DebounceInner<T>>,
    handle: tokio::task::JoinHandle<()>,
}

impl<T: Serialize + Send + Sync + 'static> DebouncedWriter<T> {
    pub fn spawn(path: PathBuf, window: Duration) -> Self {
        let inner = Arc::new(DebounceInner {
            pending: Mutex::new(None),
            notify: Notify::new(),
            path,
        });

        let task_inner = inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                task_inner.notify.notified().await;
                // Collect further updates for the rest of the window; only
                // the newest value is written.
                tokio::time::sleep(window).await;
                let value = task_inner.pending.lock().await.take();
                if let Some(value) = value {
                    if let Err(err) = atomic_write_json(&task_inner.path, &value).await {
                        warn!(path = %task_inner.path.display(), %err, "debounced write failed — in-memory state stays authoritative");
                    }
                }
            }
        });

        Self { inner, handle }
    }

    /// Queue `value` for writing. Overwrites any not-yet-flushed value.
    pub async fn write(&self, value: T) {
        *self.inner.pending.lock().await = Some(value);
        self.inner.notify.notify_one();
    }

    /// Write any pending value immediately, bypassing the window.
    pub async fn flush_now(&self) -> Result<()> {
        let value = self.inner.pending.lock().await.take();
        if let Some(value) = value {
            atomic_write_json(&self.inner.path, &value).await?;
        }
        Ok(())
    }
}

impl<T> Drop for DebouncedWriter<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Doc {
        n: u32,
        text: String,
    }

    #[tokio::test]
    async fn atomic_write_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let doc = Doc { n: 7, text: "hello".to_string() };

        atomic_write_json(&path, &doc).await.unwrap();
        let loaded: Doc = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded, doc);

        // No .tmp residue after a successful write.
        assert!(!dir.path().join("doc.json.tmp").exists());
    }

    #[test]
    fn read_missing_file_is_none() {
        let got: Option<Doc> = read_json(Path::new("/no/such/file.json")).unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn debounced_writer_coalesces_and_flushes_latest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let writer = DebouncedWriter::spawn(path.clone(), Duration::from_secs(60));

        for n in 0..5 {
            writer.write(Doc { n, text: format!("v{n}") }).await;
        }
        // The window has not elapsed — nothing on disk yet.
        assert!(!path.exists());

        writer.flush_now().await.unwrap();
        let loaded: Doc = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded.n, 4, "only the newest queued value must be written");
    }

    #[tokio::test]
    async fn debounced_writer_writes_after_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let writer = DebouncedWriter::spawn(path.clone(), Duration::from_millis(20));

        writer.write(Doc { n: 1, text: "x".to_string() }).await;
        tokio::time::sleep(Duration::from_millis(120)).await;

        let loaded: Doc = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded.n, 1);
    }
}
