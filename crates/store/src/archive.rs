//! Prompt archive — every outbound prompt saved for post-hoc review.

use std::path::PathBuf;

use chrono::Utc;
use tracing::warn;

/// Writes each archived prompt to `<dir>/<iso-timestamp>-<label>.txt` and
/// prunes files older than the retention window.
#[derive(Debug, Clone)]
pub struct PromptArchive {
    dir: PathBuf,
    retention_days: i64,
}

impl PromptArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), retention_days: 14 }
    }

    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = days;
        self
    }

    /// Archive one prompt. Failures are logged, never propagated — archiving
    /// must not interfere with the live call path.
    pub async fn save(&self, label: &str, prompt: &str) {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let safe_label: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .take(48)
            .collect();
        let path = self.dir.join(format!("{stamp}-{safe_label}.txt"));

        if let Err(err) = tokio::fs::create_dir_all(&self.dir).await {
            warn!(%err, "prompt archive directory unavailable");
            return;
        }
        if let Err(err) = tokio::fs::write(&path, prompt).await {
            warn!(path = %path.display(), %err, "prompt archive write failed");
        }
    }

    /// Remove archived prompts older than the retention window. Returns the
    /// number of files removed.
    pub async fn sweep(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(self.retention_days);
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return 0;
        };
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else { continue };
            let Ok(modified) = meta.modified() else { continue };
            let modified: chrono::DateTime<Utc> = modified.into();
            if modified < cutoff && tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }
}
