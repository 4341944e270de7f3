use std::{io, path::PathBuf, sync::Arc};

use chrono::Utc;
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

/// Append-only, timestamped log file for one session.
///
/// Every session gets its own `<log_dir>/<session_id>.log` recording spawn
/// arguments, protocol lines, stderr output and exit status, so a session can
/// be audited after the fact even if the caller discarded its event stream.
/// Write failures are logged and swallowed: the audit log must never become
/// a failure source for the session itself.
#[derive(Clone)]
pub struct SessionLogger {
    path: PathBuf,
    file: Arc<Mutex<fs::File>>,
}

impl SessionLogger {
    pub async fn create(log_dir: impl Into<PathBuf>, session_id: &str) -> io::Result<Self> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir).await?;
        let path = log_dir.join(format!("{session_id}.log"));
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append one timestamped line. Best-effort.
    pub async fn log(&self, line: &str) {
        let entry = format!("{} {}\n", Utc::now().to_rfc3339(), line.trim_end());
        let mut file = self.file.lock().await;
        if let Err(e) = file.write_all(entry.as_bytes()).await {
            tracing::warn!("failed to append to session log {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_timestamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = SessionLogger::create(dir.path(), "sess-1").await.unwrap();
        logger.log("spawned agent").await;
        logger.log("tool: Read a.txt\n").await;

        let content = tokio::fs::read_to_string(logger.path()).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("spawned agent"));
        assert!(lines[1].ends_with("tool: Read a.txt"));
        // Each line starts with an RFC 3339 timestamp.
        for line in lines {
            let ts = line.split_whitespace().next().unwrap();
            assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
        }
    }

    #[tokio::test]
    async fn reopening_appends_rather_than_truncates() {
        let dir = tempfile::tempdir().unwrap();
        {
            let logger = SessionLogger::create(dir.path(), "sess-2").await.unwrap();
            logger.log("first").await;
        }
        let logger = SessionLogger::create(dir.path(), "sess-2").await.unwrap();
        logger.log("second").await;
        let content = tokio::fs::read_to_string(logger.path()).await.unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
