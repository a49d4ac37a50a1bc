//! Per-day accounting for the server-side `web_search`/`web_fetch` tools
//! (§4.5). The provider executes these itself; this store only tracks how
//! many calls have been spent today so `ToolRouter` can stop advertising the
//! tools once the quota is exhausted. Same atomic write-temp-rename idiom as
//! `memory::stats::StatsStore`.

use crate::error::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// One UTC day's usage, keyed by `YYYY-MM-DD` in the file per §6's
/// persisted state layout (`persistence/<bot>_web_search_stats.json`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct DayUsage {
    used: u32,
}

type QuotaFile = HashMap<String, DayUsage>;

pub struct WebQuotaStore {
    path: std::path::PathBuf,
    max_daily: u32,
    lock: Mutex<()>,
}

impl WebQuotaStore {
    pub fn new(path: std::path::PathBuf, max_daily: u32) -> Self {
        Self { path, max_daily, lock: Mutex::new(()) }
    }

    async fn load(&self) -> Result<QuotaFile> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(QuotaFile::default()),
            Err(source) => Err(crate::error::MemoryError::Io { path: self.path.display().to_string(), source }.into()),
        }
    }

    async fn save(&self, file: &QuotaFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let serialized = serde_json::to_string_pretty(file)?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &serialized).await.map_err(|source| {
            crate::error::MemoryError::Io { path: tmp_path.display().to_string(), source }
        })?;
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|source| {
            crate::error::MemoryError::Io { path: self.path.display().to_string(), source }
        })?;
        Ok(())
    }

    /// Remaining calls today, per the `YYYY-MM-DD` entry for the current
    /// UTC day (absent entries count as zero used).
    pub async fn remaining(&self) -> Result<u32> {
        let _guard = self.lock.lock().await;
        let file = self.load().await?;
        let used = file.get(&today_key()).map(|d| d.used).unwrap_or(0);
        Ok(self.max_daily.saturating_sub(used))
    }

    /// Records one server-side tool call against today's entry, saturating
    /// at zero remaining.
    pub async fn record_use(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        let entry = file.entry(today_key()).or_default();
        entry.used = entry.used.saturating_add(1);
        self.save(&file).await
    }
}

fn today_key() -> String {
    Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_with_full_quota() {
        let dir = tempfile::tempdir().unwrap();
        let store = WebQuotaStore::new(dir.path().join("web_search_stats.json"), 300);
        assert_eq!(store.remaining().await.unwrap(), 300);
    }

    #[tokio::test]
    async fn record_use_decrements_remaining() {
        let dir = tempfile::tempdir().unwrap();
        let store = WebQuotaStore::new(dir.path().join("web_search_stats.json"), 300);
        store.record_use().await.unwrap();
        store.record_use().await.unwrap();
        assert_eq!(store.remaining().await.unwrap(), 298);
    }

    #[tokio::test]
    async fn quota_saturates_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = WebQuotaStore::new(dir.path().join("web_search_stats.json"), 1);
        store.record_use().await.unwrap();
        store.record_use().await.unwrap();
        assert_eq!(store.remaining().await.unwrap(), 0);
    }
}
