//! Persistence for `<channel>_stats.json`, the rolling success-rate counters
//! consulted by proactive-engagement gating. Same atomic write-temp-rename
//! idiom as `followup.rs`.

use crate::error::Result;
use crate::model::ChannelStats;
use tokio::sync::Mutex;

pub struct StatsStore {
    path: std::path::PathBuf,
    lock: Mutex<()>,
}

impl StatsStore {
    pub fn new(path: std::path::PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    async fn write(&self, stats: &ChannelStats) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let serialized = serde_json::to_string_pretty(stats)?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &serialized).await.map_err(|source| {
            crate::error::MemoryError::Io { path: tmp_path.display().to_string(), source }
        })?;
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|source| {
            crate::error::MemoryError::Io { path: self.path.display().to_string(), source }
        })?;
        Ok(())
    }

    /// Loads current stats, or `ChannelStats::default()` if no file exists
    /// yet (success rate 0.5, "neutral" gating behavior).
    pub async fn load(&self) -> Result<ChannelStats> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ChannelStats::default()),
            Err(source) => Err(crate::error::MemoryError::Io {
                path: self.path.display().to_string(),
                source,
            }
            .into()),
        }
    }

    /// Increments `total_attempts`, recording that a proactive engagement
    /// was attempted this tick.
    pub async fn record_attempt(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut stats = self.load_unlocked().await?;
        stats.total_attempts += 1;
        stats.last_updated = chrono::Utc::now();
        self.write(&stats).await
    }

    /// Increments `successful_attempts`, called after success attribution
    /// observes activity within the attribution window.
    pub async fn record_success(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut stats = self.load_unlocked().await?;
        stats.successful_attempts += 1;
        stats.last_updated = chrono::Utc::now();
        self.write(&stats).await
    }

    async fn load_unlocked(&self) -> Result<ChannelStats> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ChannelStats::default()),
            Err(source) => Err(crate::error::MemoryError::Io {
                path: self.path.display().to_string(),
                source,
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_loads_as_neutral_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::new(dir.path().join("c1_stats.json"));
        let stats = store.load().await.unwrap();
        assert_eq!(stats.success_rate(), 0.5);
    }

    #[tokio::test]
    async fn record_attempt_and_success_update_rate() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::new(dir.path().join("c1_stats.json"));

        store.record_attempt().await.unwrap();
        store.record_attempt().await.unwrap();
        store.record_success().await.unwrap();

        let stats = store.load().await.unwrap();
        assert_eq!(stats.total_attempts, 2);
        assert_eq!(stats.successful_attempts, 1);
        assert_eq!(stats.success_rate(), 0.5);
    }
}
