//! Persistence for `followups.json`, the per-server list of pending and
//! completed follow-up reminders the agentic engine dispatches.
//!
//! Writes are full-file atomic (write to a temp file, then rename), the same
//! idiom the teacher uses for its SQLite writer's durability guarantees
//! extended here to a flat-file JSON store since there is no relational
//! schema backing this particular piece of per-bot state.

use crate::error::Result;
use crate::model::{Followup, FollowupFile, FollowupStatus};
use tokio::sync::Mutex;

/// Guards one server's `followups.json` against concurrent read-modify-write
/// races between the agentic tick and any other writer.
pub struct FollowupStore {
    path: std::path::PathBuf,
    lock: Mutex<()>,
}

impl FollowupStore {
    pub fn new(path: std::path::PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<FollowupFile> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FollowupFile::default()),
            Err(source) => Err(crate::error::MemoryError::Io {
                path: self.path.display().to_string(),
                source,
            }
            .into()),
        }
    }

    async fn write(&self, file: &FollowupFile) -> Result<()> {
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

    /// Snapshot of the current file contents.
    pub async fn load(&self) -> Result<FollowupFile> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// Appends a new pending follow-up.
    pub async fn add(&self, followup: Followup) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        file.pending.push(followup);
        self.write(&file).await
    }

    /// Moves the record with `id` from `pending` to `completed`, stamping
    /// `completed_date`. No-op if `id` is not found among pending records.
    pub async fn complete(&self, id: &str, completed_date: chrono::DateTime<chrono::Utc>) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;
        if let Some(pos) = file.pending.iter().position(|f| f.id == id) {
            let mut followup = file.pending.remove(pos);
            followup.status = FollowupStatus::Completed;
            followup.completed_date = Some(completed_date);
            file.completed.push(followup);
        }
        self.write(&file).await
    }

    /// Prunes `completed` records whose `completed_date` is older than
    /// `max_age_days`, and drops `pending` records older than `horizon_days`
    /// regardless of status (a bounded discard, per spec's maintenance step).
    pub async fn prune(&self, max_age_days: i64, horizon_days: i64, now: chrono::DateTime<chrono::Utc>) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut file = self.read().await?;

        file.completed.retain(|f| {
            f.completed_date
                .map(|d| (now - d).num_days() < max_age_days)
                .unwrap_or(true)
        });
        file.pending
            .retain(|f| (now - f.mentioned_date).num_days() < horizon_days);

        self.write(&file).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;

    fn sample(id: &str) -> Followup {
        let now = chrono::Utc::now();
        Followup {
            id: id.into(),
            user_id: "user-1".into(),
            user_name: "Alice".into(),
            channel_id: "c1".into(),
            event: "asked about the release".into(),
            context: "wanted to know when 2.0 ships".into(),
            mentioned_date: now,
            follow_up_after: now,
            priority: Priority::Medium,
            status: FollowupStatus::Pending,
            completed_date: None,
        }
    }

    #[tokio::test]
    async fn add_then_complete_moves_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FollowupStore::new(dir.path().join("followups.json"));

        store.add(sample("f1")).await.unwrap();
        let file = store.load().await.unwrap();
        assert_eq!(file.pending.len(), 1);
        assert!(file.completed.is_empty());

        let completed_at = chrono::Utc::now();
        store.complete("f1", completed_at).await.unwrap();

        let file = store.load().await.unwrap();
        assert!(file.pending.is_empty());
        assert_eq!(file.completed.len(), 1);
        assert_eq!(file.completed[0].completed_date, Some(completed_at));
    }

    #[tokio::test]
    async fn complete_of_unknown_id_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = FollowupStore::new(dir.path().join("followups.json"));
        store.add(sample("f1")).await.unwrap();
        store.complete("missing", chrono::Utc::now()).await.unwrap();

        let file = store.load().await.unwrap();
        assert_eq!(file.pending.len(), 1);
    }

    #[tokio::test]
    async fn prune_removes_old_completed_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FollowupStore::new(dir.path().join("followups.json"));

        let mut old = sample("f1");
        old.status = FollowupStatus::Completed;
        old.completed_date = Some(chrono::Utc::now() - chrono::Duration::days(30));
        store.add(old).await.unwrap();
        store.complete("f1", chrono::Utc::now() - chrono::Duration::days(30)).await.unwrap();

        store.prune(14, 365, chrono::Utc::now()).await.unwrap();
        let file = store.load().await.unwrap();
        assert!(file.completed.is_empty());
    }
}
