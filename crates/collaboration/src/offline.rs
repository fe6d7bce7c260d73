/// Offline support: queue outbound messages while disconnected, persist the
/// queue across restarts, and pace reconnect attempts
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

use crate::{CollaborationError, Result, SessionId, SyncMessage, UserId};

/// Messages written while offline, replayed in order on reconnect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineQueue {
    pub session_id: SessionId,
    pub user_id: UserId,
    pending: Vec<SyncMessage>,
    /// Document version seen before the connection dropped
    pub last_known_version: u64,
    pub created_at: DateTime<Utc>,
}

impl OfflineQueue {
    pub fn new(session_id: SessionId, user_id: UserId) -> Self {
        Self {
            session_id,
            user_id,
            pending: Vec::new(),
            last_known_version: 0,
            created_at: Utc::now(),
        }
    }

    pub fn enqueue(&mut self, message: SyncMessage) {
        self.pending.push(message);
    }

    pub fn pending(&self) -> &[SyncMessage] {
        &self.pending
    }

    pub fn drain_pending(&mut self) -> Vec<SyncMessage> {
        std::mem::take(&mut self.pending)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Stores offline queues as JSON files, one per session
pub struct OfflineQueueManager {
    storage_dir: PathBuf,
}

impl OfflineQueueManager {
    pub fn new(storage_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: storage_dir.as_ref().to_path_buf(),
        }
    }

    fn queue_path(&self, session_id: SessionId) -> PathBuf {
        self.storage_dir
            .join(format!("offline_queue_{}.json", session_id.0))
    }

    /// Write `queue` to disk; an empty queue removes any saved file
    pub async fn save(&self, queue: &OfflineQueue) -> Result<()> {
        if queue.is_empty() {
            return self.delete(queue.session_id).await;
        }

        fs::create_dir_all(&self.storage_dir).await?;
        let json = serde_json::to_string_pretty(queue)?;
        fs::write(self.queue_path(queue.session_id), json).await?;

        debug!(
            "Saved {} offline messages for {}",
            queue.len(),
            queue.session_id
        );
        Ok(())
    }

    pub async fn load(&self, session_id: SessionId) -> Result<Option<OfflineQueue>> {
        let path = self.queue_path(session_id);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }

        let json = fs::read_to_string(&path).await?;
        let queue: OfflineQueue = serde_json::from_str(&json)?;
        if queue.session_id != session_id {
            return Err(CollaborationError::StorageError(format!(
                "{} holds a queue for another session",
                path.display()
            )));
        }

        info!("Loaded {} offline messages for {}", queue.len(), session_id);
        Ok(Some(queue))
    }

    pub async fn delete(&self, session_id: SessionId) -> Result<()> {
        let path = self.queue_path(session_id);
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

/// Exponential reconnect delay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    factor: u32,
    max: Duration,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, factor: u32, max: Duration) -> Self {
        Self {
            base,
            factor: factor.max(1),
            max,
            max_attempts: None,
            attempt: 0,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, `None` when the attempt limit is reached
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(limit) = self.max_attempts {
            if self.attempt >= limit {
                return None;
            }
        }

        let multiplier = self.factor.saturating_pow(self.attempt);
        let delay = self.base.saturating_mul(multiplier).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), 2, Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChatCommand, NewMessage, PresenceUpdate};

    fn chat(text: &str) -> SyncMessage {
        SyncMessage::Chat {
            command: ChatCommand::Send {
                message: NewMessage::text(text),
            },
        }
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(SessionId::new(), UserId::new());
        assert!(queue.is_empty());

        queue.enqueue(chat("one"));
        queue.enqueue(chat("two"));
        assert_eq!(queue.len(), 2);

        let drained = queue.drain_pending();
        assert_eq!(drained, vec![chat("one"), chat("two")]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_queue_manager_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = OfflineQueueManager::new(dir.path().join("queues"));
        let session_id = SessionId::new();

        assert!(manager.load(session_id).await.unwrap().is_none());

        let mut queue = OfflineQueue::new(session_id, UserId::new());
        queue.last_known_version = 7;
        queue.enqueue(chat("saved"));
        queue.enqueue(SyncMessage::Presence {
            user_id: None,
            update: PresenceUpdate::Heartbeat,
        });
        manager.save(&queue).await.unwrap();

        let loaded = manager.load(session_id).await.unwrap().unwrap();
        assert_eq!(loaded, queue);

        manager.delete(session_id).await.unwrap();
        assert!(manager.load(session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_saving_empty_queue_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = OfflineQueueManager::new(dir.path());
        let mut queue = OfflineQueue::new(SessionId::new(), UserId::new());

        queue.enqueue(chat("x"));
        manager.save(&queue).await.unwrap();
        queue.drain_pending();
        manager.save(&queue).await.unwrap();

        assert!(manager.load(queue.session_id).await.unwrap().is_none());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::default();
        let delays: Vec<_> = (0..8).filter_map(|_| backoff.next_delay()).collect();
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[1], Duration::from_secs(1));
        assert_eq!(delays[2], Duration::from_secs(2));
        assert_eq!(delays[7], Duration::from_secs(30));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_backoff_attempt_limit() {
        let mut backoff = Backoff::default().with_max_attempts(2);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempt(), 2);
    }
}
