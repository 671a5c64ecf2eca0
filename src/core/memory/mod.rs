pub mod types;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::MemoryConfig;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::llm::ChatMessage;
use types::{ConversationEntry, Role};

type Store = BTreeMap<String, Vec<ConversationEntry>>;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Per-chat message history, bounded in length and age, persisted as one
/// JSON document keyed by canonical chat id.
pub struct ConversationMemory {
    path: PathBuf,
    max_messages: usize,
    max_age_ms: i64,
    chats: Store,
}

impl ConversationMemory {
    pub fn new<P: AsRef<Path>>(path: P, max_messages: usize, max_age: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_messages: max_messages.max(1),
            max_age_ms: max_age.as_millis() as i64,
            chats: Store::new(),
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(
            &config.file,
            config.max_messages,
            Duration::from_secs(config.max_age_hours * 3600),
        )
    }

    /// Load the store from disk and prune it. A missing or unreadable file
    /// leaves the store empty; the parent directory is created if needed.
    pub async fn load(mut self) -> Self {
        match self.try_load().await {
            Ok(true) => info!(
                "[Memory] Loaded conversation history for {} chats.",
                self.chats.len()
            ),
            Ok(false) => {}
            Err(e) => error!("[Memory] Error loading {}: {}", self.path.display(), e),
        }
        self
    }

    async fn try_load(&mut self) -> Result<bool> {
        if fs::try_exists(&self.path).await? {
            let data = fs::read_to_string(&self.path).await?;
            self.chats = serde_json::from_str(&data)?;
            self.prune_at(now_millis());
            Ok(true)
        } else {
            if let Some(dir) = self.path.parent()
                && !dir.as_os_str().is_empty()
            {
                fs::create_dir_all(dir).await?;
            }
            Ok(false)
        }
    }

    pub fn add_message(&mut self, chat_id: &str, role: Role, content: &str) {
        self.add_message_at(chat_id, role, content, now_millis());
    }

    pub fn add_message_at(&mut self, chat_id: &str, role: Role, content: &str, timestamp: i64) {
        let history = self.chats.entry(chat_id.to_string()).or_default();
        history.push(ConversationEntry {
            role,
            content: content.to_string(),
            timestamp,
        });
        if history.len() > self.max_messages {
            let excess = history.len() - self.max_messages;
            history.drain(..excess);
        }
    }

    /// Entries younger than the age limit, oldest first.
    pub fn history(&self, chat_id: &str) -> Vec<ChatMessage> {
        self.history_at(chat_id, now_millis())
    }

    pub fn history_at(&self, chat_id: &str, now: i64) -> Vec<ChatMessage> {
        self.chats
            .get(chat_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| now - e.timestamp < self.max_age_ms)
                    .map(|e| ChatMessage::new(e.role.as_str(), e.content.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop expired entries and chats left empty. Returns the number of
    /// entries removed.
    pub fn prune_at(&mut self, now: i64) -> usize {
        let max_age = self.max_age_ms;
        let mut removed = 0;
        self.chats.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| now - e.timestamp < max_age);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    /// Prune, then write the whole store through a temp file and rename.
    pub async fn flush(&mut self) -> Result<()> {
        self.prune_at(now_millis());
        let data = serde_json::to_vec(&self.chats)?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub fn chat_count(&self) -> usize {
        self.chats.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Periodically flushes [`ConversationMemory`] to disk; flushes once more on
/// shutdown.
pub struct MemoryFlusher {
    memory: Arc<Mutex<ConversationMemory>>,
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl MemoryFlusher {
    pub fn new(memory: Arc<Mutex<ConversationMemory>>, interval: Duration) -> Self {
        Self {
            memory,
            interval,
            task: None,
        }
    }
}

pub async fn flush_logged(memory: &Mutex<ConversationMemory>) {
    let mut mem = memory.lock().await;
    if let Err(e) = mem.flush().await {
        error!("[Memory] Error saving {}: {}", mem.path().display(), e);
    }
}

#[async_trait]
impl LifecycleComponent for MemoryFlusher {
    async fn on_start(&mut self) -> Result<()> {
        let memory = self.memory.clone();
        let period = self.interval;
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                flush_logged(&memory).await;
            }
        }));
        info!("[Memory] Flushing every {:?}", period);
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        flush_logged(&self.memory).await;
        info!("[Memory] Final flush complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_MS: i64 = 3600 * 1000;

    fn memory_at(dir: &Path) -> ConversationMemory {
        ConversationMemory::new(dir.join("memory.json"), 50, Duration::from_secs(48 * 3600))
    }

    #[test]
    fn history_is_capped_oldest_dropped_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = memory_at(dir.path());
        let now = now_millis();
        for i in 0..55 {
            mem.add_message_at("chat", Role::User, &format!("m{}", i), now);
        }
        let history = mem.history_at("chat", now);
        assert_eq!(history.len(), 50);
        assert_eq!(history[0].content, "m5");
        assert_eq!(history[49].content, "m54");
    }

    #[test]
    fn expired_entries_are_hidden_and_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = memory_at(dir.path());
        let now = now_millis();
        mem.add_message_at("old", Role::User, "stale", now - 49 * HOUR_MS);
        mem.add_message_at("mixed", Role::User, "stale", now - 49 * HOUR_MS);
        mem.add_message_at("mixed", Role::Assistant, "fresh", now - HOUR_MS);

        assert!(mem.history_at("old", now).is_empty());
        assert_eq!(
            mem.history_at("mixed", now),
            vec![ChatMessage::new("assistant", "fresh")]
        );

        assert_eq!(mem.prune_at(now), 2);
        assert_eq!(mem.chat_count(), 1);
    }

    #[test]
    fn history_keeps_insertion_order_and_roles() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = memory_at(dir.path());
        mem.add_message("c", Role::User, "question");
        mem.add_message("c", Role::Assistant, "answer");
        assert_eq!(
            mem.history("c"),
            vec![
                ChatMessage::new("user", "question"),
                ChatMessage::new("assistant", "answer")
            ]
        );
        assert!(mem.history("unknown").is_empty());
    }

    #[tokio::test]
    async fn flush_then_load_round_trips_and_drops_expired() {
        let dir = tempfile::tempdir().unwrap();
        let mut mem = memory_at(dir.path());
        let now = now_millis();
        mem.add_message_at("a", Role::User, "kept", now);
        mem.add_message_at("b", Role::User, "expired", now - 50 * HOUR_MS);
        mem.flush().await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("memory.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(doc.get("b").is_none());
        assert_eq!(doc["a"][0]["role"], "user");
        assert_eq!(doc["a"][0]["content"], "kept");

        let reloaded = memory_at(dir.path()).load().await;
        assert_eq!(reloaded.history("a"), vec![ChatMessage::new("user", "kept")]);
    }

    #[tokio::test]
    async fn load_prunes_stale_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let stale = now_millis() - 72 * HOUR_MS;
        let doc = serde_json::json!({
            "x": [{"role": "user", "content": "ancient", "timestamp": stale}]
        });
        std::fs::write(dir.path().join("memory.json"), doc.to_string()).unwrap();

        let mem = memory_at(dir.path()).load().await;
        assert_eq!(mem.chat_count(), 0);
    }

    #[tokio::test]
    async fn corrupt_file_yields_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("memory.json"), "{not json").unwrap();
        let mem = memory_at(dir.path()).load().await;
        assert_eq!(mem.chat_count(), 0);
    }

    #[tokio::test]
    async fn load_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("data").join("memory.json");
        let mem = ConversationMemory::new(&nested, 50, Duration::from_secs(3600))
            .load()
            .await;
        assert_eq!(mem.chat_count(), 0);
        assert!(dir.path().join("data").is_dir());
    }

    #[tokio::test]
    async fn failed_flush_is_logged_and_store_stays_usable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let memory = Mutex::new(ConversationMemory::new(
            blocker.join("memory.json"),
            50,
            Duration::from_secs(3600),
        ));

        memory.lock().await.add_message("chat", Role::User, "before");
        assert!(memory.lock().await.flush().await.is_err());
        flush_logged(&memory).await;

        let mut mem = memory.lock().await;
        mem.add_message("chat", Role::Assistant, "after");
        assert_eq!(
            mem.history("chat"),
            vec![
                ChatMessage::new("user", "before"),
                ChatMessage::new("assistant", "after")
            ]
        );
        assert!(!blocker.join("memory.json").exists());
    }
}
