//! Cached settings, user profile and conversation history
//!
//! The key-value store is the source of truth. The cache lives behind one
//! async mutex so read-modify-write sequences from concurrent handlers never
//! interleave.

use crate::error::ChatEmError;
use crate::models::{
    Message, Settings, UserProfile, CONVERSATION_HISTORY_KEY, MAX_HISTORY_SIZE, SETTINGS_KEY,
    USER_PROFILE_KEY,
};
use crate::storage::{get_item, save_item, KeyValueStore};
use log::{info, warn};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Result of a mutation that stays applied in memory even when it could not
/// be written to storage
#[derive(Debug, Clone)]
pub struct Persisted<T> {
    pub value: T,
    pub warning: Option<String>,
}

impl<T> Persisted<T> {
    fn new(value: T, write: Result<(), ChatEmError>, what: &str) -> Self {
        let warning = write.err().map(|e| {
            warn!("[state] Failed to persist {}: {}", what, e);
            format!("{} kept in memory but not saved: {}", what, e)
        });
        Self { value, warning }
    }
}

#[derive(Default)]
struct Cache {
    settings: Settings,
    profile: Option<UserProfile>,
    history: Vec<Message>,
}

pub struct StateManager {
    store: Arc<dyn KeyValueStore>,
    cache: Mutex<Cache>,
}

/// Drops the oldest entries beyond the bound
fn truncate_history(history: &mut Vec<Message>) {
    if history.len() > MAX_HISTORY_SIZE {
        let excess = history.len() - MAX_HISTORY_SIZE;
        history.drain(..excess);
    }
}

impl StateManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(Cache::default()),
        }
    }

    /// Fills the cache from storage at context startup.
    ///
    /// Each piece loads independently; the first failure is returned after
    /// the rest have been attempted.
    pub async fn load(&self) -> Result<(), ChatEmError> {
        let settings = self.reload_settings().await;
        let profile = self.reload_profile().await;
        let history = self.reload_history().await;

        settings.and(profile.map(|_| ())).and(history.map(|_| ()))
    }

    pub async fn settings(&self) -> Settings {
        self.cache.lock().await.settings.clone()
    }

    /// Re-reads settings from storage, writing defaults when none exist yet.
    /// Unreadable settings fall back to defaults and are not overwritten.
    pub async fn reload_settings(&self) -> Result<Settings, ChatEmError> {
        let mut cache = self.cache.lock().await;
        match get_item::<Settings>(self.store.as_ref(), SETTINGS_KEY).await {
            Ok(Some(settings)) => {
                cache.settings = settings;
            }
            Ok(None) => {
                info!("[state] No stored settings, saving defaults");
                cache.settings = Settings::default();
                save_item(self.store.as_ref(), SETTINGS_KEY, &cache.settings).await?;
            }
            Err(e @ ChatEmError::Serialization { .. }) => {
                warn!("[state] Stored settings unreadable, using defaults: {}", e);
                cache.settings = Settings::default();
            }
            Err(e) => return Err(e),
        }
        Ok(cache.settings.clone())
    }

    /// Validates, clamps and persists a single setting
    pub async fn update_setting(
        &self,
        key: &str,
        value: &Value,
    ) -> Result<Persisted<Settings>, ChatEmError> {
        let mut cache = self.cache.lock().await;
        let mut updated = cache.settings.clone();
        updated.apply_update(key, value)?;

        cache.settings = updated;
        let write = save_item(self.store.as_ref(), SETTINGS_KEY, &cache.settings).await;
        Ok(Persisted::new(cache.settings.clone(), write, "Settings"))
    }

    /// Merges a partial settings object. Nothing is applied unless every key
    /// validates.
    pub async fn save_settings(
        &self,
        partial: &Map<String, Value>,
    ) -> Result<Persisted<Settings>, ChatEmError> {
        let mut cache = self.cache.lock().await;
        let mut updated = cache.settings.clone();
        for (key, value) in partial {
            updated.apply_update(key, value)?;
        }

        cache.settings = updated;
        let write = save_item(self.store.as_ref(), SETTINGS_KEY, &cache.settings).await;
        Ok(Persisted::new(cache.settings.clone(), write, "Settings"))
    }

    pub async fn profile(&self) -> Option<UserProfile> {
        self.cache.lock().await.profile.clone()
    }

    pub async fn reload_profile(&self) -> Result<Option<UserProfile>, ChatEmError> {
        let mut cache = self.cache.lock().await;
        match get_item::<UserProfile>(self.store.as_ref(), USER_PROFILE_KEY).await {
            Ok(profile) => cache.profile = profile,
            Err(e @ ChatEmError::Serialization { .. }) => {
                warn!("[state] Stored profile unreadable, ignoring it: {}", e);
                cache.profile = None;
            }
            Err(e) => return Err(e),
        }
        Ok(cache.profile.clone())
    }

    /// Replaces the profile; `None` removes it from storage
    pub async fn set_profile(&self, profile: Option<UserProfile>) -> Result<(), ChatEmError> {
        let mut cache = self.cache.lock().await;
        cache.profile = profile;
        match &cache.profile {
            Some(profile) => save_item(self.store.as_ref(), USER_PROFILE_KEY, profile).await,
            None => self.store.remove(USER_PROFILE_KEY).await,
        }
    }

    pub async fn history(&self) -> Vec<Message> {
        self.cache.lock().await.history.clone()
    }

    pub async fn reload_history(&self) -> Result<Vec<Message>, ChatEmError> {
        let mut cache = self.cache.lock().await;
        let mut history = match get_item::<Vec<Message>>(self.store.as_ref(), CONVERSATION_HISTORY_KEY)
            .await
        {
            Ok(history) => history.unwrap_or_default(),
            Err(e @ ChatEmError::Serialization { .. }) => {
                warn!("[state] Stored history unreadable, starting empty: {}", e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        truncate_history(&mut history);
        cache.history = history;
        Ok(cache.history.clone())
    }

    /// Appends a turn, keeps the newest entries and persists the result
    pub async fn append_to_history(&self, message: Message) -> Persisted<Vec<Message>> {
        let mut cache = self.cache.lock().await;
        cache.history.push(message);
        truncate_history(&mut cache.history);

        let write = save_item(self.store.as_ref(), CONVERSATION_HISTORY_KEY, &cache.history).await;
        Persisted::new(cache.history.clone(), write, "Conversation history")
    }

    pub async fn clear_history(&self) -> Result<(), ChatEmError> {
        let mut cache = self.cache.lock().await;
        cache.history.clear();
        self.store.remove(CONVERSATION_HISTORY_KEY).await
    }

    /// Wipes storage and the cache together. Holding the lock across both
    /// keeps a concurrent write from landing between them.
    pub async fn clear_all(&self) -> Result<(), ChatEmError> {
        let mut cache = self.cache.lock().await;
        self.store.clear().await?;
        *cache = Cache::default();
        Ok(())
    }
}
