//! Data models and structures used throughout the extension

use crate::error::ChatEmError;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Storage keys shared by every context
pub const SETTINGS_KEY: &str = "settings";
pub const USER_PROFILE_KEY: &str = "userProfile";
pub const CONVERSATION_HISTORY_KEY: &str = "conversationHistory";
pub const AUTH_TOKEN_KEY: &str = "authToken";

/// Number of chat turns kept in the conversation history
pub const MAX_HISTORY_SIZE: usize = 100;

/// Who authored a chat turn.
///
/// Older content scripts tagged replies as `bot`; those decode as `Agent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    #[serde(alias = "bot")]
    Agent,
    System,
}

impl Sender {
    /// Label shown above a message in the widget
    pub fn display_name(&self) -> &'static str {
        match self {
            Sender::User => "You",
            Sender::Agent => "Support",
            Sender::System => "ChatEm",
        }
    }
}

/// A single chat turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    pub sender: Sender,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(text: impl Into<String>, sender: Sender) -> Self {
        Self {
            text: text.into(),
            sender,
            timestamp: Utc::now(),
        }
    }
}

/// Identity of the extension's user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Details of the page a content script runs in
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub selection: String,
}

// ============ Settings ============

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    150
}

fn default_show_chat_widget() -> bool {
    true
}

fn default_theme() -> String {
    "light".to_string()
}

/// User-configurable extension behaviour.
///
/// Every field has a serde default, so a stored object missing keys is
/// backfilled on load and unknown keys are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature", deserialize_with = "stored_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens", deserialize_with = "stored_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_show_chat_widget")]
    pub show_chat_widget: bool,
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            show_chat_widget: default_show_chat_widget(),
            theme: default_theme(),
            conversation_id: None,
        }
    }
}

impl Settings {
    /// Validates one setting and writes it into `self`.
    ///
    /// `temperature` is clamped to [0, 1] and `maxTokens` floored at 1.
    pub fn apply_update(&mut self, key: &str, value: &Value) -> Result<(), ChatEmError> {
        match key {
            "apiKey" => self.api_key = expect_str(key, value)?.trim().to_string(),
            "model" => {
                let model = expect_str(key, value)?.trim();
                if model.is_empty() {
                    return Err(ChatEmError::Validation("model must not be empty".to_string()));
                }
                self.model = model.to_string();
            }
            "temperature" => {
                self.temperature = clamp_temperature(expect_number(key, value)?);
            }
            "maxTokens" => {
                self.max_tokens = clamp_max_tokens(expect_number(key, value)?);
            }
            "showChatWidget" => {
                self.show_chat_widget = value.as_bool().ok_or_else(|| {
                    ChatEmError::Validation(format!("{} must be a boolean", key))
                })?;
            }
            "theme" => self.theme = expect_str(key, value)?.to_string(),
            "conversationId" => {
                self.conversation_id = match value {
                    Value::Null => None,
                    Value::String(id) if id.trim().is_empty() => None,
                    Value::String(id) => Some(id.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => {
                        return Err(ChatEmError::Validation(format!(
                            "{} must be a string",
                            key
                        )))
                    }
                };
            }
            other => {
                return Err(ChatEmError::Validation(format!(
                    "unknown setting \"{}\"",
                    other
                )))
            }
        }
        Ok(())
    }
}

fn expect_str<'a>(key: &str, value: &'a Value) -> Result<&'a str, ChatEmError> {
    value
        .as_str()
        .ok_or_else(|| ChatEmError::Validation(format!("{} must be a string", key)))
}

// Options pages send numbers from text inputs, so numeric strings are accepted
fn expect_number(key: &str, value: &Value) -> Result<f64, ChatEmError> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match number {
        Some(n) if n.is_finite() => Ok(n),
        _ => Err(ChatEmError::Validation(format!("{} must be a number", key))),
    }
}
fn clamp_temperature(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

fn clamp_max_tokens(value: f64) -> u32 {
    value.floor().clamp(1.0, u32::MAX as f64) as u32
}

// Stored numbers are clamped like updates; an unusable one takes its default
fn stored_number<'de, D>(deserializer: D, key: &str) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match expect_number(key, &value) {
        Ok(number) => Ok(Some(number)),
        Err(e) => {
            warn!("[settings] Ignoring stored {}: {}", key, e);
            Ok(None)
        }
    }
}

fn stored_temperature<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let number = stored_number(deserializer, "temperature")?;
    Ok(number.map_or_else(default_temperature, clamp_temperature))
}

fn stored_max_tokens<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let number = stored_number(deserializer, "maxTokens")?;
    Ok(number.map_or_else(default_max_tokens, clamp_max_tokens))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_settings_keys_backfill_from_defaults() {
        let settings: Settings =
            serde_json::from_value(json!({ "apiKey": "k", "legacyFlag": 3 })).unwrap();
        assert_eq!(settings.api_key, "k");
        assert_eq!(settings.model, "gpt-3.5-turbo");
        assert_eq!(settings.max_tokens, 150);
        assert!(settings.show_chat_widget);
    }

    #[test]
    fn temperature_and_max_tokens_are_clamped() {
        let mut settings = Settings::default();
        settings.apply_update("temperature", &json!(3.5)).unwrap();
        assert_eq!(settings.temperature, 1.0);
        settings.apply_update("temperature", &json!(-0.2)).unwrap();
        assert_eq!(settings.temperature, 0.0);
        settings.apply_update("maxTokens", &json!(-40)).unwrap();
        assert_eq!(settings.max_tokens, 1);
        settings.apply_update("maxTokens", &json!("250")).unwrap();
        assert_eq!(settings.max_tokens, 250);
        settings.apply_update("maxTokens", &json!(0.5)).unwrap();
        assert_eq!(settings.max_tokens, 1);
    }

    #[test]
    fn stored_numbers_are_clamped_on_decode() {
        let settings: Settings = serde_json::from_value(json!({
            "apiKey": "k",
            "temperature": 3.0,
            "maxTokens": 0
        }))
        .unwrap();
        assert_eq!(settings.temperature, 1.0);
        assert_eq!(settings.max_tokens, 1);

        let settings: Settings = serde_json::from_value(json!({
            "apiKey": "k",
            "temperature": "0.25",
            "maxTokens": -5
        }))
        .unwrap();
        assert_eq!(settings.api_key, "k");
        assert_eq!(settings.temperature, 0.25);
        assert_eq!(settings.max_tokens, 1);
    }

    #[test]
    fn unusable_stored_number_keeps_other_fields() {
        let settings: Settings = serde_json::from_value(json!({
            "apiKey": "k",
            "model": "gpt-4o",
            "temperature": { "value": 1 },
            "maxTokens": "lots"
        }))
        .unwrap();
        assert_eq!(settings.api_key, "k");
        assert_eq!(settings.model, "gpt-4o");
        assert_eq!(settings.temperature, 0.7);
        assert_eq!(settings.max_tokens, 150);
    }

    #[test]
    fn rejects_unknown_keys_and_wrong_types() {
        let mut settings = Settings::default();
        assert!(settings.apply_update("fontSize", &json!(12)).is_err());
        assert!(settings.apply_update("temperature", &json!("warm")).is_err());
        assert!(settings.apply_update("showChatWidget", &json!("yes")).is_err());
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn bot_sender_decodes_as_agent() {
        let msg: Message = serde_json::from_value(json!({ "text": "hi", "sender": "bot" })).unwrap();
        assert_eq!(msg.sender, Sender::Agent);
        assert_eq!(serde_json::to_value(msg.sender).unwrap(), json!("agent"));
    }
}
