//! Message envelopes exchanged between extension contexts
//!
//! Every envelope is a JSON object whose `action` field names the operation.
//! Each context decodes envelopes into its own tagged enum and answers with
//! exactly one [`Reply`].

use crate::api::RequestOptions;
use crate::error::ChatEmError;
use crate::models::{Message, PageInfo};
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Discriminant field shared by every envelope
pub const ACTION_FIELD: &str = "action";

/// Optional correlation id, echoed back in the reply
pub const REQUEST_ID_FIELD: &str = "requestId";

/// Answer to one routed envelope: `{ success, error?, ...data }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            data: Map::new(),
        }
    }

    /// Adds a field to the reply body
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.data.insert(key.to_string(), value);
        self
    }

    /// Structured failure for an error that must not cross the channel
    pub fn failure(err: &ChatEmError) -> Self {
        let mut reply = Self {
            success: false,
            error: Some(err.to_string()),
            data: Map::new(),
        }
        .with("kind", err.kind());

        match err {
            ChatEmError::Api { status, message } => {
                reply = reply.with("status", status).with("message", message);
            }
            ChatEmError::UnknownAction(action) => {
                reply = reply.with(ACTION_FIELD, action);
            }
            ChatEmError::Serialization { raw: Some(raw), .. } => {
                reply = reply.with("raw", raw);
            }
            _ => {}
        }
        reply
    }

    /// Attaches a non-fatal warning; repeated warnings are joined
    pub fn with_warning(mut self, warning: Option<String>) -> Self {
        let Some(warning) = warning else {
            return self;
        };
        let joined = match self.data.get("warning").and_then(Value::as_str) {
            Some(previous) => format!("{}; {}", previous, warning),
            None => warning,
        };
        self.data.insert("warning".to_string(), Value::String(joined));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Copies `requestId` from the envelope, if it carried one
    pub fn echo_request_id(mut self, envelope: &Value) -> Self {
        if let Some(id) = envelope.get(REQUEST_ID_FIELD) {
            self.data.insert(REQUEST_ID_FIELD.to_string(), id.clone());
        }
        self
    }
}

impl From<Result<Reply, ChatEmError>> for Reply {
    fn from(result: Result<Reply, ChatEmError>) -> Self {
        result.unwrap_or_else(|e| Reply::failure(&e))
    }
}

/// An enum of requests one context understands
pub trait ActionSet: DeserializeOwned {
    /// Every accepted value of the `action` field
    const ACTIONS: &'static [&'static str];
}

/// Validates an envelope at the router boundary.
///
/// Unrecognized or missing discriminants become [`ChatEmError::UnknownAction`];
/// a known action with a malformed payload becomes
/// [`ChatEmError::InvalidPayload`].
pub fn decode<R: ActionSet>(envelope: &Value) -> Result<R, ChatEmError> {
    let action = envelope
        .get(ACTION_FIELD)
        .and_then(Value::as_str)
        .unwrap_or_default();

    if !R::ACTIONS.contains(&action) {
        warn!("[router] Unknown action: {:?}", action);
        return Err(ChatEmError::UnknownAction(action.to_string()));
    }

    serde_json::from_value(envelope.clone()).map_err(|e| {
        warn!("[router] Invalid payload for {}: {}", action, e);
        ChatEmError::InvalidPayload(e.to_string())
    })
}

// ============ Background Requests ============

/// Requests handled by the background context
#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "action",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Request {
    GetUserProfile {
        #[serde(default)]
        refresh: bool,
    },
    SaveConversation {
        conversation: Message,
    },
    GetConversationHistory,
    ClearConversationHistory,
    FetchFromApi {
        endpoint: String,
        #[serde(default)]
        options: RequestOptions,
    },
    SaveSettings {
        settings: Map<String, Value>,
    },
    LoadSettings,
    UpdateSetting {
        key: String,
        value: Value,
    },
    Login {
        credentials: Value,
    },
    Register {
        user: Value,
    },
    Logout,
    SendMessage {
        text: String,
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        page: Option<PageInfo>,
    },
    SendToContent {
        tab_id: u32,
        payload: Value,
    },
    SendToPopup {
        payload: Value,
    },
    ClearAllData,
}

impl ActionSet for Request {
    const ACTIONS: &'static [&'static str] = &[
        "GET_USER_PROFILE",
        "SAVE_CONVERSATION",
        "GET_CONVERSATION_HISTORY",
        "CLEAR_CONVERSATION_HISTORY",
        "FETCH_FROM_API",
        "SAVE_SETTINGS",
        "LOAD_SETTINGS",
        "UPDATE_SETTING",
        "LOGIN",
        "REGISTER",
        "LOGOUT",
        "SEND_MESSAGE",
        "SEND_TO_CONTENT",
        "SEND_TO_POPUP",
        "CLEAR_ALL_DATA",
    ];
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_action_is_structured() {
        let err = decode::<Request>(&json!({ "action": "DANCE" })).unwrap_err();
        let reply = Reply::failure(&err);
        assert!(!reply.success);
        assert_eq!(reply.error.as_deref(), Some("unknown action"));
        assert_eq!(reply.get("action"), Some(&json!("DANCE")));

        let err = decode::<Request>(&json!({ "type": "LOAD_SETTINGS" })).unwrap_err();
        assert!(matches!(err, ChatEmError::UnknownAction(_)));
    }

    #[test]
    fn every_listed_action_is_recognized() {
        for action in Request::ACTIONS {
            let result = decode::<Request>(&json!({ "action": action }));
            assert!(
                !matches!(result, Err(ChatEmError::UnknownAction(_))),
                "{} was not recognized",
                action
            );
        }
    }

    #[test]
    fn payload_fields_are_camel_case() {
        let request = decode::<Request>(&json!({
            "action": "SEND_TO_CONTENT",
            "tabId": 7,
            "payload": { "action": "REMOVE_CHAT_WIDGET" },
            "requestId": "r-1"
        }))
        .unwrap();
        assert!(matches!(request, Request::SendToContent { tab_id: 7, .. }));

        let err = decode::<Request>(&json!({ "action": "UPDATE_SETTING", "key": "model" }))
            .unwrap_err();
        assert!(matches!(err, ChatEmError::InvalidPayload(_)));
    }

    #[test]
    fn reply_serializes_flat() {
        let reply = Reply::ok()
            .with("history", Vec::<Message>::new())
            .echo_request_id(&json!({ "requestId": 42 }));
        assert_eq!(
            reply.to_value(),
            json!({ "success": true, "history": [], "requestId": 42 })
        );

        let warned = Reply::ok()
            .with_warning(None)
            .with_warning(Some("history not saved".to_string()))
            .with_warning(Some("reply not saved".to_string()));
        assert_eq!(
            warned.get("warning"),
            Some(&json!("history not saved; reply not saved"))
        );

        let api = Reply::failure(&ChatEmError::Api {
            status: 500,
            message: "db down".to_string(),
        });
        assert_eq!(api.get("status"), Some(&json!(500)));
        assert_eq!(api.get("kind"), Some(&json!("api")));
    }
}
