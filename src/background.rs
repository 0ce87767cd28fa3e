//! Background context: the single entry point for requests from the popup,
//! the options page and content scripts

use crate::api::ApiClient;
use crate::channel::{ContextHandle, ContextId, Mailbox};
use crate::error::ChatEmError;
use crate::models::{Message, PageInfo, Sender, UserProfile, AUTH_TOKEN_KEY};
use crate::router::{decode, Reply, Request};
use crate::state::{Persisted, StateManager};
use crate::storage::KeyValueStore;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::sync::Arc;

pub struct Background {
    store: Arc<dyn KeyValueStore>,
    state: StateManager,
    api: ApiClient,
    runtime: ContextHandle,
}

impl Background {
    pub fn new(store: Arc<dyn KeyValueStore>, api: ApiClient, runtime: ContextHandle) -> Self {
        Self {
            state: StateManager::new(Arc::clone(&store)),
            store,
            api,
            runtime,
        }
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Loads cached state and restores the auth token. Failures are logged
    /// and the context starts with defaults.
    pub async fn start(&self) {
        info!("=== ChatEm background starting ===");
        if let Err(e) = self.state.load().await {
            error!("[start] Failed to load stored state: {}", e);
        }

        match self.store.get(AUTH_TOKEN_KEY).await {
            Ok(Some(Value::String(token))) if !token.is_empty() => {
                self.api.set_auth_token(Some(token));
                info!("[start] Restored auth token");
            }
            Ok(_) => debug!("[start] No stored auth token"),
            Err(e) => warn!("[start] Failed to read auth token: {}", e),
        }
    }

    /// Reads the mailbox until every sender is gone. Each request runs on its
    /// own task so a slow handler never holds up the next dispatch.
    pub async fn serve(self: Arc<Self>, mut mailbox: Mailbox) {
        while let Some(request) = mailbox.recv().await {
            let background = Arc::clone(&self);
            tokio::spawn(async move {
                let reply = background.dispatch(&request.envelope).await;
                request.respond(reply);
            });
        }
        info!("[serve] Background mailbox closed");
    }

    /// Decodes and handles one envelope. Always produces a reply.
    pub async fn dispatch(&self, envelope: &Value) -> Reply {
        let reply = match decode::<Request>(envelope) {
            Ok(request) => Reply::from(self.handle(request).await),
            Err(e) => Reply::failure(&e),
        };
        reply.echo_request_id(envelope)
    }

    async fn handle(&self, request: Request) -> Result<Reply, ChatEmError> {
        match request {
            Request::GetUserProfile { refresh } => self.get_user_profile(refresh).await,
            Request::SaveConversation { conversation } => {
                let saved = self.state.append_to_history(conversation).await;
                Ok(Reply::ok()
                    .with("history", &saved.value)
                    .with_warning(saved.warning))
            }
            Request::GetConversationHistory => {
                Ok(Reply::ok().with("history", self.state.history().await))
            }
            Request::ClearConversationHistory => {
                self.state.clear_history().await?;
                Ok(Reply::ok())
            }
            Request::FetchFromApi { endpoint, options } => {
                let data = self.api.request(&endpoint, options).await?;
                Ok(Reply::ok().with("data", data))
            }
            Request::SaveSettings { settings } => {
                let saved = self.state.save_settings(&settings).await?;
                Ok(Reply::ok()
                    .with("settings", &saved.value)
                    .with_warning(saved.warning))
            }
            Request::LoadSettings => self.load_settings().await,
            Request::UpdateSetting { key, value } => {
                let saved = self.state.update_setting(&key, &value).await?;
                Ok(Reply::ok()
                    .with("settings", &saved.value)
                    .with_warning(saved.warning))
            }
            Request::Login { credentials } => self.login(credentials).await,
            Request::Register { user } => {
                let data = self.api.register(user).await?;
                Ok(Reply::ok().with("data", data))
            }
            Request::Logout => {
                self.api.set_auth_token(None);
                self.store.remove(AUTH_TOKEN_KEY).await?;
                self.state.set_profile(None).await?;
                info!("[logout] Signed out");
                Ok(Reply::ok())
            }
            Request::SendMessage {
                text,
                conversation_id,
                page,
            } => self.send_message(text, conversation_id, page).await,
            Request::SendToContent { tab_id, payload } => {
                let reply = self
                    .runtime
                    .send(ContextId::Content(tab_id), payload)
                    .wait()
                    .await;
                relay(reply, &format!("content script in tab {}", tab_id))
            }
            Request::SendToPopup { mut payload } => {
                if let Value::Object(fields) = &mut payload {
                    fields.insert("target".to_string(), json!("popup"));
                }
                let reply = self.runtime.broadcast_to_pages(payload).await;
                relay(reply, "popup")
            }
            Request::ClearAllData => {
                self.state.clear_all().await?;
                self.api.set_auth_token(None);
                info!("[clear_all_data] All stored data cleared");
                Ok(Reply::ok())
            }
        }
    }

    async fn get_user_profile(&self, refresh: bool) -> Result<Reply, ChatEmError> {
        let mut profile = match self.state.profile().await {
            Some(profile) => Some(profile),
            None => self.state.reload_profile().await?,
        };

        if refresh {
            if let Some(current) = &profile {
                let fetched = self.api.get_user_info(&current.id).await?;
                match fetched.map(serde_json::from_value::<UserProfile>) {
                    Some(Ok(updated)) => {
                        self.state.set_profile(Some(updated.clone())).await?;
                        profile = Some(updated);
                    }
                    Some(Err(e)) => warn!("[get_user_profile] Unexpected profile shape: {}", e),
                    None => warn!("[get_user_profile] Empty profile response"),
                }
            }
        }
        Ok(Reply::ok().with("profile", profile))
    }

    /// Storage is the authority; the cache answers only when storage fails
    async fn load_settings(&self) -> Result<Reply, ChatEmError> {
        match self.state.reload_settings().await {
            Ok(settings) => Ok(Reply::ok().with("settings", settings)),
            Err(e) => {
                warn!("[load_settings] Falling back to cached settings: {}", e);
                Ok(Reply::ok()
                    .with("settings", self.state.settings().await)
                    .with_warning(Some(e.to_string())))
            }
        }
    }

    async fn login(&self, credentials: Value) -> Result<Reply, ChatEmError> {
        let previous = self.api.auth_token();
        let data = self.api.login(credentials).await?;
        let mut reply = Reply::ok();

        if let Some(token) = self.api.auth_token().filter(|t| Some(t) != previous.as_ref()) {
            if let Err(e) = self.store.set(AUTH_TOKEN_KEY, json!(token)).await {
                warn!("[login] Token kept in memory only: {}", e);
                reply = reply.with_warning(Some(format!("Token not saved: {}", e)));
            }
        }

        let user = data
            .as_ref()
            .and_then(|d| d.get("user"))
            .cloned()
            .map(serde_json::from_value::<UserProfile>);
        if let Some(Ok(profile)) = user {
            info!("[login] Signed in as {}", profile.id);
            self.state.set_profile(Some(profile)).await?;
        }

        Ok(reply.with("data", data))
    }

    async fn send_message(
        &self,
        text: String,
        conversation_id: Option<String>,
        page: Option<PageInfo>,
    ) -> Result<Reply, ChatEmError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatEmError::Validation("message text is empty".to_string()));
        }

        let outgoing = Message::new(text, Sender::User);
        let sent = self.state.append_to_history(outgoing.clone()).await;

        let conversation_id = match conversation_id {
            Some(id) => Some(id),
            None => self.state.settings().await.conversation_id,
        };

        let mut body = serde_json::to_value(&outgoing)
            .map_err(|e| ChatEmError::serialization("message", e))?;
        if let Some(page) = page {
            body["page"] = json!(page);
        }

        let response = self
            .api
            .send_message(conversation_id.as_deref(), body)
            .await?;

        let agent_reply = response.as_ref().and_then(reply_text).map(|text| {
            Message::new(text, Sender::Agent)
        });

        let saved = match &agent_reply {
            Some(message) => self.state.append_to_history(message.clone()).await,
            None => Persisted {
                value: self.state.history().await,
                warning: None,
            },
        };

        Ok(Reply::ok()
            .with("message", agent_reply)
            .with("historyLength", saved.value.len())
            .with_warning(sent.warning)
            .with_warning(saved.warning))
    }
}

/// Text of the agent's answer in a send-message response
fn reply_text(response: &Value) -> Option<String> {
    response
        .get("text")
        .or_else(|| response.get("reply"))
        .or_else(|| response.get("message").and_then(|m| m.get("text")))
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())
        .map(str::to_string)
}

/// Wraps another context's reply, surfacing its failure as ours
fn relay(reply: Reply, target: &str) -> Result<Reply, ChatEmError> {
    if reply.success {
        Ok(Reply::ok().with("data", reply))
    } else {
        let message = reply.error.unwrap_or_else(|| "unknown error".to_string());
        error!("[relay] {} reported an error: {}", target, message);
        Err(ChatEmError::Channel(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_text_accepts_known_shapes() {
        assert_eq!(reply_text(&json!({ "text": "hi" })).as_deref(), Some("hi"));
        assert_eq!(reply_text(&json!({ "reply": "yo" })).as_deref(), Some("yo"));
        assert_eq!(
            reply_text(&json!({ "message": { "text": "nested" } })).as_deref(),
            Some("nested")
        );
        assert_eq!(reply_text(&json!({ "text": "   " })), None);
        assert_eq!(reply_text(&json!({ "id": 4 })), None);
    }

    #[test]
    fn failed_relay_becomes_channel_error() {
        let reply = Reply::failure(&ChatEmError::Channel("no widget".to_string()));
        let err = relay(reply, "content script in tab 1").unwrap_err();
        assert_eq!(err.to_string(), "no widget");
        assert!(relay(Reply::ok(), "popup").unwrap().success);
    }
}
