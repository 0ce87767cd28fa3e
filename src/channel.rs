//! Cross-context messaging
//!
//! Each context connects to the [`Runtime`] and gets a [`Mailbox`] to read
//! requests from and a [`ContextHandle`] to send them with. Sending never
//! blocks; the caller gets a [`PendingReply`] that resolves to exactly one
//! [`Reply`].

use crate::error::ChatEmError;
use crate::router::Reply;
use futures_util::future::select_ok;
use log::{debug, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

pub const NO_RECEIVER: &str = "Could not establish connection. Receiving end does not exist.";
pub const PORT_CLOSED: &str = "The message port closed before a response was received.";

/// One execution context of the extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextId {
    Background,
    Popup,
    Options,
    /// Content script running in a browser tab
    Content(u32),
    /// Native messaging port opened by the browser
    Native,
}

impl ContextId {
    /// Extension pages receive runtime broadcasts
    pub fn is_page(&self) -> bool {
        matches!(self, ContextId::Popup | ContextId::Options)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextId::Background => write!(f, "background"),
            ContextId::Popup => write!(f, "popup"),
            ContextId::Options => write!(f, "options"),
            ContextId::Content(tab) => write!(f, "content:{}", tab),
            ContextId::Native => write!(f, "native"),
        }
    }
}

/// An envelope in flight, together with its reply channel
pub struct RoutedRequest {
    pub from: ContextId,
    pub envelope: Value,
    reply: oneshot::Sender<Reply>,
}

impl RoutedRequest {
    /// Delivers the reply. Consumes the request, so it can only answer once.
    pub fn respond(self, reply: Reply) {
        if self.reply.send(reply).is_err() {
            debug!("[channel] Reply to {} dropped, caller stopped waiting", self.from);
        }
    }
}

pub struct Mailbox {
    id: ContextId,
    rx: mpsc::UnboundedReceiver<RoutedRequest>,
}

impl Mailbox {
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Next request in arrival order, `None` once disconnected
    pub async fn recv(&mut self) -> Option<RoutedRequest> {
        self.rx.recv().await
    }
}

/// A reply that has not arrived yet. Dropping it ignores the late reply.
pub struct PendingReply {
    inner: Result<oneshot::Receiver<Reply>, Reply>,
}

impl PendingReply {
    fn failed(err: ChatEmError) -> Self {
        Self {
            inner: Err(Reply::failure(&err)),
        }
    }

    pub async fn wait(self) -> Reply {
        match self.inner {
            Err(reply) => reply,
            Ok(rx) => rx
                .await
                .unwrap_or_else(|_| Reply::failure(&ChatEmError::Channel(PORT_CLOSED.to_string()))),
        }
    }
}

type Senders = HashMap<ContextId, mpsc::UnboundedSender<RoutedRequest>>;

#[derive(Clone, Default)]
pub struct Runtime {
    contexts: Arc<Mutex<Senders>>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a context. Connecting an id twice replaces the old mailbox.
    pub fn connect(&self, id: ContextId) -> (ContextHandle, Mailbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut contexts) = self.contexts.lock() {
            if contexts.insert(id, tx).is_some() {
                warn!("[channel] {} reconnected, previous mailbox closed", id);
            }
        }
        debug!("[channel] {} connected", id);
        (
            ContextHandle {
                id,
                runtime: self.clone(),
            },
            Mailbox { id, rx },
        )
    }

    pub fn disconnect(&self, id: ContextId) {
        if let Ok(mut contexts) = self.contexts.lock() {
            contexts.remove(&id);
        }
    }

    pub fn is_connected(&self, id: ContextId) -> bool {
        self.contexts
            .lock()
            .map(|c| c.get(&id).is_some_and(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    fn connected_pages(&self) -> Vec<ContextId> {
        self.contexts
            .lock()
            .map(|c| c.keys().copied().filter(ContextId::is_page).collect())
            .unwrap_or_default()
    }

    fn deliver(&self, from: ContextId, to: ContextId, envelope: Value) -> PendingReply {
        let tx = self
            .contexts
            .lock()
            .ok()
            .and_then(|c| c.get(&to).cloned());

        let Some(tx) = tx else {
            return PendingReply::failed(ChatEmError::Channel(NO_RECEIVER.to_string()));
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = RoutedRequest {
            from,
            envelope,
            reply: reply_tx,
        };
        if tx.send(request).is_err() {
            warn!("[channel] {} is gone, dropping its registration", to);
            self.disconnect(to);
            return PendingReply::failed(ChatEmError::Channel(NO_RECEIVER.to_string()));
        }
        PendingReply { inner: Ok(reply_rx) }
    }
}

/// Sending side of a connected context
#[derive(Clone)]
pub struct ContextHandle {
    id: ContextId,
    runtime: Runtime,
}

impl ContextHandle {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Queues `envelope` for `target` right away
    pub fn send(&self, target: ContextId, envelope: Value) -> PendingReply {
        self.runtime.deliver(self.id, target, envelope)
    }

    /// Sends to every open extension page; the first successful reply wins
    pub async fn broadcast_to_pages(&self, envelope: Value) -> Reply {
        let targets: Vec<ContextId> = self
            .runtime
            .connected_pages()
            .into_iter()
            .filter(|id| *id != self.id)
            .collect();

        if targets.is_empty() {
            return Reply::failure(&ChatEmError::Channel(NO_RECEIVER.to_string()));
        }

        let attempts = targets.into_iter().map(|target| {
            let pending = self.send(target, envelope.clone());
            Box::pin(async move {
                let reply = pending.wait().await;
                if reply.success {
                    Ok(reply)
                } else {
                    Err(reply)
                }
            }) as Pin<Box<dyn Future<Output = Result<Reply, Reply>> + Send>>
        });

        match select_ok(attempts).await {
            Ok((reply, _)) => reply,
            Err(reply) => reply,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn missing_receiver_gets_structured_error() {
        let runtime = Runtime::new();
        let (popup, _mailbox) = runtime.connect(ContextId::Popup);

        let reply = popup.send(ContextId::Content(3), json!({ "action": "X" })).wait().await;
        assert!(!reply.success);
        assert_eq!(reply.error.as_deref(), Some(NO_RECEIVER));
    }

    #[tokio::test]
    async fn dropped_request_resolves_to_port_closed() {
        let runtime = Runtime::new();
        let (popup, _popup_mailbox) = runtime.connect(ContextId::Popup);
        let (_bg, mut bg_mailbox) = runtime.connect(ContextId::Background);

        let pending = popup.send(ContextId::Background, json!({ "action": "LOAD_SETTINGS" }));
        let request = bg_mailbox.recv().await.unwrap();
        assert_eq!(request.from, ContextId::Popup);
        drop(request);

        let reply = pending.wait().await;
        assert_eq!(reply.error.as_deref(), Some(PORT_CLOSED));
    }

    #[tokio::test]
    async fn late_reply_is_ignored() {
        let runtime = Runtime::new();
        let (popup, _popup_mailbox) = runtime.connect(ContextId::Popup);
        let (_bg, mut bg_mailbox) = runtime.connect(ContextId::Background);

        drop(popup.send(ContextId::Background, json!({ "action": "LOAD_SETTINGS" })));
        let request = bg_mailbox.recv().await.unwrap();
        request.respond(Reply::ok());
    }

    #[tokio::test]
    async fn broadcast_takes_first_successful_page() {
        let runtime = Runtime::new();
        let (bg, _bg_mailbox) = runtime.connect(ContextId::Background);
        let (_popup, mut popup_mailbox) = runtime.connect(ContextId::Popup);
        let (_options, mut options_mailbox) = runtime.connect(ContextId::Options);

        tokio::spawn(async move {
            if let Some(request) = options_mailbox.recv().await {
                request.respond(Reply::failure(&ChatEmError::Channel("busy".to_string())));
            }
        });
        tokio::spawn(async move {
            if let Some(request) = popup_mailbox.recv().await {
                request.respond(Reply::ok().with("from", "popup"));
            }
        });

        let reply = bg.broadcast_to_pages(json!({ "action": "PING" })).await;
        assert!(reply.success);
        assert_eq!(reply.get("from"), Some(&json!("popup")));
    }
}
