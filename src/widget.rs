//! Chat widget overlay for content scripts
//!
//! [`WidgetController`] owns the overlay's state: placement, message list,
//! input and drag. Rendering that state into the page is left to the host;
//! the controller only guarantees one overlay per page and keeps it inside
//! the viewport.

use crate::channel::{ContextHandle, ContextId, Mailbox, PendingReply};
use crate::error::ChatEmError;
use crate::models::{Message, PageInfo, Sender};
use crate::router::{decode, ActionSet, Reply};
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Stable id of the overlay root, used to detect an existing overlay
pub const WIDGET_ROOT_ID: &str = "chatem-widget-container";

pub const PLACEHOLDER_TEXT: &str = "Welcome to ChatEm! Start a conversation below.";

/// Height of the draggable header strip
pub const HEADER_HEIGHT: f64 = 40.0;

/// Gap kept between the overlay and the viewport edge when first placed
const EDGE_MARGIN: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Default for Size {
    fn default() -> Self {
        Self {
            width: 320.0,
            height: 420.0,
        }
    }
}

fn default_title() -> String {
    "ChatEm Support".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetConfig {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub position: Option<Point>,
    #[serde(default)]
    pub size: Size,
    /// Shown as the first agent entry of a fresh overlay
    #[serde(default)]
    pub greeting: Option<String>,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            title: default_title(),
            position: None,
            size: Size::default(),
            greeting: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WidgetUpdate {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Overlay {
    pub id: &'static str,
    pub title: String,
    pub position: Point,
    pub size: Size,
    pub visible: bool,
    pub placeholder: Option<String>,
    pub entries: Vec<Message>,
    pub input: String,
    /// Index of the entry scrolled into view
    pub scroll_anchor: Option<usize>,
    #[serde(skip)]
    grab_offset: Option<Point>,
}

impl Overlay {
    fn header_contains(&self, point: Point) -> bool {
        point.x >= self.position.x
            && point.x <= self.position.x + self.size.width
            && point.y >= self.position.y
            && point.y <= self.position.y + HEADER_HEIGHT
    }

    fn push(&mut self, message: Message) {
        self.placeholder = None;
        self.entries.push(message);
        self.scroll_anchor = Some(self.entries.len() - 1);
    }
}

/// Keeps a box of `size` at `position` fully inside `viewport`
fn clamp_to_viewport(position: Point, size: Size, viewport: Size) -> Point {
    let max_x = (viewport.width - size.width).max(0.0);
    let max_y = (viewport.height - size.height).max(0.0);
    Point {
        x: position.x.clamp(0.0, max_x),
        y: position.y.clamp(0.0, max_y),
    }
}

/// User interaction with the overlay, fed to [`WidgetController::serve`]
#[derive(Debug, Clone, PartialEq)]
pub enum WidgetEvent {
    Input(String),
    /// Enter key or Send button
    Submit,
    Send(String),
    PointerDown(Point),
    PointerMove(Point),
    PointerUp,
    Resize(Size),
}

/// Requests a content script understands
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentRequest {
    InjectChatWidget {
        #[serde(default)]
        config: WidgetConfig,
    },
    RemoveChatWidget,
    UpdateChatWidget {
        data: WidgetUpdate,
    },
    ToggleChatWidget,
    ExtractPageData,
    DisplayMessage {
        message: Message,
    },
}

impl ActionSet for ContentRequest {
    const ACTIONS: &'static [&'static str] = &[
        "INJECT_CHAT_WIDGET",
        "REMOVE_CHAT_WIDGET",
        "UPDATE_CHAT_WIDGET",
        "TOGGLE_CHAT_WIDGET",
        "EXTRACT_PAGE_DATA",
        "DISPLAY_MESSAGE",
    ];
}

pub struct WidgetController {
    overlay: Option<Overlay>,
    viewport: Size,
    page: PageInfo,
    runtime: ContextHandle,
}

impl WidgetController {
    pub fn new(runtime: ContextHandle, viewport: Size, page: PageInfo) -> Self {
        Self {
            overlay: None,
            viewport,
            page,
            runtime,
        }
    }

    pub fn overlay(&self) -> Option<&Overlay> {
        self.overlay.as_ref()
    }

    pub fn is_injected(&self) -> bool {
        self.overlay.is_some()
    }

    pub fn page_info(&self) -> &PageInfo {
        &self.page
    }

    pub fn set_page_info(&mut self, page: PageInfo) {
        self.page = page;
    }

    /// Resizing the viewport pulls the overlay back inside it
    pub fn set_viewport(&mut self, viewport: Size) {
        self.viewport = viewport;
        if let Some(overlay) = &mut self.overlay {
            overlay.position = clamp_to_viewport(overlay.position, overlay.size, viewport);
        }
    }

    /// Creates the overlay, or updates title and size if it already exists.
    /// Returns `true` when a new overlay was created.
    pub fn inject(&mut self, config: WidgetConfig) -> bool {
        if let Some(overlay) = &mut self.overlay {
            debug!("[inject] {} already present, updating", WIDGET_ROOT_ID);
            overlay.title = config.title;
            overlay.size = config.size;
            overlay.position = clamp_to_viewport(overlay.position, overlay.size, self.viewport);
            overlay.visible = true;
            return false;
        }

        let start = config.position.unwrap_or(Point {
            x: self.viewport.width - config.size.width - EDGE_MARGIN,
            y: self.viewport.height - config.size.height - EDGE_MARGIN,
        });
        let mut overlay = Overlay {
            id: WIDGET_ROOT_ID,
            title: config.title,
            position: clamp_to_viewport(start, config.size, self.viewport),
            size: config.size,
            visible: true,
            placeholder: Some(PLACEHOLDER_TEXT.to_string()),
            entries: Vec::new(),
            input: String::new(),
            scroll_anchor: None,
            grab_offset: None,
        };
        if let Some(greeting) = config.greeting.filter(|g| !g.trim().is_empty()) {
            overlay.push(Message::new(greeting, Sender::Agent));
        }

        self.overlay = Some(overlay);
        info!("[inject] Chat widget injected");
        true
    }

    /// Detaches the overlay. Returns `false` when there was none.
    pub fn remove(&mut self) -> bool {
        let removed = self.overlay.take().is_some();
        if removed {
            info!("[remove] Chat widget removed");
        }
        removed
    }

    /// Shows or hides the overlay, injecting it first if needed.
    /// Returns the new visibility.
    pub fn toggle(&mut self) -> bool {
        match &mut self.overlay {
            Some(overlay) => {
                overlay.visible = !overlay.visible;
                overlay.visible
            }
            None => {
                self.inject(WidgetConfig::default());
                true
            }
        }
    }

    /// Appends a message and scrolls to it. Returns `false` if no overlay.
    pub fn append_message(&mut self, message: Message) -> bool {
        match &mut self.overlay {
            Some(overlay) => {
                overlay.push(message);
                true
            }
            None => {
                warn!("[append_message] Widget not injected, message dropped");
                false
            }
        }
    }

    pub fn update(&mut self, data: WidgetUpdate) -> bool {
        let Some(overlay) = &mut self.overlay else {
            warn!("[update] Cannot update chat widget: widget not injected");
            return false;
        };
        for message in data.messages {
            overlay.push(message);
        }
        if let Some(title) = data.title {
            overlay.title = title;
        }
        true
    }

    pub fn set_input(&mut self, text: &str) {
        if let Some(overlay) = &mut self.overlay {
            overlay.input = text.to_string();
        }
    }

    /// Sends whatever is in the input field (Enter key or Send button)
    pub fn submit_input(&mut self) -> Option<PendingReply> {
        let text = self.overlay.as_ref()?.input.clone();
        self.begin_send(&text)
    }

    /// Shows the user's message, queues it for the background and clears
    /// the input. Returns immediately; pass the eventual reply to
    /// [`WidgetController::apply_reply`].
    ///
    /// Blank text is ignored and yields `None`.
    pub fn begin_send(&mut self, text: &str) -> Option<PendingReply> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let Some(overlay) = &mut self.overlay else {
            warn!("[begin_send] Widget not injected");
            return None;
        };

        overlay.push(Message::new(text, Sender::User));
        let pending = self.runtime.send(
            ContextId::Background,
            json!({
                "action": "SEND_MESSAGE",
                "text": text,
                "page": &self.page,
            }),
        );
        overlay.input.clear();
        Some(pending)
    }

    /// Shows the agent's answer, or a short system note when the send
    /// failed. Earlier entries are left untouched.
    pub fn apply_reply(&mut self, reply: &Reply) {
        let Some(overlay) = &mut self.overlay else {
            debug!("[apply_reply] Widget removed before reply arrived");
            return;
        };

        if reply.success {
            let answer = reply
                .get("message")
                .cloned()
                .and_then(|m| serde_json::from_value::<Message>(m).ok());
            if let Some(answer) = answer {
                overlay.push(answer);
            }
        } else {
            overlay.push(Message::new(failure_notice(reply), Sender::System));
        }
    }

    /// Sends and waits for the answer in one step, for hosts that do not
    /// run [`WidgetController::serve`]
    pub async fn send_user_message(&mut self, text: &str) -> Option<Reply> {
        let reply = self.begin_send(text)?.wait().await;
        self.apply_reply(&reply);
        Some(reply)
    }

    /// Applies one UI event; a send hands back its pending reply
    pub fn handle_event(&mut self, event: WidgetEvent) -> Option<PendingReply> {
        match event {
            WidgetEvent::Input(text) => {
                self.set_input(&text);
                None
            }
            WidgetEvent::Submit => self.submit_input(),
            WidgetEvent::Send(text) => self.begin_send(&text),
            WidgetEvent::PointerDown(point) => {
                self.pointer_down(point);
                None
            }
            WidgetEvent::PointerMove(point) => {
                self.pointer_move(point);
                None
            }
            WidgetEvent::PointerUp => {
                self.pointer_up();
                None
            }
            WidgetEvent::Resize(viewport) => {
                self.set_viewport(viewport);
                None
            }
        }
    }

    /// Pointer pressed: starts a drag if it landed on the header
    pub fn pointer_down(&mut self, point: Point) -> bool {
        match &mut self.overlay {
            Some(overlay) if overlay.visible && overlay.header_contains(point) => {
                overlay.grab_offset = Some(Point {
                    x: point.x - overlay.position.x,
                    y: point.y - overlay.position.y,
                });
                true
            }
            _ => false,
        }
    }

    pub fn pointer_move(&mut self, point: Point) {
        let viewport = self.viewport;
        if let Some(overlay) = &mut self.overlay {
            if let Some(offset) = overlay.grab_offset {
                let target = Point {
                    x: point.x - offset.x,
                    y: point.y - offset.y,
                };
                overlay.position = clamp_to_viewport(target, overlay.size, viewport);
            }
        }
    }

    pub fn pointer_up(&mut self) {
        if let Some(overlay) = &mut self.overlay {
            overlay.grab_offset = None;
        }
    }

    pub fn is_dragging(&self) -> bool {
        self.overlay
            .as_ref()
            .is_some_and(|o| o.grab_offset.is_some())
    }

    /// Content script entry point for requests from other contexts
    pub fn handle_message(&mut self, envelope: &Value) -> Reply {
        let reply = match decode::<ContentRequest>(envelope) {
            Ok(request) => Reply::from(self.handle(request)),
            Err(e) => Reply::failure(&e),
        };
        reply.echo_request_id(envelope)
    }

    fn handle(&mut self, request: ContentRequest) -> Result<Reply, ChatEmError> {
        match request {
            ContentRequest::InjectChatWidget { config } => {
                let created = self.inject(config);
                Ok(Reply::ok().with("created", created))
            }
            ContentRequest::RemoveChatWidget => {
                let removed = self.remove();
                Ok(Reply::ok().with("removed", removed))
            }
            ContentRequest::UpdateChatWidget { data } => {
                if self.update(data) {
                    Ok(Reply::ok())
                } else {
                    Err(ChatEmError::Channel("chat widget not injected".to_string()))
                }
            }
            ContentRequest::ToggleChatWidget => {
                let visible = self.toggle();
                Ok(Reply::ok().with("visible", visible))
            }
            ContentRequest::ExtractPageData => Ok(Reply::ok().with("data", &self.page)),
            ContentRequest::DisplayMessage { message } => {
                if self.append_message(message) {
                    Ok(Reply::ok())
                } else {
                    Err(ChatEmError::Channel("chat widget not injected".to_string()))
                }
            }
        }
    }

    /// Runs the content context: answers routed requests, applies UI
    /// events and shows replies to in-flight sends as they arrive.
    ///
    /// Returns once the mailbox closes, after outstanding sends resolve.
    pub async fn serve(
        &mut self,
        mailbox: &mut Mailbox,
        events: &mut mpsc::UnboundedReceiver<WidgetEvent>,
    ) {
        let mut in_flight: FuturesUnordered<BoxFuture<'static, Reply>> = FuturesUnordered::new();
        let mut events_open = true;

        loop {
            tokio::select! {
                request = mailbox.recv() => {
                    let Some(request) = request else { break };
                    let reply = self.handle_message(&request.envelope);
                    request.respond(reply);
                }
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        if let Some(pending) = self.handle_event(event) {
                            in_flight.push(pending.wait().boxed());
                        }
                    }
                    None => events_open = false,
                },
                Some(reply) = in_flight.next(), if !in_flight.is_empty() => {
                    self.apply_reply(&reply);
                }
            }
        }

        while let Some(reply) = in_flight.next().await {
            self.apply_reply(&reply);
        }
        debug!("[serve] {} mailbox closed", mailbox.id());
    }
}

/// One-line notice shown in the widget when a send fails
fn failure_notice(reply: &Reply) -> String {
    let status = reply.get("status").and_then(Value::as_u64);
    if status == Some(401) {
        return "Please sign in again.".to_string();
    }
    match reply.error.as_deref() {
        Some(error) if !error.is_empty() => format!("Message could not be sent: {}", error),
        _ => "Message could not be sent.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Runtime;

    fn controller() -> (WidgetController, Mailbox) {
        let runtime = Runtime::new();
        let (handle, _content) = runtime.connect(ContextId::Content(1));
        let (_bg, bg_mailbox) = runtime.connect(ContextId::Background);
        let viewport = Size {
            width: 1280.0,
            height: 800.0,
        };
        (
            WidgetController::new(handle, viewport, PageInfo::default()),
            bg_mailbox,
        )
    }

    #[test]
    fn inject_is_idempotent() {
        let (mut widget, _bg) = controller();
        assert!(widget.inject(WidgetConfig::default()));
        widget.append_message(Message::new("hello", Sender::Agent));

        let config = WidgetConfig {
            title: "Help".to_string(),
            ..WidgetConfig::default()
        };
        assert!(!widget.inject(config));

        let overlay = widget.overlay().unwrap();
        assert_eq!(overlay.title, "Help");
        assert_eq!(overlay.entries.len(), 1);
        assert_eq!(overlay.id, WIDGET_ROOT_ID);
    }

    #[test]
    fn remove_twice_is_harmless() {
        let (mut widget, _bg) = controller();
        widget.inject(WidgetConfig::default());
        assert!(widget.remove());
        assert!(!widget.remove());
        assert!(!widget.is_injected());
    }

    #[test]
    fn first_message_clears_placeholder_and_scrolls() {
        let (mut widget, _bg) = controller();
        widget.inject(WidgetConfig::default());
        assert!(widget.overlay().unwrap().placeholder.is_some());

        widget.append_message(Message::new("a", Sender::Agent));
        widget.append_message(Message::new("b", Sender::Agent));
        let overlay = widget.overlay().unwrap();
        assert!(overlay.placeholder.is_none());
        assert_eq!(overlay.scroll_anchor, Some(1));
    }

    #[test]
    fn drag_is_clamped_to_viewport() {
        let (mut widget, _bg) = controller();
        widget.inject(WidgetConfig {
            position: Some(Point { x: 100.0, y: 100.0 }),
            ..WidgetConfig::default()
        });

        // Body clicks do not start a drag
        assert!(!widget.pointer_down(Point { x: 150.0, y: 300.0 }));
        assert!(widget.pointer_down(Point { x: 110.0, y: 110.0 }));

        widget.pointer_move(Point { x: -500.0, y: -500.0 });
        assert_eq!(widget.overlay().unwrap().position, Point { x: 0.0, y: 0.0 });

        widget.pointer_move(Point { x: 5000.0, y: 5000.0 });
        assert_eq!(
            widget.overlay().unwrap().position,
            Point { x: 960.0, y: 380.0 }
        );

        widget.pointer_move(Point { x: 510.0, y: 210.0 });
        assert_eq!(
            widget.overlay().unwrap().position,
            Point { x: 500.0, y: 200.0 }
        );

        widget.pointer_up();
        assert!(!widget.is_dragging());
        widget.pointer_move(Point { x: 0.0, y: 0.0 });
        assert_eq!(
            widget.overlay().unwrap().position,
            Point { x: 500.0, y: 200.0 }
        );
    }

    #[tokio::test]
    async fn blank_input_sends_nothing() {
        let (mut widget, mut bg) = controller();
        widget.inject(WidgetConfig::default());
        assert!(widget.send_user_message("   \n").await.is_none());
        assert!(widget.overlay().unwrap().entries.is_empty());

        drop(widget);
        assert!(bg.recv().await.is_none());
    }

    #[tokio::test]
    async fn failed_send_adds_system_note() {
        let (mut widget, mut bg) = controller();
        widget.inject(WidgetConfig::default());
        widget.set_input("hello there");

        tokio::spawn(async move {
            if let Some(request) = bg.recv().await {
                assert_eq!(request.envelope["action"], "SEND_MESSAGE");
                assert_eq!(request.envelope["text"], "hello there");
                request.respond(Reply::failure(&ChatEmError::Api {
                    status: 401,
                    message: "expired".to_string(),
                }));
            }
        });

        let pending = widget.submit_input().unwrap();
        assert_eq!(widget.overlay().unwrap().input, "");

        let reply = pending.wait().await;
        assert!(!reply.success);
        widget.apply_reply(&reply);

        let overlay = widget.overlay().unwrap();
        assert_eq!(overlay.entries.len(), 2);
        assert_eq!(overlay.entries[0].sender, Sender::User);
        assert_eq!(overlay.entries[1].sender, Sender::System);
        assert_eq!(overlay.entries[1].text, "Please sign in again.");
    }

    #[tokio::test]
    async fn requests_are_answered_while_a_send_is_pending() {
        let runtime = Runtime::new();
        let (tab, mut tab_mailbox) = runtime.connect(ContextId::Content(1));
        let (_bg, mut bg_mailbox) = runtime.connect(ContextId::Background);
        let (popup, _popup_mailbox) = runtime.connect(ContextId::Popup);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let viewport = Size {
            width: 1280.0,
            height: 800.0,
        };
        let mut widget = WidgetController::new(tab, viewport, PageInfo::default());
        widget.inject(WidgetConfig::default());
        let serving = tokio::spawn(async move {
            widget.serve(&mut tab_mailbox, &mut events_rx).await;
            widget
        });

        events_tx.send(WidgetEvent::Send("hi".to_string())).unwrap();
        let held = bg_mailbox.recv().await.unwrap();

        let reply = popup
            .send(
                ContextId::Content(1),
                json!({
                    "action": "DISPLAY_MESSAGE",
                    "message": { "text": "notice", "sender": "system" }
                }),
            )
            .wait()
            .await;
        assert!(reply.success);

        held.respond(Reply::ok().with("message", Message::new("hello", Sender::Agent)));
        runtime.disconnect(ContextId::Content(1));

        let widget = serving.await.unwrap();
        let texts: Vec<&str> = widget
            .overlay()
            .unwrap()
            .entries
            .iter()
            .map(|m| m.text.as_str())
            .collect();
        assert_eq!(texts, ["hi", "notice", "hello"]);
    }

    #[test]
    fn content_router_handles_known_actions() {
        let (mut widget, _bg) = controller();

        let reply = widget.handle_message(&json!({ "action": "UPDATE_CHAT_WIDGET", "data": {} }));
        assert!(!reply.success);

        let reply = widget.handle_message(&json!({
            "action": "INJECT_CHAT_WIDGET",
            "config": { "title": "Docs" }
        }));
        assert_eq!(reply.get("created"), Some(&json!(true)));

        let reply = widget.handle_message(&json!({ "action": "TOGGLE_CHAT_WIDGET" }));
        assert_eq!(reply.get("visible"), Some(&json!(false)));

        let reply = widget.handle_message(&json!({ "action": "SCROLL_PAGE" }));
        assert_eq!(reply.error.as_deref(), Some("unknown action"));
    }
}
