//! ChatEm extension core
//!
//! Storage, the backend API client, cross-context message routing and the
//! chat widget model, wired together by [`background::Background`].

pub mod api;
pub mod background;
pub mod channel;
pub mod config;
pub mod error;
pub mod models;
pub mod native;
pub mod paths;
pub mod router;
pub mod state;
pub mod storage;
pub mod widget;

pub use api::{ApiClient, RequestOptions};
pub use background::Background;
pub use channel::{ContextHandle, ContextId, Mailbox, Runtime};
pub use error::ChatEmError;
pub use models::{Message, PageInfo, Sender, Settings, UserProfile};
pub use router::Reply;
pub use state::StateManager;
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
pub use widget::WidgetController;
