//! `chatem` command line host
//!
//! `chatem serve` runs the native messaging host the browser launches.
//! Every other subcommand sends a single envelope to the background
//! context, the way the popup would, and prints the reply.

use chatem::background::Background;
use chatem::channel::{ContextHandle, ContextId, Runtime};
use chatem::config::{
    load_host_config, load_host_config_from, save_host_config, save_host_config_to, HostConfig,
};
use chatem::paths::{clear_app_data, DATA_DIR_ENV};
use chatem::storage::{KeyValueStore, SqliteStore};
use chatem::{native, ApiClient, Reply};
use clap::{Parser, Subcommand};
use log::{error, info};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "chatem", version, about = "ChatEm extension host")]
struct Cli {
    /// Backend API base URL (overrides config.json)
    #[arg(long, env = "CHATEM_API_URL", global = true)]
    api_url: Option<String>,

    /// Directory holding config.json and storage.db
    #[arg(long, env = DATA_DIR_ENV, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run as a native messaging host on stdin/stdout
    Serve,
    /// Send a chat message and print the agent's reply
    Send {
        text: String,
        #[arg(long)]
        conversation_id: Option<String>,
    },
    /// Show or change settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Show or clear the conversation history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
    /// Show the signed-in user's profile
    Profile {
        /// Fetch the latest profile from the server
        #[arg(long)]
        refresh: bool,
    },
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        name: Option<String>,
    },
    Logout,
    /// Call an arbitrary API endpoint
    Fetch {
        endpoint: String,
        #[arg(long)]
        method: Option<String>,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
    },
    /// Inspect or wipe stored data
    Storage {
        #[command(subcommand)]
        action: StorageAction,
    },
    /// Show or change the host configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Send a raw JSON envelope to the background context
    Raw { envelope: String },
}

#[derive(Subcommand)]
enum SettingsAction {
    Show,
    /// VALUE is parsed as JSON, falling back to a plain string
    Set { key: String, value: String },
}

#[derive(Subcommand)]
enum HistoryAction {
    Show,
    Clear,
}

#[derive(Subcommand)]
enum StorageAction {
    /// Print every stored key and value
    Dump,
    /// Delete every stored value
    Clear,
    /// Delete the whole data directory, including config.json
    Reset,
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    SetApiUrl { url: String },
    SetTimeout { secs: u64 },
}

/// Data locations, either under `--data-dir` or the default app data dir
struct DataPaths {
    dir: Option<PathBuf>,
}

impl DataPaths {
    fn load_config(&self) -> Result<HostConfig, String> {
        match &self.dir {
            Some(dir) => load_host_config_from(&dir.join("config.json")),
            None => load_host_config(),
        }
    }

    fn save_config(&self, config: &HostConfig) -> Result<(), String> {
        match &self.dir {
            Some(dir) => save_host_config_to(&dir.join("config.json"), config),
            None => save_host_config(config),
        }
    }

    fn storage(&self, config: &HostConfig) -> Result<PathBuf, String> {
        match (&config.storage_path, &self.dir) {
            (None, Some(dir)) => Ok(dir.join("storage.db")),
            _ => config.resolve_storage_path(),
        }
    }

    fn remove_all(&self) -> Result<(), String> {
        match &self.dir {
            Some(dir) if dir.exists() => std::fs::remove_dir_all(dir)
                .map_err(|e| format!("Failed to clear app data: {}", e)),
            Some(_) => Ok(()),
            None => clear_app_data(),
        }
    }
}

/// Everything a subcommand needs to talk to the background context
struct Host {
    store: Arc<SqliteStore>,
    handle: ContextHandle,
}

impl Host {
    async fn start(config: &HostConfig, paths: &DataPaths, as_context: ContextId) -> Result<Self, String> {
        let storage_path = paths.storage(config)?;
        info!("[startup] Storage: {:?}", storage_path);
        let store = Arc::new(SqliteStore::open(&storage_path).map_err(|e| e.to_string())?);

        info!("[startup] API: {}", config.api_base_url);
        let api = ApiClient::new(&config.api_base_url, config.request_timeout());

        let runtime = Runtime::new();
        let (background_handle, mailbox) = runtime.connect(ContextId::Background);
        let background = Arc::new(Background::new(store.clone(), api, background_handle));
        background.start().await;
        tokio::spawn(background.serve(mailbox));

        // The mailbox is dropped: nothing sends to the CLI context itself
        let (handle, _mailbox) = runtime.connect(as_context);
        Ok(Self { store, handle })
    }

    async fn request(&self, envelope: Value) -> Reply {
        self.handle.send(ContextId::Background, envelope).wait().await
    }
}

fn parse_json(raw: &str, what: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("Invalid {} JSON: {}", what, e))
}

fn print_json(value: &Value) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", text);
    Ok(())
}

fn print_reply(reply: &Reply) -> Result<(), String> {
    print_json(&reply.to_value())?;
    if reply.success {
        Ok(())
    } else {
        Err(reply
            .error
            .clone()
            .unwrap_or_else(|| "request failed".to_string()))
    }
}

fn envelope_for(command: Command) -> Result<Value, String> {
    let envelope = match command {
        Command::Send {
            text,
            conversation_id,
        } => json!({
            "action": "SEND_MESSAGE",
            "text": text,
            "conversationId": conversation_id,
        }),
        Command::Settings { action } => match action {
            SettingsAction::Show => json!({ "action": "LOAD_SETTINGS" }),
            SettingsAction::Set { key, value } => {
                let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
                json!({ "action": "UPDATE_SETTING", "key": key, "value": value })
            }
        },
        Command::History { action } => match action {
            HistoryAction::Show => json!({ "action": "GET_CONVERSATION_HISTORY" }),
            HistoryAction::Clear => json!({ "action": "CLEAR_CONVERSATION_HISTORY" }),
        },
        Command::Profile { refresh } => json!({ "action": "GET_USER_PROFILE", "refresh": refresh }),
        Command::Login { email, password } => json!({
            "action": "LOGIN",
            "credentials": { "email": email, "password": password },
        }),
        Command::Register {
            email,
            password,
            name,
        } => json!({
            "action": "REGISTER",
            "user": { "email": email, "password": password, "name": name },
        }),
        Command::Logout => json!({ "action": "LOGOUT" }),
        Command::Fetch {
            endpoint,
            method,
            body,
        } => {
            let body = body.map(|b| parse_json(&b, "body")).transpose()?;
            json!({
                "action": "FETCH_FROM_API",
                "endpoint": endpoint,
                "options": { "method": method, "body": body },
            })
        }
        Command::Storage {
            action: StorageAction::Clear,
        } => json!({ "action": "CLEAR_ALL_DATA" }),
        Command::Raw { envelope } => parse_json(&envelope, "envelope")?,
        Command::Serve
        | Command::Storage { .. }
        | Command::Config { .. } => return Err("not a background request".to_string()),
    };
    Ok(envelope)
}

async fn run(cli: Cli) -> Result<(), String> {
    let paths = DataPaths { dir: cli.data_dir };
    let mut config = paths.load_config()?;
    if let Some(url) = cli.api_url {
        config.api_base_url = url;
    }

    match cli.command {
        Command::Serve => {
            info!("=== ChatEm native host starting ===");
            let host = Host::start(&config, &paths, ContextId::Native).await?;
            native::run_host(tokio::io::stdin(), tokio::io::stdout(), host.handle)
                .await
                .map_err(|e| e.to_string())
        }
        Command::Config { action } => {
            let changed = !matches!(action, ConfigAction::Show);
            match action {
                ConfigAction::Show => {}
                ConfigAction::SetApiUrl { url } => config.api_base_url = url,
                ConfigAction::SetTimeout { secs } => config.request_timeout_secs = secs,
            }
            if changed {
                paths.save_config(&config)?;
            }
            print_json(&serde_json::to_value(&config).map_err(|e| e.to_string())?)
        }
        Command::Storage {
            action: StorageAction::Reset,
        } => {
            paths.remove_all()?;
            info!("[reset] All ChatEm data removed");
            Ok(())
        }
        Command::Storage {
            action: StorageAction::Dump,
        } => {
            let host = Host::start(&config, &paths, ContextId::Options).await?;
            let all = host.store.get_all().await.map_err(|e| e.to_string())?;
            print_json(&Value::Object(all))
        }
        command => {
            let envelope = envelope_for(command)?;
            let host = Host::start(&config, &paths, ContextId::Popup).await?;
            let reply = host.request(envelope).await;
            print_reply(&reply)
        }
    }
}

#[tokio::main]
async fn main() {
    // stdout carries native messaging frames, so logs go to stderr
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}
