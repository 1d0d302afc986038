/// Configuration management
use crate::error::{InboxError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_PORT: u16 = 9380;

/// Inbox session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The user whose inbox this session serves
    pub user_id: String,

    /// Optional data directory for the embedded stores (defaults to `.inbox/<user_id>`)
    pub data_dir: Option<PathBuf>,

    /// Local HTTP gateway address
    pub api_addr: SocketAddr,

    /// Max distance between an optimistic copy and a server copy for content-based dedup
    pub reconcile_window: Duration,

    /// Resubscribe attempts before the event bridge degrades to stale data
    pub reconnect_attempts: u32,

    /// Base delay between resubscribe attempts (doubled per attempt)
    pub reconnect_backoff: Duration,

    /// Capacity of the change-event broadcast channel
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            data_dir: None,
            api_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_API_PORT)),
            reconcile_window: Duration::from_secs(5),
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(500),
            event_buffer: 256,
        }
    }
}

impl Config {
    /// Config for `user_id` with every other field at its default
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    /// Resolved data directory
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".inbox").join(&self.user_id))
    }

    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(InboxError::Config(format!(
                "Usage: {} <user_id> [--data-dir <path>] [--api-port <port>] [--reconcile-ms <ms>] [--reconnect-attempts <n>]",
                args.first().map(String::as_str).unwrap_or("inbox")
            )));
        }

        let user_id = args[1].clone();
        if user_id.is_empty() || user_id.starts_with("--") {
            return Err(InboxError::Config("user_id must come first".to_string()));
        }

        let mut config = Config::for_user(user_id);
        let mut api_port: Option<u16> = None;

        let mut i = 2;
        while i < args.len() {
            let value = |name: &str| {
                args.get(i + 1)
                    .ok_or_else(|| InboxError::Config(format!("{} requires an argument", name)))
            };
            match args[i].as_str() {
                "--data-dir" => {
                    config.data_dir = Some(PathBuf::from(value("--data-dir")?));
                    i += 2;
                }
                "--api-port" => {
                    api_port = Some(value("--api-port")?.parse::<u16>().map_err(|_| {
                        InboxError::Config("--api-port must be a valid number (0-65535)".to_string())
                    })?);
                    i += 2;
                }
                "--reconcile-ms" => {
                    let ms = value("--reconcile-ms")?.parse::<u64>().map_err(|_| {
                        InboxError::Config("--reconcile-ms must be a number".to_string())
                    })?;
                    config.reconcile_window = Duration::from_millis(ms);
                    i += 2;
                }
                "--reconnect-attempts" => {
                    config.reconnect_attempts =
                        value("--reconnect-attempts")?.parse::<u32>().map_err(|_| {
                            InboxError::Config("--reconnect-attempts must be a number".to_string())
                        })?;
                    i += 2;
                }
                other => {
                    return Err(InboxError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Some(p) = std::env::var("INBOX_API_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            api_port = Some(p);
        }
        if let Ok(dir) = std::env::var("INBOX_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }

        if let Some(port) = api_port {
            config.api_addr = SocketAddr::from(([127, 0, 0, 1], port));
        }

        Ok(config)
    }
}
