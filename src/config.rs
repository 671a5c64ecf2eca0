use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const DEFAULT_CONFIG_FILE: &str = "chatbridge.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bot_name: String,
    /// Fragment matched against the sender identity to grant admin commands.
    pub admin_id: String,
    pub log_level: String,
    pub http_port: u16,
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub whatsapp: WhatsAppConfig,
    pub signal: SignalConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub default_model: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub query_timeout_secs: u64,
    pub free_marker: String,
    pub auto_model: String,
    pub model_list_limit: usize,
    pub fallback_models: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub file: PathBuf,
    pub max_messages: usize,
    pub max_age_hours: u64,
    pub flush_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    pub enabled: bool,
    pub bridge_url: String,
    pub send_timeout_secs: u64,
    pub dedup_capacity: usize,
    pub watchdog: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub enabled: bool,
    pub rpc_addr: String,
    pub account: String,
    pub send_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    pub watchdog: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot_name: "ChatBridge".to_string(),
            admin_id: String::new(),
            log_level: "info".to_string(),
            http_port: 3000,
            llm: LlmConfig::default(),
            memory: MemoryConfig::default(),
            whatsapp: WhatsAppConfig::default(),
            signal: SignalConfig::default(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.kilo.ai/api/gateway".to_string(),
            api_key: String::new(),
            default_model: "minimax/minimax-m2.5:free".to_string(),
            system_prompt: "You are a helpful, efficient and concise AI assistant.".to_string(),
            max_tokens: 1000,
            query_timeout_secs: 35,
            free_marker: ":free".to_string(),
            auto_model: "kilo/auto".to_string(),
            model_list_limit: 10,
            fallback_models: vec![
                "kilo/auto".to_string(),
                "minimax/minimax-m2.5:free".to_string(),
                "z-ai/glm-5:free".to_string(),
            ],
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("data/memory.json"),
            max_messages: 50,
            max_age_hours: 48,
            flush_interval_secs: 300,
        }
    }
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bridge_url: "ws://127.0.0.1:8765".to_string(),
            send_timeout_secs: 10,
            dedup_capacity: 100,
            watchdog: true,
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rpc_addr: "127.0.0.1:7583".to_string(),
            account: String::new(),
            send_timeout_secs: 10,
            reconnect_delay_secs: 5,
            watchdog: false,
        }
    }
}

impl LlmConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

impl MemoryConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

impl Config {
    /// Read `path` if it exists, then apply environment overrides.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if tokio::fs::try_exists(path).await? {
            let content = tokio::fs::read_to_string(path).await?;
            let config: Config = toml::from_str(&content)?;
            info!("Loaded config from {}", path.display());
            config
        } else {
            info!("No {} found, using defaults.", path.display());
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Resolve the config path from `--config <path>`, then
    /// `CHATBRIDGE_CONFIG`, then the default file name.
    pub fn resolve_path(args: &[String]) -> PathBuf {
        let mut i = 1;
        while i < args.len() {
            if args[i] == "--config" && i + 1 < args.len() {
                return PathBuf::from(&args[i + 1]);
            }
            i += 1;
        }
        std::env::var("CHATBRIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(key) = get("LLM_API_KEY").or_else(|| get("KILO_API_KEY")) {
            self.llm.api_key = key;
        }
        if let Some(port) = get("PORT").and_then(|p| p.parse().ok()) {
            self.http_port = port;
        }
        if let Some(file) = get("MEMORY_FILE") {
            self.memory.file = PathBuf::from(file);
        }
        if let Some(admin) = get("ADMIN_ID") {
            self.admin_id = admin;
        }
        if let Some(account) = get("SIGNAL_ACCOUNT") {
            self.signal.account = account;
        }
        if let Some(addr) = get("SIGNAL_RPC_ADDR") {
            self.signal.rpc_addr = addr;
        }
        if let Some(url) = get("WHATSAPP_BRIDGE_URL") {
            self.whatsapp.bridge_url = url;
        }
    }
}
