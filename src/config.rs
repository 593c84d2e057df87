use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    Production,
    #[default]
    Development,
}

impl Environment {
    fn from_mode(mode: Option<&str>) -> Self {
        match mode {
            Some("production") => Environment::Production,
            _ => Environment::Development,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Production => write!(f, "production"),
            Environment::Development => write!(f, "development"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelegramConfig {
    /// Empty when no credential was provided; the bot then runs degraded.
    #[serde(default)]
    pub bot_token: String,
    /// Alternative Bot API server (e.g. a self-hosted `telegram-bot-api`).
    #[serde(default)]
    pub api_url: Option<String>,
    /// The bot's own `@username`, used to tell which group-chat commands are ours.
    /// Looked up with `getMe` at startup when not configured.
    #[serde(default)]
    pub bot_username: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Raw deployment mode string as configured, `None` when unset.
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            environment: None,
            port: default_port(),
        }
    }
}

fn default_port() -> u16 {
    3000
}

impl TelegramConfig {
    pub fn has_token(&self) -> bool {
        !self.bot_token.is_empty()
    }

    /// Store a username without its leading `@`; an empty value clears it.
    pub fn set_username(&mut self, username: &str) {
        let username = username.trim().trim_start_matches('@');
        self.bot_username = (!username.is_empty()).then(|| username.to_string());
    }
}

impl Config {
    pub fn environment(&self) -> Environment {
        Environment::from_mode(self.server.environment.as_deref())
    }

    /// Mode string as reported by `/debug`.
    pub fn environment_label(&self) -> &str {
        self.server.environment.as_deref().unwrap_or("not set")
    }

    /// Load the optional TOML file at `path`, then apply process environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid TOML configuration")
    }

    /// Overlay values from `lookup` (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(url) = lookup("TELEGRAM_API_URL").filter(|u| !u.is_empty()) {
            self.telegram.api_url = Some(url);
        }
        if let Some(username) = lookup("TELEGRAM_BOT_USERNAME") {
            self.telegram.set_username(&username);
        }
        if let Some(mode) = lookup("APP_ENV").or_else(|| lookup("NODE_ENV")) {
            self.server.environment = Some(mode);
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid PORT value: {:?}", port))?;
        }
        Ok(())
    }
}
