use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::config::{Config, TelegramConfig};
use crate::platform::Messenger;
use crate::update::{CallbackQuery, Message, Update, UpdateKind};

pub const WEBHOOK_PATH: &str = "/api/webhook";

const ECHO_PREFIX: &str = "You said: ";

const START_TEXT: &str = "Welcome to Orion! 🌟 I'm a simple Telegram bot. Currently, I can only \
                          echo your messages back to you, but I'll learn more soon!";

const HELP_TEXT: &str = "Here's what I can do:\n\n\
                         • Echo your messages back to you\n\n\
                         Commands:\n\
                         /start - Start using the bot\n\
                         /help - Show this help message";

const UNKNOWN_COMMAND_TEXT: &str =
    "I don't recognize that command. Type /help to see what I can do!";

const APOLOGY_TEXT: &str = "Sorry, I encountered an error while processing your message.";

const CALLBACK_ACK_TEXT: &str = "Button clicked!";

/// Shared application state
pub struct AppState {
    pub config: Config,
    messenger: Arc<dyn Messenger>,
}

impl AppState {
    pub fn new(config: Config, messenger: Arc<dyn Messenger>) -> Self {
        Self { config, messenger }
    }
}

/// The fixed command set, keyed by the leading token of a `/` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Unknown(String),
}

impl Command {
    /// Commands published to the platform's command menu.
    pub const MENU: [(&'static str, &'static str); 2] = [
        ("start", "Start using the bot"),
        ("help", "Show this help message"),
    ];

    /// Parse the first whitespace-delimited token, ignoring case.
    ///
    /// Returns `None` when the token carries an `@username` suffix naming a
    /// different bot. With no known username every suffix is accepted.
    pub fn parse(text: &str, bot_username: Option<&str>) -> Option<Self> {
        let token = text
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_lowercase();
        let (name, addressee) = match token.split_once('@') {
            Some((name, addressee)) => (name, Some(addressee)),
            None => (token.as_str(), None),
        };

        if let (Some(addressee), Some(own)) = (addressee, bot_username) {
            if !addressee.eq_ignore_ascii_case(own) {
                return None;
            }
        }

        let command = match name {
            "/start" => Command::Start,
            "/help" => Command::Help,
            _ => Command::Unknown(name.to_string()),
        };
        Some(command)
    }

    fn reply(&self) -> &'static str {
        match self {
            Command::Start => START_TEXT,
            Command::Help => HELP_TEXT,
            Command::Unknown(_) => UNKNOWN_COMMAND_TEXT,
        }
    }
}

/// Dispatch one update to its handler. Handler failures are logged, never returned.
pub async fn route(state: &AppState, update: Update) {
    match update.kind() {
        UpdateKind::Message(message) => {
            if let Err(e) = handle_message(state, message).await {
                error!("Error processing message asynchronously: {:#}", e);
            }
        }
        UpdateKind::CallbackQuery(query) => {
            if let Err(e) = handle_callback_query(state, query).await {
                error!("Error processing callback query asynchronously: {:#}", e);
            }
        }
        kind => {
            info!("Ignoring update {:?} of type {}", update.update_id, kind.label());
        }
    }
}

pub async fn handle_message(state: &AppState, message: &Message) -> Result<()> {
    let (text, user) = match (message.text.as_deref(), message.from.as_ref()) {
        (Some(text), Some(user)) if !text.is_empty() => (text, user),
        _ => {
            warn!("Received message without text or sender info");
            return Ok(());
        }
    };

    let chat_id = message.chat.id;
    info!("Processing message: {:?}", text);
    info!("From: {} (ID: {})", user.full_name(), user.id);
    info!(
        "Chat: {} (ID: {})",
        message.chat.title.as_deref().unwrap_or("Private"),
        chat_id
    );

    if !state.config.telegram.has_token() {
        error!("Cannot send message: Telegram bot token is not set");
        return Ok(());
    }

    let outcome = if text.starts_with('/') {
        info!("Command detected: {}", text);
        handle_command(state, chat_id, text).await
    } else {
        echo(state, chat_id, text).await
    };

    if let Err(e) = outcome {
        error!("Error handling message: {:#}", e);
        if let Err(e) = state.messenger.send_message(chat_id, APOLOGY_TEXT).await {
            error!("Failed to send error message to user: {:#}", e);
        }
    }

    Ok(())
}

async fn echo(state: &AppState, chat_id: i64, text: &str) -> Result<()> {
    info!("Echoing message back: {:?}", text);
    let reply = format!("{}{}", ECHO_PREFIX, text);
    let message_id = state.messenger.send_message(chat_id, &reply).await?;
    info!("Message sent to Telegram (message ID: {})", message_id);
    Ok(())
}

/// Reply to a `/` command. Exactly one send; a send error is returned to the caller.
/// Commands addressed to another bot are ignored.
pub async fn handle_command(state: &AppState, chat_id: i64, text: &str) -> Result<()> {
    let Some(command) = Command::parse(text, state.config.telegram.bot_username.as_deref())
    else {
        info!("Ignoring command addressed to another bot: {}", text);
        return Ok(());
    };
    info!("Processing command: {:?}", command);

    if let Command::Unknown(token) = &command {
        warn!("Unknown command: {}", token);
    }

    state.messenger.send_message(chat_id, command.reply()).await?;
    info!("Reply to {:?} sent", command);
    Ok(())
}

pub async fn handle_callback_query(state: &AppState, query: &CallbackQuery) -> Result<()> {
    let data = match (query.data.as_deref(), query.message.as_ref()) {
        (Some(data), Some(_)) => data,
        _ => {
            warn!("Received callback query without data or message");
            return Ok(());
        }
    };

    info!("Callback query: {}", data);
    if let Some(user) = &query.from {
        info!("From: {} (ID: {})", user.full_name(), user.id);
    }

    state
        .messenger
        .answer_callback_query(&query.id, CALLBACK_ACK_TEXT)
        .await?;
    info!("Callback query answered");
    Ok(())
}

/// Point the platform at `<base_url>/api/webhook`. Returns `false` on any failure.
pub async fn register_webhook(state: &AppState, base_url: &str) -> bool {
    let url = webhook_url(base_url);

    if let Err(e) = state.messenger.set_webhook(&url).await {
        error!("Error setting webhook: {:#}", e);
        return false;
    }
    info!("Webhook set to {}", url);

    if let Err(e) = state.messenger.set_commands(&Command::MENU).await {
        warn!("Webhook set, but publishing the command menu failed: {:#}", e);
    }

    true
}

/// Fill in the bot's own username from the platform when it is not configured.
/// Failure only means suffixed group commands cannot be told apart.
pub async fn resolve_username(telegram: &mut TelegramConfig, messenger: &dyn Messenger) {
    if let Some(name) = telegram.bot_username.clone() {
        telegram.set_username(&name);
        return;
    }
    if !telegram.has_token() {
        return;
    }

    match messenger.bot_username().await {
        Ok(Some(name)) => {
            info!("Bot username: @{}", name);
            telegram.set_username(&name);
        }
        Ok(None) => warn!("getMe returned no username"),
        Err(e) => warn!("Could not look up the bot username: {:#}", e),
    }
}

pub fn webhook_url(base_url: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), WEBHOOK_PATH)
}
