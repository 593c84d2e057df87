use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{BotCommand, CallbackQueryId};
use tracing::debug;

use crate::config::TelegramConfig;
use crate::platform::Messenger;

/// Telegram Bot API client backed by teloxide.
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let mut bot = Bot::new(&config.bot_token);
        if let Some(api_url) = &config.api_url {
            let url = reqwest::Url::parse(api_url)
                .with_context(|| format!("Invalid Telegram API URL: {}", api_url))?;
            bot = bot.set_api_url(url);
        }
        Ok(Self { bot })
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64> {
        debug!("sendMessage to chat {}", chat_id);
        let sent = self
            .bot
            .send_message(ChatId(chat_id), text)
            .await
            .with_context(|| format!("Failed to send message to chat {}", chat_id))?;
        Ok(i64::from(sent.id.0))
    }

    async fn answer_callback_query(&self, query_id: &str, text: &str) -> Result<()> {
        debug!("answerCallbackQuery {}", query_id);
        self.bot
            .answer_callback_query(CallbackQueryId(query_id.to_string()))
            .text(text)
            .await
            .with_context(|| format!("Failed to answer callback query {}", query_id))?;
        Ok(())
    }

    async fn bot_username(&self) -> Result<Option<String>> {
        let me = self.bot.get_me().await.context("Telegram rejected getMe")?;
        Ok(me.user.username)
    }

    async fn set_webhook(&self, url: &str) -> Result<()> {
        let url = reqwest::Url::parse(url)
            .with_context(|| format!("Invalid webhook URL: {}", url))?;
        self.bot
            .set_webhook(url)
            .await
            .context("Telegram rejected setWebhook")?;
        Ok(())
    }

    async fn set_commands(&self, commands: &[(&str, &str)]) -> Result<()> {
        let commands: Vec<BotCommand> = commands
            .iter()
            .map(|(name, description)| BotCommand::new(*name, *description))
            .collect();
        self.bot
            .set_my_commands(commands)
            .await
            .context("Telegram rejected setMyCommands")?;
        Ok(())
    }
}
