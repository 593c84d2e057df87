pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;

/// Outbound calls the bot makes against the chat platform.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send a text message, returning the id of the sent message.
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64>;

    async fn answer_callback_query(&self, query_id: &str, text: &str) -> Result<()>;

    /// The bot's own username as reported by the platform.
    async fn bot_username(&self) -> Result<Option<String>>;

    /// Ask the platform to push updates to `url`.
    async fn set_webhook(&self, url: &str) -> Result<()>;

    /// Publish the command list shown in the client's command menu.
    async fn set_commands(&self, commands: &[(&str, &str)]) -> Result<()>;
}
