//! Lenient view of the Telegram `Update` object.
//!
//! Only the fields the handlers look at are modelled, and almost all of them
//! are optional: an incomplete update still parses and is then rejected by the
//! handler's own checks instead of failing the whole request.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub update_id: Option<i64>,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
    #[serde(default)]
    pub inline_query: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl User {
    pub fn full_name(&self) -> String {
        match &self.last_name {
            Some(last) if !last.is_empty() => format!("{} {}", self.first_name, last),
            _ => self.first_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub message: Option<serde_json::Value>,
    #[serde(default)]
    pub data: Option<String>,
}

/// Which handler an update belongs to.
#[derive(Debug, Clone, Copy)]
pub enum UpdateKind<'a> {
    Message(&'a Message),
    CallbackQuery(&'a CallbackQuery),
    InlineQuery,
    Other,
}

impl UpdateKind<'_> {
    pub fn label(&self) -> &'static str {
        match self {
            UpdateKind::Message(_) => "Message",
            UpdateKind::CallbackQuery(_) => "Callback Query",
            UpdateKind::InlineQuery => "Inline Query",
            UpdateKind::Other => "Other",
        }
    }
}

impl Update {
    /// Classify by field presence; a message wins over a callback query.
    pub fn kind(&self) -> UpdateKind<'_> {
        if let Some(message) = &self.message {
            UpdateKind::Message(message)
        } else if let Some(query) = &self.callback_query {
            UpdateKind::CallbackQuery(query)
        } else if self.inline_query.is_some() {
            UpdateKind::InlineQuery
        } else {
            UpdateKind::Other
        }
    }

    /// Text of the carried message, if it has any.
    pub fn text(&self) -> Option<&str> {
        self.message
            .as_ref()
            .and_then(|m| m.text.as_deref())
            .filter(|t| !t.is_empty())
    }
}
