//! Bot API client
//!
//! Thin wrapper over the Telegram-style Bot HTTP API: outbound messages
//! (split at paragraph boundaries when they exceed the channel limit),
//! inline keyboards for approvals, and long-poll `getUpdates`. The base URL
//! is overridable so tests can point the client at a local server.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use steward_core::{Result, StewardError};
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.telegram.org";
const DEFAULT_MESSAGE_LIMIT: usize = 4096;

/// Envelope every Bot API response arrives in
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

/// One long-poll update
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// Button press on an inline keyboard
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Serialize)]
struct InlineKeyboardButton {
    text: String,
    callback_data: String,
}

/// HTTP client for one bot token
#[derive(Clone)]
pub struct BotClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    message_limit: usize,
}

impl BotClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            token: token.into(),
            message_limit: DEFAULT_MESSAGE_LIMIT,
        }
    }

    /// Point the client at a different server (tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_message_limit(mut self, limit: usize) -> Self {
        self.message_limit = limit;
        self
    }

    fn url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let response = self
            .http
            .post(self.url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| StewardError::Bridge(format!("{} request failed: {}", method, e)))?;
        let envelope: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| StewardError::Bridge(format!("{} response malformed: {}", method, e)))?;
        if !envelope.ok {
            return Err(StewardError::Bridge(format!(
                "{} rejected: {}",
                method,
                envelope.description.unwrap_or_else(|| "no description".to_string())
            )));
        }
        envelope
            .result
            .ok_or_else(|| StewardError::Bridge(format!("{} returned no result", method)))
    }

    /// Send text, splitting at paragraph boundaries when over the limit
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        for chunk in split_message(text, self.message_limit) {
            debug!("Sending {} chars to chat {}", chunk.len(), chat_id);
            let _: serde_json::Value = self
                .call(
                    "sendMessage",
                    serde_json::json!({ "chat_id": chat_id, "text": chunk }),
                )
                .await?;
        }
        Ok(())
    }

    /// Send text with one row of inline buttons `(label, callback_data)`
    pub async fn send_with_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        buttons: &[(String, String)],
    ) -> Result<()> {
        let row: Vec<InlineKeyboardButton> = buttons
            .iter()
            .map(|(label, data)| InlineKeyboardButton {
                text: label.clone(),
                callback_data: data.clone(),
            })
            .collect();
        let _: serde_json::Value = self
            .call(
                "sendMessage",
                serde_json::json!({
                    "chat_id": chat_id,
                    "text": text,
                    "reply_markup": { "inline_keyboard": [row] },
                }),
            )
            .await?;
        Ok(())
    }

    /// Long-poll for updates after `offset`
    pub async fn get_updates(&self, offset: i64, timeout: Duration) -> Result<Vec<Update>> {
        self.call(
            "getUpdates",
            serde_json::json!({
                "offset": offset,
                "timeout": timeout.as_secs(),
            }),
        )
        .await
    }

    /// Acknowledge a button press so the client stops its spinner
    pub async fn answer_callback(&self, callback_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "answerCallbackQuery",
                serde_json::json!({ "callback_query_id": callback_id }),
            )
            .await?;
        Ok(())
    }
}

/// Split text into chunks no longer than `limit` characters
///
/// Preference order: paragraph boundaries (blank line), then line
/// boundaries, then a hard split on a char boundary. Chunk boundaries never
/// land inside a multi-byte character.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for paragraph in text.split("\n\n") {
        let candidate_len = if current.is_empty() {
            paragraph.chars().count()
        } else {
            current.chars().count() + 2 + paragraph.chars().count()
        };
        if candidate_len <= limit {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if paragraph.chars().count() <= limit {
            current.push_str(paragraph);
        } else {
            split_long_block(paragraph, limit, &mut chunks, &mut current);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Break an oversized paragraph at line boundaries, hard-splitting any
/// single line longer than the limit
fn split_long_block(block: &str, limit: usize, chunks: &mut Vec<String>, current: &mut String) {
    for line in block.split('\n') {
        let candidate_len = if current.is_empty() {
            line.chars().count()
        } else {
            current.chars().count() + 1 + line.chars().count()
        };
        if candidate_len <= limit {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(current));
        }
        if line.chars().count() <= limit {
            current.push_str(line);
        } else {
            let mut rest: Vec<char> = line.chars().collect();
            while rest.len() > limit {
                chunks.push(rest.drain(..limit).collect());
            }
            current.extend(rest);
        }
    }
}
