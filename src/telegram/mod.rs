//! Telegram delivery side: Bot API transport, outbound throttling, and the
//! per-destination notification pipeline.

pub mod message;
pub mod notified;
pub mod observer;
pub mod throttle;

pub use notified::NotifiedChannel;
pub use observer::ChannelObserver;
pub use throttle::{ReservoirOptions, Throttler, ThrottlerOptions};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Telegram's maximum visible characters per text message. Renderers count
/// visible characters (markup excluded) against this budget and must never
/// exceed it.
pub const MAX_TEXT_MESSAGE_LENGTH: usize = 4096;

/// Extra send attempts after a failed call, and the pause between them.
const SEND_RETRY_LIMIT: usize = 3;
const SEND_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Options applied to both sends and edits.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Suppress link-preview expansion. Messages embed their own preview
    /// image through an invisible anchor, so this is off only when that
    /// anchor is present.
    pub disable_web_page_preview: bool,
}

/// Errors from the Bot API transport.
#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("telegram api error: status={status} body={body}")]
    Api { status: u16, body: String },
    #[error("telegram response is missing message_id")]
    MissingMessageId,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Message send/edit boundary of a destination.
///
/// The production implementation is [`TelegramBot`]; tests substitute a
/// recording double.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Send a new message, returning the destination-assigned message id.
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        options: &SendOptions,
    ) -> anyhow::Result<i64>;

    /// Edit a previously sent message in place.
    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: i64,
        text: &str,
        options: &SendOptions,
    ) -> anyhow::Result<()>;

    /// Bot display name, used in alert metadata.
    fn bot_name(&self) -> &str {
        ""
    }
}

fn is_user_chat(chat_id: &str) -> bool {
    chat_id.parse::<i64>().is_ok_and(|id| id >= 0)
}

fn is_group_chat(chat_id: &str) -> bool {
    chat_id.parse::<i64>().is_ok_and(|id| id < 0) || chat_id.starts_with('@')
}

fn user_throttler_options() -> ThrottlerOptions {
    ThrottlerOptions {
        min_interval: Duration::from_secs(1),
        max_concurrent: Some(5),
        reservoir: None,
    }
}

fn group_throttler_options() -> ThrottlerOptions {
    ThrottlerOptions {
        min_interval: Duration::from_secs(1),
        max_concurrent: Some(5),
        reservoir: Some(ReservoirOptions {
            capacity: 20,
            refresh_interval: Duration::from_secs(60),
        }),
    }
}

fn global_throttler_options() -> ThrottlerOptions {
    ThrottlerOptions {
        min_interval: Duration::from_millis(25),
        max_concurrent: None,
        reservoir: Some(ReservoirOptions {
            capacity: 30,
            refresh_interval: Duration::from_secs(1),
        }),
    }
}

/// One bot account: HTTP transport plus its outbound rate-limiter tree.
///
/// Every recipient chat gets its own limiter (user and group chats have
/// different quotas) chained under a shared account-wide limiter.
pub struct TelegramBot {
    name: String,
    token: String,
    api_base: String,
    client: reqwest::Client,
    global_throttler: Arc<Throttler>,
    chat_throttlers: Mutex<HashMap<String, Arc<Throttler>>>,
}

impl TelegramBot {
    pub fn new(token: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            api_base: "https://api.telegram.org".to_string(),
            client: reqwest::Client::new(),
            global_throttler: Throttler::new(global_throttler_options()),
            chat_throttlers: Mutex::new(HashMap::new()),
        }
    }

    /// Override the Bot API base URL. Useful for local Bot API servers or
    /// testing.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// The outbound throttler for a recipient chat, or `None` for an id that
    /// is neither a user nor a group/channel reference.
    pub fn throttler_for_chat(&self, chat_id: &str) -> Option<Arc<Throttler>> {
        let options = if is_user_chat(chat_id) {
            user_throttler_options()
        } else if is_group_chat(chat_id) {
            group_throttler_options()
        } else {
            return None;
        };

        let mut throttlers = self.chat_throttlers.lock();
        Some(Arc::clone(throttlers.entry(chat_id.to_string()).or_insert_with(
            || Throttler::with_parent(options, Arc::clone(&self.global_throttler)),
        )))
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token)
    }

    async fn call(&self, method: &str, body: &serde_json::Value) -> Result<serde_json::Value, TelegramError> {
        let mut attempt = 0;
        loop {
            let result = self.call_once(method, body).await;
            match result {
                Ok(value) => return Ok(value),
                Err(err) if attempt < SEND_RETRY_LIMIT => {
                    attempt += 1;
                    warn!("telegram {method} failed (attempt {attempt}): {err}; retrying");
                    tokio::time::sleep(SEND_RETRY_PAUSE).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn call_once(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, TelegramError> {
        let response = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TelegramError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl MessageTransport for TelegramBot {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        options: &SendOptions,
    ) -> anyhow::Result<i64> {
        let body = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": options.disable_web_page_preview,
        });
        let response = self.call("sendMessage", &body).await?;
        let message_id = response
            .get("result")
            .and_then(|r| r.get("message_id"))
            .and_then(serde_json::Value::as_i64)
            .ok_or(TelegramError::MissingMessageId)?;
        Ok(message_id)
    }

    async fn edit_message(
        &self,
        chat_id: &str,
        message_id: i64,
        text: &str,
        options: &SendOptions,
    ) -> anyhow::Result<()> {
        let body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": options.disable_web_page_preview,
        });
        self.call("editMessageText", &body).await?;
        Ok(())
    }

    fn bot_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_id_classification() {
        assert!(is_user_chat("12345"));
        assert!(!is_user_chat("-10012345"));
        assert!(!is_user_chat("@somegroup"));

        assert!(is_group_chat("-10012345"));
        assert!(is_group_chat("@somegroup"));
        assert!(!is_group_chat("12345"));
        assert!(!is_group_chat("not-a-chat"));
    }

    #[test]
    fn throttlers_are_cached_per_chat() {
        let bot = TelegramBot::new("token", "test-bot");
        let a = bot.throttler_for_chat("-100500").unwrap();
        let b = bot.throttler_for_chat("-100500").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(bot.throttler_for_chat("garbage id").is_none());
    }

    #[test]
    fn api_url_embeds_token_and_method() {
        let bot = TelegramBot::new("abc123", "test-bot").with_api_base("http://localhost:8081");
        assert_eq!(bot.api_url("sendMessage"), "http://localhost:8081/botabc123/sendMessage");
    }
}
