use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::info;

use crate::notify::MessageChannel;
use crate::types::ChannelError;

/// Telegram Bot API delivery channel.
///
/// A 403 means the user blocked the bot or never started it: permanent,
/// reported as unreachable so the subscription can be cleaned up. Everything
/// else is treated as transient.
pub struct TelegramChannel {
    http: Client,
    api_base: String,
}

impl TelegramChannel {
    /// Create a channel for the given bot token.
    pub fn new(bot_token: &str) -> Result<Self, ChannelError> {
        Self::with_api_base(format!("https://api.telegram.org/bot{bot_token}"))
    }

    /// Create a channel against a custom API base (tests).
    pub fn with_api_base(api_base: impl Into<String>) -> Result<Self, ChannelError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ChannelError::Transient(e.to_string()))?;

        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MessageChannel for TelegramChannel {
    async fn send_message(&self, user_id: i64, text: &str) -> Result<(), ChannelError> {
        let body = json!({
            "chat_id": user_id,
            "text": text,
            "disable_web_page_preview": false,
        });

        let response = self
            .http
            .post(format!("{}/sendMessage", self.api_base))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        match status.as_u16() {
            403 => Err(ChannelError::Unreachable(
                "user blocked the bot".to_string(),
            )),
            400 => Err(ChannelError::Unreachable("chat not found".to_string())),
            _ => Err(ChannelError::Transient(format!("HTTP {status}"))),
        }
    }
}

/// Mock channel for development and tests: logs and records every message.
#[derive(Default)]
pub struct MockChannel {
    /// Messages "delivered" so far
    pub sent: Mutex<Vec<(i64, String)>>,
}

#[async_trait]
impl MessageChannel for MockChannel {
    async fn send_message(&self, user_id: i64, text: &str) -> Result<(), ChannelError> {
        info!(user_id, "📨 [MOCK CHANNEL] {text}");
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((user_id, text.to_string()));
        Ok(())
    }
}
