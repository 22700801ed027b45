//! Telegram bot notifier.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{format_event_message, Event, Notifier};
use crate::error::BackupError;
use crate::Result;

#[derive(Debug)]
pub struct TelegramNotifier {
    name: String,
    token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    /// Requires `token` and `chat-id` options.
    pub fn create(name: &str, options: &HashMap<String, String>) -> Result<Self> {
        let token = options.get("token").filter(|t| !t.is_empty()).ok_or_else(|| {
            BackupError::InvalidConfig(format!(
                "telegram notifier {name:?} requires a 'token' option"
            ))
        })?;

        let chat_id = options
            .get("chat-id")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                BackupError::InvalidConfig(format!(
                    "telegram notifier {name:?} requires a 'chat-id' option"
                ))
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| BackupError::InvalidConfig(err.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            token: token.clone(),
            chat_id: chat_id.clone(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, event: &Event) -> Result<()> {
        let payload = json!({
            "chat_id": self.chat_id,
            "text": format_event_message(event),
        });

        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|err| BackupError::Producer(format!("telegram request failed: {err}")))?;

        if !response.status().is_success() {
            return Err(BackupError::Producer(format!(
                "telegram API returned status {}",
                response.status()
            )));
        }

        Ok(())
    }
}
