//! Discord webhook notifier.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{format_duration, format_size, Event, EventType, Notifier};
use crate::error::BackupError;
use crate::Result;

const COLOR_BLUE: u32 = 3_447_003;
const COLOR_GREEN: u32 = 3_066_993;
const COLOR_RED: u32 = 15_158_332;

#[derive(Debug)]
pub struct DiscordNotifier {
    name: String,
    webhook_url: String,
    username: String,
    client: reqwest::Client,
}

impl DiscordNotifier {
    /// Requires a `webhook-url` option; `username` is optional.
    pub fn create(name: &str, options: &HashMap<String, String>) -> Result<Self> {
        let webhook_url = options
            .get("webhook-url")
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                BackupError::InvalidConfig(format!(
                    "discord notifier {name:?} requires a 'webhook-url' option"
                ))
            })?;

        let username = options
            .get("username")
            .filter(|u| !u.is_empty())
            .cloned()
            .unwrap_or_else(|| "Docker Backup".to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| BackupError::InvalidConfig(err.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            webhook_url: webhook_url.clone(),
            username,
            client,
        })
    }

    fn embed(event: &Event) -> Value {
        let color = match event.event_type {
            EventType::BackupStarted | EventType::RestoreStarted => COLOR_BLUE,
            EventType::BackupCompleted | EventType::RestoreCompleted => COLOR_GREEN,
            EventType::BackupFailed | EventType::RestoreFailed => COLOR_RED,
        };

        let mut fields = vec![
            json!({
                "name": "Container",
                "value": format!("`{}`", event.container_name),
                "inline": true,
            }),
            json!({
                "name": "Type",
                "value": format!("`{}`", event.backup_type),
                "inline": true,
            }),
        ];

        if let Some(key) = &event.key {
            fields.push(json!({
                "name": "Key",
                "value": format!("`{key}`"),
                "inline": false,
            }));
        }
        if let Some(size) = event.size {
            fields.push(json!({
                "name": "Size",
                "value": format_size(size),
                "inline": true,
            }));
        }
        if let Some(duration) = event.duration {
            fields.push(json!({
                "name": "Duration",
                "value": format_duration(duration),
                "inline": true,
            }));
        }
        if let Some(error) = &event.error {
            fields.push(json!({
                "name": "Error",
                "value": format!("```{error}```"),
                "inline": false,
            }));
        }

        json!({
            "title": event.event_type.title(),
            "color": color,
            "fields": fields,
            "timestamp": event.timestamp.to_rfc3339(),
        })
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "discord"
    }

    async fn send(&self, event: &Event) -> Result<()> {
        let payload = json!({
            "username": self.username,
            "embeds": [Self::embed(event)],
        });

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|err| BackupError::Producer(format!("discord request failed: {err}")))?;

        if !response.status().is_success() {
            return Err(BackupError::Producer(format!(
                "discord API returned status {}",
                response.status()
            )));
        }

        Ok(())
    }
}
