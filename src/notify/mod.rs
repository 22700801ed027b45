//! Notification events and providers.

pub mod discord;
pub mod fanout;
pub mod telegram;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};

use crate::error::BackupError;
use crate::Result;

pub use fanout::Fanout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    BackupStarted,
    BackupCompleted,
    BackupFailed,
    RestoreStarted,
    RestoreCompleted,
    RestoreFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::BackupStarted => "backup_started",
            EventType::BackupCompleted => "backup_completed",
            EventType::BackupFailed => "backup_failed",
            EventType::RestoreStarted => "restore_started",
            EventType::RestoreCompleted => "restore_completed",
            EventType::RestoreFailed => "restore_failed",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            EventType::BackupStarted => "Backup Started",
            EventType::BackupCompleted => "Backup Completed",
            EventType::BackupFailed => "Backup Failed",
            EventType::RestoreStarted => "Restore Started",
            EventType::RestoreCompleted => "Restore Completed",
            EventType::RestoreFailed => "Restore Failed",
        }
    }
}

/// A backup lifecycle event handed to notifiers.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub container_name: String,
    pub backup_type: String,
    pub key: Option<String>,
    pub size: Option<u64>,
    pub duration: Option<Duration>,
    pub error: Option<String>,
    pub timestamp: DateTime<Local>,
}

impl Event {
    pub fn new(event_type: EventType, container_name: &str, backup_type: &str) -> Self {
        Self {
            event_type,
            container_name: container_name.to_string(),
            backup_type: backup_type.to_string(),
            key: None,
            size: None,
            duration: None,
            error: None,
            timestamp: Local::now(),
        }
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key = Some(key.to_string());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_error(mut self, error: &BackupError) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// A notification provider instance.
#[async_trait]
pub trait Notifier: Send + Sync + std::fmt::Debug {
    /// Instance name, as referenced by `notify` labels.
    fn name(&self) -> &str;

    /// Provider type identifier ("discord", "telegram").
    fn kind(&self) -> &'static str;

    async fn send(&self, event: &Event) -> Result<()>;
}

/// Provider types the daemon can instantiate.
pub fn notifier_types() -> &'static [&'static str] {
    &["discord", "telegram"]
}

/// Instantiates a notifier from its configured type and options. Like the
/// sink factory, this is an explicit table built at process start.
pub fn create_notifier(
    kind: &str,
    name: &str,
    options: &HashMap<String, String>,
) -> Result<Arc<dyn Notifier>> {
    match kind {
        "discord" => Ok(Arc::new(discord::DiscordNotifier::create(name, options)?)),
        "telegram" => Ok(Arc::new(telegram::TelegramNotifier::create(name, options)?)),
        other => Err(BackupError::UnknownType(other.to_string())),
    }
}

/// Plain-text rendering of an event, shared by text-based providers.
pub fn format_event_message(event: &Event) -> String {
    let mut message = format!(
        "{}\n\nContainer: {}\nType: {}\n",
        event.event_type.title(),
        event.container_name,
        event.backup_type
    );

    if let Some(key) = &event.key {
        message.push_str(&format!("Key: {key}\n"));
    }
    if let Some(size) = event.size {
        message.push_str(&format!("Size: {}\n", format_size(size)));
    }
    if let Some(duration) = event.duration {
        message.push_str(&format!("Duration: {}\n", format_duration(duration)));
    }
    if let Some(error) = &event.error {
        message.push_str(&format!("\nError: {error}"));
    }

    message
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }

    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }

    format!(
        "{:.1} {}B",
        bytes as f64 / div as f64,
        ['K', 'M', 'G', 'T', 'P', 'E'][exp]
    )
}

pub fn format_duration(duration: Duration) -> String {
    format!("{:.1}s", duration.as_secs_f64())
}
