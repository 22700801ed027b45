//! Best-effort event dispatch.
//!
//! Each send runs on its own detached task with a bounded timeout so a slow
//! or dead provider can never block the coordinator, and a cancelled job can
//! still report its own failure during shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::{Event, Notifier};

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
#[derive(Debug)]
pub struct Fanout {
    notifiers: HashMap<String, Arc<dyn Notifier>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, notifier: Arc<dyn Notifier>) {
        self.notifiers.insert(name.to_string(), notifier);
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Registered `(name, type)` pairs, sorted by name.
    pub fn names(&self) -> Vec<(String, &'static str)> {
        let mut names: Vec<(String, &'static str)> = self
            .notifiers
            .iter()
            .map(|(name, n)| (name.clone(), n.kind()))
            .collect();
        names.sort();
        names
    }

    /// Dispatches `event` to the named providers. Unknown names are logged;
    /// sends are fire-and-forget with no retry queue.
    pub fn notify(&self, event: Event, names: &[String]) {
        if names.is_empty() {
            return;
        }

        for name in names {
            let Some(notifier) = self.notifiers.get(name) else {
                warn!(
                    provider = %name,
                    container = %event.container_name,
                    "notification provider not found"
                );
                continue;
            };

            let notifier = notifier.clone();
            let event = event.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(SEND_TIMEOUT, notifier.send(&event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(
                        notifier = %notifier.name(),
                        event = %event.event_type.as_str(),
                        container = %event.container_name,
                        error = %err,
                        "notification failed"
                    ),
                    Err(_) => warn!(
                        notifier = %notifier.name(),
                        event = %event.event_type.as_str(),
                        container = %event.container_name,
                        "notification timed out"
                    ),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::EventType;
    use crate::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct RecordingNotifier {
        sent: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        fn name(&self) -> &str {
            "recorder"
        }

        fn kind(&self) -> &'static str {
            "test"
        }

        async fn send(&self, _event: &Event) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatches_to_named_subset_only() {
        let sent_a = Arc::new(AtomicUsize::new(0));
        let sent_b = Arc::new(AtomicUsize::new(0));

        let mut fanout = Fanout::new();
        fanout.add("a", Arc::new(RecordingNotifier { sent: sent_a.clone() }));
        fanout.add("b", Arc::new(RecordingNotifier { sent: sent_b.clone() }));

        let event = Event::new(EventType::BackupCompleted, "shop", "postgres");
        fanout.notify(event, &["a".to_string(), "missing".to_string()]);

        // Sends are detached; give them a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sent_a.load(Ordering::SeqCst), 1);
        assert_eq!(sent_b.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_name_list_sends_nothing() {
        let sent = Arc::new(AtomicUsize::new(0));
        let mut fanout = Fanout::new();
        fanout.add("a", Arc::new(RecordingNotifier { sent: sent.clone() }));

        fanout.notify(Event::new(EventType::BackupFailed, "shop", "postgres"), &[]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(sent.load(Ordering::SeqCst), 0);
    }
}
