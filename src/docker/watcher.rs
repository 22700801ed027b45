//! Container event watcher.
//!
//! Merges the Docker event stream with a periodic resync tick into a single
//! channel of [`ContainerEvent`]s. The tick acts as the backstop when the
//! event stream drops; the stream itself reconnects after a short delay.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::DockerClient;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    /// A container started.
    Started(String),
    /// A container stopped or died.
    Stopped(String),
    /// Periodic resync request; the receiver rescans the whole fleet.
    Sync,
}

pub struct Watcher {
    client: Arc<DockerClient>,
    poll_interval: Duration,
}

impl Watcher {
    pub fn new(client: Arc<DockerClient>, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    /// Spawns the event-stream and resync tasks, returning the merged event
    /// channel. Both tasks stop when the token is cancelled or the receiver
    /// is dropped.
    pub fn start(self, token: CancellationToken) -> mpsc::Receiver<ContainerEvent> {
        let (tx, rx) = mpsc::channel(64);

        let client = self.client.clone();
        let stream_tx = tx.clone();
        let stream_token = token.clone();
        tokio::spawn(async move {
            watch_events(client, stream_tx, stream_token).await;
        });

        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            poll_loop(poll_interval, tx, token).await;
        });

        rx
    }
}

async fn watch_events(
    client: Arc<DockerClient>,
    tx: mpsc::Sender<ContainerEvent>,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() {
            return;
        }

        let mut stream = client.events();

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                item = stream.next() => match item {
                    Some(Ok(message)) => {
                        let Some(id) = message.actor.as_ref().and_then(|a| a.id.clone()) else {
                            continue;
                        };
                        let event = match message.action.as_deref() {
                            Some("start") => ContainerEvent::Started(id),
                            Some("stop") | Some("die") => ContainerEvent::Stopped(id),
                            other => {
                                debug!(action = ?other, "ignoring container event");
                                continue;
                            }
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "docker event stream error, reconnecting");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        break;
                    }
                    None => {
                        warn!("docker event stream closed, reconnecting");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        break;
                    }
                },
            }
        }
    }
}

async fn poll_loop(
    poll_interval: Duration,
    tx: mpsc::Sender<ContainerEvent>,
    token: CancellationToken,
) {
    let start = tokio::time::Instant::now() + poll_interval;
    let mut ticker = tokio::time::interval_at(start, poll_interval);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                if tx.send(ContainerEvent::Sync).await.is_err() {
                    return;
                }
            }
        }
    }
}
