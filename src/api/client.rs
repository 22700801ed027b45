//! HTTP client for the daemon's Unix control socket.
//!
//! reqwest cannot dial Unix sockets, so requests go through a hand-held
//! hyper HTTP/1 connection over `tokio::net::UnixStream`.

use std::path::PathBuf;

use anyhow::Context;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;

use super::{DeleteResponse, ListResponse, RestoreResponse, RunResponse};

pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    async fn request<T: DeserializeOwned>(&self, method: Method, path: &str) -> anyhow::Result<T> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!(
                    "failed to connect to daemon at {}",
                    self.socket_path.display()
                )
            })?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("HTTP handshake failed")?;
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(hyper::header::HOST, "localhost")
            .body(Empty::<Bytes>::new())?;

        let response = sender
            .send_request(request)
            .await
            .context("request failed")?;
        let body = response.collect().await.context("reading response")?.to_bytes();

        serde_json::from_slice(&body).context("failed to parse response")
    }

    pub async fn run_backup(
        &self,
        container: &str,
        config: Option<&str>,
    ) -> anyhow::Result<RunResponse> {
        let mut path = format!("/backup/run/{container}");
        if let Some(config) = config {
            path.push_str(&format!("?config={config}"));
        }
        self.request(Method::POST, &path).await
    }

    pub async fn list_backups(&self, container: &str) -> anyhow::Result<ListResponse> {
        self.request(Method::GET, &format!("/backup/list/{container}"))
            .await
    }

    pub async fn delete_backup(&self, container: &str, key: &str) -> anyhow::Result<DeleteResponse> {
        self.request(Method::DELETE, &format!("/backup/delete/{container}/{key}"))
            .await
    }

    pub async fn restore_backup(
        &self,
        container: &str,
        key: &str,
    ) -> anyhow::Result<RestoreResponse> {
        self.request(Method::POST, &format!("/backup/restore/{container}/{key}"))
            .await
    }
}
