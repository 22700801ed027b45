//! Volume producer.
//!
//! Archives every named volume a container mounts into one tar stream with
//! entries keyed `{volume_name}/{relative_path}`, zstd-compressed. Reading a
//! live volume is unsafe, so every container using one of the referenced
//! volumes is stopped up front and exactly the containers that were running
//! are started again on every exit path.
//!
//! Restore validates the whole archive against the mapped volume roots
//! before touching the filesystem, then clears each target volume once (on
//! its first entry) and extracts.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{BackupProducer, ZSTD_LEVEL};
use crate::docker::{ContainerInfo, ContainerRuntime, MountInfo};
use crate::error::BackupError;
use crate::Result;

const STOP_TIMEOUT_SECS: i64 = 30;

pub struct VolumeProducer;

impl VolumeProducer {
    fn volume_mounts(container: &ContainerInfo) -> Vec<MountInfo> {
        container
            .mounts
            .iter()
            .filter(|m| m.is_volume())
            .cloned()
            .collect()
    }

    /// Every container (running or not) using any of the given volumes,
    /// deduplicated by id.
    async fn volume_consumers(
        &self,
        runtime: &dyn ContainerRuntime,
        mounts: &[MountInfo],
    ) -> Result<Vec<ContainerInfo>> {
        let mut seen = HashSet::new();
        let mut consumers = Vec::new();

        for mount in mounts {
            for container in runtime.containers_using_volume(&mount.name).await? {
                if seen.insert(container.id.clone()) {
                    consumers.push(container);
                }
            }
        }

        Ok(consumers)
    }
}

/// Stops every running consumer. If one stop fails, the ones already stopped
/// are started again before the error is returned.
async fn stop_consumers(
    runtime: &dyn ContainerRuntime,
    consumers: &[ContainerInfo],
) -> Result<Vec<String>> {
    let mut stopped = Vec::new();

    for container in consumers.iter().filter(|c| c.running) {
        debug!(container = %container.name, "stopping container for volume operation");
        if let Err(err) = runtime.stop_container(&container.id, STOP_TIMEOUT_SECS).await {
            start_containers(runtime, &stopped).await;
            return Err(err);
        }
        stopped.push(container.id.clone());
    }

    Ok(stopped)
}

async fn start_containers(runtime: &dyn ContainerRuntime, container_ids: &[String]) {
    for id in container_ids {
        if let Err(err) = runtime.start_container(id).await {
            warn!(container_id = %id, error = %err, "failed to restart container after volume operation");
        }
    }
}

#[async_trait]
impl BackupProducer for VolumeProducer {
    fn name(&self) -> &'static str {
        "volume"
    }

    fn extension(&self) -> &'static str {
        ".tar.zst"
    }

    fn validate(&self, container: &ContainerInfo) -> Result<()> {
        if Self::volume_mounts(container).is_empty() {
            return Err(BackupError::InvalidContainer(format!(
                "container {} has no mounted volumes",
                container.name
            )));
        }
        Ok(())
    }

    async fn backup(
        &self,
        token: &CancellationToken,
        container: &ContainerInfo,
        runtime: &dyn ContainerRuntime,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let mounts = Self::volume_mounts(container);
        if mounts.is_empty() {
            return Err(BackupError::InvalidContainer(format!(
                "container {} has no mounted volumes",
                container.name
            )));
        }

        let mut sources: Vec<(String, PathBuf)> = Vec::new();
        for mount in &mounts {
            let path = PathBuf::from(&mount.source);
            if !path.exists() {
                warn!(
                    container = %container.name,
                    volume = %mount.name,
                    path = %path.display(),
                    "volume path not found, skipping"
                );
                continue;
            }
            sources.push((mount.name.clone(), path));
        }

        let consumers = self.volume_consumers(runtime, &mounts).await?;
        let stopped = stop_consumers(runtime, &consumers).await?;

        let archive_token = token.clone();
        let result = tokio::task::spawn_blocking(move || archive_volumes(&sources, &archive_token))
            .await
            .map_err(|err| BackupError::Producer(err.to_string()))
            .and_then(|r| r);

        // Restart on success, failure, and cancellation alike.
        start_containers(runtime, &stopped).await;

        *out = result?;
        Ok(())
    }

    async fn restore(
        &self,
        token: &CancellationToken,
        container: &ContainerInfo,
        runtime: &dyn ContainerRuntime,
        data: Bytes,
    ) -> Result<()> {
        let mounts = Self::volume_mounts(container);
        let roots: Arc<HashMap<String, PathBuf>> = Arc::new(
            mounts
                .iter()
                .map(|m| (m.name.clone(), PathBuf::from(&m.source)))
                .collect(),
        );

        if roots.is_empty() {
            return Err(BackupError::InvalidContainer(format!(
                "container {} has no named volumes to restore",
                container.name
            )));
        }

        // First pass: refuse the whole archive before any volume is touched
        // if a single entry would land outside its volume root.
        {
            let data = data.clone();
            let roots = roots.clone();
            tokio::task::spawn_blocking(move || validate_archive(&data, &roots))
                .await
                .map_err(|err| BackupError::Producer(err.to_string()))??;
        }

        let consumers = self.volume_consumers(runtime, &mounts).await?;
        let stopped = stop_consumers(runtime, &consumers).await?;

        let extract_token = token.clone();
        let result =
            tokio::task::spawn_blocking(move || extract_archive(&data, &roots, &extract_token))
                .await
                .map_err(|err| BackupError::Producer(err.to_string()))
                .and_then(|r| r);

        start_containers(runtime, &stopped).await;

        result
    }
}

/// Walks each volume and writes its tree into a zstd-compressed tar archive.
/// Symlinks are stored as links; file modes and directory structure are
/// preserved.
fn archive_volumes(
    sources: &[(String, PathBuf)],
    token: &CancellationToken,
) -> Result<Vec<u8>> {
    let encoder = zstd::stream::write::Encoder::new(Vec::new(), ZSTD_LEVEL)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for (volume_name, source) in sources {
        for entry in WalkDir::new(source) {
            if token.is_cancelled() {
                return Err(BackupError::Cancelled);
            }

            let entry = entry.map_err(std::io::Error::from)?;
            let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());

            let archive_path = if rel.as_os_str().is_empty() {
                PathBuf::from(volume_name)
            } else {
                Path::new(volume_name).join(rel)
            };

            builder.append_path_with_name(entry.path(), &archive_path)?;
        }
    }

    Ok(builder.into_inner()?.finish()?)
}

/// Checks every entry of the archive against its mapped volume root without
/// writing anything. Entries for unmapped volumes are allowed here; the
/// extraction pass skips them with a warning.
fn validate_archive(data: &[u8], roots: &HashMap<String, PathBuf>) -> Result<()> {
    let decoder = zstd::stream::read::Decoder::new(data)
        .map_err(|err| BackupError::Producer(format!("invalid zstd stream: {err}")))?;
    let mut archive = tar::Archive::new(decoder);

    for entry in archive
        .entries()
        .map_err(|err| BackupError::Producer(format!("invalid tar stream: {err}")))?
    {
        let entry =
            entry.map_err(|err| BackupError::Producer(format!("invalid tar entry: {err}")))?;
        let path = entry
            .path()
            .map_err(|err| BackupError::Producer(format!("invalid tar entry path: {err}")))?
            .into_owned();

        let Some((volume_name, rel)) = split_volume_path(&path) else {
            return Err(BackupError::Producer(format!(
                "invalid path in archive: {}",
                path.display()
            )));
        };

        if let Some(root) = roots.get(&volume_name) {
            if resolve_entry(root, &rel).is_none() {
                return Err(BackupError::Producer(format!(
                    "archive entry {} escapes its volume root",
                    path.display()
                )));
            }
        }
    }

    Ok(())
}

/// Extracts the archive into the mapped volume roots. Each volume is cleared
/// exactly once, when its first entry is seen.
fn extract_archive(
    data: &[u8],
    roots: &HashMap<String, PathBuf>,
    token: &CancellationToken,
) -> Result<()> {
    let decoder = zstd::stream::read::Decoder::new(data)
        .map_err(|err| BackupError::Producer(format!("invalid zstd stream: {err}")))?;
    let mut archive = tar::Archive::new(decoder);

    let mut cleared: HashSet<String> = HashSet::new();

    for entry in archive
        .entries()
        .map_err(|err| BackupError::Producer(format!("invalid tar stream: {err}")))?
    {
        if token.is_cancelled() {
            return Err(BackupError::Cancelled);
        }

        let mut entry =
            entry.map_err(|err| BackupError::Producer(format!("invalid tar entry: {err}")))?;
        let path = entry
            .path()
            .map_err(|err| BackupError::Producer(format!("invalid tar entry path: {err}")))?
            .into_owned();

        let Some((volume_name, rel)) = split_volume_path(&path) else {
            continue;
        };

        let Some(root) = roots.get(&volume_name) else {
            warn!(volume = %volume_name, "backup contains unknown volume, skipping");
            continue;
        };

        if cleared.insert(volume_name.clone()) {
            clear_volume(root)?;
        }

        let Some(target) = resolve_entry(root, &rel) else {
            return Err(BackupError::Producer(format!(
                "archive entry {} escapes its volume root",
                path.display()
            )));
        };

        if target == *root {
            // The volume root itself already exists.
            continue;
        }

        let entry_type = entry.header().entry_type();
        if !(entry_type.is_dir() || entry_type.is_file() || entry_type.is_symlink()) {
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
    }

    Ok(())
}

/// Removes everything inside a volume directory, keeping the directory
/// itself.
fn clear_volume(root: &Path) -> Result<()> {
    for child in std::fs::read_dir(root)? {
        let child = child?;
        let path = child.path();
        if child.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Splits an archive path into the volume name (first component) and the
/// path inside the volume. Returns `None` for absolute or parent-leading
/// paths.
fn split_volume_path(path: &Path) -> Option<(String, PathBuf)> {
    let mut components = path.components();
    let volume = loop {
        match components.next()? {
            Component::Normal(part) => break part.to_string_lossy().into_owned(),
            Component::CurDir => continue,
            _ => return None,
        }
    };
    Some((volume, components.as_path().to_path_buf()))
}

/// Lexically resolves an entry path under its volume root. Returns `None`
/// when the path would escape the root.
fn resolve_entry(root: &Path, rel: &Path) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;

    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    Some(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn split_volume_path_cases() {
        let (volume, rel) = split_volume_path(Path::new("data/sub/file.txt")).unwrap();
        assert_eq!(volume, "data");
        assert_eq!(rel, Path::new("sub/file.txt"));

        let (volume, rel) = split_volume_path(Path::new("data")).unwrap();
        assert_eq!(volume, "data");
        assert!(rel.as_os_str().is_empty());

        assert!(split_volume_path(Path::new("/etc/passwd")).is_none());
        assert!(split_volume_path(Path::new("../up")).is_none());
    }

    #[test]
    fn resolve_entry_containment() {
        let root = Path::new("/vols/data");

        assert_eq!(
            resolve_entry(root, Path::new("a/b.txt")).unwrap(),
            Path::new("/vols/data/a/b.txt")
        );
        assert_eq!(
            resolve_entry(root, Path::new("a/../b.txt")).unwrap(),
            Path::new("/vols/data/b.txt")
        );
        assert!(resolve_entry(root, Path::new("..")).is_none());
        assert!(resolve_entry(root, Path::new("a/../../b.txt")).is_none());
        assert!(resolve_entry(root, Path::new("/abs")).is_none());
    }

    fn build_source_tree(dir: &Path) {
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("file.txt"), b"hello").unwrap();
        std::fs::write(dir.join("sub/nested.txt"), b"nested").unwrap();
        std::fs::set_permissions(dir.join("file.txt"), std::fs::Permissions::from_mode(0o600))
            .unwrap();
        std::os::unix::fs::symlink("file.txt", dir.join("link.txt")).unwrap();
    }

    #[test]
    fn archive_then_extract_round_trips() {
        let source = TempDir::new().unwrap();
        build_source_tree(source.path());

        let token = CancellationToken::new();
        let archive = archive_volumes(
            &[("data".to_string(), source.path().to_path_buf())],
            &token,
        )
        .unwrap();

        let target = TempDir::new().unwrap();
        // Pre-existing content must be cleared by the restore.
        std::fs::write(target.path().join("stale.txt"), b"stale").unwrap();

        let roots: HashMap<String, PathBuf> =
            [("data".to_string(), target.path().to_path_buf())].into();

        validate_archive(&archive, &roots).unwrap();
        extract_archive(&archive, &roots, &token).unwrap();

        assert!(!target.path().join("stale.txt").exists());
        assert_eq!(
            std::fs::read(target.path().join("file.txt")).unwrap(),
            b"hello"
        );
        assert_eq!(
            std::fs::read(target.path().join("sub/nested.txt")).unwrap(),
            b"nested"
        );

        let mode = std::fs::metadata(target.path().join("file.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        let link = std::fs::read_link(target.path().join("link.txt")).unwrap();
        assert_eq!(link, Path::new("file.txt"));
    }

    #[test]
    fn unknown_volume_entries_are_skipped() {
        let source = TempDir::new().unwrap();
        build_source_tree(source.path());

        let token = CancellationToken::new();
        let archive = archive_volumes(
            &[("other".to_string(), source.path().to_path_buf())],
            &token,
        )
        .unwrap();

        let target = TempDir::new().unwrap();
        let roots: HashMap<String, PathBuf> =
            [("data".to_string(), target.path().to_path_buf())].into();

        extract_archive(&archive, &roots, &token).unwrap();
        assert!(std::fs::read_dir(target.path()).unwrap().next().is_none());
    }

    #[test]
    fn escaping_entry_rejects_archive_without_changes() {
        // Hand-craft an archive whose entry climbs out of its volume. The
        // name bytes are written directly because tar writers refuse to
        // produce such paths themselves.
        let encoder = zstd::stream::write::Encoder::new(Vec::new(), ZSTD_LEVEL).unwrap();
        let mut builder = tar::Builder::new(encoder);

        let payload = b"evil";
        let mut header = tar::Header::new_gnu();
        let name = b"data/../../escape.txt";
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &payload[..]).unwrap();
        let archive = builder.into_inner().unwrap().finish().unwrap();

        let target = TempDir::new().unwrap();
        std::fs::write(target.path().join("keep.txt"), b"keep").unwrap();

        let roots: HashMap<String, PathBuf> =
            [("data".to_string(), target.path().to_path_buf())].into();

        let err = validate_archive(&archive, &roots).unwrap_err();
        assert!(matches!(err, BackupError::Producer(_)));

        // Validation alone must leave the volume untouched.
        assert_eq!(
            std::fs::read(target.path().join("keep.txt")).unwrap(),
            b"keep"
        );
    }

    mod quiescence {
        use super::*;
        use crate::docker::ExecOutput;
        use std::sync::Mutex;
        use tokio::io::AsyncWrite;

        /// Fake runtime tracking stop/start calls and live running state.
        struct FakeRuntime {
            containers: Mutex<Vec<ContainerInfo>>,
            stops: Mutex<Vec<String>>,
            starts: Mutex<Vec<String>>,
        }

        impl FakeRuntime {
            fn new(containers: Vec<ContainerInfo>) -> Self {
                Self {
                    containers: Mutex::new(containers),
                    stops: Mutex::new(Vec::new()),
                    starts: Mutex::new(Vec::new()),
                }
            }

            fn running_ids(&self) -> Vec<String> {
                self.containers
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|c| c.running)
                    .map(|c| c.id.clone())
                    .collect()
            }
        }

        #[async_trait]
        impl ContainerRuntime for FakeRuntime {
            async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
                Ok(self.running_ids()
                    .iter()
                    .filter_map(|id| {
                        self.containers
                            .lock()
                            .unwrap()
                            .iter()
                            .find(|c| &c.id == id)
                            .cloned()
                    })
                    .collect())
            }

            async fn inspect(&self, container_id: &str) -> Result<ContainerInfo> {
                self.containers
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|c| c.id == container_id)
                    .cloned()
                    .ok_or_else(|| BackupError::ContainerNotFound(container_id.to_string()))
            }

            async fn containers_using_volume(
                &self,
                volume_name: &str,
            ) -> Result<Vec<ContainerInfo>> {
                Ok(self
                    .containers
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|c| c.mounts.iter().any(|m| m.name == volume_name))
                    .cloned()
                    .collect())
            }

            async fn exec(
                &self,
                _container_id: &str,
                _cmd: Vec<String>,
                _stdin: Option<Bytes>,
            ) -> Result<ExecOutput> {
                Ok(ExecOutput {
                    exit_code: 0,
                    output: String::new(),
                })
            }

            async fn exec_streamed(
                &self,
                _container_id: &str,
                _cmd: Vec<String>,
                _out: &mut (dyn AsyncWrite + Unpin + Send),
            ) -> Result<i64> {
                Ok(0)
            }

            async fn stop_container(&self, container_id: &str, _timeout_secs: i64) -> Result<()> {
                self.stops.lock().unwrap().push(container_id.to_string());
                for c in self.containers.lock().unwrap().iter_mut() {
                    if c.id == container_id {
                        c.running = false;
                    }
                }
                Ok(())
            }

            async fn start_container(&self, container_id: &str) -> Result<()> {
                self.starts.lock().unwrap().push(container_id.to_string());
                for c in self.containers.lock().unwrap().iter_mut() {
                    if c.id == container_id {
                        c.running = true;
                    }
                }
                Ok(())
            }
        }

        fn consumer(id: &str, volume: &str, source: &Path, running: bool) -> ContainerInfo {
            ContainerInfo {
                id: id.to_string(),
                name: id.to_string(),
                labels: HashMap::new(),
                env: HashMap::new(),
                running,
                mounts: vec![MountInfo {
                    kind: "volume".to_string(),
                    name: volume.to_string(),
                    source: source.display().to_string(),
                    destination: "/data".to_string(),
                }],
            }
        }

        #[tokio::test]
        async fn backup_stops_every_running_consumer_and_restarts_them() {
            let volume_dir = TempDir::new().unwrap();
            build_source_tree(volume_dir.path());

            // c1 is the backup target, c2 shares the volume, c3 shares it
            // but was already stopped and must stay stopped.
            let runtime = FakeRuntime::new(vec![
                consumer("c1", "v", volume_dir.path(), true),
                consumer("c2", "v", volume_dir.path(), true),
                consumer("c3", "v", volume_dir.path(), false),
            ]);
            let target = runtime.inspect("c1").await.unwrap();

            let producer = VolumeProducer;
            let token = CancellationToken::new();
            let mut out = Vec::new();
            producer
                .backup(&token, &target, &runtime, &mut out)
                .await
                .unwrap();

            assert!(!out.is_empty());

            let mut stops = runtime.stops.lock().unwrap().clone();
            stops.sort();
            assert_eq!(stops, vec!["c1", "c2"]);

            let mut starts = runtime.starts.lock().unwrap().clone();
            starts.sort();
            assert_eq!(starts, vec!["c1", "c2"]);

            // c1 and c2 run again, c3 is still stopped.
            let mut running = runtime.running_ids();
            running.sort();
            assert_eq!(running, vec!["c1", "c2"]);
        }

        #[tokio::test]
        async fn failed_backup_still_restarts_stopped_consumers() {
            let volume_dir = TempDir::new().unwrap();
            build_source_tree(volume_dir.path());

            let runtime = FakeRuntime::new(vec![
                consumer("c1", "v", volume_dir.path(), true),
                consumer("c2", "v", volume_dir.path(), true),
            ]);
            let target = runtime.inspect("c1").await.unwrap();

            // Pre-cancelled token makes the archive walk fail after the
            // quiescence phase.
            let token = CancellationToken::new();
            token.cancel();

            let producer = VolumeProducer;
            let mut out = Vec::new();
            let err = producer
                .backup(&token, &target, &runtime, &mut out)
                .await
                .unwrap_err();
            assert!(matches!(err, BackupError::Cancelled));

            let mut running = runtime.running_ids();
            running.sort();
            assert_eq!(running, vec!["c1", "c2"]);
        }
    }

    #[test]
    fn cancellation_aborts_the_walk() {
        let source = TempDir::new().unwrap();
        build_source_tree(source.path());

        let token = CancellationToken::new();
        token.cancel();

        let err = archive_volumes(
            &[("data".to_string(), source.path().to_path_buf())],
            &token,
        )
        .unwrap_err();
        assert!(matches!(err, BackupError::Cancelled));
    }
}
