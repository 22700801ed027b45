//! `backup` subcommand implementations: thin wrappers over the control
//! socket that render results for the terminal. Exit codes follow from the
//! returned `anyhow::Result`.

use std::path::PathBuf;

use anyhow::bail;

use crate::api::client::ControlClient;
use crate::notify::format_size;

pub async fn run(socket_path: PathBuf, container: &str, config: Option<&str>) -> anyhow::Result<()> {
    let client = ControlClient::new(socket_path);
    let response = client.run_backup(container, config).await?;

    if !response.success {
        bail!("backup failed: {}", response.error.unwrap_or_default());
    }

    println!("Backup completed successfully for container: {container}");
    if let Some(message) = response.message {
        println!("Message: {message}");
    }

    Ok(())
}

pub async fn list(socket_path: PathBuf, container: &str) -> anyhow::Result<()> {
    let client = ControlClient::new(socket_path);
    let response = client.list_backups(container).await?;

    if !response.success {
        bail!(
            "failed to list backups: {}",
            response.error.unwrap_or_default()
        );
    }

    if response.backups.is_empty() {
        println!("No backups found for container: {container}");
        return Ok(());
    }

    let key_width = response
        .backups
        .iter()
        .map(|b| b.key.len())
        .max()
        .unwrap_or(3)
        .max(3);

    println!("{:<key_width$}  {:>10}  DATE", "KEY", "SIZE");
    println!("{:<key_width$}  {:>10}  ----", "---", "----");
    for backup in &response.backups {
        println!(
            "{:<key_width$}  {:>10}  {}",
            backup.key,
            format_size(backup.size),
            backup
                .last_modified
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\nTotal: {} backup(s)", response.backups.len());
    Ok(())
}

pub async fn delete(socket_path: PathBuf, container: &str, key: &str) -> anyhow::Result<()> {
    let client = ControlClient::new(socket_path);
    let response = client.delete_backup(container, key).await?;

    if !response.success {
        bail!(
            "failed to delete backup: {}",
            response.error.unwrap_or_default()
        );
    }

    println!("Backup deleted successfully: {key}");
    Ok(())
}

pub async fn restore(socket_path: PathBuf, container: &str, key: &str) -> anyhow::Result<()> {
    let client = ControlClient::new(socket_path);
    let response = client.restore_backup(container, key).await?;

    if !response.success {
        bail!("restore failed: {}", response.error.unwrap_or_default());
    }

    println!("Backup restored successfully to container: {container}");
    if let Some(message) = response.message {
        println!("Message: {message}");
    }

    Ok(())
}
