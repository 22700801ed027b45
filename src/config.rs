//! Daemon configuration.
//!
//! Precedence is defaults → environment → command-line flags. Scalar flags
//! carry their env equivalents through clap; the repeatable storage/notify
//! option trees are assembled here from a `DOCKER_BACKUP_STORAGE_*` /
//! `DOCKER_BACKUP_NOTIFY_*` environment scan with `--storage` / `--notify`
//! arguments layered on top.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::error::BackupError;
use crate::Result;

pub const ENV_PREFIX: &str = "DOCKER_BACKUP_";
pub const ENV_STORAGE_PREFIX: &str = "DOCKER_BACKUP_STORAGE_";
pub const ENV_NOTIFY_PREFIX: &str = "DOCKER_BACKUP_NOTIFY_";

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/docker-backup.sock";

/// A named storage pool configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoragePool {
    pub name: String,
    pub pool_type: String,
    pub options: HashMap<String, String>,
}

/// A named notification provider configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyConfig {
    pub name: String,
    pub notifier_type: String,
    pub options: HashMap<String, String>,
}

/// `daemon` subcommand flags.
#[derive(Args, Debug, Clone)]
pub struct DaemonArgs {
    /// Docker daemon socket
    #[arg(
        long,
        env = "DOCKER_BACKUP_DOCKER_HOST",
        default_value = "unix:///var/run/docker.sock"
    )]
    pub docker_host: String,

    /// How often to rescan containers as a backstop for missed events
    #[arg(
        long,
        env = "DOCKER_BACKUP_POLL_INTERVAL",
        value_parser = humantime::parse_duration,
        default_value = "30s"
    )]
    pub poll_interval: Duration,

    /// Default storage pool name
    #[arg(long, env = "DOCKER_BACKUP_DEFAULT_STORAGE")]
    pub default_storage: Option<String>,

    /// Storage pool configuration (repeatable, format: pool.option=value)
    #[arg(long = "storage", value_name = "POOL.OPTION=VALUE")]
    pub storage: Vec<String>,

    /// Notification provider configuration (repeatable, format: name.option=value)
    #[arg(long = "notify", value_name = "NAME.OPTION=VALUE")]
    pub notify: Vec<String>,

    /// Enable the read-only dashboard endpoint on this address (e.g. 127.0.0.1:8080)
    #[arg(long, env = "DOCKER_BACKUP_DASHBOARD")]
    pub dashboard: Option<String>,
}

/// Fully resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub docker_host: String,
    pub poll_interval: Duration,
    pub socket_path: PathBuf,
    pub default_storage: String,
    pub storage_pools: HashMap<String, StoragePool>,
    pub notify_configs: HashMap<String, NotifyConfig>,
    pub dashboard_addr: Option<String>,
}

impl DaemonConfig {
    /// Resolves the full configuration from parsed flags plus an environment
    /// snapshot (injected for testability).
    pub fn resolve(
        args: &DaemonArgs,
        socket_path: PathBuf,
        env: &[(String, String)],
    ) -> Result<Self> {
        let storage_pools = parse_storage_pools(env, &args.storage)?;
        let notify_configs = parse_notify_configs(env, &args.notify)?;

        // Flag/env default first; a lone pool becomes the default otherwise.
        let mut default_storage = args.default_storage.clone().unwrap_or_default();
        if default_storage.is_empty() && storage_pools.len() == 1 {
            default_storage = storage_pools.keys().next().cloned().unwrap_or_default();
        }
        if !default_storage.is_empty() && !storage_pools.contains_key(&default_storage) {
            return Err(BackupError::InvalidConfig(format!(
                "default storage pool {default_storage:?} does not exist"
            )));
        }

        Ok(Self {
            docker_host: args.docker_host.clone(),
            poll_interval: args.poll_interval,
            socket_path,
            default_storage,
            storage_pools,
            notify_configs,
            dashboard_addr: args.dashboard.clone(),
        })
    }
}

/// Builds the storage pool map: env vars first, CLI args override.
pub fn parse_storage_pools(
    env: &[(String, String)],
    args: &[String],
) -> Result<HashMap<String, StoragePool>> {
    let mut pools: HashMap<String, StoragePool> = HashMap::new();

    for (name, option, value) in flatten_env(env, ENV_STORAGE_PREFIX) {
        set_storage_option(&mut pools, &name, &option, &value);
    }

    for arg in args {
        let (name, option, value) = split_option_arg(arg, "storage")?;
        set_storage_option(&mut pools, name, option, value);
    }

    for (name, pool) in &pools {
        if pool.pool_type.is_empty() {
            return Err(BackupError::InvalidConfig(format!(
                "storage pool {name:?} is missing the required 'type' option"
            )));
        }
    }

    Ok(pools)
}

/// Builds the notifier map: env vars first, CLI args override.
pub fn parse_notify_configs(
    env: &[(String, String)],
    args: &[String],
) -> Result<HashMap<String, NotifyConfig>> {
    let mut configs: HashMap<String, NotifyConfig> = HashMap::new();

    for (name, option, value) in flatten_env(env, ENV_NOTIFY_PREFIX) {
        set_notify_option(&mut configs, &name, &option, &value);
    }

    for arg in args {
        let (name, option, value) = split_option_arg(arg, "notify")?;
        set_notify_option(&mut configs, name, option, value);
    }

    for (name, config) in &configs {
        if config.notifier_type.is_empty() {
            return Err(BackupError::InvalidConfig(format!(
                "notification provider {name:?} is missing the required 'type' option"
            )));
        }
    }

    Ok(configs)
}

/// Splits a `name.option=value` argument.
fn split_option_arg<'a>(arg: &'a str, flag: &str) -> Result<(&'a str, &'a str, &'a str)> {
    let (key, value) = arg.split_once('=').ok_or_else(|| {
        BackupError::InvalidConfig(format!(
            "invalid {flag} argument {arg:?} (expected name.option=value)"
        ))
    })?;

    let (name, option) = key.split_once('.').ok_or_else(|| {
        BackupError::InvalidConfig(format!(
            "invalid {flag} key {key:?} (expected name.option)"
        ))
    })?;

    Ok((name, option, value))
}

/// Scans the environment for `<prefix><NAME>_<OPTION>=value` entries,
/// lower-casing both parts and converting underscores in the option to
/// hyphens (`ACCESS_KEY` → `access-key`).
fn flatten_env(env: &[(String, String)], prefix: &str) -> Vec<(String, String, String)> {
    let mut out = Vec::new();

    for (key, value) in env {
        let Some(remainder) = key.strip_prefix(prefix) else {
            continue;
        };
        let Some((name, option)) = remainder.split_once('_') else {
            continue;
        };
        if name.is_empty() || option.is_empty() {
            continue;
        }

        out.push((
            name.to_lowercase(),
            option.to_lowercase().replace('_', "-"),
            value.clone(),
        ));
    }

    out
}

fn set_storage_option(
    pools: &mut HashMap<String, StoragePool>,
    name: &str,
    option: &str,
    value: &str,
) {
    let pool = pools.entry(name.to_string()).or_insert_with(|| StoragePool {
        name: name.to_string(),
        ..Default::default()
    });

    if option == "type" {
        pool.pool_type = value.to_string();
    } else {
        pool.options.insert(option.to_string(), value.to_string());
    }
}

fn set_notify_option(
    configs: &mut HashMap<String, NotifyConfig>,
    name: &str,
    option: &str,
    value: &str,
) {
    let config = configs
        .entry(name.to_string())
        .or_insert_with(|| NotifyConfig {
            name: name.to_string(),
            ..Default::default()
        });

    if option == "type" {
        config.notifier_type = value.to_string();
    } else {
        config.options.insert(option.to_string(), value.to_string());
    }
}
