//! Container label parsing.
//!
//! Backup behavior is declared entirely through container labels under the
//! `docker-backup` prefix. `docker-backup.enable` switches a container on;
//! `docker-backup.<name>.<property>` labels describe one named backup
//! configuration each. Parsing normalizes a label map into a [`ContainerPlan`]
//! or reports why the container has to be skipped.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::Serialize;

/// Fixed prefix for all backup labels.
pub const LABEL_PREFIX: &str = "docker-backup";

pub const PROP_ENABLE: &str = "enable";
pub const PROP_TYPE: &str = "type";
pub const PROP_SCHEDULE: &str = "schedule";
pub const PROP_RETENTION: &str = "retention";
pub const PROP_STORAGE: &str = "storage";
pub const PROP_NOTIFY: &str = "notify";

/// Property names with container-level meaning. A backup configuration may
/// not use any of these as its name.
pub const RESERVED_PROPERTIES: [&str; 6] = [
    PROP_ENABLE,
    PROP_TYPE,
    PROP_SCHEDULE,
    PROP_RETENTION,
    PROP_STORAGE,
    PROP_NOTIFY,
];

pub const DEFAULT_RETENTION: u32 = 7;

/// One named backup configuration, derived from `docker-backup.<name>.*`
/// labels.
#[derive(Debug, Clone, Serialize)]
pub struct BackupConfig {
    pub name: String,
    pub backup_type: String,
    pub schedule: String,
    pub retention: u32,
    /// Storage pool name; empty selects the default pool.
    pub storage: String,
    /// Per-config notifier override; empty inherits the container default.
    pub notify: Vec<String>,
}

/// Normalized interpretation of one container's labels.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerPlan {
    pub container_id: String,
    pub container_name: String,
    pub enabled: bool,
    /// Container-level notifier names.
    pub notify: Vec<String>,
    /// Sorted by name for deterministic ordering.
    pub backups: Vec<BackupConfig>,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LabelError {
    #[error("invalid value for {key}: {value:?} is not a boolean")]
    InvalidBool { key: String, value: String },

    #[error("container {container} config {name:?} has no backup type specified")]
    MissingType { container: String, name: String },

    #[error("container {container} config {name:?} has no schedule specified")]
    MissingSchedule { container: String, name: String },

    #[error("container {container} config {name:?} has invalid retention {value:?}")]
    InvalidRetention {
        container: String,
        name: String,
        value: String,
    },

    #[error(
        "container {container} has backup enabled but no backup configurations found \
         (use {prefix}.<name>.type=... labels)",
        prefix = LABEL_PREFIX
    )]
    NoConfigs { container: String },
}

/// Parses a container's label map into a [`ContainerPlan`].
///
/// A missing or `false` enable label yields a disabled plan without further
/// validation. Reserved property names used as config names are ignored so a
/// mislabeled group cannot take down the container's remaining configs.
pub fn parse_labels(
    container_id: &str,
    container_name: &str,
    labels: &HashMap<String, String>,
) -> Result<ContainerPlan, LabelError> {
    let mut plan = ContainerPlan {
        container_id: container_id.to_string(),
        container_name: container_name.to_string(),
        enabled: false,
        notify: Vec::new(),
        backups: Vec::new(),
    };

    let enable_key = format!("{LABEL_PREFIX}.{PROP_ENABLE}");
    if let Some(value) = labels.get(&enable_key) {
        plan.enabled = parse_bool(value).ok_or_else(|| LabelError::InvalidBool {
            key: enable_key,
            value: value.clone(),
        })?;
    }

    if !plan.enabled {
        return Ok(plan);
    }

    plan.notify = parse_notify_value(
        labels
            .get(&format!("{LABEL_PREFIX}.{PROP_NOTIFY}"))
            .map(String::as_str)
            .unwrap_or_default(),
    );

    plan.backups = parse_named_configs(container_name, labels)?;

    if plan.backups.is_empty() {
        return Err(LabelError::NoConfigs {
            container: container_name.to_string(),
        });
    }

    Ok(plan)
}

fn parse_named_configs(
    container_name: &str,
    labels: &HashMap<String, String>,
) -> Result<Vec<BackupConfig>, LabelError> {
    // BTreeMap keeps the resulting configs sorted by name.
    let mut groups: BTreeMap<&str, HashMap<&str, &str>> = BTreeMap::new();

    let prefix_dot = format!("{LABEL_PREFIX}.");
    for (key, value) in labels {
        let Some(remainder) = key.strip_prefix(&prefix_dot) else {
            continue;
        };

        // Single-part labels like "enable" are container-level.
        let Some((config_name, property)) = remainder.split_once('.') else {
            continue;
        };

        // A reserved property name cannot name a config group.
        if RESERVED_PROPERTIES.contains(&config_name) {
            continue;
        }

        groups
            .entry(config_name)
            .or_default()
            .insert(property, value.as_str());
    }

    groups
        .into_iter()
        .map(|(name, props)| parse_config_group(name, container_name, &props))
        .collect()
}

fn parse_config_group(
    name: &str,
    container_name: &str,
    props: &HashMap<&str, &str>,
) -> Result<BackupConfig, LabelError> {
    let backup_type = props.get(PROP_TYPE).map(|v| v.trim()).unwrap_or_default();
    if backup_type.is_empty() {
        return Err(LabelError::MissingType {
            container: container_name.to_string(),
            name: name.to_string(),
        });
    }

    let schedule = props
        .get(PROP_SCHEDULE)
        .map(|v| v.trim())
        .unwrap_or_default();
    if schedule.is_empty() {
        return Err(LabelError::MissingSchedule {
            container: container_name.to_string(),
            name: name.to_string(),
        });
    }

    let mut retention = DEFAULT_RETENTION;
    if let Some(value) = props.get(PROP_RETENTION) {
        retention = value
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|r| *r >= 1)
            .ok_or_else(|| LabelError::InvalidRetention {
                container: container_name.to_string(),
                name: name.to_string(),
                value: value.to_string(),
            })?;
    }

    Ok(BackupConfig {
        name: name.to_string(),
        backup_type: backup_type.to_string(),
        schedule: schedule.to_string(),
        retention,
        storage: props
            .get(PROP_STORAGE)
            .map(|v| v.trim().to_string())
            .unwrap_or_default(),
        notify: props
            .get(PROP_NOTIFY)
            .map(|v| parse_notify_value(v))
            .unwrap_or_default(),
    })
}

/// Parses a comma-separated notifier list, trimming whitespace and dropping
/// empty entries.
fn parse_notify_value(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Accepts the usual boolean literal spellings.
fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn disabled_container() {
        let plan = parse_labels(
            "abc123",
            "mycontainer",
            &labels(&[("docker-backup.enable", "false")]),
        )
        .unwrap();
        assert!(!plan.enabled);
        assert!(plan.backups.is_empty());
    }

    #[test]
    fn missing_enable_label_means_disabled() {
        let plan = parse_labels(
            "abc123",
            "mycontainer",
            &labels(&[
                ("docker-backup.db.type", "postgres"),
                ("docker-backup.db.schedule", "0 3 * * *"),
            ]),
        )
        .unwrap();
        assert!(!plan.enabled);
    }

    #[test]
    fn invalid_enable_value() {
        let err = parse_labels(
            "abc123",
            "mycontainer",
            &labels(&[("docker-backup.enable", "maybe")]),
        )
        .unwrap_err();
        assert!(matches!(err, LabelError::InvalidBool { .. }));
    }

    #[test]
    fn single_named_config() {
        let plan = parse_labels(
            "abc123",
            "mycontainer",
            &labels(&[
                ("docker-backup.enable", "true"),
                ("docker-backup.db.type", "postgres"),
                ("docker-backup.db.schedule", "0 3 * * *"),
            ]),
        )
        .unwrap();

        assert!(plan.enabled);
        assert_eq!(plan.backups.len(), 1);
        let backup = &plan.backups[0];
        assert_eq!(backup.name, "db");
        assert_eq!(backup.backup_type, "postgres");
        assert_eq!(backup.schedule, "0 3 * * *");
        assert_eq!(backup.retention, DEFAULT_RETENTION);
        assert!(backup.storage.is_empty());
    }

    #[test]
    fn multiple_configs_sorted_by_name() {
        let plan = parse_labels(
            "abc123",
            "mycontainer",
            &labels(&[
                ("docker-backup.enable", "true"),
                ("docker-backup.hourly.type", "postgres"),
                ("docker-backup.hourly.schedule", "0 * * * *"),
                ("docker-backup.hourly.retention", "24"),
                ("docker-backup.daily.type", "postgres"),
                ("docker-backup.daily.schedule", "0 3 * * *"),
                ("docker-backup.daily.retention", "30"),
                ("docker-backup.daily.storage", "s3"),
            ]),
        )
        .unwrap();

        assert_eq!(plan.backups.len(), 2);
        assert_eq!(plan.backups[0].name, "daily");
        assert_eq!(plan.backups[1].name, "hourly");
        assert_eq!(plan.backups[0].retention, 30);
        assert_eq!(plan.backups[0].storage, "s3");
        assert_eq!(plan.backups[1].retention, 24);
    }

    #[test]
    fn container_level_notify() {
        let plan = parse_labels(
            "abc123",
            "mycontainer",
            &labels(&[
                ("docker-backup.enable", "true"),
                ("docker-backup.notify", "telegram, discord, "),
                ("docker-backup.db.type", "postgres"),
                ("docker-backup.db.schedule", "0 3 * * *"),
            ]),
        )
        .unwrap();
        assert_eq!(plan.notify, vec!["telegram", "discord"]);
    }

    #[test]
    fn per_config_notify_override() {
        let plan = parse_labels(
            "abc123",
            "mycontainer",
            &labels(&[
                ("docker-backup.enable", "true"),
                ("docker-backup.notify", "telegram"),
                ("docker-backup.db.type", "postgres"),
                ("docker-backup.db.schedule", "0 3 * * *"),
                ("docker-backup.db.notify", "discord"),
            ]),
        )
        .unwrap();
        assert_eq!(plan.notify, vec!["telegram"]);
        assert_eq!(plan.backups[0].notify, vec!["discord"]);
    }

    #[test]
    fn reserved_name_used_as_config_is_ignored() {
        // "enable" as a config name must not produce a config, and must not
        // break the valid sibling config.
        let plan = parse_labels(
            "abc123",
            "mycontainer",
            &labels(&[
                ("docker-backup.enable", "true"),
                ("docker-backup.enable.type", "foo"),
                ("docker-backup.db.type", "volume"),
                ("docker-backup.db.schedule", "*/5 * * * *"),
            ]),
        )
        .unwrap();
        assert_eq!(plan.backups.len(), 1);
        assert_eq!(plan.backups[0].name, "db");
    }

    #[test]
    fn missing_type_is_an_error() {
        let err = parse_labels(
            "abc123",
            "mycontainer",
            &labels(&[
                ("docker-backup.enable", "true"),
                ("docker-backup.db.schedule", "0 3 * * *"),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, LabelError::MissingType { .. }));
    }

    #[test]
    fn missing_schedule_is_an_error() {
        let err = parse_labels(
            "abc123",
            "mycontainer",
            &labels(&[
                ("docker-backup.enable", "true"),
                ("docker-backup.db.type", "postgres"),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, LabelError::MissingSchedule { .. }));
    }

    #[test]
    fn retention_must_be_a_positive_integer() {
        for bad in ["abc", "0", "-3"] {
            let err = parse_labels(
                "abc123",
                "mycontainer",
                &labels(&[
                    ("docker-backup.enable", "true"),
                    ("docker-backup.db.type", "postgres"),
                    ("docker-backup.db.schedule", "0 3 * * *"),
                    ("docker-backup.db.retention", bad),
                ]),
            )
            .unwrap_err();
            assert!(matches!(err, LabelError::InvalidRetention { .. }), "{bad}");
        }
    }

    #[test]
    fn enabled_without_configs_is_an_error() {
        let err = parse_labels(
            "abc123",
            "mycontainer",
            &labels(&[("docker-backup.enable", "true")]),
        )
        .unwrap_err();
        assert!(matches!(err, LabelError::NoConfigs { .. }));
    }

    #[test]
    fn values_are_trimmed() {
        let plan = parse_labels(
            "abc123",
            "mycontainer",
            &labels(&[
                ("docker-backup.enable", "true"),
                ("docker-backup.db.type", "  postgres  "),
                ("docker-backup.db.schedule", " 0 3 * * * "),
                ("docker-backup.db.storage", " fast "),
            ]),
        )
        .unwrap();
        assert_eq!(plan.backups[0].backup_type, "postgres");
        assert_eq!(plan.backups[0].schedule, "0 3 * * *");
        assert_eq!(plan.backups[0].storage, "fast");
    }
}
