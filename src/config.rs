use anyhow::{Context, Result, anyhow};
use dispatch_core::identifiers::{
    MAX_QUEUE_NAME_LEN, QUEUE_NAME_FIELD, sanitize_component, truncate_identifier,
    truncated_message,
};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const CONFIG_FILE_NAME: &str = "config.json";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_QUEUE_NAME: &str = "build-dispatch";
pub const DEFAULT_RESULT_ROOT: &str = "/var/log/build-dispatch";
pub const DEFAULT_WORKSPACE_ROOT: &str = "/var/tmp/build-dispatch";
pub const DEFAULT_CLONE_SOURCE: &str = "https://github.com";
pub const DEFAULT_BUILD_SCRIPT: &str = ".build-dispatch.sh";
pub const DEFAULT_STATUS_CONTEXT: &str = "build-dispatch";
pub const DEFAULT_SECURITY_PROTOCOL: &str = "SASL_SSL";
pub const DEFAULT_SASL_MECHANISM: &str = "PLAIN";
pub const DEFAULT_TOPIC_PARTITIONS: i32 = 3;
pub const DEFAULT_TOPIC_REPLICATION_FACTOR: i32 = 1;
pub const DEFAULT_MAX_CONCURRENT_BUILDS: usize = 4;

/// One configuration file as written by operators. Every field is optional so
/// the same shape serves the global file and the per-repository overlay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigDocument {
    pub queue_name: Option<String>,
    pub kafka_brokers: Option<String>,
    pub kafka_username: Option<String>,
    pub kafka_password: Option<String>,
    pub kafka_security_protocol: Option<String>,
    pub kafka_sasl_mechanism: Option<String>,
    pub kafka_topic_partitions: Option<i32>,
    pub kafka_topic_replication_factor: Option<i32>,
    pub result_root: Option<PathBuf>,
    pub workspace_root: Option<PathBuf>,
    pub timeout: Option<u64>,
    pub clone_source: Option<String>,
    pub path_to_clone_in: Option<String>,
    pub build_script: Option<String>,
    pub status_context: Option<String>,
    pub max_concurrent_builds: Option<usize>,
}

impl ConfigDocument {
    /// Field-by-field merge: anything `local` sets wins, the rest is kept.
    pub fn overlay(self, local: ConfigDocument) -> ConfigDocument {
        ConfigDocument {
            queue_name: local.queue_name.or(self.queue_name),
            kafka_brokers: local.kafka_brokers.or(self.kafka_brokers),
            kafka_username: local.kafka_username.or(self.kafka_username),
            kafka_password: local.kafka_password.or(self.kafka_password),
            kafka_security_protocol: local
                .kafka_security_protocol
                .or(self.kafka_security_protocol),
            kafka_sasl_mechanism: local.kafka_sasl_mechanism.or(self.kafka_sasl_mechanism),
            kafka_topic_partitions: local
                .kafka_topic_partitions
                .or(self.kafka_topic_partitions),
            kafka_topic_replication_factor: local
                .kafka_topic_replication_factor
                .or(self.kafka_topic_replication_factor),
            result_root: local.result_root.or(self.result_root),
            workspace_root: local.workspace_root.or(self.workspace_root),
            timeout: local.timeout.or(self.timeout),
            clone_source: local.clone_source.or(self.clone_source),
            path_to_clone_in: local.path_to_clone_in.or(self.path_to_clone_in),
            build_script: local.build_script.or(self.build_script),
            status_context: local.status_context.or(self.status_context),
            max_concurrent_builds: local.max_concurrent_builds.or(self.max_concurrent_builds),
        }
    }
}

/// Credential that never shows up in `Debug` output or serialized dumps.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("Secret(***)")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***")
    }
}

/// Fully merged and defaulted configuration for one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveConfig {
    pub queue_name: String,
    pub kafka_brokers: String,
    pub kafka_username: String,
    pub kafka_password: Secret,
    pub kafka_security_protocol: String,
    pub kafka_sasl_mechanism: String,
    pub kafka_topic_partitions: i32,
    pub kafka_topic_replication_factor: i32,
    pub result_root: PathBuf,
    pub workspace_root: PathBuf,
    #[serde(serialize_with = "serialize_seconds")]
    pub timeout: Duration,
    pub clone_source: String,
    pub path_to_clone_in: Option<String>,
    pub build_script: String,
    pub status_context: String,
    pub max_concurrent_builds: usize,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            kafka_brokers: String::new(),
            kafka_username: String::new(),
            kafka_password: Secret::default(),
            kafka_security_protocol: DEFAULT_SECURITY_PROTOCOL.to_string(),
            kafka_sasl_mechanism: DEFAULT_SASL_MECHANISM.to_string(),
            kafka_topic_partitions: DEFAULT_TOPIC_PARTITIONS,
            kafka_topic_replication_factor: DEFAULT_TOPIC_REPLICATION_FACTOR,
            result_root: PathBuf::from(DEFAULT_RESULT_ROOT),
            workspace_root: PathBuf::from(DEFAULT_WORKSPACE_ROOT),
            timeout: DEFAULT_TIMEOUT,
            clone_source: DEFAULT_CLONE_SOURCE.to_string(),
            path_to_clone_in: None,
            build_script: DEFAULT_BUILD_SCRIPT.to_string(),
            status_context: DEFAULT_STATUS_CONTEXT.to_string(),
            max_concurrent_builds: DEFAULT_MAX_CONCURRENT_BUILDS,
        }
    }
}

impl EffectiveConfig {
    pub fn from_document(document: ConfigDocument) -> Result<Self> {
        let defaults = Self::default();

        let queue_name = document
            .queue_name
            .filter(|value| !value.trim().is_empty())
            .map(|value| checked_queue_name(&value))
            .unwrap_or(defaults.queue_name);

        let config = Self {
            queue_name,
            kafka_brokers: required_field("KafkaBrokers", document.kafka_brokers)?,
            kafka_username: required_field("KafkaUsername", document.kafka_username)?,
            kafka_password: Secret::new(required_field("KafkaPassword", document.kafka_password)?),
            kafka_security_protocol: non_empty_or(
                document.kafka_security_protocol,
                defaults.kafka_security_protocol,
            ),
            kafka_sasl_mechanism: non_empty_or(
                document.kafka_sasl_mechanism,
                defaults.kafka_sasl_mechanism,
            ),
            kafka_topic_partitions: document
                .kafka_topic_partitions
                .unwrap_or(defaults.kafka_topic_partitions),
            kafka_topic_replication_factor: document
                .kafka_topic_replication_factor
                .unwrap_or(defaults.kafka_topic_replication_factor),
            result_root: document.result_root.unwrap_or(defaults.result_root),
            workspace_root: document.workspace_root.unwrap_or(defaults.workspace_root),
            timeout: document
                .timeout
                .filter(|seconds| *seconds > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            clone_source: non_empty_or(document.clone_source, defaults.clone_source),
            path_to_clone_in: document
                .path_to_clone_in
                .filter(|value| !value.trim().is_empty()),
            build_script: non_empty_or(document.build_script, defaults.build_script),
            status_context: non_empty_or(document.status_context, defaults.status_context),
            max_concurrent_builds: document
                .max_concurrent_builds
                .filter(|count| *count > 0)
                .unwrap_or(defaults.max_concurrent_builds),
        };

        if config.kafka_topic_partitions <= 0 {
            return Err(anyhow!("KafkaTopicPartitions must be a positive integer"));
        }

        if config.kafka_topic_replication_factor <= 0 {
            return Err(anyhow!(
                "KafkaTopicReplicationFactor must be a positive integer"
            ));
        }

        Ok(config)
    }
}

pub fn resolve_global(config_root: &Path) -> Result<EffectiveConfig> {
    let global = read_global_document(config_root)?;
    EffectiveConfig::from_document(global)
        .with_context(|| format!("validate {}", global_config_path(config_root).display()))
}

pub fn resolve_for_repo(config_root: &Path, owner: &str, repo: &str) -> Result<EffectiveConfig> {
    let global = read_global_document(config_root)?;
    let local_path = repo_config_path(config_root, owner, repo);
    let merged = match read_document(&local_path)? {
        Some(local) => global.overlay(local),
        None => global,
    };

    EffectiveConfig::from_document(merged)
        .with_context(|| format!("validate configuration for {owner}/{repo}"))
}

pub fn global_config_path(config_root: &Path) -> PathBuf {
    config_root.join(CONFIG_FILE_NAME)
}

pub fn repo_config_path(config_root: &Path, owner: &str, repo: &str) -> PathBuf {
    config_root
        .join(sanitize_component(owner))
        .join(sanitize_component(repo))
        .join(CONFIG_FILE_NAME)
}

/// Applies the queue-name length limit, logging when it had to cut.
pub fn checked_queue_name(name: &str) -> String {
    match truncate_identifier(name, MAX_QUEUE_NAME_LEN) {
        Some(truncated) => {
            warn!(
                field = QUEUE_NAME_FIELD,
                max_len = MAX_QUEUE_NAME_LEN,
                original = %name,
                truncated = %truncated,
                "{}",
                truncated_message(QUEUE_NAME_FIELD)
            );
            truncated
        }
        None => name.to_string(),
    }
}

fn read_global_document(config_root: &Path) -> Result<ConfigDocument> {
    let path = global_config_path(config_root);
    read_document(&path)?.ok_or_else(|| anyhow!("missing global config at {}", path.display()))
}

fn read_document(path: &Path) -> Result<Option<ConfigDocument>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(error).with_context(|| format!("read config {}", path.display()));
        }
    };

    let document = serde_json::from_str(&raw)
        .with_context(|| format!("parse config {}", path.display()))?;
    Ok(Some(document))
}

fn required_field(name: &str, value: Option<String>) -> Result<String> {
    let value = value.ok_or_else(|| anyhow!("missing required config field: {name}"))?;
    if value.trim().is_empty() {
        return Err(anyhow!("required config field {name} cannot be empty"));
    }
    Ok(value)
}

fn non_empty_or(value: Option<String>, default: String) -> String {
    value
        .filter(|value| !value.trim().is_empty())
        .unwrap_or(default)
}

fn serialize_seconds<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONNECTION: &str = r#""KafkaBrokers":"empty","KafkaUsername":"empty","KafkaPassword":"empty""#;

    fn write_global(root: &Path, body: &str) {
        std::fs::write(global_config_path(root), body).expect("write global config");
    }

    fn write_local(root: &Path, owner: &str, repo: &str, body: &str) {
        let path = repo_config_path(root, owner, repo);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("create repo dir");
        std::fs::write(path, body).expect("write repo config");
    }

    #[test]
    fn missing_global_config_is_an_error() {
        let tmp = TempDir::new().expect("tempdir");
        let error = resolve_global(tmp.path()).expect_err("no config");
        assert!(format!("{error:#}").contains("missing global config"));
    }

    #[test]
    fn malformed_global_config_is_an_error() {
        let tmp = TempDir::new().expect("tempdir");
        write_global(tmp.path(), "{not json");
        assert!(resolve_global(tmp.path()).is_err());
    }

    #[test]
    fn unset_timeout_resolves_to_default() {
        let tmp = TempDir::new().expect("tempdir");
        write_global(tmp.path(), &format!("{{{CONNECTION}}}"));

        let config = resolve_global(tmp.path()).expect("config");
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_ne!(config.timeout, Duration::ZERO);
        assert_eq!(config.queue_name, DEFAULT_QUEUE_NAME);
        assert_eq!(config.result_root, PathBuf::from(DEFAULT_RESULT_ROOT));
    }

    #[test]
    fn zero_timeout_resolves_to_default() {
        let tmp = TempDir::new().expect("tempdir");
        write_global(tmp.path(), &format!(r#"{{"Timeout":0,{CONNECTION}}}"#));

        let config = resolve_global(tmp.path()).expect("config");
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn explicit_timeout_is_used() {
        let tmp = TempDir::new().expect("tempdir");
        write_global(tmp.path(), &format!(r#"{{"Timeout":4,{CONNECTION}}}"#));

        let config = resolve_global(tmp.path()).expect("config");
        assert_eq!(config.timeout, Duration::from_secs(4));
    }

    #[test]
    fn negative_timeout_is_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        write_global(tmp.path(), &format!(r#"{{"Timeout":-1,{CONNECTION}}}"#));
        assert!(resolve_global(tmp.path()).is_err());
    }

    #[test]
    fn connection_identifiers_are_required() {
        let tmp = TempDir::new().expect("tempdir");
        write_global(
            tmp.path(),
            r#"{"KafkaBrokers":"broker:9092","KafkaUsername":"user"}"#,
        );
        let error = resolve_global(tmp.path()).expect_err("missing password");
        assert!(format!("{error:#}").contains("KafkaPassword"));

        write_global(
            tmp.path(),
            r#"{"KafkaBrokers":"  ","KafkaUsername":"user","KafkaPassword":"pw"}"#,
        );
        let error = resolve_global(tmp.path()).expect_err("blank brokers");
        assert!(format!("{error:#}").contains("KafkaBrokers"));
    }

    #[test]
    fn over_length_queue_name_is_truncated_not_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        write_global(
            tmp.path(),
            &format!(r#"{{"QueueName":"12345678901234567890",{CONNECTION}}}"#),
        );

        let config = resolve_global(tmp.path()).expect("config");
        assert_eq!(config.queue_name.chars().count(), MAX_QUEUE_NAME_LEN);
        assert_eq!(config.queue_name, "123456789012345");
    }

    #[test]
    fn clone_path_overlay_leaves_other_fields_alone() {
        let tmp = TempDir::new().expect("tempdir");
        write_global(
            tmp.path(),
            &format!(
                r#"{{"ResultRoot":"/tmp/results","WorkspaceRoot":"/tmp/ws","Timeout":42,"QueueName":"ci",{CONNECTION}}}"#
            ),
        );
        write_local(
            tmp.path(),
            "MediaMath",
            "grim",
            r#"{"PathToCloneIn":"go/src/github.com/MediaMath/grim"}"#,
        );

        let global = resolve_global(tmp.path()).expect("global");
        let local = resolve_for_repo(tmp.path(), "MediaMath", "grim").expect("local");

        assert_eq!(
            local.path_to_clone_in.as_deref(),
            Some("go/src/github.com/MediaMath/grim")
        );
        assert_eq!(
            EffectiveConfig {
                path_to_clone_in: None,
                ..local
            },
            global
        );
    }

    #[test]
    fn overlay_overrides_only_present_fields() {
        let tmp = TempDir::new().expect("tempdir");
        write_global(
            tmp.path(),
            &format!(r#"{{"Timeout":42,"BuildScript":"ci.sh",{CONNECTION}}}"#),
        );
        write_local(tmp.path(), "o", "r", r#"{"Timeout":7}"#);

        let config = resolve_for_repo(tmp.path(), "o", "r").expect("config");
        assert_eq!(config.timeout, Duration::from_secs(7));
        assert_eq!(config.build_script, "ci.sh");
    }

    #[test]
    fn repositories_without_overlay_get_global_values() {
        let tmp = TempDir::new().expect("tempdir");
        write_global(tmp.path(), &format!(r#"{{"Timeout":42,{CONNECTION}}}"#));

        let config = resolve_for_repo(tmp.path(), "someone", "else").expect("config");
        assert_eq!(config, resolve_global(tmp.path()).expect("global"));
    }

    #[test]
    fn malformed_overlay_is_an_error() {
        let tmp = TempDir::new().expect("tempdir");
        write_global(tmp.path(), &format!("{{{CONNECTION}}}"));
        write_local(tmp.path(), "o", "r", "[]");
        assert!(resolve_for_repo(tmp.path(), "o", "r").is_err());
    }

    #[test]
    fn password_is_redacted_in_debug_and_json() {
        let config = EffectiveConfig {
            kafka_password: Secret::new("hunter2"),
            ..EffectiveConfig::default()
        };

        assert!(!format!("{config:?}").contains("hunter2"));
        let json = serde_json::to_string(&config).expect("serialize");
        assert!(!json.contains("hunter2"));
        assert!(json.contains("\"timeout\":300"));
    }
}
