// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the transformation
//! order server.
//!
//! The server reads one TOML file ([`ServerConfig`]) for its own runtime
//! settings, plus a handful of YAML side-files that describe the parts of
//! the system that operators change without a redeploy: per-role quotas
//! ([`RolesConfig`]), download hub credentials ([`HubsConfig`]), and the
//! optional provenance trace-signing service ([`TraceConfig`]).
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML or YAML.
    #[error("failed to parse config {path}: {reason}")]
    ParseError {
        /// Path of the file that failed to parse.
        path: String,
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

impl ConfigError {
    /// Lift this error into a [`tf_error::TfError`] tagged `ConfigError`/`ConfigInvalid` etc.
    pub fn into_tf_error(self) -> tf_error::TfError {
        use tf_error::{ErrorCode, TfError};
        match self {
            ConfigError::FileNotFound { path } => {
                TfError::new(ErrorCode::ConfigMissing, format!("config file not found: {path}"))
                    .with_context("path", path)
            }
            ConfigError::ParseError { path, reason } => {
                TfError::new(ErrorCode::ConfigParseFailed, reason).with_context("path", path)
            }
            ConfigError::ValidationError { reasons } => {
                TfError::new(ErrorCode::ConfigInvalid, reasons.join("; "))
                    .with_context("reasons", reasons)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// A keeping period is unusually large, meaning completed orders linger.
    LargeKeepingPeriod {
        /// Configured keeping period in minutes.
        minutes: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::LargeKeepingPeriod { minutes } => {
                write!(f, "keeping_period_minutes is unusually large ({minutes}m)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ServerConfig (TOML)
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the transformation order server.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address the HTTP API binds to.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Directory used to stage downloads and intermediate processing output.
    pub processing_dir: String,

    /// Directory published output products are moved into; also the root
    /// against which `DownloadURI` paths are resolved.
    pub output_dir: String,

    /// URI root prefixed to the relative output path to build `DownloadURI`.
    pub download_uri_root: String,

    /// Minutes a completed or failed order is kept before eviction.
    #[serde(default = "default_keeping_period_minutes")]
    pub keeping_period_minutes: u64,

    /// Role name assigned to requests that carry no `X-Roles` header.
    pub default_role: String,

    /// Path to the YAML file describing per-role quotas.
    pub roles_config_path: String,

    /// Path to the YAML file describing download hub credentials.
    pub hubs_config_path: String,

    /// Path to the YAML traceability config. Absent disables trace signing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_config_path: Option<String>,

    /// Resource monitor sampling interval, in seconds.
    #[serde(default = "default_monitor_poll_secs")]
    pub monitor_poll_secs: u64,

    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Workflow ids that are refused at admission regardless of caller role.
    #[serde(default)]
    pub excluded_workflows: Vec<String>,

    /// Global quota-enforcement toggle. When `false`, `submit_workflow`
    /// admits regardless of the caller's uncompleted-order count.
    #[serde(default = "default_quota_checking_enabled")]
    pub quota_checking_enabled: bool,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_quota_checking_enabled() -> bool {
    true
}

fn default_keeping_period_minutes() -> u64 {
    20_160 // 14 days, matching the original service's default retention window.
}

fn default_monitor_poll_secs() -> u64 {
    20
}

// ---------------------------------------------------------------------------
// RolesConfig (YAML)
// ---------------------------------------------------------------------------

/// Per-role concurrent-order quota.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct RoleEntry {
    /// Maximum number of orders in `queued`/`in_progress` state at once.
    pub max_uncompleted_orders: usize,
}

/// Role-to-quota mapping, loaded from a YAML file that operators may edit
/// without restarting the server (see [`load_roles_config`]'s mtime cache).
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct RolesConfig {
    /// Quota per role name.
    pub roles: BTreeMap<String, RoleEntry>,
}

impl RolesConfig {
    /// Look up the quota for a role, falling back to `default_role` if the
    /// caller's role isn't listed.
    pub fn quota_for(&self, role: &str, default_role: &str) -> Option<&RoleEntry> {
        self.roles.get(role).or_else(|| self.roles.get(default_role))
    }
}

// ---------------------------------------------------------------------------
// HubsConfig (YAML)
// ---------------------------------------------------------------------------

/// Authentication scheme for a single download hub.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "auth")]
pub enum HubAuth {
    /// HTTP Basic authentication.
    #[serde(rename = "basic")]
    Basic {
        /// Basic auth username.
        username: String,
        /// Basic auth password.
        password: String,
    },
    /// OAuth2 resource-owner password grant, token refreshed on expiry.
    #[serde(rename = "oauth2")]
    OAuth2 {
        /// Username presented to the token endpoint.
        username: String,
        /// Password presented to the token endpoint.
        password: String,
        /// Token endpoint URL.
        token_url: String,
        /// OAuth2 client id.
        client_id: String,
    },
}

/// A single configured download hub, tried in the order it appears in
/// [`HubsConfig::hubs`].
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct HubEntry {
    /// Operator-facing hub name, used in logs and failure context.
    pub name: String,
    /// Base URL of the hub's OData product API.
    pub url: String,
    /// Authentication scheme for this hub.
    pub auth: HubAuth,
}

/// The set of configured download hubs, tried most-preferred first.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct HubsConfig {
    /// Hubs in priority order.
    pub hubs: Vec<HubEntry>,
}

// ---------------------------------------------------------------------------
// TraceConfig (YAML)
// ---------------------------------------------------------------------------

/// Configuration for the provenance trace-signing service.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct TraceConfig {
    /// Base URL of the trace-signing service.
    pub service_url: String,
    /// Service account username.
    pub username: String,
    /// Service account password.
    pub password: String,
    /// Fingerprint of the signing key used to authenticate trace submissions.
    pub key_fingerprint: String,
    /// Passphrase protecting the signing key.
    pub passphrase: String,
    /// Logical context tag attached to every submitted trace.
    pub service_context: String,
    /// Service type tag.
    pub service_type: String,
    /// Service provider tag.
    pub service_provider: String,
    /// Event type recorded for a successful transformation (default `"CREATE"`).
    #[serde(default = "default_event_type")]
    pub event_type: String,
}

fn default_event_type() -> String {
    "CREATE".to_string()
}

// ---------------------------------------------------------------------------
// Loading: ServerConfig (TOML)
// ---------------------------------------------------------------------------

/// Load a [`ServerConfig`] from a TOML file.
pub fn load_server_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.display().to_string(),
    })?;
    toml::from_str::<ServerConfig>(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Validate a parsed [`ServerConfig`], returning advisory warnings.
///
/// Hard errors (empty `default_role`, zero-length processing/output dirs)
/// come back as [`ConfigError::ValidationError`]; soft issues as warnings.
pub fn validate_server_config(config: &ServerConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if config.default_role.trim().is_empty() {
        errors.push("default_role must not be empty".to_string());
    }
    if config.processing_dir.trim().is_empty() {
        errors.push("processing_dir must not be empty".to_string());
    }
    if config.output_dir.trim().is_empty() {
        errors.push("output_dir must not be empty".to_string());
    }
    if config.keeping_period_minutes == 0 {
        errors.push("keeping_period_minutes must be greater than zero".to_string());
    } else if config.keeping_period_minutes > 525_600 {
        warnings.push(ConfigWarning::LargeKeepingPeriod {
            minutes: config.keeping_period_minutes,
        });
    }
    if config.trace_config_path.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "trace_config_path".into(),
            hint: "completed orders will not produce signed provenance traces".into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Loading: YAML side-configs, with mtime-keyed reload
// ---------------------------------------------------------------------------

fn parse_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.display().to_string(),
    })?;
    serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

/// A YAML config file that reloads itself only when its mtime changes.
///
/// Mirrors the original system's `cachetools`-based TTL cache keyed on
/// `(path, mtime)`: repeated calls to [`CachedYamlConfig::get`] are cheap
/// stat-and-compare checks, and a fresh parse only happens when an operator
/// actually edits the file.
pub struct CachedYamlConfig<T> {
    path: PathBuf,
    cached: std::sync::Mutex<Option<(SystemTime, T)>>,
}

impl<T: for<'de> Deserialize<'de> + Clone> CachedYamlConfig<T> {
    /// Wrap a YAML file path in an mtime-gated cache.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: std::sync::Mutex::new(None),
        }
    }

    /// Return the current parsed value, reparsing if the file's mtime has
    /// changed (or on first access).
    pub fn get(&self) -> Result<T, ConfigError> {
        let current_mtime = mtime_of(&self.path);
        let mut guard = self.cached.lock().expect("config cache mutex poisoned");

        if let (Some(mtime), Some((cached_mtime, value))) = (current_mtime, guard.as_ref())
            && mtime == *cached_mtime
        {
            return Ok(value.clone());
        }

        let value: T = parse_yaml(&self.path)?;
        if let Some(mtime) = current_mtime {
            *guard = Some((mtime, value.clone()));
        } else {
            *guard = None;
        }
        Ok(value)
    }
}

/// Load a [`RolesConfig`] directly (no caching). Prefer [`CachedYamlConfig`]
/// in long-lived server processes.
pub fn load_roles_config(path: &Path) -> Result<RolesConfig, ConfigError> {
    parse_yaml(path)
}

/// Load a [`HubsConfig`] directly (no caching).
pub fn load_hubs_config(path: &Path) -> Result<HubsConfig, ConfigError> {
    parse_yaml(path)
}

/// Load a [`TraceConfig`] directly (no caching).
pub fn load_trace_config(path: &Path) -> Result<TraceConfig, ConfigError> {
    parse_yaml(path)
}

/// Validate a [`RolesConfig`] against the server's configured default role.
///
/// A [`RolesConfig`] missing an entry for `default_role` is a fatal
/// configuration error: every unauthenticated or role-less request resolves
/// to `default_role`, so a missing quota for it would silently let that
/// traffic bypass admission control.
pub fn validate_roles_config(
    roles: &RolesConfig,
    default_role: &str,
) -> Result<(), ConfigError> {
    if !roles.roles.contains_key(default_role) {
        return Err(ConfigError::ValidationError {
            reasons: vec![format!(
                "roles config has no quota entry for default_role '{default_role}'"
            )],
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_server_config() -> ServerConfig {
        ServerConfig {
            bind: default_bind(),
            processing_dir: "/data/processing".into(),
            output_dir: "/data/output".into(),
            download_uri_root: "https://example.test/".into(),
            keeping_period_minutes: default_keeping_period_minutes(),
            default_role: "standard".into(),
            roles_config_path: "/etc/tf/roles.yaml".into(),
            hubs_config_path: "/etc/tf/hubs.yaml".into(),
            trace_config_path: None,
            monitor_poll_secs: default_monitor_poll_secs(),
            log_level: Some("info".into()),
            excluded_workflows: Vec::new(),
            quota_checking_enabled: default_quota_checking_enabled(),
        }
    }

    #[test]
    fn default_server_config_is_valid() {
        let cfg = sample_server_config();
        let warnings = validate_server_config(&cfg).expect("should be valid");
        assert!(warnings.iter().any(|w| matches!(
            w,
            ConfigWarning::MissingOptionalField { field, .. } if field == "trace_config_path"
        )));
    }

    #[test]
    fn empty_default_role_is_rejected() {
        let mut cfg = sample_server_config();
        cfg.default_role = "  ".into();
        let err = validate_server_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn zero_keeping_period_is_rejected() {
        let mut cfg = sample_server_config();
        cfg.keeping_period_minutes = 0;
        let err = validate_server_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn huge_keeping_period_is_a_warning_not_an_error() {
        let mut cfg = sample_server_config();
        cfg.keeping_period_minutes = 600_000;
        let warnings = validate_server_config(&cfg).expect("should still be valid");
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::LargeKeepingPeriod { .. })));
    }

    #[test]
    fn parse_server_config_toml() {
        let toml_str = r#"
            processing_dir = "/proc"
            output_dir = "/out"
            download_uri_root = "https://x/"
            default_role = "standard"
            roles_config_path = "/r.yaml"
            hubs_config_path = "/h.yaml"
        "#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, toml_str).unwrap();
        let cfg = load_server_config(&path).unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:8080");
        assert_eq!(cfg.default_role, "standard");
        assert_eq!(cfg.keeping_period_minutes, 20_160);
    }

    #[test]
    fn load_missing_server_config_gives_file_not_found() {
        let err = load_server_config(Path::new("/nonexistent/server.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn roles_config_parses_yaml() {
        let yaml = r#"
roles:
  standard:
    max_uncompleted_orders: 5
  premium:
    max_uncompleted_orders: 20
"#;
        let roles: RolesConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(roles.roles["standard"].max_uncompleted_orders, 5);
        assert_eq!(roles.roles["premium"].max_uncompleted_orders, 20);
    }

    #[test]
    fn roles_quota_for_falls_back_to_default_role() {
        let yaml = r#"
roles:
  standard:
    max_uncompleted_orders: 5
"#;
        let roles: RolesConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(roles.quota_for("unknown-role", "standard").is_some());
        assert!(roles.quota_for("unknown-role", "also-unknown").is_none());
    }

    #[test]
    fn validate_roles_config_requires_default_role_entry() {
        let yaml = r#"
roles:
  premium:
    max_uncompleted_orders: 20
"#;
        let roles: RolesConfig = serde_yaml::from_str(yaml).unwrap();
        let err = validate_roles_config(&roles, "standard").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn hubs_config_parses_basic_and_oauth2() {
        let yaml = r#"
hubs:
  - name: primary
    url: https://hub-a.test
    auth: basic
    username: alice
    password: secret
  - name: fallback
    url: https://hub-b.test
    auth: oauth2
    username: bob
    password: hunter2
    token_url: https://hub-b.test/token
    client_id: tf-client
"#;
        let hubs: HubsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(hubs.hubs.len(), 2);
        assert_eq!(hubs.hubs[0].name, "primary");
        assert!(matches!(hubs.hubs[0].auth, HubAuth::Basic { .. }));
        assert!(matches!(hubs.hubs[1].auth, HubAuth::OAuth2 { .. }));
    }

    #[test]
    fn trace_config_defaults_event_type_to_create() {
        let yaml = r#"
service_url: https://trace.test
username: svc
password: pw
key_fingerprint: ABCD1234
passphrase: pw2
service_context: tf-server
service_type: order
service_provider: tf-server
"#;
        let cfg: TraceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.event_type, "CREATE");
    }

    #[test]
    fn cached_yaml_config_reloads_only_on_mtime_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roles.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "roles:\n  standard:\n    max_uncompleted_orders: 5").unwrap();
        drop(f);

        let cache: CachedYamlConfig<RolesConfig> = CachedYamlConfig::new(&path);
        let first = cache.get().unwrap();
        assert_eq!(first.roles["standard"].max_uncompleted_orders, 5);

        // Unchanged file: get() again returns identical content without erroring.
        let second = cache.get().unwrap();
        assert_eq!(second.roles["standard"].max_uncompleted_orders, 5);

        // Touch the file with new content and a forced later mtime.
        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(&path, "roles:\n  standard:\n    max_uncompleted_orders: 9\n").unwrap();
        let third = cache.get().unwrap();
        assert_eq!(third.roles["standard"].max_uncompleted_orders, 9);
    }

    #[test]
    fn config_error_into_tf_error_maps_categories() {
        let e = ConfigError::FileNotFound { path: "/x".into() }.into_tf_error();
        assert_eq!(e.category(), tf_error::ErrorCategory::ConfigError);
    }
}
