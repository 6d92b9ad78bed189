//! `relay.toml` loading and validation.
//!
//! Secrets never live in this file. The GitHub token, webhook secret and API
//! token come from the command line or environment; each Jenkins instance
//! names the environment variable holding its API token (`token_env`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dispatch::{Backoff, CiEndpoint, CommandSettings, DispatchSettings, DEFAULT_MAX_CONCURRENT_TRIGGERS};
use jenkins::JenkinsInstance;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("environment variable {var} for Jenkins instance {url} is not set")]
    MissingToken { url: String, var: String },
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub github: GithubSection,
    pub jenkins: JenkinsSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GithubSection {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for GithubSection {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            retry_attempts: default_retry_attempts(),
            request_timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_base() -> String {
    github::DEFAULT_API_BASE.to_string()
}

fn default_retry_attempts() -> u32 {
    Backoff::default().max_attempts
}

fn default_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JenkinsSection {
    /// Instance that ephemeral comment-triggered jobs run on.
    pub default_endpoint: String,
    #[serde(default)]
    pub instances: Vec<JenkinsInstanceConfig>,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JenkinsInstanceConfig {
    pub url: String,
    pub user: String,
    /// Environment variable holding the API token.
    pub token_env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchSection {
    #[serde(default = "default_prefix")]
    pub comment_prefix: String,
    #[serde(default = "default_resync_label")]
    pub resync_label: String,
    #[serde(default = "default_resync_labels_label")]
    pub resync_labels_label: String,
    #[serde(default = "default_concurrency")]
    pub max_concurrent_triggers: usize,
    #[serde(default)]
    pub label_opened_pull_requests: bool,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            comment_prefix: default_prefix(),
            resync_label: default_resync_label(),
            resync_labels_label: default_resync_labels_label(),
            max_concurrent_triggers: default_concurrency(),
            label_opened_pull_requests: false,
        }
    }
}

fn default_prefix() -> String {
    CommandSettings::default().prefix
}

fn default_resync_label() -> String {
    CommandSettings::default().resync_label
}

fn default_resync_labels_label() -> String {
    CommandSettings::default().resync_labels_label
}

fn default_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENT_TRIGGERS
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistrySection {
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("relay-registry.json")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySection {
    #[serde(default)]
    pub log_format: LogFormat,
    /// OTLP/gRPC collector, e.g. `http://localhost:4317`. Spans are only
    /// exported when set.
    pub otlp_endpoint: Option<String>,
}

fn same_endpoint(a: &str, b: &str) -> bool {
    a.trim().trim_end_matches('/') == b.trim().trim_end_matches('/')
}

impl RelayConfig {
    /// Reads, parses and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jenkins.instances.is_empty() {
            return Err(invalid("at least one [[jenkins.instances]] entry is required"));
        }
        if !self
            .jenkins
            .instances
            .iter()
            .any(|i| same_endpoint(&i.url, &self.jenkins.default_endpoint))
        {
            return Err(invalid(format!(
                "jenkins.default_endpoint {} is not a configured instance",
                self.jenkins.default_endpoint
            )));
        }
        if self.github.retry_attempts == 0 || self.jenkins.retry_attempts == 0 {
            return Err(invalid("retry_attempts must be at least 1"));
        }
        let dispatch = &self.dispatch;
        if dispatch.max_concurrent_triggers == 0 {
            return Err(invalid("dispatch.max_concurrent_triggers must be at least 1"));
        }
        for (field, value) in [
            ("comment_prefix", &dispatch.comment_prefix),
            ("resync_label", &dispatch.resync_label),
            ("resync_labels_label", &dispatch.resync_labels_label),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(format!("dispatch.{field} must not be empty")));
            }
        }
        if dispatch.resync_label == dispatch.resync_labels_label {
            return Err(invalid("dispatch.resync_label and dispatch.resync_labels_label must differ"));
        }
        Ok(())
    }

    pub fn dispatch_settings(&self) -> Result<DispatchSettings, ConfigError> {
        let endpoint = CiEndpoint::new(self.jenkins.default_endpoint.trim_end_matches('/'))
            .ok_or_else(|| invalid("jenkins.default_endpoint must not be empty"))?;
        let mut settings = DispatchSettings::new(endpoint);
        settings.commands = CommandSettings {
            prefix: self.dispatch.comment_prefix.clone(),
            resync_label: self.dispatch.resync_label.clone(),
            resync_labels_label: self.dispatch.resync_labels_label.clone(),
        };
        settings.max_concurrent_triggers = self.dispatch.max_concurrent_triggers;
        settings.label_opened_pull_requests = self.dispatch.label_opened_pull_requests;
        Ok(settings)
    }

    /// Resolves each instance's API token through `lookup` (normally
    /// `std::env::var`).
    pub fn jenkins_instances(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Vec<JenkinsInstance>, ConfigError> {
        self.jenkins
            .instances
            .iter()
            .map(|instance| {
                let api_token = lookup(&instance.token_env)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| ConfigError::MissingToken {
                        url: instance.url.clone(),
                        var: instance.token_env.clone(),
                    })?;
                Ok(JenkinsInstance {
                    url: instance.url.clone(),
                    user: instance.user.clone(),
                    api_token,
                })
            })
            .collect()
    }

    pub fn github_backoff(&self) -> Backoff {
        Backoff {
            max_attempts: self.github.retry_attempts,
            ..Backoff::default()
        }
    }

    pub fn jenkins_backoff(&self) -> Backoff {
        Backoff {
            max_attempts: self.jenkins.retry_attempts,
            ..Backoff::default()
        }
    }

    pub fn github_timeout(&self) -> Duration {
        Duration::from_secs(self.github.request_timeout_secs)
    }

    pub fn jenkins_timeout(&self) -> Duration {
        Duration::from_secs(self.jenkins.request_timeout_secs)
    }
}

impl std::str::FromStr for RelayConfig {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let config: RelayConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [jenkins]
        default_endpoint = "https://ci.example.com/"

        [[jenkins.instances]]
        url = "https://ci.example.com"
        user = "relay"
        token_env = "RELAY_JENKINS_TOKEN"
    "#;

    #[test]
    fn minimal_file_gets_defaults() {
        let config: RelayConfig = MINIMAL.parse().unwrap();

        assert_eq!(config.server.bind, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.github.api_base, github::DEFAULT_API_BASE);
        assert_eq!(config.dispatch.comment_prefix, "relay");
        assert_eq!(config.dispatch.max_concurrent_triggers, DEFAULT_MAX_CONCURRENT_TRIGGERS);
        assert!(!config.dispatch.label_opened_pull_requests);
        assert_eq!(config.telemetry.log_format, LogFormat::Pretty);
        assert!(config.telemetry.otlp_endpoint.is_none());
    }

    #[test]
    fn full_file_is_read() {
        let config: RelayConfig = r#"
            [server]
            bind = "127.0.0.1:9000"

            [github]
            api_base = "https://github.example.com/api/v3"
            retry_attempts = 5

            [jenkins]
            default_endpoint = "https://ci.example.com"
            retry_attempts = 2

            [[jenkins.instances]]
            url = "https://ci.example.com"
            user = "relay"
            token_env = "CI_TOKEN"

            [[jenkins.instances]]
            url = "https://nightly.example.com"
            user = "nightly"
            token_env = "NIGHTLY_TOKEN"

            [dispatch]
            comment_prefix = "bot"
            resync_label = "sync"
            resync_labels_label = "sync-labels"
            max_concurrent_triggers = 2
            label_opened_pull_requests = true

            [registry]
            path = "/var/lib/relay/registry.json"

            [telemetry]
            log_format = "json"
            otlp_endpoint = "http://collector:4317"
        "#
        .parse()
        .unwrap();

        let settings = config.dispatch_settings().unwrap();
        assert_eq!(settings.commands.prefix, "bot");
        assert_eq!(settings.commands.resync_labels_label, "sync-labels");
        assert_eq!(settings.max_concurrent_triggers, 2);
        assert!(settings.label_opened_pull_requests);
        assert_eq!(settings.comment_endpoint.as_str(), "https://ci.example.com");
        assert_eq!(config.github_backoff().max_attempts, 5);
        assert_eq!(config.jenkins_backoff().max_attempts, 2);
        assert_eq!(config.telemetry.log_format, LogFormat::Json);
        assert_eq!(config.registry.path, PathBuf::from("/var/lib/relay/registry.json"));
    }

    #[test]
    fn default_endpoint_must_be_a_configured_instance() {
        let text = MINIMAL.replace(
            "default_endpoint = \"https://ci.example.com/\"",
            "default_endpoint = \"https://elsewhere.example.com\"",
        );
        let err = text.parse::<RelayConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let text = format!("{MINIMAL}\n[dispatch]\nmax_concurrent_triggers = 0\n");
        assert!(matches!(
            text.parse::<RelayConfig>(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn empty_marker_labels_are_rejected() {
        let text = format!("{MINIMAL}\n[dispatch]\nresync_label = \" \"\n");
        assert!(matches!(
            text.parse::<RelayConfig>(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn inline_secrets_are_not_accepted() {
        let text = MINIMAL.replace("token_env = \"RELAY_JENKINS_TOKEN\"", "token = \"plaintext\"");
        assert!(matches!(
            text.parse::<RelayConfig>(),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn jenkins_tokens_come_from_the_environment() {
        let config: RelayConfig = MINIMAL.parse().unwrap();

        let instances = config
            .jenkins_instances(|var| (var == "RELAY_JENKINS_TOKEN").then(|| "s3cret".to_string()))
            .unwrap();
        assert_eq!(instances[0].api_token, "s3cret");

        let err = config.jenkins_instances(|_| None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingToken { .. }));
    }

    #[test]
    fn load_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = RelayConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = RelayConfig::load(&path).unwrap();
        assert_eq!(config.jenkins.instances.len(), 1);
    }
}
