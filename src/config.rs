use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Deserializer};

use crate::policy::{ExpiryPolicy, RetryPolicy};

mod defaults;
mod validation;

const DEFAULT_CONFIG_FILE: &str = "certpilot.toml";
const ENV_PREFIX: &str = "CERTPILOT";

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// ACME directory URL.
    pub server: String,
    /// Contact address registered with the CA account.
    pub email: String,
    pub listen_addr: String,
    pub store_path: PathBuf,
    pub acme: AcmeSettings,
    pub platform: PlatformSettings,
    pub workflow: WorkflowSettings,
    pub admin: AdminSettings,
    #[serde(default)]
    pub oauth: Option<OAuthSettings>,
    pub self_test: SelfTestSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AcmeSettings {
    pub directory_fetch_attempts: u64,
    pub directory_fetch_base_delay_secs: u64,
    pub directory_fetch_max_delay_secs: u64,
    pub poll_attempts: u64,
    pub poll_interval_secs: u64,
    /// Requested certificate lifetime, sent as the order's `notAfter`.
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub certificate_validity: Option<Duration>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlatformSettings {
    pub api_url: String,
    pub project: String,
    #[serde(default)]
    pub access_token: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowSettings {
    /// Total attempts a deferred stage gets before it is marked finished.
    pub retry_ceiling: u32,
    pub min_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub respond_delay_secs: u64,
    #[serde(deserialize_with = "deserialize_duration")]
    pub soft_expiry: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub hard_expiry: Duration,
    pub cleanup_probability: f64,
    #[serde(deserialize_with = "deserialize_duration")]
    pub renew_before: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminSettings {
    pub token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_url: String,
    pub scope: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SelfTestSettings {
    #[serde(default)]
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Settings {
    /// Loads settings from defaults, an optional TOML file and the environment.
    ///
    /// # Errors
    /// Returns error if configuration parsing fails (e.g. invalid format or duration).
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let builder = defaults::apply_defaults(Config::builder())?;

        let path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let builder = builder
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .ignore_empty(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validates configuration values for correctness.
    ///
    /// # Errors
    /// Returns error if any setting is invalid or out of range.
    pub fn validate(&self) -> Result<()> {
        validation::validate_settings(self)
    }
}

impl WorkflowSettings {
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_ceiling: self.retry_ceiling,
            min_backoff: Duration::from_secs(self.min_backoff_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
        }
    }

    #[must_use]
    pub fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy {
            soft: self.soft_expiry,
            hard: self.hard_expiry,
        }
    }

    #[must_use]
    pub fn respond_delay(&self) -> Duration {
        Duration::from_secs(self.respond_delay_secs)
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn deserialize_optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw {
        Some(value) if !value.trim().is_empty() => humantime::parse_duration(&value)
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "{contents}").unwrap();
        file.flush().unwrap();
        file
    }

    fn valid_settings() -> Settings {
        let file = write_config(
            r#"
            [platform]
            project = "demo-app"
            [admin]
            token = "operator-secret"
        "#,
        );
        Settings::new(Some(file.path().to_path_buf())).unwrap()
    }

    #[test]
    fn test_load_settings_defaults() {
        let settings = Settings::new(Some(PathBuf::from("missing-certpilot.toml"))).unwrap();
        assert_eq!(
            settings.server,
            "https://acme-staging-v02.api.letsencrypt.org/directory"
        );
        assert_eq!(settings.listen_addr, "0.0.0.0:8080");
        assert_eq!(settings.acme.directory_fetch_attempts, 10);
        assert_eq!(settings.acme.poll_attempts, 15);
        assert!(settings.acme.certificate_validity.is_none());
        assert_eq!(settings.platform.api_url, "https://appengine.googleapis.com");
        assert_eq!(settings.workflow.retry_ceiling, 10);
        assert_eq!(settings.workflow.min_backoff_secs, 5);
        assert_eq!(settings.workflow.max_backoff_secs, 30);
        assert_eq!(settings.workflow.respond_delay_secs, 5);
        assert_eq!(settings.workflow.soft_expiry, Duration::from_secs(60));
        assert_eq!(settings.workflow.hard_expiry, Duration::from_secs(24 * 60 * 60));
        assert_eq!(
            settings.workflow.renew_before,
            Duration::from_secs(720 * 60 * 60)
        );
        assert!(settings.oauth.is_none());
        assert_eq!(settings.self_test.timeout_secs, 30);
    }

    #[test]
    fn test_load_settings_file_override() {
        let file = write_config(
            r#"
            email = "ops@example.com"
            server = "http://file-server/directory"
            [acme]
            certificate_validity = "2160h"
            [workflow]
            soft_expiry = "5m"
            retry_ceiling = 3
            [oauth]
            client_id = "client"
            client_secret = "secret"
            auth_url = "https://auth.example.com/authorize"
            token_url = "https://auth.example.com/token"
            redirect_url = "https://app.example.com/ssl-certificates/oauth-login"
            scope = "https://www.googleapis.com/auth/cloud-platform"
        "#,
        );

        let settings = Settings::new(Some(file.path().to_path_buf())).unwrap();

        assert_eq!(settings.email, "ops@example.com");
        assert_eq!(settings.server, "http://file-server/directory");
        assert_eq!(
            settings.acme.certificate_validity,
            Some(Duration::from_secs(2160 * 60 * 60))
        );
        assert_eq!(settings.workflow.soft_expiry, Duration::from_secs(300));
        assert_eq!(settings.workflow.retry_ceiling, 3);
        assert_eq!(settings.oauth.unwrap().client_id, "client");
    }

    #[test]
    fn test_invalid_duration_is_rejected() {
        let file = write_config(
            r#"
            [workflow]
            hard_expiry = "tomorrow"
        "#,
        );
        assert!(Settings::new(Some(file.path().to_path_buf())).is_err());
    }

    #[test]
    fn test_validate_accepts_complete_settings() {
        valid_settings().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_admin_token() {
        let mut settings = valid_settings();
        settings.admin.token = "  ".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("admin.token"));
    }

    #[test]
    fn test_validate_rejects_zero_retry_ceiling() {
        let mut settings = valid_settings();
        settings.workflow.retry_ceiling = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("workflow.retry_ceiling"));
    }

    #[test]
    fn test_validate_rejects_inverted_expiry() {
        let mut settings = valid_settings();
        settings.workflow.soft_expiry = Duration::from_secs(48 * 60 * 60);
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("workflow.soft_expiry"));
    }

    #[test]
    fn test_validate_rejects_oversized_windows() {
        let file = write_config(
            r#"
            [platform]
            project = "demo-app"
            [admin]
            token = "operator-secret"
            [workflow]
            renew_before = "100000y"
        "#,
        );
        let settings = Settings::new(Some(file.path().to_path_buf())).unwrap();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("workflow.renew_before"));

        let mut settings = valid_settings();
        settings.workflow.hard_expiry = Duration::MAX;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("workflow.hard_expiry"));

        let mut settings = valid_settings();
        settings.acme.certificate_validity = Some(Duration::from_secs(20 * 366 * 24 * 60 * 60));
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("acme.certificate_validity"));
    }

    #[test]
    fn test_validate_rejects_probability_out_of_range() {
        let mut settings = valid_settings();
        settings.workflow.cleanup_probability = 1.5;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("workflow.cleanup_probability"));
    }

    #[test]
    fn test_workflow_policies_follow_settings() {
        let settings = valid_settings();
        let retry = settings.workflow.retry_policy();
        assert_eq!(retry.retry_ceiling, 10);
        assert_eq!(retry.min_backoff, Duration::from_secs(5));
        let expiry = settings.workflow.expiry_policy();
        assert_eq!(expiry.soft, Duration::from_secs(60));
    }
}
