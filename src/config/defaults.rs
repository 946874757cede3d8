use config::{ConfigBuilder, ConfigError, builder::DefaultState};

const DEFAULT_SERVER: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
const DEFAULT_EMAIL: &str = "admin@example.com";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_STORE_PATH: &str = "certpilot-store.json";
const DEFAULT_DIRECTORY_FETCH_ATTEMPTS: u64 = 10;
const DEFAULT_DIRECTORY_FETCH_BASE_DELAY_SECS: u64 = 1;
const DEFAULT_DIRECTORY_FETCH_MAX_DELAY_SECS: u64 = 10;
const DEFAULT_POLL_ATTEMPTS: u64 = 15;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
const DEFAULT_PLATFORM_API_URL: &str = "https://appengine.googleapis.com";
const DEFAULT_PLATFORM_PROJECT: &str = "";
const DEFAULT_PLATFORM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRY_CEILING: u32 = 10;
const DEFAULT_MIN_BACKOFF_SECS: u64 = 5;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 30;
const DEFAULT_RESPOND_DELAY_SECS: u64 = 5;
const DEFAULT_SOFT_EXPIRY: &str = "1m";
const DEFAULT_HARD_EXPIRY: &str = "24h";
const DEFAULT_CLEANUP_PROBABILITY: f64 = 0.2;
const DEFAULT_RENEW_BEFORE: &str = "720h";
const DEFAULT_ADMIN_TOKEN: &str = "";
const DEFAULT_SELF_TEST_TIMEOUT_SECS: u64 = 30;

pub(crate) fn apply_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("server", DEFAULT_SERVER)?
        .set_default("email", DEFAULT_EMAIL)?
        .set_default("listen_addr", DEFAULT_LISTEN_ADDR)?
        .set_default("store_path", DEFAULT_STORE_PATH)?
        .set_default(
            "acme.directory_fetch_attempts",
            DEFAULT_DIRECTORY_FETCH_ATTEMPTS,
        )?
        .set_default(
            "acme.directory_fetch_base_delay_secs",
            DEFAULT_DIRECTORY_FETCH_BASE_DELAY_SECS,
        )?
        .set_default(
            "acme.directory_fetch_max_delay_secs",
            DEFAULT_DIRECTORY_FETCH_MAX_DELAY_SECS,
        )?
        .set_default("acme.poll_attempts", DEFAULT_POLL_ATTEMPTS)?
        .set_default("acme.poll_interval_secs", DEFAULT_POLL_INTERVAL_SECS)?
        .set_default("platform.api_url", DEFAULT_PLATFORM_API_URL)?
        .set_default("platform.project", DEFAULT_PLATFORM_PROJECT)?
        .set_default("platform.timeout_secs", DEFAULT_PLATFORM_TIMEOUT_SECS)?
        .set_default("workflow.retry_ceiling", DEFAULT_RETRY_CEILING)?
        .set_default("workflow.min_backoff_secs", DEFAULT_MIN_BACKOFF_SECS)?
        .set_default("workflow.max_backoff_secs", DEFAULT_MAX_BACKOFF_SECS)?
        .set_default("workflow.respond_delay_secs", DEFAULT_RESPOND_DELAY_SECS)?
        .set_default("workflow.soft_expiry", DEFAULT_SOFT_EXPIRY)?
        .set_default("workflow.hard_expiry", DEFAULT_HARD_EXPIRY)?
        .set_default("workflow.cleanup_probability", DEFAULT_CLEANUP_PROBABILITY)?
        .set_default("workflow.renew_before", DEFAULT_RENEW_BEFORE)?
        .set_default("admin.token", DEFAULT_ADMIN_TOKEN)?
        .set_default("self_test.timeout_secs", DEFAULT_SELF_TEST_TIMEOUT_SECS)
}
