use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;

use super::{AcmeSettings, OAuthSettings, Settings, WorkflowSettings};

/// Longest accepted expiry, renewal or validity window.
const MAX_WINDOW: Duration = Duration::from_secs(10 * 366 * 24 * 60 * 60);

pub(crate) fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.server.trim().is_empty() {
        anyhow::bail!("server must not be empty");
    }
    if settings.email.trim().is_empty() {
        anyhow::bail!("email must not be empty");
    }
    settings
        .listen_addr
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("listen_addr invalid: {e}"))?;
    if settings.store_path.as_os_str().is_empty() {
        anyhow::bail!("store_path must not be empty");
    }
    validate_acme(&settings.acme)?;
    if settings.platform.api_url.trim().is_empty() {
        anyhow::bail!("platform.api_url must not be empty");
    }
    if settings.platform.project.trim().is_empty() {
        anyhow::bail!("platform.project must not be empty");
    }
    if settings.platform.timeout_secs == 0 {
        anyhow::bail!("platform.timeout_secs must be greater than 0");
    }
    validate_workflow(&settings.workflow)?;
    if settings.admin.token.trim().is_empty() {
        anyhow::bail!("admin.token must not be empty");
    }
    if let Some(oauth) = &settings.oauth {
        validate_oauth(oauth)?;
    }
    if settings.self_test.timeout_secs == 0 {
        anyhow::bail!("self_test.timeout_secs must be greater than 0");
    }
    Ok(())
}

fn validate_acme(acme: &AcmeSettings) -> Result<()> {
    if acme.directory_fetch_attempts == 0 {
        anyhow::bail!("acme.directory_fetch_attempts must be greater than 0");
    }
    if acme.poll_attempts == 0 {
        anyhow::bail!("acme.poll_attempts must be greater than 0");
    }
    if acme.poll_interval_secs == 0 {
        anyhow::bail!("acme.poll_interval_secs must be greater than 0");
    }
    if acme.directory_fetch_base_delay_secs > acme.directory_fetch_max_delay_secs {
        anyhow::bail!(
            "acme.directory_fetch_base_delay_secs must be <= acme.directory_fetch_max_delay_secs"
        );
    }
    if acme.certificate_validity.is_some_and(|v| v.is_zero()) {
        anyhow::bail!("acme.certificate_validity must be greater than 0");
    }
    if acme.certificate_validity.is_some_and(|v| v > MAX_WINDOW) {
        anyhow::bail!("acme.certificate_validity must be at most 10 years");
    }
    Ok(())
}

fn validate_workflow(workflow: &WorkflowSettings) -> Result<()> {
    if workflow.retry_ceiling == 0 {
        anyhow::bail!("workflow.retry_ceiling must be greater than 0");
    }
    if workflow.min_backoff_secs == 0 {
        anyhow::bail!("workflow.min_backoff_secs must be greater than 0");
    }
    if workflow.min_backoff_secs > workflow.max_backoff_secs {
        anyhow::bail!("workflow.min_backoff_secs must be <= workflow.max_backoff_secs");
    }
    if workflow.soft_expiry.is_zero() {
        anyhow::bail!("workflow.soft_expiry must be greater than 0");
    }
    if workflow.soft_expiry > workflow.hard_expiry {
        anyhow::bail!("workflow.soft_expiry must be <= workflow.hard_expiry");
    }
    if workflow.hard_expiry > MAX_WINDOW {
        anyhow::bail!("workflow.hard_expiry must be at most 10 years");
    }
    if !(0.0..=1.0).contains(&workflow.cleanup_probability) {
        anyhow::bail!("workflow.cleanup_probability must be between 0 and 1");
    }
    if workflow.renew_before.is_zero() {
        anyhow::bail!("workflow.renew_before must be greater than 0");
    }
    if workflow.renew_before > MAX_WINDOW {
        anyhow::bail!("workflow.renew_before must be at most 10 years");
    }
    Ok(())
}

fn validate_oauth(oauth: &OAuthSettings) -> Result<()> {
    for (label, value) in [
        ("oauth.client_id", &oauth.client_id),
        ("oauth.client_secret", &oauth.client_secret),
        ("oauth.auth_url", &oauth.auth_url),
        ("oauth.token_url", &oauth.token_url),
        ("oauth.redirect_url", &oauth.redirect_url),
    ] {
        if value.trim().is_empty() {
            anyhow::bail!("{label} must not be empty");
        }
    }
    Ok(())
}
