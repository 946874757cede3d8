use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::certs;
use crate::operation::window_end;
use crate::platform::{Certificate, CertificateHost, DomainMapping};
use crate::task::{Enqueue, Task, TaskQueue};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RenewalSummary {
    pub scheduled: Vec<String>,
    pub failed: Vec<String>,
}

/// Expiry of a platform certificate, falling back to the stored PEM.
fn expiry_of(cert: &Certificate) -> Option<OffsetDateTime> {
    if let Some(expire_time) = cert.expire_time {
        return Some(expire_time);
    }
    let leaf = certs::parse_pem_chain(cert.public_certificate()?)
        .ok()?
        .into_iter()
        .next()?;
    certs::summarize(&leaf).ok().map(|summary| summary.not_after)
}

/// Hostnames whose mapped certificate expires within `renew_before` of `now`.
#[must_use]
pub fn find_due(
    certificates: &[Certificate],
    mappings: &[DomainMapping],
    now: OffsetDateTime,
    renew_before: Duration,
) -> Vec<String> {
    let by_id: HashMap<&str, &Certificate> =
        certificates.iter().map(|c| (c.id.as_str(), c)).collect();
    let mut due = Vec::new();
    for mapping in mappings {
        let Some(certificate_id) = mapping.certificate_id() else {
            continue;
        };
        let Some(cert) = by_id.get(certificate_id) else {
            warn!(
                "Domain {} refers to unknown certificate {}, skipping renewal",
                mapping.id, certificate_id
            );
            continue;
        };
        let Some(expiry) = expiry_of(cert) else {
            warn!(
                "Certificate {} for {} has no readable expiry, skipping renewal",
                certificate_id, mapping.id
            );
            continue;
        };
        if window_end(now, renew_before).is_none_or(|cutoff| expiry <= cutoff) {
            info!(
                "Certificate {} for {} expires {}, renewing",
                certificate_id, mapping.id, expiry
            );
            due.push(mapping.id.clone());
        }
    }
    due
}

/// Queues a create task for every mapped domain whose certificate is due.
///
/// # Errors
/// Returns error if the platform listings fail. Per-domain queueing failures
/// are reported in the summary instead.
pub async fn schedule_renewals(
    host: &dyn CertificateHost,
    queue: &dyn TaskQueue,
    now: OffsetDateTime,
    renew_before: Duration,
) -> Result<RenewalSummary> {
    let (certificates, mappings) =
        tokio::try_join!(host.list_certificates(), host.list_domain_mappings())
            .context("Failed to list platform certificates")?;

    let mut summary = RenewalSummary::default();
    for hostname in find_due(&certificates, &mappings, now, renew_before) {
        let task = Task::Create {
            hostname: hostname.clone(),
        };
        match queue.enqueue(Enqueue::now(task)).await {
            Ok(()) => summary.scheduled.push(hostname),
            Err(err) => {
                warn!("Failed to schedule renewal of {}: {:#}", hostname, err);
                summary.failed.push(hostname);
            }
        }
    }
    Ok(summary)
}
