use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::certs;
use crate::operation::CreateOperation;
use crate::platform::{AuthorizedDomain, Certificate, CertificateHost, DomainMapping};
use crate::policy::ExpiryPolicy;
use crate::store::OperationStore;

/// Token the challenge route answers with 418, to prove it is routed here.
pub const SELF_TEST_TOKEN: &str = "self-test";

/// Platform certificate as shown in the status view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertInfo {
    pub name: String,
    pub id: String,
    pub display_name: String,
    pub domain_names: Vec<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expiry: Option<OffsetDateTime>,
    pub issuer: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub issued: Option<OffsetDateTime>,
}

impl From<&Certificate> for CertInfo {
    fn from(cert: &Certificate) -> Self {
        let summary = cert.public_certificate().and_then(|pem| {
            let leaf = certs::parse_pem_chain(pem).ok()?.into_iter().next()?;
            match certs::summarize(&leaf) {
                Ok(summary) => Some(summary),
                Err(err) => {
                    debug!("Could not parse certificate {}: {:#}", cert.id, err);
                    None
                }
            }
        });
        Self {
            name: cert.name.clone(),
            id: cert.id.clone(),
            display_name: cert.display_name.clone(),
            domain_names: cert.domain_names.clone(),
            expiry: cert
                .expire_time
                .or_else(|| summary.as_ref().map(|s| s.not_after)),
            issuer: summary.as_ref().and_then(|s| s.issuer_common_name.clone()),
            issued: summary.map(|s| s.not_before),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainStatus {
    pub name: String,
    pub certificate_id: Option<String>,
    /// Absent when the mapping names a certificate the platform did not list.
    pub certificate: Option<CertInfo>,
    /// Most recent operation for this hostname.
    pub operation: Option<CreateOperation>,
    pub ongoing: bool,
    pub is_authorized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub domains: Vec<DomainStatus>,
    /// Certificates no mapping refers to, sorted by ID.
    pub unused_certificates: Vec<CertInfo>,
    /// Unexpired operations that have not mapped a certificate yet, oldest first.
    pub pending: Vec<CreateOperation>,
    pub any_ongoing: bool,
    pub any_not_authorized: bool,
    /// Whether the challenge route answered the self-test; `None` when not run.
    pub self_test: Option<bool>,
}

/// Fetches platform and local state concurrently and joins them.
///
/// # Errors
/// Fails if any of the fetches fails.
pub async fn collect_status(
    host: &dyn CertificateHost,
    operations: &dyn OperationStore,
    expiry: ExpiryPolicy,
    now: OffsetDateTime,
) -> Result<StatusReport> {
    let (certificates, mappings, authorized, records, active) = tokio::try_join!(
        host.list_certificates(),
        host.list_domain_mappings(),
        host.list_authorized_domains(),
        async { operations.list_all().await.map_err(anyhow::Error::from) },
        async { operations.list_active().await.map_err(anyhow::Error::from) },
    )?;
    let mut report = reconcile(
        &certificates,
        &mappings,
        &authorized,
        &records,
        expiry,
        now,
    );
    report.pending = active
        .into_iter()
        .filter(|op| !expiry.is_expired(op, now))
        .collect();
    Ok(report)
}

/// Joins mappings to certificates by ID and to operations by hostname.
#[must_use]
pub fn reconcile(
    certificates: &[Certificate],
    mappings: &[DomainMapping],
    authorized: &[AuthorizedDomain],
    operations: &[CreateOperation],
    expiry: ExpiryPolicy,
    now: OffsetDateTime,
) -> StatusReport {
    let by_id: HashMap<&str, &Certificate> =
        certificates.iter().map(|c| (c.id.as_str(), c)).collect();

    let mut latest: HashMap<&str, &CreateOperation> = HashMap::new();
    for op in operations.iter().filter(|op| !expiry.is_expired(op, now)) {
        let entry = latest.entry(op.hostname.as_str()).or_insert(op);
        if op.accepted > entry.accepted {
            *entry = op;
        }
    }

    let authorized: Vec<&str> = authorized.iter().map(|d| d.id.as_str()).collect();
    let mut referenced = HashSet::new();
    let domains: Vec<DomainStatus> = mappings
        .iter()
        .map(|mapping| {
            let certificate_id = mapping.certificate_id();
            if let Some(id) = certificate_id {
                referenced.insert(id);
            }
            let operation = latest.get(mapping.id.as_str()).copied();
            DomainStatus {
                name: mapping.id.clone(),
                certificate_id: certificate_id.map(ToString::to_string),
                certificate: certificate_id
                    .and_then(|id| by_id.get(id))
                    .map(|cert| CertInfo::from(*cert)),
                operation: operation.cloned(),
                ongoing: operation.is_some_and(|op| expiry.is_ongoing(op, now)),
                is_authorized: is_authorized_subdomain(&mapping.id, &authorized),
            }
        })
        .collect();

    let mut unused: Vec<CertInfo> = certificates
        .iter()
        .filter(|cert| !referenced.contains(cert.id.as_str()))
        .map(CertInfo::from)
        .collect();
    unused.sort_by(|a, b| a.id.cmp(&b.id));

    StatusReport {
        any_ongoing: domains.iter().any(|d| d.ongoing),
        any_not_authorized: domains.iter().any(|d| !d.is_authorized),
        domains,
        unused_certificates: unused,
        pending: Vec::new(),
        self_test: None,
    }
}

/// True if `domain` or one of its parent domains is authorized.
#[must_use]
pub fn is_authorized_subdomain(domain: &str, authorized: &[&str]) -> bool {
    let domain = domain.trim_end_matches('.');
    let mut candidate = domain;
    loop {
        if authorized.iter().any(|a| a.eq_ignore_ascii_case(candidate)) {
            return true;
        }
        match candidate.split_once('.') {
            Some((_, parent)) if !parent.is_empty() => candidate = parent,
            _ => return false,
        }
    }
}

/// Checks that `<base_url>/.well-known/acme-challenge/self-test` reaches this service.
pub async fn self_test(client: &reqwest::Client, base_url: &str, timeout: Duration) -> bool {
    let url = format!(
        "{}/.well-known/acme-challenge/{SELF_TEST_TOKEN}",
        base_url.trim_end_matches('/')
    );
    match client.get(&url).timeout(timeout).send().await {
        Ok(response) if response.status() == reqwest::StatusCode::IM_A_TEAPOT => true,
        Ok(response) => {
            warn!("Self-test at {} answered {}", url, response.status());
            false
        }
        Err(err) => {
            warn!("Self-test at {} failed: {}", url, err);
            false
        }
    }
}

impl StatusReport {
    /// Plain-text rendering for the command line.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Domains:");
        if self.domains.is_empty() {
            let _ = writeln!(out, "  (none)");
        }
        for domain in &self.domains {
            let _ = write!(out, "  {}", domain.name);
            if !domain.is_authorized {
                let _ = write!(out, " [not authorized]");
            }
            let _ = writeln!(out);
            match (&domain.certificate_id, &domain.certificate) {
                (Some(_), Some(cert)) => {
                    let _ = writeln!(out, "    certificate: {}", describe(cert));
                }
                (Some(id), None) => {
                    let _ = writeln!(out, "    certificate: {id} (not found)");
                }
                (None, _) => {
                    let _ = writeln!(out, "    certificate: none");
                }
            }
            if let Some(op) = &domain.operation {
                let state = if domain.ongoing {
                    "in progress"
                } else if op.is_mapped() {
                    "done"
                } else {
                    "stalled"
                };
                let _ = writeln!(out, "    operation: {} at stage {} ({state})", op.token, op.stage);
                if let Some(error) = &op.error {
                    let _ = writeln!(out, "    last error: {error}");
                }
            }
        }

        if !self.unused_certificates.is_empty() {
            let _ = writeln!(out, "Unused certificates:");
            for cert in &self.unused_certificates {
                let _ = writeln!(out, "  {}", describe(cert));
            }
        }
        if !self.pending.is_empty() {
            let _ = writeln!(out, "Pending operations:");
            for op in &self.pending {
                let _ = writeln!(
                    out,
                    "  {} for {} at stage {}, accepted {}",
                    op.token, op.hostname, op.stage, op.accepted
                );
            }
        }
        if let Some(passed) = self.self_test {
            let _ = writeln!(
                out,
                "Self-test: {}",
                if passed { "passed" } else { "failed" }
            );
        }
        out
    }
}

fn describe(cert: &CertInfo) -> String {
    let expiry = cert
        .expiry
        .map_or_else(|| "unknown".to_string(), |e| e.date().to_string());
    format!("{} {} (expires {expiry})", cert.id, cert.display_name)
}
