// Helper functions are shared across multiple test crates; not every helper is
// referenced in each test module.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use certpilot::acme::types::{
    Authorization, AuthorizationStatus, Challenge, ChallengeStatus, ChallengeType, Problem,
};
use certpilot::acme::{CertificateAuthority, IssuedCertificate};
use certpilot::platform::{
    AuthorizedDomain, Certificate, CertificateHost, CertificateRawData, DomainMapping, SslSettings,
};
use certpilot::policy::RetryPolicy;
use certpilot::task::{Enqueue, TaskQueue};
use certpilot::workflow::WorkflowOptions;
use rcgen::{CertificateParams, DnType, KeyPair};
use time::OffsetDateTime;

pub(crate) const TOKEN: &str = "abc123";
pub(crate) const RESPONSE: &str = "xyz";
pub(crate) const CHALLENGE_URL: &str = "https://ca.test/chall/1";

pub(crate) fn options(retry_ceiling: u32) -> WorkflowOptions {
    WorkflowOptions {
        retry: RetryPolicy {
            retry_ceiling,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
        },
        respond_delay: Duration::from_secs(2),
        certificate_validity: None,
    }
}

/// Self-signed PEM certificate for `common_name`, valid until `not_after`.
pub(crate) fn cert_pem(common_name: &str, not_after: OffsetDateTime) -> String {
    let mut params = CertificateParams::new(vec![common_name.to_string()]).expect("params");
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.not_before = not_after - time::Duration::days(90);
    params.not_after = not_after;
    let key = KeyPair::generate().expect("key");
    params.self_signed(&key).expect("self-signed").pem()
}

/// CA double with a scripted challenge status sequence.
///
/// `challenge` pops the next scripted status; the last one repeats.
pub(crate) struct FakeAuthority {
    initial: ChallengeStatus,
    statuses: Mutex<VecDeque<ChallengeStatus>>,
    error: Option<Problem>,
    pub accepted: AtomicUsize,
    pub checks: AtomicUsize,
    pub issued: AtomicUsize,
}

impl FakeAuthority {
    pub(crate) fn new(initial: ChallengeStatus, statuses: &[ChallengeStatus]) -> Self {
        Self {
            initial,
            statuses: Mutex::new(statuses.iter().copied().collect()),
            error: None,
            accepted: AtomicUsize::new(0),
            checks: AtomicUsize::new(0),
            issued: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_error(mut self, detail: &str) -> Self {
        self.error = Some(Problem {
            r#type: Some("urn:ietf:params:acme:error:connection".to_string()),
            detail: Some(detail.to_string()),
            status: Some(400),
        });
        self
    }

    fn challenge_with(&self, status: ChallengeStatus) -> Challenge {
        Challenge {
            r#type: ChallengeType::Http01,
            url: CHALLENGE_URL.to_string(),
            token: TOKEN.to_string(),
            status,
            error: (status == ChallengeStatus::Invalid)
                .then(|| self.error.clone())
                .flatten(),
        }
    }
}

#[async_trait]
impl CertificateAuthority for FakeAuthority {
    async fn ensure_account(&self) -> Result<()> {
        Ok(())
    }

    async fn authorize(&self, hostname: &str) -> Result<Authorization> {
        Ok(Authorization {
            status: AuthorizationStatus::Pending,
            identifier: Some(certpilot::acme::types::Identifier {
                r#type: "dns".to_string(),
                value: hostname.to_string(),
            }),
            challenges: vec![self.challenge_with(self.initial)],
            url: "https://ca.test/authz/1".to_string(),
        })
    }

    async fn accept(&self, challenge: &Challenge) -> Result<Challenge> {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        let mut accepted = challenge.clone();
        accepted.status = ChallengeStatus::Processing;
        Ok(accepted)
    }

    async fn challenge(&self, url: &str) -> Result<Challenge> {
        assert_eq!(url, CHALLENGE_URL);
        self.checks.fetch_add(1, Ordering::SeqCst);
        let mut statuses = self.statuses.lock().expect("lock");
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().copied()
        };
        Ok(self.challenge_with(status.unwrap_or(self.initial)))
    }

    async fn http01_response(&self, token: &str) -> Result<String> {
        assert_eq!(token, TOKEN);
        Ok(RESPONSE.to_string())
    }

    async fn issue_certificate(
        &self,
        hostname: &str,
        _csr_der: &[u8],
        _validity: Option<Duration>,
    ) -> Result<IssuedCertificate> {
        self.issued.fetch_add(1, Ordering::SeqCst);
        let pem = cert_pem(hostname, OffsetDateTime::now_utc() + time::Duration::days(90));
        Ok(IssuedCertificate {
            chain: certpilot::certs::parse_pem_chain(&pem)?,
            location: "https://ca.test/cert/1".to_string(),
        })
    }
}

/// In-memory hosting platform.
#[derive(Default)]
pub(crate) struct FakeHost {
    pub certificates: Mutex<Vec<Certificate>>,
    pub mappings: Mutex<Vec<DomainMapping>>,
    pub authorized: Vec<AuthorizedDomain>,
    pub deleted: Mutex<Vec<String>>,
    /// Number of upcoming uploads that fail.
    pub failing_uploads: AtomicUsize,
    /// Domains whose mapping update always fails.
    pub unmappable: Vec<String>,
    pub uploads: AtomicUsize,
    pub patches: AtomicUsize,
}

impl FakeHost {
    pub(crate) fn with_domains(domains: &[&str]) -> Self {
        Self {
            mappings: Mutex::new(domains.iter().map(|d| mapping(d, None)).collect()),
            authorized: vec![AuthorizedDomain {
                name: "apps/test/authorizedDomains/example.com".to_string(),
                id: "example.com".to_string(),
            }],
            ..Self::default()
        }
    }

    pub(crate) fn add_certificate(&self, id: &str, pem: &str, expire_time: OffsetDateTime) {
        self.certificates.lock().expect("lock").push(Certificate {
            name: format!("apps/test/authorizedCertificates/{id}"),
            id: id.to_string(),
            display_name: format!("display-{id}"),
            domain_names: Vec::new(),
            expire_time: Some(expire_time),
            certificate_raw_data: Some(CertificateRawData {
                public_certificate: pem.to_string(),
                private_key: String::new(),
            }),
        });
    }

    pub(crate) fn certificate_of(&self, domain: &str) -> Option<String> {
        self.mappings
            .lock()
            .expect("lock")
            .iter()
            .find(|m| m.id == domain)
            .and_then(|m| m.certificate_id().map(ToString::to_string))
    }

    pub(crate) fn map(&self, domain: &str, certificate_id: &str) {
        let mut mappings = self.mappings.lock().expect("lock");
        mappings.retain(|m| m.id != domain);
        mappings.push(mapping(domain, Some(certificate_id)));
    }
}

pub(crate) fn mapping(domain: &str, certificate_id: Option<&str>) -> DomainMapping {
    DomainMapping {
        name: format!("apps/test/domainMappings/{domain}"),
        id: domain.to_string(),
        ssl_settings: certificate_id.map(|id| SslSettings {
            certificate_id: Some(id.to_string()),
            ssl_management_type: Some("MANUAL".to_string()),
        }),
    }
}

#[async_trait]
impl CertificateHost for FakeHost {
    async fn list_certificates(&self) -> Result<Vec<Certificate>> {
        Ok(self.certificates.lock().expect("lock").clone())
    }

    async fn list_domain_mappings(&self) -> Result<Vec<DomainMapping>> {
        Ok(self.mappings.lock().expect("lock").clone())
    }

    async fn list_authorized_domains(&self) -> Result<Vec<AuthorizedDomain>> {
        Ok(self.authorized.clone())
    }

    async fn create_certificate(
        &self,
        public_certificate: &str,
        private_key: &str,
        display_name: &str,
    ) -> Result<String> {
        let attempt = self.uploads.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_uploads.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_uploads.store(failing - 1, Ordering::SeqCst);
            anyhow::bail!("platform unavailable");
        }
        anyhow::ensure!(!private_key.is_empty(), "private key is required");
        let id = format!("{}", 1000 + attempt);
        self.certificates.lock().expect("lock").push(Certificate {
            name: format!("apps/test/authorizedCertificates/{id}"),
            id: id.clone(),
            display_name: display_name.to_string(),
            domain_names: Vec::new(),
            expire_time: None,
            certificate_raw_data: Some(CertificateRawData {
                public_certificate: public_certificate.to_string(),
                private_key: String::new(),
            }),
        });
        Ok(id)
    }

    async fn patch_domain_mapping(&self, domain: &str, certificate_id: &str) -> Result<()> {
        self.patches.fetch_add(1, Ordering::SeqCst);
        if self.unmappable.iter().any(|d| d == domain) {
            anyhow::bail!("Platform API error (404 Not Found): no mapping for {domain}");
        }
        self.map(domain, certificate_id);
        Ok(())
    }

    async fn delete_certificate(&self, certificate_id: &str) -> Result<()> {
        self.certificates
            .lock()
            .expect("lock")
            .retain(|c| c.id != certificate_id);
        self.deleted
            .lock()
            .expect("lock")
            .push(certificate_id.to_string());
        Ok(())
    }
}

/// Queue that only records what it is given.
#[derive(Default)]
pub(crate) struct RecordingQueue {
    pub requests: Mutex<Vec<Enqueue>>,
}

impl RecordingQueue {
    pub(crate) fn taken(&self) -> Vec<Enqueue> {
        std::mem::take(&mut *self.requests.lock().expect("lock"))
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, request: Enqueue) -> Result<()> {
        self.requests.lock().expect("lock").push(request);
        Ok(())
    }
}
