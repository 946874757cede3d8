use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::certs;
use crate::platform::CertificateHost;

/// An existing certificate to install once, outside the ACME workflow.
#[derive(Clone)]
pub struct UploadRequest {
    pub chain_pem: String,
    pub key_pem: String,
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub certificate_id: String,
    pub display_name: String,
    pub mapped: Vec<String>,
    pub failed: Vec<String>,
}

/// Names the upload `cert-MM-YYYY` after the expiry of the first certificate
/// in the chain that covers one of `domains`.
///
/// # Errors
/// Returns error if the chain cannot be parsed or covers none of `domains`.
pub fn display_name_for(chain_pem: &str, domains: &[String]) -> Result<String> {
    for der in certs::parse_pem_chain(chain_pem)? {
        let summary = certs::summarize(&der)?;
        let covers = summary
            .dns_names
            .iter()
            .any(|name| domains.iter().any(|d| d.eq_ignore_ascii_case(name)));
        if covers {
            let expiry = summary.not_after;
            return Ok(format!(
                "cert-{:02}-{}",
                u8::from(expiry.month()),
                expiry.year()
            ));
        }
    }
    anyhow::bail!(
        "No certificate in the chain covers any of: {}",
        domains.join(", ")
    )
}

/// Uploads the certificate once, then maps each domain to it.
///
/// # Errors
/// Returns error if naming or the upload fails. Mapping failures are logged
/// and reported in the summary.
pub async fn upload_and_map(
    host: &dyn CertificateHost,
    request: &UploadRequest,
) -> Result<UploadSummary> {
    if request.domains.is_empty() {
        anyhow::bail!("At least one domain is required");
    }
    let display_name = display_name_for(&request.chain_pem, &request.domains)?;
    let certificate_id = host
        .create_certificate(&request.chain_pem, &request.key_pem, &display_name)
        .await
        .context("Certificate upload failed")?;
    info!("Uploaded {} as certificate {}", display_name, certificate_id);

    let mut mapped = Vec::new();
    let mut failed = Vec::new();
    for domain in &request.domains {
        match host.patch_domain_mapping(domain, &certificate_id).await {
            Ok(()) => mapped.push(domain.clone()),
            Err(err) => {
                warn!("Failed to map {} to {}: {:#}", domain, certificate_id, err);
                failed.push(domain.clone());
            }
        }
    }
    Ok(UploadSummary {
        certificate_id,
        display_name,
        mapped,
        failed,
    })
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::certs::test_support::self_signed;

    #[test]
    fn test_display_name_uses_matching_certificate_expiry() {
        let (intermediate, _) = self_signed(
            "Example CA",
            &["ca.example.net"],
            datetime!(2031-12-01 00:00 UTC),
        );
        let (leaf, _) = self_signed(
            "www.example.com",
            &["www.example.com"],
            datetime!(2030-03-15 00:00 UTC),
        );
        let chain = format!("{intermediate}{leaf}");

        let name = display_name_for(&chain, &["WWW.example.com".to_string()]).unwrap();
        assert_eq!(name, "cert-03-2030");
    }

    #[test]
    fn test_display_name_requires_a_covered_domain() {
        let (leaf, _) = self_signed(
            "www.example.com",
            &["www.example.com"],
            datetime!(2030-03-15 00:00 UTC),
        );
        let err = display_name_for(&leaf, &["other.example.com".to_string()]).unwrap_err();
        assert!(err.to_string().contains("other.example.com"));
    }
}
