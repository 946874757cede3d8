use anyhow::Context;
use rcgen::{CertificateParams, DnType, KeyPair, SanType};
use time::OffsetDateTime;
use tracing::info;

use super::Workflow;
use crate::acme::types::ChallengeStatus;
use crate::certs;
use crate::operation::{CreateOperation, Stage};
use crate::policy::{StageError, StageOutcome};
use crate::task::{CertificateBundle, Enqueue, Task};

impl Workflow {
    /// Checks the challenge and, once valid, obtains a certificate for a new key.
    pub(super) async fn issue(
        &self,
        operation: &mut CreateOperation,
    ) -> Result<StageOutcome, StageError> {
        if operation.has_reached(Stage::Issued) {
            return Ok(StageOutcome::AlreadyDone);
        }

        let challenge = self
            .authority
            .challenge(&operation.challenge_uri)
            .await
            .context("Failed to query challenge status")?;
        match challenge.status {
            ChallengeStatus::Pending | ChallengeStatus::Processing => {
                return Err(StageError::Retryable(anyhow::anyhow!(
                    "challenge for {} still pending, will retry later",
                    operation.hostname
                )));
            }
            ChallengeStatus::Invalid => {
                let reason = challenge
                    .error
                    .map_or_else(|| "challenge invalid".to_string(), |e| e.to_string());
                return Err(StageError::Rejected(reason));
            }
            ChallengeStatus::Valid => {}
        }

        let hostname = operation.hostname.clone();
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, hostname.clone());
        params.subject_alt_names = vec![SanType::DnsName(
            hostname
                .clone()
                .try_into()
                .context("Hostname is not a valid DNS name")?,
        )];
        let key = KeyPair::generate().context("Failed to generate certificate key")?;
        let csr = params
            .serialize_request(&key)
            .context("Failed to build CSR")?;

        let issued = self
            .authority
            .issue_certificate(&hostname, csr.der(), self.options.certificate_validity)
            .await
            .context("Certificate issuance failed")?;
        if issued.chain.is_empty() {
            return Err(StageError::Retryable(anyhow::anyhow!(
                "CA returned an empty certificate chain for {hostname}"
            )));
        }

        operation.advance(Stage::Issued, OffsetDateTime::now_utc())?;
        info!("Issued certificate for {} from {}", hostname, issued.location);
        Ok(StageOutcome::Advance(Enqueue::now(Task::Upload {
            token: operation.token.clone(),
            bundle: CertificateBundle {
                private_key_der: key.serialize_der(),
                chain: issued.chain,
            },
        })))
    }

    /// Stores the issued key and chain on the hosting platform.
    pub(super) async fn upload(
        &self,
        operation: &mut CreateOperation,
        bundle: CertificateBundle,
    ) -> Result<StageOutcome, StageError> {
        if operation.has_reached(Stage::Uploaded) {
            return Ok(StageOutcome::AlreadyDone);
        }

        let leaf = bundle
            .chain
            .first()
            .context("Certificate chain is empty")?;
        let summary = certs::summarize(leaf)?;
        let common_name = summary
            .common_name
            .unwrap_or_else(|| operation.hostname.clone());
        let display_name = certs::display_name(&common_name, &summary.serial_hex);

        let public_certificate = certs::encode_chain(&bundle.chain);
        let private_key = certs::encode_private_key(&bundle.private_key_der);
        let certificate_id = self
            .host
            .create_certificate(&public_certificate, &private_key, &display_name)
            .await
            .context("Certificate upload failed")?;

        operation.advance(Stage::Uploaded, OffsetDateTime::now_utc())?;
        Ok(StageOutcome::Advance(Enqueue::now(Task::Map {
            token: operation.token.clone(),
            certificate_id,
            common_name,
        })))
    }

    /// Points the hostname's domain mapping at the uploaded certificate.
    pub(super) async fn map(
        &self,
        operation: &mut CreateOperation,
        certificate_id: &str,
        common_name: &str,
    ) -> Result<StageOutcome, StageError> {
        if operation.has_reached(Stage::Mapped) {
            return Ok(StageOutcome::AlreadyDone);
        }

        self.host
            .patch_domain_mapping(&operation.hostname, certificate_id)
            .await
            .context("Domain mapping update failed")?;

        operation.complete_mapping(certificate_id, OffsetDateTime::now_utc())?;
        info!(
            "Mapped {} to certificate {} ({})",
            operation.hostname, certificate_id, common_name
        );
        Ok(StageOutcome::Finished)
    }
}
