use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub mod account;
pub mod client;
pub mod types;

pub use account::{AccountAuthority, RegisteredAccount};
pub use client::AcmeClient;

use crate::acme::types::{Authorization, Challenge};

/// Certificate returned by the CA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// DER certificates, leaf first.
    pub chain: Vec<Vec<u8>>,
    /// URL the chain was downloaded from.
    pub location: String,
}

/// What the workflow needs from an ACME certificate authority.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Loads the CA account, creating and registering it on first use.
    async fn ensure_account(&self) -> Result<()>;

    /// Starts authorization of `hostname`; the result carries its URL.
    async fn authorize(&self, hostname: &str) -> Result<Authorization>;

    /// Asks the CA to validate the challenge.
    async fn accept(&self, challenge: &Challenge) -> Result<Challenge>;

    async fn challenge(&self, url: &str) -> Result<Challenge>;

    /// Body the HTTP-01 validator expects at the well-known path for `token`.
    async fn http01_response(&self, token: &str) -> Result<String>;

    async fn issue_certificate(
        &self,
        hostname: &str,
        csr_der: &[u8],
        validity: Option<Duration>,
    ) -> Result<IssuedCertificate>;
}
