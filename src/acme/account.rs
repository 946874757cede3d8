use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::info;

use crate::acme::client::AcmeClient;
use crate::acme::types::{Authorization, Challenge, OrderStatus};
use crate::acme::{CertificateAuthority, IssuedCertificate};
use crate::certs;
use crate::config::AcmeSettings;
use crate::operation::window_end;
use crate::store::{AccountStore, StoreError};

/// The deployment's CA account: one signing key, registered once.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredAccount {
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    /// Base64 PKCS#8 P-256 key.
    pub private_key: String,
    /// Account URL assigned by the CA; empty until registration succeeds.
    #[serde(default)]
    pub account_id: Option<String>,
    pub email: String,
}

impl RegisteredAccount {
    #[must_use]
    pub fn new(created: OffsetDateTime, private_key: String, email: String) -> Self {
        Self {
            created,
            private_key,
            account_id: None,
            email,
        }
    }

    fn key_der(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.private_key)
            .context("Stored account key is not valid base64")
    }

    fn is_registered(&self) -> bool {
        self.account_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

impl fmt::Debug for RegisteredAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredAccount")
            .field("created", &self.created)
            .field("private_key", &"<redacted>")
            .field("account_id", &self.account_id)
            .field("email", &self.email)
            .finish()
    }
}

/// [`CertificateAuthority`] backed by an ACME server and a lazily created account.
pub struct AccountAuthority {
    store: Arc<dyn AccountStore>,
    directory_url: String,
    email: String,
    settings: AcmeSettings,
    client: Mutex<Option<AcmeClient>>,
}

impl AccountAuthority {
    #[must_use]
    pub fn new(
        store: Arc<dyn AccountStore>,
        directory_url: String,
        email: String,
        settings: AcmeSettings,
    ) -> Self {
        Self {
            store,
            directory_url,
            email,
            settings,
            client: Mutex::new(None),
        }
    }

    /// Returns a client for one exchange, loading or creating the account on first use.
    ///
    /// The lock covers only the first connection; each caller gets its own fork.
    async fn client(&self) -> Result<AcmeClient> {
        let mut guard = self.client.lock().await;
        if let Some(connected) = guard.as_ref() {
            return Ok(connected.fork());
        }
        let connected = self.connect().await?;
        let client = connected.fork();
        *guard = Some(connected);
        Ok(client)
    }

    async fn connect(&self) -> Result<AcmeClient> {
        let mut account = self.load_or_create_account().await?;
        let key = account.key_der()?;
        let mut client = AcmeClient::new(self.directory_url.clone(), &self.settings, &key)?;

        if let Some(kid) = account.account_id.clone().filter(|_| account.is_registered()) {
            client.set_key_id(kid);
            client.fetch_directory().await?;
        } else {
            let contact = vec![format!("mailto:{}", account.email)];
            let kid = client.register_account(&contact).await?;
            account.account_id = Some(kid);
            self.store
                .save_account(&account)
                .await
                .context("Failed to save registered account")?;
        }
        Ok(client)
    }

    async fn load_or_create_account(&self) -> Result<RegisteredAccount> {
        match self.store.get_account().await {
            Ok(account) => return Ok(account),
            Err(StoreError::NotFound { .. }) => {}
            Err(err) => return Err(err).context("Failed to load account"),
        }

        let key = AcmeClient::generate_account_key()?;
        let account = RegisteredAccount::new(
            OffsetDateTime::now_utc(),
            base64::engine::general_purpose::STANDARD.encode(key),
            self.email.clone(),
        );
        match self.store.create_account(&account).await {
            Ok(()) => {
                info!("Created CA account key for {}", self.email);
                Ok(account)
            }
            // Another instance won the race; use its key.
            Err(StoreError::AlreadyExists { .. }) => self
                .store
                .get_account()
                .await
                .context("Failed to reload account"),
            Err(err) => Err(err).context("Failed to create account"),
        }
    }
}

#[async_trait]
impl CertificateAuthority for AccountAuthority {
    async fn ensure_account(&self) -> Result<()> {
        self.client().await.map(|_| ())
    }

    async fn authorize(&self, hostname: &str) -> Result<Authorization> {
        let mut client = self.client().await?;
        let order = client.create_order(&[hostname.to_string()], None).await?;
        let url = order
            .authorizations
            .first()
            .with_context(|| format!("Order for {hostname} has no authorizations"))?
            .clone();
        client.fetch_authorization(&url).await
    }

    async fn accept(&self, challenge: &Challenge) -> Result<Challenge> {
        self.client().await?.trigger_challenge(&challenge.url).await
    }

    async fn challenge(&self, url: &str) -> Result<Challenge> {
        self.client().await?.fetch_challenge(url).await
    }

    async fn http01_response(&self, token: &str) -> Result<String> {
        self.client().await?.compute_key_authorization(token)
    }

    async fn issue_certificate(
        &self,
        hostname: &str,
        csr_der: &[u8],
        validity: Option<Duration>,
    ) -> Result<IssuedCertificate> {
        let not_after = validity
            .map(|v| {
                window_end(OffsetDateTime::now_utc(), v)
                    .with_context(|| format!("Certificate validity {v:?} is out of range"))
            })
            .transpose()?;
        let mut client = self.client().await?;
        let mut order = client
            .create_order(&[hostname.to_string()], not_after)
            .await?;
        let order_url = order
            .url
            .clone()
            .context("Order response is missing its Location")?;

        match order.status {
            OrderStatus::Pending => {
                anyhow::bail!("Order for {hostname} still has pending authorizations")
            }
            OrderStatus::Invalid => anyhow::bail!(
                "Order for {hostname} is invalid: {}",
                order.error.unwrap_or_default()
            ),
            OrderStatus::Ready => {
                order = client.finalize_order(&order.finalize, csr_der).await?;
            }
            OrderStatus::Processing | OrderStatus::Valid => {}
        }

        let mut attempts = 0;
        while matches!(order.status, OrderStatus::Ready | OrderStatus::Processing) {
            if attempts >= self.settings.poll_attempts {
                anyhow::bail!("Order for {hostname} did not become valid after {attempts} polls");
            }
            tokio::time::sleep(Duration::from_secs(self.settings.poll_interval_secs)).await;
            order = client.poll_order(&order_url).await?;
            attempts += 1;
        }
        if order.status != OrderStatus::Valid {
            anyhow::bail!(
                "Order for {hostname} ended as {:?}: {}",
                order.status,
                order.error.unwrap_or_default()
            );
        }

        let location = order
            .certificate
            .context("Valid order has no certificate URL")?;
        let pem = client.download_certificate(&location).await?;
        let chain = certs::parse_pem_chain(&pem)?;
        info!(
            "Issued certificate for {} ({} certificates in chain)",
            hostname,
            chain.len()
        );
        Ok(IssuedCertificate { chain, location })
    }
}
