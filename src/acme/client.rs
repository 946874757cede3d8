use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use reqwest::Client;
use ring::digest::{Context as DigestContext, SHA256};
use ring::rand::SystemRandom;
use ring::signature::{ECDSA_P256_SHA256_FIXED_SIGNING, EcdsaKeyPair, KeyPair};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};

use crate::acme::types::{Authorization, Challenge, Order};
use crate::config::AcmeSettings;

const ALG_ES256: &str = "ES256";
const CRV_P256: &str = "P-256";
const KTY_EC: &str = "EC";
const CONTENT_TYPE_JOSE_JSON: &str = "application/jose+json";
const HEADER_REPLAY_NONCE: &str = "replay-nonce";
const HEADER_LOCATION: &str = "location";

#[derive(Debug, Deserialize, Clone)]
struct Directory {
    #[serde(rename = "newNonce")]
    nonce: String,
    #[serde(rename = "newAccount")]
    account: String,
    #[serde(rename = "newOrder")]
    order: String,
}

/// RFC 8555 client bound to one account key.
pub struct AcmeClient {
    client: Client,
    directory_url: String,
    directory: Option<Directory>,
    key_pair: Arc<EcdsaKeyPair>,
    key_id: Option<String>,
    nonce: Option<String>,
    directory_fetch_attempts: u64,
    directory_fetch_base_delay_secs: u64,
    directory_fetch_max_delay_secs: u64,
}

impl AcmeClient {
    /// Generates a PKCS#8 encoded P-256 account key.
    ///
    /// # Errors
    /// Returns error if the system random source fails.
    pub fn generate_account_key() -> Result<Vec<u8>> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|_| anyhow::anyhow!("Failed to generate account key"))?;
        Ok(pkcs8.as_ref().to_vec())
    }

    /// Creates a client that signs with the given PKCS#8 account key.
    ///
    /// # Errors
    /// Returns error if the key cannot be parsed or the HTTP client build fails.
    pub fn new(directory_url: String, settings: &AcmeSettings, account_key: &[u8]) -> Result<Self> {
        let rng = SystemRandom::new();
        let key_pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, account_key, &rng)
                .map_err(|_| anyhow::anyhow!("Failed to parse account key"))?;

        Ok(Self {
            client: Client::builder()
                .build()
                .context("Failed to build ACME HTTP client")?,
            directory_url,
            directory: None,
            key_pair: Arc::new(key_pair),
            key_id: None,
            nonce: None,
            directory_fetch_attempts: settings.directory_fetch_attempts,
            directory_fetch_base_delay_secs: settings.directory_fetch_base_delay_secs,
            directory_fetch_max_delay_secs: settings.directory_fetch_max_delay_secs,
        })
    }

    /// A client for one exchange with the CA: same key, account URL and cached
    /// directory, but its own nonce.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            client: self.client.clone(),
            directory_url: self.directory_url.clone(),
            directory: self.directory.clone(),
            key_pair: Arc::clone(&self.key_pair),
            key_id: self.key_id.clone(),
            nonce: None,
            directory_fetch_attempts: self.directory_fetch_attempts,
            directory_fetch_base_delay_secs: self.directory_fetch_base_delay_secs,
            directory_fetch_max_delay_secs: self.directory_fetch_max_delay_secs,
        }
    }

    /// Uses an already registered account URL for subsequent requests.
    pub fn set_key_id(&mut self, kid: String) {
        self.key_id = Some(kid);
    }

    #[must_use]
    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    fn b64(data: &[u8]) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
    }

    /// Fetches the ACME directory and caches it.
    ///
    /// # Errors
    /// Returns error if the directory fetch or JSON parsing fails.
    pub async fn fetch_directory(&mut self) -> Result<()> {
        if self.directory.is_some() {
            return Ok(());
        }
        info!("Fetching ACME directory from {}", self.directory_url);
        let mut last_err = None;
        let mut delay_secs = self.directory_fetch_base_delay_secs;
        for attempt in 1..=self.directory_fetch_attempts {
            let resp = self.client.get(&self.directory_url).send().await;
            match resp {
                Ok(resp) => match resp.error_for_status() {
                    Ok(resp) => match resp.json::<Directory>().await {
                        Ok(dir) => {
                            self.directory = Some(dir);
                            return Ok(());
                        }
                        Err(err) => last_err = Some(err.into()),
                    },
                    Err(err) => last_err = Some(err.into()),
                },
                Err(err) => last_err = Some(err.into()),
            }

            if attempt < self.directory_fetch_attempts {
                warn!(
                    "ACME directory fetch failed (attempt {}/{}), retrying in {}s...",
                    attempt, self.directory_fetch_attempts, delay_secs
                );
                tokio::time::sleep(std::time::Duration::from_secs(delay_secs)).await;
                delay_secs = delay_secs
                    .saturating_mul(2)
                    .min(self.directory_fetch_max_delay_secs);
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Directory fetch failed")))
    }

    fn directory(&self) -> Result<&Directory> {
        self.directory
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Directory not loaded"))
    }

    /// Returns a fresh nonce, reusing the last `Replay-Nonce` seen if any.
    ///
    /// # Errors
    /// Returns error if the nonce request fails or the response is missing a nonce.
    pub async fn get_nonce(&mut self) -> Result<String> {
        if let Some(nonce) = self.nonce.take() {
            return Ok(nonce);
        }

        self.fetch_directory().await?;
        let url = self.directory()?.nonce.clone();
        let resp = self.client.head(&url).send().await?;
        let nonce = resp
            .headers()
            .get(HEADER_REPLAY_NONCE)
            .context("Missing Replay-Nonce header")?
            .to_str()?
            .to_string();
        Ok(nonce)
    }

    /// Registers (or looks up) the account for this key and returns its URL.
    ///
    /// # Errors
    /// Returns error if the ACME API fails or the response lacks a Location header.
    pub async fn register_account(&mut self, contact: &[String]) -> Result<String> {
        self.fetch_directory().await?;
        let url = self.directory()?.account.clone();

        let payload = serde_json::json!({
            "termsOfServiceAgreed": true,
            "contact": contact
        });

        info!("Registering account...");
        let resp = self.post(&url, &payload).await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!(
                "Account registration failed: {status} - {text}"
            ));
        }

        let kid = header_value(&resp, HEADER_LOCATION)
            .ok_or_else(|| anyhow::anyhow!("Missing Location header in account registration"))?;

        info!("Account registered: {}", kid);
        self.key_id = Some(kid.clone());
        Ok(kid)
    }

    /// Creates a new order for the given domains.
    ///
    /// # Errors
    /// Returns error if ACME API fails.
    pub async fn create_order(
        &mut self,
        domains: &[String],
        not_after: Option<OffsetDateTime>,
    ) -> Result<Order> {
        self.fetch_directory().await?;
        let url = self.directory()?.order.clone();

        let identifiers: Vec<serde_json::Value> = domains
            .iter()
            .map(|d| serde_json::json!({ "type": "dns", "value": d }))
            .collect();

        let mut payload = serde_json::json!({
            "identifiers": identifiers
        });
        if let Some(not_after) = not_after {
            payload["notAfter"] = serde_json::Value::String(not_after.format(&Rfc3339)?);
        }

        info!("Creating new order for domains: {:?}", domains);
        let resp = self.post(&url, &payload).await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!("Order creation failed: {status} - {text}"));
        }

        let order_url = header_value(&resp, HEADER_LOCATION);
        let mut order: Order = resp.json().await?;
        order.url = order_url;
        Ok(order)
    }

    /// Fetches the authorization object from the URL.
    ///
    /// # Errors
    /// Returns error if network fails or status is not success.
    pub async fn fetch_authorization(&mut self, url: &str) -> Result<Authorization> {
        let resp = self.post_as_get(url).await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!("Fetch Authz failed: {status} - {text}"));
        }

        let mut authz: Authorization = resp.json().await?;
        authz.url = url.to_string();
        Ok(authz)
    }

    /// Fetches the current state of a challenge.
    ///
    /// # Errors
    /// Returns error if network fails or status is not success.
    pub async fn fetch_challenge(&mut self, url: &str) -> Result<Challenge> {
        let resp = self.post_as_get(url).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!("Fetch challenge failed: {status} - {text}"));
        }
        Ok(resp.json().await?)
    }

    /// Computes the Key Authorization for a token.
    ///
    /// # Errors
    /// Returns error if JWK construction or serialization fails.
    pub fn compute_key_authorization(&self, token: &str) -> Result<String> {
        let jwk = self.jwk()?;

        let mut map = std::collections::BTreeMap::new();
        map.insert("crv", jwk.crv);
        map.insert("kty", jwk.kty);
        map.insert("x", jwk.x);
        map.insert("y", jwk.y);

        let json = serde_json::to_string(&map)?;
        debug!("Thumbprint Canonical JSON: {}", json);

        let mut context = DigestContext::new(&SHA256);
        context.update(json.as_bytes());
        let digest = context.finish();

        let thumbprint = Self::b64(digest.as_ref());
        Ok(format!("{token}.{thumbprint}"))
    }

    /// Tells the server the challenge response is in place.
    ///
    /// # Errors
    /// Returns error if network fails.
    pub async fn trigger_challenge(&mut self, url: &str) -> Result<Challenge> {
        info!("Triggering challenge at {}", url);
        let payload = serde_json::json!({});
        let resp = self.post(url, &payload).await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!(
                "Trigger challenge failed: {status} - {text}"
            ));
        }

        Ok(resp.json().await?)
    }

    /// Finalizes the order with a CSR.
    ///
    /// # Errors
    /// Returns error if finalize call fails.
    pub async fn finalize_order(&mut self, url: &str, csr_der: &[u8]) -> Result<Order> {
        let csr_b64 = Self::b64(csr_der);
        let payload = serde_json::json!({
            "csr": csr_b64
        });

        info!("Finalizing order...");
        let resp = self.post(url, &payload).await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!("Finalize failed: {status} - {text}"));
        }

        let order: Order = resp.json().await?;
        Ok(order)
    }

    /// Downloads the issued certificate chain as PEM.
    ///
    /// # Errors
    /// Returns error if download fails.
    pub async fn download_certificate(&mut self, url: &str) -> Result<String> {
        let resp = self.post_as_get(url).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!("Download cert failed: {status} - {text}"));
        }
        let cert_pem = resp.text().await?;
        Ok(cert_pem)
    }

    /// Polls the order status.
    ///
    /// # Errors
    /// Returns error if poll request fails.
    pub async fn poll_order(&mut self, url: &str) -> Result<Order> {
        let resp = self.post_as_get(url).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!("Poll order failed: {status} - {text}"));
        }
        let mut order: Order = resp.json().await?;
        order.url = Some(url.to_string());
        Ok(order)
    }

    fn jwk(&self) -> Result<Jwk> {
        let pk = self.key_pair.public_key();
        let pk_bytes = pk.as_ref();

        if pk_bytes.len() != 65 || pk_bytes[0] != 0x04 {
            return Err(anyhow::anyhow!("Unexpected public key format"));
        }

        let x = &pk_bytes[1..33];
        let y = &pk_bytes[33..65];

        Ok(Jwk {
            kty: KTY_EC.to_string(),
            crv: CRV_P256.to_string(),
            x: Self::b64(x),
            y: Self::b64(y),
        })
    }

    async fn sign_request<T: Serialize + ?Sized>(
        &mut self,
        url: &str,
        payload: Option<&T>,
    ) -> Result<serde_json::Value> {
        let nonce = self.get_nonce().await?;

        let header = if let Some(kid) = &self.key_id {
            JwsHeader {
                alg: ALG_ES256.to_string(),
                nonce,
                url: url.to_string(),
                jwk: None,
                kid: Some(kid.clone()),
            }
        } else {
            JwsHeader {
                alg: ALG_ES256.to_string(),
                nonce,
                url: url.to_string(),
                jwk: Some(self.jwk()?),
                kid: None,
            }
        };

        let protected_json = serde_json::to_string(&header)?;
        let protected_b64 = Self::b64(protected_json.as_bytes());

        let payload_b64 = match payload {
            Some(p) => Self::b64(serde_json::to_string(p)?.as_bytes()),
            None => String::new(),
        };

        let signing_input = format!("{protected_b64}.{payload_b64}");

        let rng = SystemRandom::new();
        let signature = self
            .key_pair
            .sign(&rng, signing_input.as_bytes())
            .map_err(|_| anyhow::anyhow!("Failed to sign request"))?;

        Ok(serde_json::json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": Self::b64(signature.as_ref())
        }))
    }

    async fn send_signed(&mut self, url: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let resp = self
            .client
            .post(url)
            .header("Content-Type", CONTENT_TYPE_JOSE_JSON)
            .json(&body)
            .send()
            .await?;
        self.nonce = header_value(&resp, HEADER_REPLAY_NONCE);
        Ok(resp)
    }

    async fn post<T: Serialize + ?Sized>(
        &mut self,
        url: &str,
        payload: &T,
    ) -> Result<reqwest::Response> {
        let body = self.sign_request(url, Some(payload)).await?;
        debug!("POST {}", url);
        self.send_signed(url, body).await
    }

    async fn post_as_get(&mut self, url: &str) -> Result<reqwest::Response> {
        let body = self.sign_request::<()>(url, None).await?;
        debug!("POST-as-GET {}", url);
        self.send_signed(url, body).await
    }
}

fn header_value(resp: &reqwest::Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(ToString::to_string)
}

#[derive(Debug, Serialize, Clone)]
struct Jwk {
    kty: String,
    crv: String,
    x: String,
    y: String,
}

#[derive(Debug, Serialize)]
struct JwsHeader {
    alg: String,
    nonce: String,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}
