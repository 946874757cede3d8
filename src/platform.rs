use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::config::PlatformSettings;

const CERTIFICATES_FIELD: &str = "certificates";
const DOMAIN_MAPPINGS_FIELD: &str = "domainMappings";
const AUTHORIZED_DOMAINS_FIELD: &str = "domains";
const CERTIFICATE_ID_MASK: &str = "sslSettings.certificateId";

/// Certificate stored on the hosting platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    #[serde(default)]
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub domain_names: Vec<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expire_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub certificate_raw_data: Option<CertificateRawData>,
}

impl Certificate {
    #[must_use]
    pub fn public_certificate(&self) -> Option<&str> {
        self.certificate_raw_data
            .as_ref()
            .map(|raw| raw.public_certificate.as_str())
            .filter(|pem| !pem.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRawData {
    #[serde(default)]
    pub public_certificate: String,
    /// Write-only; the platform never returns it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_key: String,
}

/// Binding of a custom hostname to the application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainMapping {
    #[serde(default)]
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub ssl_settings: Option<SslSettings>,
}

impl DomainMapping {
    /// ID of the certificate serving this domain, if any.
    #[must_use]
    pub fn certificate_id(&self) -> Option<&str> {
        self.ssl_settings
            .as_ref()
            .and_then(|ssl| ssl.certificate_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SslSettings {
    #[serde(default)]
    pub certificate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_management_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AuthorizedDomain {
    #[serde(default)]
    pub name: String,
    pub id: String,
}

/// What the workflow needs from the hosting platform.
#[async_trait]
pub trait CertificateHost: Send + Sync {
    async fn list_certificates(&self) -> Result<Vec<Certificate>>;

    async fn list_domain_mappings(&self) -> Result<Vec<DomainMapping>>;

    async fn list_authorized_domains(&self) -> Result<Vec<AuthorizedDomain>>;

    /// Uploads a PEM chain and key, returning the platform's certificate ID.
    async fn create_certificate(
        &self,
        public_certificate: &str,
        private_key: &str,
        display_name: &str,
    ) -> Result<String>;

    /// Points `domain` at `certificate_id`, leaving the rest of the mapping untouched.
    async fn patch_domain_mapping(&self, domain: &str, certificate_id: &str) -> Result<()>;

    async fn delete_certificate(&self, certificate_id: &str) -> Result<()>;
}

/// Source of bearer tokens for the platform API.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// A fixed token from configuration.
pub struct StaticToken(String);

impl StaticToken {
    #[must_use]
    pub fn new(token: String) -> Self {
        Self(token)
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page {
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(flatten)]
    items: serde_json::Map<String, serde_json::Value>,
}

/// App Engine Admin API client scoped to one application.
pub struct PlatformClient {
    base_url: String,
    project: String,
    client: Client,
    tokens: Arc<dyn TokenProvider>,
}

impl PlatformClient {
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(settings: &PlatformSettings, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to build platform HTTP client")?;
        Ok(Self {
            base_url: settings.api_url.trim_end_matches('/').to_string(),
            project: settings.project.clone(),
            client,
            tokens,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/apps/{}/{path}", self.base_url, self.project)
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = self
            .tokens
            .access_token()
            .await
            .context("Failed to obtain platform access token")?;
        Ok(self
            .client
            .request(method, self.endpoint(path))
            .bearer_auth(token))
    }

    async fn list<T: DeserializeOwned>(
        &self,
        path: &str,
        field: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        let mut seen = HashSet::new();
        loop {
            let mut request = self.request(Method::GET, path).await?.query(query);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let response = request
                .send()
                .await
                .with_context(|| format!("Platform request failed: {path}"))?;
            let mut page: Page = Self::parse_response(response)
                .await
                .with_context(|| format!("Platform response parse failed: {path}"))?;
            if let Some(values) = page.items.remove(field) {
                let parsed: Vec<T> = serde_json::from_value(values)
                    .with_context(|| format!("Failed to parse {field} list"))?;
                items.extend(parsed);
            }
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => {
                    if !seen.insert(next.clone()) {
                        anyhow::bail!("Platform listing of {field} repeated page token {next}");
                    }
                    page_token = Some(next);
                }
                None => break,
            }
        }
        debug!("Listed {} {} from platform", items.len(), field);
        Ok(items)
    }

    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read platform response body")?;
        if !status.is_success() {
            anyhow::bail!("Platform API error ({status}): {text}");
        }
        let body = if text.trim().is_empty() { "{}" } else { &text };
        serde_json::from_str(body).context("Failed to parse platform response")
    }
}

#[async_trait]
impl CertificateHost for PlatformClient {
    async fn list_certificates(&self) -> Result<Vec<Certificate>> {
        self.list(
            "authorizedCertificates",
            CERTIFICATES_FIELD,
            &[("view", "FULL_CERTIFICATE")],
        )
        .await
    }

    async fn list_domain_mappings(&self) -> Result<Vec<DomainMapping>> {
        self.list("domainMappings", DOMAIN_MAPPINGS_FIELD, &[]).await
    }

    async fn list_authorized_domains(&self) -> Result<Vec<AuthorizedDomain>> {
        self.list("authorizedDomains", AUTHORIZED_DOMAINS_FIELD, &[])
            .await
    }

    async fn create_certificate(
        &self,
        public_certificate: &str,
        private_key: &str,
        display_name: &str,
    ) -> Result<String> {
        let raw_data = CertificateRawData {
            public_certificate: public_certificate.to_string(),
            private_key: private_key.to_string(),
        };
        let response = self
            .request(Method::POST, "authorizedCertificates")
            .await?
            .json(&CreateCertificateRequest {
                display_name,
                certificate_raw_data: &raw_data,
            })
            .send()
            .await
            .context("Platform request failed: authorizedCertificates")?;
        let created: Certificate = Self::parse_response(response)
            .await
            .context("Failed to upload certificate")?;
        if created.id.is_empty() {
            anyhow::bail!("Platform returned no ID for uploaded certificate {display_name}");
        }
        info!("Uploaded certificate {} as {}", display_name, created.id);
        Ok(created.id)
    }

    async fn patch_domain_mapping(&self, domain: &str, certificate_id: &str) -> Result<()> {
        let body = serde_json::json!({
            "sslSettings": { "certificateId": certificate_id }
        });
        let path = format!("domainMappings/{domain}");
        let response = self
            .request(Method::PATCH, &path)
            .await?
            .query(&[("updateMask", CERTIFICATE_ID_MASK)])
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Platform request failed: {path}"))?;
        let _: serde_json::Value = Self::parse_response(response)
            .await
            .with_context(|| format!("Failed to map {domain} to {certificate_id}"))?;
        info!("Mapped {} to certificate {}", domain, certificate_id);
        Ok(())
    }

    async fn delete_certificate(&self, certificate_id: &str) -> Result<()> {
        let path = format!("authorizedCertificates/{certificate_id}");
        let response = self
            .request(Method::DELETE, &path)
            .await?
            .send()
            .await
            .with_context(|| format!("Platform request failed: {path}"))?;
        let _: serde_json::Value = Self::parse_response(response)
            .await
            .with_context(|| format!("Failed to delete certificate {certificate_id}"))?;
        info!("Deleted certificate {}", certificate_id);
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateCertificateRequest<'a> {
    display_name: &'a str,
    certificate_raw_data: &'a CertificateRawData,
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(server: &MockServer) -> PlatformClient {
        let settings = PlatformSettings {
            api_url: format!("{}/", server.uri()),
            project: "demo-app".to_string(),
            access_token: None,
            timeout_secs: 5,
        };
        PlatformClient::new(&settings, Arc::new(StaticToken::new("tok".to_string()))).unwrap()
    }

    #[tokio::test]
    async fn test_list_certificates_follows_page_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/apps/demo-app/authorizedCertificates"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "certificates": [{ "id": "cert-2", "displayName": "second" }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/apps/demo-app/authorizedCertificates"))
            .and(query_param("view", "FULL_CERTIFICATE"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "certificates": [{
                    "id": "cert-1",
                    "displayName": "first",
                    "domainNames": ["example.com"],
                    "expireTime": "2030-01-01T00:00:00Z"
                }],
                "nextPageToken": "p2"
            })))
            .mount(&server)
            .await;

        let certs = client(&server).list_certificates().await.unwrap();
        let ids: Vec<&str> = certs.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["cert-1", "cert-2"]);
        assert_eq!(certs[0].domain_names, vec!["example.com"]);
        assert!(certs[0].expire_time.is_some());
        assert!(certs[1].expire_time.is_none());
    }

    #[tokio::test]
    async fn test_repeated_page_token_stops_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/apps/demo-app/domainMappings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "domainMappings": [{ "id": "example.com" }],
                "nextPageToken": "again"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let err = client(&server).list_domain_mappings().await.unwrap_err();
        assert!(err.to_string().contains("repeated page token again"));
    }

    #[tokio::test]
    async fn test_empty_listing_has_no_items() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/apps/demo-app/authorizedDomains"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let domains = client(&server).list_authorized_domains().await.unwrap();
        assert!(domains.is_empty());
    }

    #[tokio::test]
    async fn test_patch_updates_only_certificate_id() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/v1/apps/demo-app/domainMappings/www.example.com"))
            .and(query_param("updateMask", "sslSettings.certificateId"))
            .and(body_json(serde_json::json!({
                "sslSettings": { "certificateId": "cert-9" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "apps/demo-app/operations/1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .patch_domain_mapping("www.example.com", "cert-9")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_certificate_returns_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/apps/demo-app/authorizedCertificates"))
            .and(body_json(serde_json::json!({
                "displayName": "cert-example-com-abc",
                "certificateRawData": {
                    "publicCertificate": "CERT",
                    "privateKey": "KEY"
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "12345",
                "displayName": "cert-example-com-abc"
            })))
            .mount(&server)
            .await;

        let id = client(&server)
            .create_certificate("CERT", "KEY", "cert-example-com-abc")
            .await
            .unwrap();
        assert_eq!(id, "12345");
    }

    #[tokio::test]
    async fn test_api_error_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/apps/demo-app/authorizedCertificates/cert-1"))
            .respond_with(ResponseTemplate::new(403).set_body_string("permission denied"))
            .mount(&server)
            .await;

        let err = client(&server)
            .delete_certificate("cert-1")
            .await
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("403"));
        assert!(message.contains("permission denied"));
    }

    #[test]
    fn test_mapping_without_certificate() {
        let mapping: DomainMapping = serde_json::from_value(serde_json::json!({
            "id": "example.com",
            "sslSettings": { "certificateId": "" }
        }))
        .unwrap();
        assert_eq!(mapping.certificate_id(), None);
    }
}
