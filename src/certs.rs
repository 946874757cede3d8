use anyhow::{Context, Result};
use pem::Pem;
use time::OffsetDateTime;
use x509_parser::extensions::{GeneralName, ParsedExtension};

const TAG_CERTIFICATE: &str = "CERTIFICATE";
const TAG_PRIVATE_KEY: &str = "PRIVATE KEY";

/// Fields of an X.509 certificate used for naming and status display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSummary {
    pub common_name: Option<String>,
    pub issuer_common_name: Option<String>,
    pub serial_hex: String,
    pub dns_names: Vec<String>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

/// Parses a DER certificate.
///
/// # Errors
/// Returns an error if the certificate cannot be parsed.
pub fn summarize(der: &[u8]) -> Result<CertificateSummary> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| anyhow::anyhow!("Failed to parse X509 certificate: {e}"))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(ToString::to_string);
    let issuer_common_name = cert
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(ToString::to_string);

    let mut dns_names = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::DNSName(dns_name) = name {
                    dns_names.push((*dns_name).to_string());
                }
            }
        }
    }

    Ok(CertificateSummary {
        common_name,
        issuer_common_name,
        serial_hex: cert.tbs_certificate.serial.to_str_radix(16),
        dns_names,
        not_before: cert.validity().not_before.to_datetime(),
        not_after: cert.validity().not_after.to_datetime(),
    })
}

/// Splits a PEM bundle into DER certificates, in file order.
///
/// # Errors
/// Returns an error if the PEM is malformed or holds no certificate.
pub fn parse_pem_chain(pem_data: &str) -> Result<Vec<Vec<u8>>> {
    let blocks = pem::parse_many(pem_data).context("Failed to parse PEM certificate chain")?;
    let chain: Vec<Vec<u8>> = blocks
        .into_iter()
        .filter(|block| block.tag() == TAG_CERTIFICATE)
        .map(Pem::into_contents)
        .collect();
    if chain.is_empty() {
        anyhow::bail!("PEM bundle contains no certificates");
    }
    Ok(chain)
}

#[must_use]
pub fn encode_chain(chain: &[Vec<u8>]) -> String {
    let blocks: Vec<Pem> = chain
        .iter()
        .map(|der| Pem::new(TAG_CERTIFICATE, der.clone()))
        .collect();
    pem::encode_many(&blocks)
}

#[must_use]
pub fn encode_private_key(pkcs8_der: &[u8]) -> String {
    pem::encode(&Pem::new(TAG_PRIVATE_KEY, pkcs8_der.to_vec()))
}

/// Platform display name for an issued certificate, e.g. `cert-www-example-com-3a0f`.
#[must_use]
pub fn display_name(common_name: &str, serial_hex: &str) -> String {
    format!("cert-{}-{serial_hex}", common_name.replace('.', "-"))
}
