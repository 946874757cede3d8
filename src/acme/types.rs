use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Order {
    pub status: OrderStatus,
    pub finalize: String,
    pub authorizations: Vec<String>,
    pub certificate: Option<String>,
    #[serde(default)]
    pub error: Option<Problem>,
    #[serde(skip)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub r#type: String,
    pub value: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Authorization {
    pub status: AuthorizationStatus,
    #[serde(default)]
    pub identifier: Option<Identifier>,
    pub challenges: Vec<Challenge>,
    /// Location the authorization was fetched from.
    #[serde(skip)]
    pub url: String,
}

impl Authorization {
    #[must_use]
    pub fn http01(&self) -> Option<&Challenge> {
        self.challenges
            .iter()
            .find(|c| c.r#type == ChallengeType::Http01)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub r#type: ChallengeType,
    pub url: String,
    #[serde(default)]
    pub token: String,
    pub status: ChallengeStatus,
    #[serde(default)]
    pub error: Option<Problem>,
}

/// RFC 7807 problem document returned by the CA.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub r#type: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.r#type, &self.detail) {
            (Some(kind), Some(detail)) => write!(f, "{kind}: {detail}"),
            (None, Some(detail)) => f.write_str(detail),
            (Some(kind), None) => f.write_str(kind),
            (None, None) => f.write_str("unknown error"),
        }
    }
}
