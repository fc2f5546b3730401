//! Service account authentication (OAuth 2.0 JWT bearer grant).

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};

use super::types::SheetsError;

/// Read/write access to spreadsheets
pub const SPREADSHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Tokens are renewed this long before they expire
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// The fields of a downloaded service account key that we use
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self, SheetsError> {
        let raw = std::fs::read_to_string(path).map_err(|source| SheetsError::Credentials {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, SheetsError> {
        let key: ServiceAccountKey =
            serde_json::from_str(raw).map_err(|e| SheetsError::InvalidKey(e.to_string()))?;
        if key.client_email.is_empty() {
            return Err(SheetsError::InvalidKey("client_email is empty".into()));
        }
        if key.private_key.is_empty() {
            return Err(SheetsError::InvalidKey("private_key is empty".into()));
        }
        Ok(key)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Claims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

impl Claims {
    fn new(key: &ServiceAccountKey, now: i64) -> Self {
        Claims {
            iss: key.client_email.clone(),
            scope: SPREADSHEETS_SCOPE.to_string(),
            aud: key.token_uri.clone(),
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        }
    }
}

/// Sign the JWT that is traded for an access token
pub fn build_assertion(key: &ServiceAccountKey, now: i64) -> Result<String, SheetsError> {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = key.private_key_id.clone();

    let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .map_err(|e| SheetsError::InvalidKey(e.to_string()))?;

    encode(&header, &Claims::new(key, now), &signing_key)
        .map_err(|e| SheetsError::InvalidKey(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    ASSERTION_LIFETIME_SECS as u64
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// A bearer token and the moment it stops being usable
#[derive(Debug, Clone)]
pub struct AccessToken {
    value: String,
    expires_at: Instant,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, lifetime: Duration) -> Self {
        AccessToken {
            value: value.into(),
            expires_at: Instant::now() + lifetime,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn needs_refresh(&self) -> bool {
        Instant::now() + REFRESH_MARGIN >= self.expires_at
    }
}

/// Exchange a signed assertion for an access token
pub async fn fetch_token(
    http: &reqwest::Client,
    key: &ServiceAccountKey,
) -> Result<AccessToken, SheetsError> {
    let assertion = build_assertion(key, chrono::Utc::now().timestamp())?;

    let response = http
        .post(&key.token_uri)
        .form(&[("grant_type", GRANT_TYPE), ("assertion", assertion.as_str())])
        .send()
        .await?;

    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        let message = match serde_json::from_str::<TokenErrorResponse>(&body) {
            Ok(err) => match err.error_description {
                Some(description) => format!("{}: {}", err.error, description),
                None => err.error,
            },
            Err(_) => format!("{}: {}", status, body),
        };
        return Err(SheetsError::Auth(message));
    }

    let token: TokenResponse = serde_json::from_str(&body)
        .map_err(|e| SheetsError::Auth(format!("unexpected token response: {}", e)))?;

    Ok(AccessToken::new(token.access_token, Duration::from_secs(token.expires_in)))
}
