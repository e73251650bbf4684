use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";
pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Longest lifetime the token endpoint accepts for an assertion.
const ASSERTION_LIFETIME_SECS: u64 = 3600;

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("reading credentials {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing credentials file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("signing token assertion for {email}: {source}")]
    Signing {
        email: String,
        #[source]
        source: jsonwebtoken::errors::Error,
    },
    #[error("no sheet credentials: pass --cred-file or set {ACCESS_TOKEN}", ACCESS_TOKEN = ACCESS_TOKEN_ENV)]
    Missing,
    #[error("exchanging credentials for an access token: {0}")]
    Exchange(String),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CredentialsFile {
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
    ServiceAccount {
        client_email: String,
        private_key: String,
        #[serde(default)]
        private_key_id: Option<String>,
        #[serde(default)]
        token_uri: Option<String>,
    },
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

/// Service-account key as found in a downloaded JSON key file.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    pub private_key_id: Option<String>,
    pub token_uri: String,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    /// RS256-signed JWT asking for spreadsheet access, valid from `issued_at`
    /// (unix seconds) for one hour.
    pub fn assertion(&self, issued_at: u64) -> Result<String, CredentialsError> {
        let signing = |source| CredentialsError::Signing {
            email: self.client_email.clone(),
            source,
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes()).map_err(signing)?;
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.private_key_id.clone();
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: SHEETS_SCOPE,
            aud: &self.token_uri,
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME_SECS,
        };
        jsonwebtoken::encode(&header, &claims, &key).map_err(signing)
    }
}

/// How the run authenticates against the spreadsheet API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    AccessToken(String),
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
    ServiceAccount(ServiceAccountKey),
}

impl Credentials {
    /// A credentials file takes precedence over a raw token from the environment.
    pub fn load(cred_file: Option<&Path>, env_token: Option<String>) -> Result<Self, CredentialsError> {
        if let Some(path) = cred_file {
            let raw = fs::read_to_string(path).map_err(|source| CredentialsError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            return Self::from_json(&raw);
        }
        match env_token {
            Some(token) if !token.trim().is_empty() => Ok(Credentials::AccessToken(token.trim().to_string())),
            _ => Err(CredentialsError::Missing),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, CredentialsError> {
        Ok(match serde_json::from_str::<CredentialsFile>(raw)? {
            CredentialsFile::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
            } => Credentials::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
            },
            CredentialsFile::ServiceAccount {
                client_email,
                private_key,
                private_key_id,
                token_uri,
            } => Credentials::ServiceAccount(ServiceAccountKey {
                client_email,
                private_key,
                private_key_id,
                token_uri: token_uri.unwrap_or_else(|| TOKEN_ENDPOINT.to_string()),
            }),
        })
    }

    pub fn access_token(&self, agent: &ureq::Agent) -> Result<String, CredentialsError> {
        let response = match self {
            Credentials::AccessToken(token) => return Ok(token.clone()),
            Credentials::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
            } => agent.post(TOKEN_ENDPOINT).send_form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ]),
            Credentials::ServiceAccount(key) => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_err(|e| CredentialsError::Exchange(e.to_string()))?
                    .as_secs();
                let assertion = key.assertion(now)?;
                agent
                    .post(&key.token_uri)
                    .send_form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            }
        }
        .map_err(|e| CredentialsError::Exchange(e.to_string()))?;
        let token: TokenResponse = response
            .into_json()
            .map_err(|e| CredentialsError::Exchange(e.to_string()))?;
        Ok(token.access_token)
    }
}
