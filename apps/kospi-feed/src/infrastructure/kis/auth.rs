//! KIS OAuth Credential Issuer
//!
//! Issues the REST access token and the real-time approval key over HTTP.
//!
//! - `POST /oauth2/tokenP` with `appkey`/`appsecret` returns `access_token`
//!   and `expires_in`.
//! - `POST /oauth2/Approval` with `appkey`/`secretkey` returns
//!   `approval_key`.
//!
//! The upstream throttles issuance to roughly once a minute; throttled
//! requests answer with HTTP 429 or an error body carrying `EGW00133`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::application::ports::{CredentialIssuer, IssueError, IssuedCredential};
use crate::domain::credential::CredentialKind;
use crate::infrastructure::config::AppCredentials;

/// Error code the upstream returns when issuance is throttled.
const RATE_LIMIT_CODE: &str = "EGW00133";

const TOKEN_PATH: &str = "/oauth2/tokenP";
const APPROVAL_PATH: &str = "/oauth2/Approval";
const GRANT_TYPE: &str = "client_credentials";

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    grant_type: &'static str,
    appkey: &'a str,
    appsecret: &'a str,
}

#[derive(Debug, Serialize)]
struct ApprovalRequest<'a> {
    grant_type: &'static str,
    appkey: &'a str,
    secretkey: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApprovalResponse {
    #[serde(default)]
    approval_key: Option<String>,
}

/// HTTP issuer against the KIS OAuth endpoints.
#[derive(Debug, Clone)]
pub struct HttpCredentialIssuer {
    client: Client,
    base_url: String,
    credentials: AppCredentials,
}

impl HttpCredentialIssuer {
    /// Create an issuer.
    ///
    /// # Errors
    ///
    /// Returns [`IssueError::Network`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        credentials: AppCredentials,
        timeout: Duration,
    ) -> Result<Self, IssueError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IssueError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<String, IssueError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| IssueError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| IssueError::Network(e.to_string()))?;

        if status == StatusCode::TOO_MANY_REQUESTS || text.contains(RATE_LIMIT_CODE) {
            return Err(IssueError::RateLimited(text));
        }
        if !status.is_success() {
            return Err(IssueError::Rejected {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }

    async fn issue_access_token(&self) -> Result<IssuedCredential, IssueError> {
        let body = TokenRequest {
            grant_type: GRANT_TYPE,
            appkey: self.credentials.app_key(),
            appsecret: self.credentials.app_secret(),
        };
        let text = self.post(TOKEN_PATH, &body).await?;
        let parsed: TokenResponse =
            serde_json::from_str(&text).map_err(|e| IssueError::Malformed(e.to_string()))?;

        let value = parsed
            .access_token
            .filter(|v| !v.is_empty())
            .ok_or_else(|| IssueError::Malformed("missing access_token".to_string()))?;
        Ok(IssuedCredential {
            value,
            ttl: parsed.expires_in.map(Duration::from_secs),
        })
    }

    async fn issue_approval_key(&self) -> Result<IssuedCredential, IssueError> {
        let body = ApprovalRequest {
            grant_type: GRANT_TYPE,
            appkey: self.credentials.app_key(),
            secretkey: self.credentials.app_secret(),
        };
        let text = self.post(APPROVAL_PATH, &body).await?;
        let parsed: ApprovalResponse =
            serde_json::from_str(&text).map_err(|e| IssueError::Malformed(e.to_string()))?;

        let value = parsed
            .approval_key
            .filter(|v| !v.is_empty())
            .ok_or_else(|| IssueError::Malformed("missing approval_key".to_string()))?;
        Ok(IssuedCredential { value, ttl: None })
    }
}

#[async_trait]
impl CredentialIssuer for HttpCredentialIssuer {
    async fn issue(&self, kind: CredentialKind) -> Result<IssuedCredential, IssueError> {
        tracing::info!(kind = kind.as_str(), "Requesting credential");
        match kind {
            CredentialKind::AccessToken => self.issue_access_token().await,
            CredentialKind::ApprovalKey => self.issue_approval_key().await,
        }
    }
}
