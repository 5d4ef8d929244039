// Paw Agent Engine — Auth Strategies
// Closed set of credential models used by connectors.
//
//   ApiKey        — static key, sent as a query parameter or header
//   PersonalToken — static bearer token (PAT)
//   OAuth         — access token with expiry, refreshable via refresh_token grant
//
// Secrets are held in `Zeroizing<String>` and never appear in Debug output
// or error messages. Only OAuth can refresh; static credentials that are
// rejected upstream fail the call with no retry.

use crate::atoms::error::{EngineError, EngineResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{info, warn};
use std::time::Duration;
use zeroize::Zeroizing;

/// Refresh this long before the recorded expiry.
const EXPIRY_SKEW_SECS: i64 = 60;
const REFRESH_TIMEOUT_SECS: u64 = 15;
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

pub const GOOGLE_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

/// OAuth 2.0 token set plus what is needed to refresh it.
pub struct OAuthCredentials {
    pub access_token: Zeroizing<String>,
    pub refresh_token: Option<Zeroizing<String>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub client_id: String,
    pub client_secret: Option<Zeroizing<String>>,
    pub token_endpoint: String,
}

pub enum AuthStrategy {
    ApiKey { key: Zeroizing<String> },
    PersonalToken { token: Zeroizing<String> },
    OAuth(OAuthCredentials),
}

/// Where a connector's upstream expects the credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlacement {
    /// `?name=<secret>`
    Query(&'static str),
    /// `name: <secret>`
    Header(&'static str),
    /// `Authorization: Bearer <secret>`
    Bearer,
}

impl std::fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthStrategy::ApiKey { .. } => f.write_str("ApiKey { key: <redacted> }"),
            AuthStrategy::PersonalToken { .. } => f.write_str("PersonalToken { token: <redacted> }"),
            AuthStrategy::OAuth(c) => f
                .debug_struct("OAuth")
                .field("access_token", &"<redacted>")
                .field("has_refresh_token", &c.refresh_token.is_some())
                .field("expires_at", &c.expires_at)
                .field("client_id", &c.client_id)
                .field("token_endpoint", &c.token_endpoint)
                .finish(),
        }
    }
}

impl AuthStrategy {
    pub fn api_key(key: impl Into<String>) -> Self {
        AuthStrategy::ApiKey { key: Zeroizing::new(key.into()) }
    }

    pub fn personal_token(token: impl Into<String>) -> Self {
        AuthStrategy::PersonalToken { token: Zeroizing::new(token.into()) }
    }

    pub fn oauth(credentials: OAuthCredentials) -> Self {
        AuthStrategy::OAuth(credentials)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            AuthStrategy::ApiKey { .. } => "api_key",
            AuthStrategy::PersonalToken { .. } => "personal_token",
            AuthStrategy::OAuth(_) => "oauth",
        }
    }

    /// Structural check before any request is made.
    pub fn validate(&self, service: &str) -> EngineResult<()> {
        match self {
            AuthStrategy::ApiKey { key } if key.trim().is_empty() => {
                Err(EngineError::auth(service, "API key is empty"))
            }
            AuthStrategy::PersonalToken { token } if token.trim().is_empty() => {
                Err(EngineError::auth(service, "access token is empty"))
            }
            AuthStrategy::OAuth(c) => {
                if c.access_token.trim().is_empty() && c.refresh_token.is_none() {
                    return Err(EngineError::auth(
                        service,
                        "OAuth credentials have neither an access token nor a refresh token",
                    ));
                }
                if c.refresh_token.is_some() && c.client_id.trim().is_empty() {
                    return Err(EngineError::auth(service, "OAuth client_id is missing"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn can_refresh(&self) -> bool {
        matches!(self, AuthStrategy::OAuth(c) if c.refresh_token.is_some())
    }

    /// True when the access token is missing or inside the expiry skew.
    pub fn needs_refresh(&self) -> bool {
        match self {
            AuthStrategy::OAuth(c) if c.refresh_token.is_some() => {
                c.access_token.is_empty()
                    || c.expires_at
                        .map(|exp| exp <= Utc::now() + ChronoDuration::seconds(EXPIRY_SKEW_SECS))
                        .unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Exchange the refresh token for a new access token (OAuth only).
    pub async fn refresh(&mut self, http: &reqwest::Client, service: &str) -> EngineResult<()> {
        let AuthStrategy::OAuth(creds) = self else {
            return Err(EngineError::auth(
                service,
                format!("{} credentials cannot be refreshed", self.kind_name()),
            ));
        };
        let Some(refresh_token) = creds.refresh_token.as_ref() else {
            return Err(EngineError::auth(service, "no refresh token available"));
        };

        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", creds.client_id.as_str()),
        ];
        if let Some(secret) = creds.client_secret.as_ref() {
            form.push(("client_secret", secret.as_str()));
        }

        let resp = http
            .post(&creds.token_endpoint)
            .form(&form)
            .timeout(Duration::from_secs(REFRESH_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| EngineError::auth(service, format!("token refresh failed: {}", e)))?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        if !status.is_success() {
            let reason = body["error_description"]
                .as_str()
                .or_else(|| body["error"].as_str())
                .unwrap_or("no detail");
            warn!("[auth] {} token refresh rejected ({})", service, status);
            return Err(EngineError::auth(
                service,
                format!("token refresh rejected ({}): {}", status.as_u16(), reason),
            ));
        }

        let access_token = body["access_token"]
            .as_str()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| EngineError::auth(service, "refresh response missing access_token"))?;
        let expires_in = body["expires_in"].as_i64().unwrap_or(DEFAULT_EXPIRES_IN_SECS);

        creds.access_token = Zeroizing::new(access_token.to_string());
        creds.expires_at = Some(Utc::now() + ChronoDuration::seconds(expires_in));
        // Some providers rotate the refresh token.
        if let Some(rotated) = body["refresh_token"].as_str().filter(|t| !t.is_empty()) {
            creds.refresh_token = Some(Zeroizing::new(rotated.to_string()));
        }

        info!("[auth] Refreshed {} access token (expires in {}s)", service, expires_in);
        Ok(())
    }

    /// Attach the credential to an outbound request.
    pub fn apply(
        &self,
        request: reqwest::RequestBuilder,
        placement: AuthPlacement,
    ) -> reqwest::RequestBuilder {
        let secret: &str = match self {
            AuthStrategy::ApiKey { key } => key.as_str(),
            AuthStrategy::PersonalToken { token } => token.as_str(),
            AuthStrategy::OAuth(c) => c.access_token.as_str(),
        };
        match placement {
            AuthPlacement::Query(name) => request.query(&[(name, secret)]),
            AuthPlacement::Header(name) => request.header(name, secret),
            AuthPlacement::Bearer => request.bearer_auth(secret),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::MockHttp;

    fn oauth(endpoint: &str, expires_at: Option<DateTime<Utc>>) -> AuthStrategy {
        AuthStrategy::oauth(OAuthCredentials {
            access_token: Zeroizing::new("old-access".into()),
            refresh_token: Some(Zeroizing::new("refresh-1".into())),
            expires_at,
            client_id: "client".into(),
            client_secret: Some(Zeroizing::new("shh".into())),
            token_endpoint: endpoint.into(),
        })
    }

    #[test]
    fn test_validate() {
        assert!(AuthStrategy::api_key("abc").validate("shodan").is_ok());
        let err = AuthStrategy::api_key("  ").validate("shodan").unwrap_err();
        assert!(matches!(err, EngineError::Auth { .. }));
        assert!(AuthStrategy::personal_token("").validate("github").is_err());
        assert!(oauth("http://x", None).validate("gmail").is_ok());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let dbg = format!("{:?}", AuthStrategy::api_key("super-secret"));
        assert!(!dbg.contains("super-secret"));
        let dbg = format!("{:?}", oauth("http://x", None));
        assert!(!dbg.contains("old-access"));
        assert!(!dbg.contains("refresh-1"));
        assert!(!dbg.contains("shh"));
    }

    #[test]
    fn test_needs_refresh() {
        assert!(!AuthStrategy::api_key("k").needs_refresh());
        assert!(!oauth("http://x", None).needs_refresh());
        assert!(oauth("http://x", Some(Utc::now() - ChronoDuration::seconds(5))).needs_refresh());
        assert!(!oauth("http://x", Some(Utc::now() + ChronoDuration::hours(1))).needs_refresh());
    }

    #[tokio::test]
    async fn test_static_credentials_cannot_refresh() {
        let http = reqwest::Client::new();
        let mut key = AuthStrategy::api_key("k");
        assert!(!key.can_refresh());
        let err = key.refresh(&http, "shodan").await.unwrap_err();
        assert!(matches!(err, EngineError::Auth { .. }));
    }

    #[tokio::test]
    async fn test_refresh_updates_token() {
        let mock = MockHttp::start(vec![(
            200,
            r#"{"access_token":"new-access","expires_in":1200,"refresh_token":"refresh-2"}"#.into(),
        )])
        .await;
        let http = reqwest::Client::new();
        let mut strategy = oauth(&format!("{}/token", mock.base_url), None);
        strategy.refresh(&http, "gmail").await.unwrap();

        let AuthStrategy::OAuth(c) = &strategy else { panic!("not oauth") };
        assert_eq!(c.access_token.as_str(), "new-access");
        assert_eq!(c.refresh_token.as_ref().unwrap().as_str(), "refresh-2");
        assert!(c.expires_at.unwrap() > Utc::now());

        let reqs = mock.requests();
        assert_eq!(reqs[0].method, "POST");
        assert_eq!(reqs[0].path, "/token");
        assert!(reqs[0].body.contains("grant_type=refresh_token"));
        assert!(reqs[0].body.contains("refresh_token=refresh-1"));
    }

    #[tokio::test]
    async fn test_refresh_rejected() {
        let mock = MockHttp::start(vec![(400, r#"{"error":"invalid_grant"}"#.into())]).await;
        let http = reqwest::Client::new();
        let mut strategy = oauth(&format!("{}/token", mock.base_url), None);
        let err = strategy.refresh(&http, "gmail").await.unwrap_err();
        assert!(matches!(err, EngineError::Auth { .. }));
        assert!(err.to_string().contains("invalid_grant"));
        assert!(!err.to_string().contains("refresh-1"));
    }
}
