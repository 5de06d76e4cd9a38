use crate::error::ApiError;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// A SensorPush access token and the instant after which it should no longer
/// be handed out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    value: String,
    refresh_at: Instant,
}

impl Token {
    fn issued(value: String, ttl: Duration) -> Self {
        let skew = EXPIRY_SKEW.min(ttl / 2);
        Self {
            value,
            refresh_at: Instant::now() + ttl.saturating_sub(skew),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    fn is_fresh(&self) -> bool {
        Instant::now() < self.refresh_at
    }
}

#[derive(Serialize)]
struct AuthorizeRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthorizeResponse {
    authorization: String,
}

#[derive(Serialize)]
struct AccessTokenRequest<'a> {
    authorization: &'a str,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    accesstoken: String,
}

/// Obtains and caches SensorPush access tokens. The cache lock is held while
/// refreshing, so concurrent callers wait for one refresh instead of racing.
pub struct CredentialProvider {
    http: Client,
    base_url: String,
    email: String,
    password: String,
    ttl: Duration,
    cached: Mutex<Option<Token>>,
}

impl CredentialProvider {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            email: email.into(),
            password: password.into(),
            ttl,
            cached: Mutex::new(None),
        }
    }

    pub async fn get_token(&self) -> Result<Token, ApiError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|token| token.is_fresh()) {
            return Ok(token.clone());
        }
        let token = self.authenticate().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Drops `stale` from the cache after the upstream rejected it. A token
    /// that another caller already replaced is left alone.
    pub async fn invalidate(&self, stale: &Token) {
        let mut cached = self.cached.lock().await;
        if cached.as_ref() == Some(stale) {
            *cached = None;
        }
    }

    #[tracing::instrument(name = "authenticate", skip(self))]
    async fn authenticate(&self) -> Result<Token, ApiError> {
        let AuthorizeResponse { authorization } = self
            .post(
                "oauth/authorize",
                &AuthorizeRequest {
                    email: &self.email,
                    password: &self.password,
                },
            )
            .await?;
        let AccessTokenResponse { accesstoken } = self
            .post(
                "oauth/accesstoken",
                &AccessTokenRequest {
                    authorization: &authorization,
                },
            )
            .await?;
        tracing::debug!("obtained SensorPush access token");
        Ok(Token::issued(accesstoken, self.ttl))
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .http
            .post(format!("{}/{}", self.base_url, path))
            .header("accept", "application/json")
            .json(body)
            .send()
            .await
            .map_err(ApiError::from_transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => ApiError::Unauthorized(body),
                code => ApiError::from_status(code, body, None),
            });
        }
        response.json::<T>().await.map_err(ApiError::from_transport)
    }
}
