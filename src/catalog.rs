use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const OUTBOUND_TIMEOUT: StdDuration = StdDuration::from_secs(10);
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;
const EXPIRY_MARGIN_SECS: i64 = 30;
const CATALOG_PATH: &str = "/properties/internal";

/// Source of raw catalog records.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_catalog(&self, page: u32, limit: u32) -> AppResult<Vec<Value>>;
}

#[derive(Clone)]
struct CachedToken {
    access_token: SecretString,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn new(access_token: String, expires_in: u64) -> AppResult<Self> {
        let expires_at = i64::try_from(expires_in)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| {
                AppError::Upstream(format!("token expires_in out of range: {expires_in}"))
            })?;
        Ok(Self {
            access_token: SecretString::from(access_token),
            expires_at,
        })
    }

    fn is_fresh(&self) -> bool {
        Utc::now() < self.expires_at - Duration::seconds(EXPIRY_MARGIN_SECS)
    }
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    audience: Option<&'a str>,
    grant_type: &'static str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

/// Client-credentials exchange that reuses its token until shortly before expiry.
pub struct CredentialExchange {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
    audience: Option<String>,
    cached: AsyncMutex<Option<CachedToken>>,
}

impl CredentialExchange {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
        audience: Option<String>,
    ) -> AppResult<Self> {
        Ok(Self {
            http: Client::builder().timeout(OUTBOUND_TIMEOUT).build()?,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
            audience,
            cached: AsyncMutex::new(None),
        })
    }

    pub fn maybe_from_config(config: &AppConfig) -> AppResult<Option<Self>> {
        let (Some(token_url), Some(client_id), Some(secret)) = (
            config.token_url(),
            config.auth0_client_id.clone(),
            config.auth0_client_secret.clone(),
        ) else {
            return Ok(None);
        };
        Self::new(token_url, client_id, secret, config.auth0_audience.clone()).map(Some)
    }

    pub async fn bearer_token(&self) -> AppResult<SecretString> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|token| token.is_fresh()) {
            return Ok(token.access_token.clone());
        }

        let token = self.exchange().await?;
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }

    async fn exchange(&self) -> AppResult<CachedToken> {
        let body = TokenRequest {
            client_id: &self.client_id,
            client_secret: self.client_secret.expose_secret(),
            audience: self.audience.as_deref(),
            grant_type: "client_credentials",
        };
        let response = self
            .http
            .post(&self.token_url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let success: TokenResponse = response.json().await?;
        let expires_in = success.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        debug!(expires_in, "exchanged client credentials for access token");
        CachedToken::new(success.access_token, expires_in)
    }
}

/// Internal properties API.
pub struct CatalogClient {
    http: Client,
    base_url: String,
    credentials: Option<CredentialExchange>,
}

impl CatalogClient {
    pub fn new(base_url: &str, credentials: Option<CredentialExchange>) -> AppResult<Self> {
        Ok(Self {
            http: Client::builder().timeout(OUTBOUND_TIMEOUT).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let credentials = CredentialExchange::maybe_from_config(config)?;
        if credentials.is_none() {
            info!("catalog credentials not configured; requests will be unauthenticated");
        }
        Self::new(&config.properties_api_base_url, credentials)
    }
}

#[async_trait]
impl CatalogSource for CatalogClient {
    async fn fetch_catalog(&self, page: u32, limit: u32) -> AppResult<Vec<Value>> {
        let mut request = self
            .http
            .get(format!("{}{CATALOG_PATH}", self.base_url))
            .query(&[("page", page), ("limit", limit)]);
        if let Some(credentials) = &self.credentials {
            let token = credentials.bearer_token().await?;
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Upstream(format!(
                "catalog request returned {status}"
            )));
        }

        let records = extract_records(response.json().await?)?;
        debug!(page, limit, count = records.len(), "fetched catalog page");
        Ok(records)
    }
}

fn extract_records(body: Value) -> AppResult<Vec<Value>> {
    match body {
        Value::Array(records) => Ok(records),
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(records)) => Ok(records),
            Some(_) => Err(AppError::Upstream(
                "catalog `results` field is not a list".into(),
            )),
            None => Err(AppError::Upstream(
                "catalog response has no `results` list".into(),
            )),
        },
        _ => Err(AppError::Upstream("catalog response is not a list".into())),
    }
}
