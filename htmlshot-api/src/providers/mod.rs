//! Origin Service Collaborators
//!
//! HTTP implementations of the collaborator traits from `htmlshot-core`.
//! Templates, quota verdicts and usage accounting all live in the origin
//! service; this client reaches them over its internal REST surface:
//!
//! | trait              | request                                   |
//! |--------------------|-------------------------------------------|
//! | `TemplateProvider` | `GET  /v1/internal/templates/{id}`        |
//! | `QuotaDecision`    | `GET  /v1/internal/quota/{userId}`        |
//! | `UsageSink`        | `POST /v1/internal/usage`                 |
//!
//! The quota decision can also be answered by the local auth replica; see
//! `QuotaSource` in the config module.

use async_trait::async_trait;
use htmlshot_core::{
    QuotaDecision, QuotaVerdict, Template, TemplateProvider, UpstreamError, UsageEvent, UsageSink,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};

use crate::config::OriginConfig;

const TEMPLATES_PATH: &str = "/v1/internal/templates";
const QUOTA_PATH: &str = "/v1/internal/quota";
const USAGE_PATH: &str = "/v1/internal/usage";

fn request_error(err: reqwest::Error) -> UpstreamError {
    if err.is_decode() {
        UpstreamError::Decode {
            reason: err.to_string(),
        }
    } else if let Some(status) = err.status() {
        UpstreamError::Status {
            status: status.as_u16(),
        }
    } else {
        UpstreamError::Request {
            reason: err.to_string(),
        }
    }
}

fn build_auth_headers(token: Option<&SecretString>) -> Result<HeaderMap, UpstreamError> {
    let mut headers = HeaderMap::new();
    if let Some(token) = token {
        let value = format!("Bearer {}", token.expose_secret());
        let mut value = HeaderValue::from_str(&value).map_err(|e| UpstreamError::Request {
            reason: format!("invalid service token: {}", e),
        })?;
        value.set_sensitive(true);
        headers.insert(HeaderName::from_static("authorization"), value);
    }
    Ok(headers)
}

/// Client for the origin service's internal endpoints.
#[derive(Clone)]
pub struct OriginClient {
    client: reqwest::Client,
    base_url: String,
    auth_header: HeaderMap,
}

impl OriginClient {
    pub fn new(config: &OriginConfig) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(request_error)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_header: build_auth_headers(config.service_token.as_ref())?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str, segment: Option<&str>) -> String {
        match segment {
            Some(segment) => format!(
                "{}{}/{}",
                self.base_url,
                path,
                urlencoding::encode(segment)
            ),
            None => format!("{}{}", self.base_url, path),
        }
    }

    async fn get_json<T>(&self, url: String) -> Result<Option<T>, UpstreamError>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .client
            .get(url)
            .headers(self.auth_header.clone())
            .send()
            .await
            .map_err(request_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(UpstreamError::Status {
                status: response.status().as_u16(),
            });
        }
        response.json::<T>().await.map(Some).map_err(request_error)
    }
}

impl std::fmt::Debug for OriginClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &!self.auth_header.is_empty())
            .finish()
    }
}

#[async_trait]
impl TemplateProvider for OriginClient {
    async fn fetch_template(&self, template_id: &str) -> Result<Option<Template>, UpstreamError> {
        self.get_json(self.url(TEMPLATES_PATH, Some(template_id)))
            .await
    }
}

#[async_trait]
impl QuotaDecision for OriginClient {
    async fn check_quota(&self, user_id: &str) -> Result<QuotaVerdict, UpstreamError> {
        // An unknown user has no quota row; treat it like the replica does.
        Ok(self
            .get_json::<QuotaVerdict>(self.url(QUOTA_PATH, Some(user_id)))
            .await?
            .unwrap_or_else(|| {
                QuotaVerdict::deny("QUOTA_EXCEEDED", "No quota on record").with_status(429)
            }))
    }
}

#[async_trait]
impl UsageSink for OriginClient {
    async fn record(&self, event: UsageEvent) -> Result<(), UpstreamError> {
        let response = self
            .client
            .post(self.url(USAGE_PATH, None))
            .headers(self.auth_header.clone())
            .json(&event)
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            return Err(UpstreamError::Status {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuotaSource;
    use std::time::Duration;

    fn config(base_url: &str, token: Option<&str>) -> OriginConfig {
        OriginConfig {
            base_url: base_url.to_string(),
            service_token: token.map(|t| SecretString::new(t.into())),
            timeout: Duration::from_secs(1),
            quota_source: QuotaSource::Origin,
        }
    }

    #[test]
    fn test_urls_encode_segments() -> Result<(), UpstreamError> {
        let client = OriginClient::new(&config("http://origin.local/", None))?;
        assert_eq!(client.base_url(), "http://origin.local");
        assert_eq!(
            client.url(TEMPLATES_PATH, Some("a b/c")),
            "http://origin.local/v1/internal/templates/a%20b%2Fc"
        );
        assert_eq!(
            client.url(USAGE_PATH, None),
            "http://origin.local/v1/internal/usage"
        );
        Ok(())
    }

    #[test]
    fn test_service_token_header() -> Result<(), UpstreamError> {
        let headers = build_auth_headers(Some(&SecretString::new("svc-token".into())))?;
        let value = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        assert_eq!(value.as_deref(), Some("Bearer svc-token"));

        assert!(build_auth_headers(None)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_debug_hides_token() -> Result<(), UpstreamError> {
        let client = OriginClient::new(&config("http://origin.local", Some("svc-token")))?;
        let debug = format!("{:?}", client);
        assert!(!debug.contains("svc-token"));
        Ok(())
    }
}
