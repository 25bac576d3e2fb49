//! Validation endpoints.
//!
//! The gate only needs "submit this document, tell me what came back". The
//! HTTP implementation talks to a FHIR server's `$validate` operation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use serde_json::Value;
use url::Url;

use crate::error::{EndpointConfigError, TransportError};
use crate::operation_outcome::is_operation_outcome;

const FHIR_JSON: &str = "application/fhir+json";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ERROR_BODY: usize = 200;

/// What the endpoint answered for one submission.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointResponse {
    pub status: u16,
    /// The `OperationOutcome` body, if the endpoint returned one.
    pub operation_outcome: Option<Value>,
}

impl EndpointResponse {
    pub fn new(status: u16, operation_outcome: Option<Value>) -> Self {
        Self {
            status,
            operation_outcome,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Something that can check a rendered document against an implementation guide.
#[async_trait]
pub trait ValidationEndpoint: Send + Sync {
    /// Submit one document of the given resource kind. One call is one attempt.
    async fn submit(&self, resource_kind: &str, document: &str)
    -> Result<EndpointResponse, TransportError>;
}

/// Settings for [`HttpValidationEndpoint`].
#[derive(Debug, Clone)]
pub struct HttpEndpointConfig {
    pub base_url: String,
    /// Profile canonical URL passed as the `profile` query parameter.
    pub profile: Option<String>,
    pub timeout: Duration,
    pub auth_token: Option<String>,
}

impl HttpEndpointConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            profile: None,
            timeout: DEFAULT_TIMEOUT,
            auth_token: None,
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// `$validate` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpValidationEndpoint {
    http: reqwest::Client,
    base_url: String,
    profile: Option<String>,
    auth_token: Option<String>,
}

impl HttpValidationEndpoint {
    pub fn new(config: HttpEndpointConfig) -> Result<Self, EndpointConfigError> {
        let parsed = Url::parse(&config.base_url).map_err(|e| EndpointConfigError::InvalidUrl {
            url: config.base_url.clone(),
            message: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EndpointConfigError::InvalidUrl {
                url: config.base_url,
                message: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        let http = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            profile: config.profile,
            auth_token: config.auth_token,
        })
    }

    fn validate_url(&self, resource_kind: &str) -> String {
        format!("{}/{}/$validate", self.base_url, resource_kind)
    }
}

#[async_trait]
impl ValidationEndpoint for HttpValidationEndpoint {
    async fn submit(
        &self,
        resource_kind: &str,
        document: &str,
    ) -> Result<EndpointResponse, TransportError> {
        let mut req = self
            .http
            .post(self.validate_url(resource_kind))
            .header(CONTENT_TYPE, FHIR_JSON)
            .header(ACCEPT, FHIR_JSON)
            .body(document.to_owned());
        if let Some(profile) = &self.profile {
            req = req.query(&[("profile", profile)]);
        }
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let retry_after = parse_retry_after(resp.headers());
        let body = resp.text().await?;

        if is_retryable_status(status) {
            return Err(TransportError::retryable(format!(
                "HTTP {status} from validation endpoint"
            ))
            .with_status(status.as_u16())
            .with_retry_after(retry_after));
        }

        let operation_outcome = serde_json::from_str::<Value>(&body)
            .ok()
            .filter(is_operation_outcome);

        if status.is_success() || operation_outcome.is_some() {
            return Ok(EndpointResponse::new(status.as_u16(), operation_outcome));
        }

        Err(
            TransportError::rejected(format!("HTTP {status}: {}", truncate(&body)))
                .with_status(status.as_u16()),
        )
    }
}

/// Timeouts, throttling and server-side failures are worth another attempt.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

/// `Retry-After` in delay-seconds form. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_rejects_bad_base_url() {
        assert!(HttpValidationEndpoint::new(HttpEndpointConfig::new("not a url")).is_err());
        assert!(HttpValidationEndpoint::new(HttpEndpointConfig::new("ftp://fhir.example")).is_err());
    }

    #[test]
    fn test_validate_url_trims_trailing_slash() {
        let endpoint =
            HttpValidationEndpoint::new(HttpEndpointConfig::new("http://fhir.example/fhir/")).unwrap();
        assert_eq!(
            endpoint.validate_url("Patient"),
            "http://fhir.example/fhir/Patient/$validate"
        );
    }
}
