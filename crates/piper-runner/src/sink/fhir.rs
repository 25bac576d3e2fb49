use std::time::Duration;

use async_trait::async_trait;
use piper_core::RenderedResource;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use url::Url;

use super::{LoadError, LoadResult, LoadSink};

const FHIR_JSON: &str = "application/fhir+json";

/// Loads documents into a FHIR server, one request per document.
///
/// Documents with an `id` are upserted with `PUT {base}/{type}/{id}`; the
/// rest are created with `POST {base}/{type}`. A document that cannot be
/// delivered is reported as rejected and the batch moves on.
#[derive(Debug, Clone)]
pub struct FhirServerSink {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl FhirServerSink {
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, LoadError> {
        Url::parse(base_url)
            .map_err(|e| LoadError::InvalidDestination(format!("{base_url}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LoadError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, url);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        req.header(ACCEPT, FHIR_JSON)
            .header(CONTENT_TYPE, FHIR_JSON)
    }

    async fn load_one(&self, resource: &RenderedResource) -> Result<LoadResult, LoadError> {
        let reference = resource.reference();
        let body: Value = resource.to_json()?;

        let req = match body.get("id").and_then(Value::as_str) {
            Some(id) => self.request(
                reqwest::Method::PUT,
                &format!("{}/{}/{}", self.base_url, resource.resource_kind, id),
            ),
            None => self.request(
                reqwest::Method::POST,
                &format!("{}/{}", self.base_url, resource.resource_kind),
            ),
        };

        let resp = req
            .body(resource.document.clone())
            .send()
            .await
            .map_err(|e| LoadError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            tracing::debug!(resource = %reference, status = status.as_u16(), "Resource loaded");
            return Ok(LoadResult::accepted(reference));
        }

        let text = resp.text().await.unwrap_or_default();
        Ok(LoadResult::rejected(
            reference,
            format!("HTTP {status}: {}", diagnostics(&text)),
        ))
    }
}

#[async_trait]
impl LoadSink for FhirServerSink {
    async fn load(&self, documents: &[RenderedResource]) -> Result<Vec<LoadResult>, LoadError> {
        let mut results = Vec::with_capacity(documents.len());
        for resource in documents {
            let result = match self.load_one(resource).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(resource = %resource.reference(), error = %e, "Resource not loaded");
                    LoadResult::rejected(resource.reference(), e.to_string())
                }
            };
            results.push(result);
        }
        Ok(results)
    }
}

/// Server diagnostics from an `OperationOutcome` body, or the raw body.
fn diagnostics(body: &str) -> String {
    let from_outcome = serde_json::from_str::<Value>(body).ok().and_then(|json| {
        let issues = json.get("issue")?.as_array()?;
        let messages: Vec<&str> = issues
            .iter()
            .filter_map(|i| {
                i.get("diagnostics")
                    .or_else(|| i.get("details").and_then(|d| d.get("text")))
                    .and_then(Value::as_str)
            })
            .collect();
        (!messages.is_empty()).then(|| messages.join("; "))
    });
    from_outcome.unwrap_or_else(|| body.chars().take(200).collect())
}
