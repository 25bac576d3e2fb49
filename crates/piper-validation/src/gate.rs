use std::sync::Arc;

use piper_core::{RenderedResource, ValidationOutcome};
use tokio::sync::Semaphore;

use crate::endpoint::{EndpointResponse, ValidationEndpoint};
use crate::error::{GateError, TransportError};
use crate::operation_outcome::parse_issues;
use crate::retry::RetryPolicy;

/// Decides Valid or Invalid for one rendered resource.
///
/// Transport failures are retried with backoff and never turn into an
/// Invalid outcome. The gate keeps no state between calls, so one instance
/// serves every validation worker.
#[derive(Clone)]
pub struct ValidationGate {
    endpoint: Arc<dyn ValidationEndpoint>,
    retry: RetryPolicy,
}

impl ValidationGate {
    pub fn new(endpoint: Arc<dyn ValidationEndpoint>, retry: RetryPolicy) -> Self {
        Self { endpoint, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn validate(&self, resource: &RenderedResource) -> Result<ValidationOutcome, GateError> {
        self.validate_inner(resource, None).await
    }

    /// Like [`validate`](Self::validate), but every attempt holds a permit
    /// from `slots`. Backoff sleeps run without one.
    pub async fn validate_within(
        &self,
        resource: &RenderedResource,
        slots: &Semaphore,
    ) -> Result<ValidationOutcome, GateError> {
        self.validate_inner(resource, Some(slots)).await
    }

    async fn validate_inner(
        &self,
        resource: &RenderedResource,
        slots: Option<&Semaphore>,
    ) -> Result<ValidationOutcome, GateError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = {
                let _slot = match slots {
                    Some(slots) => Some(slots.acquire().await.map_err(|_| {
                        GateError::TransportRejected(TransportError::rejected(
                            "Validation slots closed",
                        ))
                    })?),
                    None => None,
                };
                self.endpoint
                    .submit(&resource.resource_kind, &resource.document)
                    .await
            };

            match result {
                Ok(response) => return classify(resource, response),
                Err(e) if !e.retryable => {
                    tracing::warn!(
                        resource = %resource.reference(),
                        error = %e,
                        "Validation request rejected"
                    );
                    return Err(GateError::TransportRejected(e));
                }
                Err(e) if attempt >= self.retry.max_attempts => {
                    tracing::warn!(
                        resource = %resource.reference(),
                        attempts = attempt,
                        error = %e,
                        "Validation retries exhausted"
                    );
                    return Err(GateError::TransportExhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = self.retry.delay_for(attempt, e.retry_after);
                    tracing::warn!(
                        resource = %resource.reference(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Validation transport failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for ValidationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationGate")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn classify(
    resource: &RenderedResource,
    response: EndpointResponse,
) -> Result<ValidationOutcome, GateError> {
    let issues = response
        .operation_outcome
        .as_ref()
        .map(parse_issues)
        .unwrap_or_default();
    let success = response.is_success();
    let status = response.status;
    let outcome = ValidationOutcome::from_issues(resource.reference(), issues, response.operation_outcome);

    if !success && outcome.is_valid() {
        return Err(GateError::TransportRejected(
            TransportError::rejected(format!(
                "HTTP {status} without blocking issues"
            ))
            .with_status(status),
        ));
    }

    tracing::debug!(
        resource = %resource.reference(),
        status = ?outcome.status,
        issues = outcome.issues.len(),
        "Resource validated"
    );
    Ok(outcome)
}
