//! Action sinks: how the gateway requests platform-level effects.

use serde::Serialize;
use std::time::Duration;

use warden_types::{ActionError, ActionRequest, ActionSink};

/// `ActionSink` calling the upstream platform bot API over HTTPS.
///
/// The endpoint is expected to be idempotent per (tenant, subject, actor,
/// action, reverse) — re-applying an active restriction or lifting an
/// already-lifted one succeeds — which is what makes the gateway's retries
/// and expiry/reversal races safe.
pub struct HttpActionSink {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct ActionBody<'a> {
    subject_id: &'a str,
    actor_id: Option<&'a str>,
    action: &'a str,
    duration_secs: Option<u64>,
    reverse: bool,
}

impl HttpActionSink {
    pub fn new(base_url: String, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl ActionSink for HttpActionSink {
    async fn execute(&self, request: &ActionRequest) -> Result<(), ActionError> {
        let url = format!("{}/tenants/{}/actions", self.base_url, request.tenant_id);
        let body = ActionBody {
            subject_id: &request.subject_id,
            actor_id: request.actor_id.as_deref(),
            action: request.action.as_str(),
            duration_secs: request.duration.map(|d| d.as_secs()),
            reverse: request.reverse,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| ActionError::Retryable(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let detail = format!(
            "{} responded {} for {}",
            url,
            status,
            request.action.as_str()
        );
        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            Err(ActionError::Retryable(detail))
        } else {
            Err(ActionError::Fatal(detail))
        }
    }
}

/// `ActionSink` that logs instead of calling anything.
///
/// The default when no platform API is configured, so a development
/// gateway detects and records abuse without platform side effects.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogActionSink;

#[async_trait::async_trait]
impl ActionSink for LogActionSink {
    async fn execute(&self, request: &ActionRequest) -> Result<(), ActionError> {
        tracing::info!(
            tenant_id = %request.tenant_id,
            subject_id = %request.subject_id,
            actor_id = request.actor_id.as_deref().unwrap_or("-"),
            action = request.action.as_str(),
            reverse = request.reverse,
            "platform action (log-only sink)"
        );
        Ok(())
    }
}
