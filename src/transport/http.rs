use super::{GenerationQuery, Subscription, SubscriptionHandle, SseDecoder, TransportAdapter};
use crate::error::{TrackerError, TrackerResult};
use crate::model::{ChangeEvent, GenerationRecord, RegistryEvent, StatusResponse};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Connection settings for [`HttpTransport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub base_url: String,
    /// Per-request timeout; not applied to the push stream.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub user_agent: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            request_timeout: Duration::from_secs(30),
            user_agent: format!("genrun/{}", env!("CARGO_PKG_VERSION")),
            bearer_token: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// REST + server-sent-events transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: Client,
    base_url: Url,
    request_timeout: Duration,
    bearer_token: Option<String>,
}

impl HttpTransport {
    pub fn new(cfg: &ClientConfig) -> TrackerResult<Self> {
        let mut base = cfg.base_url.clone();
        // Url::join replaces the last segment unless the base ends with '/'.
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| TrackerError::invalid_response("base_url", e.to_string()))?;
        let http = Client::builder().user_agent(&cfg.user_agent).build()?;
        Ok(Self {
            http,
            base_url,
            request_timeout: cfg.request_timeout,
            bearer_token: cfg.bearer_token.clone(),
        })
    }

    fn url(&self, path: &str) -> TrackerResult<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| TrackerError::invalid_response("url", format!("{path}: {e}")))
    }

    /// `workflow/{run_id}` with the id percent-encoded as one path segment.
    fn run_url(&self, run_id: &str) -> TrackerResult<Url> {
        let mut url = self.url("workflow")?;
        url.path_segments_mut()
            .map_err(|()| TrackerError::invalid_response("url", "base URL cannot hold a path"))?
            .push(run_id);
        Ok(url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.bearer_token.as_deref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn handle_response<T>(response: reqwest::Response, operation: &str) -> TrackerResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let status = response.status();
        if status.is_success() {
            let body = response.json::<T>().await?;
            debug!(operation, "request succeeded");
            return Ok(body);
        }
        Err(Self::api_error(response, operation).await)
    }

    async fn api_error(response: reqwest::Response, operation: &str) -> TrackerError {
        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|b| b.error)
            .unwrap_or(text);
        error!(status = %status, error = %message, operation, "request failed");
        TrackerError::api_error(status.as_u16(), message)
    }
}

#[async_trait]
impl TransportAdapter for HttpTransport {
    fn transport_name(&self) -> &'static str {
        "http"
    }

    async fn submit(&self, endpoint: &str, body: Value) -> TrackerResult<Value> {
        let url = self.url(endpoint)?;
        debug!(url = %url, "submitting generation");
        let response = self
            .authorize(self.http.post(url))
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await?;
        Self::handle_response(response, "submit").await
    }

    async fn run_status(&self, run_id: &str) -> TrackerResult<StatusResponse> {
        let url = self.run_url(run_id)?;
        let response = self
            .authorize(self.http.get(url))
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::handle_response(response, "run_status").await
    }

    async fn cancel_run(&self, run_id: &str) -> TrackerResult<()> {
        let url = self.run_url(run_id)?;
        let response = self
            .authorize(self.http.delete(url))
            .timeout(self.request_timeout)
            .send()
            .await?;
        if response.status().is_success() {
            info!(run_id, "cancelled run");
            Ok(())
        } else {
            Err(Self::api_error(response, "cancel_run").await)
        }
    }

    async fn list_generations(
        &self,
        query: &GenerationQuery,
    ) -> TrackerResult<Vec<GenerationRecord>> {
        let mut url = self.url("generations")?;
        url.query_pairs_mut()
            .append_pair("userId", &query.user_id)
            .append_pair("workflowTypes", &query.workflow_types.join(","))
            .append_pair("includeCompleted", &query.include_completed.to_string())
            .append_pair("limit", &query.limit.to_string());
        let response = self
            .authorize(self.http.get(url))
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::handle_response(response, "list_generations").await
    }

    async fn subscribe(&self, user_id: &str) -> TrackerResult<Subscription> {
        let mut url = self.url("generations/events")?;
        url.query_pairs_mut().append_pair("userId", user_id);
        let response = self
            .authorize(self.http.get(url))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response, "subscribe").await);
        }

        let (tx, rx) = mpsc::unbounded_channel::<RegistryEvent>();
        let user = user_id.to_string();
        let task = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = stream.next().await {
                let chunk: bytes::Bytes = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(user_id = %user, error = %e, "push stream failed");
                        break;
                    }
                };
                for data in decoder.push(&chunk) {
                    let parsed = serde_json::from_str::<ChangeEvent>(&data)
                        .map_err(TrackerError::from)
                        .and_then(RegistryEvent::try_from);
                    match parsed {
                        Ok(ev) => {
                            if tx.send(ev).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "skipping malformed push event"),
                    }
                }
            }
            debug!(user_id = %user, "push stream ended");
        });

        Ok(Subscription {
            events: rx,
            handle: SubscriptionHandle::from_task(task),
        })
    }
}
