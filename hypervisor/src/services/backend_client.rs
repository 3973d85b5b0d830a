//! HTTP client forwarding inference requests to the backend process

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use shared::{process_debug, InferenceRequest, ProcessId, Settings, WorkerId};

use crate::error::{HypervisorError, HypervisorResult};
use crate::traits::InferenceBackend;

/// Header telling the backend which worker slot issued the call
pub const WORKER_HEADER: &str = "X-Station-Worker";

/// Posts `payload` to `http://127.0.0.1:<backend_port>/v1/<function>`
///
/// The port is read from the settings on every call so a restart on a new
/// port is picked up without rebuilding the client.
pub struct HttpInferenceBackend {
    client: reqwest::Client,
    settings: watch::Receiver<Settings>,
    base_url: Option<String>,
}

impl HttpInferenceBackend {
    pub fn new(settings: watch::Receiver<Settings>) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
            base_url: None,
        }
    }

    /// Use a fixed base URL instead of the configured backend port
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    fn url(&self, function: &str) -> String {
        let base = match &self.base_url {
            Some(base) => base.clone(),
            None => format!("http://127.0.0.1:{}", self.settings.borrow().backend_port),
        };
        format!("{}/v1/{}", base, function)
    }

    async fn send(&self, worker: WorkerId, request: InferenceRequest) -> HypervisorResult<Value> {
        let url = self.url(&request.function);
        let mut call = self
            .client
            .post(&url)
            .header(WORKER_HEADER, worker.0.to_string())
            .json(&request.payload);
        if let Some(timeout) = request.timeout() {
            call = call.timeout(timeout);
        }

        let response = call.send().await.map_err(|e| {
            if e.is_connect() {
                HypervisorError::NotRunning
            } else {
                HypervisorError::from(e)
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HypervisorError::backend(format!("HTTP {}: {}", status, body.trim())));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl InferenceBackend for HttpInferenceBackend {
    async fn infer(&self, worker: WorkerId, request: InferenceRequest, cancel: CancellationToken) -> HypervisorResult<Value> {
        let function = request.function.clone();
        tokio::select! {
            result = self.send(worker, request) => result,
            _ = cancel.cancelled() => {
                process_debug!(ProcessId::current(), "✂️ {} cancelled {} call", worker, function);
                Err(HypervisorError::backend("cancelled"))
            }
        }
    }
}
