use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::fallback;
use super::{CompletionClient, CompletionError, FragmentStream};

/// 応答生成エンドポイントへ書き起こしを POST するクライアント
pub struct HttpCompletionClient {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
}

impl HttpCompletionClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, CompletionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CompletionError::Request(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn send(&self, transcript: &str) -> Result<FragmentStream, CompletionError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .json(&ChatRequest {
                message: transcript,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CompletionError::Timeout(self.timeout)
                } else {
                    CompletionError::Request(format!("HTTP request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            if fallback::is_quota_exhausted(&body) {
                log::warn!("Completion quota exhausted, answering with a canned reply");
                return Ok(FragmentStream::canned(fallback::canned_reply(transcript)));
            }
            log::error!("Completion endpoint returned {}: {}", status, body);
            return Err(CompletionError::Status { status, body });
        }

        Ok(FragmentStream::from_response(response))
    }

    fn name(&self) -> &str {
        "http"
    }
}
