//! 応答生成エンドポイント (`POST /api/chat`)
//!
//! 書き起こしを上流の chat-completions API に中継し、
//! 応答をフラグメント行のストリーム形式で返す。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use vl_core::infra::completion::encode_fragment_line;
use vl_core::infra::completion::fallback;

use crate::HostError;

pub const DEFAULT_UPSTREAM_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

const SYSTEM_PROMPT: &str = "You are a helpful voice assistant. Keep responses concise and conversational, suitable for speech synthesis. Limit responses to 2-3 sentences maximum.";
const MAX_TOKENS: u32 = 100;
const TEMPERATURE: f32 = 0.7;
const EMPTY_REPLY: &str = "I'm sorry, I couldn't generate a response.";

/// 中継サーバー設定
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub api_key: Option<String>,
    pub upstream_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

struct RelayState {
    config: RelayConfig,
    client: reqwest::Client,
}

/// ルーターを組み立てる
pub fn router(config: RelayConfig) -> Result<Router, HostError> {
    let client = reqwest::Client::builder()
        .timeout(config.timeout)
        .build()
        .map_err(|e| HostError::Relay(format!("Failed to create HTTP client: {e}")))?;
    let state = Arc::new(RelayState { config, client });
    Ok(Router::new()
        .route("/api/chat", post(chat))
        .with_state(state))
}

/// 指定アドレスで待ち受ける
pub async fn serve(addr: SocketAddr, config: RelayConfig) -> Result<(), HostError> {
    if config.api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY is not set; /api/chat will answer 500");
    }
    let app = router(config)?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "completion relay listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Serialize)]
struct UpstreamMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct UpstreamRequest<'a> {
    model: &'a str,
    messages: [UpstreamMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct UpstreamResponse {
    #[serde(default)]
    choices: Vec<UpstreamChoice>,
}

#[derive(Deserialize)]
struct UpstreamChoice {
    message: Option<UpstreamReply>,
}

#[derive(Deserialize)]
struct UpstreamReply {
    content: Option<String>,
}

async fn chat(State(state): State<Arc<RelayState>>, body: Bytes) -> Result<Response, ChatError> {
    let request: serde_json::Value =
        serde_json::from_slice(&body).map_err(|e| ChatError::Internal(e.to_string()))?;

    let message = match request.get("message").and_then(|m| m.as_str()) {
        Some(m) if !m.trim().is_empty() => m.to_string(),
        _ => return Err(ChatError::MissingMessage),
    };
    tracing::debug!(message = %message, "chat request");

    let api_key = state
        .config
        .api_key
        .as_deref()
        .ok_or(ChatError::MissingApiKey)?;

    let upstream = state
        .client
        .post(&state.config.upstream_url)
        .bearer_auth(api_key)
        .json(&UpstreamRequest {
            model: &state.config.model,
            messages: [
                UpstreamMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                UpstreamMessage {
                    role: "user",
                    content: &message,
                },
            ],
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
        })
        .send()
        .await
        .map_err(|e| ChatError::Internal(e.to_string()))?;

    if !upstream.status().is_success() {
        let status = upstream.status();
        let body = upstream.text().await.unwrap_or_default();
        tracing::error!(%status, body = %body, "upstream completion failed");
        if fallback::is_quota_exhausted(&body) {
            tracing::info!("quota exhausted, answering with a canned reply");
            return Ok(fragment_response(&fallback::canned_reply(&message)));
        }
        return Err(ChatError::Upstream);
    }

    let data: UpstreamResponse = upstream
        .json()
        .await
        .map_err(|e| ChatError::Internal(e.to_string()))?;
    let reply = data
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| EMPTY_REPLY.to_string());
    tracing::info!(reply = %reply, "upstream reply");

    Ok(fragment_response(&reply))
}

fn fragment_response(text: &str) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        encode_fragment_line(text),
    )
        .into_response()
}

/// Chat endpoint errors
#[derive(Debug)]
enum ChatError {
    MissingMessage,
    MissingApiKey,
    Upstream,
    Internal(String),
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<String>,
        }

        let (status, error, details) = match self {
            Self::MissingMessage => (StatusCode::BAD_REQUEST, "Message is required", None),
            Self::MissingApiKey => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "OpenAI API key not configured",
                None,
            ),
            Self::Upstream => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "OpenAI API request failed",
                None,
            ),
            Self::Internal(e) => {
                tracing::error!("chat request failed: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to process chat request",
                    Some(e),
                )
            }
        };

        (status, Json(ErrorResponse { error, details })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vl_core::infra::completion::FragmentDecoder;

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// 固定の応答を返す上流
    async fn upstream(status: StatusCode, body: &'static str) -> String {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move |Json(req): Json<serde_json::Value>| async move {
                assert_eq!(req["model"], DEFAULT_MODEL);
                assert_eq!(req["max_tokens"], 100);
                assert_eq!(req["messages"][0]["role"], "system");
                (status, body)
            }),
        );
        format!("{}/v1/chat/completions", spawn(app).await)
    }

    async fn relay(api_key: Option<&str>, upstream_url: String) -> String {
        let config = RelayConfig {
            api_key: api_key.map(str::to_string),
            upstream_url,
            ..RelayConfig::default()
        };
        format!("{}/api/chat", spawn(router(config).unwrap()).await)
    }

    async fn post_chat(url: &str, body: &str) -> (u16, String) {
        let res = reqwest::Client::new()
            .post(url)
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .unwrap();
        (res.status().as_u16(), res.text().await.unwrap())
    }

    fn decode(body: &str) -> Vec<String> {
        let mut d = FragmentDecoder::default();
        let mut out = d.push(body.as_bytes());
        out.extend(d.finish());
        out
    }

    #[tokio::test]
    async fn test_relays_upstream_reply_as_fragment() {
        let up = upstream(
            StatusCode::OK,
            r#"{"choices":[{"message":{"role":"assistant","content":"Hi! \"Quoted\" reply."}}]}"#,
        )
        .await;
        let url = relay(Some("sk-test"), up).await;

        let (status, body) = post_chat(&url, r#"{"message":"hello there"}"#).await;
        assert_eq!(status, 200);
        assert_eq!(decode(&body), vec!["Hi! \"Quoted\" reply."]);
    }

    #[tokio::test]
    async fn test_missing_message_is_bad_request() {
        let url = relay(Some("sk-test"), DEFAULT_UPSTREAM_URL.to_string()).await;
        let (status, body) = post_chat(&url, r#"{"message":""}"#).await;
        assert_eq!(status, 400);
        assert!(body.contains("Message is required"));

        let (status, _) = post_chat(&url, "{}").await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let url = relay(None, DEFAULT_UPSTREAM_URL.to_string()).await;
        let (status, body) = post_chat(&url, r#"{"message":"hi"}"#).await;
        assert_eq!(status, 500);
        assert!(body.contains("OpenAI API key not configured"));
    }

    #[tokio::test]
    async fn test_quota_exhausted_gives_canned_reply() {
        let up = upstream(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"code":"insufficient_quota"}}"#,
        )
        .await;
        let url = relay(Some("sk-test"), up).await;

        let (status, body) = post_chat(&url, r#"{"message":"tell me a joke"}"#).await;
        assert_eq!(status, 200);
        assert_eq!(
            decode(&body),
            vec![fallback::canned_reply("tell me a joke")]
        );
    }

    #[tokio::test]
    async fn test_upstream_failure() {
        let up = upstream(StatusCode::UNAUTHORIZED, r#"{"error":"invalid key"}"#).await;
        let url = relay(Some("sk-test"), up).await;
        let (status, body) = post_chat(&url, r#"{"message":"hi"}"#).await;
        assert_eq!(status, 500);
        assert!(body.contains("OpenAI API request failed"));
    }

    #[tokio::test]
    async fn test_empty_choices_use_apology() {
        let up = upstream(StatusCode::OK, r#"{"choices":[]}"#).await;
        let url = relay(Some("sk-test"), up).await;
        let (_, body) = post_chat(&url, r#"{"message":"hi"}"#).await;
        assert_eq!(decode(&body), vec![EMPTY_REPLY]);
    }

    #[tokio::test]
    async fn test_invalid_body() {
        let url = relay(Some("sk-test"), DEFAULT_UPSTREAM_URL.to_string()).await;
        let (status, body) = post_chat(&url, "not json").await;
        assert_eq!(status, 500);
        assert!(body.contains("Failed to process chat request"));
    }
}
