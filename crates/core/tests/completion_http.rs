//! 応答生成 HTTP クライアントの統合テスト。
//!
//! ローカルに立てたサーバーに対して送受信を確認する（外部ネットワーク不要）。

use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use vl_core::infra::completion::{
    encode_fragment_line, CompletionClient, CompletionError, HttpCompletionClient,
};

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/api/chat")
}

fn client(endpoint: &str) -> HttpCompletionClient {
    HttpCompletionClient::new(endpoint, Duration::from_secs(5)).unwrap()
}

async fn collect(client: &HttpCompletionClient, transcript: &str) -> (Vec<String>, bool) {
    let mut stream = client.send(transcript).await.unwrap();
    let mut fragments = Vec::new();
    while let Some(next) = stream.next_fragment().await {
        fragments.push(next.unwrap());
    }
    (fragments, stream.is_degraded())
}

#[tokio::test]
async fn test_streams_fragments_in_order() {
    let app = Router::new().route(
        "/api/chat",
        post(|Json(body): Json<serde_json::Value>| async move {
            let echo = body["message"].as_str().unwrap_or_default().to_string();
            format!(
                "{}{}{}",
                encode_fragment_line("You said: "),
                encode_fragment_line(&echo),
                encode_fragment_line("!")
            )
        }),
    );
    let endpoint = serve(app).await;

    let (fragments, degraded) = collect(&client(&endpoint), "hello \"world\"").await;
    assert_eq!(fragments, vec!["You said: ", "hello \"world\"", "!"]);
    assert!(!degraded);
}

#[tokio::test]
async fn test_lines_split_across_chunks() {
    // チャンク境界が行の途中・マルチバイト文字の途中に来るレスポンス
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = socket.read(&mut buf).await.unwrap();

        let body = format!(
            "{}{}",
            encode_fragment_line("Hello, "),
            encode_fragment_line("café ☕")
        );
        let bytes = body.as_bytes();
        let cut_a = 5;
        let cut_b = body.find('☕').unwrap() + 1;

        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ntransfer-encoding: chunked\r\n\r\n")
            .await
            .unwrap();
        for part in [&bytes[..cut_a], &bytes[cut_a..cut_b], &bytes[cut_b..]] {
            socket
                .write_all(format!("{:x}\r\n", part.len()).as_bytes())
                .await
                .unwrap();
            socket.write_all(part).await.unwrap();
            socket.write_all(b"\r\n").await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        socket.write_all(b"0\r\n\r\n").await.unwrap();
        socket.flush().await.unwrap();
    });

    let endpoint = format!("http://{addr}/api/chat");
    let (fragments, _) = collect(&client(&endpoint), "hi").await;
    assert_eq!(fragments, vec!["Hello, ", "café ☕"]);
}

#[tokio::test]
async fn test_quota_exhausted_answers_with_canned_reply() {
    let app = Router::new().route(
        "/api/chat",
        post(|| async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                r#"{"error":{"code":"insufficient_quota","message":"You exceeded your current quota"}}"#,
            )
        }),
    );
    let endpoint = serve(app).await;

    let (fragments, degraded) = collect(&client(&endpoint), "tell me a joke").await;
    assert!(degraded);
    assert_eq!(fragments.len(), 1);
    assert!(!fragments[0].is_empty());
}

#[tokio::test]
async fn test_error_status_is_reported() {
    let app = Router::new().route(
        "/api/chat",
        post(|| async {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "OpenAI API request failed"})),
            )
        }),
    );
    let endpoint = serve(app).await;

    let err = client(&endpoint).send("hello").await.err().unwrap();
    match err {
        CompletionError::Status { status, body } => {
            assert_eq!(status, 500);
            assert!(body.contains("OpenAI API request failed"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_empty_body_is_empty_reply() {
    let app = Router::new().route("/api/chat", post(|| async { "" }));
    let endpoint = serve(app).await;

    let (fragments, degraded) = collect(&client(&endpoint), "hello").await;
    assert!(fragments.is_empty());
    assert!(!degraded);
}
