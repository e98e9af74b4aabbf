pub mod decoder;
pub mod fallback;
mod http;

pub use decoder::{encode_fragment_line, FragmentDecoder};
pub use http::HttpCompletionClient;

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::error::ErrorInfo;

/// 応答生成エラー
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("Completion request failed: {0}")]
    Request(String),
    #[error("API request failed: {status}")]
    Status { status: u16, body: String },
    #[error("Completion stream failed: {0}")]
    Stream(String),
    #[error("Completion timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

impl From<CompletionError> for ErrorInfo {
    fn from(e: CompletionError) -> Self {
        ErrorInfo::network(e.to_string())
    }
}

/// 応答生成クライアント trait
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// 書き起こしを送り、応答フラグメントのストリームを返す
    async fn send(&self, transcript: &str) -> Result<FragmentStream, CompletionError>;

    fn name(&self) -> &str;
}

enum Source {
    Http {
        response: reqwest::Response,
        decoder: FragmentDecoder,
        ready: VecDeque<String>,
        done: bool,
    },
    Buffered(VecDeque<String>),
    Channel(mpsc::UnboundedReceiver<Result<String, CompletionError>>),
}

/// 応答フラグメントのストリーム（到着順）
pub struct FragmentStream {
    source: Source,
    degraded: bool,
}

impl FragmentStream {
    pub(crate) fn from_response(response: reqwest::Response) -> Self {
        Self {
            source: Source::Http {
                response,
                decoder: FragmentDecoder::default(),
                ready: VecDeque::new(),
                done: false,
            },
            degraded: false,
        }
    }

    /// クォータ切れ時の定型応答（1フラグメント、degraded 扱い）
    pub fn canned(reply: impl Into<String>) -> Self {
        Self {
            degraded: true,
            ..Self::from_fragments([reply.into()])
        }
    }

    /// 既知のフラグメント列から作る
    pub fn from_fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source: Source::Buffered(fragments.into_iter().map(Into::into).collect()),
            degraded: false,
        }
    }

    /// チャネルから作る。送信側が閉じるとストリーム終了。
    pub fn from_channel(rx: mpsc::UnboundedReceiver<Result<String, CompletionError>>) -> Self {
        Self {
            source: Source::Channel(rx),
            degraded: false,
        }
    }

    /// ローカルの定型応答か
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// 次のフラグメント。`None` でストリーム終了。
    pub async fn next_fragment(&mut self) -> Option<Result<String, CompletionError>> {
        match &mut self.source {
            Source::Buffered(queue) => queue.pop_front().map(Ok),
            Source::Channel(rx) => rx.recv().await,
            Source::Http {
                response,
                decoder,
                ready,
                done,
            } => loop {
                if let Some(fragment) = ready.pop_front() {
                    return Some(Ok(fragment));
                }
                if *done {
                    return None;
                }
                match response.chunk().await {
                    Ok(Some(bytes)) => ready.extend(decoder.push(&bytes)),
                    Ok(None) => {
                        *done = true;
                        ready.extend(decoder.finish());
                    }
                    Err(e) => {
                        *done = true;
                        return Some(Err(CompletionError::Stream(e.to_string())));
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffered_stream_yields_in_order() {
        let mut stream = FragmentStream::from_fragments(["Hel", "lo"]);
        assert!(!stream.is_degraded());
        assert_eq!(stream.next_fragment().await.unwrap().unwrap(), "Hel");
        assert_eq!(stream.next_fragment().await.unwrap().unwrap(), "lo");
        assert!(stream.next_fragment().await.is_none());
    }

    #[tokio::test]
    async fn test_canned_stream_is_degraded() {
        let mut stream = FragmentStream::canned("demo reply");
        assert!(stream.is_degraded());
        assert_eq!(stream.next_fragment().await.unwrap().unwrap(), "demo reply");
        assert!(stream.next_fragment().await.is_none());
    }

    #[tokio::test]
    async fn test_channel_stream_passes_errors() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = FragmentStream::from_channel(rx);
        tx.send(Ok("a".to_string())).unwrap();
        tx.send(Err(CompletionError::Stream("reset".into()))).unwrap();
        drop(tx);
        assert_eq!(stream.next_fragment().await.unwrap().unwrap(), "a");
        assert!(stream.next_fragment().await.unwrap().is_err());
        assert!(stream.next_fragment().await.is_none());
    }

    #[test]
    fn test_error_maps_to_network() {
        let info: ErrorInfo = CompletionError::Status {
            status: 503,
            body: String::new(),
        }
        .into();
        assert_eq!(info.kind, crate::domain::error::ErrorKind::NetworkError);
        assert_eq!(info.message, "API request failed: 503");
    }
}
