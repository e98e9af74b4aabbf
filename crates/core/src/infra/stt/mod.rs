mod noop;

pub use noop::NoopRecognitionModel;

use std::time::Instant;

use async_trait::async_trait;

use crate::domain::error::ErrorInfo;
use crate::domain::stt::{AudioSegment, TranscriptResult};
use crate::domain::types::EngineState;
use crate::domain::worker::{WorkerRequest, WorkerResponse};
use crate::infra::worker::{EngineHandle, WorkerError, WorkerLink};

/// 書き起こしエンジン trait
#[async_trait]
pub trait Transcriber: Send + Sync {
    fn state(&self) -> EngineState;

    async fn initialize(&self) -> Result<(), ErrorInfo>;

    /// 1セグメントを書き起こす。latency_ms は呼び出し境界で計測する。
    async fn transcribe(&self, segment: &AudioSegment) -> Result<TranscriptResult, ErrorInfo>;

    fn dispose(&self);
}

/// ワーカー上のモデルで書き起こす Transcriber
pub struct WorkerTranscriber {
    engine: EngineHandle,
}

impl WorkerTranscriber {
    pub fn new(link: WorkerLink) -> Self {
        Self {
            engine: EngineHandle::new(link),
        }
    }

    /// スタブモデルを専用スレッドで起動する
    pub fn spawn_default() -> Result<Self, WorkerError> {
        Ok(Self::new(WorkerLink::spawn(NoopRecognitionModel::default())?))
    }
}

#[async_trait]
impl Transcriber for WorkerTranscriber {
    fn state(&self) -> EngineState {
        self.engine.state()
    }

    async fn initialize(&self) -> Result<(), ErrorInfo> {
        self.engine.initialize().await
    }

    async fn transcribe(&self, segment: &AudioSegment) -> Result<TranscriptResult, ErrorInfo> {
        let start = Instant::now();
        let response = self
            .engine
            .request(WorkerRequest::transcribe(segment.clone()))
            .await
            .map_err(|e| ErrorInfo::transcription(e.to_string()))?;

        match response {
            WorkerResponse::Transcript {
                transcript,
                latency,
                ..
            } => {
                let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                log::debug!(
                    "Transcribed {}ms of audio in {:.1}ms (worker {:.1}ms)",
                    segment.duration_ms,
                    latency_ms,
                    latency
                );
                Ok(TranscriptResult {
                    text: transcript,
                    latency_ms,
                })
            }
            WorkerResponse::Error { error } => Err(ErrorInfo::transcription(error)),
            other => Err(ErrorInfo::transcription(format!(
                "Unexpected {} reply to transcribe",
                other.type_name()
            ))),
        }
    }

    fn dispose(&self) {
        self.engine.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorKind;

    fn segment() -> AudioSegment {
        AudioSegment::new(vec![0.1; 1600], 16000, chrono::Utc::now())
    }

    #[tokio::test]
    async fn test_transcribe_before_initialize_fails() {
        let stt = WorkerTranscriber::spawn_default().unwrap();
        let err = stt.transcribe(&segment()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TranscriptionFailed);
        assert!(err.message.contains("not initialized"));
    }

    #[tokio::test]
    async fn test_transcribe_after_initialize() {
        let stt = WorkerTranscriber::spawn_default().unwrap();
        stt.initialize().await.unwrap();
        assert_eq!(stt.state(), EngineState::Ready);

        let result = stt.transcribe(&segment()).await.unwrap();
        assert_eq!(result.text, noop::MOCK_TRANSCRIPT);
        assert!(result.latency_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_dispose() {
        let stt = WorkerTranscriber::spawn_default().unwrap();
        stt.initialize().await.unwrap();
        stt.dispose();
        assert_eq!(stt.state(), EngineState::Disposed);
        assert!(stt.transcribe(&segment()).await.is_err());
    }
}
