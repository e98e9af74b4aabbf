use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CaptureControl, CaptureError, CaptureHandle, CaptureOutput, CaptureSource};
use crate::domain::types::{CaptureStrategy, PermissionState};

/// プラットフォーム認識器からのイベント
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// 確定結果
    Result { transcript: String },
    /// 認識器のエラーコード（"no-speech", "not-allowed" など）
    Error { code: String },
    /// 認識セッション終了
    End,
}

/// プラットフォームの連続音声認識
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    fn is_supported(&self) -> bool;

    async fn query_permission(&self) -> PermissionState;

    async fn request_permission(&self) -> PermissionState;

    /// 1回分の認識を開始する（確定結果のみ、途中結果なし）
    fn start(&self, lang: &str) -> Result<mpsc::UnboundedReceiver<RecognitionEvent>, CaptureError>;

    /// 認識を終わらせる。結果があればそれを送ってから `End` を送る。
    fn stop(&self);
}

fn map_error_code(code: &str) -> CaptureError {
    match code {
        "not-allowed" | "service-not-allowed" => CaptureError::PermissionDenied,
        "no-speech" => CaptureError::NoSpeech,
        "audio-capture" => CaptureError::Device("audio-capture".to_string()),
        "network" => CaptureError::Network,
        other => CaptureError::Recognition(other.to_string()),
    }
}

/// ネイティブ認識戦略: 認識器が書き起こしまで行い、transcription ステージを飛ばす
pub struct NativeRecognitionCapture {
    recognizer: Arc<dyn SpeechRecognizer>,
    language: String,
}

impl NativeRecognitionCapture {
    pub fn new(recognizer: Arc<dyn SpeechRecognizer>, language: impl Into<String>) -> Self {
        Self {
            recognizer,
            language: language.into(),
        }
    }
}

#[async_trait]
impl CaptureSource for NativeRecognitionCapture {
    fn strategy(&self) -> CaptureStrategy {
        CaptureStrategy::NativeRecognition
    }

    async fn query_permission(&self) -> PermissionState {
        self.recognizer.query_permission().await
    }

    async fn request_permission(&self) -> Result<PermissionState, CaptureError> {
        Ok(self.recognizer.request_permission().await)
    }

    async fn start(&self) -> Result<CaptureHandle, CaptureError> {
        if !self.recognizer.is_supported() {
            return Err(CaptureError::Recognition("not supported".to_string()));
        }
        let events = self.recognizer.start(&self.language)?;
        log::info!("Speech recognition started ({})", self.language);

        let (handle, control) = CaptureHandle::channel();
        tokio::spawn(recognize(self.recognizer.clone(), events, control));
        Ok(handle)
    }
}

async fn recognize(
    recognizer: Arc<dyn SpeechRecognizer>,
    mut events: mpsc::UnboundedReceiver<RecognitionEvent>,
    control: CaptureControl,
) {
    let CaptureControl {
        mut stop_rx,
        outcome_tx,
    } = control;
    let mut stop_requested: Option<Instant> = None;
    let mut transcript: Option<String> = None;
    let mut error: Option<CaptureError> = None;

    loop {
        tokio::select! {
            _ = &mut stop_rx, if stop_requested.is_none() => {
                stop_requested = Some(Instant::now());
                recognizer.stop();
            }
            event = events.recv() => match event {
                Some(RecognitionEvent::Result { transcript: text }) => {
                    // 1回の認識で確定結果は1つ
                    if transcript.is_none() {
                        transcript = Some(text);
                    }
                }
                Some(RecognitionEvent::Error { code }) => {
                    log::error!("Speech recognition error: {}", code);
                    if error.is_none() {
                        error = Some(map_error_code(&code));
                    }
                }
                Some(RecognitionEvent::End) | None => break,
            },
        }
    }

    if error.is_some() && stop_requested.is_none() {
        recognizer.stop();
    }

    let outcome = match (error, transcript) {
        (Some(e), _) => Err(e),
        (None, Some(text)) => Ok(CaptureOutput::Recognized {
            text,
            // 認識器が自分で終了した場合は 0
            latency_ms: stop_requested
                .map(|at| at.elapsed().as_secs_f64() * 1000.0)
                .unwrap_or(0.0),
        }),
        (None, None) => Ok(CaptureOutput::Empty),
    };
    let _ = outcome_tx.send(outcome);
}
