mod buffered;
#[cfg(feature = "device")]
pub mod device;
mod native;

pub use buffered::{BufferedRecorder, InputStream, MicrophoneDevice};
pub use native::{NativeRecognitionCapture, RecognitionEvent, SpeechRecognizer};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::domain::error::ErrorInfo;
use crate::domain::settings::CapturePreference;
use crate::domain::stt::AudioSegment;
use crate::domain::types::{CaptureStrategy, PermissionState};

/// 音声キャプチャエラー
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CaptureError {
    #[error("Microphone access denied")]
    PermissionDenied,
    #[error("No audio input device found")]
    DeviceNotFound,
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("No speech detected")]
    NoSpeech,
    #[error("Speech recognition network error")]
    Network,
    #[error("Speech recognition error: {0}")]
    Recognition(String),
}

impl From<CaptureError> for ErrorInfo {
    fn from(e: CaptureError) -> Self {
        match e {
            CaptureError::PermissionDenied => ErrorInfo::permission_denied(
                "Microphone access denied. Please allow microphone access and try again.",
            ),
            CaptureError::DeviceNotFound => ErrorInfo::device_not_found(
                "No microphone found. Please connect a microphone and try again.",
            ),
            CaptureError::Device(detail) => ErrorInfo::device(format!(
                "Audio capture failed. Please check your microphone. ({detail})"
            )),
            CaptureError::NoSpeech => ErrorInfo::no_speech(),
            CaptureError::Network => {
                ErrorInfo::network("Network error. Please check your internet connection.")
            }
            CaptureError::Recognition(code) => {
                ErrorInfo::transcription(format!("Speech recognition error: {code}"))
            }
        }
    }
}

/// キャプチャ1回分の結果
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutput {
    /// 録音セグメント（書き起こしステージへ）
    Segment(AudioSegment),
    /// ネイティブ認識の確定結果。latency_ms は停止要求から結果までの時間。
    Recognized { text: String, latency_ms: f64 },
    /// 音声なし（チャンク0件、または結果なしで終了）
    Empty,
}

pub type CaptureResult = Result<CaptureOutput, CaptureError>;

/// キャプチャ停止スイッチ。drop でも停止する。
#[derive(Debug)]
pub struct CaptureStopper(Option<oneshot::Sender<()>>);

impl CaptureStopper {
    /// 停止を要求する。2回目以降は何もしない。
    pub fn stop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

/// キャプチャ結果の受け口
#[derive(Debug)]
pub struct PendingOutcome(oneshot::Receiver<CaptureResult>);

impl PendingOutcome {
    /// キャプチャ終了まで待つ。キャプチャ側が結果を送らずに消えた場合はデバイスエラー。
    pub async fn wait(self) -> CaptureResult {
        self.0
            .await
            .unwrap_or_else(|_| Err(CaptureError::Device("capture ended unexpectedly".into())))
    }
}

/// キャプチャ実装側の端点
pub struct CaptureControl {
    pub stop_rx: oneshot::Receiver<()>,
    pub outcome_tx: oneshot::Sender<CaptureResult>,
}

/// 進行中のキャプチャ
#[derive(Debug)]
pub struct CaptureHandle {
    stopper: CaptureStopper,
    outcome: PendingOutcome,
}

impl CaptureHandle {
    pub fn channel() -> (Self, CaptureControl) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        (
            Self {
                stopper: CaptureStopper(Some(stop_tx)),
                outcome: PendingOutcome(outcome_rx),
            },
            CaptureControl { stop_rx, outcome_tx },
        )
    }

    pub fn stop(&mut self) {
        self.stopper.stop();
    }

    pub async fn outcome(self) -> CaptureResult {
        self.outcome.wait().await
    }

    /// 停止スイッチと結果待ちを別々の所有者に渡す
    pub fn split(self) -> (CaptureStopper, PendingOutcome) {
        (self.stopper, self.outcome)
    }
}

/// キャプチャ戦略の共通インターフェース
#[async_trait]
pub trait CaptureSource: Send + Sync {
    fn strategy(&self) -> CaptureStrategy;

    /// 現在の権限状態を問い合わせる（プロンプトは出さない）
    async fn query_permission(&self) -> PermissionState;

    /// 権限を要求する（必要ならプロンプト）
    ///
    /// 拒否は `Ok(Denied)`。デバイスが無いなど権限以外の失敗は `Err` で返す。
    async fn request_permission(&self) -> Result<PermissionState, CaptureError>;

    /// キャプチャを開始する。デバイスはこの呼び出しごとに新しく取得する。
    async fn start(&self) -> Result<CaptureHandle, CaptureError>;
}

/// 希望とプラットフォームの対応状況からキャプチャ戦略を決める
pub fn select_strategy(preference: CapturePreference, native_supported: bool) -> CaptureStrategy {
    match preference {
        CapturePreference::Buffered => CaptureStrategy::BufferedRecording,
        CapturePreference::Auto | CapturePreference::Native if native_supported => {
            CaptureStrategy::NativeRecognition
        }
        CapturePreference::Native => {
            log::warn!("Native speech recognition not supported, falling back to recording");
            CaptureStrategy::BufferedRecording
        }
        CapturePreference::Auto => CaptureStrategy::BufferedRecording,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorKind;

    #[test]
    fn test_select_strategy() {
        assert_eq!(
            select_strategy(CapturePreference::Auto, true),
            CaptureStrategy::NativeRecognition
        );
        assert_eq!(
            select_strategy(CapturePreference::Auto, false),
            CaptureStrategy::BufferedRecording
        );
        assert_eq!(
            select_strategy(CapturePreference::Native, false),
            CaptureStrategy::BufferedRecording
        );
        assert_eq!(
            select_strategy(CapturePreference::Buffered, true),
            CaptureStrategy::BufferedRecording
        );
    }

    #[test]
    fn test_error_mapping() {
        let cases = [
            (CaptureError::PermissionDenied, ErrorKind::PermissionDenied),
            (CaptureError::DeviceNotFound, ErrorKind::DeviceNotFound),
            (CaptureError::Device("x".into()), ErrorKind::DeviceError),
            (CaptureError::NoSpeech, ErrorKind::NoSpeechDetected),
            (CaptureError::Network, ErrorKind::NetworkError),
            (CaptureError::Recognition("aborted".into()), ErrorKind::TranscriptionFailed),
        ];
        for (err, kind) in cases {
            assert_eq!(ErrorInfo::from(err).kind, kind);
        }
    }

    #[tokio::test]
    async fn test_dropped_control_is_device_error() {
        let (handle, control) = CaptureHandle::channel();
        drop(control);
        assert!(matches!(handle.outcome().await, Err(CaptureError::Device(_))));
    }

    #[tokio::test]
    async fn test_stop_signal_reaches_control() {
        let (mut handle, control) = CaptureHandle::channel();
        handle.stop();
        handle.stop();
        control.stop_rx.await.unwrap();
        control.outcome_tx.send(Ok(CaptureOutput::Empty)).unwrap();
        assert_eq!(handle.outcome().await, Ok(CaptureOutput::Empty));
    }
}
