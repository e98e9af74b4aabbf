use serde::{Deserialize, Serialize};

/// パイプライン共通エラー種別（UI には `E_*` コードとして渡る）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "E_PERMISSION")]
    PermissionDenied,
    #[serde(rename = "E_DEVICE_NOT_FOUND")]
    DeviceNotFound,
    #[serde(rename = "E_DEVICE")]
    DeviceError,
    #[serde(rename = "E_NO_SPEECH")]
    NoSpeechDetected,
    #[serde(rename = "E_TRANSCRIPTION")]
    TranscriptionFailed,
    #[serde(rename = "E_NETWORK")]
    NetworkError,
    #[serde(rename = "E_SYNTHESIS")]
    SynthesisFailed,
    #[serde(rename = "E_INIT")]
    InitializationFailed,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "E_PERMISSION",
            Self::DeviceNotFound => "E_DEVICE_NOT_FOUND",
            Self::DeviceError => "E_DEVICE",
            Self::NoSpeechDetected => "E_NO_SPEECH",
            Self::TranscriptionFailed => "E_TRANSCRIPTION",
            Self::NetworkError => "E_NETWORK",
            Self::SynthesisFailed => "E_SYNTHESIS",
            Self::InitializationFailed => "E_INIT",
        }
    }

    /// マイク権限を denied 扱いにすべきエラーか
    pub fn revokes_permission(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied | Self::DeviceNotFound | Self::DeviceError
        )
    }
}

/// セッション上のアクティブエラー（イベントペイロード兼用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, msg)
    }

    pub fn device_not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeviceNotFound, msg)
    }

    pub fn device(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeviceError, msg)
    }

    pub fn no_speech() -> Self {
        Self::new(
            ErrorKind::NoSpeechDetected,
            "No speech detected. Please try speaking again.",
        )
    }

    pub fn transcription(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::TranscriptionFailed, msg)
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkError, msg)
    }

    pub fn synthesis(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::SynthesisFailed, msg)
    }

    pub fn initialization(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InitializationFailed, msg)
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for ErrorInfo {}

/// キャプチャ開始要求の拒否理由（エラーではなく呼び出し側への応答）
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("engines are not ready yet")]
    NotReady,
    #[error("a turn is already in progress ({0})")]
    Busy(String),
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("capture could not start: {0}")]
    CaptureFailed(ErrorInfo),
}

/// 非同期結果の適用先セッションが既に入れ替わっている
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("result belongs to a superseded session")]
    Stale,
    #[error("{operation} is not allowed in {state} state")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
}

impl TransitionError {
    pub fn invalid_state(operation: &'static str, state: &'static str) -> Self {
        Self::InvalidState { operation, state }
    }
}
