use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

/// マイク権限の状態（キャプチャ側が所有し、オーケストレータが観測する）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    #[default]
    Unknown,
    Prompt,
    Granted,
    Denied,
}

/// エンジンハンドルのライフサイクル
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
    Disposed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Disposed => "disposed",
        }
    }
}

/// キャプチャ戦略（起動時に一度だけ選択する）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStrategy {
    /// プラットフォームの連続認識（1回の呼び出しで確定結果を1つ返す）
    NativeRecognition,
    /// 録音してセグメントを書き起こしステージへ渡す
    BufferedRecording,
}

/// 音声合成戦略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStrategy {
    /// プラットフォームの発話エンジン（開始/終了コールバック付き）
    #[default]
    Native,
    /// ワーカーがサンプルを返し、呼び出し側が再生する
    Worker,
}

/// ステージ別レイテンシ（ミリ秒）
///
/// `total_latency_ms` は3つすべてが揃うまで `None`。
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct LatencyMetrics {
    pub stt_latency_ms: Option<f64>,
    pub api_latency_ms: Option<f64>,
    pub tts_latency_ms: Option<f64>,
}

impl LatencyMetrics {
    pub fn total_latency_ms(&self) -> Option<f64> {
        Some(self.stt_latency_ms? + self.api_latency_ms? + self.tts_latency_ms?)
    }

    pub fn is_empty(&self) -> bool {
        self.stt_latency_ms.is_none()
            && self.api_latency_ms.is_none()
            && self.tts_latency_ms.is_none()
    }
}

impl Serialize for LatencyMetrics {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let total = self.total_latency_ms();
        let len = if total.is_some() { 4 } else { 3 };
        let mut st = serializer.serialize_struct("LatencyMetrics", len)?;
        st.serialize_field("stt_latency_ms", &self.stt_latency_ms)?;
        st.serialize_field("api_latency_ms", &self.api_latency_ms)?;
        st.serialize_field("tts_latency_ms", &self.tts_latency_ms)?;
        if let Some(total) = total {
            st.serialize_field("total_latency_ms", &total)?;
        }
        st.end()
    }
}
