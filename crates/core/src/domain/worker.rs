//! エンジンワーカーとのメッセージプロトコル
//!
//! ワーカー境界を越えるのは JSON フレームのみ。`type` タグで判別する閉じた列挙型で、
//! 未知のタグはデコード時に拒否する。

use serde::{Deserialize, Serialize};

use super::stt::AudioSegment;

/// プロトコル違反（フレームの読み書き失敗）
#[derive(Debug, thiserror::Error)]
#[error("Malformed worker frame: {0}")]
pub struct ProtocolError(#[from] serde_json::Error);

/// オーケストレータ → ワーカー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerRequest {
    Init,
    Transcribe { data: TranscribeData },
    Synthesize { data: SynthesizeData },
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeData {
    pub segment: AudioSegment,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesizeData {
    pub text: String,
}

/// ワーカー → オーケストレータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerResponse {
    Initialized,
    Transcript {
        transcript: String,
        latency: f64,
        #[serde(rename = "isFinal")]
        is_final: bool,
    },
    Audio {
        #[serde(rename = "audioBuffer")]
        audio_buffer: Vec<f32>,
        latency: f64,
    },
    Error {
        error: String,
    },
}

impl WorkerRequest {
    pub fn transcribe(segment: AudioSegment) -> Self {
        Self::Transcribe {
            data: TranscribeData {
                segment,
                is_final: true,
            },
        }
    }

    pub fn synthesize(text: impl Into<String>) -> Self {
        Self::Synthesize {
            data: SynthesizeData { text: text.into() },
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Transcribe { .. } => "transcribe",
            Self::Synthesize { .. } => "synthesize",
            Self::Cleanup => "cleanup",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(frame)?)
    }
}

impl WorkerResponse {
    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error { error: msg.into() }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Transcript { .. } => "transcript",
            Self::Audio { .. } => "audio",
            Self::Error { .. } => "error",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let json = WorkerRequest::Init.encode().unwrap();
        assert_eq!(json, r#"{"type":"init"}"#);

        let json = WorkerRequest::synthesize("hi").encode().unwrap();
        assert_eq!(json, r#"{"type":"synthesize","data":{"text":"hi"}}"#);

        let seg = AudioSegment::new(vec![0.5], 16000, chrono::Utc::now());
        let value: serde_json::Value =
            serde_json::from_str(&WorkerRequest::transcribe(seg).encode().unwrap()).unwrap();
        assert_eq!(value["type"], "transcribe");
        assert_eq!(value["data"]["isFinal"], true);
        assert_eq!(value["data"]["segment"]["sampleRate"], 16000);
    }

    #[test]
    fn test_response_wire_shape() {
        let r = WorkerResponse::decode(
            r#"{"type":"transcript","transcript":"hello","latency":12.5,"isFinal":true}"#,
        )
        .unwrap();
        assert_eq!(
            r,
            WorkerResponse::Transcript {
                transcript: "hello".into(),
                latency: 12.5,
                is_final: true,
            }
        );

        let r = WorkerResponse::decode(r#"{"type":"audio","audioBuffer":[0.0,0.25],"latency":3}"#)
            .unwrap();
        assert_eq!(r.type_name(), "audio");
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        assert!(WorkerResponse::decode(r#"{"type":"progress","value":0.5}"#).is_err());
        assert!(WorkerRequest::decode(r#"{"type":"warmup"}"#).is_err());
    }

    #[test]
    fn test_missing_payload_is_rejected() {
        assert!(WorkerResponse::decode(r#"{"type":"transcript","latency":1}"#).is_err());
        assert!(WorkerRequest::decode(r#"{"type":"synthesize"}"#).is_err());
    }
}
