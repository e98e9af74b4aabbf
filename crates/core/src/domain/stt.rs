use serde::{Deserialize, Serialize};

// ─── AudioSegment ────────────────────────────────────────────────

/// 書き起こし対象の音声セグメント（録音停止時に確定した1発話分）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSegment {
    /// 録音開始時刻 (UTC)
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// セグメント長 (ミリ秒)
    pub duration_ms: u32,
    /// サンプルレート (Hz)。キャプチャ既定は 16000。
    pub sample_rate: u32,
    /// PCMサンプル (f32, mono)
    pub samples: Vec<f32>,
}

impl AudioSegment {
    /// 必須フィールドから AudioSegment を生成する。duration_ms は自動算出。
    pub fn new(
        samples: Vec<f32>,
        sample_rate: u32,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        let duration_ms = if sample_rate > 0 {
            ((samples.len() as f64 / sample_rate as f64) * 1000.0) as u32
        } else {
            0
        };
        Self {
            started_at,
            duration_ms,
            sample_rate,
            samples,
        }
    }

    /// 録音チャンクを連結して1セグメントにまとめる。
    pub fn from_chunks(
        chunks: Vec<Vec<f32>>,
        sample_rate: u32,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        let total = chunks.iter().map(Vec::len).sum();
        let mut samples = Vec::with_capacity(total);
        for chunk in chunks {
            samples.extend(chunk);
        }
        Self::new(samples, sample_rate, started_at)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

// ─── TranscriptResult ────────────────────────────────────────────

/// 書き起こし結果。latency_ms はオーケストレータ境界で計測した値。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptResult {
    pub text: String,
    pub latency_ms: f64,
}

impl TranscriptResult {
    /// 空白のみの結果は正常系だが、後続ステージを呼ばずに idle へ戻す。
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────
