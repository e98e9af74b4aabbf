use async_trait::async_trait;

use crate::domain::stt::AudioSegment;
use crate::infra::worker::WorkerModel;

pub(crate) const MOCK_TRANSCRIPT: &str = "This is a mock transcript from the speech worker";

/// NoopRecognitionModel: 固定文字列を返すモック認識モデル。
/// 実モデルを組み込むまでのスタブ。
#[derive(Default)]
pub struct NoopRecognitionModel {
    loaded: bool,
}

#[async_trait]
impl WorkerModel for NoopRecognitionModel {
    fn name(&self) -> &str {
        "Transcription"
    }

    async fn load(&mut self) -> Result<(), String> {
        self.loaded = true;
        Ok(())
    }

    fn unload(&mut self) {
        self.loaded = false;
    }

    async fn transcribe(&mut self, segment: &AudioSegment) -> Result<String, String> {
        if !self.loaded {
            return Err("model not loaded".to_string());
        }
        if segment.is_empty() {
            return Ok(String::new());
        }
        Ok(MOCK_TRANSCRIPT.to_string())
    }
}
