use std::f32::consts::PI;
use std::time::Duration;

use async_trait::async_trait;

use crate::infra::worker::WorkerModel;

/// ToneSpeechModel: 440Hz の正弦波を返すスタブ音声合成モデル
pub struct ToneSpeechModel {
    sample_rate: u32,
    duration: Duration,
    loaded: bool,
}

const TONE_HZ: f32 = 440.0;
const AMPLITUDE: f32 = 0.3;

impl Default for ToneSpeechModel {
    fn default() -> Self {
        Self::new(22_050, Duration::from_secs(2))
    }
}

impl ToneSpeechModel {
    pub fn new(sample_rate: u32, duration: Duration) -> Self {
        Self {
            sample_rate,
            duration,
            loaded: false,
        }
    }

    fn tone(&self) -> Vec<f32> {
        let len = (self.sample_rate as f64 * self.duration.as_secs_f64()) as usize;
        (0..len)
            .map(|i| (2.0 * PI * TONE_HZ * i as f32 / self.sample_rate as f32).sin() * AMPLITUDE)
            .collect()
    }
}

#[async_trait]
impl WorkerModel for ToneSpeechModel {
    fn name(&self) -> &str {
        "Synthesis"
    }

    async fn load(&mut self) -> Result<(), String> {
        self.loaded = true;
        Ok(())
    }

    fn unload(&mut self) {
        self.loaded = false;
    }

    async fn synthesize(&mut self, text: &str) -> Result<Vec<f32>, String> {
        if !self.loaded {
            return Err("model not loaded".to_string());
        }
        if text.trim().is_empty() {
            return Err("nothing to synthesize".to_string());
        }
        Ok(self.tone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tone_shape() {
        let mut model = ToneSpeechModel::default();
        assert!(model.synthesize("hello").await.is_err());
        model.load().await.unwrap();
        let samples = model.synthesize("hello").await.unwrap();
        assert_eq!(samples.len(), 44_100);
        assert_eq!(samples[0], 0.0);
        assert!(samples.iter().all(|s| s.abs() <= AMPLITUDE + f32::EPSILON));
    }

    #[tokio::test]
    async fn test_blank_text_is_rejected() {
        let mut model = ToneSpeechModel::new(8000, Duration::from_millis(10));
        model.load().await.unwrap();
        assert!(model.synthesize("   ").await.is_err());
    }
}
