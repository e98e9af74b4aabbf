use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::SynthesisStrategy;

/// 設定ファイルの読み込みエラー
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to read settings file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid settings file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// 音声ループ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// 応答生成エンドポイント (POST {message})
    pub completion_endpoint: String,
    /// 応答ストリーム全体の上限秒数
    pub completion_timeout_secs: u64,
    /// 認識/発話の言語
    pub language: String,
    /// キャプチャ戦略の希望
    pub capture: CapturePreference,
    /// 音声合成戦略
    pub synthesis: SynthesisStrategy,
    /// 発話パラメータ（ネイティブ合成用）
    pub utterance_rate: f32,
    pub utterance_pitch: f32,
    pub utterance_volume: f32,
    /// 録音サンプルレート
    pub capture_sample_rate: u32,
    /// ワーカー合成音声の再生サンプルレート
    pub playback_sample_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapturePreference {
    /// ネイティブ認識が使えればそれを、なければ録音
    Auto,
    Native,
    Buffered,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            completion_endpoint: "http://127.0.0.1:3000/api/chat".to_string(),
            completion_timeout_secs: 30,
            language: "en-US".to_string(),
            capture: CapturePreference::Auto,
            synthesis: SynthesisStrategy::Native,
            utterance_rate: 1.0,
            utterance_pitch: 1.0,
            utterance_volume: 1.0,
            capture_sample_rate: 16_000,
            playback_sample_rate: 22_050,
        }
    }
}

impl VoiceSettings {
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }

    /// 設定ファイルの既定パス (`VL_SETTINGS_PATH` で上書き可能)
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("VL_SETTINGS_PATH") {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voice-loop")
            .join("settings.json")
    }

    /// JSON ファイルから読み込む。ファイルが無ければ既定値。
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("Settings file {:?} not found, using defaults", path);
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = VoiceSettings::default();
        assert_eq!(s.completion_timeout(), Duration::from_secs(30));
        assert_eq!(s.language, "en-US");
        assert_eq!(s.playback_sample_rate, 22_050);
        assert_eq!(s.synthesis, SynthesisStrategy::Native);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let s: VoiceSettings =
            serde_json::from_str(r#"{"synthesis":"worker","capture":"buffered"}"#).unwrap();
        assert_eq!(s.synthesis, SynthesisStrategy::Worker);
        assert_eq!(s.capture, CapturePreference::Buffered);
        assert_eq!(s.completion_timeout_secs, 30);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let path = std::env::temp_dir().join(format!(
            "vl_missing_{}.json",
            uuid::Uuid::new_v4()
        ));
        let s = VoiceSettings::load(&path).unwrap();
        assert_eq!(s, VoiceSettings::default());
    }

    #[test]
    fn test_load_invalid_file() {
        let path = std::env::temp_dir().join(format!(
            "vl_invalid_{}.json",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&path, "{not json").unwrap();
        let err = VoiceSettings::load(&path).unwrap_err();
        let _ = std::fs::remove_file(&path);
        assert!(matches!(err, SettingsError::Parse { .. }));
    }
}
