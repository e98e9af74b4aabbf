mod commands;
mod console;
mod events;
pub mod relay;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use vl_core::domain::error::ErrorInfo;
use vl_core::domain::event::VoiceEvent;
use vl_core::domain::settings::{SettingsError, VoiceSettings};
use vl_core::domain::types::{CaptureStrategy, SynthesisStrategy};
use vl_core::infra::capture::{
    select_strategy, CaptureSource, NativeRecognitionCapture, SpeechRecognizer,
};
use vl_core::infra::completion::{CompletionError, HttpCompletionClient};
use vl_core::infra::stt::WorkerTranscriber;
use vl_core::infra::tts::{AudioOutput, SpeechOutput, SpeechPlatform, WorkerSynthesizer};
use vl_core::infra::worker::WorkerError;
use vl_core::usecase::{Components, VoiceOrchestrator};

pub use commands::{parse_command, CommandError, ConsoleCommand};
pub use console::{ConsoleRecognizer, ConsoleSpeechPlatform};

/// ホスト全体のエラー
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("Failed to start worker: {0}")]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error("Engine initialization failed: {0}")]
    Init(#[from] ErrorInfo),
    #[error("Relay error: {0}")]
    Relay(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// `talk` の起動オプション（指定があれば設定ファイルより優先）
#[derive(Debug, Clone, Default)]
pub struct TalkOptions {
    pub settings_path: Option<PathBuf>,
    pub endpoint: Option<String>,
    pub synthesis: Option<SynthesisStrategy>,
    pub timeout_secs: Option<u64>,
    pub language: Option<String>,
    /// コンソール読み上げの1語あたりの時間
    pub word_ms: u64,
}

/// 設定ファイルを読み、CLI の上書きを適用する
pub fn load_settings(opts: &TalkOptions) -> Result<VoiceSettings, HostError> {
    let path = opts
        .settings_path
        .clone()
        .unwrap_or_else(VoiceSettings::default_path);
    let mut settings = VoiceSettings::load(&path)?;
    if let Some(endpoint) = &opts.endpoint {
        settings.completion_endpoint = endpoint.clone();
    }
    if let Some(synthesis) = opts.synthesis {
        settings.synthesis = synthesis;
    }
    if let Some(secs) = opts.timeout_secs {
        settings.completion_timeout_secs = secs;
    }
    if let Some(language) = &opts.language {
        settings.language = language.clone();
    }
    Ok(settings)
}

/// キャプチャ戦略を選んで CaptureSource を作る
fn create_capture(
    settings: &VoiceSettings,
    recognizer: Arc<ConsoleRecognizer>,
) -> Arc<dyn CaptureSource> {
    match select_strategy(settings.capture, recognizer.is_supported()) {
        CaptureStrategy::NativeRecognition => {
            tracing::info!("console recognition selected");
            Arc::new(NativeRecognitionCapture::new(
                recognizer,
                settings.language.clone(),
            ))
        }
        CaptureStrategy::BufferedRecording => create_recorder(settings, recognizer),
    }
}

#[cfg(feature = "device")]
fn create_recorder(
    settings: &VoiceSettings,
    _recognizer: Arc<ConsoleRecognizer>,
) -> Arc<dyn CaptureSource> {
    use vl_core::infra::capture::{device::CpalMicrophone, BufferedRecorder};
    tracing::info!("microphone recording selected");
    Arc::new(BufferedRecorder::new(
        Arc::new(CpalMicrophone),
        settings.capture_sample_rate,
    ))
}

#[cfg(not(feature = "device"))]
fn create_recorder(
    settings: &VoiceSettings,
    recognizer: Arc<ConsoleRecognizer>,
) -> Arc<dyn CaptureSource> {
    tracing::warn!("recording requires the `device` feature, using console recognition");
    Arc::new(NativeRecognitionCapture::new(
        recognizer,
        settings.language.clone(),
    ))
}

#[cfg(feature = "device")]
fn create_audio_output() -> Arc<dyn AudioOutput> {
    Arc::new(vl_core::infra::tts::CpalAudioOutput)
}

#[cfg(not(feature = "device"))]
fn create_audio_output() -> Arc<dyn AudioOutput> {
    Arc::new(vl_core::infra::tts::SimulatedAudioOutput)
}

/// 設定からオーケストレータを組み立てる（エンジンは未初期化）
pub fn build_orchestrator(
    settings: &VoiceSettings,
    recognizer: Arc<ConsoleRecognizer>,
    word_duration: Duration,
    events: mpsc::UnboundedSender<VoiceEvent>,
) -> Result<Arc<VoiceOrchestrator>, HostError> {
    let platform: Arc<dyn SpeechPlatform> = Arc::new(ConsoleSpeechPlatform::new(word_duration));
    let components = Components {
        capture: create_capture(settings, recognizer),
        transcriber: Arc::new(WorkerTranscriber::spawn_default()?),
        synthesizer: Arc::new(WorkerSynthesizer::spawn_default(
            settings.playback_sample_rate,
        )?),
        completion: Arc::new(HttpCompletionClient::new(
            settings.completion_endpoint.clone(),
            settings.completion_timeout(),
        )?),
        speech: SpeechOutput::new(settings, Some(platform), create_audio_output()),
    };
    Ok(VoiceOrchestrator::new(components, settings, events))
}

/// コンソールで音声ループを動かす
pub async fn talk(opts: TalkOptions) -> Result<(), HostError> {
    let settings = load_settings(&opts)?;
    tracing::info!(
        endpoint = %settings.completion_endpoint,
        synthesis = ?settings.synthesis,
        "starting voice loop"
    );

    let recognizer = Arc::new(ConsoleRecognizer::new());
    let (tx, rx) = mpsc::unbounded_channel();
    let forwarder = events::spawn_forwarder(rx);
    let orchestrator = build_orchestrator(
        &settings,
        recognizer.clone(),
        Duration::from_millis(opts.word_ms),
        tx,
    )?;

    if let Err(e) = orchestrator.initialize().await {
        orchestrator.shutdown();
        return Err(e.into());
    }

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let result = commands::run_console(orchestrator.clone(), recognizer, stdin).await;

    orchestrator.shutdown();
    drop(orchestrator);
    // 最後のイベントを書き出してから終わる
    let _ = tokio::time::timeout(Duration::from_millis(200), forwarder).await;
    result.map_err(HostError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vl_core::domain::session::SessionStatus;
    use vl_core::infra::completion::fallback;

    #[test]
    fn test_cli_overrides_settings_file() {
        let path = std::env::temp_dir().join(format!("vl_host_{}.json", std::process::id()));
        std::fs::write(&path, r#"{"language":"ja-JP","completion_timeout_secs":10}"#).unwrap();
        let opts = TalkOptions {
            settings_path: Some(path.clone()),
            endpoint: Some("http://127.0.0.1:9999/api/chat".to_string()),
            synthesis: Some(SynthesisStrategy::Worker),
            ..TalkOptions::default()
        };
        let settings = load_settings(&opts).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(settings.language, "ja-JP");
        assert_eq!(settings.completion_timeout_secs, 10);
        assert_eq!(settings.completion_endpoint, "http://127.0.0.1:9999/api/chat");
        assert_eq!(settings.synthesis, SynthesisStrategy::Worker);
    }

    /// 上流がクォータ切れの中継サーバーを挟んで1ターン回す
    #[tokio::test]
    async fn test_console_turn_through_relay() {
        use axum::routing::post;
        use axum::Router;

        let upstream = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (
                    axum::http::StatusCode::TOO_MANY_REQUESTS,
                    r#"{"error":{"code":"insufficient_quota"}}"#,
                )
            }),
        );
        let up_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let up_addr = up_listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(up_listener, upstream).await.unwrap() });

        let relay_app = relay::router(relay::RelayConfig {
            api_key: Some("sk-test".to_string()),
            upstream_url: format!("http://{up_addr}/v1/chat/completions"),
            ..relay::RelayConfig::default()
        })
        .unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, relay_app).await.unwrap() });

        let settings = VoiceSettings {
            completion_endpoint: format!("http://{addr}/api/chat"),
            ..VoiceSettings::default()
        };
        let recognizer = Arc::new(ConsoleRecognizer::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let orch =
            build_orchestrator(&settings, recognizer.clone(), Duration::from_millis(1), tx)
                .unwrap();
        orch.initialize().await.unwrap();

        commands::say(&orch, &recognizer, "tell me a joke").await.unwrap();

        let mut reply = None;
        while let Some(event) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
        {
            match event {
                VoiceEvent::ReplyReady { text, degraded, .. } => {
                    assert!(!degraded);
                    reply = Some(text);
                }
                VoiceEvent::StateChanged(t) if t.new_state == SessionStatus::Idle => break,
                _ => {}
            }
        }
        assert_eq!(reply.unwrap(), fallback::canned_reply("tell me a joke"));
        assert!(orch.snapshot().session.last_error.is_none());
        orch.shutdown();
    }
}
