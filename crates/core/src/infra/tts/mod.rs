mod model;
mod output;
mod platform;

pub use model::ToneSpeechModel;
#[cfg(feature = "device")]
pub use output::CpalAudioOutput;
pub use output::{AudioOutput, PlaybackControl, PlaybackHandle, SimulatedAudioOutput};
pub use platform::{SimulatedSpeechPlatform, SpeechPlatform, Utterance, UtteranceEvent};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::domain::error::ErrorInfo;
use crate::domain::settings::VoiceSettings;
use crate::domain::types::{EngineState, SynthesisStrategy};
use crate::domain::worker::{WorkerRequest, WorkerResponse};
use crate::infra::worker::{EngineHandle, WorkerError, WorkerLink};

// ─── Synthesizer ─────────────────────────────────────────────────

/// 音声合成エンジン trait
#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn state(&self) -> EngineState;

    async fn initialize(&self) -> Result<(), ErrorInfo>;

    /// テキストから PCM サンプルを生成する
    async fn synthesize(&self, text: &str) -> Result<Vec<f32>, ErrorInfo>;

    fn dispose(&self);
}

/// ワーカー上のモデルで合成する Synthesizer
pub struct WorkerSynthesizer {
    engine: EngineHandle,
}

impl WorkerSynthesizer {
    pub fn new(link: WorkerLink) -> Self {
        Self {
            engine: EngineHandle::new(link),
        }
    }

    /// スタブモデルを専用スレッドで起動する
    pub fn spawn_default(sample_rate: u32) -> Result<Self, WorkerError> {
        let model = ToneSpeechModel::new(sample_rate, std::time::Duration::from_secs(2));
        Ok(Self::new(WorkerLink::spawn(model)?))
    }
}

#[async_trait]
impl Synthesizer for WorkerSynthesizer {
    fn state(&self) -> EngineState {
        self.engine.state()
    }

    async fn initialize(&self) -> Result<(), ErrorInfo> {
        self.engine.initialize().await
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<f32>, ErrorInfo> {
        let response = self
            .engine
            .request(WorkerRequest::synthesize(text))
            .await
            .map_err(|e| ErrorInfo::synthesis(e.to_string()))?;

        match response {
            WorkerResponse::Audio {
                audio_buffer,
                latency,
            } => {
                log::debug!(
                    "Synthesized {} samples (worker {:.1}ms)",
                    audio_buffer.len(),
                    latency
                );
                Ok(audio_buffer)
            }
            WorkerResponse::Error { error } => Err(ErrorInfo::synthesis(error)),
            other => Err(ErrorInfo::synthesis(format!(
                "Unexpected {} reply to synthesize",
                other.type_name()
            ))),
        }
    }

    fn dispose(&self) {
        self.engine.dispose();
    }
}

// ─── SpeechOutput ────────────────────────────────────────────────

/// 再生の終わり方
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEnd {
    Finished,
    /// cancel() で止められた
    Cancelled,
    Failed(String),
}

/// 開始済みの再生
pub struct ActivePlayback {
    pub id: u64,
    /// 合成要求から音が出始めるまで
    pub latency_ms: f64,
    finished: oneshot::Receiver<PlaybackEnd>,
}

impl ActivePlayback {
    pub async fn finished(self) -> PlaybackEnd {
        self.finished.await.unwrap_or(PlaybackEnd::Cancelled)
    }
}

enum Stop {
    Native(Arc<dyn SpeechPlatform>),
    Playback(oneshot::Sender<()>),
}

struct ActiveOutput {
    id: u64,
    stop: Stop,
}

impl ActiveOutput {
    fn stop(self) {
        match self.stop {
            Stop::Native(platform) => platform.cancel(),
            Stop::Playback(tx) => {
                let _ = tx.send(());
            }
        }
    }
}

type Current = Arc<Mutex<Option<ActiveOutput>>>;

/// 終了イベントを確定する。既に cancel() で外されていれば Cancelled。
fn settle(current: &Current, id: u64, end: PlaybackEnd) -> PlaybackEnd {
    let mut current = current.lock().unwrap();
    match current.as_ref() {
        Some(active) if active.id == id => {
            current.take();
            end
        }
        _ => PlaybackEnd::Cancelled,
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// 音声出力: 同時に鳴らすのは高々1つ
pub struct SpeechOutput {
    strategy: SynthesisStrategy,
    platform: Option<Arc<dyn SpeechPlatform>>,
    audio: Arc<dyn AudioOutput>,
    lang: String,
    rate: f32,
    pitch: f32,
    volume: f32,
    sample_rate: u32,
    current: Current,
    next_id: AtomicU64,
}

impl SpeechOutput {
    pub fn new(
        settings: &VoiceSettings,
        platform: Option<Arc<dyn SpeechPlatform>>,
        audio: Arc<dyn AudioOutput>,
    ) -> Self {
        Self {
            strategy: settings.synthesis,
            platform,
            audio,
            lang: settings.language.clone(),
            rate: settings.utterance_rate,
            pitch: settings.utterance_pitch,
            volume: settings.utterance_volume,
            sample_rate: settings.playback_sample_rate,
            current: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    /// 実際に使う戦略（ネイティブが使えなければワーカー）
    pub fn strategy(&self) -> SynthesisStrategy {
        match (self.strategy, &self.platform) {
            (SynthesisStrategy::Native, Some(platform)) if platform.is_available() => {
                SynthesisStrategy::Native
            }
            _ => SynthesisStrategy::Worker,
        }
    }

    pub fn is_active(&self) -> bool {
        self.current.lock().unwrap().is_some()
    }

    /// 再生中の音声を止める
    pub fn cancel(&self) {
        let active = self.current.lock().unwrap().take();
        if let Some(active) = active {
            log::debug!("Cancelling playback #{}", active.id);
            active.stop();
        }
    }

    /// 指定の再生がまだ鳴っていれば止める
    pub fn cancel_playback(&self, id: u64) {
        let active = {
            let mut current = self.current.lock().unwrap();
            match current.as_ref() {
                Some(active) if active.id == id => current.take(),
                _ => None,
            }
        };
        if let Some(active) = active {
            active.stop();
        }
    }

    fn install(&self, active: ActiveOutput) {
        let prev = self.current.lock().unwrap().replace(active);
        if let Some(prev) = prev {
            prev.stop();
        }
    }

    fn release(&self, id: u64) {
        let mut current = self.current.lock().unwrap();
        if current.as_ref().map(|a| a.id) == Some(id) {
            current.take();
        }
    }

    /// 応答を読み上げる。先に鳴っている音声は止める。
    pub async fn start(
        &self,
        text: &str,
        synthesizer: &dyn Synthesizer,
    ) -> Result<ActivePlayback, ErrorInfo> {
        self.cancel();
        match (self.strategy(), &self.platform) {
            (SynthesisStrategy::Native, Some(platform)) => {
                self.start_native(text, platform.clone()).await
            }
            _ => {
                if self.strategy == SynthesisStrategy::Native {
                    log::warn!("Native speech synthesis not available, falling back to worker");
                }
                self.start_worker(text, synthesizer).await
            }
        }
    }

    async fn start_native(
        &self,
        text: &str,
        platform: Arc<dyn SpeechPlatform>,
    ) -> Result<ActivePlayback, ErrorInfo> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let utterance = Utterance {
            text: text.to_string(),
            lang: self.lang.clone(),
            rate: self.rate,
            pitch: self.pitch,
            volume: self.volume,
        };
        let mut events = platform
            .speak(utterance)
            .map_err(|e| ErrorInfo::synthesis(format!("Speech synthesis error: {e}")))?;
        self.install(ActiveOutput {
            id,
            stop: Stop::Native(platform),
        });

        let first = events.recv().await;
        let latency_ms = elapsed_ms(started);
        let (finished_tx, finished_rx) = oneshot::channel();

        match first {
            Some(UtteranceEvent::Started) => {
                let current = self.current.clone();
                tokio::spawn(async move {
                    let end = loop {
                        match events.recv().await {
                            Some(UtteranceEvent::Started) => continue,
                            Some(UtteranceEvent::Ended) => break PlaybackEnd::Finished,
                            Some(UtteranceEvent::Error(e)) => break PlaybackEnd::Failed(e),
                            None => break PlaybackEnd::Cancelled,
                        }
                    };
                    let _ = finished_tx.send(settle(&current, id, end));
                });
            }
            Some(UtteranceEvent::Ended) => {
                let _ = finished_tx.send(settle(&self.current, id, PlaybackEnd::Finished));
            }
            Some(UtteranceEvent::Error(e)) => {
                self.release(id);
                return Err(ErrorInfo::synthesis(format!("Speech synthesis error: {e}")));
            }
            None => {
                self.release(id);
                return Err(ErrorInfo::synthesis("Utterance was cancelled before it started"));
            }
        }

        log::info!("Speaking (native) after {:.1}ms", latency_ms);
        Ok(ActivePlayback {
            id,
            latency_ms,
            finished: finished_rx,
        })
    }

    async fn start_worker(
        &self,
        text: &str,
        synthesizer: &dyn Synthesizer,
    ) -> Result<ActivePlayback, ErrorInfo> {
        let started = Instant::now();
        let samples = synthesizer.synthesize(text).await?;
        let PlaybackHandle { stop_tx, done_rx } = self
            .audio
            .play(samples, self.sample_rate)
            .map_err(|e| ErrorInfo::synthesis(format!("Audio playback failed: {e}")))?;
        let latency_ms = elapsed_ms(started);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.install(ActiveOutput {
            id,
            stop: Stop::Playback(stop_tx),
        });

        let (finished_tx, finished_rx) = oneshot::channel();
        let current = self.current.clone();
        tokio::spawn(async move {
            let end = match done_rx.await {
                Ok(Ok(())) => PlaybackEnd::Finished,
                Ok(Err(e)) => PlaybackEnd::Failed(e),
                Err(_) => PlaybackEnd::Cancelled,
            };
            let _ = finished_tx.send(settle(&current, id, end));
        });

        log::info!("Speaking (worker audio) after {:.1}ms", latency_ms);
        Ok(ActivePlayback {
            id,
            latency_ms,
            finished: finished_rx,
        })
    }
}
