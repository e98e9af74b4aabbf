use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::error::{ErrorInfo, Rejection, TransitionError};
use crate::domain::event::VoiceEvent;
use crate::domain::session::{Session, SessionManager, SessionStatus, StateTransition};
use crate::domain::settings::VoiceSettings;
use crate::domain::stt::TranscriptResult;
use crate::domain::types::{CaptureStrategy, EngineState, PermissionState, SynthesisStrategy};
use crate::infra::capture::{CaptureOutput, CaptureSource, CaptureStopper, PendingOutcome};
use crate::infra::completion::{CompletionClient, CompletionError};
use crate::infra::metrics::{LatencyPhase, Metrics, MetricsSummary};
use crate::infra::stt::Transcriber;
use crate::infra::tts::{PlaybackEnd, SpeechOutput, Synthesizer};

const PERMISSION_DENIED_MESSAGE: &str =
    "Microphone access denied. Please allow microphone access and try again.";

/// オーケストレータが使う各ステージ
pub struct Components {
    pub capture: Arc<dyn CaptureSource>,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub completion: Arc<dyn CompletionClient>,
    pub speech: SpeechOutput,
}

/// UI 向けの状態スナップショット
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub session: Session,
    pub permission: PermissionState,
    pub capture_strategy: CaptureStrategy,
    pub synthesis_strategy: SynthesisStrategy,
    pub transcription_engine: EngineState,
    pub synthesis_engine: EngineState,
    pub ready: bool,
}

/// ターン途中で打ち切る理由
enum TurnEnd {
    /// セッションが入れ替わった、または既に別経路で終了した
    Superseded(TransitionError),
    Failed(ErrorInfo),
}

impl From<TransitionError> for TurnEnd {
    fn from(e: TransitionError) -> Self {
        TurnEnd::Superseded(e)
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// 音声対話ループのオーケストレータ
///
/// capture → transcription → completion → synthesis を1ターンとして進める。
/// 各ターンは tokio タスクで動き、結果は session_id 付きで SessionManager に適用される。
pub struct VoiceOrchestrator {
    session_mgr: Mutex<SessionManager>,
    permission: Mutex<PermissionState>,
    capture: Arc<dyn CaptureSource>,
    transcriber: Arc<dyn Transcriber>,
    synthesizer: Arc<dyn Synthesizer>,
    completion: Arc<dyn CompletionClient>,
    speech: SpeechOutput,
    metrics: Metrics,
    events: mpsc::UnboundedSender<VoiceEvent>,
    active_capture: Mutex<Option<(String, CaptureStopper)>>,
    turn_task: Mutex<Option<JoinHandle<()>>>,
    start_gate: tokio::sync::Mutex<()>,
    completion_timeout: Duration,
    shut_down: AtomicBool,
}

impl VoiceOrchestrator {
    pub fn new(
        components: Components,
        settings: &VoiceSettings,
        events: mpsc::UnboundedSender<VoiceEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_mgr: Mutex::new(SessionManager::new(now())),
            permission: Mutex::new(PermissionState::Unknown),
            capture: components.capture,
            transcriber: components.transcriber,
            synthesizer: components.synthesizer,
            completion: components.completion,
            speech: components.speech,
            metrics: Metrics::new(),
            events,
            active_capture: Mutex::new(None),
            turn_task: Mutex::new(None),
            start_gate: tokio::sync::Mutex::new(()),
            completion_timeout: settings.completion_timeout(),
            shut_down: AtomicBool::new(false),
        })
    }

    // ==================== Lifecycle ====================

    /// 両エンジンを初期化し、権限状態を問い合わせる
    pub async fn initialize(&self) -> Result<(), ErrorInfo> {
        let (stt, tts) = tokio::join!(self.transcriber.initialize(), self.synthesizer.initialize());
        if let Err(e) = stt.and(tts) {
            log::error!("Engine initialization failed: {}", e);
            self.metrics.inc_error(e.kind);
            self.session_mgr.lock().unwrap().set_error(e.clone());
            self.emit(VoiceEvent::Error {
                session_id: None,
                error: e.clone(),
            });
            return Err(e);
        }

        log::info!(
            "Engines ready (capture: {:?}, synthesis: {:?}, completion: {})",
            self.capture.strategy(),
            self.speech.strategy(),
            self.completion.name()
        );
        self.emit(VoiceEvent::EnginesReady);
        self.refresh_permission().await;
        Ok(())
    }

    /// 両エンジンが Ready で、終了処理前か
    pub fn is_ready(&self) -> bool {
        !self.shut_down.load(Ordering::SeqCst)
            && self.transcriber.state() == EngineState::Ready
            && self.synthesizer.state() == EngineState::Ready
    }

    /// 進行中の処理を止めてエンジンを破棄する。状態に関わらず実行する。
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Shutting down voice loop");
        if let Some(task) = self.turn_task.lock().unwrap().take() {
            task.abort();
        }
        self.stop_active_capture();
        self.speech.cancel();
        let transition = self.session_mgr.lock().unwrap().abandon_turn(now());
        if let Some(t) = transition {
            self.publish(t);
        }
        self.transcriber.dispose();
        self.synthesizer.dispose();
    }

    // ==================== Commands ====================

    /// 新しいターンを開始してキャプチャに入る
    ///
    /// 発話中なら発話を止めてから開始する。
    pub async fn start_listening(self: &Arc<Self>) -> Result<StateTransition, Rejection> {
        let _gate = self.start_gate.lock().await;
        if !self.is_ready() {
            return Err(Rejection::NotReady);
        }
        if self.status() == SessionStatus::Speaking {
            self.stop_speaking();
        }

        // 拒否済みならターンを始めない
        let permission = self.permission();
        if permission == PermissionState::Denied && self.status() == SessionStatus::Idle {
            self.reject_denied();
            return Err(Rejection::PermissionDenied);
        }

        let session_id = self
            .session_mgr
            .lock()
            .unwrap()
            .begin_turn(now())
            .map_err(|e| match e {
                TransitionError::InvalidState { state, .. } => Rejection::Busy(state.to_string()),
                TransitionError::Stale => Rejection::Busy("superseded".to_string()),
            })?;
        self.metrics.inc_turns_started();
        log::info!("[{}] turn started", session_id);

        if permission != PermissionState::Granted {
            let t = self
                .session_mgr
                .lock()
                .unwrap()
                .await_permission(&session_id, now())
                .map_err(|_| Rejection::Busy("superseded".to_string()))?;
            self.publish(t);

            match self.capture.request_permission().await {
                Ok(PermissionState::Granted) => self.set_permission(PermissionState::Granted),
                Ok(other) => {
                    self.set_permission(other);
                    self.fail(&session_id, ErrorInfo::permission_denied(PERMISSION_DENIED_MESSAGE));
                    return Err(Rejection::PermissionDenied);
                }
                Err(e) => {
                    let info = ErrorInfo::from(e);
                    self.fail(&session_id, info.clone());
                    return Err(Rejection::CaptureFailed(info));
                }
            }
        }

        let handle = match self.capture.start().await {
            Ok(handle) => handle,
            Err(e) => {
                let info = ErrorInfo::from(e);
                self.fail(&session_id, info.clone());
                return Err(Rejection::CaptureFailed(info));
            }
        };

        // 権限待ちの間にキャンセルされていればキャプチャを捨てる（drop で停止）
        let transition = self
            .session_mgr
            .lock()
            .unwrap()
            .start_listening(&session_id, now())
            .map_err(|_| Rejection::Busy("superseded".to_string()))?;

        let (stopper, outcome) = handle.split();
        *self.active_capture.lock().unwrap() = Some((session_id.clone(), stopper));
        self.publish(transition.clone());

        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.run_turn(session_id, outcome).await });
        *self.turn_task.lock().unwrap() = Some(task);

        Ok(transition)
    }

    /// キャプチャを止める。書き起こし以降はそのまま進む。
    pub fn stop_listening(&self) -> bool {
        if self.status() != SessionStatus::Listening {
            return false;
        }
        self.stop_active_capture()
    }

    /// 発話を止めて Idle に戻る
    pub fn stop_speaking(&self) -> Option<StateTransition> {
        let session_id = {
            let mgr = self.session_mgr.lock().unwrap();
            if mgr.status() != SessionStatus::Speaking {
                return None;
            }
            mgr.session_id().to_string()
        };
        self.speech.cancel();
        let transition = self
            .session_mgr
            .lock()
            .unwrap()
            .return_to_idle(&session_id, now())
            .ok()?;
        log::info!("[{}] speech stopped", session_id);
        self.publish(transition.clone());
        Some(transition)
    }

    /// 進行中のターンを放棄する。遅れて届く結果はすべて捨てられる。
    pub fn cancel_turn(&self) -> Option<StateTransition> {
        let transition = self.session_mgr.lock().unwrap().abandon_turn(now())?;
        self.stop_active_capture();
        self.speech.cancel();
        log::info!("Turn cancelled (was {})", transition.prev_state);
        self.publish(transition.clone());
        Some(transition)
    }

    /// アクティブエラーを消す
    pub fn clear_error(&self) -> bool {
        let cleared = self.session_mgr.lock().unwrap().clear_error();
        if cleared.is_some() {
            self.emit(VoiceEvent::ErrorCleared);
        }
        cleared.is_some()
    }

    /// 権限状態を問い合わせ直す
    pub async fn refresh_permission(&self) -> PermissionState {
        let permission = self.capture.query_permission().await;
        self.set_permission(permission);
        permission
    }

    // ==================== Queries ====================

    pub fn status(&self) -> SessionStatus {
        self.session_mgr.lock().unwrap().status()
    }

    pub fn permission(&self) -> PermissionState {
        *self.permission.lock().unwrap()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            session: self.session_mgr.lock().unwrap().active().clone(),
            permission: self.permission(),
            capture_strategy: self.capture.strategy(),
            synthesis_strategy: self.speech.strategy(),
            transcription_engine: self.transcriber.state(),
            synthesis_engine: self.synthesizer.state(),
            ready: self.is_ready(),
        }
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }

    // ==================== Turn ====================

    async fn run_turn(self: Arc<Self>, session_id: String, outcome: PendingOutcome) {
        match self.drive_turn(&session_id, outcome).await {
            Ok(()) => {}
            Err(TurnEnd::Failed(info)) => self.fail(&session_id, info),
            Err(TurnEnd::Superseded(e)) => {
                log::debug!("[{}] dropping result: {}", session_id, e);
            }
        }
    }

    async fn drive_turn(&self, session_id: &str, outcome: PendingOutcome) -> Result<(), TurnEnd> {
        let captured = outcome.wait().await;
        self.release_capture(session_id);

        let transcript = match captured.map_err(|e| TurnEnd::Failed(e.into()))? {
            CaptureOutput::Empty => return self.finish_quietly(session_id, "no audio captured"),
            CaptureOutput::Recognized { text, .. } if text.trim().is_empty() => {
                return self.finish_quietly(session_id, "blank transcript")
            }
            CaptureOutput::Recognized { text, latency_ms } => {
                self.enter_processing(session_id)?;
                TranscriptResult { text, latency_ms }
            }
            CaptureOutput::Segment(segment) => {
                self.enter_processing(session_id)?;
                self.transcriber
                    .transcribe(&segment)
                    .await
                    .map_err(TurnEnd::Failed)?
            }
        };

        self.session_mgr.lock().unwrap().record_transcript(
            session_id,
            &transcript.text,
            transcript.latency_ms,
        )?;
        self.metrics.inc_transcripts();
        self.metrics
            .record_latency(LatencyPhase::Stt, transcript.latency_ms);
        log::info!("[{}] transcript: {:?}", session_id, transcript.text);
        self.emit(VoiceEvent::TranscriptReady {
            session_id: session_id.to_string(),
            text: transcript.text.clone(),
        });
        self.emit_metrics(session_id);

        if transcript.is_blank() {
            return self.finish_quietly(session_id, "blank transcript");
        }

        // completion
        let started = Instant::now();
        let degraded = tokio::time::timeout(
            self.completion_timeout,
            self.stream_reply(session_id, &transcript.text),
        )
        .await
        .map_err(|_| TurnEnd::Failed(CompletionError::Timeout(self.completion_timeout).into()))??;
        let api_latency = elapsed_ms(started);

        let reply = {
            let mut mgr = self.session_mgr.lock().unwrap();
            mgr.record_completion(session_id, api_latency)?;
            mgr.active().reply_text.clone()
        };
        self.metrics.inc_replies(degraded);
        self.metrics.record_latency(LatencyPhase::Api, api_latency);
        log::info!(
            "[{}] reply ready in {:.0}ms{}",
            session_id,
            api_latency,
            if degraded { " (canned)" } else { "" }
        );
        self.emit(VoiceEvent::ReplyReady {
            session_id: session_id.to_string(),
            text: reply.clone(),
            degraded,
        });
        self.emit_metrics(session_id);

        if reply.trim().is_empty() {
            return self.finish_quietly(session_id, "empty reply");
        }

        // synthesis
        let playback = self
            .speech
            .start(&reply, self.synthesizer.as_ref())
            .await
            .map_err(TurnEnd::Failed)?;
        let started = self.session_mgr.lock().unwrap().on_playback_started(
            session_id,
            playback.latency_ms,
            now(),
        );
        let transition = match started {
            Ok(t) => t,
            Err(e) => {
                self.speech.cancel_playback(playback.id);
                return Err(e.into());
            }
        };
        self.publish(transition);
        self.metrics
            .record_latency(LatencyPhase::Tts, playback.latency_ms);
        self.emit_metrics(session_id);

        match playback.finished().await {
            PlaybackEnd::Finished => {
                let (transition, metrics) = {
                    let mut mgr = self.session_mgr.lock().unwrap();
                    let t = mgr.on_playback_finished(session_id, now())?;
                    (t, mgr.active().metrics)
                };
                self.publish(transition);
                self.metrics.inc_turns_completed();
                if let Some(total) = metrics.total_latency_ms() {
                    self.metrics.record_latency(LatencyPhase::Total, total);
                }
                Ok(())
            }
            // stop_speaking / cancel_turn が既に状態を戻している
            PlaybackEnd::Cancelled => Ok(()),
            PlaybackEnd::Failed(e) => Err(TurnEnd::Failed(ErrorInfo::synthesis(format!(
                "Speech synthesis error: {e}"
            )))),
        }
    }

    /// 応答フラグメントを到着順に追記する。戻り値は定型応答かどうか。
    async fn stream_reply(&self, session_id: &str, transcript: &str) -> Result<bool, TurnEnd> {
        let mut stream = self
            .completion
            .send(transcript)
            .await
            .map_err(|e| TurnEnd::Failed(e.into()))?;

        while let Some(next) = stream.next_fragment().await {
            let fragment = next.map_err(|e| TurnEnd::Failed(e.into()))?;
            self.session_mgr
                .lock()
                .unwrap()
                .append_reply(session_id, &fragment)?;
            self.emit(VoiceEvent::ReplyDelta {
                session_id: session_id.to_string(),
                fragment,
            });
        }
        Ok(stream.is_degraded())
    }

    fn enter_processing(&self, session_id: &str) -> Result<(), TurnEnd> {
        let t = self
            .session_mgr
            .lock()
            .unwrap()
            .on_capture_finished(session_id, now())?;
        self.publish(t);
        Ok(())
    }

    fn finish_quietly(&self, session_id: &str, reason: &str) -> Result<(), TurnEnd> {
        let t = self
            .session_mgr
            .lock()
            .unwrap()
            .return_to_idle(session_id, now())?;
        log::info!("[{}] back to idle: {}", session_id, reason);
        self.publish(t);
        Ok(())
    }

    /// ステージ失敗を記録して Idle へ。別セッション宛てなら捨てる。
    fn fail(&self, session_id: &str, error: ErrorInfo) {
        let result = self
            .session_mgr
            .lock()
            .unwrap()
            .on_failure(session_id, error.clone(), now());
        match result {
            Ok(t) => {
                log::warn!("[{}] {}", session_id, error);
                self.metrics.inc_error(error.kind);
                if error.kind.revokes_permission() {
                    self.set_permission(PermissionState::Denied);
                }
                self.release_capture(session_id);
                self.emit(VoiceEvent::Error {
                    session_id: Some(session_id.to_string()),
                    error,
                });
                self.publish(t);
            }
            Err(e) => log::debug!("[{}] dropping failure ({}): {}", session_id, e, error),
        }
    }

    /// 拒否済みの権限で開始を求められた。現在のセッションにエラーだけ残す。
    fn reject_denied(&self) {
        let error = ErrorInfo::permission_denied(PERMISSION_DENIED_MESSAGE);
        let session_id = {
            let mut mgr = self.session_mgr.lock().unwrap();
            mgr.set_error(error.clone());
            mgr.session_id().to_string()
        };
        log::warn!("[{}] {}", session_id, error);
        self.metrics.inc_error(error.kind);
        self.emit(VoiceEvent::Error {
            session_id: Some(session_id),
            error,
        });
    }

    // ==================== Helpers ====================

    fn stop_active_capture(&self) -> bool {
        match self.active_capture.lock().unwrap().take() {
            Some((_, mut stopper)) => {
                stopper.stop();
                true
            }
            None => false,
        }
    }

    /// このターンのキャプチャだけを外す
    fn release_capture(&self, session_id: &str) {
        let mut active = self.active_capture.lock().unwrap();
        if active.as_ref().map(|(id, _)| id.as_str()) == Some(session_id) {
            if let Some((_, mut stopper)) = active.take() {
                stopper.stop();
            }
        }
    }

    fn set_permission(&self, permission: PermissionState) {
        let changed = {
            let mut current = self.permission.lock().unwrap();
            let changed = *current != permission;
            *current = permission;
            changed
        };
        if changed {
            log::info!("Microphone permission: {:?}", permission);
            self.emit(VoiceEvent::PermissionChanged { permission });
        }
    }

    fn publish(&self, transition: StateTransition) {
        if transition.prev_state == transition.new_state.as_str() {
            return;
        }
        log::debug!(
            "[{}] {} -> {}",
            transition.session_id,
            transition.prev_state,
            transition.new_state.as_str()
        );
        self.emit(VoiceEvent::StateChanged(transition));
    }

    fn emit_metrics(&self, session_id: &str) {
        let metrics = {
            let mgr = self.session_mgr.lock().unwrap();
            if mgr.session_id() != session_id {
                return;
            }
            mgr.active().metrics
        };
        self.emit(VoiceEvent::MetricsUpdated {
            session_id: session_id.to_string(),
            metrics,
        });
    }

    fn emit(&self, event: VoiceEvent) {
        // 受信側が閉じていてもループは続ける
        let _ = self.events.send(event);
    }
}
