use serde::Serialize;

use super::error::{ErrorInfo, TransitionError};
use super::types::LatencyMetrics;

/// セッション状態（UI から観測される唯一のステータス）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    AwaitingPermission,
    Listening,
    Processing,
    Speaking,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingPermission => "awaiting_permission",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
        }
    }
}

/// セッション（現在のターンの可変レコード）
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    pub status: SessionStatus,
    pub transcript: String,
    pub reply_text: String,
    pub metrics: LatencyMetrics,
    pub last_error: Option<ErrorInfo>,
    pub created_at: String,
    pub updated_at: String,
}

impl Session {
    pub fn new(session_id: String, now: String) -> Self {
        Self {
            session_id,
            status: SessionStatus::Idle,
            transcript: String::new(),
            reply_text: String::new(),
            metrics: LatencyMetrics::default(),
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// 状態遷移イベントペイロード
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub session_id: String,
    pub prev_state: String,
    pub new_state: SessionStatus,
}

/// セッションマネージャー（単一アクティブセッション）
///
/// 非同期ステージの結果はすべて session_id 付きで適用し、
/// 既に入れ替わったセッション宛ての結果は `TransitionError::Stale` で拒否する。
pub struct SessionManager {
    active: Session,
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl SessionManager {
    pub fn new(now: String) -> Self {
        Self {
            active: Session::new(new_session_id(), now),
        }
    }

    /// アクティブセッションの参照
    pub fn active(&self) -> &Session {
        &self.active
    }

    pub fn status(&self) -> SessionStatus {
        self.active.status
    }

    pub fn session_id(&self) -> &str {
        &self.active.session_id
    }

    fn current(&mut self, session_id: &str) -> Result<&mut Session, TransitionError> {
        if self.active.session_id != session_id {
            return Err(TransitionError::Stale);
        }
        Ok(&mut self.active)
    }

    fn transition(session: &mut Session, new_state: SessionStatus, now: String) -> StateTransition {
        let prev = session.status.as_str().to_string();
        session.status = new_state;
        session.updated_at = now;
        StateTransition {
            session_id: session.session_id.clone(),
            prev_state: prev,
            new_state,
        }
    }

    /// 新しいターンを開始（Idle のみ）。一時フィールドを破棄し新しい session_id を発行する。
    pub fn begin_turn(&mut self, now: String) -> Result<String, TransitionError> {
        if self.active.status != SessionStatus::Idle {
            return Err(TransitionError::invalid_state(
                "begin_turn",
                self.active.status.as_str(),
            ));
        }
        self.active = Session::new(new_session_id(), now);
        Ok(self.active.session_id.clone())
    }

    /// Idle → AwaitingPermission
    pub fn await_permission(
        &mut self,
        session_id: &str,
        now: String,
    ) -> Result<StateTransition, TransitionError> {
        let session = self.current(session_id)?;
        match session.status {
            SessionStatus::Idle => Ok(Self::transition(
                session,
                SessionStatus::AwaitingPermission,
                now,
            )),
            other => Err(TransitionError::invalid_state(
                "await_permission",
                other.as_str(),
            )),
        }
    }

    /// Idle / AwaitingPermission → Listening
    pub fn start_listening(
        &mut self,
        session_id: &str,
        now: String,
    ) -> Result<StateTransition, TransitionError> {
        let session = self.current(session_id)?;
        match session.status {
            SessionStatus::Idle | SessionStatus::AwaitingPermission => {
                Ok(Self::transition(session, SessionStatus::Listening, now))
            }
            other => Err(TransitionError::invalid_state(
                "start_listening",
                other.as_str(),
            )),
        }
    }

    /// キャプチャ停止シグナル受信: Listening → Processing
    pub fn on_capture_finished(
        &mut self,
        session_id: &str,
        now: String,
    ) -> Result<StateTransition, TransitionError> {
        let session = self.current(session_id)?;
        match session.status {
            SessionStatus::Listening => {
                Ok(Self::transition(session, SessionStatus::Processing, now))
            }
            other => Err(TransitionError::invalid_state(
                "on_capture_finished",
                other.as_str(),
            )),
        }
    }

    /// 書き起こし結果を記録（Processing 内部、外部から見える遷移なし）
    pub fn record_transcript(
        &mut self,
        session_id: &str,
        text: &str,
        latency_ms: f64,
    ) -> Result<(), TransitionError> {
        let session = self.current(session_id)?;
        if session.status != SessionStatus::Processing {
            return Err(TransitionError::invalid_state(
                "record_transcript",
                session.status.as_str(),
            ));
        }
        session.transcript = text.to_string();
        session.metrics.stt_latency_ms = Some(latency_ms);
        Ok(())
    }

    /// 応答フラグメントを到着順に追記
    pub fn append_reply(&mut self, session_id: &str, fragment: &str) -> Result<(), TransitionError> {
        let session = self.current(session_id)?;
        if session.status != SessionStatus::Processing {
            return Err(TransitionError::invalid_state(
                "append_reply",
                session.status.as_str(),
            ));
        }
        session.reply_text.push_str(fragment);
        Ok(())
    }

    /// 応答ストリーム終了（api レイテンシ確定）
    pub fn record_completion(
        &mut self,
        session_id: &str,
        latency_ms: f64,
    ) -> Result<(), TransitionError> {
        let session = self.current(session_id)?;
        if session.status != SessionStatus::Processing {
            return Err(TransitionError::invalid_state(
                "record_completion",
                session.status.as_str(),
            ));
        }
        session.metrics.api_latency_ms = Some(latency_ms);
        Ok(())
    }

    /// 再生開始: Processing → Speaking
    pub fn on_playback_started(
        &mut self,
        session_id: &str,
        tts_latency_ms: f64,
        now: String,
    ) -> Result<StateTransition, TransitionError> {
        let session = self.current(session_id)?;
        match session.status {
            SessionStatus::Processing => {
                session.metrics.tts_latency_ms = Some(tts_latency_ms);
                Ok(Self::transition(session, SessionStatus::Speaking, now))
            }
            other => Err(TransitionError::invalid_state(
                "on_playback_started",
                other.as_str(),
            )),
        }
    }

    /// 再生終了: Speaking → Idle
    pub fn on_playback_finished(
        &mut self,
        session_id: &str,
        now: String,
    ) -> Result<StateTransition, TransitionError> {
        let session = self.current(session_id)?;
        match session.status {
            SessionStatus::Speaking => Ok(Self::transition(session, SessionStatus::Idle, now)),
            other => Err(TransitionError::invalid_state(
                "on_playback_finished",
                other.as_str(),
            )),
        }
    }

    /// エラーなしで Idle に戻る（空セグメント、空の書き起こし、発話キャンセル）
    pub fn return_to_idle(
        &mut self,
        session_id: &str,
        now: String,
    ) -> Result<StateTransition, TransitionError> {
        let session = self.current(session_id)?;
        match session.status {
            SessionStatus::Idle => Err(TransitionError::invalid_state("return_to_idle", "idle")),
            _ => Ok(Self::transition(session, SessionStatus::Idle, now)),
        }
    }

    /// ステージ失敗: * → Idle（エラーを記録）
    pub fn on_failure(
        &mut self,
        session_id: &str,
        error: ErrorInfo,
        now: String,
    ) -> Result<StateTransition, TransitionError> {
        let session = self.current(session_id)?;
        session.last_error = Some(error);
        Ok(Self::transition(session, SessionStatus::Idle, now))
    }

    /// ターンに紐づかないエラー（初期化失敗など）を記録。新しいエラーは古いものを置き換える。
    pub fn set_error(&mut self, error: ErrorInfo) {
        self.active.last_error = Some(error);
    }

    /// エラーを消す（ステータスは変えない）
    pub fn clear_error(&mut self) -> Option<ErrorInfo> {
        self.active.last_error.take()
    }

    /// 進行中のターンを放棄する。session_id を更新し、遅れて届く結果をすべて stale にする。
    pub fn abandon_turn(&mut self, now: String) -> Option<StateTransition> {
        if self.active.status == SessionStatus::Idle {
            return None;
        }
        let prev = self.active.status.as_str().to_string();
        self.active.session_id = new_session_id();
        self.active.status = SessionStatus::Idle;
        self.active.updated_at = now;
        Some(StateTransition {
            session_id: self.active.session_id.clone(),
            prev_state: prev,
            new_state: SessionStatus::Idle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorKind;

    fn now() -> String {
        "2025-01-15T10:30:00Z".to_string()
    }

    fn listening_manager() -> (SessionManager, String) {
        let mut mgr = SessionManager::new(now());
        let id = mgr.begin_turn(now()).unwrap();
        mgr.start_listening(&id, now()).unwrap();
        (mgr, id)
    }

    #[test]
    fn test_idle_to_listening() {
        let mut mgr = SessionManager::new(now());
        let id = mgr.begin_turn(now()).unwrap();
        let t = mgr.start_listening(&id, now()).unwrap();
        assert_eq!(t.prev_state, "idle");
        assert_eq!(t.new_state, SessionStatus::Listening);
    }

    #[test]
    fn test_permission_prompt_path() {
        let mut mgr = SessionManager::new(now());
        let id = mgr.begin_turn(now()).unwrap();
        let t = mgr.await_permission(&id, now()).unwrap();
        assert_eq!(t.new_state, SessionStatus::AwaitingPermission);
        let t = mgr.start_listening(&id, now()).unwrap();
        assert_eq!(t.prev_state, "awaiting_permission");
        assert_eq!(t.new_state, SessionStatus::Listening);
    }

    #[test]
    fn test_full_cycle() {
        let (mut mgr, id) = listening_manager();
        // Listening → Processing
        mgr.on_capture_finished(&id, now()).unwrap();
        mgr.record_transcript(&id, "hello there", 120.0).unwrap();
        mgr.append_reply(&id, "Hi! ").unwrap();
        mgr.append_reply(&id, "How can I help?").unwrap();
        mgr.record_completion(&id, 800.0).unwrap();
        // Processing → Speaking
        let t = mgr.on_playback_started(&id, 80.0, now()).unwrap();
        assert_eq!(t.new_state, SessionStatus::Speaking);
        // Speaking → Idle
        let t = mgr.on_playback_finished(&id, now()).unwrap();
        assert_eq!(t.new_state, SessionStatus::Idle);

        let s = mgr.active();
        assert_eq!(s.transcript, "hello there");
        assert_eq!(s.reply_text, "Hi! How can I help?");
        assert_eq!(s.metrics.total_latency_ms(), Some(1000.0));
    }

    #[test]
    fn test_begin_turn_resets_transient_fields() {
        let (mut mgr, id) = listening_manager();
        mgr.on_capture_finished(&id, now()).unwrap();
        mgr.record_transcript(&id, "old", 1.0).unwrap();
        mgr.on_failure(&id, ErrorInfo::network("down"), now()).unwrap();

        let new_id = mgr.begin_turn(now()).unwrap();
        assert_ne!(new_id, id);
        let s = mgr.active();
        assert!(s.transcript.is_empty());
        assert!(s.last_error.is_none());
        assert!(s.metrics.is_empty());
    }

    #[test]
    fn test_begin_turn_rejected_outside_idle() {
        let (mut mgr, _) = listening_manager();
        assert!(matches!(
            mgr.begin_turn(now()),
            Err(TransitionError::InvalidState { state: "listening", .. })
        ));
    }

    #[test]
    fn test_stale_results_are_rejected() {
        let (mut mgr, old_id) = listening_manager();
        mgr.on_capture_finished(&old_id, now()).unwrap();
        mgr.abandon_turn(now()).unwrap();
        let new_id = mgr.begin_turn(now()).unwrap();
        mgr.start_listening(&new_id, now()).unwrap();

        assert_eq!(
            mgr.record_transcript(&old_id, "stale", 1.0),
            Err(TransitionError::Stale)
        );
        assert_eq!(mgr.append_reply(&old_id, "stale"), Err(TransitionError::Stale));
        assert!(mgr.on_failure(&old_id, ErrorInfo::network("x"), now()).is_err());
        assert_eq!(mgr.status(), SessionStatus::Listening);
        assert!(mgr.active().transcript.is_empty());
        assert!(mgr.active().last_error.is_none());
    }

    #[test]
    fn test_failure_from_any_state_goes_idle() {
        let (mut mgr, id) = listening_manager();
        let t = mgr
            .on_failure(&id, ErrorInfo::device("unplugged"), now())
            .unwrap();
        assert_eq!(t.prev_state, "listening");
        assert_eq!(t.new_state, SessionStatus::Idle);
        assert_eq!(
            mgr.active().last_error.as_ref().map(|e| e.kind),
            Some(ErrorKind::DeviceError)
        );
    }

    #[test]
    fn test_clear_error_keeps_status() {
        let (mut mgr, _) = listening_manager();
        mgr.set_error(ErrorInfo::no_speech());
        assert!(mgr.clear_error().is_some());
        assert!(mgr.active().last_error.is_none());
        assert_eq!(mgr.status(), SessionStatus::Listening);
    }

    #[test]
    fn test_new_error_replaces_old() {
        let mut mgr = SessionManager::new(now());
        mgr.set_error(ErrorInfo::no_speech());
        mgr.set_error(ErrorInfo::network("offline"));
        assert_eq!(
            mgr.active().last_error.as_ref().map(|e| e.kind),
            Some(ErrorKind::NetworkError)
        );
    }

    #[test]
    fn test_invalid_playback_start_while_listening() {
        let (mut mgr, id) = listening_manager();
        assert!(mgr.on_playback_started(&id, 1.0, now()).is_err());
        assert!(mgr.append_reply(&id, "x").is_err());
    }

    #[test]
    fn test_abandon_turn_when_idle_is_noop() {
        let mut mgr = SessionManager::new(now());
        let id = mgr.session_id().to_string();
        assert!(mgr.abandon_turn(now()).is_none());
        assert_eq!(mgr.session_id(), id);
    }
}
