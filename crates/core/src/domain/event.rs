use serde::Serialize;

use super::error::ErrorInfo;
use super::session::StateTransition;
use super::types::{LatencyMetrics, PermissionState};

/// オーケストレータから UI へ流れるイベント
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum VoiceEvent {
    StateChanged(StateTransition),
    EnginesReady,
    PermissionChanged {
        permission: PermissionState,
    },
    TranscriptReady {
        session_id: String,
        text: String,
    },
    ReplyDelta {
        session_id: String,
        fragment: String,
    },
    ReplyReady {
        session_id: String,
        text: String,
        degraded: bool,
    },
    MetricsUpdated {
        session_id: String,
        metrics: LatencyMetrics,
    },
    Error {
        session_id: Option<String>,
        error: ErrorInfo,
    },
    ErrorCleared,
}

impl VoiceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateChanged(_) => "state_changed",
            Self::EnginesReady => "engines_ready",
            Self::PermissionChanged { .. } => "permission_changed",
            Self::TranscriptReady { .. } => "transcript_ready",
            Self::ReplyDelta { .. } => "reply_delta",
            Self::ReplyReady { .. } => "reply_ready",
            Self::MetricsUpdated { .. } => "metrics_updated",
            Self::Error { .. } => "error",
            Self::ErrorCleared => "error_cleared",
        }
    }
}
