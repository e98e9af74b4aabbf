use std::sync::Mutex;

use crate::domain::error::ErrorInfo;
use crate::domain::types::EngineState;
use crate::domain::worker::{WorkerRequest, WorkerResponse};

use super::{WorkerError, WorkerLink};

/// エンジンハンドル: ワーカー接続とライフサイクル状態をまとめて持つ
///
/// `Uninitialized → Initializing → Ready → Disposed`。初期化失敗時は `Uninitialized` に戻る。
pub struct EngineHandle {
    link: WorkerLink,
    state: Mutex<EngineState>,
}

impl EngineHandle {
    pub fn new(link: WorkerLink) -> Self {
        Self {
            link,
            state: Mutex::new(EngineState::Uninitialized),
        }
    }

    pub fn name(&self) -> &str {
        self.link.name()
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap()
    }

    /// `init` を送り `initialized` を待つ。Ready なら何もしない。
    pub async fn initialize(&self) -> Result<(), ErrorInfo> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                EngineState::Ready => return Ok(()),
                busy @ (EngineState::Disposed | EngineState::Initializing) => {
                    return Err(ErrorInfo::initialization(format!(
                        "{} engine cannot initialize while {}",
                        self.name(),
                        busy.as_str()
                    )))
                }
                EngineState::Uninitialized => *state = EngineState::Initializing,
            }
        }

        let result = match self.link.call(WorkerRequest::Init).await {
            Ok(WorkerResponse::Initialized) => Ok(()),
            Ok(WorkerResponse::Error { error }) => Err(ErrorInfo::initialization(error)),
            Ok(other) => Err(ErrorInfo::initialization(format!(
                "Unexpected {} reply to init from {}",
                other.type_name(),
                self.name()
            ))),
            Err(e) => Err(ErrorInfo::initialization(e.to_string())),
        };

        let mut state = self.state.lock().unwrap();
        // dispose() が初期化中に呼ばれた場合はそのまま Disposed
        if *state == EngineState::Initializing {
            *state = if result.is_ok() {
                EngineState::Ready
            } else {
                EngineState::Uninitialized
            };
        }
        match &result {
            Ok(()) => log::info!("{} engine ready", self.name()),
            Err(e) => log::error!("{} engine failed to initialize: {}", self.name(), e),
        }
        result
    }

    /// 作業リクエストを送る。状態の検査はワーカー側が行う。
    pub async fn request(&self, request: WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        self.link.call(request).await
    }

    /// `cleanup` を送ってワーカーを終了させる。何度呼んでもよい。
    pub fn dispose(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == EngineState::Disposed {
            return;
        }
        if let Err(e) = self.link.post(WorkerRequest::Cleanup) {
            log::debug!("{} cleanup not delivered: {}", self.name(), e);
        }
        self.link.terminate();
        *state = EngineState::Disposed;
        log::info!("{} engine disposed", self.name());
    }
}
