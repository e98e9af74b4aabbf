//! コンソール用の認識器と発話エンジン
//!
//! 入力行をそのまま「認識された発話」として扱い、応答は標準エラーに表示する。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use vl_core::domain::types::PermissionState;
use vl_core::infra::capture::{CaptureError, RecognitionEvent, SpeechRecognizer};
use vl_core::infra::tts::{SimulatedSpeechPlatform, SpeechPlatform, Utterance, UtteranceEvent};

/// 入力行を確定結果として返す認識器
///
/// 認識中に積まれた発話はその場で確定し、認識を終える。
/// 認識前に積まれた発話は次の `start` で確定する。
#[derive(Default)]
pub struct ConsoleRecognizer {
    pending: Mutex<VecDeque<String>>,
    active: Mutex<Option<mpsc::UnboundedSender<RecognitionEvent>>>,
}

impl ConsoleRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 発話を積む
    pub fn queue(&self, text: impl Into<String>) {
        self.pending.lock().unwrap().push_back(text.into());
        if let Some(tx) = self.active.lock().unwrap().take() {
            self.deliver(&tx);
        }
    }

    /// 使われなかった発話を捨てる
    pub fn discard_pending(&self) -> usize {
        let mut pending = self.pending.lock().unwrap();
        let n = pending.len();
        pending.clear();
        n
    }

    fn deliver(&self, tx: &mpsc::UnboundedSender<RecognitionEvent>) {
        if let Some(text) = self.pending.lock().unwrap().pop_front() {
            let _ = tx.send(RecognitionEvent::Result { transcript: text });
        }
        let _ = tx.send(RecognitionEvent::End);
    }
}

#[async_trait]
impl SpeechRecognizer for ConsoleRecognizer {
    fn is_supported(&self) -> bool {
        true
    }

    async fn query_permission(&self) -> PermissionState {
        PermissionState::Granted
    }

    async fn request_permission(&self) -> PermissionState {
        PermissionState::Granted
    }

    fn start(&self, _lang: &str) -> Result<mpsc::UnboundedReceiver<RecognitionEvent>, CaptureError> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.pending.lock().unwrap().is_empty() {
            *self.active.lock().unwrap() = Some(tx);
        } else {
            self.deliver(&tx);
        }
        Ok(rx)
    }

    fn stop(&self) {
        if let Some(tx) = self.active.lock().unwrap().take() {
            self.deliver(&tx);
        }
    }
}

/// 応答を標準エラーに表示し、読み上げ時間だけ待つ発話エンジン
pub struct ConsoleSpeechPlatform {
    inner: SimulatedSpeechPlatform,
}

impl ConsoleSpeechPlatform {
    pub fn new(per_word: Duration) -> Self {
        Self {
            inner: SimulatedSpeechPlatform::new(per_word),
        }
    }
}

impl SpeechPlatform for ConsoleSpeechPlatform {
    fn is_available(&self) -> bool {
        true
    }

    fn speak(&self, utterance: Utterance) -> Result<mpsc::UnboundedReceiver<UtteranceEvent>, String> {
        eprintln!("assistant> {}", utterance.text);
        self.inner.speak(utterance)
    }

    fn cancel(&self) {
        self.inner.cancel();
    }
}
