use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

/// 発話リクエスト
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Utterance {
    pub text: String,
    pub lang: String,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

/// 発話のライフサイクルイベント
#[derive(Debug, Clone, PartialEq)]
pub enum UtteranceEvent {
    Started,
    Ended,
    Error(String),
}

/// プラットフォームの発話エンジン
///
/// `cancel()` 後はその発話のイベントチャネルを閉じる（`Ended` は送らなくてよい）。
pub trait SpeechPlatform: Send + Sync {
    fn is_available(&self) -> bool;

    fn speak(&self, utterance: Utterance) -> Result<mpsc::UnboundedReceiver<UtteranceEvent>, String>;

    /// 進行中の発話をすべて止める
    fn cancel(&self);
}

/// 発話時間だけ待ってイベントを送る発話エンジン（音は出さない）
pub struct SimulatedSpeechPlatform {
    per_word: Duration,
    active: Mutex<Option<oneshot::Sender<()>>>,
}

impl Default for SimulatedSpeechPlatform {
    /// 150 wpm
    fn default() -> Self {
        Self::new(Duration::from_millis(400))
    }
}

impl SimulatedSpeechPlatform {
    pub fn new(per_word: Duration) -> Self {
        Self {
            per_word,
            active: Mutex::new(None),
        }
    }

    fn duration_for(&self, utterance: &Utterance) -> Duration {
        let words = utterance.text.split_whitespace().count().max(1) as f64;
        let rate = if utterance.rate > 0.0 {
            utterance.rate as f64
        } else {
            1.0
        };
        let ms = self.per_word.as_millis() as f64 * words / rate;
        Duration::from_millis(ms.round() as u64)
    }
}

impl SpeechPlatform for SimulatedSpeechPlatform {
    fn is_available(&self) -> bool {
        true
    }

    fn speak(&self, utterance: Utterance) -> Result<mpsc::UnboundedReceiver<UtteranceEvent>, String> {
        let duration = self.duration_for(&utterance);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        if let Some(prev) = self.active.lock().unwrap().replace(cancel_tx) {
            let _ = prev.send(());
        }

        tokio::spawn(async move {
            let _ = event_tx.send(UtteranceEvent::Started);
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    let _ = event_tx.send(UtteranceEvent::Ended);
                }
                // キャンセル時は何も送らずにチャネルを閉じる
                _ = cancel_rx => {}
            }
        });
        Ok(event_rx)
    }

    fn cancel(&self) {
        if let Some(tx) = self.active.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}
