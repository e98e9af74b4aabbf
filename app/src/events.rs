use std::io::Write;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use vl_core::domain::event::VoiceEvent;

/// UI ブリッジへ流す1行分のペイロード
#[derive(Debug, Serialize)]
struct EventLine<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a VoiceEvent,
}

/// イベントを JSON 1行に符号化する
pub fn encode_event(event: &VoiceEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(&EventLine {
        timestamp: chrono::Utc::now().to_rfc3339(),
        event,
    })
}

/// 統一イベント送信関数
pub fn emit_event<W: Write>(out: &mut W, event: &VoiceEvent) {
    let line = match encode_event(event) {
        Ok(line) => line,
        Err(e) => {
            tracing::error!("failed to encode event [{}]: {e}", event.name());
            return;
        }
    };
    if let Err(e) = writeln!(out, "{line}").and_then(|_| out.flush()) {
        tracing::error!("failed to emit event [{}]: {e}", event.name());
    }
}

/// 任意の結果行（コマンド応答など）を書き出す
pub fn emit_line<W: Write, T: Serialize>(out: &mut W, payload: &T) {
    match serde_json::to_string(payload) {
        Ok(line) => {
            if let Err(e) = writeln!(out, "{line}").and_then(|_| out.flush()) {
                tracing::error!("failed to write output line: {e}");
            }
        }
        Err(e) => tracing::error!("failed to encode output line: {e}"),
    }
}

/// オーケストレータのイベントを標準出力へ流し続ける
pub fn spawn_forwarder(mut events: mpsc::UnboundedReceiver<VoiceEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::debug!(event = event.name(), "voice event");
            let stdout = std::io::stdout();
            emit_event(&mut stdout.lock(), &event);
        }
    })
}
