use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use vl_core::domain::error::Rejection;
use vl_core::domain::session::StateTransition;
use vl_core::infra::metrics::MetricsSummary;
use vl_core::usecase::{Snapshot, VoiceOrchestrator};

use crate::console::ConsoleRecognizer;
use crate::events;

/// コマンドエラー型
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{0}")]
    Rejected(#[from] Rejection),
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("nothing to {0}")]
    Idle(&'static str),
}

impl serde::Serialize for CommandError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

type CmdResult<T> = Result<T, CommandError>;

/// コンソールからの1行
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// 発話として扱うテキスト
    Say(String),
    Stop,
    Cancel,
    Clear,
    Status,
    Metrics,
    Permission,
    Help,
    Quit,
}

/// 入力行を解釈する。空行は `None`。
pub fn parse_command(line: &str) -> CmdResult<Option<ConsoleCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(name) = line.strip_prefix('/') else {
        return Ok(Some(ConsoleCommand::Say(line.to_string())));
    };
    let command = match name {
        "stop" => ConsoleCommand::Stop,
        "cancel" => ConsoleCommand::Cancel,
        "clear" => ConsoleCommand::Clear,
        "status" => ConsoleCommand::Status,
        "metrics" => ConsoleCommand::Metrics,
        "permission" => ConsoleCommand::Permission,
        "help" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(CommandError::Unknown(format!("/{other}"))),
    };
    Ok(Some(command))
}

const HELP: &str = "type to speak; /stop /cancel /clear /status /metrics /permission /quit";

// --- Commands ---

/// 発話を認識器に渡してターンを開始する
pub async fn say(
    orchestrator: &Arc<VoiceOrchestrator>,
    recognizer: &ConsoleRecognizer,
    text: &str,
) -> CmdResult<StateTransition> {
    recognizer.queue(text);
    match orchestrator.start_listening().await {
        Ok(transition) => Ok(transition),
        Err(e) => {
            recognizer.discard_pending();
            Err(e.into())
        }
    }
}

/// 聞き取り中ならキャプチャを、発話中なら読み上げを止める
pub fn stop(orchestrator: &VoiceOrchestrator) -> CmdResult<()> {
    if orchestrator.stop_listening() || orchestrator.stop_speaking().is_some() {
        Ok(())
    } else {
        Err(CommandError::Idle("stop"))
    }
}

pub fn cancel(orchestrator: &VoiceOrchestrator) -> CmdResult<StateTransition> {
    orchestrator.cancel_turn().ok_or(CommandError::Idle("cancel"))
}

pub fn clear_error(orchestrator: &VoiceOrchestrator) -> CmdResult<()> {
    if orchestrator.clear_error() {
        Ok(())
    } else {
        Err(CommandError::Idle("clear"))
    }
}

pub fn get_status(orchestrator: &VoiceOrchestrator) -> Snapshot {
    orchestrator.snapshot()
}

pub fn get_metrics(orchestrator: &VoiceOrchestrator) -> MetricsSummary {
    orchestrator.metrics()
}

/// コマンド応答行
#[derive(Serialize)]
struct CommandReply<'a, T: Serialize> {
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<CommandError>,
}

fn reply<T: Serialize>(command: &str, result: CmdResult<T>) {
    let (result, error) = match result {
        Ok(value) => (Some(value), None),
        Err(e) => {
            tracing::warn!(command, "{e}");
            (None, Some(e))
        }
    };
    let stdout = std::io::stdout();
    events::emit_line(
        &mut stdout.lock(),
        &CommandReply {
            command,
            result,
            error,
        },
    );
}

/// 入力が尽きるか `/quit` まで行を処理する
pub async fn run_console<R>(
    orchestrator: Arc<VoiceOrchestrator>,
    recognizer: Arc<ConsoleRecognizer>,
    input: R,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    eprintln!("{HELP}");
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                reply::<()>("parse", Err(e));
                continue;
            }
        };

        match command {
            ConsoleCommand::Say(text) => {
                reply("say", say(&orchestrator, &recognizer, &text).await)
            }
            ConsoleCommand::Stop => reply("stop", stop(&orchestrator)),
            ConsoleCommand::Cancel => reply("cancel", cancel(&orchestrator)),
            ConsoleCommand::Clear => reply("clear", clear_error(&orchestrator)),
            ConsoleCommand::Status => reply("status", Ok(get_status(&orchestrator))),
            ConsoleCommand::Metrics => reply("metrics", Ok(get_metrics(&orchestrator))),
            ConsoleCommand::Permission => {
                reply("permission", Ok(orchestrator.refresh_permission().await))
            }
            ConsoleCommand::Help => eprintln!("{HELP}"),
            ConsoleCommand::Quit => break,
        }
    }
    Ok(())
}
