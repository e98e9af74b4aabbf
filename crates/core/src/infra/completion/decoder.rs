//! 応答ストリームの行デコーダ
//!
//! 1行1フラグメント: `0:` の後に `{"textDelta": "..."}` が続く。
//! それ以外の行、JSON として読めない行、空の textDelta は読み飛ばす。

use serde::{Deserialize, Serialize};

/// フラグメント行の接頭辞
pub const FRAGMENT_MARKER: &str = "0:";

#[derive(Serialize, Deserialize)]
struct FragmentLine {
    #[serde(rename = "textDelta")]
    text_delta: String,
}

/// チャンク境界をまたぐ行と UTF-8 シーケンスを保持するデコーダ
#[derive(Debug, Default)]
pub struct FragmentDecoder {
    pending: Vec<u8>,
}

impl FragmentDecoder {
    /// チャンクを追加し、完結した行から取り出せたフラグメントを返す
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut fragments = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(fragment) = parse_line(&line[..line.len() - 1]) {
                fragments.push(fragment);
            }
        }
        fragments
    }

    /// ストリーム終端: 改行で終わらない最後の行を処理する
    pub fn finish(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.pending);
        parse_line(&rest).into_iter().collect()
    }
}

fn parse_line(line: &[u8]) -> Option<String> {
    let line = std::str::from_utf8(line).ok()?;
    let line = line.strip_suffix('\r').unwrap_or(line);
    let payload = line.strip_prefix(FRAGMENT_MARKER)?;
    let parsed: FragmentLine = serde_json::from_str(payload).ok()?;
    if parsed.text_delta.is_empty() {
        None
    } else {
        Some(parsed.text_delta)
    }
}

/// 1フラグメントをストリーム行に符号化する（末尾改行付き）
pub fn encode_fragment_line(text: &str) -> String {
    let payload = serde_json::to_string(&FragmentLine {
        text_delta: text.to_string(),
    })
    .unwrap_or_else(|_| r#"{"textDelta":""}"#.to_string());
    format!("{FRAGMENT_MARKER}{payload}\n")
}
