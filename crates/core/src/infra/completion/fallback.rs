//! クォータ切れ時のローカル定型応答

/// 上流がクォータ切れを示すときにエラー本文に含まれる文字列
pub const QUOTA_MARKER: &str = "insufficient_quota";

const GREETING_REPLY: &str = "Hello! I'm your voice assistant. How can I help you today?";
const WEATHER_REPLY: &str =
    "I'd love to help with weather, but I need an active OpenAI connection for real-time data.";
const JOKE_REPLY: &str = "Why don't scientists trust atoms? Because they make up everything!";
const HOW_IT_WORKS_REPLY: &str = "I'm a voice assistant that uses speech recognition, AI processing, and text-to-speech to have conversations with you.";
const DEFAULT_REPLY: &str = "I'm currently running in demo mode due to API limits. Please check your OpenAI billing to enable full functionality.";

/// 定型応答のトピック（判定の優先順に並べる）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CannedTopic {
    Joke,
    Weather,
    Time,
    HowItWorks,
    Greeting,
    Default,
}

pub fn is_quota_exhausted(error_body: &str) -> bool {
    error_body.contains(QUOTA_MARKER)
}

/// 書き起こしを単語単位（小文字）で見てトピックを決める
pub fn classify(transcript: &str) -> CannedTopic {
    let lower = transcript.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has = |candidates: &[&str]| words.iter().any(|w| candidates.contains(w));

    if has(&["joke", "jokes"]) {
        CannedTopic::Joke
    } else if has(&["weather"]) {
        CannedTopic::Weather
    } else if has(&["time"]) {
        CannedTopic::Time
    } else if has(&["how"]) && has(&["work", "works", "working"]) {
        CannedTopic::HowItWorks
    } else if has(&["hello", "hi", "hey"]) {
        CannedTopic::Greeting
    } else {
        CannedTopic::Default
    }
}

/// 書き起こしに対する定型応答
pub fn canned_reply(transcript: &str) -> String {
    match classify(transcript) {
        CannedTopic::Joke => JOKE_REPLY.to_string(),
        CannedTopic::Weather => WEATHER_REPLY.to_string(),
        CannedTopic::Time => format!(
            "The current time is {}.",
            chrono::Local::now().format("%-I:%M %p")
        ),
        CannedTopic::HowItWorks => HOW_IT_WORKS_REPLY.to_string(),
        CannedTopic::Greeting => GREETING_REPLY.to_string(),
        CannedTopic::Default => DEFAULT_REPLY.to_string(),
    }
}
