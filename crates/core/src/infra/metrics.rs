use serde::Serialize;
use std::sync::Mutex;

use crate::domain::error::ErrorKind;

/// 最新の記録をこの件数だけ保持する
const LATENCY_HISTORY: usize = 1000;

/// ローカルメトリクス収集器（プロセス内のみ、永続化しない）
pub struct Metrics {
    counters: Mutex<MetricsCounters>,
    latencies: Mutex<Vec<LatencyRecord>>,
}

#[derive(Debug, Default)]
struct MetricsCounters {
    turns_started: u64,
    turns_completed: u64,
    transcripts: u64,
    replies: u64,
    fallback_replies: u64,
    errors_permission: u64,
    errors_device: u64,
    errors_no_speech: u64,
    errors_transcription: u64,
    errors_network: u64,
    errors_synthesis: u64,
    errors_init: u64,
}

/// レイテンシ計測区間
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyPhase {
    Stt,
    Api,
    Tts,
    Total,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyRecord {
    pub phase: LatencyPhase,
    pub duration_ms: f64,
    pub timestamp: String,
}

/// メトリクスサマリー（UIに返す用）
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub turns_started: u64,
    pub turns_completed: u64,
    pub transcripts: u64,
    pub replies: u64,
    pub fallback_replies: u64,
    pub error_counts: ErrorCounts,
    pub avg_latency_ms: AvgLatency,
    pub recent_latencies: Vec<LatencyRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorCounts {
    pub permission: u64,
    pub device: u64,
    pub no_speech: u64,
    pub transcription: u64,
    pub network: u64,
    pub synthesis: u64,
    pub init: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AvgLatency {
    pub stt: Option<f64>,
    pub api: Option<f64>,
    pub tts: Option<f64>,
    pub total: Option<f64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(MetricsCounters::default()),
            latencies: Mutex::new(Vec::new()),
        }
    }

    pub fn inc_turns_started(&self) {
        self.counters.lock().unwrap().turns_started += 1;
    }

    pub fn inc_turns_completed(&self) {
        self.counters.lock().unwrap().turns_completed += 1;
    }

    pub fn inc_transcripts(&self) {
        self.counters.lock().unwrap().transcripts += 1;
    }

    pub fn inc_replies(&self, degraded: bool) {
        let mut c = self.counters.lock().unwrap();
        c.replies += 1;
        if degraded {
            c.fallback_replies += 1;
        }
    }

    pub fn inc_error(&self, kind: ErrorKind) {
        let mut c = self.counters.lock().unwrap();
        match kind {
            ErrorKind::PermissionDenied => c.errors_permission += 1,
            ErrorKind::DeviceNotFound | ErrorKind::DeviceError => c.errors_device += 1,
            ErrorKind::NoSpeechDetected => c.errors_no_speech += 1,
            ErrorKind::TranscriptionFailed => c.errors_transcription += 1,
            ErrorKind::NetworkError => c.errors_network += 1,
            ErrorKind::SynthesisFailed => c.errors_synthesis += 1,
            ErrorKind::InitializationFailed => c.errors_init += 1,
        }
    }

    pub fn record_latency(&self, phase: LatencyPhase, duration_ms: f64) {
        let record = LatencyRecord {
            phase,
            duration_ms,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let mut latencies = self.latencies.lock().unwrap();
        latencies.push(record);
        if latencies.len() > LATENCY_HISTORY {
            let excess = latencies.len() - LATENCY_HISTORY;
            latencies.drain(0..excess);
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let c = self.counters.lock().unwrap();
        let latencies = self.latencies.lock().unwrap();

        let avg = |phase: LatencyPhase| -> Option<f64> {
            let vals: Vec<f64> = latencies
                .iter()
                .filter(|r| r.phase == phase)
                .map(|r| r.duration_ms)
                .collect();
            if vals.is_empty() {
                None
            } else {
                Some(vals.iter().sum::<f64>() / vals.len() as f64)
            }
        };

        let recent: Vec<LatencyRecord> = latencies.iter().rev().take(20).cloned().collect();

        MetricsSummary {
            turns_started: c.turns_started,
            turns_completed: c.turns_completed,
            transcripts: c.transcripts,
            replies: c.replies,
            fallback_replies: c.fallback_replies,
            error_counts: ErrorCounts {
                permission: c.errors_permission,
                device: c.errors_device,
                no_speech: c.errors_no_speech,
                transcription: c.errors_transcription,
                network: c.errors_network,
                synthesis: c.errors_synthesis,
                init: c.errors_init,
            },
            avg_latency_ms: AvgLatency {
                stt: avg(LatencyPhase::Stt),
                api: avg(LatencyPhase::Api),
                tts: avg(LatencyPhase::Tts),
                total: avg(LatencyPhase::Total),
            },
            recent_latencies: recent,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let m = Metrics::new();
        m.inc_turns_started();
        m.inc_turns_started();
        m.inc_transcripts();
        m.inc_replies(false);
        m.inc_replies(true);
        m.inc_error(ErrorKind::DeviceNotFound);
        m.inc_error(ErrorKind::DeviceError);
        m.inc_error(ErrorKind::PermissionDenied);
        m.inc_error(ErrorKind::NetworkError);

        let s = m.summary();
        assert_eq!(s.turns_started, 2);
        assert_eq!(s.transcripts, 1);
        assert_eq!(s.replies, 2);
        assert_eq!(s.fallback_replies, 1);
        assert_eq!(s.error_counts.device, 2);
        assert_eq!(s.error_counts.permission, 1);
        assert_eq!(s.error_counts.network, 1);
        assert_eq!(s.error_counts.init, 0);
    }

    #[test]
    fn test_latency_recording() {
        let m = Metrics::new();
        m.record_latency(LatencyPhase::Stt, 120.0);
        m.record_latency(LatencyPhase::Stt, 80.0);
        m.record_latency(LatencyPhase::Api, 200.0);

        let s = m.summary();
        assert!((s.avg_latency_ms.stt.unwrap() - 100.0).abs() < f64::EPSILON);
        assert!((s.avg_latency_ms.api.unwrap() - 200.0).abs() < f64::EPSILON);
        assert!(s.avg_latency_ms.tts.is_none());
        assert!(s.avg_latency_ms.total.is_none());
        assert_eq!(s.recent_latencies.len(), 3);
        assert_eq!(s.recent_latencies[0].phase, LatencyPhase::Api);
    }

    #[test]
    fn test_latency_cap() {
        let m = Metrics::new();
        for i in 0..1100 {
            m.record_latency(LatencyPhase::Total, i as f64);
        }
        let latencies = m.latencies.lock().unwrap();
        assert_eq!(latencies.len(), LATENCY_HISTORY);
        assert_eq!(latencies[0].duration_ms, 100.0);
    }
}
