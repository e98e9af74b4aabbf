use std::sync::Arc;

use async_trait::async_trait;

use super::{CaptureControl, CaptureError, CaptureHandle, CaptureOutput, CaptureSource};
use crate::domain::stt::AudioSegment;
use crate::domain::types::{CaptureStrategy, PermissionState};

/// マイクデバイス
#[async_trait]
pub trait MicrophoneDevice: Send + Sync {
    async fn query_permission(&self) -> PermissionState;

    /// 新しい入力ストリームを開く（呼び出しごとに別ストリーム）
    async fn open(&self, sample_rate: u32) -> Result<Box<dyn InputStream>, CaptureError>;
}

/// 開いている入力ストリーム
#[async_trait]
pub trait InputStream: Send {
    fn sample_rate(&self) -> u32;

    /// 次の録音チャンク。`None` はストリームが途切れたことを示す。
    async fn next_chunk(&mut self) -> Option<Result<Vec<f32>, CaptureError>>;

    /// トラックを解放する。何度呼んでもよい。
    fn stop_tracks(&mut self);
}

/// 入力ストリームの所有者。drop でトラックを解放する。
struct TrackGuard(Box<dyn InputStream>);

impl Drop for TrackGuard {
    fn drop(&mut self) {
        self.0.stop_tracks();
    }
}

/// 録音戦略: 停止までチャンクを貯め、1つのセグメントにして返す
pub struct BufferedRecorder {
    device: Arc<dyn MicrophoneDevice>,
    sample_rate: u32,
}

impl BufferedRecorder {
    pub fn new(device: Arc<dyn MicrophoneDevice>, sample_rate: u32) -> Self {
        Self {
            device,
            sample_rate,
        }
    }
}

#[async_trait]
impl CaptureSource for BufferedRecorder {
    fn strategy(&self) -> CaptureStrategy {
        CaptureStrategy::BufferedRecording
    }

    async fn query_permission(&self) -> PermissionState {
        self.device.query_permission().await
    }

    /// ストリームを一度開いてすぐ閉じることで権限を確認する
    async fn request_permission(&self) -> Result<PermissionState, CaptureError> {
        match self.device.open(self.sample_rate).await {
            Ok(mut stream) => {
                stream.stop_tracks();
                Ok(PermissionState::Granted)
            }
            Err(CaptureError::PermissionDenied) => {
                log::warn!("Microphone permission denied");
                Ok(PermissionState::Denied)
            }
            Err(e) => {
                log::error!("Microphone permission request failed: {}", e);
                Err(e)
            }
        }
    }

    async fn start(&self) -> Result<CaptureHandle, CaptureError> {
        let stream = self.device.open(self.sample_rate).await?;
        log::info!("Recording started at {}Hz", stream.sample_rate());

        let (handle, control) = CaptureHandle::channel();
        tokio::spawn(record(TrackGuard(stream), control));
        Ok(handle)
    }
}

async fn record(mut guard: TrackGuard, control: CaptureControl) {
    let CaptureControl {
        mut stop_rx,
        outcome_tx,
    } = control;
    let started_at = chrono::Utc::now();
    let sample_rate = guard.0.sample_rate();
    let mut chunks: Vec<Vec<f32>> = Vec::new();

    let result = loop {
        tokio::select! {
            // 停止要求、またはハンドルの破棄
            _ = &mut stop_rx => break Ok(()),
            chunk = guard.0.next_chunk() => match chunk {
                Some(Ok(chunk)) => {
                    if !chunk.is_empty() {
                        chunks.push(chunk);
                    }
                }
                Some(Err(e)) => break Err(e),
                None => break Err(CaptureError::Device("input stream ended unexpectedly".into())),
            },
        }
    };

    // 結果を渡す前にトラックを解放する
    drop(guard);

    let outcome = result.map(|()| {
        if chunks.is_empty() {
            CaptureOutput::Empty
        } else {
            let segment = AudioSegment::from_chunks(chunks, sample_rate, started_at);
            log::info!("Recording stopped: {}ms captured", segment.duration_ms);
            CaptureOutput::Segment(segment)
        }
    });
    if let Err(e) = &outcome {
        log::error!("Recording failed: {}", e);
    }
    let _ = outcome_tx.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// テスト用マイク: チャンクは送信側から流し込む
    struct FakeMicrophone {
        pub open_error: Mutex<Option<CaptureError>>,
        pub feeds: Mutex<Vec<mpsc::UnboundedSender<Result<Vec<f32>, CaptureError>>>>,
        pub opened: AtomicUsize,
        pub released: Arc<AtomicUsize>,
    }

    impl FakeMicrophone {
        pub fn new() -> Self {
            Self {
                open_error: Mutex::new(None),
                feeds: Mutex::new(Vec::new()),
                opened: AtomicUsize::new(0),
                released: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn feed(&self, chunk: Vec<f32>) {
            let feeds = self.feeds.lock().unwrap();
            feeds.last().unwrap().send(Ok(chunk)).unwrap();
        }
    }

    struct FakeStream {
        rx: mpsc::UnboundedReceiver<Result<Vec<f32>, CaptureError>>,
        released: Arc<AtomicUsize>,
        stopped: bool,
    }

    #[async_trait]
    impl InputStream for FakeStream {
        fn sample_rate(&self) -> u32 {
            16000
        }

        async fn next_chunk(&mut self) -> Option<Result<Vec<f32>, CaptureError>> {
            self.rx.recv().await
        }

        fn stop_tracks(&mut self) {
            if !self.stopped {
                self.stopped = true;
                self.released.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[async_trait]
    impl MicrophoneDevice for FakeMicrophone {
        async fn query_permission(&self) -> PermissionState {
            PermissionState::Prompt
        }

        async fn open(&self, _sample_rate: u32) -> Result<Box<dyn InputStream>, CaptureError> {
            if let Some(e) = self.open_error.lock().unwrap().clone() {
                return Err(e);
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            self.feeds.lock().unwrap().push(tx);
            Ok(Box::new(FakeStream {
                rx,
                released: self.released.clone(),
                stopped: false,
            }))
        }
    }

    #[tokio::test]
    async fn test_records_until_stopped() {
        let mic = Arc::new(FakeMicrophone::new());
        let recorder = BufferedRecorder::new(mic.clone(), 16000);

        let mut handle = recorder.start().await.unwrap();
        mic.feed(vec![0.1, 0.2]);
        mic.feed(vec![]);
        mic.feed(vec![0.3]);
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        handle.stop();

        match handle.outcome().await.unwrap() {
            CaptureOutput::Segment(seg) => {
                assert_eq!(seg.samples, vec![0.1, 0.2, 0.3]);
                assert_eq!(seg.sample_rate, 16000);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(mic.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_chunks_is_empty() {
        let mic = Arc::new(FakeMicrophone::new());
        let recorder = BufferedRecorder::new(mic.clone(), 16000);
        let mut handle = recorder.start().await.unwrap();
        handle.stop();
        assert_eq!(handle.outcome().await, Ok(CaptureOutput::Empty));
        assert_eq!(mic.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_error_releases_tracks() {
        let mic = Arc::new(FakeMicrophone::new());
        let recorder = BufferedRecorder::new(mic.clone(), 16000);
        let handle = recorder.start().await.unwrap();
        mic.feeds
            .lock()
            .unwrap()
            .last()
            .unwrap()
            .send(Err(CaptureError::Device("unplugged".into())))
            .unwrap();
        assert_eq!(
            handle.outcome().await,
            Err(CaptureError::Device("unplugged".into()))
        );
        assert_eq!(mic.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_handle_releases_tracks() {
        let mic = Arc::new(FakeMicrophone::new());
        let recorder = BufferedRecorder::new(mic.clone(), 16000);
        let handle = recorder.start().await.unwrap();
        drop(handle);
        for _ in 0..50 {
            if mic.released.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(mic.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_each_capture_opens_a_fresh_stream() {
        let mic = Arc::new(FakeMicrophone::new());
        let recorder = BufferedRecorder::new(mic.clone(), 16000);
        for _ in 0..2 {
            let mut handle = recorder.start().await.unwrap();
            handle.stop();
            handle.outcome().await.unwrap();
        }
        assert_eq!(mic.opened.load(Ordering::SeqCst), 2);
        assert_eq!(mic.released.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permission_request() {
        let mic = Arc::new(FakeMicrophone::new());
        let recorder = BufferedRecorder::new(mic.clone(), 16000);
        assert_eq!(
            recorder.request_permission().await,
            Ok(PermissionState::Granted)
        );
        assert_eq!(mic.released.load(Ordering::SeqCst), 1);

        *mic.open_error.lock().unwrap() = Some(CaptureError::PermissionDenied);
        assert_eq!(
            recorder.request_permission().await,
            Ok(PermissionState::Denied)
        );
        assert_eq!(
            recorder.start().await.err(),
            Some(CaptureError::PermissionDenied)
        );

        // マイクが無いのは拒否ではない
        *mic.open_error.lock().unwrap() = Some(CaptureError::DeviceNotFound);
        assert_eq!(
            recorder.request_permission().await,
            Err(CaptureError::DeviceNotFound)
        );
    }
}
