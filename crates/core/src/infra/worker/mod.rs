//! 分離ワーカー: モデルを専用スレッドで動かし、JSON フレームのみでやり取りする
//!
//! ワーカー側は自前の current_thread ランタイムを持ち、呼び出し側とは
//! mpsc チャネル（フレーム文字列）以外に共有状態を持たない。

mod engine;

pub use engine::EngineHandle;

use std::sync::Mutex;
use std::thread;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::stt::AudioSegment;
use crate::domain::worker::{ProtocolError, WorkerRequest, WorkerResponse};

/// ワーカー通信エラー
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker {0} has terminated")]
    Terminated(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// ワーカー内で動くモデル。対応しない処理は既定実装がエラーを返す。
#[async_trait]
pub trait WorkerModel: Send + 'static {
    fn name(&self) -> &str;

    /// モデルのロード（`init` で一度だけ呼ばれる）
    async fn load(&mut self) -> Result<(), String>;

    /// `cleanup` でモデルを解放する
    fn unload(&mut self);

    async fn transcribe(&mut self, _segment: &AudioSegment) -> Result<String, String> {
        Err(format!("{} does not support transcription", self.name()))
    }

    async fn synthesize(&mut self, _text: &str) -> Result<Vec<f32>, String> {
        Err(format!("{} does not support synthesis", self.name()))
    }
}

/// ワーカーのメッセージループ。フレームごとに高々1つの応答を返す（`cleanup` は応答なし）。
pub async fn serve<M: WorkerModel>(
    mut model: M,
    mut requests: mpsc::UnboundedReceiver<String>,
    responses: mpsc::UnboundedSender<String>,
) {
    let mut initialized = false;

    while let Some(frame) = requests.recv().await {
        let reply = match WorkerRequest::decode(&frame) {
            Err(e) => Some(WorkerResponse::error(e.to_string())),
            Ok(WorkerRequest::Init) => {
                if initialized {
                    Some(WorkerResponse::Initialized)
                } else {
                    match model.load().await {
                        Ok(()) => {
                            initialized = true;
                            Some(WorkerResponse::Initialized)
                        }
                        Err(e) => Some(WorkerResponse::error(format!(
                            "Failed to initialize {}: {e}",
                            model.name()
                        ))),
                    }
                }
            }
            Ok(WorkerRequest::Transcribe { data }) => {
                if !initialized {
                    Some(WorkerResponse::error(format!("{} not initialized", model.name())))
                } else {
                    let start = Instant::now();
                    match model.transcribe(&data.segment).await {
                        Ok(transcript) => Some(WorkerResponse::Transcript {
                            transcript,
                            latency: start.elapsed().as_secs_f64() * 1000.0,
                            is_final: data.is_final,
                        }),
                        Err(e) => Some(WorkerResponse::error(format!("Transcription failed: {e}"))),
                    }
                }
            }
            Ok(WorkerRequest::Synthesize { data }) => {
                if !initialized {
                    Some(WorkerResponse::error(format!("{} not initialized", model.name())))
                } else {
                    let start = Instant::now();
                    match model.synthesize(&data.text).await {
                        Ok(audio_buffer) => Some(WorkerResponse::Audio {
                            audio_buffer,
                            latency: start.elapsed().as_secs_f64() * 1000.0,
                        }),
                        Err(e) => Some(WorkerResponse::error(format!(
                            "Speech synthesis failed: {e}"
                        ))),
                    }
                }
            }
            Ok(WorkerRequest::Cleanup) => {
                model.unload();
                initialized = false;
                None
            }
        };

        if let Some(reply) = reply {
            let frame = match reply.encode() {
                Ok(frame) => frame,
                Err(e) => match WorkerResponse::error(e.to_string()).encode() {
                    Ok(frame) => frame,
                    Err(_) => continue,
                },
            };
            if responses.send(frame).is_err() {
                break;
            }
        }
    }

    log::debug!("Worker {} loop finished", model.name());
}

struct Inbox {
    rx: mpsc::UnboundedReceiver<String>,
    /// 応答待ちのリクエスト数（呼び出し側が途中で諦めたものを含む）
    outstanding: usize,
}

/// ワーカーへの接続（呼び出し側）
pub struct WorkerLink {
    name: String,
    request_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    inbox: tokio::sync::Mutex<Inbox>,
}

impl WorkerLink {
    /// モデルを専用スレッドで起動する
    pub fn spawn<M: WorkerModel>(model: M) -> Result<Self, WorkerError> {
        let name = model.name().to_string();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        let thread_name = format!("vl-worker-{name}");
        thread::Builder::new().name(thread_name).spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Failed to create worker runtime: {}", e);
                    return;
                }
            };
            rt.block_on(serve(model, request_rx, response_tx));
        })?;

        Ok(Self::from_channels(name, request_tx, response_rx))
    }

    /// 既存のチャネルから接続を組み立てる（テストや別トランスポート用）
    pub fn from_channels(
        name: impl Into<String>,
        request_tx: mpsc::UnboundedSender<String>,
        response_rx: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            name: name.into(),
            request_tx: Mutex::new(Some(request_tx)),
            inbox: tokio::sync::Mutex::new(Inbox {
                rx: response_rx,
                outstanding: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn send_frame(&self, request: &WorkerRequest) -> Result<(), WorkerError> {
        let frame = request.encode()?;
        let guard = self.request_tx.lock().unwrap();
        let tx = guard
            .as_ref()
            .ok_or_else(|| WorkerError::Terminated(self.name.clone()))?;
        tx.send(frame)
            .map_err(|_| WorkerError::Terminated(self.name.clone()))
    }

    /// リクエストを送り、その応答を待つ。
    ///
    /// 途中で破棄された呼び出しの応答は、次の呼び出しが読み捨てる。
    pub async fn call(&self, request: WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        let mut inbox = self.inbox.lock().await;
        self.send_frame(&request)?;
        inbox.outstanding += 1;

        loop {
            let frame = inbox
                .rx
                .recv()
                .await
                .ok_or_else(|| WorkerError::Terminated(self.name.clone()))?;
            inbox.outstanding -= 1;
            if inbox.outstanding == 0 {
                return Ok(WorkerResponse::decode(&frame)?);
            }
            log::debug!("Worker {}: discarding response to an abandoned request", self.name);
        }
    }

    /// 応答を待たずに送る（`cleanup` 用）
    pub fn post(&self, request: WorkerRequest) -> Result<(), WorkerError> {
        self.send_frame(&request)
    }

    /// 送信側を閉じる。ワーカースレッドはループを抜けて終了する。
    pub fn terminate(&self) {
        self.request_tx.lock().unwrap().take();
    }
}
