//! cpal によるマイク入力
//!
//! cpal::Stream は Send ではないため、ストリームは専用スレッド上で作成・保持し、
//! サンプルはチャネル経由で受け取る。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::{mpsc, oneshot};

use super::{CaptureError, InputStream, MicrophoneDevice};
use crate::domain::types::PermissionState;

/// 既定の入力デバイス
#[derive(Debug, Default)]
pub struct CpalMicrophone;

#[async_trait]
impl MicrophoneDevice for CpalMicrophone {
    /// デスクトップには事前の権限問い合わせがないため、デバイスがあれば Prompt
    async fn query_permission(&self) -> PermissionState {
        match cpal::default_host().default_input_device() {
            Some(_) => PermissionState::Prompt,
            None => PermissionState::Unknown,
        }
    }

    async fn open(&self, _sample_rate: u32) -> Result<Box<dyn InputStream>, CaptureError> {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_flag_clone = stop_flag.clone();

        thread::Builder::new()
            .name("vl-capture".to_string())
            .spawn(move || {
                let stream = match build_stream(chunk_tx) {
                    Ok((stream, sample_rate)) => {
                        let _ = ready_tx.send(Ok(sample_rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while !stop_flag_clone.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(20));
                }
                drop(stream);
                log::debug!("Capture stream released");
            })
            .map_err(|e| CaptureError::Device(e.to_string()))?;

        let sample_rate = ready_rx
            .await
            .map_err(|_| CaptureError::Device("capture thread exited".to_string()))??;

        Ok(Box::new(CpalInputStream {
            rx: chunk_rx,
            sample_rate,
            stop_flag,
        }))
    }
}

struct CpalInputStream {
    rx: mpsc::UnboundedReceiver<Vec<f32>>,
    sample_rate: u32,
    stop_flag: Arc<AtomicBool>,
}

#[async_trait]
impl InputStream for CpalInputStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn next_chunk(&mut self) -> Option<Result<Vec<f32>, CaptureError>> {
        self.rx.recv().await.map(Ok)
    }

    fn stop_tracks(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}

fn build_stream(
    chunk_tx: mpsc::UnboundedSender<Vec<f32>>,
) -> Result<(cpal::Stream, u32), CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(CaptureError::DeviceNotFound)?;

    let supported_config = device
        .default_input_config()
        .map_err(|e| CaptureError::Device(e.to_string()))?;

    let sample_rate = supported_config.sample_rate().0;
    let channels = supported_config.channels();
    let sample_format = supported_config.sample_format();

    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let _ = chunk_tx.send(to_mono(data, channels));
            },
            |err| {
                log::error!("Audio stream error: {}", err);
            },
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _info: &cpal::InputCallbackInfo| {
                let f32_data: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                let _ = chunk_tx.send(to_mono(&f32_data, channels));
            },
            |err| {
                log::error!("Audio stream error: {}", err);
            },
            None,
        ),
        format => {
            return Err(CaptureError::Device(format!(
                "Unsupported sample format: {:?}",
                format
            )));
        }
    }
    .map_err(|e| CaptureError::Device(e.to_string()))?;

    stream
        .play()
        .map_err(|e| CaptureError::Device(e.to_string()))?;

    log::info!(
        "Audio capture started: {}Hz, {} channels, {:?}",
        sample_rate,
        channels,
        sample_format
    );
    Ok((stream, sample_rate))
}

/// ステレオ → モノ変換（チャンネル平均）
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
