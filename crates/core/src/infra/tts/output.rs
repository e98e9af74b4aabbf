use std::time::Duration;

use tokio::sync::oneshot;

/// 再生中の音声（停止スイッチと終了通知）
pub struct PlaybackHandle {
    pub stop_tx: oneshot::Sender<()>,
    pub done_rx: oneshot::Receiver<Result<(), String>>,
}

/// 再生実装側の端点
pub struct PlaybackControl {
    pub stop_rx: oneshot::Receiver<()>,
    pub done_tx: oneshot::Sender<Result<(), String>>,
}

impl PlaybackHandle {
    pub fn channel() -> (Self, PlaybackControl) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        (
            Self { stop_tx, done_rx },
            PlaybackControl { stop_rx, done_tx },
        )
    }
}

/// ワーカー合成音声の出力先
pub trait AudioOutput: Send + Sync {
    fn play(&self, samples: Vec<f32>, sample_rate: u32) -> Result<PlaybackHandle, String>;
}

fn playback_duration(len: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(len as u64 * 1000 / sample_rate as u64)
}

/// 再生時間だけ待つ出力（音は出さない）
#[derive(Debug, Default)]
pub struct SimulatedAudioOutput;

impl AudioOutput for SimulatedAudioOutput {
    fn play(&self, samples: Vec<f32>, sample_rate: u32) -> Result<PlaybackHandle, String> {
        let duration = playback_duration(samples.len(), sample_rate);
        let (handle, control) = PlaybackHandle::channel();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = control.stop_rx => {}
            }
            let _ = control.done_tx.send(Ok(()));
        });
        Ok(handle)
    }
}

#[cfg(feature = "device")]
pub use cpal_output::CpalAudioOutput;

#[cfg(feature = "device")]
mod cpal_output {
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use tokio::sync::oneshot::error::TryRecvError;

    use super::{playback_duration, AudioOutput, PlaybackControl, PlaybackHandle};

    /// 既定の出力デバイスで再生する
    #[derive(Debug, Default)]
    pub struct CpalAudioOutput;

    impl AudioOutput for CpalAudioOutput {
        fn play(&self, samples: Vec<f32>, sample_rate: u32) -> Result<PlaybackHandle, String> {
            let (handle, control) = PlaybackHandle::channel();
            thread::Builder::new()
                .name("vl-playback".to_string())
                .spawn(move || {
                    let PlaybackControl {
                        mut stop_rx,
                        done_tx,
                    } = control;
                    let result = play_blocking(samples, sample_rate, &mut stop_rx);
                    let _ = done_tx.send(result);
                })
                .map_err(|e| e.to_string())?;
            Ok(handle)
        }
    }

    fn play_blocking(
        samples: Vec<f32>,
        sample_rate: u32,
        stop_rx: &mut tokio::sync::oneshot::Receiver<()>,
    ) -> Result<(), String> {
        if samples.is_empty() {
            return Ok(());
        }

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| "no output device available".to_string())?;

        let supported = device
            .supported_output_configs()
            .map_err(|e| e.to_string())?
            .find(|c| {
                c.min_sample_rate() <= cpal::SampleRate(sample_rate)
                    && c.max_sample_rate() >= cpal::SampleRate(sample_rate)
            })
            .ok_or_else(|| format!("no output config supports {sample_rate}Hz"))?;
        let config = supported
            .with_sample_rate(cpal::SampleRate(sample_rate))
            .config();
        let channels = config.channels as usize;

        let total = samples.len();
        let samples = Arc::new(samples);
        let position = Arc::new(Mutex::new(0usize));
        let samples_clone = Arc::clone(&samples);
        let position_clone = Arc::clone(&position);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut pos = position_clone.lock().unwrap();
                    for frame in data.chunks_mut(channels) {
                        let sample = samples_clone.get(*pos).copied().unwrap_or(0.0);
                        for out in frame.iter_mut() {
                            *out = sample;
                        }
                        if *pos < samples_clone.len() {
                            *pos += 1;
                        }
                    }
                },
                |err| {
                    log::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| e.to_string())?;

        stream.play().map_err(|e| e.to_string())?;

        let deadline = Instant::now() + playback_duration(total, sample_rate) + Duration::from_millis(500);
        loop {
            if *position.lock().unwrap() >= total {
                break;
            }
            match stop_rx.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => {
                    log::debug!("Playback stopped early");
                    break;
                }
            }
            if Instant::now() >= deadline {
                log::warn!("Playback did not finish before its deadline");
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        drop(stream);
        Ok(())
    }
}
