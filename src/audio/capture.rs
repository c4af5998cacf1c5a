//! Microphone capture via cpal
//!
//! The cpal stream handle is not `Send`, so a dedicated capture thread owns
//! the stream for its whole lifetime and pushes frames into an async channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::mpsc;

use super::{AudioSource, SAMPLE_RATE, SourceFrame, rms_volume};
use crate::{Error, Result};

/// Captures mono PCM16 from the default input device
pub struct CpalSource {
    shutdown: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl CpalSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl Default for CpalSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for CpalSource {
    fn start(&mut self, frames: mpsc::Sender<SourceFrame>) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        // Probe the device here so a missing microphone fails the connect
        // instead of dying silently on the capture thread.
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;
        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            "audio capture starting"
        );

        self.shutdown.store(false, Ordering::SeqCst);
        let shutdown = Arc::clone(&self.shutdown);

        let worker = std::thread::spawn(move || {
            if let Err(e) = run_capture(&frames, &shutdown) {
                tracing::error!(error = %e, "audio capture thread exited");
            }
        });
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.shutdown.store(true, Ordering::SeqCst);
            if worker.join().is_err() {
                tracing::warn!("capture thread panicked during shutdown");
            }
            tracing::debug!("audio capture stopped");
        }
    }

    fn is_capturing(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture(frames: &mpsc::Sender<SourceFrame>, shutdown: &Arc<AtomicBool>) -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("input device disappeared".to_string()))?;

    let supported = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .ok_or_else(|| Error::Audio("no mono 24kHz input config found".to_string()))?;

    let config: StreamConfig = supported.with_sample_rate(SampleRate(SAMPLE_RATE)).config();

    let sender = frames.clone();
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let pcm: Vec<i16> = data
                    .iter()
                    .map(|&s| {
                        #[allow(clippy::cast_possible_truncation)]
                        let sample = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
                        sample
                    })
                    .collect();
                let volume = rms_volume(&pcm);
                // Dropping a frame under backpressure beats stalling the
                // audio callback.
                let _ = sender.try_send(SourceFrame { pcm, volume });
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    tracing::debug!("audio capture running");

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(50));
    }

    drop(stream);
    Ok(())
}
