//! Speaker playback via cpal
//!
//! Assistant audio arrives in small chunks as it is generated, so playback is
//! queue-based: the output callback drains a shared sample queue and feeds
//! silence when the queue runs dry, keeping the stream alive between chunks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use super::{AudioSink, SAMPLE_RATE};
use crate::{Error, Result};

/// Plays queued PCM16 to the default output device
pub struct CpalSink {
    queue: Arc<Mutex<VecDeque<i16>>>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl CpalSink {
    /// Open the default output device and start the playback thread.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available.
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;
        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            "audio playback starting"
        );

        let queue: Arc<Mutex<VecDeque<i16>>> = Arc::new(Mutex::new(VecDeque::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_queue = Arc::clone(&queue);
        let thread_shutdown = Arc::clone(&shutdown);
        let worker = std::thread::spawn(move || {
            if let Err(e) = run_playback(&thread_queue, &thread_shutdown) {
                tracing::error!(error = %e, "audio playback thread exited");
            }
        });

        Ok(Self {
            queue,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }
}

impl AudioSink for CpalSink {
    fn enqueue(&self, pcm: &[i16]) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.extend(pcm.iter().copied());
        }
    }

    fn stop(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            let dropped = queue.len();
            queue.clear();
            if dropped > 0 {
                tracing::debug!(samples = dropped, "flushed playback queue");
            }
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

fn run_playback(queue: &Arc<Mutex<VecDeque<i16>>>, shutdown: &Arc<AtomicBool>) -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("output device disappeared".to_string()))?;

    let supported = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .or_else(|| {
            // Fallback: stereo, duplicating the mono signal
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
        })
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    let config: StreamConfig = supported.with_sample_rate(SampleRate(SAMPLE_RATE)).config();
    let channels = config.channels as usize;

    let callback_queue = Arc::clone(queue);
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut queue = match callback_queue.lock() {
                    Ok(q) => q,
                    Err(_) => {
                        data.fill(0.0);
                        return;
                    }
                };
                for frame in data.chunks_mut(channels) {
                    let sample = queue
                        .pop_front()
                        .map_or(0.0, |s| f32::from(s) / 32768.0);
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    tracing::debug!("audio playback running");

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(50));
    }

    drop(stream);
    Ok(())
}
