//! Audio capture and playback
//!
//! The session talks to audio hardware only through the [`AudioSource`] and
//! [`AudioSink`] traits, so tests and headless deployments can swap in
//! non-hardware implementations. The wire format everywhere is mono PCM16 at
//! 24kHz, base64-encoded inside websocket frames.

pub mod capture;
pub mod playback;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::mpsc;

use crate::Result;

pub use capture::CpalSource;
pub use playback::CpalSink;

/// Sample rate shared by capture, playback, and the realtime service
pub const SAMPLE_RATE: u32 = 24_000;

/// A chunk of captured microphone audio
#[derive(Debug, Clone)]
pub struct SourceFrame {
    pub pcm: Vec<i16>,
    /// RMS level in `[0.0, 1.0]`, used for level metering
    pub volume: f32,
}

/// Produces microphone audio as a stream of [`SourceFrame`]s
pub trait AudioSource: Send {
    /// Begin capture, delivering frames on `frames` until stopped.
    ///
    /// Idempotent while already capturing.
    ///
    /// # Errors
    ///
    /// Returns an error if no input device is available.
    fn start(&mut self, frames: mpsc::Sender<SourceFrame>) -> Result<()>;

    /// Stop capture and release the device.
    fn stop(&mut self);

    #[must_use]
    fn is_capturing(&self) -> bool;
}

/// Consumes assistant audio for playback
pub trait AudioSink: Send + Sync {
    /// Queue samples for gapless playback.
    fn enqueue(&self, pcm: &[i16]);

    /// Discard anything queued but not yet played.
    fn stop(&self);
}

/// Encode PCM16 samples as base64 little-endian bytes.
#[must_use]
pub fn encode_pcm(pcm: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(pcm.len() * 2);
    for sample in pcm {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    BASE64.encode(bytes)
}

/// Decode base64 little-endian bytes into PCM16 samples.
///
/// Returns an empty buffer on malformed input; a dropped audio chunk is
/// preferable to tearing down the session.
#[must_use]
pub fn decode_pcm(data: &str) -> Vec<i16> {
    let Ok(bytes) = BASE64.decode(data) else {
        tracing::warn!("dropping undecodable audio chunk");
        return Vec::new();
    };
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// RMS level of a sample buffer, normalized to `[0.0, 1.0]`.
#[must_use]
pub fn rms_volume(pcm: &[i16]) -> f32 {
    if pcm.is_empty() {
        return 0.0;
    }
    let sum: f64 = pcm
        .iter()
        .map(|&s| {
            let normalized = f64::from(s) / f64::from(i16::MAX);
            normalized * normalized
        })
        .sum();
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let rms = (sum / pcm.len() as f64).sqrt() as f32;
    rms.clamp(0.0, 1.0)
}
