//! Default configuration constants for renova-live.
//!
//! Shared by the config layer, the audio adapters and the session controller
//! so every component agrees on the stream formats.

/// Microphone stream sample rate in Hz.
///
/// The voice service expects 16kHz mono 16-bit PCM on the uplink.
pub const INPUT_SAMPLE_RATE: u32 = 16000;

/// Sample rate of synthesized speech received from the voice service, in Hz.
///
/// Used when an inbound audio part does not announce its own rate.
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Channel count for both directions.
pub const CHANNELS: u16 = 1;

/// Frames per outbound capture block.
///
/// 4096 frames (256ms at 16kHz) keeps the device well clear of underruns
/// while staying responsive enough for barge-in.
pub const BLOCK_FRAMES: usize = 4096;

/// Volume meter cadence in milliseconds.
pub const METER_INTERVAL_MS: u64 = 100;

/// Analysis window of the volume meter, in samples.
pub const FFT_SIZE: usize = 256;

/// Smoothing applied between consecutive spectrum snapshots (0.0 = none).
pub const METER_SMOOTHING: f32 = 0.8;

/// Lower bound of the decibel range mapped onto the 0–255 loudness scale.
pub const METER_MIN_DB: f32 = -100.0;

/// Upper bound of the decibel range mapped onto the 0–255 loudness scale.
pub const METER_MAX_DB: f32 = -30.0;

/// Default voice gateway endpoint (JSON-lines over TCP).
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:7070";

/// Default live voice model identifier sent in the session setup.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Default prebuilt voice.
pub const DEFAULT_VOICE: &str = "Kore";

/// Default system instruction for the voice companion.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are Renova, an emotional wellness companion. \
Speak calmly, slowly and encouragingly. Help the user calm down or reflect. Be concise.";

/// MIME type prefix for raw 16-bit little-endian PCM.
pub const PCM_MIME_PREFIX: &str = "audio/pcm";

/// Number of outbound chunks buffered towards the transport before dropping.
///
/// Audio is perishable: when the network stalls, old blocks are worthless.
pub const OUTBOUND_QUEUE: usize = 32;

/// Build the MIME type announcing a PCM stream at `sample_rate`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("{};rate={}", PCM_MIME_PREFIX, sample_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_mime_type_includes_rate() {
        assert_eq!(pcm_mime_type(16000), "audio/pcm;rate=16000");
        assert_eq!(pcm_mime_type(OUTPUT_SAMPLE_RATE), "audio/pcm;rate=24000");
    }

    #[test]
    fn block_is_a_quarter_second_at_input_rate() {
        let ms = BLOCK_FRAMES as u64 * 1000 / INPUT_SAMPLE_RATE as u64;
        assert_eq!(ms, 256);
    }
}
