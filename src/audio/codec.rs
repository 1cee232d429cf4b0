//! PCM codec: float samples ↔ 16-bit little-endian bytes ↔ transport text.
//!
//! Everything here is pure; the only failure mode is a malformed payload.

use crate::error::{Result, VoiceError};
use crate::pipeline::types::AudioChunk;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Scale a normalized sample to 16-bit PCM.
///
/// Multiplies by 32768 and saturates, so `1.0` maps to `i16::MAX` rather than
/// wrapping to `i16::MIN`.
pub fn float_to_pcm16(sample: f32) -> i16 {
    (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode normalized samples into little-endian 16-bit PCM bytes.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&float_to_pcm16(sample).to_le_bytes());
    }
    bytes
}

/// Build an [`AudioChunk`] from normalized capture samples.
pub fn chunk_from_f32(samples: &[f32], sample_rate: u32, channels: u16) -> AudioChunk {
    let pcm = samples.iter().map(|&s| float_to_pcm16(s)).collect();
    AudioChunk::new(pcm, sample_rate, channels)
}

/// Serialize a chunk into little-endian 16-bit PCM bytes.
pub fn chunk_to_bytes(chunk: &AudioChunk) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(chunk.samples().len() * 2);
    for &sample in chunk.samples() {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Decode little-endian 16-bit PCM bytes into an [`AudioChunk`].
///
/// # Errors
/// Returns `VoiceError::Decode` if the byte count is odd, if the sample count
/// does not split evenly into `channels`, or if the format is degenerate.
pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<AudioChunk> {
    if sample_rate == 0 || channels == 0 {
        return Err(VoiceError::decode(format!(
            "invalid stream format: {}Hz, {} channel(s)",
            sample_rate, channels
        )));
    }
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::decode(format!(
            "PCM payload has odd length {}",
            bytes.len()
        )));
    }

    let samples: Vec<i16> = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    if samples.len() % channels as usize != 0 {
        return Err(VoiceError::decode(format!(
            "{} samples do not divide into {} channels",
            samples.len(),
            channels
        )));
    }

    Ok(AudioChunk::new(samples, sample_rate, channels))
}

/// Encode bytes as transport-safe text (standard base64, padded).
pub fn to_transport_text(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode transport text produced by [`to_transport_text`].
///
/// # Errors
/// Returns `VoiceError::Decode` for malformed base64.
pub fn from_transport_text(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| VoiceError::decode(format!("invalid transport text: {}", e)))
}

/// Average interleaved multi-channel samples down to mono.
pub fn mix_to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Duplicate mono samples across `channels` interleaved channels.
pub fn spread_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .iter()
        .flat_map(|&s| std::iter::repeat_n(s, channels))
        .collect()
}

/// Simple linear interpolation resampling of a mono signal.
pub fn resample_f32(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = (source_pos - source_idx as f64) as f32;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx];
                let right = samples[source_idx + 1];
                left + (right - left) * fraction
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUANTUM: f32 = 1.0 / 32768.0;

    #[test]
    fn encode_scales_and_packs_little_endian() {
        let bytes = encode(&[0.0, 0.5, -0.5, -1.0]);
        assert_eq!(
            bytes,
            vec![0x00, 0x00, 0x00, 0x40, 0x00, 0xC0, 0x00, 0x80],
            "0.5 → 16384 (0x4000), -0.5 → -16384 (0xC000), -1.0 → -32768 (0x8000)"
        );
    }

    #[test]
    fn encode_saturates_instead_of_wrapping() {
        let bytes = encode(&[1.0, 2.0, -3.0]);
        let chunk = decode(&bytes, 16000, 1).unwrap();
        assert_eq!(chunk.samples(), &[i16::MAX, i16::MAX, i16::MIN]);
    }

    #[test]
    fn encode_truncates_toward_zero() {
        // 0.00005 * 32768 = 1.6384 → 1
        assert_eq!(float_to_pcm16(0.00005), 1);
        assert_eq!(float_to_pcm16(-0.00005), -1);
    }

    #[test]
    fn decode_of_encode_is_within_quantization_error() {
        let input: Vec<f32> = (0..1000)
            .map(|i| ((i as f32) * 0.05).sin() * 0.9)
            .collect();

        let chunk = decode(&encode(&input), 16000, 1).unwrap();
        let output = chunk.to_f32();

        assert_eq!(output.len(), input.len());
        for (a, b) in input.iter().zip(output.iter()) {
            assert!(
                (a - b).abs() <= QUANTUM,
                "sample drifted beyond one quantum: {} vs {}",
                a,
                b
            );
        }
    }

    #[test]
    fn decode_rejects_odd_length() {
        let err = decode(&[0x00, 0x01, 0x02], 24000, 1).unwrap_err();
        assert!(matches!(err, VoiceError::Decode { .. }));
    }

    #[test]
    fn decode_rejects_partial_frame() {
        // Three samples cannot form stereo frames
        let err = decode(&[0; 6], 24000, 2).unwrap_err();
        assert!(matches!(err, VoiceError::Decode { .. }));
    }

    #[test]
    fn decode_rejects_degenerate_format() {
        assert!(decode(&[0; 4], 0, 1).is_err());
        assert!(decode(&[0; 4], 24000, 0).is_err());
    }

    #[test]
    fn decode_empty_payload_is_empty_chunk() {
        let chunk = decode(&[], 24000, 1).unwrap();
        assert!(chunk.is_empty());
        assert_eq!(chunk.duration_secs(), 0.0);
    }

    #[test]
    fn decode_duration_follows_sample_rate() {
        let bytes = vec![0u8; 24000 * 2];
        let chunk = decode(&bytes, 24000, 1).unwrap();
        assert!((chunk.duration_secs() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn chunk_bytes_match_encode() {
        let input = [0.25f32, -0.75, 0.0];
        let chunk = chunk_from_f32(&input, 16000, 1);
        assert_eq!(chunk_to_bytes(&chunk), encode(&input));
    }

    #[test]
    fn transport_text_roundtrip_covers_all_byte_values() {
        let bytes: Vec<u8> = (0..=255u8).chain((0..=255u8).rev()).collect();
        let text = to_transport_text(&bytes);
        assert_eq!(from_transport_text(&text).unwrap(), bytes);
    }

    #[test]
    fn transport_text_roundtrip_handles_padding_lengths() {
        for len in 0..8 {
            let bytes: Vec<u8> = (0..len).map(|i| i as u8 * 37).collect();
            let text = to_transport_text(&bytes);
            assert_eq!(from_transport_text(&text).unwrap(), bytes, "len {}", len);
        }
    }

    #[test]
    fn transport_text_is_standard_base64() {
        assert_eq!(to_transport_text(b"hello"), "aGVsbG8=");
    }

    #[test]
    fn malformed_transport_text_is_decode_error() {
        let err = from_transport_text("not*base64!").unwrap_err();
        assert!(matches!(err, VoiceError::Decode { .. }));
    }

    #[test]
    fn mix_to_mono_averages_frames() {
        let mono = mix_to_mono(&[0.5, -0.5, 1.0, 0.0], 2);
        assert_eq!(mono, vec![0.0, 0.5]);
    }

    #[test]
    fn spread_mono_duplicates_samples() {
        assert_eq!(spread_mono(&[0.1, 0.2], 2), vec![0.1, 0.1, 0.2, 0.2]);
        assert_eq!(spread_mono(&[0.1], 1), vec![0.1]);
    }

    #[test]
    fn resample_identity_same_rate() {
        let samples = vec![0.1f32, 0.2, 0.3];
        assert_eq!(resample_f32(&samples, 24000, 24000), samples);
    }

    #[test]
    fn resample_upsample_doubles_length() {
        let resampled = resample_f32(&[0.0, 0.5, 1.0], 24000, 48000);
        assert_eq!(resampled.len(), 6);
        assert_eq!(resampled[0], 0.0);
        assert!(resampled[1] > 0.0 && resampled[1] < 0.5);
        assert_eq!(resampled[2], 0.5);
    }

    #[test]
    fn resample_downsample_halves_length() {
        let resampled = resample_f32(&vec![0.0; 4800], 48000, 24000);
        assert_eq!(resampled.len(), 2400);
    }

    #[test]
    fn resample_handles_edge_cases() {
        assert!(resample_f32(&[], 48000, 16000).is_empty());
        assert_eq!(resample_f32(&[0.3], 48000, 16000), vec![0.3]);
    }
}
