//! G.711 Audio Codec Implementation
//!
//! Pure Rust implementation of G.711 μ-law (PCMU) together with the
//! 16kHz <-> 8kHz resampling needed between the telephone leg and the
//! wideband PCM16 consumed by the AI pipeline.
//!
//! PCM16 buffers are little-endian byte slices, two bytes per sample.

/// Default gain applied after downsampling to keep averaged peaks from clipping
pub const DEFAULT_ENCODE_GAIN: f32 = 0.8;

// μ-law encoding table segments
const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

/// Stateless transcoder between wideband PCM16 and narrowband μ-law
pub struct AudioCodec;

impl AudioCodec {
    /// Encode 16kHz PCM16 to 8kHz μ-law using the default gain.
    ///
    /// Output length is `pcm.len() / 4`; a trailing partial sample pair is dropped.
    pub fn encode_mulaw(pcm: &[u8]) -> Vec<u8> {
        Self::encode_mulaw_with_gain(pcm, DEFAULT_ENCODE_GAIN)
    }

    /// Encode 16kHz PCM16 to 8kHz μ-law.
    ///
    /// Adjacent samples are averaged (2:1 downsample), scaled by `gain`,
    /// clamped to the 16-bit range and compressed.
    pub fn encode_mulaw_with_gain(pcm: &[u8], gain: f32) -> Vec<u8> {
        pcm.chunks_exact(4)
            .map(|pair| {
                let first = i16::from_le_bytes([pair[0], pair[1]]) as i32;
                let second = i16::from_le_bytes([pair[2], pair[3]]) as i32;
                let averaged = (first + second) as f32 / 2.0;
                let scaled = (averaged * gain)
                    .round()
                    .clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                linear_to_ulaw(scaled)
            })
            .collect()
    }

    /// Decode 8kHz μ-law to 16kHz PCM16.
    ///
    /// Every decoded sample is followed by the midpoint to its successor
    /// (the last one is repeated), so output length is `ulaw.len() * 4`.
    pub fn decode_mulaw(ulaw: &[u8]) -> Vec<u8> {
        let narrow: Vec<i16> = ulaw.iter().map(|&b| ulaw_to_linear(b)).collect();
        let mut out = Vec::with_capacity(ulaw.len() * 4);

        for (i, &sample) in narrow.iter().enumerate() {
            let between = match narrow.get(i + 1) {
                Some(&next) => ((sample as i32 + next as i32) / 2) as i16,
                None => sample,
            };
            out.extend_from_slice(&sample.to_le_bytes());
            out.extend_from_slice(&between.to_le_bytes());
        }

        out
    }
}

/// Convert 16-bit linear PCM to μ-law
pub(crate) fn linear_to_ulaw(sample: i16) -> u8 {
    let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };

    // Get magnitude and apply bias
    let mut magnitude = (sample as i32).abs().min(ULAW_CLIP);
    magnitude += ULAW_BIAS;

    // Find the segment
    let exponent: u8 = match magnitude {
        s if s >= 0x4000 => 7,
        s if s >= 0x2000 => 6,
        s if s >= 0x1000 => 5,
        s if s >= 0x0800 => 4,
        s if s >= 0x0400 => 3,
        s if s >= 0x0200 => 2,
        s if s >= 0x0100 => 1,
        _ => 0,
    };

    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;

    // Combine sign, exponent, and mantissa, then complement
    !(sign | (exponent << 4) | mantissa)
}

/// Convert μ-law to 16-bit linear PCM
pub(crate) fn ulaw_to_linear(ulaw: u8) -> i16 {
    let ulaw = !ulaw;

    let sign = ulaw & 0x80;
    let exponent = ((ulaw >> 4) & 0x07) as i32;
    let mantissa = (ulaw & 0x0F) as i32;

    let sample = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;

    if sign != 0 {
        -sample as i16
    } else {
        sample as i16
    }
}
