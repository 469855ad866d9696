//! Request types handed to the core by the text pipeline

use serde::{Deserialize, Serialize};

use super::audio::AudioFormat;

/// Slowest speed multiplier accepted by the acoustic models
pub const MIN_SPEED: f32 = 0.5;
/// Fastest speed multiplier accepted by the acoustic models
pub const MAX_SPEED: f32 = 2.0;
/// Lowest output sample rate (Hz)
pub const MIN_SAMPLE_RATE: u32 = 8_000;
/// Highest output sample rate (Hz)
pub const MAX_SAMPLE_RATE: u32 = 48_000;
/// Native output rate of the reference acoustic models (Hz)
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// Finalized phoneme sequence produced by the text pipeline.
///
/// `tokens` feed the in-process runtime, `phonemes` feed the helper binary.
/// Both are produced by the caller; the core never normalizes text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhonemeSequence {
    phonemes: String,
    tokens: Vec<i64>,
}

impl PhonemeSequence {
    pub fn new(phonemes: impl Into<String>, tokens: Vec<i64>) -> Self {
        Self {
            phonemes: phonemes.into(),
            tokens,
        }
    }

    pub fn phonemes(&self) -> &str {
        &self.phonemes
    }

    pub fn tokens(&self) -> &[i64] {
        &self.tokens
    }

    /// Number of phoneme units, used for style-row selection
    pub fn len(&self) -> usize {
        if self.tokens.is_empty() {
            self.phonemes.chars().count()
        } else {
            self.tokens.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty() && self.phonemes.trim().is_empty()
    }
}

/// Audio-affecting synthesis parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SynthesisParams {
    /// Speed multiplier (1.0 = natural)
    pub speed: f32,
    /// Output sample rate in Hz
    pub sample_rate: u32,
    /// Output encoding
    pub format: AudioFormat,
}

impl Default for SynthesisParams {
    fn default() -> Self {
        Self {
            speed: 1.0,
            sample_rate: DEFAULT_SAMPLE_RATE,
            format: AudioFormat::Pcm16,
        }
    }
}

impl SynthesisParams {
    /// Clamp to supported ranges and quantize speed to 1/1000.
    ///
    /// Fingerprints are computed from normalized parameters and backends only
    /// ever see normalized parameters, so two requests that share a
    /// fingerprint always run with identical inputs.
    pub fn normalized(&self) -> Self {
        let speed = if self.speed.is_finite() {
            self.speed.clamp(MIN_SPEED, MAX_SPEED)
        } else {
            1.0
        };
        Self {
            speed: (speed * 1000.0).round() / 1000.0,
            sample_rate: self.sample_rate.clamp(MIN_SAMPLE_RATE, MAX_SAMPLE_RATE),
            format: self.format,
        }
    }
}

/// Parameters passed to a backend for a single forward pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceParams {
    pub speed: f32,
}

impl From<&SynthesisParams> for InferenceParams {
    fn from(params: &SynthesisParams) -> Self {
        Self {
            speed: params.speed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_clamps_and_quantizes() {
        let params = SynthesisParams {
            speed: 1.23456,
            sample_rate: 96_000,
            format: AudioFormat::Wav,
        }
        .normalized();
        assert_eq!(params.speed, 1.235);
        assert_eq!(params.sample_rate, MAX_SAMPLE_RATE);

        let slow = SynthesisParams {
            speed: 0.1,
            ..Default::default()
        }
        .normalized();
        assert_eq!(slow.speed, MIN_SPEED);

        let nan = SynthesisParams {
            speed: f32::NAN,
            ..Default::default()
        }
        .normalized();
        assert_eq!(nan.speed, 1.0);
    }

    #[test]
    fn test_phoneme_len_prefers_tokens() {
        let seq = PhonemeSequence::new("həlˈoʊ", vec![0, 50, 83, 156, 57, 135, 0]);
        assert_eq!(seq.len(), 7);

        let phonemes_only = PhonemeSequence::new("həlˈoʊ", Vec::new());
        assert_eq!(phonemes_only.len(), 6);
        assert!(!phonemes_only.is_empty());
        assert!(PhonemeSequence::new("  ", Vec::new()).is_empty());
    }
}
