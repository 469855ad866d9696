//! Audio buffers returned to callers
//!
//! Backends produce mono `f32` samples at the model's native rate
//! ([`RawAudio`]). The engine resamples and encodes them into an immutable
//! [`AudioBuffer`] that is shared by reference between the result cache and
//! every caller.

use std::io::Cursor;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};

/// Output encoding requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Raw signed 16-bit little-endian PCM
    #[default]
    Pcm16,
    /// Raw 32-bit little-endian float PCM
    Float32,
    /// RIFF/WAVE container with 16-bit PCM
    Wav,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Pcm16 => "pcm16",
            AudioFormat::Float32 => "float32",
            AudioFormat::Wav => "wav",
        }
    }

    pub fn bit_depth(&self) -> u16 {
        match self {
            AudioFormat::Pcm16 | AudioFormat::Wav => 16,
            AudioFormat::Float32 => 32,
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pcm16" | "pcm" | "linear16" | "s16le" => Ok(AudioFormat::Pcm16),
            "float32" | "f32" | "f32le" => Ok(AudioFormat::Float32),
            "wav" | "wave" => Ok(AudioFormat::Wav),
            other => Err(EngineError::InvalidRequest(format!(
                "Unsupported audio format: {other}. Supported formats: pcm16, float32, wav"
            ))),
        }
    }
}

/// Unencoded mono samples straight from a backend
#[derive(Debug, Clone, PartialEq)]
pub struct RawAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl RawAudio {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Encoded, immutable synthesis output
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    data: Bytes,
    format: AudioFormat,
    sample_rate: u32,
    channels: u16,
    bit_depth: u16,
    duration: Duration,
    produced_by: String,
}

impl AudioBuffer {
    /// Resample `raw` to `sample_rate` and encode it as `format`
    pub fn encode(
        raw: &RawAudio,
        sample_rate: u32,
        format: AudioFormat,
        produced_by: &str,
    ) -> EngineResult<Self> {
        let samples = resample_linear(&raw.samples, raw.sample_rate, sample_rate);
        let data = match format {
            AudioFormat::Pcm16 => {
                let mut out = Vec::with_capacity(samples.len() * 2);
                for sample in &samples {
                    out.extend_from_slice(&to_i16(*sample).to_le_bytes());
                }
                out
            }
            AudioFormat::Float32 => {
                let mut out = Vec::with_capacity(samples.len() * 4);
                for sample in &samples {
                    out.extend_from_slice(&sample.clamp(-1.0, 1.0).to_le_bytes());
                }
                out
            }
            AudioFormat::Wav => encode_wav(&samples, sample_rate)?,
        };

        let duration = if sample_rate == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(samples.len() as f64 / sample_rate as f64)
        };

        Ok(Self {
            data: Bytes::from(data),
            format,
            sample_rate,
            channels: 1,
            bit_depth: format.bit_depth(),
            duration,
            produced_by: produced_by.to_string(),
        })
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn bit_depth(&self) -> u16 {
        self.bit_depth
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Name of the backend slot that generated the audio
    pub fn produced_by(&self) -> &str {
        &self.produced_by
    }

    /// Bytes charged against the result cache budget
    pub fn byte_size(&self) -> u64 {
        (self.data.len() + self.produced_by.len() + std::mem::size_of::<Self>()) as u64
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

fn encode_wav(samples: &[f32], sample_rate: u32) -> EngineResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut buffer = Vec::with_capacity(44 + samples.len() * 2);
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut buffer), spec)
            .map_err(|e| EngineError::Io(format!("Failed to create WAV writer: {e}")))?;
        for sample in samples {
            writer
                .write_sample(to_i16(*sample))
                .map_err(|e| EngineError::Io(format!("Failed to write WAV sample: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| EngineError::Io(format!("Failed to finalize WAV: {e}")))?;
    }
    Ok(buffer)
}

/// Linear-interpolation resampler for mono audio
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] + (samples[next] - samples[idx]) * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize) -> RawAudio {
        RawAudio {
            samples: (0..len).map(|i| (i as f32 / len as f32) * 2.0 - 1.0).collect(),
            sample_rate: 24_000,
        }
    }

    #[test]
    fn test_pcm16_encoding_metadata() {
        let raw = tone(2400);
        let buffer = AudioBuffer::encode(&raw, 24_000, AudioFormat::Pcm16, "kokoro").unwrap();

        assert_eq!(buffer.data().len(), 4800);
        assert_eq!(buffer.bit_depth(), 16);
        assert_eq!(buffer.channels(), 1);
        assert_eq!(buffer.duration(), Duration::from_millis(100));
        assert_eq!(buffer.produced_by(), "kokoro");
    }

    #[test]
    fn test_wav_round_trips_through_hound() {
        let raw = tone(480);
        let buffer = AudioBuffer::encode(&raw, 16_000, AudioFormat::Wav, "kokoro").unwrap();

        let reader = hound::WavReader::new(Cursor::new(buffer.data().to_vec())).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.len(), 320);
    }

    #[test]
    fn test_float32_clamps() {
        let raw = RawAudio {
            samples: vec![2.0, -3.0, 0.5],
            sample_rate: 24_000,
        };
        let buffer = AudioBuffer::encode(&raw, 24_000, AudioFormat::Float32, "x").unwrap();
        let decoded: Vec<f32> = buffer
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(decoded, vec![1.0, -1.0, 0.5]);
    }

    #[test]
    fn test_resample_lengths() {
        let samples = vec![0.0f32; 24_000];
        assert_eq!(resample_linear(&samples, 24_000, 16_000).len(), 16_000);
        assert_eq!(resample_linear(&samples, 24_000, 48_000).len(), 48_000);
        assert_eq!(resample_linear(&samples, 24_000, 24_000).len(), 24_000);
    }

    #[test]
    fn test_audio_format_parse() {
        assert_eq!("WAV".parse::<AudioFormat>().unwrap(), AudioFormat::Wav);
        assert_eq!("f32".parse::<AudioFormat>().unwrap(), AudioFormat::Float32);
        assert!("mp3".parse::<AudioFormat>().is_err());
    }
}
