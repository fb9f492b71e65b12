//! Mono waveform container and the loudness/concatenation helpers the
//! reference synthesizer needs.

use std::path::Path;
use std::time::Duration;

use crate::error::{DistillError, DistillResult, RenderError};

/// Loudness reported for digital silence.
pub const SILENCE_DBFS: f64 = -120.0;

/// Peak ceiling applied after gain so normalization never clips.
const PEAK_CEILING: f32 = 0.999;

/// Mono audio as normalized f32 samples in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Returns `duration` of zeros at the given rate.
    pub fn silence(duration: Duration, sample_rate: u32) -> Self {
        let n = (duration.as_secs_f64() * sample_rate as f64).round() as usize;
        Self::new(vec![0.0; n], sample_rate)
    }

    /// Decodes PCM16 signed little-endian mono bytes.
    /// A trailing odd byte is ignored.
    pub fn from_pcm16(audio: &[u8], sample_rate: u32) -> Self {
        let samples = audio
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .collect();
        Self::new(samples, sample_rate)
    }

    /// Encodes as PCM16 signed little-endian mono bytes.
    pub fn to_pcm16(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for &s in &self.samples {
            out.extend_from_slice(&to_i16(s).to_le_bytes());
        }
        out
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// RMS level in dBFS. Silence reports [`SILENCE_DBFS`].
    pub fn rms_dbfs(&self) -> f64 {
        if self.samples.is_empty() {
            return SILENCE_DBFS;
        }
        let sum: f64 = self.samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        let rms = (sum / self.samples.len() as f64).sqrt();
        if rms <= 0.0 {
            return SILENCE_DBFS;
        }
        (20.0 * rms.log10()).max(SILENCE_DBFS)
    }

    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |m, &s| m.max(s.abs()))
    }

    /// Scales the waveform so its RMS level hits `target_dbfs`.
    ///
    /// Gain is reduced when the scaled peak would exceed the ceiling, so
    /// very dynamic material may land slightly under the target.
    pub fn normalize_loudness(&mut self, target_dbfs: f64) {
        let current = self.rms_dbfs();
        if current <= SILENCE_DBFS {
            return;
        }
        let mut gain = 10f64.powf((target_dbfs - current) / 20.0) as f32;
        let peak = self.peak();
        if peak * gain > PEAK_CEILING {
            gain = PEAK_CEILING / peak;
        }
        for s in &mut self.samples {
            *s *= gain;
        }
    }

    /// Joins clips with `gap` of silence between them.
    /// All clips must share one sample rate.
    pub fn concat(clips: &[Waveform], gap: Duration) -> Result<Waveform, RenderError> {
        let Some(first) = clips.first() else {
            return Err(RenderError::InvalidAudio("no clips to concatenate".into()));
        };
        let rate = first.sample_rate;
        let gap_len = (gap.as_secs_f64() * rate as f64).round() as usize;
        let total: usize = clips.iter().map(|c| c.len()).sum::<usize>() + gap_len * (clips.len() - 1);

        let mut samples = Vec::with_capacity(total);
        for (i, clip) in clips.iter().enumerate() {
            if clip.sample_rate != rate {
                return Err(RenderError::InvalidAudio(format!(
                    "sample rate mismatch: {} vs {}",
                    clip.sample_rate, rate
                )));
            }
            if i > 0 {
                samples.resize(samples.len() + gap_len, 0.0);
            }
            samples.extend_from_slice(&clip.samples);
        }
        Ok(Waveform::new(samples, rate))
    }

    /// Drops samples past `max`.
    pub fn truncate(&mut self, max: Duration) {
        let n = (max.as_secs_f64() * self.sample_rate as f64).floor() as usize;
        self.samples.truncate(n);
    }

    /// Reads a mono WAV file (integer or float samples).
    pub fn read_wav(path: impl AsRef<Path>) -> DistillResult<Self> {
        let mut reader = hound::WavReader::open(path.as_ref())?;
        let spec = reader.spec();
        if spec.channels != 1 {
            return Err(DistillError::Audio(format!(
                "{}: expected mono, got {} channels",
                path.as_ref().display(),
                spec.channels
            )));
        }
        let samples = match spec.sample_format {
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<Vec<_>, _>>()?
            }
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?,
        };
        Ok(Self::new(samples, spec.sample_rate))
    }

    /// Encodes the waveform as a 16-bit PCM mono WAV file in memory.
    pub fn to_wav_bytes(&self) -> DistillResult<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &s in &self.samples {
            writer.write_sample(to_i16(s))?;
        }
        writer.finalize()?;
        Ok(cursor.into_inner())
    }
}

fn to_i16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * 32767.0).round() as i16
}
