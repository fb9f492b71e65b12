//! Low-level acoustic descriptors and a statistics-pooling speaker encoder.
//!
//! Both run over the same framing front end:
//!
//! - 25ms frames, 10ms shift (scaled to the input sample rate)
//! - DC removal, pre-emphasis 0.97, Povey window
//! - radix-2 FFT power spectrum
//! - triangular mel filterbank, log energies
//!
//! Pitch is estimated per frame by normalized autocorrelation over the
//! configured F0 range; frames whose peak correlation is under the voicing
//! threshold are unvoiced.

use std::f64::consts::PI;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::audio::Waveform;
use crate::embedding::l2_normalize;
use crate::engine::{FeatureExtractor, SpeakerEncoder};
use crate::error::ScoringError;

/// Configures the analysis front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Frame length in milliseconds (default: 25).
    pub frame_length_ms: f64,
    /// Frame shift in milliseconds (default: 10).
    pub frame_shift_ms: f64,
    /// Number of mel bands (default: 40).
    pub num_mels: usize,
    /// Low cutoff for the filterbank in Hz (default: 20).
    pub low_freq: f64,
    /// High cutoff in Hz; non-positive values are offsets from Nyquist
    /// (default: -400).
    pub high_freq: f64,
    /// Pre-emphasis coefficient (default: 0.97).
    pub pre_emphasis: f64,
    /// Floor for band energies before the log (default: 1e-10).
    pub energy_floor: f64,
    /// Lowest pitch searched in Hz (default: 60).
    pub min_pitch_hz: f64,
    /// Highest pitch searched in Hz (default: 400).
    pub max_pitch_hz: f64,
    /// Minimum normalized autocorrelation for a voiced frame (default: 0.45).
    pub voicing_threshold: f64,
    /// Frames quieter than this (dBFS) are treated as silence (default: -55).
    pub silence_dbfs: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            frame_length_ms: 25.0,
            frame_shift_ms: 10.0,
            num_mels: 40,
            low_freq: 20.0,
            high_freq: -400.0,
            pre_emphasis: 0.97,
            energy_floor: 1e-10,
            min_pitch_hz: 60.0,
            max_pitch_hz: 400.0,
            voicing_threshold: 0.45,
            silence_dbfs: -55.0,
        }
    }
}

/// Pitch contour statistics over voiced frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PitchStats {
    pub mean_hz: f64,
    pub std_hz: f64,
    /// Spread between the 10th and 90th percentile.
    pub range_hz: f64,
    /// Fraction of non-silent frames that are voiced.
    pub voiced_ratio: f64,
}

/// Frame energy distribution in dB.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyStats {
    pub mean_db: f64,
    pub std_db: f64,
    pub p10_db: f64,
    pub p90_db: f64,
}

/// Summary of a waveform's prosody and timbre.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcousticDescriptors {
    pub pitch: PitchStats,
    pub energy: EnergyStats,
    /// Mean log-mel energy per band with the overall level removed.
    pub spectral_envelope: Vec<f64>,
}

impl AcousticDescriptors {
    /// Non-negative magnitudes for cross-voice comparison: pitch mean, std
    /// and range, energy std and p90-p10 spread, and the spectral centroid
    /// expressed as a 1-based mel band position.
    pub fn profile_vector(&self) -> Vec<f64> {
        let weights: Vec<f64> = self.spectral_envelope.iter().map(|e| e.exp()).collect();
        let total: f64 = weights.iter().sum();
        let centroid = if total > 0.0 && total.is_finite() {
            weights
                .iter()
                .enumerate()
                .map(|(i, w)| (i + 1) as f64 * w)
                .sum::<f64>()
                / total
        } else {
            0.0
        };
        vec![
            self.pitch.mean_hz.max(0.0),
            self.pitch.std_hz.max(0.0),
            self.pitch.range_hz.max(0.0),
            self.energy.std_db.max(0.0),
            (self.energy.p90_db - self.energy.p10_db).max(0.0),
            centroid,
        ]
    }

    /// Similarity in `[0, 1]`: the mean of the pitch, energy and
    /// spectral-envelope group similarities.
    pub fn similarity(&self, other: &AcousticDescriptors) -> f64 {
        let pitch = mean(&[
            ratio_similarity(self.pitch.mean_hz, other.pitch.mean_hz),
            ratio_similarity(self.pitch.std_hz, other.pitch.std_hz),
            ratio_similarity(self.pitch.range_hz, other.pitch.range_hz),
            1.0 - (self.pitch.voiced_ratio - other.pitch.voiced_ratio).abs().min(1.0),
        ]);
        // Absolute levels are normalized away upstream; compare shape.
        let energy = mean(&[
            db_similarity(self.energy.std_db, other.energy.std_db),
            db_similarity(
                self.energy.p90_db - self.energy.p10_db,
                other.energy.p90_db - other.energy.p10_db,
            ),
        ]);
        let envelope = if self.spectral_envelope.len() == other.spectral_envelope.len()
            && !self.spectral_envelope.is_empty()
        {
            let rms = (self
                .spectral_envelope
                .iter()
                .zip(&other.spectral_envelope)
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f64>()
                / self.spectral_envelope.len() as f64)
                .sqrt();
            1.0 / (1.0 + rms)
        } else {
            0.0
        };
        ((pitch + energy + envelope) / 3.0).clamp(0.0, 1.0)
    }
}

/// Computes descriptors for a waveform.
pub fn extract_descriptors(
    wave: &Waveform,
    cfg: &FeatureConfig,
) -> Result<AcousticDescriptors, ScoringError> {
    let analysis = analyze(wave, cfg)?;

    let voiced: Vec<f64> = analysis.pitch.iter().filter_map(|p| *p).collect();
    let active = analysis
        .energy_db
        .iter()
        .filter(|&&e| e > cfg.silence_dbfs)
        .count();
    let pitch = if voiced.is_empty() {
        PitchStats::default()
    } else {
        let (m, s) = mean_std(&voiced);
        PitchStats {
            mean_hz: m,
            std_hz: s,
            range_hz: percentile(&voiced, 0.9) - percentile(&voiced, 0.1),
            voiced_ratio: voiced.len() as f64 / active.max(1) as f64,
        }
    };

    let (mean_db, std_db) = mean_std(&analysis.energy_db);
    let energy = EnergyStats {
        mean_db,
        std_db,
        p10_db: percentile(&analysis.energy_db, 0.1),
        p90_db: percentile(&analysis.energy_db, 0.9),
    };

    let mut envelope = vec![0.0f64; cfg.num_mels];
    for frame in &analysis.log_mel {
        for (e, &v) in envelope.iter_mut().zip(frame) {
            *e += v as f64;
        }
    }
    let n = analysis.log_mel.len() as f64;
    for e in &mut envelope {
        *e /= n;
    }
    let level = envelope.iter().sum::<f64>() / envelope.len().max(1) as f64;
    for e in &mut envelope {
        *e -= level;
    }

    Ok(AcousticDescriptors {
        pitch,
        energy,
        spectral_envelope: envelope,
    })
}

/// Extracts [`AcousticDescriptors`] with the built-in front end.
#[derive(Debug, Clone, Default)]
pub struct FbankDescriptorExtractor {
    cfg: FeatureConfig,
}

impl FbankDescriptorExtractor {
    pub fn new(cfg: FeatureConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl FeatureExtractor for FbankDescriptorExtractor {
    async fn describe(&self, wave: &Waveform) -> Result<AcousticDescriptors, ScoringError> {
        extract_descriptors(wave, &self.cfg)
    }
}

/// Speaker encoder that pools log-mel statistics (per-band mean and
/// standard deviation) into an L2-normalized vector of `2 * num_mels`.
///
/// It is a lightweight stand-in for a neural speaker model: good enough
/// for offline runs and tests, not for production identity matching.
#[derive(Debug, Clone, Default)]
pub struct StatsPoolingEncoder {
    cfg: FeatureConfig,
}

impl StatsPoolingEncoder {
    pub fn new(cfg: FeatureConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl SpeakerEncoder for StatsPoolingEncoder {
    async fn encode(&self, wave: &Waveform) -> Result<Vec<f32>, ScoringError> {
        let analysis = analyze(wave, &self.cfg)?;
        let num_mels = self.cfg.num_mels;
        let t = analysis.log_mel.len() as f64;

        let mut means = vec![0.0f64; num_mels];
        for frame in &analysis.log_mel {
            for (m, &v) in means.iter_mut().zip(frame) {
                *m += v as f64;
            }
        }
        for m in &mut means {
            *m /= t;
        }
        let mut stds = vec![0.0f64; num_mels];
        for frame in &analysis.log_mel {
            for (b, &v) in frame.iter().enumerate() {
                let d = v as f64 - means[b];
                stds[b] += d * d;
            }
        }
        for s in &mut stds {
            *s = (*s / t).sqrt();
        }

        // Remove the overall level so loudness does not move the vector.
        let level = means.iter().sum::<f64>() / num_mels as f64;
        let mut out: Vec<f32> = means.iter().map(|m| (m - level) as f32).collect();
        out.extend(stds.iter().map(|&s| s as f32));
        l2_normalize(&mut out);
        Ok(out)
    }

    fn dimension(&self) -> usize {
        2 * self.cfg.num_mels
    }
}

struct Analysis {
    log_mel: Vec<Vec<f32>>,
    energy_db: Vec<f64>,
    pitch: Vec<Option<f64>>,
}

fn analyze(wave: &Waveform, cfg: &FeatureConfig) -> Result<Analysis, ScoringError> {
    let rate = wave.sample_rate() as f64;
    let frame_length = (cfg.frame_length_ms / 1000.0 * rate).round() as usize;
    let frame_shift = (cfg.frame_shift_ms / 1000.0 * rate).round() as usize;
    if frame_length == 0 || frame_shift == 0 || cfg.num_mels == 0 {
        return Err(ScoringError::Extractor("degenerate frame configuration".into()));
    }
    let samples: Vec<f64> = wave.samples().iter().map(|&s| s as f64).collect();
    if samples.len() < frame_length {
        return Err(ScoringError::AudioTooShort {
            min: Duration::from_secs_f64(frame_length as f64 / rate),
            got: wave.duration(),
        });
    }

    let num_frames = (samples.len() - frame_length) / frame_shift + 1;
    let fft_size = next_pow2(frame_length);
    let half_fft = fft_size / 2 + 1;
    let window = povey_window(frame_length);
    let high_freq = if cfg.high_freq <= 0.0 {
        rate / 2.0 + cfg.high_freq
    } else {
        cfg.high_freq
    };
    let filterbank = mel_filterbank(cfg.num_mels, fft_size, rate, cfg.low_freq, high_freq);

    let min_lag = (rate / cfg.max_pitch_hz).floor().max(1.0) as usize;
    let max_lag = ((rate / cfg.min_pitch_hz).ceil() as usize).min(frame_length - 1);

    let mut log_mel = Vec::with_capacity(num_frames);
    let mut energy_db = Vec::with_capacity(num_frames);
    let mut pitch = Vec::with_capacity(num_frames);
    let mut fft_buf = vec![(0.0f64, 0.0f64); fft_size];

    for f in 0..num_frames {
        let offset = f * frame_shift;
        let mut frame: Vec<f64> = samples[offset..offset + frame_length].to_vec();

        let dc = frame.iter().sum::<f64>() / frame_length as f64;
        for v in &mut frame {
            *v -= dc;
        }

        let rms = (frame.iter().map(|v| v * v).sum::<f64>() / frame_length as f64).sqrt();
        let db = if rms > 0.0 { 20.0 * rms.log10() } else { -120.0 };
        energy_db.push(db.max(-120.0));

        pitch.push(if db > cfg.silence_dbfs && min_lag < max_lag {
            estimate_pitch(&frame, rate, min_lag, max_lag, cfg.voicing_threshold)
        } else {
            None
        });

        if cfg.pre_emphasis > 0.0 {
            for i in (1..frame_length).rev() {
                frame[i] -= cfg.pre_emphasis * frame[i - 1];
            }
            frame[0] *= 1.0 - cfg.pre_emphasis;
        }

        for v in &mut fft_buf {
            *v = (0.0, 0.0);
        }
        for i in 0..frame_length {
            fft_buf[i] = (frame[i] * window[i], 0.0);
        }
        fft(&mut fft_buf);

        let power: Vec<f64> = fft_buf[..half_fft]
            .iter()
            .map(|&(r, im)| r * r + im * im)
            .collect();

        let bands = filterbank
            .iter()
            .map(|filter| {
                let e: f64 = filter.iter().zip(&power).map(|(w, p)| w * p).sum();
                e.max(cfg.energy_floor).ln() as f32
            })
            .collect();
        log_mel.push(bands);
    }

    Ok(Analysis {
        log_mel,
        energy_db,
        pitch,
    })
}

/// Normalized autocorrelation pitch estimate; `None` when unvoiced.
///
/// Picks the first local peak within 90% of the strongest correlation so
/// that multiples of the true period do not cause octave errors.
fn estimate_pitch(frame: &[f64], rate: f64, min_lag: usize, max_lag: usize, threshold: f64) -> Option<f64> {
    let corr: Vec<f64> = (min_lag..=max_lag)
        .map(|lag| {
            let n = frame.len() - lag;
            let mut num = 0.0;
            let mut e0 = 0.0;
            let mut e1 = 0.0;
            for i in 0..n {
                num += frame[i] * frame[i + lag];
                e0 += frame[i] * frame[i];
                e1 += frame[i + lag] * frame[i + lag];
            }
            let denom = (e0 * e1).sqrt();
            if denom > 0.0 { num / denom } else { 0.0 }
        })
        .collect();

    let best = corr.iter().cloned().fold(0.0f64, f64::max);
    if best < threshold {
        return None;
    }
    let last = corr.len() - 1;
    (0..corr.len())
        .find(|&i| {
            corr[i] >= 0.9 * best
                && (i == 0 || corr[i] >= corr[i - 1])
                && (i == last || corr[i] >= corr[i + 1])
        })
        .map(|i| rate / (min_lag + i) as f64)
}

fn ratio_similarity(a: f64, b: f64) -> f64 {
    let scale = a.abs().max(b.abs());
    if scale <= f64::EPSILON {
        return 1.0;
    }
    1.0 - ((a - b).abs() / scale).min(1.0)
}

fn db_similarity(a: f64, b: f64) -> f64 {
    1.0 / (1.0 + (a - b).abs() / 6.0)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    (m, var.sqrt())
}

fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[idx]
}

fn next_pow2(n: usize) -> usize {
    let mut p = 1;
    while p < n {
        p <<= 1;
    }
    p
}

/// Povey window (hamming^0.85).
fn povey_window(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| (0.54 - 0.46 * (2.0 * PI * i as f64 / (n - 1).max(1) as f64).cos()).powf(0.85))
        .collect()
}

fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10.0_f64.powf(mel / 2595.0) - 1.0)
}

/// Triangular mel filterbank, `[num_mels][fft_size / 2 + 1]`.
fn mel_filterbank(num_mels: usize, fft_size: usize, rate: f64, low_freq: f64, high_freq: f64) -> Vec<Vec<f64>> {
    let half_fft = fft_size / 2 + 1;
    let mel_low = hz_to_mel(low_freq);
    let mel_high = hz_to_mel(high_freq);

    let bins: Vec<usize> = (0..num_mels + 2)
        .map(|i| {
            let mel = mel_low + i as f64 * (mel_high - mel_low) / (num_mels + 1) as f64;
            let bin = (mel_to_hz(mel) * fft_size as f64 / rate).floor() as isize;
            bin.clamp(0, half_fft as isize - 1) as usize
        })
        .collect();

    (0..num_mels)
        .map(|m| {
            let mut filter = vec![0.0f64; half_fft];
            let (left, center, right) = (bins[m], bins[m + 1], bins[m + 2]);
            if center > left {
                for k in left..=center {
                    filter[k] = (k - left) as f64 / (center - left) as f64;
                }
            }
            if right > center {
                for k in center..=right {
                    filter[k] = (right - k) as f64 / (right - center) as f64;
                }
            }
            filter
        })
        .collect()
}

/// In-place iterative Cooley-Tukey FFT on `(re, im)` pairs.
/// Length must be a power of 2.
fn fft(x: &mut [(f64, f64)]) {
    let n = x.len();
    if n <= 1 {
        return;
    }

    let mut j = 0usize;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j ^= bit;
        if i < j {
            x.swap(i, j);
        }
    }

    let mut size = 2;
    while size <= n {
        let half = size / 2;
        let angle = -2.0 * PI / size as f64;
        let wn = (angle.cos(), angle.sin());
        let mut start = 0;
        while start < n {
            let mut w = (1.0, 0.0);
            for k in 0..half {
                let u = x[start + k];
                let v = x[start + k + half];
                let t = (w.0 * v.0 - w.1 * v.1, w.0 * v.1 + w.1 * v.0);
                x[start + k] = (u.0 + t.0, u.1 + t.1);
                x[start + k + half] = (u.0 - t.0, u.1 - t.1);
                w = (w.0 * wn.0 - w.1 * wn.1, w.0 * wn.1 + w.1 * wn.0);
            }
            start += size;
        }
        size <<= 1;
    }
}
