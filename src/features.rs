//! Feature extraction
//!
//! Turns a mono sample buffer into the immutable [`FeatureSet`] shared by the
//! key estimator and the decoder: per-frame chroma, bass pitch class and
//! energy, energy percentiles, and a tempo estimate.

use crate::bass::BassTracker;
use crate::cancel::{CancelToken, Cancelled};
use crate::chromagram::{Chromagram, ChromagramError, FrameSpectrum};
use crate::config::FeatureConfig;
use crate::theory::{NoteName, SEMITONES};

/// Rate every input is resampled to before analysis.
pub const CANONICAL_RATE: u32 = 22_050;

/// Features of one analysis frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameFeatures {
    /// L1-normalised chroma, all zero for silent frames.
    pub chroma: [f32; SEMITONES],
    /// Bass pitch class, `None` when no reliable bass was found.
    pub bass: Option<NoteName>,
    /// RMS of the frame.
    pub energy: f32,
}

/// Energy percentiles over all frames.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnergyStats {
    /// Low-energy percentile (see `FeatureConfig::low_energy_percentile`).
    pub low: f32,
    /// Median frame energy.
    pub median: f32,
    /// High-energy percentile (see `FeatureConfig::high_energy_percentile`).
    pub high: f32,
}

/// Per-run features, built once and read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSet {
    /// Frames in time order.
    pub frames: Vec<FrameFeatures>,
    /// Seconds between frame starts.
    pub hop_seconds: f32,
    /// Analysis sample rate.
    pub sample_rate: u32,
    /// Duration of the input in seconds.
    pub duration: f32,
    /// Energy percentiles.
    pub energy: EnergyStats,
    /// Tempo estimate in beats per minute.
    pub bpm: f32,
}

impl FeatureSet {
    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frame was produced.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Start time of frame `idx` in seconds.
    pub fn frame_time(&self, idx: usize) -> f32 {
        idx as f32 * self.hop_seconds
    }

    /// Whether frame `idx` starts within `window` seconds of either end.
    pub fn is_edge(&self, idx: usize, window: f32) -> bool {
        let t = self.frame_time(idx);
        t < window || t + self.hop_seconds > self.duration - window
    }

    /// Number of frames carrying a bass estimate.
    pub fn bass_frames(&self) -> usize {
        self.frames.iter().filter(|f| f.bass.is_some()).count()
    }
}

/// Frame-wise feature extractor for the canonical rate.
pub struct FeatureExtractor {
    config: FeatureConfig,
    chromagram: Chromagram,
    bass: BassTracker,
    hop: usize,
}

impl FeatureExtractor {
    /// Build an extractor for `config`.
    pub fn new(config: &FeatureConfig) -> Result<Self, ChromagramError> {
        if config.hop_seconds.is_nan() || config.hop_seconds <= 0.0 {
            return Err(ChromagramError::Configuration("hop_seconds must be positive".into()));
        }
        let chromagram = Chromagram::builder()
            .window_size(config.window_size)
            .sampling_rate(CANONICAL_RATE as usize)
            .min_frequency(config.min_frequency)
            .max_frequency(config.max_frequency)
            .build()?;
        let bass = BassTracker::new(
            CANONICAL_RATE as f32,
            chromagram.fft_size(),
            config.bass_min_frequency,
            config.bass_max_frequency,
            config.max_frequency,
            config.bass_min_correlation,
            config.bass_min_share,
        );
        let hop = ((config.hop_seconds * CANONICAL_RATE as f32).round() as usize).max(1);

        Ok(FeatureExtractor {
            config: config.clone(),
            chromagram,
            bass,
            hop,
        })
    }

    /// Extract the feature set of `samples` recorded at `sample_rate`.
    ///
    /// Never fails on content: empty or silent input yields empty or silent
    /// features with the default tempo. Only cancellation is reported.
    pub fn extract(
        &self,
        samples: &[f32],
        sample_rate: u32,
        cancel: &CancelToken,
    ) -> Result<FeatureSet, Cancelled> {
        let duration = if sample_rate == 0 {
            0.0
        } else {
            samples.len() as f32 / sample_rate as f32
        };
        let signal = resample_linear(samples, sample_rate, CANONICAL_RATE);
        let window = self.chromagram.window_size();
        let n_frames = match signal.len() {
            0 => 0,
            len if len <= window => 1,
            len => 1 + (len - window) / self.hop,
        };
        let hop_seconds = self.hop as f32 / CANONICAL_RATE as f32;
        log::debug!(
            "Extracting {} frames from {} samples ({:.2}s)",
            n_frames,
            signal.len(),
            duration
        );

        let frame_at = |i: usize| -> Result<FrameFeatures, Cancelled> {
            cancel.check()?;
            let start = i * self.hop;
            let end = (start + window).min(signal.len());
            Ok(self.analyze_frame(&signal[start..end]))
        };

        #[cfg(feature = "parallel")]
        let mut frames = {
            use rayon::prelude::*;
            (0..n_frames)
                .into_par_iter()
                .map(frame_at)
                .collect::<Result<Vec<_>, _>>()?
        };
        #[cfg(not(feature = "parallel"))]
        let mut frames = (0..n_frames).map(frame_at).collect::<Result<Vec<_>, _>>()?;

        let energy = energy_stats(&frames, &self.config);
        suppress_isolated_bass(&mut frames, energy.median);
        let energies: Vec<f32> = frames.iter().map(|f| f.energy).collect();
        let bpm = estimate_tempo(&energies, hop_seconds, &self.config);

        let features = FeatureSet {
            frames,
            hop_seconds,
            sample_rate: CANONICAL_RATE,
            duration,
            energy,
            bpm,
        };
        log::debug!(
            "Features: {} frames, {} with bass, tempo {:.1} BPM",
            features.len(),
            features.bass_frames(),
            features.bpm
        );
        Ok(features)
    }

    fn analyze_frame(&self, frame: &[f32]) -> FrameFeatures {
        let energy = if frame.is_empty() {
            0.0
        } else {
            let sum: f64 = frame.iter().map(|&x| f64::from(x) * f64::from(x)).sum();
            (sum / frame.len() as f64).sqrt() as f32
        };
        let spectrum = match self.chromagram.analyze(frame) {
            Ok(spectrum) => spectrum,
            Err(e) => {
                log::warn!("Frame analysis failed, treating frame as silent: {e}");
                FrameSpectrum {
                    chroma: [0.0; SEMITONES],
                    magnitude: Vec::new(),
                }
            }
        };
        let bass = self.bass.estimate(&spectrum.magnitude);
        FrameFeatures {
            chroma: spectrum.chroma,
            bass,
            energy,
        }
    }
}

/// Resample by linear interpolation. Non-finite samples are replaced by zero.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    let clean = |x: f32| if x.is_finite() { x } else { 0.0 };
    if from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return Vec::new();
    }
    if from_rate == to_rate {
        return samples.iter().copied().map(clean).collect();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            let a = clean(samples[idx]);
            let b = clean(samples[(idx + 1).min(last)]);
            a + (b - a) * frac.clamp(0.0, 1.0)
        })
        .collect()
}

fn energy_stats(frames: &[FrameFeatures], config: &FeatureConfig) -> EnergyStats {
    let mut sorted: Vec<f32> = frames.iter().map(|f| f.energy).collect();
    sorted.sort_by(f32::total_cmp);
    EnergyStats {
        low: percentile(&sorted, config.low_energy_percentile),
        median: percentile(&sorted, 0.5),
        high: percentile(&sorted, config.high_energy_percentile),
    }
}

/// Nearest-rank percentile of an ascending slice; zero when empty.
pub fn percentile(sorted: &[f32], q: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q.clamp(0.0, 1.0) * (sorted.len() - 1) as f32).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Drop single-frame bass detections whose neighbours disagree and are
/// quieter than `floor` on average.
fn suppress_isolated_bass(frames: &mut [FrameFeatures], floor: f32) {
    if frames.len() < 3 {
        return;
    }
    let original: Vec<Option<NoteName>> = frames.iter().map(|f| f.bass).collect();
    for i in 1..frames.len() - 1 {
        let Some(bass) = original[i] else { continue };
        let isolated = original[i - 1] != Some(bass) && original[i + 1] != Some(bass);
        let quiet = (frames[i - 1].energy + frames[i + 1].energy) * 0.5 < floor;
        if isolated && quiet {
            frames[i].bass = None;
        }
    }
}

/// Tempo from the autocorrelation of the frame-energy envelope over the lags
/// of `min_bpm..=max_bpm`.
fn estimate_tempo(energies: &[f32], hop_seconds: f32, config: &FeatureConfig) -> f32 {
    let fallback = config.default_bpm;
    if !(hop_seconds > 0.0 && config.min_bpm > 0.0 && config.max_bpm >= config.min_bpm) {
        return fallback;
    }
    let min_lag = ((60.0 / (config.max_bpm * hop_seconds)).round() as usize).max(1);
    let max_lag = ((60.0 / (config.min_bpm * hop_seconds)).round() as usize).max(min_lag);
    if energies.len() < 2 * max_lag + 1 {
        return fallback;
    }

    let mean = energies.iter().map(|&e| f64::from(e)).sum::<f64>() / energies.len() as f64;
    let centered: Vec<f64> = energies.iter().map(|&e| f64::from(e) - mean).collect();
    let variance: f64 = centered.iter().map(|c| c * c).sum();
    if variance <= 1e-9 * mean * mean * energies.len() as f64 + 1e-12 {
        return fallback;
    }

    let corr: Vec<f32> = (min_lag..=max_lag)
        .map(|lag| {
            (centered
                .iter()
                .zip(&centered[lag..])
                .map(|(a, b)| a * b)
                .sum::<f64>()
                / variance) as f32
        })
        .collect();
    let Some((idx, &best)) = corr
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1).then(b.0.cmp(&a.0)))
    else {
        return fallback;
    };
    if best.is_nan() || best <= 0.0 {
        return fallback;
    }

    let mut lag = (min_lag + idx) as f32;
    if idx > 0 && idx + 1 < corr.len() {
        let (a, b, c) = (corr[idx - 1], corr[idx], corr[idx + 1]);
        let denom = a - 2.0 * b + c;
        if denom.abs() > 1e-9 {
            lag += (0.5 * (a - c) / denom).clamp(-0.5, 0.5);
        }
    }
    (60.0 / (lag * hop_seconds)).clamp(config.min_bpm, config.max_bpm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(&FeatureConfig::default()).unwrap()
    }

    fn sines(freqs: &[f32], seconds: f32, rate: u32) -> Vec<f32> {
        let n = (seconds * rate as f32) as usize;
        (0..n)
            .map(|i| {
                let t = i as f32 / rate as f32;
                freqs.iter().map(|f| (2.0 * PI * f * t).sin()).sum::<f32>() * 0.2
            })
            .collect()
    }

    #[test]
    fn resampling_preserves_duration() {
        let input = vec![0.5; 44_100];
        let out = resample_linear(&input, 44_100, 22_050);
        assert_eq!(out.len(), 22_050);
        assert!(out.iter().all(|&x| (x - 0.5).abs() < 1e-6));
        assert_eq!(resample_linear(&[1.0, f32::NAN], 22_050, 22_050), vec![1.0, 0.0]);
        assert!(resample_linear(&input, 0, 22_050).is_empty());
    }

    #[test]
    fn chroma_invariant_holds_per_frame() {
        let samples = sines(&[220.0, 261.63, 329.63], 2.0, 22_050);
        let features = extractor().extract(&samples, 22_050, &CancelToken::new()).unwrap();
        assert!(!features.is_empty());
        for frame in &features.frames {
            let sum: f32 = frame.chroma.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
            assert!(frame.chroma.iter().all(|&c| c >= 0.0));
        }
        assert!(features.frames.iter().all(|f| f.bass == Some(NoteName::A)));
    }

    #[test]
    fn loud_input_keeps_finite_energy() {
        let samples: Vec<f32> = sines(&[220.0, 261.63, 329.63], 2.0, 22_050)
            .into_iter()
            .map(|x| x * 1e30)
            .collect();
        let features = extractor().extract(&samples, 22_050, &CancelToken::new()).unwrap();
        assert!(features.frames.iter().all(|f| f.energy.is_finite() && f.energy > 0.0));
        assert!(features.frames.iter().all(|f| (f.chroma.iter().sum::<f32>() - 1.0).abs() < 1e-4));
        assert!(features.bpm.is_finite());
    }

    #[test]
    fn silence_yields_defaults() {
        let features = extractor()
            .extract(&vec![0.0; 22_050 * 10], 22_050, &CancelToken::new())
            .unwrap();
        assert_eq!(features.len(), 99);
        assert_eq!(features.bpm, 120.0);
        assert_eq!(features.bass_frames(), 0);
        assert!(features.frames.iter().all(|f| f.chroma == [0.0; SEMITONES]));
        assert!((features.duration - 10.0).abs() < 1e-6);
    }

    #[test]
    fn empty_input_has_no_frames() {
        let features = extractor().extract(&[], 44_100, &CancelToken::new()).unwrap();
        assert!(features.is_empty());
        assert_eq!(features.bpm, 120.0);
    }

    #[test]
    fn tempo_follows_energy_pulses() {
        // one pulse every 5 frames of 0.1s = 120 BPM
        let energies: Vec<f32> = (0..60).map(|i| if i % 5 == 0 { 1.0 } else { 0.1 }).collect();
        let bpm = estimate_tempo(&energies, 0.1, &FeatureConfig::default());
        assert!((bpm - 120.0).abs() < 5.0, "bpm = {bpm}");
        assert_eq!(estimate_tempo(&energies[..10], 0.1, &FeatureConfig::default()), 120.0);
    }

    #[test]
    fn isolated_bass_is_dropped() {
        let frame = |bass, energy| FrameFeatures { chroma: [0.0; SEMITONES], bass, energy };
        let mut frames = vec![
            frame(None, 0.01),
            frame(Some(NoteName::E), 0.5),
            frame(None, 0.01),
            frame(Some(NoteName::C), 0.5),
            frame(Some(NoteName::C), 0.5),
        ];
        suppress_isolated_bass(&mut frames, 0.2);
        assert_eq!(frames[1].bass, None);
        assert_eq!(frames[3].bass, Some(NoteName::C));
    }

    #[test]
    fn cancellation_stops_extraction() {
        let token = CancelToken::new();
        token.cancel();
        let samples = sines(&[440.0], 1.0, 22_050);
        assert_eq!(extractor().extract(&samples, 22_050, &token), Err(Cancelled));
    }
}
