//! Chromagram
//!
//! Per-frame magnitude spectrum and 12-bin chroma for offline analysis.
//!
//! Each frame is Hann-windowed, zero-padded to the next power of two and
//! transformed with `rustfft`. Every bin inside the analysis band is mapped to
//! its nearest pitch class and its magnitude accumulated into the chroma,
//! which is then L1-normalised.

use std::{
    collections::HashMap,
    f32::consts::PI,
    sync::{Arc, OnceLock, PoisonError, RwLock},
};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use thiserror::Error;

use crate::theory::{frequency_to_note, SEMITONES};

/// Sums below this are treated as silence.
const SILENCE: f32 = 1e-12;

/// Errors returned by the Chromagram pipeline.
#[derive(Debug, Error)]
pub enum ChromagramError {
    /// Frame received was longer than the analysis window.
    #[error("expected frame of at most {expected} samples, got {got}")]
    InvalidFrameSize {
        /// The analysis window length.
        expected: usize,
        /// The actual size of the received audio frame.
        got: usize,
    },

    /// An error occurred during the configuration of the Chromagram.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Analysis of a single frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSpectrum {
    /// L1-normalised chroma, all zero when the band is silent.
    pub chroma: [f32; SEMITONES],
    /// Magnitude of bins `0..=fft_size / 2`.
    pub magnitude: Vec<f32>,
}

/// Builder for a Chromagram pipeline.
pub struct ChromagramBuilder {
    window_size: usize,
    sampling_rate: usize,
    min_frequency: f32,
    max_frequency: f32,
}

impl ChromagramBuilder {
    /// Start with default parameters:
    /// window_size = 4096, sampling_rate = 22_050,
    /// min_frequency = 80 Hz, max_frequency = 5000 Hz.
    pub fn new() -> Self {
        ChromagramBuilder {
            window_size: 4096,
            sampling_rate: 22_050,
            min_frequency: 80.0,
            max_frequency: 5000.0,
        }
    }

    /// Set the analysis window length in samples.
    pub fn window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    /// Set the sampling rate of the audio.
    pub fn sampling_rate(mut self, rate: usize) -> Self {
        self.sampling_rate = rate;
        self
    }

    /// Set the lowest frequency folded into the chroma.
    pub fn min_frequency(mut self, hz: f32) -> Self {
        self.min_frequency = hz;
        self
    }

    /// Set the highest frequency folded into the chroma.
    pub fn max_frequency(mut self, hz: f32) -> Self {
        self.max_frequency = hz;
        self
    }

    /// Finalize and create the Chromagram.
    pub fn build(self) -> Result<Chromagram, ChromagramError> {
        if self.window_size == 0 {
            return Err(ChromagramError::Configuration("window_size cannot be zero".into()));
        }
        if self.sampling_rate == 0 {
            return Err(ChromagramError::Configuration("sampling_rate cannot be zero".into()));
        }
        if !(self.min_frequency > 0.0 && self.min_frequency < self.max_frequency) {
            return Err(ChromagramError::Configuration(format!(
                "invalid chroma band {}..{} Hz",
                self.min_frequency, self.max_frequency
            )));
        }

        let fft_size = self.window_size.next_power_of_two();
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);

        let bin_width = self.sampling_rate as f32 / fft_size as f32;
        let bin_classes = (0..=fft_size / 2)
            .map(|k| {
                let freq = k as f32 * bin_width;
                if freq < self.min_frequency || freq > self.max_frequency {
                    None
                } else {
                    frequency_to_note(freq).map(|n| n.index())
                }
            })
            .collect();

        Ok(Chromagram {
            window: hann_window(self.window_size),
            fft,
            fft_size,
            sampling_rate: self.sampling_rate,
            bin_classes,
        })
    }
}

impl Default for ChromagramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame-wise chromagram calculator.
///
/// Holds no per-frame state, so one instance can analyse frames from several
/// threads.
pub struct Chromagram {
    window: Arc<[f32]>,
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    sampling_rate: usize,
    bin_classes: Vec<Option<usize>>,
}

impl Chromagram {
    /// Start customizing with a builder.
    pub fn builder() -> ChromagramBuilder {
        ChromagramBuilder::new()
    }

    /// Analysis window length in samples.
    pub fn window_size(&self) -> usize {
        self.window.len()
    }

    /// Transform length (window length rounded up to a power of two).
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Sampling rate the chromagram was built for.
    pub fn sampling_rate(&self) -> usize {
        self.sampling_rate
    }

    /// Width of one spectral bin in Hz.
    pub fn bin_width(&self) -> f32 {
        self.sampling_rate as f32 / self.fft_size as f32
    }

    /// Analyse one frame. Frames shorter than the window are zero-padded.
    pub fn analyze(&self, frame: &[f32]) -> Result<FrameSpectrum, ChromagramError> {
        if frame.len() > self.window.len() {
            return Err(ChromagramError::InvalidFrameSize {
                expected: self.window.len(),
                got: frame.len(),
            });
        }
        let magnitude = self.compute_spectrum(frame);
        let chroma = self.compute_chromagram(&magnitude);
        Ok(FrameSpectrum { chroma, magnitude })
    }

    #[inline]
    fn compute_spectrum(&self, frame: &[f32]) -> Vec<f32> {
        let mut buffer = vec![Complex { re: 0.0, im: 0.0 }; self.fft_size];
        for ((slot, &sample), &w) in buffer.iter_mut().zip(frame).zip(self.window.iter()) {
            slot.re = sample * w;
        }

        self.fft.process(&mut buffer);

        buffer[..=self.fft_size / 2]
            .iter()
            .map(|c| c.norm())
            .collect()
    }

    #[inline]
    fn compute_chromagram(&self, magnitude: &[f32]) -> [f32; SEMITONES] {
        let mut chroma = [0.0; SEMITONES];
        for (mag, class) in magnitude.iter().zip(&self.bin_classes) {
            if let Some(pc) = class {
                chroma[*pc] += mag;
            }
        }
        normalize_l1(&mut chroma);
        chroma
    }
}

/// Scale `chroma` to sum to one, or zero it when it carries no energy.
pub fn normalize_l1(chroma: &mut [f32; SEMITONES]) {
    let sum: f32 = chroma.iter().sum();
    if sum > SILENCE && sum.is_finite() {
        chroma.iter_mut().for_each(|c| *c /= sum);
    } else {
        *chroma = [0.0; SEMITONES];
    }
}

/// Periodic Hann window of length `len`, computed once per length and shared
/// for the lifetime of the process.
pub fn hann_window(len: usize) -> Arc<[f32]> {
    static CACHE: OnceLock<RwLock<HashMap<usize, Arc<[f32]>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    if let Some(existing) = cache
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&len)
    {
        return Arc::clone(existing);
    }

    let mut entries = cache.write().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(entries.entry(len).or_insert_with(|| make_hann_window(len)))
}

fn make_hann_window(len: usize) -> Arc<[f32]> {
    if len <= 1 {
        return Arc::from(vec![1.0; len]);
    }
    let m = len as f32;
    (0..len)
        .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f32 / m).cos())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freqs: &[f32], len: usize, rate: f32) -> Vec<f32> {
        (0..len)
            .map(|n| {
                freqs
                    .iter()
                    .map(|f| (2.0 * PI * f * n as f32 / rate).sin())
                    .sum::<f32>()
                    * 0.2
            })
            .collect()
    }

    #[test]
    fn window_is_cached_per_length() {
        let a = hann_window(1024);
        let b = hann_window(1024);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.len(), 1024);
        assert_eq!(a[0], 0.0);
        assert!((a[512] - 1.0).abs() < 1e-6);
        assert_eq!(hann_window(0).len(), 0);
    }

    #[test]
    fn chroma_sums_to_one() {
        let chroma = Chromagram::builder().build().unwrap();
        let frame = tone(&[261.63, 329.63, 392.0], 4096, 22_050.0);
        let out = chroma.analyze(&frame).unwrap();
        let sum: f32 = out.chroma.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
        let mut ranked: Vec<usize> = (0..SEMITONES).collect();
        ranked.sort_by(|&a, &b| out.chroma[b].total_cmp(&out.chroma[a]));
        let mut top = ranked[..3].to_vec();
        top.sort_unstable();
        assert_eq!(top, vec![0, 4, 7]);
    }

    #[test]
    fn loud_frames_keep_their_chroma() {
        let chroma = Chromagram::builder().build().unwrap();
        let frame: Vec<f32> = tone(&[261.63, 329.63, 392.0], 4096, 22_050.0)
            .into_iter()
            .map(|x| x * 1e30)
            .collect();
        let out = chroma.analyze(&frame).unwrap();
        assert!(out.magnitude.iter().all(|m| m.is_finite()));
        let sum: f32 = out.chroma.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
        let top = (0..SEMITONES).max_by(|&a, &b| out.chroma[a].total_cmp(&out.chroma[b]));
        assert!(matches!(top, Some(0 | 4 | 7)));
    }

    #[test]
    fn silence_gives_zero_chroma() {
        let chroma = Chromagram::builder().build().unwrap();
        let out = chroma.analyze(&[0.0; 4096]).unwrap();
        assert_eq!(out.chroma, [0.0; SEMITONES]);
    }

    #[test]
    fn short_frames_are_padded_and_long_frames_rejected() {
        let chroma = Chromagram::builder().window_size(3000).build().unwrap();
        assert_eq!(chroma.fft_size(), 4096);
        assert!(chroma.analyze(&[0.1; 100]).is_ok());
        assert!(matches!(
            chroma.analyze(&[0.0; 3001]),
            Err(ChromagramError::InvalidFrameSize { expected: 3000, got: 3001 })
        ));
    }

    #[test]
    fn invalid_band_is_rejected() {
        let res = Chromagram::builder().min_frequency(6000.0).build();
        assert!(matches!(res, Err(ChromagramError::Configuration(_))));
    }
}
