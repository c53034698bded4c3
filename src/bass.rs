//! Bass pitch-class tracking
//!
//! The low band of a frame's magnitude spectrum is resynthesised into a short
//! time-domain signal by direct cosine summation; its normalised
//! autocorrelation over the lags of the bass band gives the fundamental.

use crate::theory::{frequency_to_note, NoteName};

/// Lag candidates within this fraction of the best correlation are
/// preferred when shorter, so the fundamental wins over its sub-octaves.
const OCTAVE_TOLERANCE: f32 = 0.9;

/// Resynthesis length in samples.
const SYNTH_LEN: usize = 2048;

/// Bass fundamental estimator for one spectrum layout.
#[derive(Debug, Clone)]
pub struct BassTracker {
    sample_rate: f32,
    fft_size: usize,
    bass_bins: (usize, usize),
    band_bins: (usize, usize),
    min_lag: usize,
    max_lag: usize,
    min_frequency: f32,
    max_frequency: f32,
    min_correlation: f32,
    min_share: f32,
    cos_table: Vec<f32>,
}

impl BassTracker {
    /// Tracker for spectra of `fft_size` bins at `sample_rate`.
    ///
    /// `band_max` is the upper edge of the band the bass share is measured
    /// against.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sample_rate: f32,
        fft_size: usize,
        min_frequency: f32,
        max_frequency: f32,
        band_max: f32,
        min_correlation: f32,
        min_share: f32,
    ) -> Self {
        let bin_width = sample_rate / fft_size.max(1) as f32;
        let bin = |hz: f32| ((hz / bin_width).round().max(1.0) as usize).min(fft_size / 2);
        let min_lag = (sample_rate / max_frequency).floor().max(2.0) as usize;
        let max_lag = ((sample_rate / min_frequency).ceil() as usize).min(SYNTH_LEN / 2);
        let cos_table = (0..fft_size)
            .map(|n| (2.0 * std::f32::consts::PI * n as f32 / fft_size as f32).cos())
            .collect();

        BassTracker {
            sample_rate,
            fft_size,
            bass_bins: (bin(min_frequency), bin(max_frequency)),
            band_bins: (bin(min_frequency), bin(band_max)),
            min_lag,
            max_lag,
            min_frequency,
            max_frequency,
            min_correlation,
            min_share,
            cos_table,
        }
    }

    /// Estimate the bass pitch class of one frame from its magnitude
    /// spectrum. `None` when the bass band is too weak or aperiodic.
    pub fn estimate(&self, magnitude: &[f32]) -> Option<NoteName> {
        let (lo, hi) = self.bass_bins;
        if magnitude.len() <= hi || lo > hi || self.min_lag >= self.max_lag {
            return None;
        }

        let bass: f32 = magnitude[lo..=hi].iter().sum();
        let band_hi = self.band_bins.1.min(magnitude.len() - 1);
        let band: f32 = magnitude[self.band_bins.0..=band_hi].iter().sum();
        if band.is_nan() || band <= 0.0 || bass / band < self.min_share {
            return None;
        }

        let signal = self.synthesize(&magnitude[lo..=hi], lo);
        let lag = self.best_lag(&signal)?;
        let freq = self.sample_rate / lag;
        if freq < self.min_frequency || freq > self.max_frequency {
            return None;
        }
        frequency_to_note(freq)
    }

    fn synthesize(&self, bins: &[f32], first_bin: usize) -> Vec<f32> {
        let mut out = vec![0.0; SYNTH_LEN];
        for (offset, &mag) in bins.iter().enumerate() {
            if mag <= 0.0 {
                continue;
            }
            let k = first_bin + offset;
            for (n, sample) in out.iter_mut().enumerate() {
                *sample += mag * self.cos_table[(k * n) % self.fft_size];
            }
        }
        out
    }

    /// Fractional lag of the fundamental, or `None` below the quality floor.
    fn best_lag(&self, signal: &[f32]) -> Option<f32> {
        let corr: Vec<f32> = (self.min_lag..=self.max_lag)
            .map(|lag| normalized_autocorrelation(signal, lag))
            .collect();
        let peak = corr.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if peak.is_nan() || peak < self.min_correlation {
            return None;
        }

        // first interior local maximum close enough to the global peak
        let idx = (1..corr.len().saturating_sub(1))
            .find(|&i| {
                corr[i] >= OCTAVE_TOLERANCE * peak && corr[i] >= corr[i - 1] && corr[i] >= corr[i + 1]
            })
            .or_else(|| corr.iter().position(|&c| c == peak))?;

        let lag = (self.min_lag + idx) as f32;
        if idx == 0 || idx + 1 >= corr.len() {
            return Some(lag);
        }
        let (a, b, c) = (corr[idx - 1], corr[idx], corr[idx + 1]);
        let denom = a - 2.0 * b + c;
        let shift = if denom.abs() > 1e-9 { 0.5 * (a - c) / denom } else { 0.0 };
        Some(lag + shift.clamp(-0.5, 0.5))
    }
}

fn normalized_autocorrelation(signal: &[f32], lag: usize) -> f32 {
    if lag >= signal.len() {
        return 0.0;
    }
    let head = &signal[..signal.len() - lag];
    let tail = &signal[lag..];
    let (mut xy, mut xx, mut yy) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in head.iter().zip(tail) {
        let (x, y) = (f64::from(x), f64::from(y));
        xy += x * y;
        xx += x * x;
        yy += y * y;
    }
    let denom = xx.sqrt() * yy.sqrt();
    if denom > 1e-12 {
        (xy / denom) as f32
    } else {
        0.0
    }
}
