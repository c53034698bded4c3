//! Key estimation
//!
//! Two tiers. The bass tier builds a pitch-class histogram from the bass of
//! loud frames (with extra weight at rest points and near either end of the
//! piece) and, when its peak is clear enough, decides the mode from the
//! chroma weight of the minor versus major third, sixth and seventh above
//! that root. Otherwise the position-weighted mean chroma is correlated with
//! the 24 rotations of the Krumhansl–Kessler profiles.
//!
//! # Reference
//!
//! Krumhansl, C. L. (1990). *Cognitive Foundations of Musical Pitch*. Oxford
//! University Press.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::config::KeyThresholds;
use crate::features::FeatureSet;
use crate::theory::{key_relation, ChordKind, KeyRelation, Mode, NoteName, SEMITONES};

/// Krumhansl-Kessler major key profile.
const MAJOR_PROFILE: [f32; SEMITONES] = [
    6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88,
];

/// Krumhansl-Kessler minor key profile.
const MINOR_PROFILE: [f32; SEMITONES] = [
    6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17,
];

/// Minor third, minor sixth, minor seventh.
const MINOR_MARKERS: [usize; 3] = [3, 8, 10];
/// Major third, major sixth, major seventh.
const MAJOR_MARKERS: [usize; 3] = [4, 9, 11];

/// Global tonal centre of a piece.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Key {
    /// Tonic pitch class.
    pub root: NoteName,
    /// Major or minor.
    pub mode: Mode,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
}

impl Key {
    /// New key; the confidence is clamped to `[0, 1]` (NaN becomes 0).
    pub fn new(root: NoteName, mode: Mode, confidence: f32) -> Self {
        let confidence = if confidence.is_nan() { 0.0 } else { confidence.clamp(0.0, 1.0) };
        Key { root, mode, confidence }
    }

    /// Same root and mode, ignoring confidence.
    pub fn same_tonality(&self, other: &Key) -> bool {
        self.root == other.root && self.mode == other.mode
    }

    /// Relation of the triad (`root`, `kind`) to this key.
    pub fn relation(&self, root: NoteName, kind: ChordKind) -> KeyRelation {
        key_relation(self.root, self.mode, root, kind)
    }

    /// Quality of this key's tonic triad.
    pub fn tonic_kind(&self) -> ChordKind {
        ChordKind::of_mode(self.mode)
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.root, self.mode)
    }
}

/// Initial key guess from a feature set.
#[derive(Debug, Clone, Default)]
pub struct KeyEstimator {
    thresholds: KeyThresholds,
}

impl KeyEstimator {
    /// Estimator with the given thresholds.
    pub fn new(thresholds: KeyThresholds) -> Self {
        KeyEstimator { thresholds }
    }

    /// Estimate the key. Always well-formed; silent input gives C major with
    /// zero confidence.
    pub fn estimate(&self, features: &FeatureSet) -> Key {
        let (root, bass_confidence) = self.bass_root(features);
        let key = match root {
            Some(root) if bass_confidence >= self.thresholds.bass_confidence => {
                self.mode_for_root(features, root, bass_confidence)
            }
            _ => self.profile_key(features),
        };
        log::debug!(
            "Initial key {} (confidence {:.2}, bass confidence {:.2})",
            key,
            key.confidence,
            bass_confidence
        );
        key
    }

    /// Peak of the weighted bass histogram and its share of the total mass.
    fn bass_root(&self, features: &FeatureSet) -> (Option<NoteName>, f32) {
        let mut histogram = [0.0f32; SEMITONES];
        let frames = &features.frames;
        for (i, frame) in frames.iter().enumerate() {
            let Some(bass) = frame.bass else { continue };
            if frame.energy < features.energy.high {
                continue;
            }
            let mut weight = 1.0;
            if features.is_edge(i, self.thresholds.edge_seconds) {
                weight += self.thresholds.bass_edge_bonus;
            }
            let rest = frames
                .get(i + 1)
                .map_or(true, |next| next.energy < self.thresholds.rest_drop_ratio * frame.energy);
            if rest {
                weight += self.thresholds.rest_point_bonus;
            }
            histogram[bass.index()] += weight;
        }

        let total: f32 = histogram.iter().sum();
        if total <= 0.0 {
            return (None, 0.0);
        }
        let (peak, mass) = argmax(&histogram);
        (Some(NoteName::from_index(peak)), mass / total)
    }

    /// Mode from minor versus major interval strength above `root`.
    fn mode_for_root(&self, features: &FeatureSet, root: NoteName, bass_confidence: f32) -> Key {
        let (mut minor, mut major) = (0.0f32, 0.0f32);
        for (i, frame) in features.frames.iter().enumerate() {
            let w = if features.is_edge(i, self.thresholds.edge_seconds) {
                self.thresholds.mode_edge_weight
            } else {
                1.0
            };
            minor += w * MINOR_MARKERS.iter().map(|&s| frame.chroma[root.transpose(s).index()]).sum::<f32>();
            major += w * MAJOR_MARKERS.iter().map(|&s| frame.chroma[root.transpose(s).index()]).sum::<f32>();
        }
        let total = minor + major;
        let separation = if total > 0.0 { (minor - major).abs() / total } else { 0.0 };
        let mode = if minor > major { Mode::Minor } else { Mode::Major };
        Key::new(root, mode, bass_confidence * (0.5 + 0.5 * separation))
    }

    /// Krumhansl–Schmuckler correlation against the 24 rotated profiles.
    fn profile_key(&self, features: &FeatureSet) -> Key {
        let mut aggregate = [0.0f32; SEMITONES];
        for (i, frame) in features.frames.iter().enumerate() {
            let w = if features.is_edge(i, self.thresholds.edge_seconds) {
                self.thresholds.edge_weight
            } else {
                1.0
            };
            for (acc, c) in aggregate.iter_mut().zip(frame.chroma) {
                *acc += w * c;
            }
        }

        let mut best = Key::new(NoteName::C, Mode::Major, 0.0);
        let mut best_corr = f32::NEG_INFINITY;
        for root in NoteName::ALL {
            let rotated: [f32; SEMITONES] =
                std::array::from_fn(|i| aggregate[root.transpose(i).index()]);
            for (mode, profile) in [(Mode::Major, &MAJOR_PROFILE), (Mode::Minor, &MINOR_PROFILE)] {
                let corr = pearson(&rotated, profile);
                if corr > best_corr {
                    best_corr = corr;
                    best = Key::new(root, mode, corr);
                }
            }
        }
        best
    }
}

fn argmax(values: &[f32; SEMITONES]) -> (usize, f32) {
    let mut best = (0, values[0]);
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > best.1 {
            best = (i, v);
        }
    }
    best
}

/// Pearson correlation; zero when either input is constant.
fn pearson(x: &[f32; SEMITONES], y: &[f32; SEMITONES]) -> f32 {
    let n = SEMITONES as f32;
    let mx = x.iter().sum::<f32>() / n;
    let my = y.iter().sum::<f32>() / n;
    let (mut cov, mut vx, mut vy) = (0.0f32, 0.0f32, 0.0f32);
    for (a, b) in x.iter().zip(y) {
        let (dx, dy) = (a - mx, b - my);
        cov += dx * dy;
        vx += dx * dx;
        vy += dy * dy;
    }
    let denom = (vx * vy).sqrt();
    if denom > 1e-12 {
        cov / denom
    } else {
        0.0
    }
}
