//! Tonic estimation from a decoded chord sequence.
//!
//! Independent of the key's diatonic bias: each root is voted for by its
//! share of the total duration, its share of the opening and closing
//! windows, and the cadences that resolve onto it.

use serde::{Deserialize, Serialize};

use crate::config::RefinementWeights;
use crate::key::Key;
use crate::theory::{ChordKind, Mode, NoteName, SEMITONES};
use crate::timeline::Timeline;

/// Weight of a plagal (IV→I) resolution relative to an authentic one.
const PLAGAL_SHARE: f32 = 0.5;

/// Home chord of a piece as judged from its chords.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct TonicEstimate {
    /// Tonic root.
    pub root: NoteName,
    /// Mode suggested by the qualities played on that root.
    pub mode: Mode,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
}

impl TonicEstimate {
    /// Confidence as a percentage.
    pub fn percent(&self) -> f32 {
        self.confidence * 100.0
    }
}

/// Vote for the tonic of `timeline`. An empty timeline falls back to the
/// key's root with zero confidence.
pub fn estimate_tonic(timeline: &Timeline, key: &Key, weights: &RefinementWeights) -> TonicEstimate {
    let fallback = TonicEstimate {
        root: key.root,
        mode: key.mode,
        confidence: 0.0,
    };
    let duration = timeline.duration();
    if timeline.is_empty() || duration <= 0.0 {
        return fallback;
    }

    let share = normalized(timeline.root_durations());
    let window = weights.tonic_window_seconds.clamp(0.0, duration);
    let opening = normalized(timeline.root_durations_within(0.0, window));
    let closing = normalized(timeline.root_durations_within(duration - window, duration));

    let mut resolutions = [0.0f32; SEMITONES];
    for pair in timeline.events().windows(2) {
        let (from, to) = (pair[0].chord.root, pair[1].chord.root);
        match from.interval_to(to) {
            5 => resolutions[to.index()] += 1.0,
            7 => resolutions[to.index()] += PLAGAL_SHARE,
            _ => {}
        }
    }
    let has_cadences = resolutions.iter().any(|&r| r > 0.0);
    let cadence = normalized(resolutions);

    let scores: [f32; SEMITONES] = std::array::from_fn(|r| {
        weights.tonic_duration * share[r]
            + weights.tonic_opening * opening[r]
            + weights.tonic_closing * closing[r]
            + weights.tonic_cadence * cadence[r]
    });

    // ties go to the key's root, then to the lowest pitch class
    let mut best = key.root.index();
    for (r, &score) in scores.iter().enumerate() {
        if score > scores[best] {
            best = r;
        }
    }

    let mut available = weights.tonic_duration + weights.tonic_opening + weights.tonic_closing;
    if has_cadences {
        available += weights.tonic_cadence;
    }
    let confidence = if available > 0.0 {
        (scores[best] / available).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let root = NoteName::from_index(best);
    let (mut major, mut minor) = (0.0f32, 0.0f32);
    for (i, e) in timeline.iter().enumerate() {
        if e.chord.root == root {
            match e.chord.quality {
                ChordKind::Major => major += timeline.event_duration(i),
                ChordKind::Minor => minor += timeline.event_duration(i),
            }
        }
    }
    let mode = if minor > major { Mode::Minor } else { Mode::Major };

    log::debug!("Tonic {} {} (confidence {:.2})", root, mode, confidence);
    TonicEstimate { root, mode, confidence }
}

fn normalized(mut values: [f32; SEMITONES]) -> [f32; SEMITONES] {
    let total: f32 = values.iter().sum();
    if total > 0.0 {
        values.iter_mut().for_each(|v| *v /= total);
    }
    values
}
