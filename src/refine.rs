//! Bounded key revalidation and re-decoding.
//!
//! After the first decode the timeline is scored against all 24 keys. A
//! clearly better key triggers another decode under that key, and a
//! confident tonic that disagrees with the key may trigger one more. Every
//! change spends from a fixed budget so the loop always terminates.

use serde::{Deserialize, Serialize};

use crate::cancel::{CancelToken, Cancelled};
use crate::chord_detector::ChordDetector;
use crate::config::{DetectOptions, RefinementWeights};
use crate::features::FeatureSet;
use crate::key::Key;
use crate::theory::{KeyRelation, Mode, NoteName};
use crate::timeline::Timeline;
use crate::tonic::{estimate_tonic, TonicEstimate};

/// Number of key changes still allowed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChangeBudget {
    limit: usize,
    spent: usize,
}

impl ChangeBudget {
    /// A budget allowing `limit` changes.
    pub fn new(limit: usize) -> Self {
        ChangeBudget { limit, spent: 0 }
    }

    /// Spend one change if any remain.
    pub fn try_spend(&mut self) -> bool {
        if self.spent < self.limit {
            self.spent += 1;
            true
        } else {
            false
        }
    }

    /// Changes spent so far.
    pub fn spent(&self) -> usize {
        self.spent
    }

    /// Changes left.
    pub fn remaining(&self) -> usize {
        self.limit - self.spent
    }
}

/// A candidate key with its fit to a timeline.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct KeyScore {
    /// Candidate key, with confidence derived from the score.
    pub key: Key,
    /// Raw score.
    pub score: f32,
}

/// Largest score [`score_key`] can give with these weights.
pub fn max_key_score(weights: &RefinementWeights) -> f32 {
    1.0 + weights.authentic_cadence
        + weights.plagal_cadence
        + weights.two_five_one
        + weights.first_chord
        + weights.last_chord
        + weights.most_frequent
}

/// How well `timeline` fits the key (`root`, `mode`): diatonic fraction,
/// cadences into the tonic, tonic at either end, most-held root.
pub fn score_key(timeline: &Timeline, root: NoteName, mode: Mode, weights: &RefinementWeights) -> f32 {
    let events = timeline.events();
    if events.is_empty() {
        return 0.0;
    }
    let key = Key::new(root, mode, 0.0);
    let tonic_kind = key.tonic_kind();
    let is_tonic = |i: usize| events[i].chord.root == root && events[i].chord.quality == tonic_kind;
    let root_at = |i: usize, degree: usize| events[i].chord.root == root.transpose(degree);

    let diatonic = events
        .iter()
        .filter(|e| key.relation(e.chord.root, e.chord.quality) == KeyRelation::Diatonic)
        .count() as f32
        / events.len() as f32;

    let transitions = (events.len() - 1).max(1) as f32;
    let (mut authentic, mut plagal, mut two_five_one) = (0usize, 0usize, 0usize);
    for i in 1..events.len() {
        if !is_tonic(i) {
            continue;
        }
        if root_at(i - 1, 7) {
            authentic += 1;
            if i >= 2 && root_at(i - 2, 2) {
                two_five_one += 1;
            }
        } else if root_at(i - 1, 5) {
            plagal += 1;
        }
    }

    let held = timeline.root_durations();
    let mut most_held = 0;
    for (r, &d) in held.iter().enumerate() {
        if d > held[most_held] {
            most_held = r;
        }
    }

    let mut score = diatonic
        + weights.authentic_cadence * authentic as f32 / transitions
        + weights.plagal_cadence * plagal as f32 / transitions
        + weights.two_five_one * two_five_one as f32 / transitions;
    if is_tonic(0) {
        score += weights.first_chord;
    }
    if is_tonic(events.len() - 1) {
        score += weights.last_chord;
    }
    if most_held == root.index() {
        score += weights.most_frequent;
    }
    score
}

/// Best of the 24 keys for `timeline`; `None` when it has no events. Ties
/// keep the earliest candidate, C major first.
pub fn rescore_key(timeline: &Timeline, weights: &RefinementWeights) -> Option<KeyScore> {
    if timeline.is_empty() {
        return None;
    }
    let max = max_key_score(weights);
    let mut best: Option<KeyScore> = None;
    for root in NoteName::ALL {
        for mode in [Mode::Major, Mode::Minor] {
            let score = score_key(timeline, root, mode, weights);
            if best.map_or(true, |b| score > b.score) {
                best = Some(KeyScore {
                    key: Key::new(root, mode, score / max),
                    score,
                });
            }
        }
    }
    best
}

/// Steps of the refinement loop, recorded in the order they happen.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RefinementState {
    /// First decode under the initial key.
    Decoded,
    /// Timeline scored against all keys.
    KeyRevalidated,
    /// Decoded again under a revised key.
    Redecoded,
    /// Tonic estimated from the current timeline.
    TonicEstimated,
    /// Loop finished.
    Done,
}

/// Final state of the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct RefinementOutcome {
    /// Key after revalidation. A tonic override takes both the tonic's root
    /// and the mode of the chords played on it.
    pub key: Key,
    /// Tonic of the final timeline.
    pub tonic: TonicEstimate,
    /// Final timeline.
    pub timeline: Timeline,
    /// Key changes made.
    pub key_changes: usize,
    /// Decodes run, the first one included.
    pub decode_passes: usize,
    /// States visited.
    pub trail: Vec<RefinementState>,
}

/// Decode, revalidate the key, and re-decode within a change budget.
pub struct RefinementLoop<'a> {
    decoder: &'a ChordDetector,
    features: &'a FeatureSet,
    weights: &'a RefinementWeights,
    tonic_rerun_threshold: f32,
    max_key_changes: usize,
    cancel: &'a CancelToken,
    observer: Option<&'a dyn Fn(RefinementState)>,
}

impl<'a> RefinementLoop<'a> {
    /// Loop over `features` using `decoder`, with the tonic threshold and
    /// change budget of [`DetectOptions::default`].
    pub fn new(
        decoder: &'a ChordDetector,
        features: &'a FeatureSet,
        weights: &'a RefinementWeights,
        cancel: &'a CancelToken,
    ) -> Self {
        let defaults = DetectOptions::default();
        RefinementLoop {
            decoder,
            features,
            weights,
            tonic_rerun_threshold: defaults.tonic_rerun_threshold,
            max_key_changes: defaults.max_key_changes,
            cancel,
            observer: None,
        }
    }

    /// Minimum tonic confidence, in percent, for a tonic-driven re-decode.
    pub fn tonic_rerun_threshold(mut self, percent: f32) -> Self {
        self.tonic_rerun_threshold = percent;
        self
    }

    /// Maximum number of key changes.
    pub fn max_key_changes(mut self, limit: usize) -> Self {
        self.max_key_changes = limit;
        self
    }

    /// Called on every state the loop enters.
    pub fn observer(mut self, observer: &'a dyn Fn(RefinementState)) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run the loop from `initial`.
    ///
    /// A tonic at or above the re-run threshold that disagrees with the key
    /// replaces the key's root and mode with its own, then decodes once more.
    pub fn run(&self, initial: Key) -> Result<RefinementOutcome, Cancelled> {
        let mut budget = ChangeBudget::new(self.max_key_changes);
        let mut trail = Vec::new();
        let mut key = initial;

        let mut timeline = self.decoder.decode(self.features, &key, self.cancel)?;
        let mut decode_passes = 1;
        self.enter(&mut trail, RefinementState::Decoded);

        loop {
            self.cancel.check()?;
            let current = score_key(&timeline, key.root, key.mode, self.weights);
            let best = rescore_key(&timeline, self.weights);
            self.enter(&mut trail, RefinementState::KeyRevalidated);

            let Some(best) = best else { break };
            log::trace!(
                "Pass {}: {} scores {:.3}, best {} scores {:.3}",
                decode_passes,
                key,
                current,
                best.key,
                best.score
            );
            if best.key.same_tonality(&key) {
                // agreement with the timeline can only raise confidence
                key = Key::new(key.root, key.mode, key.confidence.max(best.key.confidence));
                break;
            }
            if best.score - current <= self.weights.key_change_margin {
                break;
            }
            if !budget.try_spend() {
                log::debug!("Key change budget exhausted, keeping {}", key);
                break;
            }
            log::debug!(
                "Key revised {} -> {} (score {:.3} vs {:.3})",
                key,
                best.key,
                best.score,
                current
            );
            key = best.key;
            timeline = self.decoder.decode(self.features, &key, self.cancel)?;
            decode_passes += 1;
            self.enter(&mut trail, RefinementState::Redecoded);
        }

        let mut tonic = estimate_tonic(&timeline, &key, self.weights);
        self.enter(&mut trail, RefinementState::TonicEstimated);

        if tonic.root != key.root
            && tonic.percent() >= self.tonic_rerun_threshold
            && budget.try_spend()
        {
            log::debug!(
                "Tonic {} at {:.0}% overrides key {}",
                tonic.root,
                tonic.percent(),
                key
            );
            key = Key::new(tonic.root, tonic.mode, tonic.confidence);
            timeline = self.decoder.decode(self.features, &key, self.cancel)?;
            decode_passes += 1;
            self.enter(&mut trail, RefinementState::Redecoded);
            tonic = estimate_tonic(&timeline, &key, self.weights);
            self.enter(&mut trail, RefinementState::TonicEstimated);
        }

        self.enter(&mut trail, RefinementState::Done);
        Ok(RefinementOutcome {
            key,
            tonic,
            timeline,
            key_changes: budget.spent(),
            decode_passes,
            trail,
        })
    }

    fn enter(&self, trail: &mut Vec<RefinementState>, state: RefinementState) {
        trail.push(state);
        if let Some(observer) = self.observer {
            observer(state);
        }
    }
}
