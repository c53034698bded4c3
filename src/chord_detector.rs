//! Chord Detector
//!
//! Decodes a chord sequence from a feature set with a beam-limited Viterbi
//! search over the 24 major and minor triads.
//!
//! Emission: cosine similarity between the frame chroma and the triad's
//! binary profile, rejected below a floor, plus key, bass and energy terms.
//! Transition: a base cost plus circle-of-fifths and chromatic distance,
//! penalties for quality changes and out-of-key endpoints, and discounts for
//! falling-fifth and step root motion.

use crate::cancel::{CancelToken, Cancelled};
use crate::config::{BeamMode, DecoderThresholds, DetectOptions};
use crate::features::{FeatureSet, FrameFeatures};
use crate::key::Key;
use crate::theory::{chromatic_distance, fifths_distance, ChordKind, KeyRelation, NoteName, SEMITONES};
use crate::timeline::{Chord, ChordEvent, ChordTags, FinalizeParams, Timeline};

/// Number of chord qualities
const NUM_CHORD_KINDS: usize = 2;

/// Total number of chords (root × quality)
pub const NUM_CHORDS: usize = SEMITONES * NUM_CHORD_KINDS;

/// Supported chord qualities, in state-index order
const CHORD_KINDS: [ChordKind; NUM_CHORD_KINDS] = [ChordKind::Major, ChordKind::Minor];

/// Largest fifths / chromatic distance, used to normalise both to 0..1.
const MAX_DISTANCE: f32 = (SEMITONES / 2) as f32;

/// Precomputed chord profile + inverse normalizer
#[derive(Copy, Clone)]
struct PrecalcProfile {
    weights: [f32; SEMITONES],
    inv_norm: f32,
}

/// One decoder state: a triad tagged against the current key.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChordState {
    /// Root pitch class.
    pub root: NoteName,
    /// Triad quality.
    pub quality: ChordKind,
    /// Relation to the key the states were built for.
    pub relation: KeyRelation,
}

impl ChordState {
    fn chord(&self) -> Chord {
        Chord {
            root: self.root,
            quality: self.quality,
            tags: ChordTags {
                borrowed: self.relation == KeyRelation::Borrowed,
                ..ChordTags::default()
            },
        }
    }
}

/// Builder for `ChordDetector`
pub struct ChordDetectorBuilder {
    bass_multiplier: f32,
    beam: BeamMode,
    thresholds: DecoderThresholds,
}

impl ChordDetectorBuilder {
    /// Create a new builder with the default bass multiplier, beam policy
    /// and thresholds of [`DetectOptions`].
    pub fn new() -> Self {
        let defaults = DetectOptions::default();
        ChordDetectorBuilder {
            bass_multiplier: defaults.bass_multiplier,
            beam: defaults.beam,
            thresholds: defaults.decoder,
        }
    }

    /// Scale the emission bonus for bass/root agreement.
    pub fn bass_multiplier(mut self, value: f32) -> Self {
        self.bass_multiplier = value;
        self
    }

    /// Select the beam width policy.
    pub fn beam(mut self, beam: BeamMode) -> Self {
        self.beam = beam;
        self
    }

    /// Replace the scoring and finalisation thresholds.
    pub fn thresholds(mut self, thresholds: DecoderThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Build the `ChordDetector`
    pub fn build(self) -> ChordDetector {
        let mut profiles = [PrecalcProfile {
            weights: [0.0; SEMITONES],
            inv_norm: 0.0,
        }; NUM_CHORDS];

        for (kind_idx, kind) in CHORD_KINDS.iter().enumerate() {
            let intervals = kind.intervals();
            let inv = 1.0 / (intervals.len() as f32).sqrt();
            for root in 0..SEMITONES {
                let p = &mut profiles[kind_idx * SEMITONES + root];
                p.inv_norm = inv;
                for off in intervals {
                    p.weights[(root + off) % SEMITONES] = 1.0;
                }
            }
        }

        ChordDetector {
            bass_multiplier: self.bass_multiplier,
            beam: self.beam,
            thresholds: self.thresholds,
            profiles,
        }
    }
}

impl Default for ChordDetectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Chord sequence decoder
pub struct ChordDetector {
    bass_multiplier: f32,
    beam: BeamMode,
    thresholds: DecoderThresholds,
    profiles: [PrecalcProfile; NUM_CHORDS],
}

impl ChordDetector {
    /// Return a builder to customize the decoder
    pub fn builder() -> ChordDetectorBuilder {
        ChordDetectorBuilder::new()
    }

    /// Create a decoder with default settings
    pub fn new() -> Self {
        ChordDetectorBuilder::new().build()
    }

    /// Beam width used when decoding against `key`.
    pub fn beam_width(&self, key: &Key) -> usize {
        let t = &self.thresholds;
        let width = match self.beam {
            BeamMode::Light => t.light_beam,
            BeamMode::Full => t.full_beam,
            BeamMode::Auto if key.confidence >= t.light_beam_confidence => t.light_beam,
            BeamMode::Auto => t.full_beam,
        };
        width.clamp(1, NUM_CHORDS)
    }

    /// The 24 triads tagged against `key`, in state-index order.
    pub fn states(&self, key: &Key) -> [ChordState; NUM_CHORDS] {
        std::array::from_fn(|idx| {
            let root = NoteName::from_index(idx % SEMITONES);
            let quality = CHORD_KINDS[idx / SEMITONES];
            ChordState {
                root,
                quality,
                relation: key.relation(root, quality),
            }
        })
    }

    /// Cosine similarity between `chroma` and the profile of state `idx`.
    pub fn similarity(&self, chroma: &[f32; SEMITONES], idx: usize) -> f32 {
        let norm = chroma.iter().map(|c| c * c).sum::<f32>().sqrt();
        self.similarity_with_norm(chroma, norm, idx)
    }

    fn similarity_with_norm(&self, chroma: &[f32; SEMITONES], norm: f32, idx: usize) -> f32 {
        if norm <= 0.0 {
            return 0.0;
        }
        let p = &self.profiles[idx];
        let dot: f32 = chroma.iter().zip(&p.weights).map(|(c, w)| c * w).sum();
        dot * p.inv_norm / norm
    }

    /// Emission score of `state` (index `idx`) for one frame, with the raw
    /// similarity. `None` when the chord is implausible for the frame.
    fn emission(
        &self,
        frame: &FrameFeatures,
        norm: f32,
        idx: usize,
        state: &ChordState,
        low_energy: f32,
    ) -> Option<(f32, f32)> {
        let t = &self.thresholds;
        if t.restrict_to_key && state.relation == KeyRelation::Chromatic {
            return None;
        }
        let sim = self.similarity_with_norm(&frame.chroma, norm, idx);
        if sim.is_nan() || sim < t.similarity_floor {
            return None;
        }
        let mut score = sim;
        score += match state.relation {
            KeyRelation::Diatonic => t.diatonic_bonus,
            KeyRelation::Borrowed => t.borrowed_bonus,
            KeyRelation::Chromatic => 0.0,
        };
        if frame.bass == Some(state.root) {
            score += t.bass_bonus * self.bass_multiplier;
        }
        if frame.energy < low_energy {
            score -= t.low_energy_penalty;
        }
        Some((score, sim))
    }

    /// Cost of moving from `a` to `b`; zero when they are the same chord.
    pub fn transition_cost(&self, a: &ChordState, b: &ChordState) -> f32 {
        if a.root == b.root && a.quality == b.quality {
            return 0.0;
        }
        let t = &self.thresholds;
        let mut cost = t.transition_base
            + t.fifths_weight * fifths_distance(a.root, b.root) as f32 / MAX_DISTANCE
            + t.chromatic_weight * chromatic_distance(a.root, b.root) as f32 / MAX_DISTANCE;
        if a.quality != b.quality {
            cost += t.quality_change_penalty;
        }
        for relation in [a.relation, b.relation] {
            cost += match relation {
                KeyRelation::Diatonic => 0.0,
                KeyRelation::Borrowed => t.borrowed_penalty,
                KeyRelation::Chromatic => t.chromatic_penalty,
            };
        }
        match a.root.interval_to(b.root) {
            5 => cost -= t.dominant_motion_bonus,
            2 | 10 => cost -= t.step_motion_bonus,
            _ => {}
        }
        cost.max(t.min_transition_cost)
    }

    /// Decode and finalise the chord timeline of `features` under `key`.
    pub fn decode(
        &self,
        features: &FeatureSet,
        key: &Key,
        cancel: &CancelToken,
    ) -> Result<Timeline, Cancelled> {
        let states = self.states(key);
        let beam = self.beam_width(key);
        let path = self.viterbi(features, &states, beam, cancel)?;

        let mut events: Vec<ChordEvent> = Vec::new();
        let mut sim_sum = 0.0f32;
        let mut sim_count = 0usize;
        let mut current: Option<usize> = None;
        for (t, step) in path.iter().enumerate() {
            let Some((state, sim)) = *step else { continue };
            if current != Some(state) {
                close_event(&mut events, sim_sum, sim_count);
                events.push(ChordEvent {
                    start: features.frame_time(t),
                    chord: states[state].chord(),
                    frame: t,
                    confidence: 0.0,
                });
                current = Some(state);
                sim_sum = 0.0;
                sim_count = 0;
            }
            if let Some(sim) = sim {
                sim_sum += sim;
                sim_count += 1;
            }
        }
        close_event(&mut events, sim_sum, sim_count);

        let raw = events.len();
        let t = &self.thresholds;
        let timeline = Timeline::finalize(
            events,
            &FinalizeParams {
                duration: features.duration,
                bpm: features.bpm,
                min_segment: t.min_segment_seconds,
                weak_similarity: t.weak_similarity,
                snap_tolerance: t.snap_tolerance_seconds,
            },
        );
        log::debug!(
            "Decoded {} segments under {} (beam {}), {} after finalisation",
            raw,
            key,
            beam,
            timeline.len()
        );
        Ok(timeline)
    }

    /// Best state per frame with its similarity (`None` similarity on
    /// carried-forward frames). Frames before the first plausible chord are
    /// `None`.
    fn viterbi(
        &self,
        features: &FeatureSet,
        states: &[ChordState; NUM_CHORDS],
        beam: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<Option<(usize, Option<f32>)>>, Cancelled> {
        let n = features.len();
        let identity: [u8; NUM_CHORDS] = std::array::from_fn(|i| i as u8);
        let transitions: Vec<[f32; NUM_CHORDS]> = states
            .iter()
            .map(|a| std::array::from_fn(|b| self.transition_cost(a, &states[b])))
            .collect();

        let mut delta = [f32::NEG_INFINITY; NUM_CHORDS];
        let mut backptr: Vec<[u8; NUM_CHORDS]> = Vec::with_capacity(n);
        let mut sims: Vec<Option<[f32; NUM_CHORDS]>> = Vec::with_capacity(n);
        let mut started: Option<usize> = None;

        for (t, frame) in features.frames.iter().enumerate() {
            cancel.check()?;
            let norm = frame.chroma.iter().map(|c| c * c).sum::<f32>().sqrt();
            let emissions: [Option<(f32, f32)>; NUM_CHORDS] = std::array::from_fn(|s| {
                self.emission(frame, norm, s, &states[s], features.energy.low)
            });

            if emissions.iter().all(Option::is_none) {
                // nothing plausible: every state carries forward unchanged
                backptr.push(identity);
                sims.push(None);
                continue;
            }
            sims.push(Some(emissions.map(|e| e.map_or(0.0, |(_, sim)| sim))));

            if started.is_none() {
                started = Some(t);
                delta = emissions.map(|e| e.map_or(f32::NEG_INFINITY, |(score, _)| score));
                backptr.push(identity);
                normalize(&mut delta);
                continue;
            }

            let sources = top_k(&delta, beam);
            let mut next = [f32::NEG_INFINITY; NUM_CHORDS];
            let mut back = identity;
            for (s, emission) in emissions.iter().enumerate() {
                let Some((score, _)) = emission else { continue };
                let mut best = f32::NEG_INFINITY;
                let mut arg = s;
                for &p in &sources {
                    let v = delta[p] - transitions[p][s];
                    if v > best {
                        best = v;
                        arg = p;
                    }
                }
                next[s] = best + score;
                back[s] = arg as u8;
            }
            delta = next;
            normalize(&mut delta);
            backptr.push(back);
        }

        let mut path = vec![None; n];
        let Some(start) = started else {
            return Ok(path);
        };
        let Some(&last) = top_k(&delta, 1).first() else {
            return Ok(path);
        };

        let mut state = last;
        for t in (start..n).rev() {
            path[t] = Some((state, sims[t].map(|s| s[state])));
            state = backptr[t][state] as usize;
        }
        Ok(path)
    }
}

impl Default for ChordDetector {
    fn default() -> Self {
        ChordDetector::new()
    }
}

fn close_event(events: &mut [ChordEvent], sum: f32, count: usize) {
    if let Some(last) = events.last_mut() {
        last.confidence = if count > 0 { sum / count as f32 } else { 0.0 };
    }
}

/// Indices of the `k` highest finite scores, best first, ties by index.
fn top_k(scores: &[f32; NUM_CHORDS], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..NUM_CHORDS).filter(|&i| scores[i].is_finite()).collect();
    idx.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    idx.truncate(k);
    idx
}

fn normalize(delta: &mut [f32; NUM_CHORDS]) {
    let max = delta.iter().copied().filter(|d| d.is_finite()).fold(f32::NEG_INFINITY, f32::max);
    if max.is_finite() {
        delta.iter_mut().for_each(|d| *d -= max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::EnergyStats;
    use crate::theory::Mode;

    fn triad(root: NoteName, kind: ChordKind) -> [f32; SEMITONES] {
        let mut chroma = [0.0; SEMITONES];
        for s in kind.intervals() {
            chroma[root.transpose(s).index()] = 1.0 / 3.0;
        }
        chroma
    }

    fn features(chords: &[(NoteName, ChordKind, usize)]) -> FeatureSet {
        let mut frames = Vec::new();
        for &(root, kind, count) in chords {
            for _ in 0..count {
                frames.push(FrameFeatures { chroma: triad(root, kind), bass: Some(root), energy: 0.2 });
            }
        }
        FeatureSet {
            duration: frames.len() as f32 * 0.1,
            frames,
            hop_seconds: 0.1,
            sample_rate: 22_050,
            energy: EnergyStats { low: 0.1, median: 0.2, high: 0.2 },
            bpm: 120.0,
        }
    }

    fn c_major() -> Key {
        Key::new(NoteName::C, Mode::Major, 0.8)
    }

    #[test]
    fn builder_starts_from_option_defaults() {
        let builder = ChordDetectorBuilder::new();
        let defaults = DetectOptions::default();
        assert_eq!(builder.bass_multiplier, defaults.bass_multiplier);
        assert_eq!(builder.beam, defaults.beam);
        assert_eq!(builder.thresholds, defaults.decoder);
    }

    #[test]
    fn profiles_match_triads() {
        let detector = ChordDetector::new();
        let c = triad(NoteName::C, ChordKind::Major);
        assert!((detector.similarity(&c, 0) - 1.0).abs() < 1e-5);
        assert!((detector.similarity(&c, SEMITONES + 9) - 2.0 / 3.0).abs() < 1e-5);
        assert_eq!(detector.similarity(&[0.0; SEMITONES], 0), 0.0);
    }

    #[test]
    fn decodes_progression() {
        let feats = features(&[
            (NoteName::C, ChordKind::Major, 20),
            (NoteName::A, ChordKind::Minor, 20),
            (NoteName::F, ChordKind::Major, 20),
            (NoteName::G, ChordKind::Major, 20),
        ]);
        let timeline = ChordDetector::new().decode(&feats, &c_major(), &CancelToken::new()).unwrap();
        assert_eq!(timeline.labels(), vec!["C", "Am", "F", "G"]);
        let starts: Vec<f32> = timeline.iter().map(|e| e.start).collect();
        assert_eq!(starts, vec![0.0, 2.0, 4.0, 6.0]);
        assert!(timeline.check_invariants().is_ok());
    }

    #[test]
    fn decoding_is_deterministic() {
        let feats = features(&[
            (NoteName::D, ChordKind::Minor, 7),
            (NoteName::G, ChordKind::Major, 9),
            (NoteName::C, ChordKind::Major, 14),
        ]);
        let detector = ChordDetector::new();
        let a = detector.decode(&feats, &c_major(), &CancelToken::new()).unwrap();
        let b = detector.decode(&feats, &c_major(), &CancelToken::new()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejected_frames_carry_the_previous_chord() {
        let mut feats = features(&[(NoteName::G, ChordKind::Major, 30)]);
        for frame in &mut feats.frames[10..20] {
            frame.chroma = [0.0; SEMITONES];
            frame.bass = None;
        }
        let timeline = ChordDetector::new().decode(&feats, &c_major(), &CancelToken::new()).unwrap();
        assert_eq!(timeline.labels(), vec!["G"]);
    }

    #[test]
    fn silent_features_decode_to_nothing() {
        let mut feats = features(&[(NoteName::C, ChordKind::Major, 30)]);
        feats.frames.iter_mut().for_each(|f| f.chroma = [0.0; SEMITONES]);
        let timeline = ChordDetector::new().decode(&feats, &c_major(), &CancelToken::new()).unwrap();
        assert!(timeline.is_empty());
    }

    #[test]
    fn borrowed_chords_are_tagged() {
        let feats = features(&[(NoteName::C, ChordKind::Major, 20), (NoteName::As, ChordKind::Major, 20)]);
        let timeline = ChordDetector::new().decode(&feats, &c_major(), &CancelToken::new()).unwrap();
        assert_eq!(timeline.len(), 2);
        assert!(!timeline.events()[0].chord.tags.borrowed);
        assert!(timeline.events()[1].chord.tags.borrowed);
    }

    #[test]
    fn transition_costs_favour_cadences() {
        let detector = ChordDetector::new();
        let states = detector.states(&c_major());
        let g = states[NoteName::G.index()];
        let c = states[NoteName::C.index()];
        let fs = states[NoteName::Fs.index()];
        assert_eq!(detector.transition_cost(&c, &c), 0.0);
        assert!(detector.transition_cost(&g, &c) < detector.transition_cost(&c, &g));
        assert!(detector.transition_cost(&c, &fs) > detector.transition_cost(&c, &g));
        assert!(detector.transition_cost(&g, &c) > 0.0);
    }

    #[test]
    fn beam_width_follows_key_confidence() {
        let detector = ChordDetector::new();
        assert_eq!(detector.beam_width(&Key::new(NoteName::C, Mode::Major, 0.9)), 4);
        assert_eq!(detector.beam_width(&Key::new(NoteName::C, Mode::Major, 0.2)), 8);
        let full = ChordDetector::builder().beam(BeamMode::Full).build();
        assert_eq!(full.beam_width(&Key::new(NoteName::C, Mode::Major, 0.9)), 8);
    }

    #[test]
    fn cancellation_is_observed() {
        let feats = features(&[(NoteName::C, ChordKind::Major, 5)]);
        let token = CancelToken::new();
        token.cancel();
        assert_eq!(ChordDetector::new().decode(&feats, &c_major(), &token), Err(Cancelled));
    }
}
