//! Optional post-processing collaborators.
//!
//! A [`QualityRefiner`] may propose a different triad quality per event and
//! a [`BassDetailDetector`] may report the sounding bass per event, which
//! becomes an inversion or a seventh annotation. Neither may move events or
//! change roots. A collaborator that fails, or returns a list whose length
//! does not match the timeline, is logged and skipped.

use std::error::Error;

use crate::config::DetectOptions;
use crate::key::Key;
use crate::theory::{ChordKind, KeyRelation, NoteName};
use crate::timeline::{Chord, ChordEvent, Seventh, Timeline};

/// Error type returned by collaborators.
pub type CollaboratorError = Box<dyn Error + Send + Sync>;

/// Audio handed to collaborators, at the caller's sample rate.
#[derive(Debug, Copy, Clone)]
pub struct AudioInput<'a> {
    /// Mono samples.
    pub samples: &'a [f32],
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

/// Bass of one event as heard by a [`BassDetailDetector`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BassDetail {
    /// Bass pitch class.
    pub bass: NoteName,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
}

/// Quality proposal for one event from a [`QualityRefiner`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct QualitySuggestion {
    /// Proposed quality.
    pub quality: ChordKind,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    /// Whether the refiner asks for its proposal to replace the decoded one.
    pub should_override: bool,
}

/// Reports the bass of each event. Must return one entry per event.
pub trait BassDetailDetector: Send + Sync {
    /// Inspect `timeline` over `audio`.
    fn detect(
        &self,
        audio: AudioInput<'_>,
        timeline: &Timeline,
        key: &Key,
        options: &DetectOptions,
    ) -> Result<Vec<BassDetail>, CollaboratorError>;
}

/// Proposes triad qualities per event. Must return one entry per event.
pub trait QualityRefiner: Send + Sync {
    /// Inspect `timeline` over `audio`.
    fn refine(
        &self,
        audio: AudioInput<'_>,
        timeline: &Timeline,
        options: &DetectOptions,
    ) -> Result<Vec<QualitySuggestion>, CollaboratorError>;
}

/// What the collaborators changed.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CollaboratorReport {
    /// Events whose quality was replaced.
    pub quality_overrides: usize,
    /// Events given a slash bass or a seventh.
    pub bass_annotations: usize,
}

/// The configured collaborators.
#[derive(Default)]
pub struct Collaborators {
    pub(crate) bass_detail: Option<Box<dyn BassDetailDetector>>,
    pub(crate) quality_refiner: Option<Box<dyn QualityRefiner>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("bass_detail", &self.bass_detail.is_some())
            .field("quality_refiner", &self.quality_refiner.is_some())
            .finish()
    }
}

impl Collaborators {
    /// No collaborators.
    pub fn new() -> Self {
        Collaborators::default()
    }

    /// Use `detector` for bass annotations.
    pub fn with_bass_detail(mut self, detector: impl BassDetailDetector + 'static) -> Self {
        self.bass_detail = Some(Box::new(detector));
        self
    }

    /// Use `refiner` for quality overrides.
    pub fn with_quality_refiner(mut self, refiner: impl QualityRefiner + 'static) -> Self {
        self.quality_refiner = Some(Box::new(refiner));
        self
    }

    /// Whether any collaborator is configured.
    pub fn is_empty(&self) -> bool {
        self.bass_detail.is_none() && self.quality_refiner.is_none()
    }

    /// Run the quality refiner, then the bass detector, over `timeline`.
    pub fn apply(
        &self,
        audio: AudioInput<'_>,
        timeline: Timeline,
        key: &Key,
        options: &DetectOptions,
    ) -> (Timeline, CollaboratorReport) {
        let mut report = CollaboratorReport::default();
        let mut timeline = timeline;

        if let Some(refiner) = &self.quality_refiner {
            let suggestions = refiner.refine(audio, &timeline, options);
            if let Some(suggestions) = checked("quality refiner", suggestions, timeline.len()) {
                let floor = options.collaborators.quality_override_confidence;
                timeline = timeline.map_chords(|i, e| {
                    let s = suggestions[i];
                    let accepted = s.should_override && s.confidence >= floor;
                    if !accepted || s.quality == e.chord.quality {
                        return e.chord;
                    }
                    report.quality_overrides += 1;
                    let mut chord = Chord {
                        quality: s.quality,
                        ..e.chord
                    };
                    chord.tags.borrowed = key.relation(chord.root, chord.quality) == KeyRelation::Borrowed;
                    chord
                });
            }
        }

        if let Some(detector) = &self.bass_detail {
            let details = detector.detect(audio, &timeline, key, options);
            if let Some(details) = checked("bass detail detector", details, timeline.len()) {
                timeline = timeline.map_chords(|i, e| {
                    let annotated = annotate(e, details[i], options);
                    if annotated != e.chord {
                        report.bass_annotations += 1;
                    }
                    annotated
                });
            }
        }

        if report != CollaboratorReport::default() {
            log::debug!(
                "Collaborators: {} quality overrides, {} bass annotations",
                report.quality_overrides,
                report.bass_annotations
            );
        }
        (timeline, report)
    }
}

/// Unwrap a collaborator result, rejecting errors and length mismatches.
fn checked<T>(name: &str, result: Result<Vec<T>, CollaboratorError>, expected: usize) -> Option<Vec<T>> {
    match result {
        Ok(items) if items.len() == expected => Some(items),
        Ok(items) => {
            log::warn!(
                "Ignoring {}: {} entries for {} events",
                name,
                items.len(),
                expected
            );
            None
        }
        Err(err) => {
            log::warn!("Ignoring {}: {}", name, err);
            None
        }
    }
}

/// Slash bass for chord tones, seventh for 10 or 11 semitones above the root.
fn annotate(event: &ChordEvent, detail: BassDetail, options: &DetectOptions) -> Chord {
    let mut chord = event.chord;
    if !detail.confidence.is_finite() {
        return chord;
    }
    let floor = options.collaborators.bass_detail_confidence;
    let third = match chord.quality {
        ChordKind::Major => 4,
        ChordKind::Minor => 3,
    };
    match chord.root.interval_to(detail.bass) {
        i if (i == third || i == 7) && detail.confidence >= floor => {
            chord.tags.bass = Some(detail.bass);
        }
        i @ (10 | 11) if options.harmony_mode.allows_sevenths() => {
            let sensitivity = options.extension_sensitivity.max(f32::EPSILON);
            let seventh_floor = floor * options.harmony_mode.floor_scale() / sensitivity;
            if detail.confidence * options.extension_multiplier >= seventh_floor {
                chord.tags.seventh = Some(if i == 10 { Seventh::Minor } else { Seventh::Major });
            }
        }
        _ => {}
    }
    chord
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarmonyMode;
    use crate::theory::Mode;
    use crate::timeline::FinalizeParams;

    struct FixedBass(Vec<BassDetail>);

    impl BassDetailDetector for FixedBass {
        fn detect(
            &self,
            _audio: AudioInput<'_>,
            _timeline: &Timeline,
            _key: &Key,
            _options: &DetectOptions,
        ) -> Result<Vec<BassDetail>, CollaboratorError> {
            Ok(self.0.clone())
        }
    }

    struct FixedQuality(Vec<QualitySuggestion>);

    impl QualityRefiner for FixedQuality {
        fn refine(
            &self,
            _audio: AudioInput<'_>,
            _timeline: &Timeline,
            _options: &DetectOptions,
        ) -> Result<Vec<QualitySuggestion>, CollaboratorError> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    impl QualityRefiner for Failing {
        fn refine(
            &self,
            _audio: AudioInput<'_>,
            _timeline: &Timeline,
            _options: &DetectOptions,
        ) -> Result<Vec<QualitySuggestion>, CollaboratorError> {
            Err("model not loaded".into())
        }
    }

    const SILENCE: [f32; 4] = [0.0; 4];

    fn audio() -> AudioInput<'static> {
        AudioInput {
            samples: &SILENCE,
            sample_rate: 22_050,
        }
    }

    fn key() -> Key {
        Key::new(NoteName::C, Mode::Major, 0.8)
    }

    fn timeline() -> Timeline {
        let chords = [
            (NoteName::C, ChordKind::Major),
            (NoteName::G, ChordKind::Major),
            (NoteName::A, ChordKind::Minor),
        ];
        let events = chords
            .iter()
            .enumerate()
            .map(|(i, &(root, kind))| ChordEvent {
                start: i as f32 * 2.0,
                chord: Chord::triad(root, kind),
                frame: i * 20,
                confidence: 0.9,
            })
            .collect();
        Timeline::finalize(
            events,
            &FinalizeParams {
                duration: 6.0,
                bpm: 120.0,
                min_segment: 0.3,
                weak_similarity: 0.45,
                snap_tolerance: 0.05,
            },
        )
    }

    fn detail(bass: NoteName, confidence: f32) -> BassDetail {
        BassDetail { bass, confidence }
    }

    #[test]
    fn inversions_and_sevenths() {
        let options = DetectOptions {
            harmony_mode: HarmonyMode::Jazz,
            ..DetectOptions::default()
        };
        let collaborators = Collaborators::new().with_bass_detail(FixedBass(vec![
            detail(NoteName::E, 0.9),
            detail(NoteName::F, 0.9),
            detail(NoteName::A, 0.9),
        ]));
        let (out, report) = collaborators.apply(audio(), timeline(), &key(), &options);
        assert_eq!(out.labels(), vec!["C/E", "G7", "Am"]);
        assert_eq!(report.bass_annotations, 2);
        let starts: Vec<f32> = out.iter().map(|e| e.start).collect();
        assert_eq!(starts, vec![0.0, 2.0, 4.0]);
    }

    #[test]
    fn basic_mode_skips_sevenths() {
        let collaborators = Collaborators::new().with_bass_detail(FixedBass(vec![
            detail(NoteName::C, 0.9),
            detail(NoteName::F, 0.95),
            detail(NoteName::E, 0.9),
        ]));
        let (out, _) = collaborators.apply(audio(), timeline(), &key(), &DetectOptions::default());
        assert_eq!(out.labels(), vec!["C", "G", "Am/E"]);
    }

    #[test]
    fn low_confidence_bass_is_ignored() {
        let collaborators = Collaborators::new().with_bass_detail(FixedBass(vec![
            detail(NoteName::E, 0.5),
            detail(NoteName::B, 0.5),
            detail(NoteName::C, 0.5),
        ]));
        let (out, report) = collaborators.apply(audio(), timeline(), &key(), &DetectOptions::default());
        assert_eq!(out, timeline());
        assert_eq!(report, CollaboratorReport::default());
    }

    #[test]
    fn extension_sensitivity_lowers_the_floor() {
        let options = DetectOptions {
            harmony_mode: HarmonyMode::Pro,
            extension_sensitivity: 2.0,
            ..DetectOptions::default()
        };
        let collaborators = Collaborators::new().with_bass_detail(FixedBass(vec![
            detail(NoteName::B, 0.4),
            detail(NoteName::G, 0.4),
            detail(NoteName::G, 0.4),
        ]));
        let (out, _) = collaborators.apply(audio(), timeline(), &key(), &options);
        assert_eq!(out.labels(), vec!["Cmaj7", "G", "Am7"]);
    }

    #[test]
    fn confident_quality_override() {
        let suggestions = vec![
            QualitySuggestion { quality: ChordKind::Major, confidence: 0.9, should_override: true },
            QualitySuggestion { quality: ChordKind::Minor, confidence: 0.95, should_override: true },
            QualitySuggestion { quality: ChordKind::Major, confidence: 0.5, should_override: true },
        ];
        let collaborators = Collaborators::new().with_quality_refiner(FixedQuality(suggestions));
        let (out, report) = collaborators.apply(audio(), timeline(), &key(), &DetectOptions::default());
        assert_eq!(out.labels(), vec!["C", "Gm", "Am"]);
        assert_eq!(report.quality_overrides, 1);
        assert_eq!(out.events()[1].chord.root, NoteName::G);
    }

    #[test]
    fn malformed_and_failing_collaborators_are_ignored() {
        let short = Collaborators::new()
            .with_quality_refiner(FixedQuality(Vec::new()))
            .with_bass_detail(FixedBass(vec![detail(NoteName::E, 1.0)]));
        let (out, report) = short.apply(audio(), timeline(), &key(), &DetectOptions::default());
        assert_eq!(out, timeline());
        assert_eq!(report, CollaboratorReport::default());

        let failing = Collaborators::new().with_quality_refiner(Failing);
        let (out, _) = failing.apply(audio(), timeline(), &key(), &DetectOptions::default());
        assert_eq!(out, timeline());
    }
}
