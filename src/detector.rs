//! End-to-end analysis
//!
//! [`Detector`] runs feature extraction, key estimation, the refinement loop
//! and the optional collaborators, reporting progress and timing per stage.

use serde::Serialize;
use std::cell::Cell;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::cancel::{CancelToken, Cancelled};
use crate::chord_detector::ChordDetector;
use crate::chromagram::ChromagramError;
use crate::collaborators::{AudioInput, BassDetailDetector, Collaborators, QualityRefiner};
use crate::config::DetectOptions;
use crate::features::FeatureExtractor;
use crate::key::{Key, KeyEstimator};
use crate::refine::{RefinementLoop, RefinementState};
use crate::timeline::Timeline;
use crate::tonic::TonicEstimate;

/// Errors that abort an analysis.
#[derive(Debug, Error)]
pub enum DetectError {
    /// The sample rate must be positive.
    #[error("invalid sample rate: {0} Hz")]
    InvalidSampleRate(u32),

    /// Options that cannot produce a working pipeline.
    #[error(transparent)]
    Configuration(#[from] ChromagramError),

    /// The cancellation token fired.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Pipeline stage reported to the progress callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    /// Chroma, bass, energy and tempo extraction.
    Features,
    /// Initial key estimate.
    Key,
    /// Chord decoding (first or repeated).
    Decode,
    /// Scoring the timeline against all keys.
    KeyRevalidation,
    /// Tonic estimation.
    Tonic,
    /// Optional collaborators.
    Collaborators,
    /// Analysis finished.
    Done,
}

/// A progress report. `progress` never decreases within one analysis.
#[derive(Debug, Copy, Clone, PartialEq, Serialize)]
pub struct Progress {
    /// Current stage.
    pub stage: Stage,
    /// Overall completion in `[0, 1]`.
    pub progress: f32,
}

/// Progress callback.
pub type ProgressCallback = Box<dyn Fn(&Progress) + Send + Sync>;

/// Counters describing an analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisStats {
    /// Analysis frames.
    pub frames: usize,
    /// Frames with a bass estimate.
    pub bass_frames: usize,
    /// Events in the final timeline.
    pub events: usize,
    /// Distinct chord labels.
    pub distinct_chords: usize,
    /// Events borrowed from the parallel mode.
    pub borrowed_events: usize,
    /// Decoder runs.
    pub decode_passes: usize,
    /// Accepted key changes.
    pub key_changes: usize,
    /// Qualities replaced by the quality refiner.
    pub quality_overrides: usize,
    /// Events annotated from bass detail.
    pub bass_annotations: usize,
}

/// Wall-clock time per stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageTimings {
    /// Feature extraction.
    pub features: Duration,
    /// Initial key estimate.
    pub key: Duration,
    /// Decoding, revalidation and tonic estimation.
    pub refinement: Duration,
    /// Collaborators.
    pub collaborators: Duration,
    /// Whole analysis.
    pub total: Duration,
}

/// Result of [`Detector::detect`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    /// Chord timeline.
    pub chords: Timeline,
    /// Final key.
    pub key: Key,
    /// Tonic of the final timeline.
    pub tonic: TonicEstimate,
    /// Tempo estimate.
    pub bpm: f32,
    /// Input duration in seconds.
    pub duration: f32,
    /// Counters.
    pub stats: AnalysisStats,
    /// Stage timings.
    pub timings: StageTimings,
    /// States the refinement loop went through.
    pub refinement: Vec<RefinementState>,
}

/// Builder for [`Detector`].
#[derive(Default)]
pub struct DetectorBuilder {
    options: DetectOptions,
    progress: Option<ProgressCallback>,
    collaborators: Collaborators,
    cancel: CancelToken,
}

impl DetectorBuilder {
    /// Builder with default options and no callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Analysis options.
    pub fn options(mut self, options: DetectOptions) -> Self {
        self.options = options;
        self
    }

    /// Called at every stage boundary.
    pub fn progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Per-event bass detail for inversions and sevenths.
    pub fn bass_detail(mut self, detector: impl BassDetailDetector + 'static) -> Self {
        self.collaborators = self.collaborators.with_bass_detail(detector);
        self
    }

    /// Per-event quality overrides.
    pub fn quality_refiner(mut self, refiner: impl QualityRefiner + 'static) -> Self {
        self.collaborators = self.collaborators.with_quality_refiner(refiner);
        self
    }

    /// Token checked between frames and stages.
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Validate the options and build the detector.
    pub fn build(self) -> Result<Detector, DetectError> {
        let options = self.options;
        let extractor = FeatureExtractor::new(&options.features)?;
        let decoder = ChordDetector::builder()
            .bass_multiplier(options.bass_multiplier)
            .beam(options.beam)
            .thresholds(options.decoder.clone())
            .build();
        Ok(Detector {
            key_estimator: KeyEstimator::new(options.key.clone()),
            extractor,
            decoder,
            collaborators: self.collaborators,
            progress: self.progress,
            cancel: self.cancel,
            options,
        })
    }
}

/// Offline chord, key and tonic analysis of mono audio.
pub struct Detector {
    options: DetectOptions,
    extractor: FeatureExtractor,
    key_estimator: KeyEstimator,
    decoder: ChordDetector,
    collaborators: Collaborators,
    progress: Option<ProgressCallback>,
    cancel: CancelToken,
}

impl Detector {
    /// Start building a detector.
    pub fn builder() -> DetectorBuilder {
        DetectorBuilder::new()
    }

    /// Detector with `options` and no callbacks.
    pub fn new(options: DetectOptions) -> Result<Self, DetectError> {
        DetectorBuilder::new().options(options).build()
    }

    /// Options in use.
    pub fn options(&self) -> &DetectOptions {
        &self.options
    }

    /// A handle that cancels analyses run by this detector.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Analyse `samples` (mono, any positive sample rate).
    pub fn detect(&self, samples: &[f32], sample_rate: u32) -> Result<AnalysisResult, DetectError> {
        if sample_rate == 0 {
            return Err(DetectError::InvalidSampleRate(sample_rate));
        }
        let started = Instant::now();
        let last = Cell::new(0.0f32);
        let report = |stage: Stage, progress: f32| {
            let progress = progress.max(last.get());
            last.set(progress);
            if let Some(callback) = &self.progress {
                callback(&Progress { stage, progress });
            }
        };
        let mut timings = StageTimings::default();

        report(Stage::Features, 0.0);
        let t = Instant::now();
        let features = self.extractor.extract(samples, sample_rate, &self.cancel)?;
        timings.features = t.elapsed();
        report(Stage::Features, 0.3);

        self.cancel.check()?;
        let t = Instant::now();
        let initial = self.key_estimator.estimate(&features);
        timings.key = t.elapsed();
        report(Stage::Key, 0.4);

        let t = Instant::now();
        let observer = |state: RefinementState| match state {
            RefinementState::Decoded => report(Stage::Decode, 0.6),
            RefinementState::KeyRevalidated => report(Stage::KeyRevalidation, 0.7),
            RefinementState::Redecoded => report(Stage::Decode, 0.75),
            RefinementState::TonicEstimated => report(Stage::Tonic, 0.85),
            RefinementState::Done => {}
        };
        let outcome = RefinementLoop::new(&self.decoder, &features, &self.options.refinement, &self.cancel)
            .tonic_rerun_threshold(self.options.tonic_rerun_threshold)
            .max_key_changes(self.options.max_key_changes)
            .observer(&observer)
            .run(initial)?;
        timings.refinement = t.elapsed();

        self.cancel.check()?;
        let t = Instant::now();
        let audio = AudioInput { samples, sample_rate };
        let (chords, collaborator_report) = if self.collaborators.is_empty() {
            (outcome.timeline, Default::default())
        } else {
            self.collaborators.apply(audio, outcome.timeline, &outcome.key, &self.options)
        };
        timings.collaborators = t.elapsed();
        report(Stage::Collaborators, 0.95);

        let stats = AnalysisStats {
            frames: features.len(),
            bass_frames: features.bass_frames(),
            events: chords.len(),
            distinct_chords: chords.iter().map(|e| e.chord).collect::<HashSet<_>>().len(),
            borrowed_events: chords.iter().filter(|e| e.chord.tags.borrowed).count(),
            decode_passes: outcome.decode_passes,
            key_changes: outcome.key_changes,
            quality_overrides: collaborator_report.quality_overrides,
            bass_annotations: collaborator_report.bass_annotations,
        };
        timings.total = started.elapsed();
        report(Stage::Done, 1.0);

        log::debug!(
            "Analysis done: {} events, key {}, tonic {}, {:.1} BPM in {:?}",
            stats.events,
            outcome.key,
            outcome.tonic.root,
            features.bpm,
            timings.total
        );

        Ok(AnalysisResult {
            chords,
            key: outcome.key,
            tonic: outcome.tonic,
            bpm: features.bpm,
            duration: features.duration,
            stats,
            timings,
            refinement: outcome.trail,
        })
    }
}
