//! # chord_timeline
//!
//! Offline harmonic analysis of mono audio: a timed chord timeline, the
//! global key, the tonic and a tempo estimate.
//!
//! The pipeline resamples to 22.05 kHz, extracts per-frame chroma, bass and
//! energy, guesses the key, decodes the most plausible chord path with a
//! beam-limited Viterbi search, then revalidates the key against the decoded
//! chords and re-decodes within a bounded budget.
//!
//! ## Example
//! ```rust
//! use chord_timeline::{detect, DetectOptions};
//!
//! fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     // 2 seconds of an A minor triad
//!     let rate = 22_050;
//!     let samples: Vec<f32> = (0..2 * rate)
//!         .map(|i| {
//!             let t = i as f32 / rate as f32;
//!             [220.0f32, 261.63, 329.63]
//!                 .iter()
//!                 .map(|f| 0.2 * (2.0 * std::f32::consts::PI * f * t).sin())
//!                 .sum::<f32>()
//!         })
//!         .collect();
//!
//!     let result = detect(&samples, rate as u32, &DetectOptions::default())?;
//!     for event in &result.chords {
//!         println!("{:>6.2}s  {}", event.start, event.chord);
//!     }
//!     println!("key: {}, tempo: {:.0} BPM", result.key, result.bpm);
//!     Ok(())
//! }
//! # run().unwrap();
//! ```
//!
//! ## Features
//! - `parallel`: extract frames on the rayon thread pool

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rust_2018_idioms)]
#![deny(clippy::all)]

/// Pitch classes, chord qualities and key relations.
pub mod theory;

/// Analysis options and tuned thresholds.
pub mod config;

/// Cooperative cancellation.
pub mod cancel;

/// FFT chromagram of a single frame.
pub mod chromagram;

/// Autocorrelation bass tracking.
pub mod bass;

/// Frame features of a whole buffer.
pub mod features;

/// Initial key estimation.
pub mod key;

/// Chord events and timeline clean-up.
pub mod timeline;

/// Chord sequence decoding.
pub mod chord_detector;

/// Tonic voting.
pub mod tonic;

/// Key revalidation loop.
pub mod refine;

/// Optional bass and quality collaborators.
pub mod collaborators;

/// End-to-end analysis.
pub mod detector;

pub use cancel::{CancelToken, Cancelled};
pub use chord_detector::{ChordDetector, ChordDetectorBuilder};
pub use chromagram::{Chromagram, ChromagramBuilder, ChromagramError};
pub use collaborators::{
    AudioInput, BassDetail, BassDetailDetector, CollaboratorError, QualityRefiner, QualitySuggestion,
};
pub use config::{BeamMode, DetectOptions, HarmonyMode};
pub use detector::{
    AnalysisResult, AnalysisStats, DetectError, Detector, DetectorBuilder, Progress, ProgressCallback,
    Stage, StageTimings,
};
pub use key::Key;
pub use theory::{ChordKind, Mode, NoteName};
pub use timeline::{Chord, ChordEvent, ChordTags, Seventh, Timeline};
pub use tonic::TonicEstimate;

/// Analyse `samples` with `options` and no callbacks.
pub fn detect(
    samples: &[f32],
    sample_rate: u32,
    options: &DetectOptions,
) -> Result<AnalysisResult, DetectError> {
    Detector::new(options.clone())?.detect(samples, sample_rate)
}
