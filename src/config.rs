//! Configuration
//!
//! Every empirically tuned threshold of the pipeline lives here as a named
//! default so that variant behaviour is a matter of configuration. Options
//! deserialize from camelCase keys (`bassMultiplier`, `tonicRerunThreshold`,
//! …); missing keys fall back to their defaults.

use serde::{Deserialize, Serialize};

/// How aggressively extension annotations are added to decoded chords.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HarmonyMode {
    /// Triads and inversions only.
    #[default]
    Basic,
    /// Sevenths allowed.
    Jazz,
    /// Sevenths allowed with a lower confidence floor.
    Pro,
}

impl HarmonyMode {
    /// Whether seventh annotations may be added.
    pub fn allows_sevenths(self) -> bool {
        !matches!(self, HarmonyMode::Basic)
    }

    /// Multiplier applied to the seventh-annotation confidence floor.
    pub fn floor_scale(self) -> f32 {
        match self {
            HarmonyMode::Basic => 1.0,
            HarmonyMode::Jazz => 1.0,
            HarmonyMode::Pro => 0.85,
        }
    }
}

/// Beam width selection for the decoder.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeamMode {
    /// Light beam when the key prior is confident, full beam otherwise.
    #[default]
    Auto,
    /// Always use the light beam.
    Light,
    /// Always use the full beam.
    Full,
}

/// Top-level analysis options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DetectOptions {
    /// Scale of the emission bonus when the frame bass matches a chord root.
    pub bass_multiplier: f32,
    /// Scale applied to collaborator confidence for extension annotations.
    pub extension_multiplier: f32,
    /// Divides the confidence floor for extension annotations.
    pub extension_sensitivity: f32,
    /// Extension policy handed to collaborators.
    pub harmony_mode: HarmonyMode,
    /// Tonic confidence (percent, 0–100) needed to re-decode on a new tonic.
    pub tonic_rerun_threshold: f32,
    /// Decoder beam selection.
    pub beam: BeamMode,
    /// Upper bound on accepted key changes per analysis.
    pub max_key_changes: usize,
    /// Feature extraction parameters.
    pub features: FeatureConfig,
    /// Key estimation thresholds.
    pub key: KeyThresholds,
    /// Decoder scoring and finalisation parameters.
    pub decoder: DecoderThresholds,
    /// Key re-scoring and tonic voting weights.
    pub refinement: RefinementWeights,
    /// Confidence floors for collaborator suggestions.
    pub collaborators: CollaboratorThresholds,
}

impl Default for DetectOptions {
    fn default() -> Self {
        DetectOptions {
            bass_multiplier: 1.2,
            extension_multiplier: 1.0,
            extension_sensitivity: 1.0,
            harmony_mode: HarmonyMode::Basic,
            tonic_rerun_threshold: 75.0,
            beam: BeamMode::Auto,
            max_key_changes: 2,
            features: FeatureConfig::default(),
            key: KeyThresholds::default(),
            decoder: DecoderThresholds::default(),
            refinement: RefinementWeights::default(),
            collaborators: CollaboratorThresholds::default(),
        }
    }
}

/// Feature extraction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeatureConfig {
    /// Analysis window in samples at the canonical rate.
    pub window_size: usize,
    /// Hop between frames in seconds.
    pub hop_seconds: f32,
    /// Lowest frequency folded into the chroma.
    pub min_frequency: f32,
    /// Highest frequency folded into the chroma.
    pub max_frequency: f32,
    /// Lowest bass fundamental considered.
    pub bass_min_frequency: f32,
    /// Highest bass fundamental considered.
    pub bass_max_frequency: f32,
    /// Normalised autocorrelation a bass lag must reach.
    pub bass_min_correlation: f32,
    /// Share of in-band magnitude the bass band must carry.
    pub bass_min_share: f32,
    /// Lower tempo bound.
    pub min_bpm: f32,
    /// Upper tempo bound.
    pub max_bpm: f32,
    /// Reported when the tempo cannot be measured.
    pub default_bpm: f32,
    /// Percentile (0–1) below which a frame counts as low energy.
    pub low_energy_percentile: f32,
    /// Percentile (0–1) above which a frame counts as high energy.
    pub high_energy_percentile: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        FeatureConfig {
            window_size: 4096,
            hop_seconds: 0.1,
            min_frequency: 80.0,
            max_frequency: 5000.0,
            bass_min_frequency: 40.0,
            bass_max_frequency: 250.0,
            bass_min_correlation: 0.5,
            bass_min_share: 0.05,
            min_bpm: 60.0,
            max_bpm: 200.0,
            default_bpm: 120.0,
            low_energy_percentile: 0.2,
            high_energy_percentile: 0.8,
        }
    }
}

/// Key estimation thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KeyThresholds {
    /// Bass histogram peak share needed to trust the bass tier.
    pub bass_confidence: f32,
    /// Length of the opening and closing windows in seconds.
    pub edge_seconds: f32,
    /// Chroma weight of edge frames in the profile-correlation tier.
    pub edge_weight: f32,
    /// Chroma weight of edge frames when choosing the mode.
    pub mode_edge_weight: f32,
    /// Extra histogram weight of bass in edge frames.
    pub bass_edge_bonus: f32,
    /// Extra histogram weight of bass at rest points.
    pub rest_point_bonus: f32,
    /// Energy ratio to the next frame that marks a rest point.
    pub rest_drop_ratio: f32,
}

impl Default for KeyThresholds {
    fn default() -> Self {
        KeyThresholds {
            bass_confidence: 0.25,
            edge_seconds: 4.0,
            edge_weight: 4.0,
            mode_edge_weight: 2.0,
            bass_edge_bonus: 1.0,
            rest_point_bonus: 1.0,
            rest_drop_ratio: 0.6,
        }
    }
}

/// Decoder scoring and finalisation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DecoderThresholds {
    /// Cosine similarity below which a chord is impossible for a frame.
    pub similarity_floor: f32,
    /// Emission bonus for chords diatonic to the key.
    pub diatonic_bonus: f32,
    /// Emission bonus for borrowed chords.
    pub borrowed_bonus: f32,
    /// Emission bonus when the frame bass equals the chord root.
    pub bass_bonus: f32,
    /// Emission penalty for low-energy frames.
    pub low_energy_penalty: f32,
    /// Cost of any chord change.
    pub transition_base: f32,
    /// Weight of circle-of-fifths distance (normalised to 0–1).
    pub fifths_weight: f32,
    /// Weight of chromatic distance (normalised to 0–1).
    pub chromatic_weight: f32,
    /// Extra cost when the quality changes.
    pub quality_change_penalty: f32,
    /// Extra cost per borrowed endpoint.
    pub borrowed_penalty: f32,
    /// Extra cost per chromatic endpoint.
    pub chromatic_penalty: f32,
    /// Cost reduction for root motion down a fifth.
    pub dominant_motion_bonus: f32,
    /// Cost reduction for whole-step root motion.
    pub step_motion_bonus: f32,
    /// Smallest cost a chord change can have.
    pub min_transition_cost: f32,
    /// Beam width of the light mode.
    pub light_beam: usize,
    /// Beam width of the full mode.
    pub full_beam: usize,
    /// Key confidence at which `BeamMode::Auto` picks the light beam.
    pub light_beam_confidence: f32,
    /// Restrict states to diatonic and borrowed chords instead of biasing.
    pub restrict_to_key: bool,
    /// Segments shorter than this are absorbed by a neighbour.
    pub min_segment_seconds: f32,
    /// Segments with lower mean similarity are absorbed when also brief.
    pub weak_similarity: f32,
    /// Maximum distance for snapping a boundary onto the beat grid.
    pub snap_tolerance_seconds: f32,
}

impl Default for DecoderThresholds {
    fn default() -> Self {
        DecoderThresholds {
            similarity_floor: 0.3,
            diatonic_bonus: 0.08,
            borrowed_bonus: 0.03,
            bass_bonus: 0.1,
            low_energy_penalty: 0.1,
            transition_base: 0.15,
            fifths_weight: 0.12,
            chromatic_weight: 0.04,
            quality_change_penalty: 0.05,
            borrowed_penalty: 0.05,
            chromatic_penalty: 0.12,
            dominant_motion_bonus: 0.08,
            step_motion_bonus: 0.03,
            min_transition_cost: 0.05,
            light_beam: 4,
            full_beam: 8,
            light_beam_confidence: 0.6,
            restrict_to_key: false,
            min_segment_seconds: 0.3,
            weak_similarity: 0.45,
            snap_tolerance_seconds: 0.05,
        }
    }
}

/// Key re-scoring and tonic voting weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RefinementWeights {
    /// Score margin a rival key needs to replace the current key.
    pub key_change_margin: f32,
    /// Weight of the V→I share of transitions.
    pub authentic_cadence: f32,
    /// Weight of the IV→I share of transitions.
    pub plagal_cadence: f32,
    /// Weight of the ii→V→I share of transitions.
    pub two_five_one: f32,
    /// Bonus when the first chord is the key's tonic triad.
    pub first_chord: f32,
    /// Bonus when the last chord is the key's tonic triad.
    pub last_chord: f32,
    /// Bonus when the longest-held root is the key root.
    pub most_frequent: f32,
    /// Tonic vote weight of the duration share.
    pub tonic_duration: f32,
    /// Tonic vote weight of the opening window share.
    pub tonic_opening: f32,
    /// Tonic vote weight of the closing window share.
    pub tonic_closing: f32,
    /// Tonic vote weight of the cadence-resolution share.
    pub tonic_cadence: f32,
    /// Length of the tonic opening and closing windows in seconds.
    pub tonic_window_seconds: f32,
}

impl Default for RefinementWeights {
    fn default() -> Self {
        RefinementWeights {
            key_change_margin: 0.1,
            authentic_cadence: 0.6,
            plagal_cadence: 0.25,
            two_five_one: 0.4,
            first_chord: 0.1,
            last_chord: 0.2,
            most_frequent: 0.1,
            tonic_duration: 0.45,
            tonic_opening: 0.15,
            tonic_closing: 0.2,
            tonic_cadence: 0.35,
            tonic_window_seconds: 6.0,
        }
    }
}

/// Confidence floors for collaborator suggestions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CollaboratorThresholds {
    /// Bass-detail confidence needed to annotate an event.
    pub bass_detail_confidence: f32,
    /// Quality-refiner confidence needed to override a decoded quality.
    pub quality_override_confidence: f32,
}

impl Default for CollaboratorThresholds {
    fn default() -> Self {
        CollaboratorThresholds {
            bass_detail_confidence: 0.7,
            quality_override_confidence: 0.8,
        }
    }
}
