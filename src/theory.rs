//! Music theory tables
//!
//! Pitch classes, triad qualities and the key-relative classification of
//! chords (diatonic, borrowed, chromatic) shared by the key estimator, the
//! decoder and the refinement loop.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Number of pitch classes in the equal-tempered octave.
pub const SEMITONES: usize = 12;

/// Twelve chromatic pitch classes
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NoteName {
    /// C
    C,
    /// C sharp / D flat
    Cs,
    /// D
    D,
    /// D sharp / E flat
    Ds,
    /// E
    E,
    /// F
    F,
    /// F sharp / G flat
    Fs,
    /// G
    G,
    /// G sharp / A flat
    Gs,
    /// A
    A,
    /// A sharp / B flat
    As,
    /// B
    B,
}

const NOTE_LABELS: [&str; SEMITONES] = [
    "C", "C#", "D", "Eb", "E", "F", "F#", "G", "Ab", "A", "Bb", "B",
];

impl NoteName {
    /// All pitch classes in ascending order from C.
    pub const ALL: [NoteName; SEMITONES] = [
        NoteName::C,
        NoteName::Cs,
        NoteName::D,
        NoteName::Ds,
        NoteName::E,
        NoteName::F,
        NoteName::Fs,
        NoteName::G,
        NoteName::Gs,
        NoteName::A,
        NoteName::As,
        NoteName::B,
    ];

    /// Pitch class for `idx`, wrapping modulo 12.
    pub const fn from_index(idx: usize) -> NoteName {
        Self::ALL[idx % SEMITONES]
    }

    /// Pitch-class number, 0 = C … 11 = B.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The pitch class `semitones` above this one.
    pub const fn transpose(self, semitones: usize) -> NoteName {
        Self::from_index(self.index() + semitones % SEMITONES)
    }

    /// Ascending interval in semitones from `self` up to `other` (0..12).
    pub const fn interval_to(self, other: NoteName) -> usize {
        (other.index() + SEMITONES - self.index()) % SEMITONES
    }
}

impl Display for NoteName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(NOTE_LABELS[self.index()])
    }
}

/// Supported triad qualities
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChordKind {
    /// Major triad (e.g., C-E-G)
    Major,
    /// Minor triad (e.g., C-Eb-G)
    Minor,
}

impl ChordKind {
    /// Semitone offsets of the triad tones above the root.
    pub const fn intervals(self) -> [usize; 3] {
        match self {
            ChordKind::Major => [0, 4, 7],
            ChordKind::Minor => [0, 3, 7],
        }
    }

    /// Quality of the tonic triad of a key in `mode`.
    pub const fn of_mode(mode: Mode) -> ChordKind {
        match mode {
            Mode::Major => ChordKind::Major,
            Mode::Minor => ChordKind::Minor,
        }
    }
}

impl Display for ChordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Key mode
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Major (Ionian) mode
    Major,
    /// Natural minor (Aeolian) mode
    Minor,
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Major => f.write_str("major"),
            Mode::Minor => f.write_str("minor"),
        }
    }
}

/// How a chord relates to a key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyRelation {
    /// One of the key's seven scale triads.
    Diatonic,
    /// A common modal-interchange chord for the key.
    Borrowed,
    /// Anything else.
    Chromatic,
}

// (degree offset, quality). The diminished leading-tone / supertonic triads
// are approximated by the minor triad on the same root.
const MAJOR_DIATONIC: [(usize, ChordKind); 7] = [
    (0, ChordKind::Major),
    (2, ChordKind::Minor),
    (4, ChordKind::Minor),
    (5, ChordKind::Major),
    (7, ChordKind::Major),
    (9, ChordKind::Minor),
    (11, ChordKind::Minor),
];

const MINOR_DIATONIC: [(usize, ChordKind); 7] = [
    (0, ChordKind::Minor),
    (2, ChordKind::Minor),
    (3, ChordKind::Major),
    (5, ChordKind::Minor),
    (7, ChordKind::Minor),
    (8, ChordKind::Major),
    (10, ChordKind::Major),
];

/// bVII, bVI, iv
const MAJOR_BORROWED: [(usize, ChordKind); 3] = [
    (10, ChordKind::Major),
    (8, ChordKind::Major),
    (5, ChordKind::Minor),
];

/// V, IV, raised vii
const MINOR_BORROWED: [(usize, ChordKind); 3] = [
    (7, ChordKind::Major),
    (5, ChordKind::Major),
    (11, ChordKind::Minor),
];

/// Classify the triad (`root`, `kind`) against the key (`tonic`, `mode`).
pub fn key_relation(tonic: NoteName, mode: Mode, root: NoteName, kind: ChordKind) -> KeyRelation {
    let degree = tonic.interval_to(root);
    let (diatonic, borrowed) = match mode {
        Mode::Major => (&MAJOR_DIATONIC, &MAJOR_BORROWED),
        Mode::Minor => (&MINOR_DIATONIC, &MINOR_BORROWED),
    };
    if diatonic.contains(&(degree, kind)) {
        KeyRelation::Diatonic
    } else if borrowed.contains(&(degree, kind)) {
        KeyRelation::Borrowed
    } else {
        KeyRelation::Chromatic
    }
}

/// Distance between two pitch classes around the circle of fifths (0..=6).
pub const fn fifths_distance(a: NoteName, b: NoteName) -> usize {
    let pa = (a.index() * 7) % SEMITONES;
    let pb = (b.index() * 7) % SEMITONES;
    fold_interval((pb + SEMITONES - pa) % SEMITONES)
}

/// Shortest chromatic distance between two pitch classes (0..=6).
pub const fn chromatic_distance(a: NoteName, b: NoteName) -> usize {
    fold_interval(a.interval_to(b))
}

const fn fold_interval(i: usize) -> usize {
    if i > SEMITONES / 2 {
        SEMITONES - i
    } else {
        i
    }
}

/// Map a frequency in Hz to its nearest pitch class using
/// `69 + 12·log2(f/440)`. Returns `None` for non-positive or non-finite input.
pub fn frequency_to_note(freq: f32) -> Option<NoteName> {
    if !(freq.is_finite() && freq > 0.0) {
        return None;
    }
    let midi = 69.0 + 12.0 * (freq / 440.0).log2();
    let pc = (midi.round() as i64).rem_euclid(SEMITONES as i64);
    Some(NoteName::from_index(pc as usize))
}
