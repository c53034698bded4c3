//! Chord timeline
//!
//! Structured chord labels, timed chord events and the finalisation pass
//! that turns raw decoder segments into a clean timeline.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

use crate::theory::{ChordKind, NoteName, SEMITONES};

/// Seventh extension added on top of a triad.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Seventh {
    /// Minor seventh (10 semitones above the root).
    Minor,
    /// Major seventh (11 semitones above the root).
    Major,
}

/// Optional markers carried by a chord.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChordTags {
    /// Borrowed from the parallel mode of the key.
    pub borrowed: bool,
    /// Seventh extension.
    pub seventh: Option<Seventh>,
    /// Bass note when it differs from the root (slash chord).
    pub bass: Option<NoteName>,
}

/// A chord label as a structured value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chord {
    /// Root pitch class.
    pub root: NoteName,
    /// Triad quality.
    pub quality: ChordKind,
    /// Markers.
    pub tags: ChordTags,
}

impl Chord {
    /// Plain triad without markers.
    pub fn triad(root: NoteName, quality: ChordKind) -> Self {
        Chord {
            root,
            quality,
            tags: ChordTags::default(),
        }
    }
}

impl Display for Chord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.root)?;
        match (self.quality, self.tags.seventh) {
            (ChordKind::Major, None) => {}
            (ChordKind::Major, Some(Seventh::Minor)) => f.write_str("7")?,
            (ChordKind::Major, Some(Seventh::Major)) => f.write_str("maj7")?,
            (ChordKind::Minor, None) => f.write_str("m")?,
            (ChordKind::Minor, Some(Seventh::Minor)) => f.write_str("m7")?,
            (ChordKind::Minor, Some(Seventh::Major)) => f.write_str("mmaj7")?,
        }
        if let Some(bass) = self.tags.bass {
            write!(f, "/{bass}")?;
        }
        Ok(())
    }
}

/// One chord change.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChordEvent {
    /// Start time in seconds.
    pub start: f32,
    /// The chord sounding from `start` until the next event.
    pub chord: Chord,
    /// Analysis frame the event was decoded from.
    pub frame: usize,
    /// Mean chroma similarity of the frames the event covers.
    pub confidence: f32,
}

/// Violations reported by [`Timeline::check_invariants`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimelineError {
    /// Start times are not strictly increasing.
    #[error("event {index} starts at {start}s, not after {previous}s")]
    OutOfOrder {
        /// Offending event.
        index: usize,
        /// Its start time.
        start: f32,
        /// Start time of the event before it.
        previous: f32,
    },
    /// Two adjacent events carry the same label.
    #[error("event {index} repeats label {label}")]
    RepeatedLabel {
        /// Offending event.
        index: usize,
        /// The repeated label.
        label: String,
    },
    /// An event starts outside the audio.
    #[error("event {index} starts at {start}s outside 0..{duration}s")]
    OutOfRange {
        /// Offending event.
        index: usize,
        /// Its start time.
        start: f32,
        /// Duration of the audio.
        duration: f32,
    },
}

/// Parameters of [`Timeline::finalize`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinalizeParams {
    /// Duration of the audio in seconds.
    pub duration: f32,
    /// Tempo used for the beat grid; non-positive disables snapping.
    pub bpm: f32,
    /// Events shorter than this are absorbed by a neighbour.
    pub min_segment: f32,
    /// Events below this confidence are absorbed when shorter than twice
    /// `min_segment`.
    pub weak_similarity: f32,
    /// Maximum boundary movement when snapping to the beat grid.
    pub snap_tolerance: f32,
}

/// Ordered chord events covering an audio buffer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    events: Vec<ChordEvent>,
    duration: f32,
}

impl Timeline {
    /// A timeline without events.
    pub fn empty(duration: f32) -> Self {
        Timeline {
            events: Vec::new(),
            duration: duration.max(0.0),
        }
    }

    /// Clean up raw events: drop events outside the audio, snap boundaries to
    /// the beat grid, absorb short or weak events into their neighbours and
    /// merge repeated labels. Passes repeat until nothing changes, so
    /// finalising a finalised timeline returns it unchanged.
    pub fn finalize(events: Vec<ChordEvent>, params: &FinalizeParams) -> Timeline {
        let duration = params.duration.max(0.0);
        let mut current: Vec<ChordEvent> = Vec::with_capacity(events.len());
        for event in events {
            let in_range = event.start.is_finite() && event.start >= 0.0 && event.start < duration;
            let ordered = current.last().map_or(true, |prev| event.start > prev.start);
            if in_range && ordered {
                current.push(event);
            }
        }

        for _ in 0..=current.len() {
            let next = finalize_pass(&current, duration, params);
            if next == current {
                break;
            }
            current = next;
        }
        Timeline {
            events: current,
            duration,
        }
    }

    /// Run [`Timeline::finalize`] again on this timeline's events.
    pub fn refinalize(&self, params: &FinalizeParams) -> Timeline {
        Timeline::finalize(self.events.clone(), params)
    }

    /// Replace event chords in place, then merge labels that became equal.
    /// Timing is untouched apart from the merges.
    pub fn map_chords<F>(&self, mut f: F) -> Timeline
    where
        F: FnMut(usize, &ChordEvent) -> Chord,
    {
        let mut events: Vec<ChordEvent> = self
            .events
            .iter()
            .enumerate()
            .map(|(i, e)| ChordEvent { chord: f(i, e), ..*e })
            .collect();
        merge_identical(&mut events, self.duration);
        Timeline {
            events,
            duration: self.duration,
        }
    }

    /// Events in time order.
    pub fn events(&self) -> &[ChordEvent] {
        &self.events
    }

    /// Iterate over the events.
    pub fn iter(&self) -> std::slice::Iter<'_, ChordEvent> {
        self.events.iter()
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether there are no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Duration of the underlying audio in seconds.
    pub fn duration(&self) -> f32 {
        self.duration
    }

    /// End time of event `idx` (next start, or the audio end).
    pub fn end_of(&self, idx: usize) -> f32 {
        end_of(&self.events, idx, self.duration)
    }

    /// Length of event `idx` in seconds.
    pub fn event_duration(&self, idx: usize) -> f32 {
        self.end_of(idx) - self.events[idx].start
    }

    /// Rendered labels in time order.
    pub fn labels(&self) -> Vec<String> {
        self.events.iter().map(|e| e.chord.to_string()).collect()
    }

    /// Seconds held by each root pitch class.
    pub fn root_durations(&self) -> [f32; SEMITONES] {
        let mut out = [0.0; SEMITONES];
        for (i, e) in self.events.iter().enumerate() {
            out[e.chord.root.index()] += self.event_duration(i);
        }
        out
    }

    /// Seconds of each root pitch class falling inside `[from, to)`.
    pub fn root_durations_within(&self, from: f32, to: f32) -> [f32; SEMITONES] {
        let mut out = [0.0; SEMITONES];
        for (i, e) in self.events.iter().enumerate() {
            let overlap = self.end_of(i).min(to) - e.start.max(from);
            if overlap > 0.0 {
                out[e.chord.root.index()] += overlap;
            }
        }
        out
    }

    /// Check ordering, label and range invariants.
    pub fn check_invariants(&self) -> Result<(), TimelineError> {
        for (index, e) in self.events.iter().enumerate() {
            if !(e.start >= 0.0 && e.start < self.duration) {
                return Err(TimelineError::OutOfRange {
                    index,
                    start: e.start,
                    duration: self.duration,
                });
            }
            if index == 0 {
                continue;
            }
            let prev = &self.events[index - 1];
            if e.start <= prev.start {
                return Err(TimelineError::OutOfOrder {
                    index,
                    start: e.start,
                    previous: prev.start,
                });
            }
            if e.chord == prev.chord {
                return Err(TimelineError::RepeatedLabel {
                    index,
                    label: e.chord.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Timeline {
    type Item = &'a ChordEvent;
    type IntoIter = std::slice::Iter<'a, ChordEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

fn end_of(events: &[ChordEvent], idx: usize, duration: f32) -> f32 {
    events.get(idx + 1).map_or(duration, |next| next.start)
}

fn finalize_pass(events: &[ChordEvent], duration: f32, params: &FinalizeParams) -> Vec<ChordEvent> {
    let mut out = events.to_vec();
    snap_to_beats(&mut out, duration, params);
    absorb_short(&mut out, duration, params);
    merge_identical(&mut out, duration);
    out
}

fn snap_to_beats(events: &mut [ChordEvent], duration: f32, params: &FinalizeParams) {
    if !(params.bpm.is_finite() && params.bpm > 0.0) {
        return;
    }
    let period = 60.0 / params.bpm;
    for i in 0..events.len() {
        let start = events[i].start;
        let snapped = (start / period).round() * period;
        if snapped == start || (snapped - start).abs() > params.snap_tolerance {
            continue;
        }
        let after_prev = i == 0 || snapped > events[i - 1].start;
        let before_next = events.get(i + 1).map_or(true, |next| snapped < next.start);
        if after_prev && before_next && snapped >= 0.0 && snapped < duration {
            events[i].start = snapped;
        }
    }
}

fn absorb_short(events: &mut Vec<ChordEvent>, duration: f32, params: &FinalizeParams) {
    let len = |ev: &[ChordEvent], i: usize| end_of(ev, i, duration) - ev[i].start;
    let short = |ev: &[ChordEvent], i: usize| {
        let d = len(ev, i);
        d < params.min_segment
            || (ev[i].confidence < params.weak_similarity && d < 2.0 * params.min_segment)
    };

    while events.len() > 1 {
        let ev: &[ChordEvent] = events.as_slice();
        let Some(idx) = (0..ev.len())
            .filter(|&i| short(ev, i))
            .min_by(|&a, &b| len(ev, a).total_cmp(&len(ev, b)).then(a.cmp(&b)))
        else {
            break;
        };

        let last = ev.len() - 1;
        let target = if idx == 0 {
            1
        } else if idx == last || len(ev, idx - 1) >= len(ev, idx + 1) {
            idx - 1
        } else {
            idx + 1
        };

        let (d_src, d_dst) = (len(ev, idx), len(ev, target));
        let merged_confidence = weighted(events[idx].confidence, d_src, events[target].confidence, d_dst);
        if target > idx {
            events[target].start = events[idx].start;
            events[target].frame = events[idx].frame;
        }
        events[target].confidence = merged_confidence;
        events.remove(idx);
    }
}

fn merge_identical(events: &mut Vec<ChordEvent>, duration: f32) {
    let ends: Vec<f32> = (0..events.len()).map(|i| end_of(events, i, duration)).collect();
    let mut out: Vec<(ChordEvent, f32)> = Vec::with_capacity(events.len());
    for (event, end) in events.iter().zip(ends) {
        match out.last_mut() {
            Some((prev, prev_end)) if prev.chord == event.chord => {
                let d_prev = *prev_end - prev.start;
                let d_next = end - event.start;
                prev.confidence = weighted(prev.confidence, d_prev, event.confidence, d_next);
                *prev_end = end;
            }
            _ => out.push((*event, end)),
        }
    }
    *events = out.into_iter().map(|(e, _)| e).collect();
}

fn weighted(a: f32, wa: f32, b: f32, wb: f32) -> f32 {
    let total = wa.max(0.0) + wb.max(0.0);
    if total > 0.0 {
        (a * wa.max(0.0) + b * wb.max(0.0)) / total
    } else {
        0.5 * (a + b)
    }
}
