//! Integration tests for chord, key and tonic detection on synthesised audio.

use chord_timeline::config::HarmonyMode;
use chord_timeline::timeline::FinalizeParams;
use chord_timeline::{
    detect, AudioInput, BassDetail, BassDetailDetector, CancelToken, CollaboratorError, DetectError,
    DetectOptions, Detector, Key, Mode, NoteName, Progress, Stage, Timeline,
};
use lazy_static::lazy_static;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use std::f32::consts::PI;
use std::sync::{Arc, Mutex};

const AMPLITUDE: f32 = 0.2;

/// Sum of sines at `freqs`, starting `offset` samples into a continuous signal.
fn tone(freqs: &[f32], seconds: f32, rate: u32, offset: usize) -> Vec<f32> {
    let n = (seconds * rate as f32).round() as usize;
    (offset..offset + n)
        .map(|i| {
            let t = i as f32 / rate as f32;
            freqs.iter().map(|f| AMPLITUDE * (2.0 * PI * f * t).sin()).sum()
        })
        .collect()
}

/// Chords of `seconds` each, played back to back.
fn progression(chords: &[&[f32]], seconds: f32, rate: u32) -> Vec<f32> {
    let mut out = Vec::new();
    for freqs in chords {
        let offset = out.len();
        out.extend(tone(freqs, seconds, rate, offset));
    }
    out
}

const C_MAJOR: [f32; 3] = [261.63, 329.63, 392.00];
const A_MINOR: [f32; 3] = [220.00, 261.63, 329.63];
const F_MAJOR: [f32; 3] = [174.61, 220.00, 261.63];
const E_MINOR: [f32; 3] = [164.81, 392.00, 493.88];
const G_MAJOR_LOW: [f32; 3] = [196.00, 293.66, 493.88];
const C_MAJOR_LOW: [f32; 3] = [130.81, 329.63, 392.00];

/// A single sustained chord and what it should analyse to.
#[derive(Debug, Clone)]
struct Case {
    name: &'static str,
    samples: Vec<f32>,
    rate: u32,
    label: &'static str,
    root: NoteName,
    mode: Mode,
}

lazy_static! {
    static ref SUSTAINED: Vec<Case> = vec![
        Case {
            name: "C major triad",
            samples: tone(&C_MAJOR, 5.0, 22_050, 0),
            rate: 22_050,
            label: "C",
            root: NoteName::C,
            mode: Mode::Major,
        },
        Case {
            name: "A minor triad",
            samples: tone(&A_MINOR, 5.0, 22_050, 0),
            rate: 22_050,
            label: "Am",
            root: NoteName::A,
            mode: Mode::Minor,
        },
        Case {
            name: "F major triad at 44.1 kHz",
            samples: tone(&F_MAJOR, 4.0, 44_100, 0),
            rate: 44_100,
            label: "F",
            root: NoteName::F,
            mode: Mode::Major,
        },
        Case {
            name: "E minor triad at 48 kHz",
            samples: tone(&E_MINOR, 4.0, 48_000, 0),
            rate: 48_000,
            label: "Em",
            root: NoteName::E,
            mode: Mode::Minor,
        },
    ];
    static ref G_C_LOOP: Vec<f32> = {
        let chords: Vec<&[f32]> = (0..8).flat_map(|_| [&G_MAJOR_LOW[..], &C_MAJOR_LOW[..]]).collect();
        progression(&chords, 1.0, 22_050)
    };
    static ref SILENCE: Vec<f32> = vec![0.0; 10 * 22_050];
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn finalize_params(result_duration: f32, bpm: f32, options: &DetectOptions) -> FinalizeParams {
    FinalizeParams {
        duration: result_duration,
        bpm,
        min_segment: options.decoder.min_segment_seconds,
        weak_similarity: options.decoder.weak_similarity,
        snap_tolerance: options.decoder.snap_tolerance_seconds,
    }
}

#[test]
fn test_sustained_chords() {
    init_logging();
    let failures = Arc::new(Mutex::new(Vec::<String>::new()));

    SUSTAINED.par_iter().for_each(|case| {
        let result = match detect(&case.samples, case.rate, &DetectOptions::default()) {
            Ok(result) => result,
            Err(e) => {
                failures.lock().unwrap().push(format!("{}: error {e}", case.name));
                return;
            }
        };
        let labels = result.chords.labels();
        let key_ok = result.key.root == case.root && result.key.mode == case.mode;
        if labels != [case.label] || !key_ok {
            failures.lock().unwrap().push(format!(
                "{}\nexpected = {} in {} {}\nactual = {:?} in {}\n",
                case.name, case.label, case.root, case.mode, labels, result.key
            ));
        }
        if let Err(e) = result.chords.check_invariants() {
            failures.lock().unwrap().push(format!("{}: {e}", case.name));
        }
    });

    let failures = Arc::try_unwrap(failures).unwrap().into_inner().unwrap();
    if !failures.is_empty() {
        panic!("{} chord tests failed:\n\n{}", failures.len(), failures.join("\n"));
    }
}

#[test]
fn single_triad_is_one_event_from_zero() {
    let result = detect(&SUSTAINED[0].samples, 22_050, &DetectOptions::default()).unwrap();
    assert_eq!(result.chords.len(), 1);
    let event = result.chords.events()[0];
    assert_eq!(event.start, 0.0);
    assert!(event.confidence > 0.5);
    assert!((result.duration - 5.0).abs() < 1e-3);
    assert_eq!(result.tonic.root, NoteName::C);
}

#[test]
fn dominant_loop_settles_in_c_major() {
    init_logging();
    let options = DetectOptions::default();
    let result = detect(&G_C_LOOP, 22_050, &options).unwrap();

    assert_eq!(result.key.root, NoteName::C, "key was {}", result.key);
    assert_eq!(result.key.mode, Mode::Major);
    assert_eq!(result.tonic.root, NoteName::C);

    let labels = result.chords.labels();
    assert!(labels.len() >= 8, "{labels:?}");
    assert_eq!(labels.first().map(String::as_str), Some("G"));
    assert!(labels.iter().all(|l| l == "G" || l == "C"), "{labels:?}");
    assert!(result.chords.check_invariants().is_ok());
    assert!(result.stats.key_changes <= options.max_key_changes);
    assert_eq!(result.stats.decode_passes, result.stats.key_changes + 1);
}

#[test]
fn silence_has_no_chords() {
    let result = detect(&SILENCE, 22_050, &DetectOptions::default()).unwrap();
    assert!(result.chords.is_empty());
    assert_eq!(result.bpm, 120.0);
    assert!(result.key.confidence < 1e-3);
    assert!((result.duration - 10.0).abs() < 1e-3);
    assert_eq!(result.stats.frames, 99);
    assert_eq!(result.stats.events, 0);
}

#[test]
fn loud_input_is_not_silence() {
    let loud: Vec<f32> = SUSTAINED[0].samples.iter().map(|x| x * 1e30).collect();
    let result = detect(&loud, 22_050, &DetectOptions::default()).unwrap();
    assert_eq!(result.chords.labels(), vec!["C".to_string()]);
    assert_eq!(result.key.root, NoteName::C);
    assert!(result.key.confidence > 0.0);
    assert!(result.bpm.is_finite());
}

#[test]
fn analysis_is_deterministic_and_final() {
    let options = DetectOptions::default();
    let first = detect(&G_C_LOOP, 22_050, &options).unwrap();
    let second = detect(&G_C_LOOP, 22_050, &options).unwrap();
    assert_eq!(first.chords, second.chords);
    assert_eq!(first.key, second.key);
    assert_eq!(first.tonic, second.tonic);
    assert_eq!(first.stats, second.stats);

    let params = finalize_params(first.duration, first.bpm, &options);
    assert_eq!(first.chords.refinalize(&params), first.chords);
}

#[test]
fn timeline_stays_inside_the_audio() {
    let result = detect(&G_C_LOOP, 22_050, &DetectOptions::default()).unwrap();
    let events = result.chords.events();
    assert!(events.windows(2).all(|w| w[0].start < w[1].start));
    assert!(events.iter().all(|e| e.start >= 0.0 && e.start < result.duration));
    let covered: f32 = (0..events.len()).map(|i| result.chords.event_duration(i)).sum();
    assert!(covered <= result.duration + 1e-3);
}

#[test]
fn options_parse_from_camel_case_json() {
    let json = r#"{
        "bassMultiplier": 1.5,
        "harmonyMode": "jazz",
        "tonicRerunThreshold": 80,
        "decoder": { "restrictToKey": true }
    }"#;
    let options: DetectOptions = serde_json::from_str(json).unwrap();
    assert_eq!(options.bass_multiplier, 1.5);
    assert_eq!(options.harmony_mode, HarmonyMode::Jazz);
    assert_eq!(options.tonic_rerun_threshold, 80.0);
    assert!(options.decoder.restrict_to_key);
    assert_eq!(options.extension_multiplier, 1.0);
    assert_eq!(options.max_key_changes, 2);

    let result = detect(&SUSTAINED[1].samples, 22_050, &options).unwrap();
    assert_eq!(result.chords.labels(), vec!["Am".to_string()]);
}

#[test]
fn result_serialises_to_json() {
    let result = detect(&SUSTAINED[0].samples, 22_050, &DetectOptions::default()).unwrap();
    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["key"]["root"], "C");
    assert_eq!(value["key"]["mode"], "major");
    assert_eq!(value["chords"]["events"][0]["chord"]["quality"], "major");
    assert!(value["stats"]["decodePasses"].as_u64().unwrap() >= 1);
    assert!(value["bpm"].is_number());
}

struct ThirdInBass;

impl BassDetailDetector for ThirdInBass {
    fn detect(
        &self,
        _audio: AudioInput<'_>,
        timeline: &Timeline,
        _key: &Key,
        _options: &DetectOptions,
    ) -> Result<Vec<BassDetail>, CollaboratorError> {
        Ok(timeline
            .iter()
            .map(|e| BassDetail {
                bass: e.chord.root.transpose(4),
                confidence: 0.9,
            })
            .collect())
    }
}

#[test]
fn bass_detail_adds_inversions() {
    let detector = Detector::builder().bass_detail(ThirdInBass).build().unwrap();
    let plain = detect(&SUSTAINED[0].samples, 22_050, &DetectOptions::default()).unwrap();
    let result = detector.detect(&SUSTAINED[0].samples, 22_050).unwrap();
    assert_eq!(result.chords.labels(), vec!["C/E".to_string()]);
    assert_eq!(result.stats.bass_annotations, 1);
    assert_eq!(result.chords.events()[0].start, plain.chords.events()[0].start);
}

#[test]
fn progress_reaches_done() {
    let seen = Arc::new(Mutex::new(Vec::<Progress>::new()));
    let sink = Arc::clone(&seen);
    let detector = Detector::builder()
        .progress(move |p: &Progress| sink.lock().unwrap().push(*p))
        .build()
        .unwrap();
    detector.detect(&G_C_LOOP, 22_050).unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen.windows(2).all(|w| w[0].progress <= w[1].progress));
    for stage in [Stage::Features, Stage::Key, Stage::Decode, Stage::KeyRevalidation, Stage::Tonic, Stage::Done] {
        assert!(seen.iter().any(|p| p.stage == stage), "missing {stage:?}");
    }
    assert_eq!(seen.last().map(|p| p.progress), Some(1.0));
}

#[test]
fn cancellation_mid_analysis() {
    let token = CancelToken::new();
    let trigger = token.clone();
    let detector = Detector::builder()
        .cancel_token(token)
        .progress(move |p: &Progress| {
            if p.stage == Stage::Key {
                trigger.cancel();
            }
        })
        .build()
        .unwrap();
    let result = detector.detect(&SUSTAINED[0].samples, 22_050);
    assert!(matches!(result, Err(DetectError::Cancelled(_))));
}

#[test]
fn basic_and_jazz_modes_agree_without_collaborators() {
    let basic = detect(&G_C_LOOP, 22_050, &DetectOptions::default()).unwrap();
    let jazz = detect(
        &G_C_LOOP,
        22_050,
        &DetectOptions {
            harmony_mode: HarmonyMode::Jazz,
            ..DetectOptions::default()
        },
    )
    .unwrap();
    assert_eq!(basic.chords, jazz.chords);
}
