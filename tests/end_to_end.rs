//! End-to-end rendering scenarios at 44100 Hz with default song
//! constants.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use chipbox::constants::PARTS_PER_BEAT;
use chipbox::song::{EffectFlags, Instrument, InstrumentKind};
use chipbox::{Note, Song, Synth};

const SAMPLE_RATE: f64 = 44_100.0;

fn song_with_note(kind: InstrumentKind, pitch: i32, parts: i32, tempo: i32) -> Song {
    let mut song = Song::default();
    song.tempo = tempo;
    let channel = if kind.is_noise() {
        song.pitch_channel_count
    } else {
        0
    };
    song.channels[channel].instruments[0] = Instrument::new(kind);
    song.channels[channel].bars[0] = 1;
    song.channels[channel].patterns[0]
        .notes
        .push(Note::new(vec![pitch], 0, parts, 3));
    song
}

/// Interpolated rising-zero-crossing frequency estimate over a span of a
/// steady tone.
fn measure_frequency(samples: &[f32]) -> f64 {
    let mut first: Option<f64> = None;
    let mut last = 0.0f64;
    let mut count = 0usize;
    for (i, pair) in samples.windows(2).enumerate() {
        if pair[0] <= 0.0 && pair[1] > 0.0 {
            let frac = -pair[0] as f64 / (pair[1] - pair[0]) as f64;
            let position = i as f64 + frac;
            if first.is_none() {
                first = Some(position);
            }
            last = position;
            count += 1;
        }
    }
    let first = first.expect("no zero crossings found");
    assert!(count > 2, "need several cycles to measure");
    (count - 1) as f64 * SAMPLE_RATE / (last - first)
}

fn cents_between(a: f64, b: f64) -> f64 {
    (a / b).log2().abs() * 1200.0
}

/// Fraction of spectral energy within `spread` bins of the strongest bin.
fn spectral_concentration(samples: &[f32], spread: usize) -> f64 {
    let len = 1usize << 14;
    let mut spectrum: Vec<Complex<f64>> = samples[..len]
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            // Hann window against leakage.
            let w = 0.5 - 0.5 * (std::f64::consts::TAU * i as f64 / len as f64).cos();
            Complex::new(s as f64 * w, 0.0)
        })
        .collect();
    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(len).process(&mut spectrum);
    let magnitudes: Vec<f64> = spectrum[..len / 2].iter().map(|c| c.norm_sqr()).collect();
    let peak = magnitudes
        .iter()
        .enumerate()
        .skip(2)
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap();
    let total: f64 = magnitudes.iter().skip(2).sum();
    let near: f64 = magnitudes[peak.saturating_sub(spread)..(peak + spread).min(len / 2)]
        .iter()
        .sum();
    near / total.max(1.0e-30)
}

#[test]
fn e1_empty_song_is_exact_silence() {
    let (left, right) = Synth::render(Song::default(), 2.0, SAMPLE_RATE);
    assert_eq!(left.len(), 88200);
    assert!(left.iter().all(|&s| s == 0.0));
    assert!(right.iter().all(|&s| s == 0.0));
}

#[test]
fn e2_chip_square_quarter_note_at_middle_c() {
    // One quarter note at 120 BPM lasts half a second.
    let mut song = song_with_note(InstrumentKind::Chip, 60, PARTS_PER_BEAT, 120);
    song.channels[0].instruments[0].chip_wave = 2; // square
    let (left, right) = Synth::render(song, 1.0, SAMPLE_RATE);

    let peak = left
        .iter()
        .chain(right.iter())
        .fold(0.0f32, |m, &s| m.max(s.abs()));
    assert!((0.05..=0.9).contains(&peak), "peak {peak}");

    // Measure the fundamental over the sustained middle of the note.
    let measured = measure_frequency(&left[8820..17640]);
    let cents = cents_between(measured, 261.6256);
    assert!(cents < 1.0, "off by {cents} cents ({measured} Hz)");
}

#[test]
fn e3_fm_single_operator_is_a_pure_sinusoid() {
    let mut song = song_with_note(InstrumentKind::Fm, 48, PARTS_PER_BEAT * 2, 120);
    let instrument = &mut song.channels[0].instruments[0];
    instrument.algorithm = 0;
    instrument.operators[0].amplitude = 10;
    instrument.operators[0].frequency = 0; // 1×
    instrument.operators[0].envelope = 1; // steady
    for op in 1..4 {
        instrument.operators[op].amplitude = 0;
    }
    instrument.feedback_amplitude = 0;
    let (left, _) = Synth::render(song, 1.0, SAMPLE_RATE);

    let measured = measure_frequency(&left[8820..26460]);
    let cents = cents_between(measured, 130.8128);
    assert!(cents < 1.0, "off by {cents} cents ({measured} Hz)");

    let concentration = spectral_concentration(&left[8820..], 6);
    assert!(concentration > 0.98, "not a sinusoid: {concentration}");
}

#[test]
fn e4_guitar_envelope_decays_monotonically() {
    let mut song = song_with_note(InstrumentKind::Guitar, 48, PARTS_PER_BEAT * 8, 120);
    song.channels[0].instruments[0].sustain = 6;
    let (left, _) = Synth::render(song, 2.0, SAMPLE_RATE);

    // RMS over 10 ms windows.
    let window = 441;
    let rms: Vec<f64> = left
        .chunks(window)
        .map(|chunk| {
            (chunk.iter().map(|&s| s as f64 * s as f64).sum::<f64>() / chunk.len() as f64).sqrt()
        })
        .collect();
    let peak = rms.iter().cloned().fold(0.0f64, f64::max);

    // Monotonically decreasing after 50 ms, judged over 100 ms spans so
    // the string's beating does not count as a rise.
    let spans: Vec<f64> = rms[5..]
        .chunks(10)
        .map(|chunk| chunk.iter().cloned().fold(0.0f64, f64::max))
        .collect();
    for (i, pair) in spans.windows(2).enumerate() {
        assert!(
            pair[1] <= pair[0] * 1.05 + 1.0e-9,
            "envelope rises at span {i}: {} -> {}",
            pair[0],
            pair[1]
        );
    }

    // Below 10% of its peak by the end.
    let tail = rms[rms.len() - 5..].iter().cloned().fold(0.0f64, f64::max);
    assert!(tail < peak * 0.1, "tail {tail} vs peak {peak}");
}

#[test]
fn e5_generated_fixture_round_trips_byte_identically() {
    let mut song = Song::default();
    song.tempo = 140;
    song.channels[0].bars[0] = 1;
    song.channels[0].patterns[0]
        .notes
        .push(Note::new(vec![60, 67], 0, 48, 3));
    let fixture = song.to_url();
    let decoded = Song::from_url(&fixture).unwrap();
    assert_eq!(decoded.to_url(), fixture, "byte-identical re-encoding");
    assert_eq!(Song::from_url(&decoded.to_url()).unwrap(), decoded);
}

#[test]
fn e6_full_right_pan_silences_left_channel() {
    let mut song = song_with_note(InstrumentKind::Chip, 60, PARTS_PER_BEAT * 4, 120);
    let instrument = &mut song.channels[0].instruments[0];
    instrument.effects = EffectFlags::PANNING;
    instrument.pan = chipbox::constants::PAN_MAX;
    let (left, right) = Synth::render(song, 1.5, SAMPLE_RATE);
    let left_rms: f64 = left.iter().map(|&s| s as f64 * s as f64).sum::<f64>().sqrt();
    let right_rms: f64 = right.iter().map(|&s| s as f64 * s as f64).sum::<f64>().sqrt();
    assert!(
        left_rms < right_rms * 0.1,
        "left {left_rms} vs right {right_rms}"
    );
}

#[test]
fn legacy_urls_decode_identically_every_time() {
    // A version 7 song: modern effects bitmask, legacy one-char filter.
    let url = "7n11s0k0a8g00j0r1i1t2ml00e00o00T0v0u00q4f6y2z1w4m2T2v0u00q0f5y0z1w0b0p110";
    let first = Song::from_url(url).unwrap();
    let second = Song::from_url(url).unwrap();
    assert_eq!(first, second);
    // Re-encoding at the latest version preserves the model.
    let reencoded = Song::from_url(&first.to_url()).unwrap();
    assert_eq!(reencoded, first);
}
