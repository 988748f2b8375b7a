//! Per-run tone voicing.
//!
//! Before an instrument's synth loop runs, every one of its tones is
//! updated here: pin interpolation, transition and release handling,
//! vibrato and arpeggio, envelope evaluation, expression ramps, and
//! filter coefficient gradients. The synth loops then only advance
//! phases and multiply.

use crate::constants::{
    expression_to_gain, frequency_from_pitch, volume_to_gain, CHIP_BASE_EXPRESSION,
    CHIP_WAVES, CHORDS, DRUMSET_BASE_EXPRESSION, DRUM_COUNT, EXPRESSION_REFERENCE_PITCH,
    FM_BASE_EXPRESSION, GUITAR_BASE_EXPRESSION, HARMONICS_BASE_EXPRESSION, INTERVALS, MAX_PITCH,
    NOISE_BASE_EXPRESSION, NOISE_WAVES, OPERATOR_AMPLITUDE_MAX, OPERATOR_COUNT,
    OPERATOR_FREQUENCIES, PARTS_PER_BEAT, PITCH_DAMPING, PULSE_WIDTH_RANGE, PWM_BASE_EXPRESSION,
    RHYTHMS, SPECTRUM_BASE_EXPRESSION, TICKS_PER_PART, TRANSITIONS, VIBRATOS, VIBRATO_RAMP_TICKS,
    ALGORITHMS,
};
use crate::song::{Instrument, InstrumentKind, NotePin};
use crate::synth::envelope::{compute_envelope, envelope_at};
use crate::synth::tone::Tone;

/// Modulator output scale: an operator at full amplitude swings its
/// target's phase by two full cycles.
const MODULATOR_DEPTH: f64 = 2.0;
/// Scale applied to the FM feedback amplitude curve.
const FEEDBACK_DEPTH: f64 = 0.3;

/// Timing context for one sample run, prepared by the orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct RunContext {
    pub sample_rate: f64,
    pub samples_per_tick: f64,
    pub run_length: usize,
    pub seconds_per_tick: f64,
    /// Fractional position within the current bar at run start, in parts.
    pub part_in_bar: f64,
    /// Progress through the current tick at run start, 0..1.
    pub tick_fraction: f64,
    /// Song position in beats at run start.
    pub beats: f64,
    /// Seconds since playback started, for the vibrato LFO.
    pub seconds_elapsed: f64,
    /// Absolute tick counter since playback started.
    pub tick_counter: i64,
}

impl RunContext {
    /// Ticks this run spans.
    pub fn run_ticks(&self) -> f64 {
        self.run_length as f64 / self.samples_per_tick
    }
}

/// Interpolates a note's pins at a time measured in parts from the note
/// start. Returns (interval, raw expression 0..3).
fn interpolate_pins(pins: &[NotePin], time: f64) -> (f64, f64) {
    if pins.is_empty() {
        return (0.0, 3.0);
    }
    let first = &pins[0];
    if time <= first.time as f64 {
        return (first.interval as f64, first.expression as f64);
    }
    for pair in pins.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if time < b.time as f64 {
            let span = (b.time - a.time) as f64;
            let ratio = if span > 0.0 {
                (time - a.time as f64) / span
            } else {
                1.0
            };
            return (
                a.interval as f64 + (b.interval - a.interval) as f64 * ratio,
                a.expression as f64 + (b.expression - a.expression) as f64 * ratio,
            );
        }
    }
    let last = pins.last().unwrap();
    (last.interval as f64, last.expression as f64)
}

/// Sum-of-sines vibrato LFO at a point in time.
fn vibrato_lfo(periods: &[f64], seconds: f64) -> f64 {
    periods
        .iter()
        .map(|&p| (seconds * 2.0 * std::f64::consts::PI / p).sin())
        .sum::<f64>()
        / periods.len() as f64
}

/// FM operator amplitude curve: exponential so the slider's top half adds
/// most of the energy.
pub fn operator_amplitude_curve(amplitude: i32) -> f64 {
    (16.0_f64.powf(amplitude as f64 / OPERATOR_AMPLITUDE_MAX as f64) - 1.0) / 15.0
}

/// Computes every per-run parameter for one tone.
pub fn compute_tone(
    tone: &mut Tone,
    instrument: &Instrument,
    channel_octave: i32,
    is_noise: bool,
    rhythm: usize,
    ctx: &RunContext,
) {
    let transition = &TRANSITIONS[instrument.transition];
    let chord = &CHORDS[instrument.chord];
    let vibrato = &VIBRATOS[instrument.vibrato];
    let run_length = ctx.run_length.max(1) as f64;
    let run_ticks = ctx.run_ticks();
    let run_parts = run_ticks / TICKS_PER_PART as f64;
    let run_seconds = run_ticks * ctx.seconds_per_tick;

    let ticks_into_note = tone.ticks_since_note_start as f64 + ctx.tick_fraction;
    let seconds_start = ticks_into_note * ctx.seconds_per_tick;
    let seconds_end = seconds_start + run_seconds;
    let beats_end = ctx.beats + run_ticks / (TICKS_PER_PART * PARTS_PER_BEAT) as f64;

    // Pin interpolation, in note-relative parts.
    let (note_start, note_length_parts, pins): (i32, i32, &[NotePin]) = match tone.note.as_ref() {
        Some(note) => (note.start, note.end - note.start, &note.pins),
        None => (0, 0, &[]),
    };
    let part_in_note_start = if tone.note.is_some() {
        ctx.part_in_bar - note_start as f64
    } else {
        0.0
    };
    let part_in_note_end = part_in_note_start + run_parts;
    let (mut interval_start, raw_expr_start) = interpolate_pins(pins, part_in_note_start);
    let (mut interval_end, raw_expr_end) = interpolate_pins(pins, part_in_note_end);
    let mut note_expr_start = expression_to_gain(raw_expr_start);
    let mut note_expr_end = expression_to_gain(raw_expr_end);

    // Slide transitions blend pitch and expression with the neighboring
    // notes at both edges of the note.
    if transition.slides && tone.note.is_some() && !tone.live_input {
        let note_length_ticks = (note_length_parts * TICKS_PER_PART) as f64;
        let slide_ticks = (transition.slide_ticks as f64).min(note_length_ticks / 2.0);
        if slide_ticks > 0.0 {
            let base_pitch = tone.pitches[0];
            if let Some(prev) = tone.prev_note {
                let offset = (prev.pitch - base_pitch) as f64;
                let blend = |t: f64| (1.0 - t / slide_ticks).max(0.0);
                interval_start += offset * blend(ticks_into_note);
                interval_end += offset * blend(ticks_into_note + run_ticks);
                let expr = expression_to_gain(prev.expression as f64);
                note_expr_start += (expr - note_expr_start) * blend(ticks_into_note);
                note_expr_end += (expr - note_expr_end) * blend(ticks_into_note + run_ticks);
            }
            if let Some(next) = tone.next_note {
                let final_pitch = base_pitch + tone.final_interval();
                let offset = (next.pitch - final_pitch) as f64;
                let remaining = |t: f64| (note_length_ticks - t).max(0.0);
                let blend = |t: f64| (1.0 - remaining(t) / slide_ticks).max(0.0);
                interval_start += offset * blend(ticks_into_note);
                interval_end += offset * blend(ticks_into_note + run_ticks);
            }
        }
    }

    // Release fade.
    let mut release_start = 1.0;
    let mut release_end = 1.0;
    if tone.released {
        let release_ticks = transition.release_ticks.max(1) as f64;
        let ticks_rel = tone.ticks_since_released as f64 + ctx.tick_fraction;
        release_start = (1.0 - ticks_rel / release_ticks).max(0.0).powf(1.5);
        release_end = (1.0 - (ticks_rel + run_ticks) / release_ticks)
            .max(0.0)
            .powf(1.5);
        if tone.fade_out_fast {
            // Drop to silence within this very run.
            release_end = 0.0;
        }
    }

    // Attack ramp, skipped for seamless continuations.
    let mut attack_start = 1.0;
    let mut attack_end = 1.0;
    if transition.attack_seconds > 0.0 && !transition.is_seamless && !tone.released {
        attack_start = (seconds_start / transition.attack_seconds).min(1.0);
        attack_end = (seconds_end / transition.attack_seconds).min(1.0);
    }

    // Vibrato, ramped in after its delay.
    if vibrato.amplitude > 0.0 {
        let ramp = |ticks: f64| {
            ((ticks - vibrato.delay_ticks as f64) / VIBRATO_RAMP_TICKS).clamp(0.0, 1.0)
        };
        interval_start += vibrato.amplitude
            * vibrato_lfo(vibrato.periods_seconds, ctx.seconds_elapsed)
            * ramp(ticks_into_note);
        interval_end += vibrato.amplitude
            * vibrato_lfo(vibrato.periods_seconds, ctx.seconds_elapsed + run_seconds)
            * ramp(ticks_into_note + run_ticks);
    }

    // Arpeggio pitch selection.
    let mut pitch = tone.pitches[0];
    if chord.arpeggiates && tone.pitch_count > 1 {
        let rhythm = &RHYTHMS[rhythm];
        let pattern = rhythm.arpeggio_patterns[(tone.pitch_count - 1).min(3)];
        let step = (ctx.tick_counter / rhythm.ticks_per_arpeggio as i64).unsigned_abs() as usize;
        pitch = tone.pitches[pattern[step % pattern.len()].min(tone.pitch_count - 1)];
    }
    if instrument.kind == InstrumentKind::Drumset {
        pitch = pitch.clamp(0, DRUM_COUNT as i32 - 1);
    }
    let octave_offset = if is_noise { 0 } else { channel_octave * 12 };
    let played_pitch = (pitch + octave_offset).clamp(0, MAX_PITCH + 12);

    // Frequency and the per-sample exponential pitch slide.
    let interval_delta_per_sample = (interval_end - interval_start) / run_length;
    let phase_delta_scale = 2.0_f64.powf(interval_delta_per_sample / 12.0);
    let pitched = played_pitch as f64 + interval_start;

    // Main filter cascade, with the filter envelope scaling each point's
    // frequency setting.
    let filter_envelope = envelope_at(instrument.filter_envelope);
    let filter_env_start =
        compute_envelope(filter_envelope, seconds_start, ctx.beats, note_expr_start);
    let filter_env_end =
        compute_envelope(filter_envelope, seconds_end, beats_end, note_expr_end);
    tone.filter_count = instrument.filter.points.len().min(tone.filters.len());
    for (i, point) in instrument.filter.points.iter().take(tone.filter_count).enumerate() {
        let start = point.to_coefficients(ctx.sample_rate, filter_env_start);
        let end = point.to_coefficients(ctx.sample_rate, filter_env_end);
        tone.filters[i].load_coefficients_with_gradient(&start, &end, 1.0 / run_length);
    }
    let filter_volume = instrument.filter.volume_compensation();

    // Settings-level expression shared by every kind.
    let volume_gain = volume_to_gain(instrument.volume);
    let chord_expression = if !chord.single_tone && tone.chord_size > 1 {
        1.0 / (tone.chord_size as f64).sqrt()
    } else {
        1.0
    };
    let life_start = release_start * attack_start;
    let life_end = release_end * attack_end;

    match instrument.kind {
        InstrumentKind::Fm => {
            let algorithm = &ALGORITHMS[instrument.algorithm];
            let mut sine_boost = 1.0;
            for op in algorithm.carrier_count..OPERATOR_COUNT {
                sine_boost *= 1.0
                    - (instrument.operators[op].amplitude as f64 / OPERATOR_AMPLITUDE_MAX as f64)
                        .min(1.0);
            }
            let carrier_boost = 1.0 + sine_boost * 3.0;

            for op in 0..OPERATOR_COUNT {
                let operator = &instrument.operators[op];
                let freq_def = &OPERATOR_FREQUENCIES[operator.frequency];
                let op_pitch = if chord.custom_interval && op < tone.pitch_count {
                    tone.pitches[op] + octave_offset
                } else {
                    played_pitch
                };
                let hz = frequency_from_pitch(op_pitch as f64 + interval_start) * freq_def.mult
                    + freq_def.hz_offset;
                tone.phase_delta[op] = hz.max(0.0) / ctx.sample_rate;
                tone.phase_delta_scale[op] = phase_delta_scale;

                let amplitude = operator_amplitude_curve(operator.amplitude);
                let envelope = envelope_at(operator.envelope);
                let env_start =
                    compute_envelope(envelope, seconds_start, ctx.beats, note_expr_start);
                let env_end = compute_envelope(envelope, seconds_end, beats_end, note_expr_end);
                let (start, end) = if op < algorithm.carrier_count {
                    let damping = 2.0_f64
                        .powf(-(op_pitch as f64 - EXPRESSION_REFERENCE_PITCH) / PITCH_DAMPING);
                    let settings = FM_BASE_EXPRESSION
                        * volume_gain
                        * filter_volume
                        * chord_expression
                        * carrier_boost
                        * damping
                        * amplitude;
                    (
                        settings * env_start * note_expr_start * life_start,
                        settings * env_end * note_expr_end * life_end,
                    )
                } else {
                    (
                        MODULATOR_DEPTH * amplitude * env_start,
                        MODULATOR_DEPTH * amplitude * env_end,
                    )
                };
                tone.expression_start[op] = start;
                tone.expression_delta[op] = (end - start) / run_length;
            }

            let feedback_amplitude =
                FEEDBACK_DEPTH * operator_amplitude_curve(instrument.feedback_amplitude);
            let feedback_envelope = envelope_at(instrument.feedback_envelope);
            let feedback_start = feedback_amplitude
                * compute_envelope(feedback_envelope, seconds_start, ctx.beats, note_expr_start);
            let feedback_end = feedback_amplitude
                * compute_envelope(feedback_envelope, seconds_end, beats_end, note_expr_end);
            tone.feedback_start = feedback_start;
            tone.feedback_delta = (feedback_end - feedback_start) / run_length;
        }
        _ => {
            let interval_def = &INTERVALS[instrument.interval];
            let (base, wave_expression) = match instrument.kind {
                InstrumentKind::Chip => (
                    CHIP_BASE_EXPRESSION,
                    CHIP_WAVES[instrument.chip_wave].expression,
                ),
                InstrumentKind::Harmonics => (HARMONICS_BASE_EXPRESSION, 1.0),
                InstrumentKind::Pwm => (PWM_BASE_EXPRESSION, 1.0),
                InstrumentKind::Guitar => (GUITAR_BASE_EXPRESSION, 1.0),
                InstrumentKind::Noise => (
                    NOISE_BASE_EXPRESSION,
                    NOISE_WAVES[instrument.noise_wave].expression,
                ),
                InstrumentKind::Spectrum => (SPECTRUM_BASE_EXPRESSION, 1.0),
                InstrumentKind::Drumset => (DRUMSET_BASE_EXPRESSION, 1.0),
                InstrumentKind::Fm => unreachable!(),
            };
            let uses_interval = matches!(
                instrument.kind,
                InstrumentKind::Chip | InstrumentKind::Harmonics
            );
            let interval_expression = if uses_interval {
                interval_def.expression
            } else {
                1.0
            };
            let settings = base * volume_gain * filter_volume * chord_expression
                * interval_expression;
            let expr_start = settings * note_expr_start * life_start;
            let expr_end = settings * note_expr_end * life_end;
            tone.expression_start[0] = expr_start;
            tone.expression_delta[0] = (expr_end - expr_start) / run_length;
            tone.interval_sign = interval_def.sign;

            match instrument.kind {
                InstrumentKind::Chip | InstrumentKind::Harmonics => {
                    // Two oscillators straddling the played pitch.
                    let (pitch_a, pitch_b) =
                        if chord.custom_interval && tone.pitch_count > 1 {
                            (
                                pitched,
                                (tone.pitches[1] + octave_offset) as f64 + interval_start,
                            )
                        } else {
                            (
                                pitched + interval_def.offset - interval_def.spread,
                                pitched + interval_def.offset + interval_def.spread,
                            )
                        };
                    tone.phase_delta[0] = frequency_from_pitch(pitch_a) / ctx.sample_rate;
                    tone.phase_delta[1] = frequency_from_pitch(pitch_b) / ctx.sample_rate;
                    tone.phase_delta_scale[0] = phase_delta_scale;
                    tone.phase_delta_scale[1] = phase_delta_scale;
                }
                InstrumentKind::Pwm => {
                    tone.phase_delta[0] = frequency_from_pitch(pitched) / ctx.sample_rate;
                    tone.phase_delta_scale[0] = phase_delta_scale;
                    let width_base = (instrument.pulse_width + 1) as f64
                        / (PULSE_WIDTH_RANGE + 1) as f64
                        * 0.5;
                    let envelope = envelope_at(instrument.pulse_envelope);
                    let width_start = (width_base
                        * compute_envelope(envelope, seconds_start, ctx.beats, note_expr_start))
                    .clamp(0.01, 0.5);
                    let width_end = (width_base
                        * compute_envelope(envelope, seconds_end, beats_end, note_expr_end))
                    .clamp(0.01, 0.5);
                    tone.pulse_width_start = width_start;
                    tone.pulse_width_delta = (width_end - width_start) / run_length;
                }
                InstrumentKind::Guitar => {
                    tone.phase_delta[0] = frequency_from_pitch(pitched) / ctx.sample_rate;
                    tone.phase_delta_scale[0] = phase_delta_scale;
                }
                InstrumentKind::Noise | InstrumentKind::Spectrum | InstrumentKind::Drumset => {
                    // Noise pitches step six semitones so the channel's
                    // twelve rows span six octaves.
                    let wave = &NOISE_WAVES[instrument.noise_wave.min(NOISE_WAVES.len() - 1)];
                    let noise_midi = 12.0 + pitch as f64 * 6.0 + interval_start;
                    let speed = frequency_from_pitch(noise_midi)
                        / frequency_from_pitch(wave.base_pitch as f64);
                    tone.phase_delta[0] = speed;
                    tone.phase_delta_scale[0] = phase_delta_scale;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::{Instrument, InstrumentKind};
    use crate::synth::tone::ToneNote;
    use approx::assert_relative_eq;

    fn context(run_length: usize) -> RunContext {
        let sample_rate = 44100.0;
        let samples_per_tick = sample_rate / (2.0 * 24.0 * 150.0 / 60.0);
        RunContext {
            sample_rate,
            samples_per_tick,
            run_length,
            seconds_per_tick: samples_per_tick / sample_rate,
            part_in_bar: 0.0,
            tick_fraction: 0.0,
            beats: 0.0,
            seconds_elapsed: 0.0,
            tick_counter: 0,
        }
    }

    fn flat_tone(pitch: i32) -> Tone {
        let mut tone = Tone::default();
        tone.reset();
        tone.pitches[0] = pitch;
        tone.pitch_count = 1;
        tone.chord_size = 1;
        tone.note = Some(ToneNote {
            start: 0,
            end: 24,
            pins: vec![
                crate::song::NotePin::new(0, 0, 3),
                crate::song::NotePin::new(24, 0, 3),
            ],
        });
        tone
    }

    #[test]
    fn test_chip_phase_delta_matches_pitch() {
        let mut tone = flat_tone(69);
        let instrument = Instrument::new(InstrumentKind::Chip);
        let ctx = context(128);
        compute_tone(&mut tone, &instrument, 0, false, 1, &ctx);
        // Union interval: both oscillators at 440 Hz.
        assert_relative_eq!(tone.phase_delta[0] * 44100.0, 440.0, epsilon = 1e-6);
        assert_relative_eq!(tone.phase_delta[1] * 44100.0, 440.0, epsilon = 1e-6);
        assert!(tone.expression_start[0] > 0.0);
        assert_relative_eq!(tone.phase_delta_scale[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_bend_produces_phase_delta_scale() {
        let mut tone = flat_tone(60);
        tone.note.as_mut().unwrap().pins = vec![
            crate::song::NotePin::new(0, 0, 3),
            crate::song::NotePin::new(24, 12, 3),
        ];
        let instrument = Instrument::new(InstrumentKind::Chip);
        let ctx = context(256);
        compute_tone(&mut tone, &instrument, 0, false, 1, &ctx);
        // Rising bend: phase delta grows per sample.
        assert!(tone.phase_delta_scale[0] > 1.0);
    }

    #[test]
    fn test_fm_default_is_single_carrier() {
        let mut tone = flat_tone(48);
        let instrument = Instrument::new(InstrumentKind::Fm);
        let ctx = context(128);
        compute_tone(&mut tone, &instrument, 0, false, 1, &ctx);
        assert!(tone.expression_start[0] > 0.0, "carrier is audible");
        for op in 1..OPERATOR_COUNT {
            assert_eq!(tone.expression_start[op], 0.0, "silent modulators");
        }
        assert_relative_eq!(
            tone.phase_delta[0] * 44100.0,
            frequency_from_pitch(48.0),
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_released_tone_fades() {
        let mut tone = flat_tone(60);
        tone.released = true;
        tone.ticks_since_released = 0;
        let mut instrument = Instrument::new(InstrumentKind::Chip);
        instrument.transition = 6; // medium fade, 72 release ticks
        let ctx = context(459);
        compute_tone(&mut tone, &instrument, 0, false, 1, &ctx);
        let fresh_expression = tone.expression_start[0];
        assert!(fresh_expression > 0.0);
        tone.ticks_since_released = 71;
        compute_tone(&mut tone, &instrument, 0, false, 1, &ctx);
        assert!(tone.expression_start[0] < fresh_expression * 0.05);
    }

    #[test]
    fn test_fade_out_fast_reaches_zero_within_run() {
        let mut tone = flat_tone(60);
        tone.released = true;
        tone.fade_out_fast = true;
        let instrument = Instrument::new(InstrumentKind::Chip);
        let ctx = context(100);
        compute_tone(&mut tone, &instrument, 0, false, 1, &ctx);
        let end = tone.expression_start[0] + tone.expression_delta[0] * 100.0;
        assert!(end.abs() < 1e-9);
    }

    #[test]
    fn test_arpeggio_cycles_pitches() {
        let mut tone = flat_tone(60);
        tone.pitches = [60, 64, 67, 0];
        tone.pitch_count = 3;
        tone.chord_size = 3;
        let mut instrument = Instrument::new(InstrumentKind::Chip);
        instrument.chord = 2; // arpeggio
        let mut deltas = Vec::new();
        for step in 0..3 {
            let mut ctx = context(128);
            ctx.tick_counter = step * RHYTHMS[1].ticks_per_arpeggio as i64;
            compute_tone(&mut tone, &instrument, 0, false, 1, &ctx);
            deltas.push(tone.phase_delta[0]);
        }
        assert!(deltas[0] < deltas[1] && deltas[1] < deltas[2]);
    }

    #[test]
    fn test_filters_loaded_from_instrument() {
        let mut tone = flat_tone(60);
        let mut instrument = Instrument::new(InstrumentKind::Chip);
        instrument.filter.points.push(crate::song::FilterControlPoint::new(
            crate::song::FilterType::LowPass,
            20,
            7,
        ));
        let ctx = context(128);
        compute_tone(&mut tone, &instrument, 0, false, 1, &ctx);
        assert_eq!(tone.filter_count, 1);
    }
}
