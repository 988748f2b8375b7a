//! Per-instrument synth inner loops.
//!
//! Each loop renders one tone into the instrument's mono scratch buffer,
//! summing with whatever other tones already wrote there. Everything
//! data-dependent (frequencies, expressions, envelopes, filter
//! gradients) was precomputed by the voicing stage; the loops only
//! advance phases, look up tables, filter, and accumulate. There are no
//! indirect calls inside the sample loops.

use rand::Rng;
use rand_pcg::Pcg32;

use crate::constants::{
    ALGORITHMS, DRUM_COUNT, FEEDBACKS, GUITAR_PULSE_WIDTH_RANDOMNESS, GUITAR_PULSE_WIDTH_RANGE,
    GUITAR_SUSTAIN_RANGE, NOISE_WAVES, OPERATOR_COUNT, SINE_WAVE_LENGTH,
};
use crate::dsp::filter::{radians_per_sample, FilterCoefficients};
use crate::dsp::wave::nearest_zero_crossing;
use crate::dsp::WaveBank;
use crate::song::{Instrument, InstrumentKind};
use crate::synth::tone::{GuitarString, Tone};

/// Waves that depend on instrument settings, cached by the instrument's
/// runtime state and rebuilt when the settings change.
#[derive(Debug, Default)]
pub struct InstrumentWaves {
    /// Integrated harmonics wave (chip-style reader).
    pub harmonics: Option<Vec<f32>>,
    /// Spectrum wave (noise-style reader).
    pub spectrum: Option<Vec<f32>>,
    /// One spectrum wave per drum.
    pub drums: Vec<Option<Vec<f32>>>,
}

#[inline]
fn apply_filters(tone: &mut Tone, sample: f64) -> f64 {
    let mut value = sample;
    for filter in tone.filters.iter_mut().take(tone.filter_count) {
        value = filter.process(value);
    }
    value
}

/// Renders one tone of `instrument` into `buffer`, adding to it.
pub fn render_tone(
    tone: &mut Tone,
    instrument: &Instrument,
    bank: &WaveBank,
    waves: &InstrumentWaves,
    rng: &mut Pcg32,
    sample_rate: f64,
    buffer: &mut [f32],
) {
    match instrument.kind {
        InstrumentKind::Chip => {
            let wave = bank.chip_wave(instrument.chip_wave);
            chip_synth(tone, wave, buffer);
        }
        InstrumentKind::Harmonics => {
            if let Some(wave) = waves.harmonics.as_deref() {
                chip_synth(tone, wave, buffer);
            }
        }
        InstrumentKind::Pwm => pwm_synth(tone, buffer),
        InstrumentKind::Fm => fm_synth(tone, instrument, bank, buffer),
        InstrumentKind::Noise => {
            let wave_def = &NOISE_WAVES[instrument.noise_wave.min(NOISE_WAVES.len() - 1)];
            let wave = bank.noise_wave(instrument.noise_wave);
            noise_synth(tone, wave, wave_def.pitch_filter_mult, false, rng, buffer);
        }
        InstrumentKind::Spectrum => {
            if let Some(wave) = waves.spectrum.as_deref() {
                noise_synth(tone, wave, 1.0, true, rng, buffer);
            }
        }
        InstrumentKind::Drumset => {
            let drum = (tone.pitches[0].clamp(0, DRUM_COUNT as i32 - 1)) as usize;
            if let Some(wave) = waves.drums.get(drum).and_then(|w| w.as_deref()) {
                noise_synth(tone, wave, 1.0, true, rng, buffer);
            }
        }
        InstrumentKind::Guitar => guitar_synth(tone, instrument, bank, rng, sample_rate, buffer),
    }
    tone.fresh = false;
}

/// Chip and harmonics: two oscillators reading an integrated wave table.
/// Per-sample output is the first difference of the integral divided by
/// the phase step, which band-limits the raw steps of the table.
fn chip_synth(tone: &mut Tone, wave: &[f32], buffer: &mut [f32]) {
    let wave_length = (wave.len() - 1) as f64;
    let lookup = |phase: f64| -> f64 {
        let index = phase as usize;
        let ratio = phase - index as f64;
        wave[index] as f64 + (wave[index + 1] - wave[index]) as f64 * ratio
    };

    let mut phase_a = tone.phases[0].fract() * wave_length;
    let mut phase_b = tone.phases[1].fract() * wave_length;
    let mut delta_a = tone.phase_delta[0] * wave_length;
    let mut delta_b = tone.phase_delta[1] * wave_length;
    let scale = tone.phase_delta_scale[0];
    let mut expression = tone.expression_start[0];
    let expression_delta = tone.expression_delta[0];
    let sign = tone.interval_sign;

    let mut prev_integral_a = lookup(phase_a);
    let mut prev_integral_b = lookup(phase_b);

    for out in buffer.iter_mut() {
        phase_a += delta_a;
        phase_b += delta_b;
        // The centered wave's integral closes at zero, so the first
        // difference stays correct across a wrap without special casing.
        if phase_a >= wave_length {
            phase_a -= wave_length;
        }
        if phase_b >= wave_length {
            phase_b -= wave_length;
        }
        let next_integral_a = lookup(phase_a.min(wave_length - 1.0e-9));
        let next_integral_b = lookup(phase_b.min(wave_length - 1.0e-9));
        let wave_a = (next_integral_a - prev_integral_a) / delta_a;
        let wave_b = (next_integral_b - prev_integral_b) / delta_b;
        prev_integral_a = next_integral_a;
        prev_integral_b = next_integral_b;

        let combined = wave_a + wave_b * sign;
        let filtered = apply_filters(tone, combined);
        *out += (filtered * expression) as f32;

        expression += expression_delta;
        delta_a *= scale;
        delta_b *= scale;
    }

    tone.phases[0] = phase_a / wave_length;
    tone.phases[1] = phase_b / wave_length;
    tone.phase_delta[0] = delta_a / wave_length;
    tone.phase_delta[1] = delta_b / wave_length;
}

/// PolyBLEP correction for a rising saw discontinuity at phase 0.
#[inline]
fn poly_blep(t: f64, dt: f64) -> f64 {
    if t < dt {
        let u = t / dt;
        (u + u - u * u - 1.0) * 0.5
    } else if t > 1.0 - dt {
        let u = (t - 1.0) / dt;
        (u * u + u + u + 1.0) * 0.5
    } else {
        0.0
    }
}

#[inline]
fn blep_saw(t: f64, dt: f64) -> f64 {
    2.0 * t - 1.0 - poly_blep(t, dt)
}

/// PWM: two antialiased saws separated by the pulse width, subtracted.
fn pwm_synth(tone: &mut Tone, buffer: &mut [f32]) {
    let mut phase = tone.phases[0].fract();
    let mut delta = tone.phase_delta[0];
    let scale = tone.phase_delta_scale[0];
    let mut expression = tone.expression_start[0];
    let expression_delta = tone.expression_delta[0];
    let mut width = tone.pulse_width_start;
    let width_delta = tone.pulse_width_delta;

    for out in buffer.iter_mut() {
        let dt = delta.min(0.49);
        let phase_b = {
            let p = phase + width;
            p - p.floor()
        };
        let sample = blep_saw(phase, dt) - blep_saw(phase_b, dt);
        let filtered = apply_filters(tone, sample);
        *out += (filtered * expression) as f32;

        phase += delta;
        phase -= phase.floor();
        delta *= scale;
        expression += expression_delta;
        width += width_delta;
    }

    tone.phases[0] = phase;
    tone.phase_delta[0] = delta;
}

/// Four-operator FM. The routing tables are consulted outside the sample
/// loop only to the extent of slice lookups; operators are evaluated
/// highest-first so modulators are ready before their targets.
fn fm_synth(tone: &mut Tone, instrument: &Instrument, bank: &WaveBank, buffer: &mut [f32]) {
    let algorithm = &ALGORITHMS[instrument.algorithm];
    let feedback = &FEEDBACKS[instrument.feedback_type];
    let sine = &bank.sine;
    let sine_length = SINE_WAVE_LENGTH as f64;

    let mut phases = tone.phases;
    let mut deltas = tone.phase_delta;
    let scale = tone.phase_delta_scale[0];
    let mut expressions = tone.expression_start;
    let expression_deltas = tone.expression_delta;
    let mut feedback_amount = tone.feedback_start;
    let feedback_delta = tone.feedback_delta;
    let mut prev = tone.prev_outputs;

    for out in buffer.iter_mut() {
        let mut raw = [0.0f64; OPERATOR_COUNT];
        let mut carrier_sum = 0.0f64;
        for op in (0..OPERATOR_COUNT).rev() {
            let mut phase_offset = 0.0;
            for &m in algorithm.modulated_by[op] {
                // Modulator expression already includes the depth scale.
                phase_offset += raw[m] * expressions[m];
            }
            for &f in feedback.indices[op] {
                phase_offset += prev[f] * feedback_amount;
            }
            let phase = phases[op] + phase_offset;
            let table_phase = (phase - phase.floor()) * sine_length;
            let index = table_phase as usize;
            let ratio = table_phase - index as f64;
            raw[op] =
                sine[index] as f64 + (sine[index + 1] - sine[index]) as f64 * ratio;
            if op < algorithm.carrier_count {
                carrier_sum += raw[op] * expressions[op];
            }
            phases[op] += deltas[op];
            phases[op] -= phases[op].floor();
            deltas[op] *= scale;
        }
        prev = raw;

        let filtered = apply_filters(tone, carrier_sum);
        *out += filtered as f32;

        for op in 0..OPERATOR_COUNT {
            expressions[op] += expression_deltas[op];
        }
        feedback_amount += feedback_delta;
    }

    tone.phases = phases;
    tone.phase_delta = deltas;
    tone.prev_outputs = prev;
}

/// Noise, spectrum, and drumset: a single wave table read at the tone's
/// rate with a one-pole smoothing step whose cutoff tracks the
/// fundamental. Spectrum-style waves start at a random zero crossing so
/// note onsets do not pop.
fn noise_synth(
    tone: &mut Tone,
    wave: &[f32],
    pitch_filter_mult: f64,
    randomize_start: bool,
    rng: &mut Pcg32,
    buffer: &mut [f32],
) {
    let length = wave.len();
    if tone.fresh && randomize_start {
        let start = rng.gen_range(0..length);
        tone.phases[0] = nearest_zero_crossing(wave, start) as f64 / length as f64;
    }

    let mut index_phase = tone.phases[0].fract() * length as f64;
    let mut speed = tone.phase_delta[0];
    let scale = tone.phase_delta_scale[0];
    let mut expression = tone.expression_start[0];
    let expression_delta = tone.expression_delta[0];
    let smoothing = (speed * pitch_filter_mult).min(1.0);
    let mut state = tone.noise_sample;

    for out in buffer.iter_mut() {
        let raw = wave[index_phase as usize % length] as f64;
        state += (raw - state) * smoothing;
        let filtered = apply_filters(tone, state);
        *out += (filtered * expression) as f32;

        index_phase += speed;
        if index_phase >= length as f64 {
            index_phase -= length as f64;
        }
        speed *= scale;
        expression += expression_delta;
    }

    tone.phases[0] = index_phase / length as f64;
    tone.phase_delta[0] = speed;
    tone.noise_sample = state;
}

/// Plucked string: a delay loop through a fractional-delay all-pass, a
/// dispersion all-pass, and a high-shelf decay filter. A pluck injects
/// the difference of two shifted copies of the integrated impulse.
fn guitar_synth(
    tone: &mut Tone,
    instrument: &Instrument,
    bank: &WaveBank,
    rng: &mut Pcg32,
    sample_rate: f64,
    buffer: &mut [f32],
) {
    let freq = (tone.phase_delta[0] * sample_rate).max(1.0);
    let period = sample_rate / freq;
    let fresh = tone.fresh;
    // Take the string out of the tone so the tone's filter cascade can
    // run inside the sample loop.
    let mut string = tone.guitar.take().unwrap_or_default();

    let needs_pluck = fresh || !string.plucked || {
        let tuned = string.tuned_pitch.max(1.0);
        (freq / tuned).max(tuned / freq) > 1.2
    };
    let needs_retune = needs_pluck || (freq - string.tuned_pitch).abs() > freq * 1.0e-4;

    if needs_retune {
        // The line must hold the period one octave below the played pitch.
        let min_length = ((period * 2.0).ceil() as usize + 2).next_power_of_two();
        if string.delay_line.len() < min_length {
            string.delay_line = vec![0.0; min_length];
            string.delay_index = 0;
        }

        let fundamental = radians_per_sample(freq, sample_rate);
        let dispersion_corner = radians_per_sample(freq * 8.0, sample_rate);
        let dispersion = FilterCoefficients::all_pass_1st_order_invert_above(dispersion_corner);

        let sustain = instrument.sustain.clamp(0, GUITAR_SUSTAIN_RANGE - 1);
        let shelf_gain = 0.2 + 0.75 * sustain as f64 / (GUITAR_SUSTAIN_RANGE - 1) as f64;
        let shelf_corner = radians_per_sample(freq * 4.0, sample_rate);
        let shelf = FilterCoefficients::high_shelf_1st_order(shelf_corner, shelf_gain);

        // Sustain sets the fundamental's half-life in seconds.
        let half_life = 0.04 * 2.0_f64.powf(0.5 * sustain as f64);
        let loop_gain = 0.5_f64.powf(period / (sample_rate * half_life));

        // Keep the loop an exact period long after the filters' phase
        // delay at the fundamental.
        let filter_delay =
            dispersion.phase_delay_at(fundamental) + shelf.phase_delay_at(fundamental);
        let total_delay = (period - filter_delay).max(2.0);
        let mut delay_int = total_delay.floor();
        let mut fraction = total_delay - delay_int;
        if fraction < 0.1 {
            fraction += 1.0;
            delay_int -= 1.0;
        }
        let all_pass = FilterCoefficients::all_pass_1st_order_fractional_delay(fraction);

        string
            .fraction_all_pass
            .load_coefficients_with_gradient(&all_pass, &all_pass, 0.0);
        string
            .dispersion
            .load_coefficients_with_gradient(&dispersion, &dispersion, 0.0);
        string
            .shelf
            .load_coefficients_with_gradient(&shelf, &shelf, 0.0);
        string.delay_length = delay_int;
        string.loop_gain = loop_gain;
        string.tuned_pitch = freq;
    }

    if needs_pluck {
        string.delay_line.fill(0.0);
        string.fraction_all_pass.reset_output();
        string.dispersion.reset_output();
        string.shelf.reset_output();

        let width_fraction = (instrument.guitar_pulse_width + 1) as f64
            / (GUITAR_PULSE_WIDTH_RANGE + 1) as f64
            * 0.5;
        let jitter = (rng.gen::<f64>() - 0.5) * GUITAR_PULSE_WIDTH_RANDOMNESS;
        let pulse_offset = width_fraction * period * (1.0 + jitter);
        let mask = string.delay_line.len() - 1;
        let span = ((period * 2.0) as usize).min(string.delay_line.len());
        for j in 0..span {
            let position = j as f64;
            let value = bank.guitar_impulse_integral_at(position)
                - bank.guitar_impulse_integral_at(position - pulse_offset);
            let index = (string.delay_index + 1 + j) & mask;
            string.delay_line[index] += value;
        }
        string.plucked = true;
    }

    let mask = string.delay_line.len() - 1;
    let delay_int = string.delay_length as usize;
    let loop_gain = string.loop_gain;
    let mut expression = tone.expression_start[0];
    let expression_delta = tone.expression_delta[0];

    for out in buffer.iter_mut() {
        let read_index = string.delay_index.wrapping_sub(delay_int) & mask;
        let raw = string.delay_line[read_index] as f64;
        let mut sample = string.fraction_all_pass.process(raw);
        sample = string.dispersion.process(sample);
        sample = string.shelf.process(sample) * loop_gain;
        string.delay_line[string.delay_index & mask] = sample as f32;
        string.delay_index = string.delay_index.wrapping_add(1);

        let filtered = apply_filters(tone, sample);
        *out += (filtered * expression) as f32;
        expression += expression_delta;
    }

    tone.guitar = Some(string);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::compute::{compute_tone, RunContext};
    use crate::synth::tone::ToneNote;
    use rand::SeedableRng;

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

    fn make_tone(pitch: i32) -> Tone {
        let mut tone = Tone::default();
        tone.reset();
        tone.pitches[0] = pitch;
        tone.pitch_count = 1;
        tone.chord_size = 1;
        tone.note = Some(ToneNote {
            start: 0,
            end: 96,
            pins: vec![
                crate::song::NotePin::new(0, 0, 3),
                crate::song::NotePin::new(96, 0, 3),
            ],
        });
        tone
    }

    fn render(kind: InstrumentKind, pitch: i32, samples: usize) -> Vec<f32> {
        let bank = WaveBank::new();
        let mut rng = Pcg32::seed_from_u64(7);
        let mut tone = make_tone(pitch);
        let instrument = Instrument::new(kind);
        let mut waves = InstrumentWaves::default();
        waves.harmonics = Some(crate::dsp::wave::build_harmonics_wave(
            &instrument.harmonics_wave.harmonics,
        ));
        waves.spectrum = Some(crate::dsp::wave::build_spectrum_wave(
            &instrument.spectrum_wave.spectrum,
        ));
        waves.drums = (0..DRUM_COUNT)
            .map(|i| {
                Some(crate::dsp::wave::build_spectrum_wave(
                    &instrument.drumset_spectrum_waves[i].spectrum,
                ))
            })
            .collect();
        let mut buffer = vec![0.0f32; samples];
        let ctx = context(samples);
        compute_tone(&mut tone, &instrument, 0, kind.is_noise(), 1, &ctx);
        render_tone(
            &mut tone,
            &instrument,
            &bank,
            &waves,
            &mut rng,
            44100.0,
            &mut buffer,
        );
        buffer
    }

    #[test]
    fn test_every_kind_produces_sound() {
        for kind in [
            InstrumentKind::Chip,
            InstrumentKind::Fm,
            InstrumentKind::Harmonics,
            InstrumentKind::Pwm,
            InstrumentKind::Guitar,
        ] {
            let buffer = render(kind, 60, 2048);
            let peak = buffer.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
            assert!(peak > 1.0e-4, "{kind:?} should be audible, peak {peak}");
            assert!(peak < 2.0, "{kind:?} should stay in range, peak {peak}");
        }
        for kind in [
            InstrumentKind::Noise,
            InstrumentKind::Spectrum,
            InstrumentKind::Drumset,
        ] {
            let buffer = render(kind, 6, 2048);
            let peak = buffer.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
            assert!(peak > 1.0e-4, "{kind:?} should be audible, peak {peak}");
        }
    }

    #[test]
    fn test_chip_square_has_expected_period() {
        let samples = 4096;
        let buffer = render(InstrumentKind::Chip, 69, samples);
        // Count rising zero crossings: 440 Hz over 4096 samples at
        // 44.1 kHz is ~40.9 cycles.
        let mut crossings = 0;
        for pair in buffer.windows(2) {
            if pair[0] <= 0.0 && pair[1] > 0.0 {
                crossings += 1;
            }
        }
        assert!((39..=43).contains(&crossings), "crossings {crossings}");
    }

    #[test]
    fn test_fm_default_is_pure_sine() {
        let buffer = render(InstrumentKind::Fm, 69, 4096);
        // A sine has low total harmonic distortion: successive-difference
        // smoothness is a cheap proxy.
        let peak = buffer.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
        let max_step = buffer
            .windows(2)
            .map(|p| (p[1] - p[0]).abs())
            .fold(0.0f32, f32::max);
        // For a sine at 440 Hz the max step is peak * 2π * 440 / 44100.
        let expected = peak * 2.0 * std::f32::consts::PI * 440.0 / 44100.0;
        assert!(max_step < expected * 1.5, "step {max_step} vs {expected}");
    }

    #[test]
    fn test_guitar_decays() {
        let buffer = render(InstrumentKind::Guitar, 48, 44100);
        let early: f32 = buffer[2000..6000].iter().map(|s| s * s).sum();
        let late: f32 = buffer[40000..44000].iter().map(|s| s * s).sum();
        assert!(late < early * 0.5, "string should decay, {early} -> {late}");
    }

    #[test]
    fn test_spectrum_tone_starts_quietly() {
        let buffer = render(InstrumentKind::Spectrum, 6, 64);
        // Starting at a zero crossing with one-pole smoothing keeps the
        // first samples small.
        assert!(buffer[0].abs() < 0.1);
    }
}
