//! Per-instrument effects chain.
//!
//! Enabled stages compose in a fixed order: distortion, bitcrusher, the
//! effect-filter cascade, panning, chorus, reverb. The first three are
//! mono; panning splits to stereo and the rest run per side. Each
//! instrument owns its delay lines, allocated lazily as powers of two,
//! and the chain tracks how long its tails keep ringing after the last
//! tone so the orchestrator can put the instrument back to sleep.

use crate::constants::{
    BITCRUSHER_OCTAVE_STEP, BITCRUSHER_QUANTIZATION_RANGE, DISTORTION_RANGE, DRUM_COUNT,
    PAN_CENTER, PAN_DELAY_SECONDS_MAX, PAN_MAX, REVERB_DELAY_BUFFER_SIZE, REVERB_RANGE,
};
use crate::dsp::wave::{build_harmonics_wave, build_spectrum_wave};
use crate::dsp::DynamicBiquad;
use crate::song::{EffectFlags, Instrument, InstrumentKind};
use crate::synth::voices::InstrumentWaves;

/// Output level of a fully driven distortion stage.
const DISTORTION_BASE_VOLUME: f64 = 0.6;
/// Fastest bitcrusher hold rate in Hz, at setting 0.
const BITCRUSHER_BASE_HZ: f64 = 8000.0;

/// Sinusoidal tap movement of the chorus, common period.
const CHORUS_PERIOD_SECONDS: f64 = 2.0;
/// Static tap centers in seconds, per tap.
const CHORUS_TAP_CENTERS: [f64; 3] = [0.0034, 0.0059, 0.0084];
/// Tap movement depth in seconds.
const CHORUS_TAP_DEPTH: f64 = 0.0023;
/// Tap LFO phase offsets, left then right channel.
const CHORUS_PHASE_OFFSETS: [[f64; 3]; 2] = [[0.0, 2.1, 4.2], [3.2, 5.3, 1.0]];

/// Reverb tap offsets inside the shared ring; coprime-ish spacings keep
/// the echo train from aligning.
const REVERB_TAP_OFFSETS: [usize; 4] = [0, 3041, 6426, 10907];
/// One-pole damping applied to each recirculating tap.
const REVERB_DAMPING: f64 = 0.35;

/// The tail is considered silent once it falls below 1/256 of full scale.
const TAIL_SILENCE_LEVEL: f64 = 1.0 / 256.0;

fn next_power_of_two_samples(seconds: f64, sample_rate: f64) -> usize {
    ((seconds * sample_rate).ceil() as usize + 1).next_power_of_two()
}

/// Runtime state for one instrument slot: cached custom waves, effect
/// delay lines, and the tail-flushing lifecycle.
#[derive(Debug, Default)]
pub struct InstrumentState {
    /// The instrument has produced sound since its last deactivation.
    pub awake: bool,
    /// No tones remain and the delay tails are draining.
    pub flushing: bool,
    /// Samples left before the tails are considered traversed.
    flush_countdown: f64,
    /// Set once flushing completes; the orchestrator clears the delay
    /// buffers and sleeps the instrument at the next tick boundary.
    pub deactivate_after_this_tick: bool,

    /// Cached instrument-dependent waves.
    pub waves: InstrumentWaves,
    harmonics_fingerprint: Option<Vec<i32>>,
    spectrum_fingerprint: Option<Vec<i32>>,
    drum_fingerprints: Vec<Option<Vec<i32>>>,

    bitcrusher_phase: f64,
    bitcrusher_held: f64,
    effect_filters: Vec<DynamicBiquad>,
    effect_filter_count: usize,
    pan_delay_line: Vec<f32>,
    pan_pos: usize,
    chorus_delay_line_l: Vec<f32>,
    chorus_delay_line_r: Vec<f32>,
    chorus_pos: usize,
    chorus_phase: f64,
    reverb_delay_line: Vec<f32>,
    reverb_pos: usize,
    reverb_lowpass: [f64; 4],
}

impl InstrumentState {
    pub fn new() -> Self {
        Default::default()
    }

    /// Rebuilds the cached harmonics/spectrum/drum waves if the
    /// instrument's curves changed since the last run.
    pub fn prepare_waves(&mut self, instrument: &Instrument) {
        match instrument.kind {
            InstrumentKind::Harmonics => {
                let controls = instrument.harmonics_wave.harmonics.to_vec();
                if self.harmonics_fingerprint.as_ref() != Some(&controls) {
                    self.waves.harmonics = Some(build_harmonics_wave(&controls));
                    self.harmonics_fingerprint = Some(controls);
                }
            }
            InstrumentKind::Spectrum => {
                let controls = instrument.spectrum_wave.spectrum.to_vec();
                if self.spectrum_fingerprint.as_ref() != Some(&controls) {
                    self.waves.spectrum = Some(build_spectrum_wave(&controls));
                    self.spectrum_fingerprint = Some(controls);
                }
            }
            InstrumentKind::Drumset => {
                if self.waves.drums.len() < DRUM_COUNT {
                    self.waves.drums.resize_with(DRUM_COUNT, || None);
                    self.drum_fingerprints.resize_with(DRUM_COUNT, || None);
                }
                for (drum, wave) in instrument.drumset_spectrum_waves.iter().enumerate() {
                    let controls = wave.spectrum.to_vec();
                    if self.drum_fingerprints[drum].as_ref() != Some(&controls) {
                        self.waves.drums[drum] = Some(build_spectrum_wave(&controls));
                        self.drum_fingerprints[drum] = Some(controls);
                    }
                }
            }
            _ => {}
        }
    }

    /// Reads the instrument's mono scratch (zeroing it behind itself),
    /// applies the enabled effects, and accumulates into the stereo mix.
    ///
    /// `tones_active` drives the tail lifecycle: the first run without
    /// tones estimates how long the tails stay audible and arms the
    /// flush countdown.
    pub fn run_effects(
        &mut self,
        instrument: &Instrument,
        sample_rate: f64,
        tones_active: bool,
        mono: &mut [f32],
        left: &mut [f32],
        right: &mut [f32],
    ) {
        let effects = instrument.effects;
        let reverb_mult = reverb_mult_from_setting(instrument.reverb);

        if tones_active {
            self.awake = true;
            self.flushing = false;
            self.deactivate_after_this_tick = false;
        } else if self.awake && !self.flushing {
            self.flushing = true;
            self.flush_countdown = self.tail_samples(effects, reverb_mult);
        }
        if !self.awake {
            return;
        }

        // Stage parameters, hoisted out of the sample loop.
        let distortion_enabled = effects.contains(EffectFlags::DISTORTION);
        let slider = instrument.distortion as f64 / (DISTORTION_RANGE - 1) as f64;
        let distortion = (1.0 - 0.95 * slider).powf(1.5);
        let distortion_drive = 1.0 + 2.0 * slider;

        let bitcrusher_enabled = effects.contains(EffectFlags::BITCRUSHER);
        let bitcrusher_delta = BITCRUSHER_BASE_HZ
            * 2.0_f64.powf(-(instrument.bitcrusher_freq as f64) * BITCRUSHER_OCTAVE_STEP)
            / sample_rate;
        let quantization_levels = 2.0_f64.powf(
            (BITCRUSHER_QUANTIZATION_RANGE - 1 - instrument.bitcrusher_quantization) as f64 * 0.5
                + 1.0,
        );

        let filter_enabled =
            effects.contains(EffectFlags::EFFECT_FILTER) && !instrument.effect_filter.points.is_empty();
        if filter_enabled {
            self.effect_filter_count = instrument.effect_filter.points.len();
            if self.effect_filters.len() < self.effect_filter_count {
                self.effect_filters
                    .resize_with(self.effect_filter_count, DynamicBiquad::new);
            }
            for (filter, point) in self
                .effect_filters
                .iter_mut()
                .zip(instrument.effect_filter.points.iter())
            {
                let coefficients = point.to_coefficients(sample_rate, 1.0);
                filter.load_coefficients_with_gradient(&coefficients, &coefficients, 0.0);
            }
        }

        let pan_enabled = effects.contains(EffectFlags::PANNING);
        let (pan_gain_l, pan_gain_r, pan_delay_l, pan_delay_r) = if pan_enabled {
            if self.pan_delay_line.is_empty() {
                self.pan_delay_line =
                    vec![0.0; next_power_of_two_samples(PAN_DELAY_SECONDS_MAX, sample_rate)];
            }
            let angle =
                instrument.pan as f64 / PAN_MAX as f64 * std::f64::consts::FRAC_PI_2;
            let max_delay = PAN_DELAY_SECONDS_MAX * sample_rate;
            let offset = (instrument.pan - PAN_CENTER) as f64 / PAN_CENTER as f64;
            (
                angle.cos(),
                angle.sin(),
                (offset.max(0.0)) * max_delay,
                (-offset).max(0.0) * max_delay,
            )
        } else {
            (1.0, 1.0, 0.0, 0.0)
        };

        let chorus_enabled = effects.contains(EffectFlags::CHORUS);
        if chorus_enabled && self.chorus_delay_line_l.is_empty() {
            let size = next_power_of_two_samples(
                CHORUS_TAP_CENTERS[2] + CHORUS_TAP_DEPTH * 2.0,
                sample_rate,
            );
            self.chorus_delay_line_l = vec![0.0; size];
            self.chorus_delay_line_r = vec![0.0; size];
        }
        let chorus_phase_delta =
            std::f64::consts::TAU / (CHORUS_PERIOD_SECONDS * sample_rate);

        let reverb_enabled = effects.contains(EffectFlags::REVERB) && reverb_mult > 0.0;
        if reverb_enabled && self.reverb_delay_line.is_empty() {
            self.reverb_delay_line = vec![0.0; REVERB_DELAY_BUFFER_SIZE];
        }

        let input_mult = if self.flushing { 0.0 } else { 1.0 };

        for i in 0..mono.len() {
            let mut sample = mono[i] as f64 * input_mult;
            mono[i] = 0.0;

            if distortion_enabled {
                let driven = sample * distortion_drive;
                sample = DISTORTION_BASE_VOLUME * driven
                    / ((1.0 - distortion) * driven.abs() + distortion);
            }

            if bitcrusher_enabled {
                self.bitcrusher_phase += bitcrusher_delta;
                if self.bitcrusher_phase >= 1.0 {
                    self.bitcrusher_phase -= self.bitcrusher_phase.floor();
                    // Mid-tread quantization of the newly held sample.
                    self.bitcrusher_held =
                        ((sample * quantization_levels).floor() + 0.5) / quantization_levels;
                }
                sample = self.bitcrusher_held;
            }

            if filter_enabled {
                for filter in self.effect_filters.iter_mut().take(self.effect_filter_count) {
                    sample = filter.process(sample);
                }
            }

            let (mut sample_l, mut sample_r) = if pan_enabled {
                let mask = self.pan_delay_line.len() - 1;
                self.pan_delay_line[self.pan_pos & mask] = sample as f32;
                let read = |delay: f64| -> f64 {
                    let position = self.pan_pos as f64 - delay;
                    let index = position.floor() as isize as usize;
                    let ratio = position - position.floor();
                    let a = self.pan_delay_line[index & mask] as f64;
                    let b = self.pan_delay_line[(index.wrapping_add(1)) & mask] as f64;
                    a + (b - a) * ratio
                };
                let l = read(pan_delay_l) * pan_gain_l;
                let r = read(pan_delay_r) * pan_gain_r;
                self.pan_pos = self.pan_pos.wrapping_add(1);
                (l, r)
            } else {
                (sample, sample)
            };

            if chorus_enabled {
                let mask = self.chorus_delay_line_l.len() - 1;
                self.chorus_delay_line_l[self.chorus_pos & mask] = sample_l as f32;
                self.chorus_delay_line_r[self.chorus_pos & mask] = sample_r as f32;
                let phase = self.chorus_phase;
                let mut mixed = [0.0f64; 2];
                for (side, mixed_side) in mixed.iter_mut().enumerate() {
                    let line = if side == 0 {
                        &self.chorus_delay_line_l
                    } else {
                        &self.chorus_delay_line_r
                    };
                    let mut taps = [0.0f64; 3];
                    for (tap, value) in taps.iter_mut().enumerate() {
                        let delay_seconds = CHORUS_TAP_CENTERS[tap]
                            + CHORUS_TAP_DEPTH
                                * (phase + CHORUS_PHASE_OFFSETS[side][tap]).sin();
                        let position = self.chorus_pos as f64 - delay_seconds * sample_rate;
                        let index = position.floor() as isize as usize;
                        let ratio = position - position.floor();
                        let a = line[index & mask] as f64;
                        let b = line[index.wrapping_add(1) & mask] as f64;
                        *value = a + (b - a) * ratio;
                    }
                    let dry = if side == 0 { sample_l } else { sample_r };
                    *mixed_side = 0.5 * (dry - taps[0] + taps[1] - taps[2]);
                }
                sample_l = mixed[0];
                sample_r = mixed[1];
                self.chorus_pos = self.chorus_pos.wrapping_add(1);
                self.chorus_phase += chorus_phase_delta;
                if self.chorus_phase >= std::f64::consts::TAU {
                    self.chorus_phase -= std::f64::consts::TAU;
                }
            }

            if reverb_enabled {
                let mask = REVERB_DELAY_BUFFER_SIZE - 1;
                let pos = self.reverb_pos;
                let i0 = pos & mask;
                let i1 = (pos + REVERB_TAP_OFFSETS[1]) & mask;
                let i2 = (pos + REVERB_TAP_OFFSETS[2]) & mask;
                let i3 = (pos + REVERB_TAP_OFFSETS[3]) & mask;
                let s0 = self.reverb_delay_line[i0] as f64;
                let s1 = self.reverb_delay_line[i1] as f64;
                let s2 = self.reverb_delay_line[i2] as f64;
                let s3 = self.reverb_delay_line[i3] as f64;
                // Orthonormal Hadamard feedback keeps the energy balance
                // independent of tap correlations.
                let t0 = (s0 + s1 + s2 + s3) * 0.5 * reverb_mult;
                let t1 = (s0 - s1 + s2 - s3) * 0.5 * reverb_mult;
                let t2 = (s0 + s1 - s2 - s3) * 0.5 * reverb_mult;
                let t3 = (s0 - s1 - s2 + s3) * 0.5 * reverb_mult;
                self.reverb_lowpass[0] += (t0 - self.reverb_lowpass[0]) * REVERB_DAMPING;
                self.reverb_lowpass[1] += (t1 - self.reverb_lowpass[1]) * REVERB_DAMPING;
                self.reverb_lowpass[2] += (t2 - self.reverb_lowpass[2]) * REVERB_DAMPING;
                self.reverb_lowpass[3] += (t3 - self.reverb_lowpass[3]) * REVERB_DAMPING;
                let send = (sample_l + sample_r) * 0.5 * reverb_mult;
                self.reverb_delay_line[i0] = (self.reverb_lowpass[0] + send) as f32;
                self.reverb_delay_line[i1] = self.reverb_lowpass[1] as f32;
                self.reverb_delay_line[i2] = (self.reverb_lowpass[2] + send) as f32;
                self.reverb_delay_line[i3] = self.reverb_lowpass[3] as f32;
                self.reverb_pos = pos.wrapping_add(1);
                sample_l += (s0 + s2) * 0.5;
                sample_r += (s1 + s3) * 0.5;
            }

            left[i] += sample_l as f32;
            right[i] += sample_r as f32;
        }

        if self.flushing {
            self.flush_countdown -= mono.len() as f64;
            if self.flush_countdown <= 0.0 {
                self.deactivate_after_this_tick = true;
            }
        }
    }

    /// Samples until the combined tails have both attenuated below
    /// audibility and physically drained out of every delay line.
    fn tail_samples(&self, effects: EffectFlags, reverb_mult: f64) -> f64 {
        let mut fade = 0.0;
        if effects.contains(EffectFlags::REVERB) && reverb_mult > 0.0 && reverb_mult < 1.0 {
            let circulations = ((1.0 / TAIL_SILENCE_LEVEL).ln() / -reverb_mult.ln()).ceil();
            fade = circulations * REVERB_DELAY_BUFFER_SIZE as f64;
        }
        let mut capacity = 0.0;
        if effects.contains(EffectFlags::PANNING) {
            capacity += self.pan_delay_line.len() as f64;
        }
        if effects.contains(EffectFlags::CHORUS) {
            capacity += self.chorus_delay_line_l.len() as f64;
        }
        if effects.contains(EffectFlags::REVERB) {
            capacity += REVERB_DELAY_BUFFER_SIZE as f64;
        }
        fade + capacity
    }

    /// Zeroes every delay line and sleeps the instrument.
    pub fn deactivate(&mut self) {
        self.pan_delay_line.fill(0.0);
        self.chorus_delay_line_l.fill(0.0);
        self.chorus_delay_line_r.fill(0.0);
        self.reverb_delay_line.fill(0.0);
        self.reverb_lowpass = [0.0; 4];
        self.bitcrusher_phase = 0.0;
        self.bitcrusher_held = 0.0;
        for filter in self.effect_filters.iter_mut() {
            filter.reset_output();
        }
        self.awake = false;
        self.flushing = false;
        self.deactivate_after_this_tick = false;
    }

    /// True when every delay buffer holds only zeros.
    pub fn delay_lines_are_silent(&self) -> bool {
        self.pan_delay_line.iter().all(|&s| s == 0.0)
            && self.chorus_delay_line_l.iter().all(|&s| s == 0.0)
            && self.chorus_delay_line_r.iter().all(|&s| s == 0.0)
            && self.reverb_delay_line.iter().all(|&s| s == 0.0)
    }

    /// Clamps denormal or non-finite values in every delay line and
    /// filter history. Runs once per tick.
    pub fn sanitize(&mut self) {
        for filter in self.effect_filters.iter_mut() {
            filter.sanitize();
        }
        for state in self.reverb_lowpass.iter_mut() {
            if !state.is_finite() || state.abs() < 1.0e-24 {
                *state = 0.0;
            }
        }
        for line in [
            &mut self.pan_delay_line,
            &mut self.chorus_delay_line_l,
            &mut self.chorus_delay_line_r,
            &mut self.reverb_delay_line,
        ] {
            let mut blown_up = false;
            for sample in line.iter() {
                if !sample.is_finite() || sample.abs() > 100.0 {
                    blown_up = true;
                    break;
                }
            }
            if blown_up {
                line.fill(0.0);
            }
        }
        if !self.bitcrusher_held.is_finite() {
            self.bitcrusher_held = 0.0;
        }
    }
}

/// Feedback gain (and wet level) for a reverb setting.
pub fn reverb_mult_from_setting(setting: i32) -> f64 {
    setting.clamp(0, REVERB_RANGE - 1) as f64 / (REVERB_RANGE - 1) as f64 * 0.7
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::{EffectFlags, Instrument, InstrumentKind};

    fn run(
        state: &mut InstrumentState,
        instrument: &Instrument,
        input: f32,
        len: usize,
        tones: bool,
    ) -> (Vec<f32>, Vec<f32>) {
        let mut mono = vec![input; len];
        let mut left = vec![0.0f32; len];
        let mut right = vec![0.0f32; len];
        state.run_effects(instrument, 44100.0, tones, &mut mono, &mut left, &mut right);
        assert!(mono.iter().all(|&s| s == 0.0), "scratch must be cleared");
        (left, right)
    }

    #[test]
    fn test_no_effects_passes_through() {
        let mut state = InstrumentState::new();
        let instrument = Instrument::new(InstrumentKind::Chip);
        let (left, right) = run(&mut state, &instrument, 0.25, 16, true);
        assert!(left.iter().all(|&s| (s - 0.25).abs() < 1e-6));
        assert!(right.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_distortion_keeps_sign_and_bounds() {
        let mut state = InstrumentState::new();
        let mut instrument = Instrument::new(InstrumentKind::Chip);
        instrument.effects = EffectFlags::DISTORTION;
        instrument.distortion = DISTORTION_RANGE - 1;
        let (left, _) = run(&mut state, &instrument, 0.5, 8, true);
        assert!(left[0] > 0.0);
        assert!(left[0] <= DISTORTION_BASE_VOLUME as f32 * 1.05);
    }

    #[test]
    fn test_pan_hard_right_silences_left() {
        let mut state = InstrumentState::new();
        let mut instrument = Instrument::new(InstrumentKind::Chip);
        instrument.effects = EffectFlags::PANNING;
        instrument.pan = PAN_MAX;
        let (left, right) = run(&mut state, &instrument, 0.5, 256, true);
        let left_rms: f32 = left.iter().map(|s| s * s).sum::<f32>().sqrt();
        let right_rms: f32 = right.iter().map(|s| s * s).sum::<f32>().sqrt();
        assert!(left_rms < right_rms * 0.1, "{left_rms} vs {right_rms}");
    }

    #[test]
    fn test_reverb_produces_tail() {
        let mut state = InstrumentState::new();
        let mut instrument = Instrument::new(InstrumentKind::Chip);
        instrument.effects = EffectFlags::REVERB;
        instrument.reverb = REVERB_RANGE - 1;
        // An impulse, then silence with tones still marked active.
        let _ = run(&mut state, &instrument, 1.0, 1, true);
        let mut tail_energy = 0.0f32;
        for _ in 0..8 {
            let (left, right) = run(&mut state, &instrument, 0.0, 4096, true);
            tail_energy += left.iter().map(|s| s * s).sum::<f32>();
            tail_energy += right.iter().map(|s| s * s).sum::<f32>();
        }
        assert!(tail_energy > 0.0, "reverb should ring after an impulse");
    }

    #[test]
    fn test_flush_lifecycle_deactivates_and_clears() {
        let mut state = InstrumentState::new();
        let mut instrument = Instrument::new(InstrumentKind::Chip);
        instrument.effects = EffectFlags::REVERB | EffectFlags::CHORUS;
        instrument.reverb = 3;
        let _ = run(&mut state, &instrument, 0.8, 512, true);
        assert!(state.awake);
        // No more tones: the state flushes and eventually asks to sleep.
        let mut runs = 0;
        while !state.deactivate_after_this_tick && runs < 10_000 {
            let _ = run(&mut state, &instrument, 0.0, 512, false);
            runs += 1;
        }
        assert!(state.deactivate_after_this_tick, "flush should complete");
        state.deactivate();
        assert!(!state.awake);
        assert!(state.delay_lines_are_silent());
    }

    #[test]
    fn test_bitcrusher_quantizes() {
        let mut state = InstrumentState::new();
        let mut instrument = Instrument::new(InstrumentKind::Chip);
        instrument.effects = EffectFlags::BITCRUSHER;
        instrument.bitcrusher_freq = 0;
        instrument.bitcrusher_quantization = BITCRUSHER_QUANTIZATION_RANGE - 1;
        let (left, _) = run(&mut state, &instrument, 0.3, 64, true);
        // Harsh quantization snaps 0.3 to the nearest mid-tread level.
        let distinct: std::collections::BTreeSet<i64> =
            left.iter().map(|&s| (s * 1.0e6) as i64).collect();
        assert!(distinct.len() <= 2, "held value should be quantized");
    }

    #[test]
    fn test_sanitize_resets_blown_up_lines() {
        let mut state = InstrumentState::new();
        let mut instrument = Instrument::new(InstrumentKind::Chip);
        instrument.effects = EffectFlags::REVERB;
        instrument.reverb = 4;
        let _ = run(&mut state, &instrument, 0.5, 64, true);
        state.reverb_delay_line[100] = f32::NAN;
        state.sanitize();
        assert!(state.reverb_delay_line.iter().all(|s| s.is_finite()));
    }
}
