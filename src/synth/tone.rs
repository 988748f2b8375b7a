//! Tone state and the shared tone pool.
//!
//! A tone is one sounding voice: a subset of a note's pitches bound to an
//! instrument, with oscillator phases, filter state, and the per-run
//! parameters the voicing stage computes for the synth loops. Tones live
//! in a pool owned by the engine; channels reference them by index so
//! queue shuffling never moves samples of state around.

use crate::constants::{FILTER_MAX_POINTS, MAX_CHORD_SIZE, OPERATOR_COUNT};
use crate::dsp::DynamicBiquad;
use crate::song::NotePin;

/// The note data a tone needs, copied at pickup so the tone stays valid
/// while the song is edited.
#[derive(Debug, Clone, Default)]
pub struct ToneNote {
    /// Note start in parts, absolute within the bar.
    pub start: i32,
    /// Note end in parts.
    pub end: i32,
    pub pins: Vec<NotePin>,
}

/// Summary of an adjacent note, for slide transitions.
#[derive(Debug, Clone, Copy)]
pub struct NoteEdge {
    /// The adjacent note's pitch at the shared boundary.
    pub pitch: i32,
    /// The adjacent note's length in parts.
    pub length: i32,
    /// The adjacent note's raw expression at the shared boundary.
    pub expression: i32,
}

/// Plucked-string state, allocated lazily for guitar tones.
#[derive(Debug, Clone, Default)]
pub struct GuitarString {
    pub delay_line: Vec<f32>,
    pub delay_index: usize,
    /// Loop length in samples, fractional part handled by the all-pass.
    pub delay_length: f64,
    pub fraction_all_pass: DynamicBiquad,
    pub dispersion: DynamicBiquad,
    pub shelf: DynamicBiquad,
    /// Extra per-sample attenuation that sets the sustain time.
    pub loop_gain: f64,
    /// Pitch the string is currently tuned to; a change triggers a pluck.
    pub tuned_pitch: f64,
    pub plucked: bool,
}

/// One sounding voice.
#[derive(Debug, Clone, Default)]
pub struct Tone {
    pub pitches: [i32; MAX_CHORD_SIZE],
    pub pitch_count: usize,
    /// Size of the whole chord this tone belongs to.
    pub chord_size: usize,
    pub instrument_index: usize,
    pub note: Option<ToneNote>,
    pub prev_note: Option<NoteEdge>,
    pub next_note: Option<NoteEdge>,

    // Lifecycle
    pub live_input: bool,
    pub released: bool,
    pub ticks_since_note_start: i32,
    pub ticks_since_released: i32,
    pub is_on_last_tick: bool,
    pub fade_out_fast: bool,
    /// Phases have not been initialized yet (fresh pickup, not a seamless
    /// continuation).
    pub fresh: bool,

    // Parameters for the current sample run, produced by the voicing
    // stage and consumed by the synth loops.
    pub phase_delta: [f64; OPERATOR_COUNT],
    pub phase_delta_scale: [f64; OPERATOR_COUNT],
    pub expression_start: [f64; OPERATOR_COUNT],
    pub expression_delta: [f64; OPERATOR_COUNT],
    pub interval_sign: f64,
    pub feedback_start: f64,
    pub feedback_delta: f64,
    pub pulse_width_start: f64,
    pub pulse_width_delta: f64,
    pub filter_count: usize,
    pub filters: Vec<DynamicBiquad>,

    // Oscillator state
    pub phases: [f64; OPERATOR_COUNT],
    /// Previous operator outputs, for FM feedback.
    pub prev_outputs: [f64; OPERATOR_COUNT],
    /// One-pole smoothing state for the noise family.
    pub noise_sample: f64,
    pub guitar: Option<Box<GuitarString>>,
}

impl Tone {
    /// Returns the tone to its post-construction state.
    pub fn reset(&mut self) {
        self.pitches = [0; MAX_CHORD_SIZE];
        self.pitch_count = 0;
        self.chord_size = 1;
        self.instrument_index = 0;
        self.note = None;
        self.prev_note = None;
        self.next_note = None;
        self.live_input = false;
        self.released = false;
        self.ticks_since_note_start = 0;
        self.ticks_since_released = 0;
        self.is_on_last_tick = false;
        self.fade_out_fast = false;
        self.fresh = true;
        self.phase_delta = [0.0; OPERATOR_COUNT];
        self.phase_delta_scale = [1.0; OPERATOR_COUNT];
        self.expression_start = [0.0; OPERATOR_COUNT];
        self.expression_delta = [0.0; OPERATOR_COUNT];
        self.interval_sign = 1.0;
        self.feedback_start = 0.0;
        self.feedback_delta = 0.0;
        self.pulse_width_start = 0.5;
        self.pulse_width_delta = 0.0;
        self.filter_count = 0;
        self.filters.clear();
        self.filters.resize_with(FILTER_MAX_POINTS, DynamicBiquad::new);
        self.phases = [0.0; OPERATOR_COUNT];
        self.prev_outputs = [0.0; OPERATOR_COUNT];
        self.noise_sample = 0.0;
        self.guitar = None;
    }

    /// The note's last pin interval, or 0 for live-input tones.
    pub fn final_interval(&self) -> i32 {
        self.note
            .as_ref()
            .and_then(|n| n.pins.last())
            .map_or(0, |pin| pin.interval)
    }

    /// Clamps runaway or denormal filter and oscillator state to zero.
    pub fn sanitize(&mut self) {
        for filter in self.filters.iter_mut().take(self.filter_count) {
            filter.sanitize();
        }
        if !self.noise_sample.is_finite() || self.noise_sample.abs() < 1.0e-24 {
            self.noise_sample = 0.0;
        }
        for output in self.prev_outputs.iter_mut() {
            if !output.is_finite() || output.abs() > 100.0 {
                *output = 0.0;
            }
        }
        if let Some(guitar) = self.guitar.as_mut() {
            guitar.fraction_all_pass.sanitize();
            guitar.dispersion.sanitize();
            guitar.shelf.sanitize();
            let mut blown_up = false;
            for sample in guitar.delay_line.iter() {
                if !sample.is_finite() || sample.abs() > 100.0 {
                    blown_up = true;
                    break;
                }
            }
            if blown_up {
                guitar.delay_line.fill(0.0);
            }
        }
    }
}

/// Fixed-capacity-free arena of tones with an index free list.
#[derive(Debug, Default)]
pub struct TonePool {
    tones: Vec<Tone>,
    free: Vec<usize>,
}

impl TonePool {
    pub fn new() -> Self {
        Default::default()
    }

    /// Takes a reset tone out of the pool, growing it if necessary.
    pub fn new_tone(&mut self) -> usize {
        if let Some(index) = self.free.pop() {
            self.tones[index].reset();
            index
        } else {
            let mut tone = Tone::default();
            tone.reset();
            self.tones.push(tone);
            self.tones.len() - 1
        }
    }

    /// Returns a tone to the free list.
    pub fn free_tone(&mut self, index: usize) {
        debug_assert!(!self.free.contains(&index));
        self.free.push(index);
    }

    pub fn get(&self, index: usize) -> &Tone {
        &self.tones[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Tone {
        &mut self.tones[index]
    }

    /// Number of tones currently checked out.
    pub fn live_count(&self) -> usize {
        self.tones.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reuses_freed_tones() {
        let mut pool = TonePool::new();
        let a = pool.new_tone();
        pool.get_mut(a).pitch_count = 3;
        pool.free_tone(a);
        let b = pool.new_tone();
        assert_eq!(a, b);
        assert_eq!(pool.get(b).pitch_count, 0, "reused tones start reset");
        assert_eq!(pool.live_count(), 1);
    }

    #[test]
    fn test_pool_grows_on_demand() {
        let mut pool = TonePool::new();
        let indices: Vec<usize> = (0..8).map(|_| pool.new_tone()).collect();
        assert_eq!(pool.live_count(), 8);
        for index in indices {
            pool.free_tone(index);
        }
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_sanitize_clears_nan_noise_state() {
        let mut tone = Tone::default();
        tone.reset();
        tone.noise_sample = f64::NAN;
        tone.prev_outputs[2] = f64::INFINITY;
        tone.sanitize();
        assert_eq!(tone.noise_sample, 0.0);
        assert_eq!(tone.prev_outputs[2], 0.0);
    }
}
