//! Cached wave tables.
//!
//! The engine reads oscillators out of precomputed tables: integrated chip
//! waves (so the voice can take a band-limited first difference), LFSR
//! noise flavors, FFT-built spectrum and harmonics waves, and the
//! antialiased impulse the guitar voice injects on a pluck. All tables are
//! owned by a [`WaveBank`] held by the engine, so multiple engines can
//! coexist without sharing process-global state.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use rustfft::num_complex::Complex;

use crate::constants::{
    CHIP_WAVES, HARMONICS_CONTROL_MAX, HARMONICS_CONTROL_POINTS, HARMONICS_WAVE_LENGTH,
    NOISE_WAVES, NOISE_WAVE_LENGTH, SINE_WAVE_LENGTH, SPECTRUM_CONTROL_MAX,
    SPECTRUM_CONTROL_POINTS, SPECTRUM_WAVE_LENGTH,
};
use crate::dsp::fft::{inverse_real_fft, phased_bin, sine_bin};

/// Harmonics beyond the control points fade out up to this count.
const HARMONICS_RENDERED: usize = 64;

/// Length of the guitar impulse table.
const GUITAR_IMPULSE_LENGTH: usize = 1024;

/// Seed for the deterministic table builders. Per-note randomness comes
/// from the engine's own RNG instead, so rendered tables are identical
/// across runs.
const TABLE_SEED: u64 = 0x1357_9bdf_2468_ace0;

/// All precomputed wave tables for one engine instance.
pub struct WaveBank {
    /// Sine table with a wrap guard sample for interpolation.
    pub sine: Vec<f32>,
    /// Integrated chip waves, one per [`CHIP_WAVES`] entry; length is the
    /// raw wave length + 1.
    chip: Vec<Vec<f32>>,
    /// Raw noise waves, one per [`NOISE_WAVES`] entry.
    noise: Vec<Vec<f32>>,
    /// Running integral of the antialiased guitar pluck impulse.
    guitar_impulse_integral: Vec<f32>,
}

impl WaveBank {
    pub fn new() -> Self {
        let mut sine = Vec::with_capacity(SINE_WAVE_LENGTH + 1);
        for i in 0..=SINE_WAVE_LENGTH {
            sine.push(
                (i as f64 * std::f64::consts::TAU / SINE_WAVE_LENGTH as f64).sin() as f32,
            );
        }

        let chip = CHIP_WAVES
            .iter()
            .map(|def| perform_integral(&center_wave(def.samples)))
            .collect();

        let mut rng = Pcg32::seed_from_u64(TABLE_SEED);
        let noise = NOISE_WAVES
            .iter()
            .map(|def| build_noise_wave(def.name, &mut rng))
            .collect();

        WaveBank {
            sine,
            chip,
            noise,
            guitar_impulse_integral: build_guitar_impulse_integral(),
        }
    }

    /// Integrated chip wave for a wave index, clamped to the table.
    pub fn chip_wave(&self, index: usize) -> &[f32] {
        &self.chip[index.min(self.chip.len() - 1)]
    }

    /// Noise wave for a noise-wave index, clamped to the table.
    pub fn noise_wave(&self, index: usize) -> &[f32] {
        &self.noise[index.min(self.noise.len() - 1)]
    }

    /// The integral of the guitar pluck impulse, linearly interpolated at
    /// a fractional position. Saturates outside the table: 0 before the
    /// impulse, the settled step value after it.
    pub fn guitar_impulse_integral_at(&self, position: f64) -> f32 {
        let table = &self.guitar_impulse_integral;
        if position <= 0.0 {
            return 0.0;
        }
        let max_index = table.len() - 1;
        if position >= max_index as f64 {
            return table[max_index];
        }
        let index = position as usize;
        let ratio = (position - index as f64) as f32;
        table[index] + (table[index + 1] - table[index]) * ratio
    }
}

impl Default for WaveBank {
    fn default() -> Self {
        Self::new()
    }
}

/// Subtracts the mean so the integral of the wave does not drift.
fn center_wave(samples: &[f64]) -> Vec<f64> {
    let mean: f64 = samples.iter().sum::<f64>() / samples.len() as f64;
    samples.iter().map(|&s| s - mean).collect()
}

/// Running integral with a leading zero, one sample longer than the input.
/// Chip voices read `(integral[i+1] - integral[i]) / phaseDelta` to get a
/// band-limited step interpolation of the raw wave.
fn perform_integral(samples: &[f64]) -> Vec<f32> {
    let mut integral = Vec::with_capacity(samples.len() + 1);
    let mut sum = 0.0;
    integral.push(0.0);
    for &s in samples {
        sum += s;
        integral.push(sum as f32);
    }
    integral
}

fn build_noise_wave(name: &str, rng: &mut Pcg32) -> Vec<f32> {
    match name {
        "white" => (0..NOISE_WAVE_LENGTH)
            .map(|_| rng.gen::<f32>() * 2.0 - 1.0)
            .collect(),
        "hollow" => build_hollow_wave(),
        "clang" => lfsr_wave(6, 14),
        "buzz" => lfsr_wave(3, 12),
        _ => lfsr_wave(1, 14), // retro
    }
}

/// 1-bit linear feedback shift register noise. `tap` selects the second
/// feedback bit; small taps shorten the period and sound metallic.
fn lfsr_wave(tap: u32, width: u32) -> Vec<f32> {
    let mut reg: u32 = 1;
    let mut wave = Vec::with_capacity(NOISE_WAVE_LENGTH);
    for _ in 0..NOISE_WAVE_LENGTH {
        wave.push(if reg & 1 == 1 { 1.0 } else { -1.0 });
        let feedback = ((reg ^ (reg >> tap)) & 1) << width;
        reg = (reg >> 1) | feedback;
    }
    wave
}

/// Dark breathy noise built in the frequency domain: energy concentrated
/// below ~1/16 of Nyquist with random phases.
fn build_hollow_wave() -> Vec<f32> {
    let mut rng = Pcg32::seed_from_u64(TABLE_SEED ^ 0x4011_0770);
    let half = NOISE_WAVE_LENGTH / 2;
    let mut bins = vec![Complex::new(0.0, 0.0); half];
    for (k, bin) in bins.iter_mut().enumerate().skip(1) {
        let rolloff = 1.0 / (1.0 + (k as f64 / 64.0));
        let phase = rng.gen::<f64>() * std::f64::consts::TAU;
        *bin = phased_bin(rolloff, phase);
    }
    let wave = inverse_real_fft(&bins, NOISE_WAVE_LENGTH);
    normalize_peak(wave)
}

fn normalize_peak(mut wave: Vec<f32>) -> Vec<f32> {
    let peak = wave.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
    if peak > 0.0 {
        let scale = 1.0 / peak;
        for s in wave.iter_mut() {
            *s *= scale;
        }
    }
    wave
}

/// Renders the wave for a 28-point harmonics curve. The result is centered
/// and integrated for the chip-style reader, peak-normalized before
/// integration.
pub fn build_harmonics_wave(controls: &[i32]) -> Vec<f32> {
    let mut bins = vec![Complex::new(0.0, 0.0); HARMONICS_RENDERED + 1];
    let last = controls[HARMONICS_CONTROL_POINTS - 1];
    for harmonic_index in 0..HARMONICS_RENDERED {
        let harmonic_freq = harmonic_index + 1;
        let control_value = if harmonic_index < HARMONICS_CONTROL_POINTS {
            controls[harmonic_index] as f64
        } else {
            // Extend the last control point, fading to silence.
            let fade = 1.0
                - (harmonic_index - HARMONICS_CONTROL_POINTS) as f64
                    / (HARMONICS_RENDERED - HARMONICS_CONTROL_POINTS) as f64;
            last as f64 * fade
        };
        if control_value <= 0.0 {
            continue;
        }
        let normalized = control_value / HARMONICS_CONTROL_MAX as f64;
        let amplitude = 2.0_f64.powf(control_value - HARMONICS_CONTROL_MAX as f64)
            * normalized.sqrt()
            / (harmonic_freq as f64).sqrt();
        bins[harmonic_freq] = sine_bin(amplitude);
    }
    let wave = inverse_real_fft(&bins, HARMONICS_WAVE_LENGTH);
    let wave = normalize_peak(wave);
    let centered: Vec<f64> = center_wave(&wave.iter().map(|&s| s as f64).collect::<Vec<_>>());
    perform_integral(&centered)
}

/// Renders the wave for a 30-point spectrum curve. Control points are
/// spaced logarithmically from a low bin up to near Nyquist; bins between
/// points interpolate amplitude in log-frequency. Phases are randomized
/// (seeded by the curve itself, so the table is reproducible); the voice
/// randomizes its start position at note onset instead.
pub fn build_spectrum_wave(controls: &[i32]) -> Vec<f32> {
    let mut seed = TABLE_SEED;
    for &c in controls {
        seed = seed.wrapping_mul(31).wrapping_add(c as u64);
    }
    let mut rng = Pcg32::seed_from_u64(seed);

    let half = SPECTRUM_WAVE_LENGTH / 2;
    let lowest_bin = 4.0_f64;
    let highest_bin = (half - 1) as f64;
    let log_lo = lowest_bin.log2();
    let log_hi = highest_bin.log2();

    // Control-point amplitudes on their log-spaced bins.
    let point_bin = |i: usize| -> f64 {
        let t = i as f64 / (SPECTRUM_CONTROL_POINTS - 1) as f64;
        2.0_f64.powf(log_lo + (log_hi - log_lo) * t)
    };
    let point_amp = |i: usize| -> f64 {
        let v = controls[i].clamp(0, SPECTRUM_CONTROL_MAX) as f64 / SPECTRUM_CONTROL_MAX as f64;
        v * v * v
    };

    let mut bins = vec![Complex::new(0.0, 0.0); half];
    let mut point = 0usize;
    for k in lowest_bin as usize..half {
        let bin = k as f64;
        while point + 1 < SPECTRUM_CONTROL_POINTS && point_bin(point + 1) < bin {
            point += 1;
        }
        let amp = if point + 1 >= SPECTRUM_CONTROL_POINTS {
            point_amp(SPECTRUM_CONTROL_POINTS - 1)
        } else {
            let lo = point_bin(point).log2();
            let hi = point_bin(point + 1).log2();
            let t = ((bin.log2() - lo) / (hi - lo)).clamp(0.0, 1.0);
            point_amp(point) * (1.0 - t) + point_amp(point + 1) * t
        };
        if amp <= 0.0 {
            continue;
        }
        // Spread energy evenly per octave rather than per bin.
        let density_correction = 1.0 / bin.sqrt();
        let phase = rng.gen::<f64>() * std::f64::consts::TAU;
        bins[k] = phased_bin(amp * density_correction, phase);
    }

    normalize_peak(inverse_real_fft(&bins, SPECTRUM_WAVE_LENGTH))
}

/// Scans forward from `start` for a zero crossing, wrapping around.
/// Spectrum and drumset voices begin playback here so note onsets do not
/// pop.
pub fn nearest_zero_crossing(wave: &[f32], start: usize) -> usize {
    let len = wave.len();
    let mut prev = wave[start % len];
    for offset in 1..len {
        let index = (start + offset) % len;
        let next = wave[index];
        if (prev <= 0.0 && next > 0.0) || (prev >= 0.0 && next < 0.0) {
            return index;
        }
        prev = next;
    }
    start % len
}

/// The integral of a band-limited impulse: a smoothed unit step. The
/// guitar pluck writes the difference of two shifted copies of this into
/// its delay line.
fn build_guitar_impulse_integral() -> Vec<f32> {
    let half = GUITAR_IMPULSE_LENGTH / 2;
    let cutoff = half / 4;
    let mut bins = vec![Complex::new(0.0, 0.0); half];
    for (k, bin) in bins.iter_mut().enumerate().take(cutoff).skip(1) {
        // Hann taper keeps the impulse compact without ringing.
        let window = 0.5 + 0.5 * (std::f64::consts::PI * k as f64 / cutoff as f64).cos();
        *bin = phased_bin(window, 0.0);
    }
    let mut impulse = inverse_real_fft(&bins, GUITAR_IMPULSE_LENGTH);
    // Rotate so the impulse peak sits mid-table with silence either side.
    impulse.rotate_right(half);
    let impulse = normalize_peak(impulse);

    let sum: f32 = impulse.iter().sum();
    let scale = if sum.abs() > 1.0e-12 { 1.0 / sum } else { 1.0 };
    let mut integral = Vec::with_capacity(GUITAR_IMPULSE_LENGTH + 1);
    let mut acc = 0.0f32;
    integral.push(0.0);
    for &s in &impulse {
        acc += s * scale;
        integral.push(acc);
    }
    integral
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sine_table_endpoints() {
        let bank = WaveBank::new();
        assert!(bank.sine[0].abs() < 1e-6);
        assert!(bank.sine[SINE_WAVE_LENGTH].abs() < 1e-6);
        assert!((bank.sine[SINE_WAVE_LENGTH / 4] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_chip_wave_integral_wraps_flat() {
        let bank = WaveBank::new();
        for (i, def) in CHIP_WAVES.iter().enumerate() {
            let wave = bank.chip_wave(i);
            assert_eq!(wave.len(), def.samples.len() + 1);
            // Centered waves integrate to zero over one cycle.
            assert!(
                wave[wave.len() - 1].abs() < 1e-4,
                "wave {} integral should close",
                def.name
            );
        }
    }

    #[test]
    fn test_noise_waves_are_full_scale() {
        let bank = WaveBank::new();
        for (i, def) in NOISE_WAVES.iter().enumerate() {
            let wave = bank.noise_wave(i);
            assert_eq!(wave.len(), NOISE_WAVE_LENGTH);
            let peak = wave.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
            assert!(peak > 0.5, "noise {} should not be near-silent", def.name);
            assert!(peak <= 1.0 + 1e-6);
        }
    }

    #[test]
    fn test_noise_tables_deterministic() {
        let a = WaveBank::new();
        let b = WaveBank::new();
        for i in 0..NOISE_WAVES.len() {
            assert_eq!(a.noise_wave(i), b.noise_wave(i));
        }
    }

    #[test]
    fn test_harmonics_wave_fundamental_only() {
        let mut controls = [0i32; HARMONICS_CONTROL_POINTS];
        controls[0] = HARMONICS_CONTROL_MAX;
        let wave = build_harmonics_wave(&controls);
        assert_eq!(wave.len(), HARMONICS_WAVE_LENGTH + 1);
        // The integral of a sine is flat at the wrap point.
        assert!(wave[HARMONICS_WAVE_LENGTH].abs() < 1e-3);
    }

    #[test]
    fn test_spectrum_wave_reproducible() {
        let mut controls = [0i32; SPECTRUM_CONTROL_POINTS];
        for (i, c) in controls.iter_mut().enumerate() {
            *c = ((i * 5) % (SPECTRUM_CONTROL_MAX as usize + 1)) as i32;
        }
        assert_eq!(build_spectrum_wave(&controls), build_spectrum_wave(&controls));
    }

    #[test]
    fn test_zero_crossing_is_sign_change() {
        let wave: Vec<f32> = (0..64)
            .map(|i| (i as f32 * std::f32::consts::TAU / 64.0).sin())
            .collect();
        let crossing = nearest_zero_crossing(&wave, 5);
        let before = wave[(crossing + 63) % 64];
        let after = wave[crossing];
        assert!(before.signum() != after.signum() || after == 0.0);
    }

    #[test]
    fn test_guitar_impulse_integral_settles_at_one() {
        let bank = WaveBank::new();
        assert!(bank.guitar_impulse_integral_at(-5.0).abs() < 1e-6);
        let settled = bank.guitar_impulse_integral_at(1.0e9);
        assert!((settled - 1.0).abs() < 1e-3, "settled at {settled}");
    }
}
