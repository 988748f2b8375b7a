//! Inverse real FFT helpers for wave-table construction.
//!
//! Spectrum and harmonics instruments describe their timbre in the
//! frequency domain. These helpers turn a half-spectrum into a real
//! waveform by mirroring it into a conjugate-symmetric complex spectrum
//! and running an inverse FFT.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// Renders a real waveform of length `len` (a power of two) from the
/// lower half-spectrum `bins`. `bins[k]` is the complex amplitude of
/// harmonic `k`; entries at and above `len / 2` are ignored.
///
/// The spectrum is mirrored conjugate-symmetrically, so a bin built with
/// [`sine_bin`]`(a)` at index `k` contributes `a·sin(2πki/len)` to the
/// output.
pub fn inverse_real_fft(bins: &[Complex<f64>], len: usize) -> Vec<f32> {
    debug_assert!(len.is_power_of_two());
    let mut spectrum = vec![Complex::new(0.0, 0.0); len];
    let half = len / 2;
    for (k, &bin) in bins.iter().enumerate().take(half).skip(1) {
        spectrum[k] = bin;
        spectrum[len - k] = bin.conj();
    }
    if let Some(&dc) = bins.first() {
        spectrum[0] = Complex::new(dc.re, 0.0);
    }

    // rustfft's inverse transform is the unnormalized sum
    // Σₖ X[k]·e^(+j2πki/N), which is exactly the synthesis we want: no
    // further scaling needed for a hand-built spectrum.
    let mut planner = FftPlanner::new();
    let ifft = planner.plan_fft_inverse(len);
    ifft.process(&mut spectrum);

    spectrum.iter().map(|c| c.re as f32).collect()
}

/// A sine harmonic of amplitude `amp` (the waveform starts at zero).
pub fn sine_bin(amp: f64) -> Complex<f64> {
    Complex::new(0.0, -amp * 0.5)
}

/// A harmonic of amplitude `amp` with phase `phase` radians, contributing
/// `amp·cos(2πki/len + phase)`.
pub fn phased_bin(amp: f64, phase: f64) -> Complex<f64> {
    Complex::from_polar(amp * 0.5, phase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_single_bin_is_sinusoid() {
        let mut bins = vec![Complex::new(0.0, 0.0); 8];
        bins[3] = sine_bin(1.0);
        let wave = inverse_real_fft(&bins, 256);
        for (i, &s) in wave.iter().enumerate() {
            let expected = (2.0 * std::f64::consts::PI * 3.0 * i as f64 / 256.0).sin();
            assert_relative_eq!(s as f64, expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_phased_bin_at_zero_phase_is_cosine() {
        let mut bins = vec![Complex::new(0.0, 0.0); 8];
        bins[1] = phased_bin(1.0, 0.0);
        let wave = inverse_real_fft(&bins, 64);
        assert_relative_eq!(wave[0] as f64, 1.0, epsilon = 1e-6);
        assert_relative_eq!(wave[16] as f64, 0.0, epsilon = 1e-6);
        assert_relative_eq!(wave[32] as f64, -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_output_has_no_dc_without_dc_bin() {
        let mut bins = vec![Complex::new(0.0, 0.0); 16];
        bins[1] = sine_bin(1.0);
        bins[5] = sine_bin(0.25);
        let wave = inverse_real_fft(&bins, 512);
        let mean: f64 = wave.iter().map(|&s| s as f64).sum::<f64>() / wave.len() as f64;
        assert!(mean.abs() < 1e-9);
    }

    #[test]
    fn test_superposition() {
        let mut bins_a = vec![Complex::new(0.0, 0.0); 8];
        let mut bins_b = vec![Complex::new(0.0, 0.0); 8];
        let mut bins_ab = vec![Complex::new(0.0, 0.0); 8];
        bins_a[2] = sine_bin(0.7);
        bins_b[5] = sine_bin(0.3);
        bins_ab[2] = sine_bin(0.7);
        bins_ab[5] = sine_bin(0.3);
        let a = inverse_real_fft(&bins_a, 128);
        let b = inverse_real_fft(&bins_b, 128);
        let ab = inverse_real_fft(&bins_ab, 128);
        for i in 0..128 {
            assert_relative_eq!(a[i] + b[i], ab[i], epsilon = 1e-5);
        }
    }
}
