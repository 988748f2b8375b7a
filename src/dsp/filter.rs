//! Biquad filter kit.
//!
//! Static coefficient helpers cover the filter shapes the engine needs:
//! 1st- and 2nd-order Butterworth low/high pass with a resonance gain,
//! a constant-Q peaking section, a 1st-order high shelf, and the two
//! all-pass forms used by the guitar voice. The [`DynamicBiquad`] applies
//! a Direct Form I difference equation while linearly interpolating all
//! five coefficients per sample, so filter sweeps stay click-free.

use std::f64::consts::PI;

/// Up to 2nd-order filter coefficients, normalized so `a0 == 1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterCoefficients {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
    pub order: usize,
}

impl FilterCoefficients {
    /// A transparent 0th-order gain stage.
    pub fn gain(linear_gain: f64) -> Self {
        FilterCoefficients {
            b0: linear_gain,
            order: 0,
            ..Default::default()
        }
    }

    /// 1st-order Butterworth low-pass at `corner` radians per sample.
    pub fn low_pass_1st_order(corner: f64) -> Self {
        let g = 1.0 / (corner * 0.5).tan();
        let a0 = 1.0 + g;
        FilterCoefficients {
            b0: 1.0 / a0,
            b1: 1.0 / a0,
            a1: (1.0 - g) / a0,
            order: 1,
            ..Default::default()
        }
    }

    /// 1st-order Butterworth high-pass at `corner` radians per sample.
    pub fn high_pass_1st_order(corner: f64) -> Self {
        let g = 1.0 / (corner * 0.5).tan();
        let a0 = 1.0 + g;
        FilterCoefficients {
            b0: g / a0,
            b1: -g / a0,
            a1: (1.0 - g) / a0,
            order: 1,
            ..Default::default()
        }
    }

    /// 2nd-order Butterworth low-pass. `peak_linear_gain` is the gain at
    /// the corner; 1.0 gives the flat Butterworth response.
    pub fn low_pass_2nd_order(corner: f64, peak_linear_gain: f64) -> Self {
        let alpha = corner.sin() / (2.0 * peak_linear_gain.sqrt());
        let cos = corner.cos();
        let a0 = 1.0 + alpha;
        FilterCoefficients {
            b0: ((1.0 - cos) * 0.5) / a0,
            b1: (1.0 - cos) / a0,
            b2: ((1.0 - cos) * 0.5) / a0,
            a1: (-2.0 * cos) / a0,
            a2: (1.0 - alpha) / a0,
            order: 2,
        }
    }

    /// 2nd-order Butterworth high-pass with a resonance gain at the corner.
    pub fn high_pass_2nd_order(corner: f64, peak_linear_gain: f64) -> Self {
        let alpha = corner.sin() / (2.0 * peak_linear_gain.sqrt());
        let cos = corner.cos();
        let a0 = 1.0 + alpha;
        FilterCoefficients {
            b0: ((1.0 + cos) * 0.5) / a0,
            b1: -(1.0 + cos) / a0,
            b2: ((1.0 + cos) * 0.5) / a0,
            a1: (-2.0 * cos) / a0,
            a2: (1.0 - alpha) / a0,
            order: 2,
        }
    }

    /// Constant-Q 2nd-order peak/notch at `corner` radians per sample.
    /// The bandwidth narrows as the gain departs from unity so the skirt
    /// stays put while the peak grows.
    pub fn peak_2nd_order(corner: f64, peak_linear_gain: f64, band_width_scale: f64) -> Self {
        let sqrt_gain = peak_linear_gain.sqrt();
        let band_width = band_width_scale * corner
            / if sqrt_gain >= 1.0 { sqrt_gain } else { 1.0 / sqrt_gain };
        let alpha = (band_width * 0.5).tan();
        let a0 = 1.0 + alpha / sqrt_gain;
        FilterCoefficients {
            b0: (1.0 + alpha * sqrt_gain) / a0,
            b1: (-2.0 * corner.cos()) / a0,
            b2: (1.0 - alpha * sqrt_gain) / a0,
            a1: (-2.0 * corner.cos()) / a0,
            a2: (1.0 - alpha / sqrt_gain) / a0,
            order: 2,
        }
    }

    /// 1st-order high shelf. Frequencies above `corner` are scaled by
    /// `shelf_linear_gain`.
    pub fn high_shelf_1st_order(corner: f64, shelf_linear_gain: f64) -> Self {
        let tan = (corner * 0.5).tan();
        let sqrt_gain = shelf_linear_gain.sqrt();
        let g = (tan * sqrt_gain - 1.0) / (tan * sqrt_gain + 1.0);
        FilterCoefficients {
            b0: (1.0 + g + shelf_linear_gain * (1.0 - g)) * 0.5,
            b1: (1.0 + g - shelf_linear_gain * (1.0 - g)) * 0.5,
            a1: g,
            order: 1,
            ..Default::default()
        }
    }

    /// 1st-order all-pass that inverts phase above `corner` radians per
    /// sample. The guitar voice uses this for string dispersion.
    pub fn all_pass_1st_order_invert_above(corner: f64) -> Self {
        let g = (corner.sin() - 1.0) / corner.cos();
        FilterCoefficients {
            b0: g,
            b1: 1.0,
            a1: g,
            order: 1,
            ..Default::default()
        }
    }

    /// 1st-order fractional-delay all-pass: `y = g·x + x₋₁ − g·y₋₁` with
    /// `g = (1−d)/(1+d)`, approximating a delay of `d` samples at low
    /// frequencies.
    pub fn all_pass_1st_order_fractional_delay(delay: f64) -> Self {
        let g = (1.0 - delay) / (1.0 + delay);
        FilterCoefficients {
            b0: g,
            b1: 1.0,
            a1: g,
            order: 1,
            ..Default::default()
        }
    }

    /// Linear response magnitude at `radians_per_sample`.
    pub fn magnitude_at(&self, radians_per_sample: f64) -> f64 {
        let (re1, im1) = (radians_per_sample.cos(), -radians_per_sample.sin());
        let (re2, im2) = (
            (2.0 * radians_per_sample).cos(),
            -(2.0 * radians_per_sample).sin(),
        );
        let num_re = self.b0 + self.b1 * re1 + self.b2 * re2;
        let num_im = self.b1 * im1 + self.b2 * im2;
        let den_re = 1.0 + self.a1 * re1 + self.a2 * re2;
        let den_im = self.a1 * im1 + self.a2 * im2;
        ((num_re * num_re + num_im * num_im) / (den_re * den_re + den_im * den_im)).sqrt()
    }

    /// Phase delay in samples at `radians_per_sample`. The plucked-string
    /// voice subtracts this from its loop length so the string stays in
    /// tune after its dispersion and decay filters.
    pub fn phase_delay_at(&self, radians_per_sample: f64) -> f64 {
        let (re1, im1) = (radians_per_sample.cos(), -radians_per_sample.sin());
        let (re2, im2) = (
            (2.0 * radians_per_sample).cos(),
            -(2.0 * radians_per_sample).sin(),
        );
        let num_re = self.b0 + self.b1 * re1 + self.b2 * re2;
        let num_im = self.b1 * im1 + self.b2 * im2;
        let den_re = 1.0 + self.a1 * re1 + self.a2 * re2;
        let den_im = self.a1 * im1 + self.a2 * im2;
        // arg(num/den)
        let phase = (num_im * den_re - num_re * den_im).atan2(num_re * den_re + num_im * den_im);
        -phase / radians_per_sample
    }

    /// Whether both poles lie strictly inside the unit circle.
    pub fn is_stable(&self) -> bool {
        match self.order {
            0 => true,
            1 => self.a1.abs() < 1.0,
            // Jury criterion for z^2 + a1 z + a2.
            _ => self.a2.abs() < 1.0 && (1.0 + self.a2) > self.a1.abs(),
        }
    }
}

/// A biquad whose coefficients ramp linearly each sample, Direct Form I.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynamicBiquad {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
    b0_delta: f64,
    b1_delta: f64,
    b2_delta: f64,
    a1_delta: f64,
    a2_delta: f64,
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl DynamicBiquad {
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets coefficients to `start` and arranges for them to reach `end`
    /// after `1.0 / delta_rate` samples.
    pub fn load_coefficients_with_gradient(
        &mut self,
        start: &FilterCoefficients,
        end: &FilterCoefficients,
        delta_rate: f64,
    ) {
        self.b0 = start.b0;
        self.b1 = start.b1;
        self.b2 = start.b2;
        self.a1 = start.a1;
        self.a2 = start.a2;
        self.b0_delta = (end.b0 - start.b0) * delta_rate;
        self.b1_delta = (end.b1 - start.b1) * delta_rate;
        self.b2_delta = (end.b2 - start.b2) * delta_rate;
        self.a1_delta = (end.a1 - start.a1) * delta_rate;
        self.a2_delta = (end.a2 - start.a2) * delta_rate;
    }

    /// Filters one sample and advances the coefficient ramp.
    #[inline]
    pub fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        self.b0 += self.b0_delta;
        self.b1 += self.b1_delta;
        self.b2 += self.b2_delta;
        self.a1 += self.a1_delta;
        self.a2 += self.a2_delta;
        y
    }

    /// Clears the sample history, keeping the coefficients.
    pub fn reset_output(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }

    /// Clamps runaway or denormal history values to zero. Returns true if
    /// anything was touched.
    pub fn sanitize(&mut self) -> bool {
        let mut dirty = false;
        for v in [&mut self.x1, &mut self.x2, &mut self.y1, &mut self.y2] {
            if !v.is_finite() || v.abs() > 100.0 {
                *v = 0.0;
                dirty = true;
            } else if v.abs() < 1.0e-24 && *v != 0.0 {
                *v = 0.0;
                dirty = true;
            }
        }
        dirty
    }
}

/// Angular frequency in radians per sample, clamped shy of Nyquist.
pub fn radians_per_sample(hz: f64, sample_rate: f64) -> f64 {
    (2.0 * PI * hz / sample_rate).clamp(1.0e-6, PI * 0.9999)
}
