//! Translators for settings stored by song format versions before 9.
//!
//! Old songs stored one simplified filter per instrument as a cutoff and
//! resonance pair. The modern model is a list of biquad control points,
//! so the decoder collects the legacy values while scanning tags and this
//! module converts them afterwards, aiming the modern 2nd-order filter at
//! the response the legacy 1st- or 2nd-order filter had at its reference
//! sample rate.

use std::f64::consts::PI;

use crate::constants::{
    ENVELOPES, FILTER_FREQ_MAX_HZ, FILTER_FREQ_RANGE, FILTER_FREQ_STEP, FILTER_GAIN_CENTER,
    FILTER_GAIN_RANGE, FILTER_GAIN_STEP, LEGACY_FILTER_SAMPLE_RATE,
};
use crate::constants::EnvelopeCurve;
use crate::dsp::filter::FilterCoefficients;
use crate::song::{EffectFlags, FilterControlPoint, FilterType, InstrumentKind};

/// Legacy cutoff slider range (0..=10, 10 = fully open).
pub const LEGACY_CUTOFF_RANGE: i32 = 11;
/// Legacy resonance slider range (0..=7).
pub const LEGACY_RESONANCE_RANGE: i32 = 8;
/// Half an octave per legacy cutoff step.
const LEGACY_CUTOFF_OCTAVE_STEP: f64 = 0.5;
/// The legacy filter never ran right up against Nyquist.
const LEGACY_MAX_RADIANS: f64 = PI * 0.85;
/// How far the 1st-order cutoff migrates up when re-expressed as a
/// 2nd-order section.
const FIRST_ORDER_EXTRA_OCTAVES: f64 = 3.5;

/// Legacy filter values collected per instrument while decoding.
#[derive(Debug, Clone, Copy)]
pub struct LegacyFilterSettings {
    /// 0..=10; 10 leaves the filter open.
    pub cutoff: i32,
    /// 0..=7; 0 selects the 1st-order filter.
    pub resonance: i32,
    /// Envelope index applied to the legacy cutoff.
    pub envelope: usize,
}

impl Default for LegacyFilterSettings {
    fn default() -> Self {
        LegacyFilterSettings {
            cutoff: LEGACY_CUTOFF_RANGE - 1,
            resonance: 0,
            envelope: 1, // steady
        }
    }
}

/// Effects enum used by format versions before 6, in stored order.
pub fn legacy_effects_from_index(index: usize) -> EffectFlags {
    match index {
        1 => EffectFlags::REVERB,
        2 => EffectFlags::CHORUS,
        3 => EffectFlags::CHORUS | EffectFlags::REVERB,
        _ => EffectFlags::empty(),
    }
}

/// Inverse of [`legacy_effects_from_index`], for writing old-version test
/// fixtures.
pub fn legacy_effects_to_index(effects: EffectFlags) -> usize {
    match (
        effects.contains(EffectFlags::CHORUS),
        effects.contains(EffectFlags::REVERB),
    ) {
        (false, false) => 0,
        (false, true) => 1,
        (true, false) => 2,
        (true, true) => 3,
    }
}

fn envelope_decays(envelope: usize) -> bool {
    matches!(
        ENVELOPES[envelope.min(ENVELOPES.len() - 1)].curve,
        EnvelopeCurve::Twang | EnvelopeCurve::Decay | EnvelopeCurve::Flare
    )
}

fn rounded_freq_setting_from_hz(hz: f64) -> i32 {
    let setting =
        (FILTER_FREQ_RANGE - 1) as f64 + (hz / FILTER_FREQ_MAX_HZ).log2() / FILTER_FREQ_STEP;
    (setting.round() as i32).clamp(0, FILTER_FREQ_RANGE - 1)
}

fn rounded_gain_setting_from_linear(gain: f64) -> i32 {
    let setting = FILTER_GAIN_CENTER as f64 + gain.log2() / FILTER_GAIN_STEP;
    (setting.round() as i32).clamp(0, FILTER_GAIN_RANGE - 1)
}

/// The simplified one-pole the legacy format modeled: `y += g·(x − y)`.
fn legacy_first_order_magnitude(corner: f64, at_radians: f64) -> f64 {
    let g = 2.0 * (corner * 0.5).sin();
    let coefficients = FilterCoefficients {
        b0: g,
        b1: 0.0,
        b2: 0.0,
        a1: g - 1.0,
        a2: 0.0,
        order: 1,
    };
    coefficients.magnitude_at(at_radians)
}

/// Converts one instrument's legacy cutoff/resonance pair into at most one
/// modern filter control point.
pub fn translate_legacy_filter(
    settings: &LegacyFilterSettings,
    kind: InstrumentKind,
) -> Option<FilterControlPoint> {
    // Drumsets shape each drum with its own spectrum and envelope; the
    // legacy slider never applied to them.
    if kind == InstrumentKind::Drumset {
        return None;
    }

    let cutoff = settings.cutoff.clamp(0, LEGACY_CUTOFF_RANGE - 1);
    let resonance = settings.resonance.clamp(0, LEGACY_RESONANCE_RANGE - 1);
    let first_order = resonance == 0;
    let resonant = resonance > 1;
    let cutoff_at_max = cutoff == LEGACY_CUTOFF_RANGE - 1;
    let envelope_is_steady =
        ENVELOPES[settings.envelope.min(ENVELOPES.len() - 1)].curve == EnvelopeCurve::Steady;

    if envelope_is_steady && cutoff_at_max && first_order {
        // Fully open, unmodulated, non-resonant: the filter was inaudible.
        return None;
    }

    let legacy_hz = FILTER_FREQ_MAX_HZ
        * 2.0_f64.powf((cutoff - (LEGACY_CUTOFF_RANGE - 1)) as f64 * LEGACY_CUTOFF_OCTAVE_STEP);
    let legacy_radians =
        (2.0 * PI * legacy_hz / LEGACY_FILTER_SAMPLE_RATE).min(LEGACY_MAX_RADIANS);

    if first_order {
        // The one-pole rolled off so gently that its audible corner sat
        // far above the nominal cutoff. Move the 2nd-order cutoff up and
        // compensate with a gain that matches the old response there.
        let target_radians = legacy_radians * 2.0_f64.powf(FIRST_ORDER_EXTRA_OCTAVES);
        let curved_radians = target_radians / (1.0 + target_radians / PI);
        let curved_hz = LEGACY_FILTER_SAMPLE_RATE * curved_radians / (2.0 * PI);
        let freq_setting = rounded_freq_setting_from_hz(curved_hz);
        let final_hz = FilterControlPoint::hz_from_setting(freq_setting as f64);
        let final_radians = 2.0 * PI * final_hz / LEGACY_FILTER_SAMPLE_RATE;

        let magnitude = legacy_first_order_magnitude(legacy_radians, final_radians).max(1.0e-6);
        let mut log_gain = magnitude.log2();
        // Bias toward the plain -3.5 octave slope so extreme cutoffs do
        // not produce outlandish gains.
        log_gain = -FIRST_ORDER_EXTRA_OCTAVES + (log_gain + FIRST_ORDER_EXTRA_OCTAVES) * 0.82;
        if envelope_decays(settings.envelope) {
            log_gain = log_gain.min(-2.0);
        }
        let gain_setting = rounded_gain_setting_from_linear(2.0_f64.powf(log_gain));
        Some(FilterControlPoint::new(
            FilterType::LowPass,
            freq_setting,
            gain_setting,
        ))
    } else {
        // 2nd order: keep the resonance peak the old filter advertised.
        let intended_gain = 2.0_f64.powf((resonance - 1).max(0) as f64 * 0.5);
        let curved_radians = legacy_radians / (1.0 + legacy_radians / PI);
        let curved_hz = LEGACY_FILTER_SAMPLE_RATE * curved_radians / (2.0 * PI);
        let freq_setting = rounded_freq_setting_from_hz(curved_hz);
        let gain = if resonant {
            intended_gain
        } else {
            intended_gain.min(std::f64::consts::FRAC_1_SQRT_2)
        };
        let gain_setting = rounded_gain_setting_from_linear(gain);
        Some(FilterControlPoint::new(
            FilterType::LowPass,
            freq_setting,
            gain_setting,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flat_filter_emits_nothing() {
        let settings = LegacyFilterSettings::default();
        assert!(translate_legacy_filter(&settings, InstrumentKind::Chip).is_none());
    }

    #[test]
    fn test_drumset_never_translates() {
        let settings = LegacyFilterSettings {
            cutoff: 3,
            resonance: 5,
            envelope: 1,
        };
        assert!(translate_legacy_filter(&settings, InstrumentKind::Drumset).is_none());
    }

    #[test]
    fn test_first_order_migrates_up_with_negative_gain() {
        let settings = LegacyFilterSettings {
            cutoff: 5,
            resonance: 0,
            envelope: 1,
        };
        let point = translate_legacy_filter(&settings, InstrumentKind::Chip).unwrap();
        assert_eq!(point.kind, FilterType::LowPass);
        // The migrated cutoff sits well above the legacy one...
        let legacy_hz = FILTER_FREQ_MAX_HZ * 2.0_f64.powf((5 - 10) as f64 * 0.5);
        assert!(point.hz() > legacy_hz * 4.0);
        // ...with an attenuating gain to match the old rolloff.
        assert!(point.linear_gain() < 1.0);
    }

    #[test]
    fn test_decaying_envelope_caps_gain() {
        let flare = ENVELOPES.iter().position(|e| e.name == "twang 2").unwrap();
        let settings = LegacyFilterSettings {
            cutoff: 5,
            resonance: 0,
            envelope: flare,
        };
        let point = translate_legacy_filter(&settings, InstrumentKind::Chip).unwrap();
        assert!(point.linear_gain() <= 2.0_f64.powf(-2.0) * 1.2);
    }

    #[test]
    fn test_non_resonant_second_order_clamps_at_butterworth() {
        let settings = LegacyFilterSettings {
            cutoff: 6,
            resonance: 1,
            envelope: 1,
        };
        let point = translate_legacy_filter(&settings, InstrumentKind::Chip).unwrap();
        assert!(point.linear_gain() <= std::f64::consts::FRAC_1_SQRT_2 * 1.3);
    }

    #[test]
    fn test_resonant_second_order_keeps_peak() {
        let settings = LegacyFilterSettings {
            cutoff: 6,
            resonance: 7,
            envelope: 1,
        };
        let point = translate_legacy_filter(&settings, InstrumentKind::Chip).unwrap();
        assert!(point.linear_gain() > 2.0);
    }

    #[test]
    fn test_legacy_effects_round_trip() {
        for index in 0..4 {
            assert_eq!(legacy_effects_to_index(legacy_effects_from_index(index)), index);
        }
    }
}
