//! Instrument model.
//!
//! An instrument is a variant-tagged bundle: the kind selects which synth
//! loop renders it, while the remaining fields are kept flat because the
//! codec writes them independently of the kind (a tag may arrive before
//! the kind switch, and switching kinds in an editor preserves the other
//! settings).

use bitflags::bitflags;
use num_derive::FromPrimitive;

use crate::constants::{
    DRUM_COUNT, FILTER_FREQ_MAX_HZ, FILTER_FREQ_RANGE, FILTER_FREQ_STEP, FILTER_GAIN_CENTER,
    FILTER_GAIN_STEP, HARMONICS_CONTROL_MAX, HARMONICS_CONTROL_POINTS, OPERATOR_COUNT,
    SPECTRUM_CONTROL_MAX, SPECTRUM_CONTROL_POINTS,
};
use crate::dsp::filter::{radians_per_sample, FilterCoefficients};

/// Which synth loop renders an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum InstrumentKind {
    /// Wavetable oscillator pair reading a chip wave.
    Chip = 0,
    /// Four-operator frequency modulation.
    Fm = 1,
    /// LFSR noise (noise channels).
    Noise = 2,
    /// FFT-built spectral noise (noise channels).
    Spectrum = 3,
    /// Twelve spectral drums (noise channels).
    Drumset = 4,
    /// Wavetable oscillator pair reading a custom harmonics wave.
    Harmonics = 5,
    /// Pulse-width-modulated saw pair.
    Pwm = 6,
    /// Plucked string with dispersion.
    Guitar = 7,
}

impl InstrumentKind {
    /// Whether this kind belongs in a noise channel.
    pub fn is_noise(self) -> bool {
        matches!(
            self,
            InstrumentKind::Noise | InstrumentKind::Spectrum | InstrumentKind::Drumset
        )
    }
}

bitflags! {
    /// Which stages of the effects chain are enabled for an instrument.
    /// Stored in the song format's effects bitmask tag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EffectFlags: u32 {
        /// Feedback-delay-network reverb.
        const REVERB = 1 << 0;
        /// Six-tap stereo chorus.
        const CHORUS = 1 << 1;
        /// Cosine-law stereo panning with a short delay split.
        const PANNING = 1 << 2;
        /// Soft-clip distortion.
        const DISTORTION = 1 << 3;
        /// Sample-and-hold plus quantization.
        const BITCRUSHER = 1 << 4;
        /// The instrument's second filter stack, applied post-distortion.
        const EFFECT_FILTER = 1 << 5;
    }
}

/// The shape of one filter control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum FilterType {
    /// 2nd-order Butterworth low-pass with resonance gain.
    LowPass = 0,
    /// 2nd-order Butterworth high-pass with resonance gain.
    HighPass = 1,
    /// Constant-Q peak or notch.
    Peak = 2,
}

/// One biquad stage of a filter cascade, in setting units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterControlPoint {
    pub kind: FilterType,
    /// Frequency setting, 0..[`FILTER_FREQ_RANGE`].
    pub freq: i32,
    /// Gain setting, 0..[`crate::constants::FILTER_GAIN_RANGE`]; the
    /// center is unity.
    pub gain: i32,
}

impl FilterControlPoint {
    pub fn new(kind: FilterType, freq: i32, gain: i32) -> Self {
        FilterControlPoint { kind, freq, gain }
    }

    /// Cutoff/center frequency in Hz for a (possibly fractional,
    /// envelope-scaled) frequency setting.
    pub fn hz_from_setting(setting: f64) -> f64 {
        FILTER_FREQ_MAX_HZ * 2.0_f64.powf((setting - (FILTER_FREQ_RANGE - 1) as f64) * FILTER_FREQ_STEP)
    }

    /// This point's frequency in Hz.
    pub fn hz(&self) -> f64 {
        Self::hz_from_setting(self.freq as f64)
    }

    /// This point's linear gain.
    pub fn linear_gain(&self) -> f64 {
        2.0_f64.powf((self.gain - FILTER_GAIN_CENTER) as f64 * FILTER_GAIN_STEP)
    }

    /// Coefficients for this point with an envelope multiplier applied to
    /// the frequency setting.
    pub fn to_coefficients(&self, sample_rate: f64, freq_env_mult: f64) -> FilterCoefficients {
        let setting = (self.freq as f64 * freq_env_mult).clamp(0.0, (FILTER_FREQ_RANGE - 1) as f64);
        let corner = radians_per_sample(Self::hz_from_setting(setting), sample_rate);
        let gain = self.linear_gain();
        match self.kind {
            FilterType::LowPass => FilterCoefficients::low_pass_2nd_order(corner, gain),
            FilterType::HighPass => FilterCoefficients::high_pass_2nd_order(corner, gain),
            FilterType::Peak => FilterCoefficients::peak_2nd_order(corner, gain, 1.0),
        }
    }

    /// A scalar that counteracts the perceptual loudness change this
    /// point introduces, so sweeping a filter does not pump the mix.
    pub fn volume_compensation(&self) -> f64 {
        let gain = self.linear_gain();
        let octaves_below_max = ((FILTER_FREQ_RANGE - 1 - self.freq).max(0) as f64) * FILTER_FREQ_STEP;
        match self.kind {
            FilterType::LowPass => {
                // A descending cutoff removes more and more treble.
                let loss = (octaves_below_max / 10.0).min(1.0);
                (1.0 + loss * 0.8) / gain.max(1.0).sqrt()
            }
            FilterType::HighPass => {
                // Cutting lows costs less perceived loudness than treble.
                let octaves_above_min = (self.freq.max(0) as f64) * FILTER_FREQ_STEP;
                let loss = (octaves_above_min / 12.0).min(1.0);
                (1.0 + loss * 0.4) / gain.max(1.0).sqrt()
            }
            FilterType::Peak => {
                if gain >= 1.0 {
                    1.0 / gain.sqrt()
                } else {
                    1.0 + (1.0 - gain) * 0.25
                }
            }
        }
    }
}

/// An ordered filter cascade, one control point per biquad stage.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterSettings {
    pub points: Vec<FilterControlPoint>,
}

impl FilterSettings {
    /// Product of the per-point volume compensations, capped at 3.
    pub fn volume_compensation(&self) -> f64 {
        let product: f64 = self.points.iter().map(|p| p.volume_compensation()).product();
        product.min(3.0)
    }
}

/// One FM operator's settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operator {
    /// Index into [`crate::constants::OPERATOR_FREQUENCIES`].
    pub frequency: usize,
    /// 0..=[`crate::constants::OPERATOR_AMPLITUDE_MAX`].
    pub amplitude: i32,
    /// Index into [`crate::constants::ENVELOPES`].
    pub envelope: usize,
}

impl Default for Operator {
    fn default() -> Self {
        Operator {
            frequency: 0,
            amplitude: 0,
            envelope: 1, // steady
        }
    }
}

/// A 30-point spectral envelope for the spectrum instrument and drumset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpectrumWave {
    pub spectrum: [i32; SPECTRUM_CONTROL_POINTS],
}

impl SpectrumWave {
    /// The default rolloff curve for pitched spectrum instruments.
    pub fn default_pitched() -> Self {
        let mut spectrum = [0; SPECTRUM_CONTROL_POINTS];
        for (i, s) in spectrum.iter_mut().enumerate() {
            *s = if i < 8 {
                SPECTRUM_CONTROL_MAX
            } else {
                (SPECTRUM_CONTROL_MAX - (i as i32 - 8) / 2).max(0)
            };
        }
        SpectrumWave { spectrum }
    }

    /// The default curve for drum `index` within a drumset: lower drums
    /// keep more low end.
    pub fn default_drum(index: usize) -> Self {
        let mut spectrum = [0; SPECTRUM_CONTROL_POINTS];
        let center = 4 + 2 * index as i32;
        for (i, s) in spectrum.iter_mut().enumerate() {
            let distance = (i as i32 - center).abs();
            *s = (SPECTRUM_CONTROL_MAX - distance).max(0);
        }
        SpectrumWave { spectrum }
    }
}

impl Default for SpectrumWave {
    fn default() -> Self {
        Self::default_pitched()
    }
}

/// A 28-point harmonic amplitude curve for the harmonics instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarmonicsWave {
    pub harmonics: [i32; HARMONICS_CONTROL_POINTS],
}

impl Default for HarmonicsWave {
    fn default() -> Self {
        let mut harmonics = [0; HARMONICS_CONTROL_POINTS];
        harmonics[0] = HARMONICS_CONTROL_MAX;
        harmonics[3] = HARMONICS_CONTROL_MAX - 2;
        harmonics[6] = HARMONICS_CONTROL_MAX - 4;
        HarmonicsWave { harmonics }
    }
}

/// All settings for one instrument slot.
///
/// Fields outside the active kind's concern are retained (and round-trip
/// through the codec for the active kind only).
#[derive(Debug, Clone, PartialEq)]
pub struct Instrument {
    pub kind: InstrumentKind,
    /// Volume slider, 0 (loudest) ..< [`crate::constants::VOLUME_RANGE`].
    pub volume: i32,
    /// Preset id, round-tripped verbatim.
    pub preset: usize,
    /// The main filter cascade.
    pub filter: FilterSettings,
    /// The post-distortion filter cascade (the "effect filter").
    pub effect_filter: FilterSettings,
    /// Envelope applied to the main filter's frequency settings.
    pub filter_envelope: usize,
    /// Index into [`crate::constants::TRANSITIONS`].
    pub transition: usize,
    /// Index into [`crate::constants::CHORDS`].
    pub chord: usize,
    /// Index into [`crate::constants::VIBRATOS`].
    pub vibrato: usize,
    /// Index into [`crate::constants::INTERVALS`].
    pub interval: usize,
    pub effects: EffectFlags,
    /// Distortion amount, 0..[`crate::constants::DISTORTION_RANGE`].
    pub distortion: i32,
    /// Bitcrusher sample-and-hold rate setting.
    pub bitcrusher_freq: i32,
    /// Bitcrusher quantization depth setting.
    pub bitcrusher_quantization: i32,
    /// Stereo position, 0..=[`crate::constants::PAN_MAX`], center at
    /// [`crate::constants::PAN_CENTER`].
    pub pan: i32,
    /// Reverb send, 0..[`crate::constants::REVERB_RANGE`].
    pub reverb: i32,

    // Chip
    pub chip_wave: usize,
    // Noise
    pub noise_wave: usize,
    // FM
    pub algorithm: usize,
    pub feedback_type: usize,
    pub feedback_amplitude: i32,
    pub feedback_envelope: usize,
    pub operators: [Operator; OPERATOR_COUNT],
    // Spectrum
    pub spectrum_wave: SpectrumWave,
    // Harmonics
    pub harmonics_wave: HarmonicsWave,
    // PWM
    pub pulse_width: i32,
    pub pulse_envelope: usize,
    // Guitar
    pub sustain: i32,
    pub guitar_pulse_width: i32,
    // Drumset
    pub drumset_envelopes: [usize; DRUM_COUNT],
    pub drumset_spectrum_waves: Vec<SpectrumWave>,
}

impl Instrument {
    /// A fresh instrument of the given kind with that kind's defaults.
    pub fn new(kind: InstrumentKind) -> Self {
        let mut instrument = Instrument {
            kind,
            volume: 0,
            preset: kind as usize,
            filter: FilterSettings::default(),
            effect_filter: FilterSettings::default(),
            filter_envelope: 1,
            transition: 1,
            chord: if kind == InstrumentKind::Fm { 3 } else { 0 },
            vibrato: 0,
            interval: 0,
            effects: EffectFlags::empty(),
            distortion: 0,
            bitcrusher_freq: 0,
            bitcrusher_quantization: 0,
            pan: crate::constants::PAN_CENTER,
            reverb: 0,
            chip_wave: 2, // square
            noise_wave: 0,
            algorithm: 0,
            feedback_type: 0,
            feedback_amplitude: 0,
            feedback_envelope: 1,
            operators: [Operator::default(); OPERATOR_COUNT],
            spectrum_wave: SpectrumWave::default_pitched(),
            harmonics_wave: HarmonicsWave::default(),
            pulse_width: crate::constants::PULSE_WIDTH_RANGE / 2,
            pulse_envelope: 1,
            sustain: 6,
            guitar_pulse_width: crate::constants::GUITAR_PULSE_WIDTH_RANGE / 2,
            drumset_envelopes: [1; DRUM_COUNT],
            drumset_spectrum_waves: (0..DRUM_COUNT).map(SpectrumWave::default_drum).collect(),
        };
        if kind == InstrumentKind::Fm {
            instrument.operators[0].amplitude = crate::constants::OPERATOR_AMPLITUDE_MAX;
        }
        instrument
    }

    /// The default instrument for a channel type.
    pub fn default_for_channel(is_noise: bool) -> Self {
        if is_noise {
            Instrument::new(InstrumentKind::Noise)
        } else {
            Instrument::new(InstrumentKind::Chip)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FILTER_GAIN_RANGE;

    #[test]
    fn test_filter_point_hz_endpoints() {
        let top = FilterControlPoint::new(FilterType::LowPass, FILTER_FREQ_RANGE - 1, FILTER_GAIN_CENTER);
        assert!((top.hz() - FILTER_FREQ_MAX_HZ).abs() < 1e-9);
        let bottom = FilterControlPoint::new(FilterType::LowPass, 0, FILTER_GAIN_CENTER);
        assert!(bottom.hz() < top.hz() / 100.0);
    }

    #[test]
    fn test_filter_point_center_gain_is_unity() {
        let point = FilterControlPoint::new(FilterType::Peak, 10, FILTER_GAIN_CENTER);
        assert!((point.linear_gain() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_volume_compensation_capped() {
        let mut settings = FilterSettings::default();
        for _ in 0..8 {
            settings.points.push(FilterControlPoint::new(FilterType::LowPass, 0, 0));
        }
        assert!(settings.volume_compensation() <= 3.0);
    }

    #[test]
    fn test_volume_compensation_directions() {
        // A resonant peak gets quieter, an attenuating low-pass louder.
        let peak = FilterControlPoint::new(FilterType::Peak, 20, FILTER_GAIN_RANGE - 1);
        assert!(peak.volume_compensation() < 1.0);
        let lowpass = FilterControlPoint::new(FilterType::LowPass, 8, FILTER_GAIN_CENTER);
        assert!(lowpass.volume_compensation() > 1.0);
    }

    #[test]
    fn test_default_fm_has_audible_carrier() {
        let fm = Instrument::new(InstrumentKind::Fm);
        assert_eq!(fm.operators[0].amplitude, crate::constants::OPERATOR_AMPLITUDE_MAX);
    }

    #[test]
    fn test_drumset_has_a_wave_per_drum() {
        let drums = Instrument::new(InstrumentKind::Drumset);
        assert_eq!(drums.drumset_spectrum_waves.len(), DRUM_COUNT);
    }
}
