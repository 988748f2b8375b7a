//! Engine constants and named value tables.
//!
//! Everything the codec and synthesizer agree on lives here: time-unit
//! subdivision, pitch ranges, filter ranges, and the named bundles
//! (transitions, chords, vibratos, envelopes, intervals) that instruments
//! reference by index. Table order is load-bearing: indices are stored in
//! the song format.

/// Ticks per part. Parts subdivide beats; ticks subdivide parts.
pub const TICKS_PER_PART: i32 = 2;
/// Parts per beat. Note start/end times are measured in parts.
pub const PARTS_PER_BEAT: i32 = 24;

/// Default output sample rate in Hz.
pub const DEFAULT_SAMPLE_RATE: f32 = 44_100.0;

/// Highest pitch a note may carry (MIDI numbering, 60 = middle C).
pub const MAX_PITCH: i32 = 84;
/// Number of drums in a drumset / pitches in a noise channel.
pub const DRUM_COUNT: usize = 12;
/// Maximum simultaneous pitches in one note.
pub const MAX_CHORD_SIZE: usize = 4;
/// Hard cap on simultaneously sounding tones per channel. Released tones
/// beyond the cap are faded out fast.
pub const MAX_TONES_PER_CHANNEL: usize = 8;

pub const MIN_TEMPO: i32 = 30;
pub const MAX_TEMPO: i32 = 300;
pub const MIN_BEATS_PER_BAR: i32 = 3;
pub const MAX_BEATS_PER_BAR: i32 = 16;
pub const MIN_BAR_COUNT: usize = 1;
pub const MAX_BAR_COUNT: usize = 128;
pub const MIN_PATTERNS_PER_CHANNEL: usize = 1;
pub const MAX_PATTERNS_PER_CHANNEL: usize = 64;
pub const MIN_INSTRUMENTS_PER_CHANNEL: usize = 1;
pub const MAX_INSTRUMENTS_PER_CHANNEL: usize = 10;
pub const MIN_PITCH_CHANNELS: usize = 1;
pub const MAX_PITCH_CHANNELS: usize = 6;
pub const MAX_NOISE_CHANNELS: usize = 3;
/// Channel octave scroll range (0..=4).
pub const MAX_CHANNEL_OCTAVE: i32 = 4;

/// Instrument volume slider range, 0 = loudest.
pub const VOLUME_RANGE: i32 = 8;
/// Per-pin note expression range (0..=3).
pub const EXPRESSION_RANGE: i32 = 4;

// Filter control-point ranges. A point's frequency setting maps to
// Hz = FILTER_FREQ_MAX_HZ * 2^((setting - (range-1)) * step), its gain
// setting to 2^((setting - center) * gainStep).
pub const FILTER_FREQ_RANGE: i32 = 34;
pub const FILTER_FREQ_STEP: f64 = 0.25;
pub const FILTER_FREQ_MAX_HZ: f64 = 8000.0;
pub const FILTER_GAIN_RANGE: i32 = 15;
pub const FILTER_GAIN_CENTER: i32 = 7;
pub const FILTER_GAIN_STEP: f64 = 0.5;
/// Maximum control points in one filter stack.
pub const FILTER_MAX_POINTS: usize = 8;
/// Reference rate the legacy 1st/2nd-order filters were tuned at.
pub const LEGACY_FILTER_SAMPLE_RATE: f64 = 48_000.0;

pub const DISTORTION_RANGE: i32 = 8;
pub const BITCRUSHER_FREQ_RANGE: i32 = 14;
pub const BITCRUSHER_OCTAVE_STEP: f64 = 0.5;
pub const BITCRUSHER_QUANTIZATION_RANGE: i32 = 8;
pub const PAN_MAX: i32 = 8;
pub const PAN_CENTER: i32 = 4;
/// Widest stereo delay the panning stage applies, in seconds.
pub const PAN_DELAY_SECONDS_MAX: f64 = 0.001;
pub const REVERB_RANGE: i32 = 8;
/// Ring size shared by the four reverb taps.
pub const REVERB_DELAY_BUFFER_SIZE: usize = 16384;

/// FM operator count and amplitude range.
pub const OPERATOR_COUNT: usize = 4;
pub const OPERATOR_AMPLITUDE_MAX: i32 = 15;

/// Size of the shared sine table used by the FM voices.
pub const SINE_WAVE_LENGTH: usize = 1 << 8;

/// Length of the cached noise wave tables.
pub const NOISE_WAVE_LENGTH: usize = 1 << 15;
/// Length of spectrum and drumset wave tables.
pub const SPECTRUM_WAVE_LENGTH: usize = 1 << 15;
/// Control points in a spectrum editor curve.
pub const SPECTRUM_CONTROL_POINTS: usize = 30;
pub const SPECTRUM_CONTROL_MAX: i32 = 12;
/// Control points in a harmonics editor curve.
pub const HARMONICS_CONTROL_POINTS: usize = 28;
pub const HARMONICS_CONTROL_MAX: i32 = 7;
/// Length of the rendered harmonics wave table.
pub const HARMONICS_WAVE_LENGTH: usize = 1 << 11;

pub const PULSE_WIDTH_RANGE: i32 = 8;

/// Guitar (plucked string) parameters.
pub const GUITAR_SUSTAIN_RANGE: i32 = 8;
pub const GUITAR_PULSE_WIDTH_RANGE: i32 = 8;
/// Random jitter applied to the pluck's second impulse offset, in periods.
pub const GUITAR_PULSE_WIDTH_RANDOMNESS: f64 = 0.3;

/// Ticks a vibrato takes to ramp from silent to full amplitude.
pub const VIBRATO_RAMP_TICKS: f64 = 2.0;

/// Base expression per instrument family, tuned so presets sit at a
/// comparable loudness.
pub const CHIP_BASE_EXPRESSION: f64 = 0.03125;
pub const FM_BASE_EXPRESSION: f64 = 0.03;
pub const NOISE_BASE_EXPRESSION: f64 = 0.19;
pub const SPECTRUM_BASE_EXPRESSION: f64 = 0.3;
pub const DRUMSET_BASE_EXPRESSION: f64 = 0.45;
pub const HARMONICS_BASE_EXPRESSION: f64 = 0.025;
pub const PWM_BASE_EXPRESSION: f64 = 0.04;
pub const GUITAR_BASE_EXPRESSION: f64 = 0.025;

/// Pitch at which pitch-dependent carrier expression is unity.
pub const EXPRESSION_REFERENCE_PITCH: f64 = 16.0;
/// Octaves over which carrier expression halves.
pub const PITCH_DAMPING: f64 = 48.0;

/// Seconds a maintained live-input tone stays armed without renewal.
pub const LIVE_INPUT_TIMEOUT_SECONDS: f64 = 10.0;

/// A musical scale: which of the 12 semitones are members.
pub struct ScaleDef {
    pub name: &'static str,
    pub flags: [bool; 12],
}

pub const SCALES: [ScaleDef; 12] = [
    ScaleDef { name: "easy :)", flags: [true, false, true, false, true, false, false, true, false, true, false, false] },
    ScaleDef { name: "easy :(", flags: [true, false, false, true, false, true, false, true, false, false, true, false] },
    ScaleDef { name: "island :)", flags: [true, false, false, false, true, true, false, true, false, false, false, true] },
    ScaleDef { name: "island :(", flags: [true, true, false, false, false, true, true, false, true, false, false, false] },
    ScaleDef { name: "blues :)", flags: [true, false, true, true, true, false, false, true, false, true, false, false] },
    ScaleDef { name: "blues :(", flags: [true, false, false, true, false, true, true, true, false, false, true, false] },
    ScaleDef { name: "normal :)", flags: [true, false, true, false, true, true, false, true, false, true, false, true] },
    ScaleDef { name: "normal :(", flags: [true, false, true, true, false, true, false, true, true, false, true, false] },
    ScaleDef { name: "dbl harmonic :)", flags: [true, true, false, false, true, true, false, true, true, false, false, true] },
    ScaleDef { name: "dbl harmonic :(", flags: [true, false, true, true, false, true, true, true, true, false, false, true] },
    ScaleDef { name: "enigma", flags: [true, false, true, false, true, false, true, false, true, false, true, false] },
    ScaleDef { name: "expert", flags: [true; 12] },
];

/// Index decoded when a scale name is unrecognized.
pub const DEFAULT_SCALE: usize = 11;

pub const KEYS: [&str; 12] = [
    "C", "C♯", "D", "D♯", "E", "F", "F♯", "G", "G♯", "A", "A♯", "B",
];

/// Rhythm selection: how many steps a beat subdivides into, and how fast
/// arpeggiated chords cycle.
pub struct RhythmDef {
    pub name: &'static str,
    pub steps_per_beat: i32,
    pub ticks_per_arpeggio: i32,
    /// One pattern per chord size 1..=4; entries index into the chord.
    pub arpeggio_patterns: [&'static [usize]; 4],
}

pub const RHYTHMS: [RhythmDef; 4] = [
    RhythmDef {
        name: "÷3 (triplets)",
        steps_per_beat: 3,
        ticks_per_arpeggio: 5,
        arpeggio_patterns: [&[0], &[0, 0, 1, 1], &[0, 1, 2, 1], &[0, 1, 2, 3]],
    },
    RhythmDef {
        name: "÷4 (standard)",
        steps_per_beat: 4,
        ticks_per_arpeggio: 4,
        arpeggio_patterns: [&[0], &[0, 0, 1, 1], &[0, 1, 2, 1], &[0, 1, 2, 3]],
    },
    RhythmDef {
        name: "÷6",
        steps_per_beat: 6,
        ticks_per_arpeggio: 4,
        arpeggio_patterns: [&[0], &[0, 1], &[0, 1, 2, 1], &[0, 1, 2, 3]],
    },
    RhythmDef {
        name: "÷8",
        steps_per_beat: 8,
        ticks_per_arpeggio: 3,
        arpeggio_patterns: [&[0], &[0, 1], &[0, 1, 2, 1], &[0, 1, 2, 3]],
    },
];

pub const DEFAULT_RHYTHM: usize = 1;

/// Note-boundary behavior bundle.
pub struct TransitionDef {
    pub name: &'static str,
    pub attack_seconds: f64,
    pub releases: bool,
    pub release_ticks: i32,
    pub is_seamless: bool,
    pub slides: bool,
    pub slide_ticks: i32,
}

pub const TRANSITIONS: [TransitionDef; 8] = [
    TransitionDef { name: "seamless", attack_seconds: 0.0, releases: false, release_ticks: 1, is_seamless: true, slides: false, slide_ticks: 3 },
    TransitionDef { name: "hard", attack_seconds: 0.0, releases: false, release_ticks: 3, is_seamless: false, slides: false, slide_ticks: 3 },
    TransitionDef { name: "soft", attack_seconds: 0.025, releases: false, release_ticks: 3, is_seamless: false, slides: false, slide_ticks: 3 },
    TransitionDef { name: "slide", attack_seconds: 0.025, releases: false, release_ticks: 3, is_seamless: true, slides: true, slide_ticks: 3 },
    TransitionDef { name: "cross fade", attack_seconds: 0.04, releases: true, release_ticks: 6, is_seamless: false, slides: false, slide_ticks: 3 },
    TransitionDef { name: "hard fade", attack_seconds: 0.0, releases: true, release_ticks: 48, is_seamless: false, slides: false, slide_ticks: 3 },
    TransitionDef { name: "medium fade", attack_seconds: 0.0125, releases: true, release_ticks: 72, is_seamless: false, slides: false, slide_ticks: 3 },
    TransitionDef { name: "soft fade", attack_seconds: 0.06, releases: true, release_ticks: 96, is_seamless: false, slides: false, slide_ticks: 6 },
];

/// Index decoded when a transition name is unrecognized.
pub const DEFAULT_TRANSITION: usize = 1;

/// Vibrato LFO bundle. The LFO is a sum of sines, one per period entry.
pub struct VibratoDef {
    pub name: &'static str,
    pub amplitude: f64,
    pub periods_seconds: &'static [f64],
    pub delay_ticks: i32,
}

pub const VIBRATOS: [VibratoDef; 5] = [
    VibratoDef { name: "none", amplitude: 0.0, periods_seconds: &[0.14], delay_ticks: 0 },
    VibratoDef { name: "light", amplitude: 0.15, periods_seconds: &[0.14], delay_ticks: 0 },
    VibratoDef { name: "delayed", amplitude: 0.3, periods_seconds: &[0.14], delay_ticks: 36 },
    VibratoDef { name: "heavy", amplitude: 0.45, periods_seconds: &[0.14], delay_ticks: 0 },
    VibratoDef { name: "shaky", amplitude: 0.1, periods_seconds: &[0.11, 0.1618, 0.3], delay_ticks: 0 },
];

/// Two-voice detune bundle for the chip and harmonics instruments.
pub struct IntervalDef {
    pub name: &'static str,
    /// Semitone gap between the two voices.
    pub spread: f64,
    /// Semitone offset applied to both voices.
    pub offset: f64,
    pub expression: f64,
    /// Sign of the second voice's contribution.
    pub sign: f64,
}

pub const INTERVALS: [IntervalDef; 9] = [
    IntervalDef { name: "union", spread: 0.0, offset: 0.0, expression: 0.7, sign: 1.0 },
    IntervalDef { name: "shimmer", spread: 0.018, offset: 0.0, expression: 0.8, sign: 1.0 },
    IntervalDef { name: "hum", spread: 0.045, offset: 0.0, expression: 1.0, sign: 1.0 },
    IntervalDef { name: "honky tonk", spread: 0.09, offset: 0.0, expression: 1.0, sign: 1.0 },
    IntervalDef { name: "dissonant", spread: 0.25, offset: 0.0, expression: 0.9, sign: 1.0 },
    IntervalDef { name: "fifth", spread: 3.5, offset: 3.5, expression: 0.9, sign: 1.0 },
    IntervalDef { name: "octave", spread: 6.0, offset: 6.0, expression: 0.8, sign: 1.0 },
    IntervalDef { name: "bowed", spread: 0.02, offset: 0.0, expression: 1.0, sign: -1.0 },
    IntervalDef { name: "piano", spread: 0.01, offset: 0.0, expression: 1.0, sign: 0.7 },
];

/// How the pitches of a chord map to tones.
pub struct ChordDef {
    pub name: &'static str,
    pub harmonizes: bool,
    pub arpeggiates: bool,
    pub custom_interval: bool,
    /// One tone plays all pitches (arpeggio / custom interval).
    pub single_tone: bool,
    /// Parts between successive chord voices starting.
    pub strum_parts: i32,
}

pub const CHORDS: [ChordDef; 4] = [
    ChordDef { name: "harmony", harmonizes: true, arpeggiates: false, custom_interval: false, single_tone: false, strum_parts: 0 },
    ChordDef { name: "strum", harmonizes: true, arpeggiates: false, custom_interval: false, single_tone: false, strum_parts: 1 },
    ChordDef { name: "arpeggio", harmonizes: false, arpeggiates: true, custom_interval: false, single_tone: true, strum_parts: 0 },
    ChordDef { name: "custom interval", harmonizes: false, arpeggiates: false, custom_interval: true, single_tone: true, strum_parts: 0 },
];

pub const DEFAULT_CHORD: usize = 0;

/// Envelope curve families. Speed scales time inside each formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeCurve {
    /// Follows the note's pin expression.
    Custom,
    /// Constant 1.
    Steady,
    /// Starts at 2, falls to 1 over the first tenth of a second.
    Punch,
    /// Linear attack then twang decay.
    Flare,
    /// 1/(1+t*s) decay.
    Twang,
    /// 1 - 1/(1+t*s) rise.
    Swell,
    /// Full-depth cosine LFO in beats.
    Tremolo,
    /// Shallow cosine LFO in beats.
    Tremolo2,
    /// Exponential 2^(-s*t) decay.
    Decay,
}

pub struct EnvelopeDef {
    pub name: &'static str,
    pub curve: EnvelopeCurve,
    pub speed: f64,
}

pub const ENVELOPES: [EnvelopeDef; 21] = [
    EnvelopeDef { name: "custom", curve: EnvelopeCurve::Custom, speed: 0.0 },
    EnvelopeDef { name: "steady", curve: EnvelopeCurve::Steady, speed: 0.0 },
    EnvelopeDef { name: "punch", curve: EnvelopeCurve::Punch, speed: 0.0 },
    EnvelopeDef { name: "flare 1", curve: EnvelopeCurve::Flare, speed: 32.0 },
    EnvelopeDef { name: "flare 2", curve: EnvelopeCurve::Flare, speed: 8.0 },
    EnvelopeDef { name: "flare 3", curve: EnvelopeCurve::Flare, speed: 2.0 },
    EnvelopeDef { name: "twang 1", curve: EnvelopeCurve::Twang, speed: 32.0 },
    EnvelopeDef { name: "twang 2", curve: EnvelopeCurve::Twang, speed: 8.0 },
    EnvelopeDef { name: "twang 3", curve: EnvelopeCurve::Twang, speed: 2.0 },
    EnvelopeDef { name: "swell 1", curve: EnvelopeCurve::Swell, speed: 32.0 },
    EnvelopeDef { name: "swell 2", curve: EnvelopeCurve::Swell, speed: 8.0 },
    EnvelopeDef { name: "swell 3", curve: EnvelopeCurve::Swell, speed: 2.0 },
    EnvelopeDef { name: "tremolo1", curve: EnvelopeCurve::Tremolo, speed: 4.0 },
    EnvelopeDef { name: "tremolo2", curve: EnvelopeCurve::Tremolo, speed: 2.0 },
    EnvelopeDef { name: "tremolo3", curve: EnvelopeCurve::Tremolo, speed: 1.0 },
    EnvelopeDef { name: "tremolo4", curve: EnvelopeCurve::Tremolo2, speed: 4.0 },
    EnvelopeDef { name: "tremolo5", curve: EnvelopeCurve::Tremolo2, speed: 2.0 },
    EnvelopeDef { name: "tremolo6", curve: EnvelopeCurve::Tremolo2, speed: 1.0 },
    EnvelopeDef { name: "decay 1", curve: EnvelopeCurve::Decay, speed: 10.0 },
    EnvelopeDef { name: "decay 2", curve: EnvelopeCurve::Decay, speed: 7.0 },
    EnvelopeDef { name: "decay 3", curve: EnvelopeCurve::Decay, speed: 4.0 },
];

pub const DEFAULT_ENVELOPE: usize = 1;

/// FM operator frequency ratio. `hz_offset` detunes the "~" variants by a
/// constant number of Hz regardless of pitch.
pub struct OperatorFrequencyDef {
    pub name: &'static str,
    pub mult: f64,
    pub hz_offset: f64,
    /// Whether the offset is also scaled per-octave when pitch shifts.
    pub amplitude_sign: f64,
}

pub const OPERATOR_FREQUENCIES: [OperatorFrequencyDef; 15] = [
    OperatorFrequencyDef { name: "1×", mult: 1.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequencyDef { name: "~1×", mult: 1.0, hz_offset: 1.5, amplitude_sign: -1.0 },
    OperatorFrequencyDef { name: "2×", mult: 2.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequencyDef { name: "~2×", mult: 2.0, hz_offset: -1.3, amplitude_sign: -1.0 },
    OperatorFrequencyDef { name: "3×", mult: 3.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequencyDef { name: "4×", mult: 4.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequencyDef { name: "5×", mult: 5.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequencyDef { name: "6×", mult: 6.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequencyDef { name: "7×", mult: 7.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequencyDef { name: "8×", mult: 8.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequencyDef { name: "9×", mult: 9.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequencyDef { name: "11×", mult: 11.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequencyDef { name: "13×", mult: 13.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequencyDef { name: "16×", mult: 16.0, hz_offset: 0.0, amplitude_sign: 1.0 },
    OperatorFrequencyDef { name: "20×", mult: 20.0, hz_offset: 0.0, amplitude_sign: 1.0 },
];

/// FM routing: which operators modulate each operator, and how many of the
/// four are carriers (the first `carrier_count` operators sum to output).
pub struct AlgorithmDef {
    pub name: &'static str,
    pub carrier_count: usize,
    pub modulated_by: [&'static [usize]; 4],
}

pub const ALGORITHMS: [AlgorithmDef; 13] = [
    AlgorithmDef { name: "1←(2 3 4)", carrier_count: 1, modulated_by: [&[1, 2, 3], &[], &[], &[]] },
    AlgorithmDef { name: "1←(2 3←4)", carrier_count: 1, modulated_by: [&[1, 2], &[], &[3], &[]] },
    AlgorithmDef { name: "1←2←(3 4)", carrier_count: 1, modulated_by: [&[1], &[2, 3], &[], &[]] },
    AlgorithmDef { name: "1←(2 3)←4", carrier_count: 1, modulated_by: [&[1, 2], &[3], &[3], &[]] },
    AlgorithmDef { name: "1←2←3←4", carrier_count: 1, modulated_by: [&[1], &[2], &[3], &[]] },
    AlgorithmDef { name: "1←3 2←4", carrier_count: 2, modulated_by: [&[2], &[3], &[], &[]] },
    AlgorithmDef { name: "1 2←(3 4)", carrier_count: 2, modulated_by: [&[], &[2, 3], &[], &[]] },
    AlgorithmDef { name: "1 2←3←4", carrier_count: 2, modulated_by: [&[], &[2], &[3], &[]] },
    AlgorithmDef { name: "(1 2)←3←4", carrier_count: 2, modulated_by: [&[2], &[2], &[3], &[]] },
    AlgorithmDef { name: "(1 2)←(3 4)", carrier_count: 2, modulated_by: [&[2, 3], &[2, 3], &[], &[]] },
    AlgorithmDef { name: "1 2 3←4", carrier_count: 3, modulated_by: [&[], &[], &[3], &[]] },
    AlgorithmDef { name: "(1 2 3)←4", carrier_count: 3, modulated_by: [&[3], &[3], &[3], &[]] },
    AlgorithmDef { name: "1 2 3 4", carrier_count: 4, modulated_by: [&[], &[], &[], &[]] },
];

/// FM feedback routing: which operators feed each operator's phase.
pub struct FeedbackDef {
    pub name: &'static str,
    pub indices: [&'static [usize]; 4],
}

pub const FEEDBACKS: [FeedbackDef; 18] = [
    FeedbackDef { name: "1⟲", indices: [&[0], &[], &[], &[]] },
    FeedbackDef { name: "2⟲", indices: [&[], &[1], &[], &[]] },
    FeedbackDef { name: "3⟲", indices: [&[], &[], &[2], &[]] },
    FeedbackDef { name: "4⟲", indices: [&[], &[], &[], &[3]] },
    FeedbackDef { name: "1⟲ 2⟲", indices: [&[0], &[1], &[], &[]] },
    FeedbackDef { name: "3⟲ 4⟲", indices: [&[], &[], &[2], &[3]] },
    FeedbackDef { name: "1⟲ 2⟲ 3⟲", indices: [&[0], &[1], &[2], &[]] },
    FeedbackDef { name: "2⟲ 3⟲ 4⟲", indices: [&[], &[1], &[2], &[3]] },
    FeedbackDef { name: "1⟲ 2⟲ 3⟲ 4⟲", indices: [&[0], &[1], &[2], &[3]] },
    FeedbackDef { name: "1→2", indices: [&[], &[0], &[], &[]] },
    FeedbackDef { name: "1→3", indices: [&[], &[], &[0], &[]] },
    FeedbackDef { name: "1→4", indices: [&[], &[], &[], &[0]] },
    FeedbackDef { name: "2→3", indices: [&[], &[], &[1], &[]] },
    FeedbackDef { name: "2→4", indices: [&[], &[], &[], &[1]] },
    FeedbackDef { name: "3→4", indices: [&[], &[], &[], &[2]] },
    FeedbackDef { name: "1→3 2→4", indices: [&[], &[], &[0], &[1]] },
    FeedbackDef { name: "1→4 2→3", indices: [&[], &[], &[1], &[0]] },
    FeedbackDef { name: "1→2→3→4", indices: [&[], &[0], &[1], &[2]] },
];

/// A chip oscillator wave. Raw samples are expanded and integrated into a
/// band-limitable table at engine startup.
pub struct ChipWaveDef {
    pub name: &'static str,
    pub expression: f64,
    pub samples: &'static [f64],
}

pub const CHIP_WAVES: [ChipWaveDef; 10] = [
    ChipWaveDef {
        name: "rounded",
        expression: 0.94,
        samples: &[
            0.0, 0.2, 0.4, 0.5, 0.6, 0.7, 0.8, 0.85, 0.9, 0.95, 1.0, 1.0, 0.95, 0.9, 0.85, 0.8,
            0.7, 0.6, 0.5, 0.4, 0.2, 0.0, -0.2, -0.4, -0.5, -0.6, -0.7, -0.8, -0.85, -0.9, -0.95,
            -1.0, -1.0, -0.95, -0.9, -0.85, -0.8, -0.7, -0.6, -0.5, -0.4, -0.2,
        ],
    },
    ChipWaveDef {
        name: "triangle",
        expression: 1.0,
        samples: &[
            1.0 / 15.0, 3.0 / 15.0, 5.0 / 15.0, 7.0 / 15.0, 9.0 / 15.0, 11.0 / 15.0, 13.0 / 15.0,
            15.0 / 15.0, 15.0 / 15.0, 13.0 / 15.0, 11.0 / 15.0, 9.0 / 15.0, 7.0 / 15.0, 5.0 / 15.0,
            3.0 / 15.0, 1.0 / 15.0, -1.0 / 15.0, -3.0 / 15.0, -5.0 / 15.0, -7.0 / 15.0, -9.0 / 15.0,
            -11.0 / 15.0, -13.0 / 15.0, -15.0 / 15.0, -15.0 / 15.0, -13.0 / 15.0, -11.0 / 15.0,
            -9.0 / 15.0, -7.0 / 15.0, -5.0 / 15.0, -3.0 / 15.0, -1.0 / 15.0,
        ],
    },
    ChipWaveDef { name: "square", expression: 0.5, samples: &[1.0, -1.0] },
    ChipWaveDef { name: "1/4 pulse", expression: 0.5, samples: &[1.0, -1.0, -1.0, -1.0] },
    ChipWaveDef {
        name: "1/8 pulse",
        expression: 0.5,
        samples: &[1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0],
    },
    ChipWaveDef {
        name: "sawtooth",
        expression: 0.65,
        samples: &[
            1.0 / 31.0, 3.0 / 31.0, 5.0 / 31.0, 7.0 / 31.0, 9.0 / 31.0, 11.0 / 31.0, 13.0 / 31.0,
            15.0 / 31.0, 17.0 / 31.0, 19.0 / 31.0, 21.0 / 31.0, 23.0 / 31.0, 25.0 / 31.0,
            27.0 / 31.0, 29.0 / 31.0, 31.0 / 31.0, -31.0 / 31.0, -29.0 / 31.0, -27.0 / 31.0,
            -25.0 / 31.0, -23.0 / 31.0, -21.0 / 31.0, -19.0 / 31.0, -17.0 / 31.0, -15.0 / 31.0,
            -13.0 / 31.0, -11.0 / 31.0, -9.0 / 31.0, -7.0 / 31.0, -5.0 / 31.0, -3.0 / 31.0,
            -1.0 / 31.0,
        ],
    },
    ChipWaveDef {
        name: "double saw",
        expression: 0.5,
        samples: &[
            0.0, -0.2, -0.4, -0.6, -0.8, -1.0, 1.0, -0.8, -0.6, -0.4, -0.2, 1.0, 0.8, 0.6, 0.4, 0.2,
        ],
    },
    ChipWaveDef {
        name: "double pulse",
        expression: 0.4,
        samples: &[1.0, 1.0, 1.0, 1.0, 1.0, -1.0, -1.0, -1.0, 1.0, 1.0, 1.0, 1.0, -1.0, -1.0, -1.0, -1.0],
    },
    ChipWaveDef { name: "spiky", expression: 0.4, samples: &[1.0, -1.0, 1.0, -1.0, 1.0, 0.0] },
    ChipWaveDef {
        name: "plateau",
        expression: 0.94,
        samples: &[
            0.0, 0.2, 0.4, 0.5, 0.6, 0.7, 0.8, 0.85, 0.9, 0.95, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0,
            1.0, 1.0, 1.0, 1.0, 0.95, 0.9, 0.85, 0.8, 0.7, 0.6, 0.5, 0.4, 0.2, 0.0, -0.2, -0.4,
            -0.5, -0.6, -0.7, -0.8, -0.85, -0.9, -0.95, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0,
            -1.0, -1.0, -1.0, -1.0, -0.95, -0.9, -0.85, -0.8, -0.7, -0.6, -0.5, -0.4, -0.2,
        ],
    },
];

/// Noise-channel wave flavors. `pitch_filter_mult` scales the one-pole
/// smoothing cutoff that tracks the tone's fundamental.
pub struct NoiseWaveDef {
    pub name: &'static str,
    pub expression: f64,
    pub base_pitch: i32,
    pub pitch_filter_mult: f64,
    pub is_soft: bool,
}

pub const NOISE_WAVES: [NoiseWaveDef; 5] = [
    NoiseWaveDef { name: "retro", expression: 0.25, base_pitch: 69, pitch_filter_mult: 1024.0, is_soft: false },
    NoiseWaveDef { name: "white", expression: 1.0, base_pitch: 69, pitch_filter_mult: 8.0, is_soft: true },
    NoiseWaveDef { name: "clang", expression: 0.4, base_pitch: 69, pitch_filter_mult: 1024.0, is_soft: false },
    NoiseWaveDef { name: "buzz", expression: 0.3, base_pitch: 69, pitch_filter_mult: 1024.0, is_soft: false },
    NoiseWaveDef { name: "hollow", expression: 1.6, base_pitch: 96, pitch_filter_mult: 1.0, is_soft: true },
];

/// Frequency in Hz of a pitch in MIDI numbering.
pub fn frequency_from_pitch(pitch: f64) -> f64 {
    440.0 * 2.0_f64.powf((pitch - 69.0) / 12.0)
}

/// Linear gain for a 0..=3 pin expression value.
pub fn expression_to_gain(expression: f64) -> f64 {
    (expression / 3.0).powf(1.5)
}

/// Linear gain for an instrument volume slider value.
pub fn volume_to_gain(volume: i32) -> f64 {
    2.0_f64.powf(-volume as f64 / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_flags_include_tonic() {
        for scale in SCALES.iter() {
            assert!(scale.flags[0], "scale {} must include the tonic", scale.name);
        }
    }

    #[test]
    fn test_arpeggio_patterns_in_range() {
        for rhythm in RHYTHMS.iter() {
            for (size, pattern) in rhythm.arpeggio_patterns.iter().enumerate() {
                for &idx in pattern.iter() {
                    assert!(idx <= size, "rhythm {} pattern for chord size {}", rhythm.name, size + 1);
                }
            }
        }
    }

    #[test]
    fn test_algorithm_modulators_reference_later_operators() {
        for algorithm in ALGORITHMS.iter() {
            for (op, mods) in algorithm.modulated_by.iter().enumerate() {
                for &m in mods.iter() {
                    assert!(m > op, "algorithm {} op {} modulated by {}", algorithm.name, op, m);
                    assert!(m < OPERATOR_COUNT);
                }
            }
        }
    }

    #[test]
    fn test_frequency_from_pitch_reference_points() {
        assert!((frequency_from_pitch(69.0) - 440.0).abs() < 1e-9);
        assert!((frequency_from_pitch(60.0) - 261.6255653).abs() < 1e-4);
    }

    #[test]
    fn test_expression_gain_range() {
        assert_eq!(expression_to_gain(0.0), 0.0);
        assert_eq!(expression_to_gain(3.0), 1.0);
        assert!(expression_to_gain(1.0) < expression_to_gain(2.0));
    }
}
