//! Envelope curve evaluation.
//!
//! Envelopes turn elapsed note time into a 0..2 scalar that modulates
//! filter cutoffs, FM operator amplitudes, feedback depth, and pulse
//! width. Tremolo curves run on song beats so they stay locked to the
//! tempo; everything else runs on seconds.

use crate::constants::{EnvelopeCurve, EnvelopeDef, ENVELOPES};

/// Evaluates an envelope.
///
/// * `time` - seconds since the note began
/// * `beats` - song position in beats (for the tremolo curves)
/// * `note_expression` - the note's interpolated pin expression gain,
///   consumed by the custom curve
pub fn compute_envelope(envelope: &EnvelopeDef, time: f64, beats: f64, note_expression: f64) -> f64 {
    let speed = envelope.speed;
    match envelope.curve {
        EnvelopeCurve::Custom => note_expression,
        EnvelopeCurve::Steady => 1.0,
        EnvelopeCurve::Punch => (2.0 - time * 10.0).max(1.0),
        EnvelopeCurve::Flare => {
            let attack = 0.25 / speed.sqrt();
            if time < attack {
                time / attack
            } else {
                1.0 / (1.0 + (time - attack) * speed)
            }
        }
        EnvelopeCurve::Twang => 1.0 / (1.0 + time * speed),
        EnvelopeCurve::Swell => 1.0 - 1.0 / (1.0 + time * speed),
        EnvelopeCurve::Tremolo => {
            0.5 - 0.5 * (beats * 2.0 * std::f64::consts::PI * speed).cos()
        }
        EnvelopeCurve::Tremolo2 => {
            0.75 - 0.25 * (beats * 2.0 * std::f64::consts::PI * speed).cos()
        }
        EnvelopeCurve::Decay => 2.0_f64.powf(-speed * time),
    }
}

/// Looks an envelope up by index, clamped to the table.
pub fn envelope_at(index: usize) -> &'static EnvelopeDef {
    &ENVELOPES[index.min(ENVELOPES.len() - 1)]
}
