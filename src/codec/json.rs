//! JSON song import and export.
//!
//! The JSON form names things instead of bit-packing them: scales, keys,
//! waves, transitions and envelopes appear as their display names, note
//! velocities as 0..100 volumes. Unknown fields are ignored and missing
//! fields take defaults, so hand-edited documents stay loadable. A few
//! legacy display names are accepted as aliases.

use serde_json::{json, Map, Value};

use crate::constants::{
    ALGORITHMS, CHIP_WAVES, CHORDS, DRUM_COUNT, ENVELOPES, FEEDBACKS, FILTER_FREQ_RANGE,
    FILTER_GAIN_RANGE, HARMONICS_CONTROL_MAX, INTERVALS, KEYS, MAX_CHANNEL_OCTAVE,
    NOISE_WAVES, OPERATOR_AMPLITUDE_MAX, OPERATOR_COUNT, OPERATOR_FREQUENCIES, PAN_CENTER,
    PAN_MAX, RHYTHMS, SCALES, SPECTRUM_CONTROL_MAX, TRANSITIONS, VIBRATOS,
};
use crate::codec::url::LATEST_VERSION;
use crate::song::{
    EffectFlags, FilterControlPoint, FilterSettings, FilterType, Instrument, InstrumentKind, Note,
    NotePin, Song,
};
use crate::{Result, SongError};

/// The interchange format identifier. Kept compatible with the original
/// editor's exports.
const FORMAT_NAME: &str = "BeepBox";

// ---------------------------------------------------------------------------
// Lookup helpers
// ---------------------------------------------------------------------------

fn get_i64(object: &Value, key: &str) -> Option<i64> {
    object.get(key).and_then(Value::as_i64)
}

fn get_str<'a>(object: &'a Value, key: &str) -> Option<&'a str> {
    object.get(key).and_then(Value::as_str)
}

fn get_array<'a>(object: &'a Value, key: &str) -> Option<&'a Vec<Value>> {
    object.get(key).and_then(Value::as_array)
}

fn name_index(names: impl Iterator<Item = &'static str>, name: &str, default: usize) -> usize {
    names
        .enumerate()
        .find(|(_, n)| *n == name)
        .map(|(i, _)| i)
        .unwrap_or(default)
}

fn scale_index(name: &str) -> usize {
    let name = match name {
        "romani :)" => "dbl harmonic :)",
        "romani :(" => "dbl harmonic :(",
        other => other,
    };
    name_index(
        SCALES.iter().map(|s| s.name),
        name,
        crate::constants::DEFAULT_SCALE,
    )
}

fn chord_index(name: &str) -> usize {
    let name = match name {
        "harmony" | "chords" => "harmony",
        other => other,
    };
    name_index(CHORDS.iter().map(|c| c.name), name, crate::constants::DEFAULT_CHORD)
}

fn envelope_index(name: &str) -> usize {
    name_index(
        ENVELOPES.iter().map(|e| e.name),
        name,
        crate::constants::DEFAULT_ENVELOPE,
    )
}

fn instrument_kind(name: &str) -> InstrumentKind {
    match name {
        "FM" | "fm" => InstrumentKind::Fm,
        "noise" => InstrumentKind::Noise,
        "spectrum" => InstrumentKind::Spectrum,
        "drumset" => InstrumentKind::Drumset,
        "harmonics" => InstrumentKind::Harmonics,
        "PWM" | "pwm" => InstrumentKind::Pwm,
        "guitar" => InstrumentKind::Guitar,
        _ => InstrumentKind::Chip,
    }
}

fn kind_name(kind: InstrumentKind) -> &'static str {
    match kind {
        InstrumentKind::Chip => "chip",
        InstrumentKind::Fm => "FM",
        InstrumentKind::Noise => "noise",
        InstrumentKind::Spectrum => "spectrum",
        InstrumentKind::Drumset => "drumset",
        InstrumentKind::Harmonics => "harmonics",
        InstrumentKind::Pwm => "PWM",
        InstrumentKind::Guitar => "guitar",
    }
}

fn filter_type_name(kind: FilterType) -> &'static str {
    match kind {
        FilterType::LowPass => "low-pass",
        FilterType::HighPass => "high-pass",
        FilterType::Peak => "peak",
    }
}

fn filter_type_from_name(name: &str) -> FilterType {
    match name {
        "high-pass" => FilterType::HighPass,
        "peak" => FilterType::Peak,
        _ => FilterType::LowPass,
    }
}

const EFFECT_NAMES: [(EffectFlags, &str); 6] = [
    (EffectFlags::REVERB, "reverb"),
    (EffectFlags::CHORUS, "chorus"),
    (EffectFlags::PANNING, "panning"),
    (EffectFlags::DISTORTION, "distortion"),
    (EffectFlags::BITCRUSHER, "bitcrusher"),
    (EffectFlags::EFFECT_FILTER, "effect filter"),
];

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

/// Builds a song from the JSON form.
pub fn from_json(value: &Value) -> Result<Song> {
    if !value.is_object() {
        return Err(SongError::Json("expected a JSON object".into()));
    }
    if let Some(format) = get_str(value, "format") {
        if format != FORMAT_NAME {
            return Err(SongError::Json(format!("unrecognized format {format:?}")));
        }
    }

    let mut song = Song::default();
    if let Some(name) = get_str(value, "scale") {
        song.scale = scale_index(name);
    }
    if let Some(name) = get_str(value, "key") {
        song.key = name_index(KEYS.iter().copied(), name, 0);
    } else if let Some(key) = get_i64(value, "key") {
        song.key = (key as usize).min(KEYS.len() - 1);
    }
    if let Some(tempo) = get_i64(value, "beatsPerMinute") {
        song.tempo = tempo as i32;
    }
    if let Some(beats) = get_i64(value, "beatsPerBar") {
        song.beats_per_bar = beats as i32;
    }
    if let Some(ticks) = get_i64(value, "ticksPerBeat") {
        song.rhythm = RHYTHMS
            .iter()
            .position(|r| r.steps_per_beat as i64 == ticks)
            .unwrap_or(crate::constants::DEFAULT_RHYTHM);
    }
    if let Some(intro) = get_i64(value, "introBars") {
        song.loop_start = intro.max(0) as usize;
    }
    if let Some(loop_bars) = get_i64(value, "loopBars") {
        song.loop_length = loop_bars.max(1) as usize;
    }

    if let Some(channels) = get_array(value, "channels") {
        song.pitch_channel_count = channels
            .iter()
            .filter(|c| get_str(c, "type") != Some("drum"))
            .count()
            .max(1);
        song.noise_channel_count = channels.len() - song.pitch_channel_count.min(channels.len());

        let mut bar_count = 1;
        let mut pattern_count = 1;
        let mut instrument_count = 1;
        for channel in channels {
            if let Some(sequence) = get_array(channel, "sequence") {
                bar_count = bar_count.max(sequence.len());
            }
            if let Some(patterns) = get_array(channel, "patterns") {
                pattern_count = pattern_count.max(patterns.len());
            }
            if let Some(instruments) = get_array(channel, "instruments") {
                instrument_count = instrument_count.max(instruments.len());
            }
        }
        song.bar_count = bar_count;
        song.patterns_per_channel = pattern_count;
        song.instruments_per_channel = instrument_count;
        song.sync_channel_counts();

        // Pitch channels come first in the model; reorder accordingly.
        let (pitch_json, drum_json): (Vec<&Value>, Vec<&Value>) = channels
            .iter()
            .partition(|c| get_str(c, "type") != Some("drum"));
        let channel_cap = song.channels.len();
        for (channel_index, channel_json) in pitch_json
            .into_iter()
            .chain(drum_json)
            .enumerate()
            .take(channel_cap)
        {
            import_channel(&mut song, channel_index, channel_json);
        }
    }

    // Songs exported before per-instrument reverb carry one global value.
    if let Some(reverb) = get_i64(value, "reverb") {
        let reverb = (reverb as i32).clamp(0, 4);
        if reverb > 0 {
            for channel in song.channels.iter_mut().filter(|c| !c.is_noise) {
                for instrument in channel.instruments.iter_mut() {
                    instrument.reverb = reverb;
                    instrument.effects |= EffectFlags::REVERB;
                }
            }
        }
    }

    song.clamp_settings();
    song.sync_member_counts();
    Ok(song)
}

fn import_channel(song: &mut Song, channel_index: usize, json: &Value) {
    let is_noise = song.channels[channel_index].is_noise;
    if let Some(octave) = get_i64(json, "octaveScrollBar") {
        song.channels[channel_index].octave = (octave as i32).clamp(0, MAX_CHANNEL_OCTAVE);
    }
    if let Some(instruments) = get_array(json, "instruments") {
        for (i, instrument_json) in instruments
            .iter()
            .enumerate()
            .take(song.instruments_per_channel)
        {
            song.channels[channel_index].instruments[i] =
                import_instrument(instrument_json, is_noise);
        }
    }
    if let Some(patterns) = get_array(json, "patterns") {
        let max_instrument = song.instruments_per_channel;
        for (i, pattern_json) in patterns
            .iter()
            .enumerate()
            .take(song.patterns_per_channel)
        {
            let pattern = &mut song.channels[channel_index].patterns[i];
            pattern.instrument = (get_i64(pattern_json, "instrument").unwrap_or(1).max(1) as usize
                - 1)
                .min(max_instrument - 1);
            pattern.notes.clear();
            if let Some(notes) = get_array(pattern_json, "notes") {
                for note_json in notes {
                    if let Some(note) = import_note(note_json) {
                        pattern.notes.push(note);
                    }
                }
            }
        }
    }
    if let Some(sequence) = get_array(json, "sequence") {
        for (i, value) in sequence.iter().enumerate().take(song.bar_count) {
            let reference = value.as_i64().unwrap_or(0).max(0) as usize;
            song.channels[channel_index].bars[i] = reference.min(song.patterns_per_channel);
        }
    }
}

fn import_note(json: &Value) -> Option<Note> {
    let pitches: Vec<i32> = get_array(json, "pitches")?
        .iter()
        .filter_map(Value::as_i64)
        .map(|p| p as i32)
        .collect();
    let points = get_array(json, "points")?;
    if pitches.is_empty() || points.len() < 2 {
        return None;
    }
    let start = get_i64(&points[0], "tick")? as i32;
    let mut pins: Vec<NotePin> = Vec::with_capacity(points.len());
    for point in points {
        let tick = get_i64(point, "tick")? as i32;
        // Pin times must be strictly increasing, like the bit-stream
        // codec produces by construction.
        if let Some(previous) = pins.last() {
            if tick - start <= previous.time {
                return None;
            }
        }
        let interval = get_i64(point, "pitchBend").unwrap_or(0) as i32;
        let volume = get_i64(point, "volume").unwrap_or(100).clamp(0, 100);
        // Encoded 0..100 volume maps to the internal 0..3 expression.
        let expression = ((volume * 3 + 50) / 100) as i32;
        pins.push(NotePin::new(tick - start, interval, expression));
    }
    let end = start + pins.last()?.time;
    if end <= start {
        return None;
    }
    // The first pin anchors the note's base pitches.
    let base_interval = pins[0].interval;
    if base_interval != 0 {
        return None;
    }
    Some(Note {
        pitches,
        start,
        end,
        pins,
    })
}

fn import_instrument(json: &Value, is_noise: bool) -> Instrument {
    let kind = get_str(json, "type")
        .map(instrument_kind)
        .unwrap_or(if is_noise {
            InstrumentKind::Noise
        } else {
            InstrumentKind::Chip
        });
    let kind = if kind.is_noise() != is_noise {
        if is_noise {
            InstrumentKind::Noise
        } else {
            InstrumentKind::Chip
        }
    } else {
        kind
    };
    let mut instrument = Instrument::new(kind);

    if let Some(volume) = get_i64(json, "volume") {
        instrument.volume = (volume as i32).clamp(0, crate::constants::VOLUME_RANGE - 1);
    }
    if let Some(preset) = get_i64(json, "preset") {
        instrument.preset = preset.max(0) as usize;
    }
    if let Some(effects) = get_array(json, "effects") {
        instrument.effects = EffectFlags::empty();
        for name in effects.iter().filter_map(Value::as_str) {
            for (flag, flag_name) in EFFECT_NAMES {
                if name == flag_name {
                    instrument.effects |= flag;
                }
            }
        }
    }
    if let Some(name) = get_str(json, "transition") {
        instrument.transition = name_index(
            TRANSITIONS.iter().map(|t| t.name),
            name,
            crate::constants::DEFAULT_TRANSITION,
        );
    }
    if let Some(name) = get_str(json, "chord") {
        instrument.chord = chord_index(name);
    }
    if let Some(name) = get_str(json, "vibrato") {
        instrument.vibrato = name_index(VIBRATOS.iter().map(|v| v.name), name, 0);
    }
    if let Some(name) = get_str(json, "interval") {
        instrument.interval = name_index(INTERVALS.iter().map(|i| i.name), name, 0);
    }
    if let Some(points) = json.get("filter") {
        instrument.filter = import_filter(points);
    }
    if let Some(name) = get_str(json, "filterEnvelope") {
        instrument.filter_envelope = envelope_index(name);
    }
    if let Some(points) = json.get("effectFilter") {
        instrument.effect_filter = import_filter(points);
    }
    if let Some(value) = get_i64(json, "distortion") {
        instrument.distortion = (value as i32).clamp(0, crate::constants::DISTORTION_RANGE - 1);
    }
    if let Some(value) = get_i64(json, "bitcrusherFreq") {
        instrument.bitcrusher_freq =
            (value as i32).clamp(0, crate::constants::BITCRUSHER_FREQ_RANGE - 1);
    }
    if let Some(value) = get_i64(json, "bitcrusherQuantization") {
        instrument.bitcrusher_quantization =
            (value as i32).clamp(0, crate::constants::BITCRUSHER_QUANTIZATION_RANGE - 1);
    }
    if let Some(value) = get_i64(json, "pan") {
        // JSON pan is -100..100; internal is 0..=PAN_MAX around the center.
        let scaled = (value as f64 / 100.0 * PAN_CENTER as f64).round() as i32;
        instrument.pan = (PAN_CENTER + scaled).clamp(0, PAN_MAX);
    }
    if let Some(value) = get_i64(json, "reverb") {
        instrument.reverb = (value as i32).clamp(0, crate::constants::REVERB_RANGE - 1);
    }

    match kind {
        InstrumentKind::Chip => {
            if let Some(name) = get_str(json, "wave") {
                instrument.chip_wave = name_index(CHIP_WAVES.iter().map(|w| w.name), name, 2);
            }
        }
        InstrumentKind::Noise => {
            if let Some(name) = get_str(json, "wave") {
                instrument.noise_wave = name_index(NOISE_WAVES.iter().map(|w| w.name), name, 0);
            }
        }
        InstrumentKind::Fm => {
            if let Some(name) = get_str(json, "algorithm") {
                instrument.algorithm = name_index(ALGORITHMS.iter().map(|a| a.name), name, 0);
            }
            if let Some(name) = get_str(json, "feedbackType") {
                instrument.feedback_type = name_index(FEEDBACKS.iter().map(|f| f.name), name, 0);
            }
            if let Some(value) = get_i64(json, "feedbackAmplitude") {
                instrument.feedback_amplitude = (value as i32).clamp(0, OPERATOR_AMPLITUDE_MAX);
            }
            if let Some(name) = get_str(json, "feedbackEnvelope") {
                instrument.feedback_envelope = envelope_index(name);
            }
            if let Some(operators) = get_array(json, "operators") {
                for (i, operator_json) in operators.iter().enumerate().take(OPERATOR_COUNT) {
                    if let Some(name) = get_str(operator_json, "frequency") {
                        instrument.operators[i].frequency =
                            name_index(OPERATOR_FREQUENCIES.iter().map(|f| f.name), name, 0);
                    }
                    if let Some(value) = get_i64(operator_json, "amplitude") {
                        instrument.operators[i].amplitude =
                            (value as i32).clamp(0, OPERATOR_AMPLITUDE_MAX);
                    }
                    if let Some(name) = get_str(operator_json, "envelope") {
                        instrument.operators[i].envelope = envelope_index(name);
                    }
                }
            }
        }
        InstrumentKind::Spectrum => {
            if let Some(values) = get_array(json, "spectrum") {
                for (i, value) in values
                    .iter()
                    .enumerate()
                    .take(instrument.spectrum_wave.spectrum.len())
                {
                    instrument.spectrum_wave.spectrum[i] =
                        (value.as_i64().unwrap_or(0) as i32).clamp(0, SPECTRUM_CONTROL_MAX);
                }
            }
        }
        InstrumentKind::Drumset => {
            if let Some(drums) = get_array(json, "drums") {
                for (i, drum_json) in drums.iter().enumerate().take(DRUM_COUNT) {
                    if let Some(name) = get_str(drum_json, "envelope") {
                        instrument.drumset_envelopes[i] = envelope_index(name);
                    }
                    if let Some(values) = get_array(drum_json, "spectrum") {
                        for (j, value) in values
                            .iter()
                            .enumerate()
                            .take(instrument.drumset_spectrum_waves[i].spectrum.len())
                        {
                            instrument.drumset_spectrum_waves[i].spectrum[j] =
                                (value.as_i64().unwrap_or(0) as i32).clamp(0, SPECTRUM_CONTROL_MAX);
                        }
                    }
                }
            }
        }
        InstrumentKind::Harmonics => {
            if let Some(values) = get_array(json, "harmonics") {
                for (i, value) in values
                    .iter()
                    .enumerate()
                    .take(instrument.harmonics_wave.harmonics.len())
                {
                    instrument.harmonics_wave.harmonics[i] =
                        (value.as_i64().unwrap_or(0) as i32).clamp(0, HARMONICS_CONTROL_MAX);
                }
            }
        }
        InstrumentKind::Pwm => {
            if let Some(value) = get_i64(json, "pulseWidth") {
                instrument.pulse_width =
                    (value as i32).clamp(0, crate::constants::PULSE_WIDTH_RANGE - 1);
            }
            if let Some(name) = get_str(json, "pulseEnvelope") {
                instrument.pulse_envelope = envelope_index(name);
            }
        }
        InstrumentKind::Guitar => {
            if let Some(value) = get_i64(json, "sustain") {
                instrument.sustain =
                    (value as i32).clamp(0, crate::constants::GUITAR_SUSTAIN_RANGE - 1);
            }
            if let Some(value) = get_i64(json, "guitarPulseWidth") {
                instrument.guitar_pulse_width =
                    (value as i32).clamp(0, crate::constants::GUITAR_PULSE_WIDTH_RANGE - 1);
            }
        }
    }

    instrument
}

fn import_filter(json: &Value) -> FilterSettings {
    let mut filter = FilterSettings::default();
    if let Some(points) = json.as_array() {
        for point in points.iter().take(crate::constants::FILTER_MAX_POINTS) {
            let kind = get_str(point, "type")
                .map(filter_type_from_name)
                .unwrap_or(FilterType::LowPass);
            let freq = (get_i64(point, "freq").unwrap_or(0) as i32).clamp(0, FILTER_FREQ_RANGE - 1);
            let gain = (get_i64(point, "gain").unwrap_or(0) as i32).clamp(0, FILTER_GAIN_RANGE - 1);
            filter.points.push(FilterControlPoint::new(kind, freq, gain));
        }
    }
    filter
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Renders a song to the JSON form.
pub fn to_json(song: &Song) -> Value {
    let channels: Vec<Value> = song
        .channels
        .iter()
        .map(|channel| {
            json!({
                "type": if channel.is_noise { "drum" } else { "pitch" },
                "octaveScrollBar": channel.octave,
                "instruments": channel.instruments.iter()
                    .map(export_instrument)
                    .collect::<Vec<Value>>(),
                "patterns": channel.patterns.iter().map(|pattern| {
                    json!({
                        "instrument": pattern.instrument + 1,
                        "notes": pattern.notes.iter().map(export_note).collect::<Vec<Value>>(),
                    })
                }).collect::<Vec<Value>>(),
                "sequence": channel.bars.clone(),
            })
        })
        .collect();

    json!({
        "format": FORMAT_NAME,
        "version": LATEST_VERSION,
        "scale": SCALES[song.scale.min(SCALES.len() - 1)].name,
        "key": KEYS[song.key.min(KEYS.len() - 1)],
        "introBars": song.loop_start,
        "loopBars": song.loop_length,
        "beatsPerBar": song.beats_per_bar,
        "ticksPerBeat": RHYTHMS[song.rhythm.min(RHYTHMS.len() - 1)].steps_per_beat,
        "beatsPerMinute": song.tempo,
        "channels": channels,
    })
}

fn export_note(note: &Note) -> Value {
    let points: Vec<Value> = note
        .pins
        .iter()
        .map(|pin| {
            json!({
                "tick": note.start + pin.time,
                "pitchBend": pin.interval,
                "volume": (pin.expression * 100 + 1) / 3,
            })
        })
        .collect();
    json!({
        "pitches": note.pitches.clone(),
        "points": points,
    })
}

fn export_instrument(instrument: &Instrument) -> Value {
    let mut object = Map::new();
    object.insert("type".into(), json!(kind_name(instrument.kind)));
    object.insert("volume".into(), json!(instrument.volume));
    object.insert("preset".into(), json!(instrument.preset));
    let effects: Vec<&str> = EFFECT_NAMES
        .iter()
        .filter(|(flag, _)| instrument.effects.contains(*flag))
        .map(|(_, name)| *name)
        .collect();
    object.insert("effects".into(), json!(effects));
    object.insert(
        "transition".into(),
        json!(TRANSITIONS[instrument.transition].name),
    );
    object.insert("chord".into(), json!(CHORDS[instrument.chord].name));
    object.insert("vibrato".into(), json!(VIBRATOS[instrument.vibrato].name));
    object.insert("interval".into(), json!(INTERVALS[instrument.interval].name));
    object.insert("filter".into(), export_filter(&instrument.filter));
    object.insert(
        "filterEnvelope".into(),
        json!(ENVELOPES[instrument.filter_envelope].name),
    );
    object.insert("effectFilter".into(), export_filter(&instrument.effect_filter));
    object.insert("distortion".into(), json!(instrument.distortion));
    object.insert("bitcrusherFreq".into(), json!(instrument.bitcrusher_freq));
    object.insert(
        "bitcrusherQuantization".into(),
        json!(instrument.bitcrusher_quantization),
    );
    let pan = ((instrument.pan - PAN_CENTER) as f64 / PAN_CENTER as f64 * 100.0).round() as i64;
    object.insert("pan".into(), json!(pan));
    object.insert("reverb".into(), json!(instrument.reverb));

    match instrument.kind {
        InstrumentKind::Chip => {
            object.insert("wave".into(), json!(CHIP_WAVES[instrument.chip_wave].name));
        }
        InstrumentKind::Noise => {
            object.insert("wave".into(), json!(NOISE_WAVES[instrument.noise_wave].name));
        }
        InstrumentKind::Fm => {
            object.insert("algorithm".into(), json!(ALGORITHMS[instrument.algorithm].name));
            object.insert(
                "feedbackType".into(),
                json!(FEEDBACKS[instrument.feedback_type].name),
            );
            object.insert(
                "feedbackAmplitude".into(),
                json!(instrument.feedback_amplitude),
            );
            object.insert(
                "feedbackEnvelope".into(),
                json!(ENVELOPES[instrument.feedback_envelope].name),
            );
            let operators: Vec<Value> = instrument
                .operators
                .iter()
                .map(|op| {
                    json!({
                        "frequency": OPERATOR_FREQUENCIES[op.frequency].name,
                        "amplitude": op.amplitude,
                        "envelope": ENVELOPES[op.envelope].name,
                    })
                })
                .collect();
            object.insert("operators".into(), json!(operators));
        }
        InstrumentKind::Spectrum => {
            object.insert(
                "spectrum".into(),
                json!(instrument.spectrum_wave.spectrum.to_vec()),
            );
        }
        InstrumentKind::Drumset => {
            let drums: Vec<Value> = (0..DRUM_COUNT)
                .map(|i| {
                    json!({
                        "envelope": ENVELOPES[instrument.drumset_envelopes[i]].name,
                        "spectrum": instrument.drumset_spectrum_waves[i].spectrum.to_vec(),
                    })
                })
                .collect();
            object.insert("drums".into(), json!(drums));
        }
        InstrumentKind::Harmonics => {
            object.insert(
                "harmonics".into(),
                json!(instrument.harmonics_wave.harmonics.to_vec()),
            );
        }
        InstrumentKind::Pwm => {
            object.insert("pulseWidth".into(), json!(instrument.pulse_width));
            object.insert(
                "pulseEnvelope".into(),
                json!(ENVELOPES[instrument.pulse_envelope].name),
            );
        }
        InstrumentKind::Guitar => {
            object.insert("sustain".into(), json!(instrument.sustain));
            object.insert(
                "guitarPulseWidth".into(),
                json!(instrument.guitar_pulse_width),
            );
        }
    }

    Value::Object(object)
}

fn export_filter(filter: &FilterSettings) -> Value {
    let points: Vec<Value> = filter
        .points
        .iter()
        .map(|point| {
            json!({
                "type": filter_type_name(point.kind),
                "freq": point.freq,
                "gain": point.gain,
            })
        })
        .collect();
    json!(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_song_round_trips() {
        let song = Song::default();
        let exported = to_json(&song);
        let imported = from_json(&exported).unwrap();
        assert_eq!(imported, song);
    }

    #[test]
    fn test_notes_and_volume_mapping() {
        let mut song = Song::default();
        song.channels[0].bars[0] = 1;
        let mut note = Note::new(vec![60, 64], 12, 36, 3);
        note.pins[1].expression = 1;
        song.channels[0].patterns[0].notes.push(note);
        let imported = from_json(&to_json(&song)).unwrap();
        assert_eq!(imported, song);
    }

    #[test]
    fn test_non_increasing_points_rejected() {
        let value = json!({
            "format": "BeepBox",
            "channels": [{
                "type": "pitch",
                "instruments": [{"type": "chip"}],
                "patterns": [{
                    "instrument": 1,
                    "notes": [{
                        "pitches": [60],
                        "points": [
                            {"tick": 0, "pitchBend": 0, "volume": 100},
                            {"tick": 12, "pitchBend": 0, "volume": 100},
                            {"tick": 12, "pitchBend": 5, "volume": 100},
                            {"tick": 24, "pitchBend": 5, "volume": 100},
                        ],
                    }],
                }],
                "sequence": [1],
            }],
        });
        let song = from_json(&value).unwrap();
        // The duplicate tick violates the pin invariant; the note is
        // dropped rather than imported malformed.
        assert!(song.channels[0].patterns[0].notes.is_empty());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let value = json!({
            "format": "BeepBox",
            "beatsPerMinute": 200,
            "somethingNew": {"nested": true},
        });
        let song = from_json(&value).unwrap();
        assert_eq!(song.tempo, 200);
    }

    #[test]
    fn test_scale_alias() {
        let value = json!({"format": "BeepBox", "scale": "romani :)"});
        let song = from_json(&value).unwrap();
        assert_eq!(SCALES[song.scale].name, "dbl harmonic :)");
    }

    #[test]
    fn test_wrong_format_rejected() {
        let value = json!({"format": "NotASong"});
        assert!(from_json(&value).is_err());
    }

    #[test]
    fn test_global_reverb_applied_to_pitched_instruments() {
        let value = json!({
            "format": "BeepBox",
            "reverb": 2,
        });
        let song = from_json(&value).unwrap();
        assert!(song.channels[0].instruments[0]
            .effects
            .contains(EffectFlags::REVERB));
        assert_eq!(song.channels[0].instruments[0].reverb, 2);
    }

    #[test]
    fn test_pan_mapping_extremes() {
        let value = json!({
            "format": "BeepBox",
            "channels": [{
                "type": "pitch",
                "instruments": [{"type": "chip", "pan": 100}],
                "patterns": [],
                "sequence": [0],
            }],
        });
        let song = from_json(&value).unwrap();
        assert_eq!(song.channels[0].instruments[0].pan, PAN_MAX);
    }
}
