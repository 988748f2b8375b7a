//! Song data model.
//!
//! A song is a list of pitch channels followed by noise channels; each
//! channel owns a fixed-size pool of instruments and patterns plus a
//! per-bar sequence of pattern references. Patterns hold notes; notes
//! hold pins (time/interval/expression control points).

mod instrument;

pub use instrument::{
    EffectFlags, FilterControlPoint, FilterSettings, FilterType, HarmonicsWave, Instrument,
    InstrumentKind, Operator, SpectrumWave,
};

use crate::constants::{
    KEYS, MAX_BAR_COUNT, MAX_BEATS_PER_BAR, MAX_CHANNEL_OCTAVE, MAX_INSTRUMENTS_PER_CHANNEL,
    MAX_NOISE_CHANNELS, MAX_PATTERNS_PER_CHANNEL, MAX_PITCH_CHANNELS, MAX_TEMPO,
    MIN_BAR_COUNT, MIN_BEATS_PER_BAR, MIN_INSTRUMENTS_PER_CHANNEL, MIN_PATTERNS_PER_CHANNEL,
    MIN_PITCH_CHANNELS, MIN_TEMPO, PARTS_PER_BEAT, RHYTHMS, SCALES,
};

/// A control point within a note. Consecutive pins define linear bends
/// and expression ramps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotePin {
    /// Time in parts relative to the note's start.
    pub time: i32,
    /// Semitone offset relative to the note's base pitches.
    pub interval: i32,
    /// Velocity 0..=3.
    pub expression: i32,
}

impl NotePin {
    pub fn new(time: i32, interval: i32, expression: i32) -> Self {
        NotePin {
            time,
            interval,
            expression,
        }
    }
}

/// One note: a chord of pitches sounding from `start` to `end` (in
/// parts), shaped by at least two pins.
///
/// Invariants: the first pin is at time 0 with interval 0; the last pin's
/// time is `end - start`; pin times strictly increase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub pitches: Vec<i32>,
    pub start: i32,
    pub end: i32,
    pub pins: Vec<NotePin>,
}

impl Note {
    /// A flat note with the default two pins.
    pub fn new(pitches: Vec<i32>, start: i32, end: i32, expression: i32) -> Self {
        Note {
            pitches,
            start,
            end,
            pins: vec![
                NotePin::new(0, 0, expression),
                NotePin::new(end - start, 0, expression),
            ],
        }
    }

    /// Note length in parts.
    pub fn length(&self) -> i32 {
        self.end - self.start
    }
}

/// A reusable sequence of notes bound to one of the channel's
/// instruments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pattern {
    /// 0-based index into the channel's instrument list.
    pub instrument: usize,
    /// Notes sorted by start, non-overlapping.
    pub notes: Vec<Note>,
}

impl Pattern {
    /// Removes all notes and resets the instrument binding.
    pub fn reset(&mut self) {
        self.instrument = 0;
        self.notes.clear();
    }
}

/// One channel: pitched or noise, with instruments, patterns, and a bar
/// sequence of 1-based pattern references (0 = silent bar).
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub is_noise: bool,
    /// Octave scroll offset, 0..=[`MAX_CHANNEL_OCTAVE`]; ignored for
    /// noise channels.
    pub octave: i32,
    pub muted: bool,
    pub instruments: Vec<Instrument>,
    pub patterns: Vec<Pattern>,
    pub bars: Vec<usize>,
}

impl Channel {
    pub fn new(is_noise: bool, instrument_count: usize, pattern_count: usize, bar_count: usize) -> Self {
        Channel {
            is_noise,
            octave: 0,
            muted: false,
            instruments: (0..instrument_count)
                .map(|_| Instrument::default_for_channel(is_noise))
                .collect(),
            patterns: vec![Pattern::default(); pattern_count],
            bars: vec![0; bar_count],
        }
    }

    /// The pattern sounding at `bar`, if any.
    pub fn pattern_for_bar(&self, bar: usize) -> Option<&Pattern> {
        let reference = *self.bars.get(bar)?;
        if reference == 0 {
            None
        } else {
            self.patterns.get(reference - 1)
        }
    }
}

/// A complete song: global settings plus channels.
#[derive(Debug, Clone, PartialEq)]
pub struct Song {
    /// Index into [`SCALES`].
    pub scale: usize,
    /// Index into [`KEYS`].
    pub key: usize,
    /// Beats per minute.
    pub tempo: i32,
    pub beats_per_bar: i32,
    pub bar_count: usize,
    pub patterns_per_channel: usize,
    /// Index into [`RHYTHMS`].
    pub rhythm: usize,
    pub instruments_per_channel: usize,
    /// First bar of the loop region.
    pub loop_start: usize,
    /// Length of the loop region in bars, at least 1.
    pub loop_length: usize,
    pub pitch_channel_count: usize,
    pub noise_channel_count: usize,
    /// Pitch channels first, then noise channels.
    pub channels: Vec<Channel>,
}

impl Default for Song {
    fn default() -> Self {
        let mut song = Song {
            scale: 0,
            key: 0,
            tempo: 150,
            beats_per_bar: 8,
            bar_count: 16,
            patterns_per_channel: 8,
            rhythm: crate::constants::DEFAULT_RHYTHM,
            instruments_per_channel: 1,
            loop_start: 0,
            loop_length: 4,
            pitch_channel_count: 3,
            noise_channel_count: 1,
            channels: Vec::new(),
        };
        song.sync_channel_counts();
        song
    }
}

impl Song {
    /// Decodes a song from the URL string form.
    pub fn from_url(data: &str) -> crate::Result<Song> {
        crate::codec::url::decode(data)
    }

    /// Encodes this song to the URL string form at the latest version.
    pub fn to_url(&self) -> String {
        crate::codec::url::encode(self)
    }

    /// Imports a song from the JSON form.
    #[cfg(feature = "json")]
    pub fn from_json(json: &serde_json::Value) -> crate::Result<Song> {
        crate::codec::json::from_json(json)
    }

    /// Exports this song to the JSON form.
    #[cfg(feature = "json")]
    pub fn to_json(&self) -> serde_json::Value {
        crate::codec::json::to_json(self)
    }

    /// Rebuilds the channel list to match the channel count fields,
    /// preserving existing channels and their contents.
    pub fn sync_channel_counts(&mut self) {
        self.pitch_channel_count = self
            .pitch_channel_count
            .clamp(MIN_PITCH_CHANNELS, MAX_PITCH_CHANNELS);
        self.noise_channel_count = self.noise_channel_count.min(MAX_NOISE_CHANNELS);

        let mut pitch: Vec<Channel> = Vec::new();
        let mut noise: Vec<Channel> = Vec::new();
        for channel in self.channels.drain(..) {
            if channel.is_noise {
                noise.push(channel);
            } else {
                pitch.push(channel);
            }
        }
        pitch.truncate(self.pitch_channel_count);
        noise.truncate(self.noise_channel_count);
        while pitch.len() < self.pitch_channel_count {
            pitch.push(Channel::new(
                false,
                self.instruments_per_channel,
                self.patterns_per_channel,
                self.bar_count,
            ));
        }
        while noise.len() < self.noise_channel_count {
            noise.push(Channel::new(
                true,
                self.instruments_per_channel,
                self.patterns_per_channel,
                self.bar_count,
            ));
        }
        self.channels = pitch;
        self.channels.append(&mut noise);
        self.sync_member_counts();
    }

    /// Resizes every channel's instruments, patterns, and bars to match
    /// the count fields, preserving existing entries.
    pub fn sync_member_counts(&mut self) {
        self.bar_count = self.bar_count.clamp(MIN_BAR_COUNT, MAX_BAR_COUNT);
        self.patterns_per_channel = self
            .patterns_per_channel
            .clamp(MIN_PATTERNS_PER_CHANNEL, MAX_PATTERNS_PER_CHANNEL);
        self.instruments_per_channel = self
            .instruments_per_channel
            .clamp(MIN_INSTRUMENTS_PER_CHANNEL, MAX_INSTRUMENTS_PER_CHANNEL);
        for channel in self.channels.iter_mut() {
            let is_noise = channel.is_noise;
            channel.bars.resize(self.bar_count, 0);
            channel.patterns.resize(self.patterns_per_channel, Pattern::default());
            while channel.instruments.len() < self.instruments_per_channel {
                channel.instruments.push(Instrument::default_for_channel(is_noise));
            }
            channel.instruments.truncate(self.instruments_per_channel);
            // A pattern can only reference instruments that still exist.
            let cap = self.instruments_per_channel;
            for pattern in channel.patterns.iter_mut() {
                if pattern.instrument >= cap {
                    pattern.instrument = 0;
                }
            }
            for bar in channel.bars.iter_mut() {
                if *bar > self.patterns_per_channel {
                    *bar = 0;
                }
            }
        }
        if self.loop_start >= self.bar_count {
            self.loop_start = 0;
        }
        self.loop_length = self.loop_length.clamp(1, self.bar_count - self.loop_start);
    }

    /// Clamps the scalar settings into their documented ranges.
    pub fn clamp_settings(&mut self) {
        self.scale = self.scale.min(SCALES.len() - 1);
        self.key = self.key.min(KEYS.len() - 1);
        self.tempo = self.tempo.clamp(MIN_TEMPO, MAX_TEMPO);
        self.beats_per_bar = self.beats_per_bar.clamp(MIN_BEATS_PER_BAR, MAX_BEATS_PER_BAR);
        self.rhythm = self.rhythm.min(RHYTHMS.len() - 1);
        for channel in self.channels.iter_mut() {
            channel.octave = channel.octave.clamp(0, MAX_CHANNEL_OCTAVE);
        }
    }

    /// Parts in one bar.
    pub fn parts_per_bar(&self) -> i32 {
        self.beats_per_bar * PARTS_PER_BEAT
    }

    /// Channel count including noise channels.
    pub fn channel_count(&self) -> usize {
        self.pitch_channel_count + self.noise_channel_count
    }

    /// Seconds one bar lasts at the song tempo.
    pub fn seconds_per_bar(&self) -> f64 {
        self.beats_per_bar as f64 * 60.0 / self.tempo as f64
    }

    /// Human-readable one-line summary.
    pub fn info(&self) -> String {
        format!(
            "scale {} / key {} / {} BPM / {} beats per bar / {} bars ({} pitch + {} noise channels, ~{:.1}s)",
            SCALES[self.scale.min(SCALES.len() - 1)].name,
            KEYS[self.key.min(KEYS.len() - 1)],
            self.tempo,
            self.beats_per_bar,
            self.bar_count,
            self.pitch_channel_count,
            self.noise_channel_count,
            self.seconds_per_bar() * self.bar_count as f64,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_song_shape() {
        let song = Song::default();
        assert_eq!(song.channels.len(), 4);
        assert!(!song.channels[2].is_noise);
        assert!(song.channels[3].is_noise);
        for channel in &song.channels {
            assert_eq!(channel.bars.len(), song.bar_count);
            assert_eq!(channel.patterns.len(), song.patterns_per_channel);
            assert_eq!(channel.instruments.len(), song.instruments_per_channel);
        }
    }

    #[test]
    fn test_resize_preserves_existing_patterns() {
        let mut song = Song::default();
        song.channels[0].patterns[2].notes.push(Note::new(vec![60], 0, 24, 3));
        song.channels[0].bars[5] = 3;
        song.patterns_per_channel = 16;
        song.bar_count = 32;
        song.sync_member_counts();
        assert_eq!(song.channels[0].patterns.len(), 16);
        assert_eq!(song.channels[0].bars.len(), 32);
        assert_eq!(song.channels[0].patterns[2].notes.len(), 1);
        assert_eq!(song.channels[0].bars[5], 3);
    }

    #[test]
    fn test_shrinking_patterns_clears_dangling_bar_references() {
        let mut song = Song::default();
        song.channels[1].bars[0] = 8;
        song.patterns_per_channel = 4;
        song.sync_member_counts();
        assert_eq!(song.channels[1].bars[0], 0);
    }

    #[test]
    fn test_channel_count_change_preserves_kept_channels() {
        let mut song = Song::default();
        song.channels[0].octave = 3;
        song.pitch_channel_count = 5;
        song.sync_channel_counts();
        assert_eq!(song.channels.len(), 6);
        assert_eq!(song.channels[0].octave, 3);
        assert!(song.channels[5].is_noise);
    }

    #[test]
    fn test_pattern_for_bar() {
        let mut song = Song::default();
        song.channels[0].bars[0] = 1;
        song.channels[0].patterns[0].notes.push(Note::new(vec![48], 0, 12, 3));
        assert_eq!(song.channels[0].pattern_for_bar(0).unwrap().notes.len(), 1);
        assert!(song.channels[0].pattern_for_bar(1).is_none());
    }

    #[test]
    fn test_loop_clamped_to_bar_count() {
        let mut song = Song::default();
        song.loop_start = 12;
        song.loop_length = 100;
        song.sync_member_counts();
        assert!(song.loop_start + song.loop_length <= song.bar_count);
    }
}
