//! Synthesis engine.
//!
//! The [`Synth`] owns a [`Song`] and renders it into caller-provided
//! stereo buffers, one host callback at a time. Inside a callback it
//! advances a tick/part/beat/bar clock, assigns tones to channels from
//! the current patterns, voices and renders every tone into a shared
//! mono scratch buffer, runs each instrument's effects chain into the
//! stereo mix, and finishes with the master limiter. All state is owned
//! by the engine; there are no internal threads or locks.

pub mod compute;
pub mod effects;
pub mod envelope;
pub mod limiter;
pub mod tone;
pub mod voices;

use rand::SeedableRng;
use rand_pcg::Pcg32;

use crate::constants::{
    CHORDS, DEFAULT_SAMPLE_RATE, LIVE_INPUT_TIMEOUT_SECONDS, MAX_CHORD_SIZE,
    MAX_TONES_PER_CHANNEL, PARTS_PER_BEAT, TICKS_PER_PART, TRANSITIONS,
};
use crate::song::{Note, Song};
use compute::{compute_tone, RunContext};
use effects::InstrumentState;
use limiter::Limiter;
use tone::{NoteEdge, TonePool, ToneNote};

/// Default seed for the engine's RNG. Pluck jitter and spectrum start
/// phases draw from it; renders with equal seeds are bit-identical.
const DEFAULT_SEED: u64 = 0xc41b_a5e5_700d_0001;

/// Runtime state for one channel.
#[derive(Debug, Default)]
struct ChannelState {
    /// Tones currently sounding for the active pattern, in chord order.
    active_tones: Vec<usize>,
    /// Released tones, per instrument slot.
    released_tones: Vec<Vec<usize>>,
    /// Live-input tones.
    live_tones: Vec<usize>,
    instrument_states: Vec<InstrumentState>,
}

/// The synthesizer.
pub struct Synth {
    /// The song being played. Mutating it between calls is allowed; the
    /// engine re-reads patterns at every tick boundary.
    pub song: Song,
    sample_rate: f64,
    volume: f64,
    playing: bool,

    bar: usize,
    /// Parts into the current bar.
    part: i32,
    /// Ticks into the current part.
    tick: i32,
    tick_sample_countdown: f64,
    tick_counter: i64,
    seconds_elapsed: f64,
    need_tone_update: bool,

    channels: Vec<ChannelState>,
    pool: TonePool,
    temp_mono: Vec<f32>,
    limiter: Limiter,
    bank: crate::dsp::WaveBank,
    rng: Pcg32,

    live_input_pitches: Vec<i32>,
    live_input_channel: usize,
    live_input_deadline: f64,
}

impl Synth {
    /// Creates an engine at the default sample rate.
    pub fn new(song: Song) -> Self {
        Self::with_sample_rate(song, DEFAULT_SAMPLE_RATE as f64)
    }

    /// Creates an engine for a specific host sample rate.
    pub fn with_sample_rate(song: Song, sample_rate: f64) -> Self {
        let mut synth = Synth {
            song,
            sample_rate,
            volume: 1.0,
            playing: false,
            bar: 0,
            part: 0,
            tick: 0,
            tick_sample_countdown: 0.0,
            tick_counter: 0,
            seconds_elapsed: 0.0,
            need_tone_update: true,
            channels: Vec::new(),
            pool: TonePool::new(),
            temp_mono: Vec::new(),
            limiter: Limiter::new(),
            bank: crate::dsp::WaveBank::new(),
            rng: Pcg32::seed_from_u64(DEFAULT_SEED),
            live_input_pitches: Vec::new(),
            live_input_channel: 0,
            live_input_deadline: 0.0,
        };
        synth.tick_sample_countdown = synth.samples_per_tick();
        synth.sync_channel_states();
        synth
    }

    /// Reseeds the jitter RNG, for reproducible renders.
    pub fn set_seed(&mut self, seed: u64) {
        self.rng = Pcg32::seed_from_u64(seed);
    }

    /// Master output volume applied in the limiter stage.
    pub fn set_volume(&mut self, volume: f64) {
        self.volume = volume.max(0.0);
    }

    /// Starts playback from the current playhead.
    pub fn play(&mut self) {
        self.playing = true;
    }

    /// Pauses playback; sounding tones fade out over their release.
    pub fn pause(&mut self) {
        self.playing = false;
        self.need_tone_update = true;
    }

    /// Stops playback, resets the playhead to the song start, and frees
    /// every tone.
    pub fn stop(&mut self) {
        self.playing = false;
        self.bar = 0;
        self.part = 0;
        self.tick = 0;
        self.tick_counter = 0;
        self.seconds_elapsed = 0.0;
        self.tick_sample_countdown = self.samples_per_tick();
        self.need_tone_update = true;
        self.free_all_tones();
        for channel in self.channels.iter_mut() {
            for state in channel.instrument_states.iter_mut() {
                state.deactivate();
            }
        }
        self.limiter.reset();
    }

    /// Whether playback is running.
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Song position 0..1.
    pub fn playhead(&self) -> f64 {
        let parts_per_bar = self.song.parts_per_bar() as f64;
        let bar_progress = (self.part as f64
            + (self.tick as f64 + self.tick_fraction()) / TICKS_PER_PART as f64)
            / parts_per_bar;
        ((self.bar as f64 + bar_progress) / self.song.bar_count as f64).clamp(0.0, 1.0)
    }

    /// Moves the playhead to the start of a beat.
    pub fn set_playhead(&mut self, bar: usize, beat: i32) {
        self.bar = bar.min(self.song.bar_count.saturating_sub(1));
        self.part = (beat.clamp(0, self.song.beats_per_bar - 1)) * PARTS_PER_BEAT;
        self.tick = 0;
        self.tick_sample_countdown = self.samples_per_tick();
        self.need_tone_update = true;
        self.free_all_tones();
    }

    /// Arms the live-input deadline and replaces the held pitches.
    /// Call repeatedly while keys are held; an empty slice releases.
    pub fn maintain_live_input(&mut self, pitches: &[i32], channel: usize) {
        self.live_input_pitches = pitches.iter().copied().take(MAX_CHORD_SIZE).collect();
        self.live_input_channel = channel.min(self.song.channels.len().saturating_sub(1));
        self.live_input_deadline = self.seconds_elapsed + LIVE_INPUT_TIMEOUT_SECONDS;
        self.need_tone_update = true;
    }

    /// Whether the host should keep the audio source active: something
    /// is playing, ringing out, or the live-input deadline is armed.
    pub fn wants_audio(&self) -> bool {
        self.playing
            || self.pool.live_count() > 0
            || self.seconds_elapsed < self.live_input_deadline
            || self
                .channels
                .iter()
                .any(|c| c.instrument_states.iter().any(|s| s.awake))
    }

    /// Samples in one tick at the song tempo.
    pub fn samples_per_tick(&self) -> f64 {
        let ticks_per_second =
            (TICKS_PER_PART * PARTS_PER_BEAT) as f64 * self.song.tempo as f64 / 60.0;
        self.sample_rate / ticks_per_second
    }

    fn tick_fraction(&self) -> f64 {
        (1.0 - self.tick_sample_countdown / self.samples_per_tick()).clamp(0.0, 1.0)
    }

    fn free_all_tones(&mut self) {
        for channel in self.channels.iter_mut() {
            for index in channel.active_tones.drain(..) {
                self.pool.free_tone(index);
            }
            for queue in channel.released_tones.iter_mut() {
                for index in queue.drain(..) {
                    self.pool.free_tone(index);
                }
            }
            for index in channel.live_tones.drain(..) {
                self.pool.free_tone(index);
            }
        }
    }

    /// Rebuilds runtime channel state after the song's shape changed.
    fn sync_channel_states(&mut self) {
        let channel_count = self.song.channels.len();
        let instrument_count = self.song.instruments_per_channel;
        let shape_matches = self.channels.len() == channel_count
            && self
                .channels
                .iter()
                .all(|c| c.instrument_states.len() == instrument_count);
        if shape_matches {
            return;
        }
        self.free_all_tones();
        self.channels = (0..channel_count)
            .map(|_| {
                let mut state = ChannelState::default();
                state.released_tones = (0..instrument_count).map(|_| Vec::new()).collect();
                state.instrument_states =
                    (0..instrument_count).map(|_| InstrumentState::new()).collect();
                state
            })
            .collect();
    }

    /// Fills the two stereo channel buffers. Both must be equal length.
    pub fn synthesize(&mut self, left: &mut [f32], right: &mut [f32]) {
        let length = left.len().min(right.len());
        left[..length].fill(0.0);
        right[..length].fill(0.0);
        self.sync_channel_states();
        if self.temp_mono.len() < length {
            self.temp_mono.resize(length, 0.0);
        }

        let samples_per_tick = self.samples_per_tick();
        if self.tick_sample_countdown <= 0.0 || self.tick_sample_countdown > samples_per_tick {
            self.tick_sample_countdown = samples_per_tick;
        }

        let mut buffer_index = 0usize;
        while buffer_index < length {
            let samples_left = length - buffer_index;
            let samples_left_in_tick = self.tick_sample_countdown.ceil().max(1.0) as usize;
            let run_length = samples_left.min(samples_left_in_tick);

            if self.need_tone_update {
                for channel_index in 0..self.channels.len() {
                    self.determine_current_tones(channel_index);
                }
                self.need_tone_update = false;
            }

            let ctx = RunContext {
                sample_rate: self.sample_rate,
                samples_per_tick,
                run_length,
                seconds_per_tick: samples_per_tick / self.sample_rate,
                part_in_bar: self.part as f64
                    + (self.tick as f64 + self.tick_fraction()) / TICKS_PER_PART as f64,
                tick_fraction: self.tick_fraction(),
                beats: self.bar as f64 * self.song.beats_per_bar as f64
                    + (self.part as f64
                        + (self.tick as f64 + self.tick_fraction()) / TICKS_PER_PART as f64)
                        / PARTS_PER_BEAT as f64,
                seconds_elapsed: self.seconds_elapsed,
                tick_counter: self.tick_counter,
            };

            self.render_run(&ctx, buffer_index, run_length, left, right);

            self.limiter.process(
                self.volume,
                self.sample_rate,
                &mut left[buffer_index..buffer_index + run_length],
                &mut right[buffer_index..buffer_index + run_length],
            );

            buffer_index += run_length;
            self.seconds_elapsed += run_length as f64 / self.sample_rate;
            self.tick_sample_countdown -= run_length as f64;
            if self.tick_sample_countdown <= 0.0 {
                self.tick_sample_countdown += samples_per_tick;
                self.advance_tick();
            }
        }
    }

    /// Voices and renders every live tone for one run, then the effects
    /// chains, into the given output span.
    fn render_run(
        &mut self,
        ctx: &RunContext,
        buffer_index: usize,
        run_length: usize,
        left: &mut [f32],
        right: &mut [f32],
    ) {
        let rhythm = self.song.rhythm;
        for channel_index in 0..self.channels.len() {
            let muted = self.song.channels[channel_index].muted;
            let is_noise = self.song.channels[channel_index].is_noise;
            let octave = self.song.channels[channel_index].octave;
            let instrument_count = self.song.channels[channel_index]
                .instruments
                .len()
                .min(self.channels[channel_index].instrument_states.len());
            for instrument_index in 0..instrument_count {
                // Gather the tones owned by this instrument slot.
                let channel_state = &self.channels[channel_index];
                let mut tone_ids: Vec<usize> = Vec::new();
                tone_ids.extend(
                    channel_state
                        .active_tones
                        .iter()
                        .chain(channel_state.live_tones.iter())
                        .filter(|&&id| self.pool.get(id).instrument_index == instrument_index),
                );
                tone_ids.extend(channel_state.released_tones[instrument_index].iter());

                let tones_active = !tone_ids.is_empty();
                let state_awake =
                    self.channels[channel_index].instrument_states[instrument_index].awake;
                if !tones_active && !state_awake {
                    continue;
                }

                let instrument = &self.song.channels[channel_index].instruments[instrument_index];
                let state =
                    &mut self.channels[channel_index].instrument_states[instrument_index];
                state.prepare_waves(instrument);

                for &tone_id in &tone_ids {
                    let tone = self.pool.get_mut(tone_id);
                    compute_tone(tone, instrument, octave, is_noise, rhythm, ctx);
                    if !muted {
                        voices::render_tone(
                            tone,
                            instrument,
                            &self.bank,
                            &state.waves,
                            &mut self.rng,
                            self.sample_rate,
                            &mut self.temp_mono[..run_length],
                        );
                    }
                }

                state.run_effects(
                    instrument,
                    self.sample_rate,
                    tones_active,
                    &mut self.temp_mono[..run_length],
                    &mut left[buffer_index..buffer_index + run_length],
                    &mut right[buffer_index..buffer_index + run_length],
                );
            }
        }
    }

    /// Advances the clock by one tick and runs the per-tick lifecycle:
    /// release aging, last-tick frees, sanitization sweeps, instrument
    /// deactivation, and loop/bar wrapping.
    fn advance_tick(&mut self) {
        self.tick_counter += 1;

        for channel_index in 0..self.channels.len() {
            let channel = &mut self.channels[channel_index];
            for &id in channel.active_tones.iter().chain(channel.live_tones.iter()) {
                let tone = self.pool.get_mut(id);
                tone.ticks_since_note_start += 1;
                tone.sanitize();
            }
            let instrument_slots = channel.released_tones.len();
            for instrument_index in 0..instrument_slots {
                let release_ticks = {
                    let channel_data = &self.song.channels[channel_index];
                    channel_data
                        .instruments
                        .get(instrument_index)
                        .map_or(1, |i| TRANSITIONS[i.transition].release_ticks)
                };
                let queue = &mut channel.released_tones[instrument_index];
                let mut kept = Vec::with_capacity(queue.len());
                for id in queue.drain(..) {
                    let tone = self.pool.get_mut(id);
                    tone.sanitize();
                    if tone.is_on_last_tick || tone.fade_out_fast {
                        self.pool.free_tone(id);
                        continue;
                    }
                    tone.ticks_since_released += 1;
                    tone.ticks_since_note_start += 1;
                    if tone.ticks_since_released + 1 >= release_ticks {
                        tone.is_on_last_tick = true;
                    }
                    kept.push(id);
                }
                *queue = kept;
            }
            for state in channel.instrument_states.iter_mut() {
                state.sanitize();
                if state.deactivate_after_this_tick {
                    state.deactivate();
                }
            }
        }

        // Live input expires when its deadline passes.
        if !self.live_input_pitches.is_empty() && self.seconds_elapsed >= self.live_input_deadline
        {
            self.live_input_pitches.clear();
        }

        self.tick += 1;
        if self.tick >= TICKS_PER_PART {
            self.tick = 0;
            self.part += 1;
            if self.part >= self.song.parts_per_bar() {
                self.part = 0;
                if self.playing {
                    self.bar += 1;
                    let loop_end = (self.song.loop_start + self.song.loop_length)
                        .min(self.song.bar_count);
                    if self.bar >= loop_end || self.bar >= self.song.bar_count {
                        self.bar = self.song.loop_start.min(self.song.bar_count - 1);
                    }
                }
            }
        }
        self.need_tone_update = true;
    }

    /// Reconciles a channel's tones with the pattern at the playhead:
    /// picks up newly started notes, continues or releases tones at note
    /// boundaries per the instrument's transition, and keeps live-input
    /// tones in sync with the held pitches.
    fn determine_current_tones(&mut self, channel_index: usize) {
        // Locate the current, previous, and next notes in the pattern.
        struct Placement {
            note: Note,
            prev: Option<NoteEdge>,
            next: Option<NoteEdge>,
            instrument_index: usize,
        }
        let placement: Option<Placement> = if self.playing {
            let channel = &self.song.channels[channel_index];
            channel.pattern_for_bar(self.bar).and_then(|pattern| {
                let part = self.part;
                let position = pattern
                    .notes
                    .iter()
                    .position(|n| n.start <= part && part < n.end);
                position.map(|i| {
                    let note = pattern.notes[i].clone();
                    let prev = (i > 0 && pattern.notes[i - 1].end == note.start).then(|| {
                        let p = &pattern.notes[i - 1];
                        let last = p.pins.last().unwrap();
                        NoteEdge {
                            pitch: p.pitches[0] + last.interval,
                            length: p.end - p.start,
                            expression: last.expression,
                        }
                    });
                    let next = pattern
                        .notes
                        .get(i + 1)
                        .filter(|n| n.start == note.end)
                        .map(|n| NoteEdge {
                            pitch: n.pitches[0],
                            length: n.end - n.start,
                            expression: n.pins[0].expression,
                        });
                    Placement {
                        note,
                        prev,
                        next,
                        instrument_index: pattern
                            .instrument
                            .min(channel.instruments.len() - 1),
                    }
                })
            })
        } else {
            None
        };

        match placement {
            Some(placement) => self.assign_note_tones(channel_index, placement.note,
                placement.prev, placement.next, placement.instrument_index),
            None => self.release_active_tones(channel_index),
        }

        self.update_live_tones(channel_index);
        self.enforce_tone_cap(channel_index);
    }

    fn assign_note_tones(
        &mut self,
        channel_index: usize,
        note: Note,
        prev: Option<NoteEdge>,
        next: Option<NoteEdge>,
        instrument_index: usize,
    ) {
        let (chord_index, transition_index) = {
            let instrument = &self.song.channels[channel_index].instruments[instrument_index];
            (instrument.chord, instrument.transition)
        };
        let chord = &CHORDS[chord_index];
        let seamless = TRANSITIONS[transition_index].is_seamless;
        let chord_size = note.pitches.len().clamp(1, MAX_CHORD_SIZE);

        // How many tones this chord needs right now, honoring strum
        // offsets.
        let desired = if chord.single_tone {
            1
        } else if chord.strum_parts > 0 {
            (0..chord_size)
                .filter(|&i| self.part >= note.start + i as i32 * chord.strum_parts)
                .count()
                .max(1)
        } else {
            chord_size
        };

        // Trim surplus tones first (a smaller chord took over).
        while self.channels[channel_index].active_tones.len() > desired {
            let id = self.channels[channel_index].active_tones.pop().unwrap();
            self.retire_tone(channel_index, id);
        }

        for voice in 0..desired {
            let existing = self.channels[channel_index].active_tones.get(voice).copied();
            let id = match existing {
                Some(id) => id,
                None => {
                    let id = self.pool.new_tone();
                    self.channels[channel_index].active_tones.push(id);
                    id
                }
            };
            let same_note = self
                .pool
                .get(id)
                .note
                .as_ref()
                .map_or(false, |n| n.start == note.start && n.end == note.end);
            if existing.is_some() && !same_note {
                // A new note begins under an existing tone: seamless
                // transitions keep the phases running, others restart the
                // voice through the release queue.
                if seamless {
                    self.pool.get_mut(id).ticks_since_note_start = 0;
                } else {
                    self.retire_tone(channel_index, id);
                    let replacement = self.pool.new_tone();
                    self.channels[channel_index].active_tones[voice] = replacement;
                }
            }

            let id = self.channels[channel_index].active_tones[voice];
            let tone = self.pool.get_mut(id);
            if chord.single_tone {
                tone.pitch_count = chord_size;
                tone.pitches[..chord_size].copy_from_slice(&note.pitches[..chord_size]);
            } else {
                tone.pitch_count = 1;
                tone.pitches[0] = note.pitches[voice.min(chord_size - 1)];
            }
            tone.chord_size = chord_size;
            tone.instrument_index = instrument_index;
            tone.note = Some(ToneNote {
                start: note.start,
                end: note.end,
                pins: note.pins.clone(),
            });
            tone.prev_note = prev;
            tone.next_note = next;
            tone.released = false;
        }
    }

    /// Moves a tone out of the active set into the released queue so it
    /// fades over its transition's release ticks, or frees it outright
    /// when it never became audible.
    fn retire_tone(&mut self, channel_index: usize, id: usize) {
        let tone = self.pool.get_mut(id);
        if tone.fresh {
            // Never rendered; nothing will click.
            self.pool.free_tone(id);
            return;
        }
        tone.released = true;
        tone.ticks_since_released = 0;
        let instrument_index = tone.instrument_index;
        self.channels[channel_index].released_tones[instrument_index].push(id);
    }

    /// Releases every active tone (note ended or playback paused).
    fn release_active_tones(&mut self, channel_index: usize) {
        while let Some(id) = self.channels[channel_index].active_tones.pop() {
            self.retire_tone(channel_index, id);
        }
    }

    /// Creates, updates, or releases the live-input tone for a channel.
    fn update_live_tones(&mut self, channel_index: usize) {
        let wants_live = channel_index == self.live_input_channel
            && !self.live_input_pitches.is_empty()
            && self.seconds_elapsed < self.live_input_deadline;
        if !wants_live {
            while let Some(id) = self.channels[channel_index].live_tones.pop() {
                self.retire_tone(channel_index, id);
            }
            return;
        }

        let instrument_index = self.song.channels[channel_index]
            .pattern_for_bar(self.bar)
            .map(|p| p.instrument)
            .unwrap_or(0)
            .min(self.song.channels[channel_index].instruments.len() - 1);
        let pitch_count = self.live_input_pitches.len().min(MAX_CHORD_SIZE);

        if self.channels[channel_index].live_tones.is_empty() {
            let id = self.pool.new_tone();
            self.channels[channel_index].live_tones.push(id);
        }
        let id = self.channels[channel_index].live_tones[0];
        let tone = self.pool.get_mut(id);
        tone.live_input = true;
        tone.instrument_index = instrument_index;
        tone.pitch_count = pitch_count;
        tone.chord_size = pitch_count;
        for (slot, &pitch) in tone
            .pitches
            .iter_mut()
            .zip(self.live_input_pitches.iter())
        {
            *slot = pitch;
        }
    }

    /// Caps the channel's sounding tones; overflow released tones fade
    /// out fast.
    fn enforce_tone_cap(&mut self, channel_index: usize) {
        let channel = &mut self.channels[channel_index];
        let mut total = channel.active_tones.len() + channel.live_tones.len();
        for queue in channel.released_tones.iter() {
            total += queue.len();
        }
        if total <= MAX_TONES_PER_CHANNEL {
            return;
        }
        let mut excess = total - MAX_TONES_PER_CHANNEL;
        for queue in channel.released_tones.iter() {
            for &id in queue.iter() {
                if excess == 0 {
                    return;
                }
                let tone = self.pool.get_mut(id);
                if !tone.fade_out_fast {
                    tone.fade_out_fast = true;
                    excess -= 1;
                }
            }
        }
    }

    /// Renders the song offline from its start.
    pub fn render(song: Song, seconds: f64, sample_rate: f64) -> (Vec<f32>, Vec<f32>) {
        let mut synth = Synth::with_sample_rate(song, sample_rate);
        synth.play();
        let total = (seconds * sample_rate).ceil() as usize;
        let mut left = vec![0.0f32; total];
        let mut right = vec![0.0f32; total];
        let chunk = 512;
        let mut index = 0;
        while index < total {
            let end = (index + chunk).min(total);
            synth.synthesize(&mut left[index..end], &mut right[index..end]);
            index = end;
        }
        (left, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::{EffectFlags, Instrument, InstrumentKind, Note};

    fn one_note_song(kind: InstrumentKind, pitch: i32, parts: i32) -> Song {
        let mut song = Song::default();
        song.tempo = 120;
        if !kind.is_noise() {
            song.channels[0].instruments[0] = Instrument::new(kind);
            song.channels[0].bars[0] = 1;
            song.channels[0].patterns[0]
                .notes
                .push(Note::new(vec![pitch], 0, parts, 3));
        } else {
            let noise = song.pitch_channel_count;
            song.channels[noise].instruments[0] = Instrument::new(kind);
            song.channels[noise].bars[0] = 1;
            song.channels[noise].patterns[0]
                .notes
                .push(Note::new(vec![pitch], 0, parts, 3));
        }
        song
    }

    #[test]
    fn test_empty_song_renders_exact_zeros() {
        let (left, right) = Synth::render(Song::default(), 2.0, 44100.0);
        assert!(left.iter().all(|&s| s == 0.0));
        assert!(right.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_single_chip_note_is_audible_and_bounded() {
        // A quarter note at 120 BPM is half a second.
        let song = one_note_song(InstrumentKind::Chip, 60, PARTS_PER_BEAT);
        let (left, right) = Synth::render(song, 1.0, 44100.0);
        let peak = left
            .iter()
            .chain(right.iter())
            .fold(0.0f32, |m, &s| m.max(s.abs()));
        assert!(peak > 0.05, "peak {peak}");
        assert!(peak < 0.9, "peak {peak}");
        // The note stops: the last quarter second is effectively silent.
        let tail: f32 = left[33075..].iter().map(|s| s.abs()).sum();
        assert!(tail < 20.0, "note should have ended, tail {tail}");
    }

    #[test]
    fn test_chip_note_fundamental_frequency() {
        let song = one_note_song(InstrumentKind::Chip, 60, PARTS_PER_BEAT * 2);
        let (left, _) = Synth::render(song, 1.0, 44100.0);
        // Autocorrelation peak near the period of middle C (261.63 Hz).
        let segment = &left[4410..26460];
        let expected_period = 44100.0 / 261.6256;
        let mut best_lag = 0;
        let mut best = f32::MIN;
        for lag in 80..260 {
            let score: f32 = segment
                .iter()
                .zip(segment[lag..].iter())
                .take(8192)
                .map(|(a, b)| a * b)
                .sum();
            if score > best {
                best = score;
                best_lag = lag;
            }
        }
        let measured = 44100.0 / best_lag as f32;
        let cents = (measured / 261.6256f32).log2().abs() * 1200.0;
        let lag_error = (expected_period - best_lag as f32).abs();
        assert!(
            cents < 12.0 || lag_error <= 1.0,
            "fundamental off by {cents} cents (lag {best_lag})"
        );
    }

    #[test]
    fn test_released_tones_ring_past_note_end() {
        let mut song = one_note_song(InstrumentKind::Chip, 60, PARTS_PER_BEAT);
        song.channels[0].instruments[0].transition = 6; // medium fade
        let (left, _) = Synth::render(song, 1.5, 44100.0);
        // The note ends at 0.5s; a medium fade rings for many ticks after.
        let after: f32 = left[23000..30000].iter().map(|s| s.abs()).sum();
        assert!(after > 0.1, "release tail expected, got {after}");
    }

    #[test]
    fn test_stop_resets_playhead_and_tones() {
        let song = one_note_song(InstrumentKind::Chip, 60, PARTS_PER_BEAT * 4);
        let mut synth = Synth::new(song);
        synth.play();
        let mut left = vec![0.0f32; 4096];
        let mut right = vec![0.0f32; 4096];
        synth.synthesize(&mut left, &mut right);
        assert!(synth.playhead() > 0.0);
        synth.stop();
        assert_eq!(synth.playhead(), 0.0);
        assert!(!synth.wants_audio());
    }

    #[test]
    fn test_live_input_sounds_without_playback() {
        let song = Song::default();
        let mut synth = Synth::new(song);
        synth.maintain_live_input(&[60, 64], 0);
        assert!(synth.wants_audio());
        let mut left = vec![0.0f32; 8192];
        let mut right = vec![0.0f32; 8192];
        synth.synthesize(&mut left, &mut right);
        let peak = left.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
        assert!(peak > 0.001, "live input should be audible, peak {peak}");
        synth.maintain_live_input(&[], 0);
        for _ in 0..40 {
            synth.synthesize(&mut left, &mut right);
        }
        let peak = left.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
        assert!(peak < 1.0e-5, "live tone should have released, {peak}");
    }

    #[test]
    fn test_loop_region_repeats() {
        let mut song = one_note_song(InstrumentKind::Chip, 60, PARTS_PER_BEAT);
        song.loop_start = 0;
        song.loop_length = 1;
        let mut synth = Synth::new(song);
        synth.play();
        // One bar at 120 BPM with 8 beats is 4 seconds; render 5 and
        // confirm the playhead wrapped back into the loop region.
        let mut left = vec![0.0f32; 44100];
        let mut right = vec![0.0f32; 44100];
        for _ in 0..5 {
            synth.synthesize(&mut left, &mut right);
        }
        assert!(synth.playhead() < 1.0 / synth.song.bar_count as f64 + 1.0e-9);
    }

    #[test]
    fn test_reverb_instrument_deactivates_after_tail() {
        let mut song = one_note_song(InstrumentKind::Chip, 60, PARTS_PER_BEAT / 2);
        song.channels[0].instruments[0].effects = EffectFlags::REVERB;
        song.channels[0].instruments[0].reverb = 4;
        song.loop_length = 4; // keep the note from retriggering
        song.channels[0].bars[1] = 0;
        let mut synth = Synth::new(song);
        synth.play();
        let mut left = vec![0.0f32; 44100];
        let mut right = vec![0.0f32; 44100];
        // Render well past the note, its release, and the reverb tail.
        for _ in 0..6 {
            synth.synthesize(&mut left, &mut right);
        }
        let state = &synth.channels[0].instrument_states[0];
        assert!(!state.awake, "instrument should sleep after the tail");
        assert!(state.delay_lines_are_silent());
    }

    #[test]
    fn test_seamless_transition_does_not_reset_phase() {
        let mut song = Song::default();
        song.tempo = 120;
        song.channels[0].instruments[0].transition = 0; // seamless
        song.channels[0].bars[0] = 1;
        let pattern = &mut song.channels[0].patterns[0];
        pattern.notes.push(Note::new(vec![60], 0, 24, 3));
        pattern.notes.push(Note::new(vec![60], 24, 48, 3));
        let (left, _) = Synth::render(song, 1.2, 44100.0);
        // The boundary sits at 0.5s. A seamless join of identical notes
        // must not produce a click: the maximum sample step near the
        // boundary stays comparable to the steady-state step.
        let boundary = 22050usize;
        let window = &left[boundary - 200..boundary + 200];
        let max_step_boundary = window
            .windows(2)
            .map(|p| (p[1] - p[0]).abs())
            .fold(0.0f32, f32::max);
        let steady = &left[11025..11425];
        let max_step_steady = steady
            .windows(2)
            .map(|p| (p[1] - p[0]).abs())
            .fold(0.0f32, f32::max);
        assert!(
            max_step_boundary <= max_step_steady * 1.5 + 1.0e-4,
            "boundary step {max_step_boundary} vs steady {max_step_steady}"
        );
    }

    #[test]
    fn test_same_seed_renders_identically() {
        let song = one_note_song(InstrumentKind::Guitar, 48, PARTS_PER_BEAT * 2);
        let render = |seed: u64| {
            let mut synth = Synth::with_sample_rate(song.clone(), 44100.0);
            synth.set_seed(seed);
            synth.play();
            let mut left = vec![0.0f32; 22050];
            let mut right = vec![0.0f32; 22050];
            synth.synthesize(&mut left, &mut right);
            left
        };
        assert_eq!(render(123), render(123));
        assert_ne!(render(123), render(456), "pluck jitter should differ");
    }

    #[test]
    fn test_pan_hard_right_in_engine() {
        let mut song = one_note_song(InstrumentKind::Chip, 60, PARTS_PER_BEAT * 4);
        song.channels[0].instruments[0].effects = EffectFlags::PANNING;
        song.channels[0].instruments[0].pan = crate::constants::PAN_MAX;
        let (left, right) = Synth::render(song, 1.0, 44100.0);
        let left_rms: f32 = left.iter().map(|s| s * s).sum::<f32>().sqrt();
        let right_rms: f32 = right.iter().map(|s| s * s).sum::<f32>().sqrt();
        assert!(left_rms < right_rms * 0.1, "{left_rms} vs {right_rms}");
    }
}
