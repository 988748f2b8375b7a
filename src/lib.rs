//! Chiptune song synthesizer.
//!
//! A compact symbolic song description — a base64 URL string or a JSON
//! document — is decoded into a [`Song`] model and rendered to stereo PCM
//! in real time by a [`Synth`]. The engine implements several instrument
//! models (chip waves, 4-operator FM, pulse-width modulation, plucked
//! string, spectral noise, a drum set), per-note envelopes and transitions,
//! a cascaded dynamic filter stack, and a shared per-instrument effects
//! chain (distortion, bitcrusher, filtering, panning, chorus, reverb)
//! feeding a master limiter.
//!
//! # Crate feature flags
//! - `json` (default): JSON song import/export (`codec::json`)
//! - `export-wav` (default): offline rendering to WAV files (`wav`)
//!
//! # Quick start
//! ## Decode a song and render samples
//! ```no_run
//! use chipbox::{Song, Synth};
//! let song = Song::from_url("9n11s0k0l00e00t84a7g07j07i0r1o2T0w1f0c0h0v0q0b4x4h4h4h4").unwrap();
//! let mut synth = Synth::new(song);
//! synth.play();
//! let mut left = vec![0.0f32; 512];
//! let mut right = vec![0.0f32; 512];
//! synth.synthesize(&mut left, &mut right);
//! ```
//!
//! ## Round-trip the URL form
//! ```no_run
//! use chipbox::Song;
//! let song = Song::default();
//! let url = song.to_url();
//! assert_eq!(Song::from_url(&url).unwrap().to_url(), url);
//! ```

// Domain modules
pub mod codec; // Song Format Codec (URL + JSON)
pub mod constants; // Engine Constants & Named Tables
pub mod dsp; // Filters, FFT, Wave Tables
pub mod song; // Song Data Model
pub mod synth; // Synthesis Engine
#[cfg(feature = "export-wav")]
pub mod wav; // WAV Export

/// Error types for song decoding and rendering operations.
#[derive(thiserror::Error, Debug)]
pub enum SongError {
    /// Song data ended in the middle of a record.
    #[error("unexpected end of song data at symbol {0}")]
    UnexpectedEnd(usize),

    /// A character outside the base64 alphabet appeared in the song data.
    #[error("invalid character {0:?} in song data at symbol {1}")]
    InvalidCharacter(char, usize),

    /// The decoder met a tag it does not recognize. Tags have no length
    /// framing, so decoding cannot continue past this point.
    #[error("unknown tag {tag:?} at symbol {position}")]
    UnknownTag {
        /// The unrecognized tag character.
        tag: char,
        /// Symbol offset of the tag in the song data.
        position: usize,
    },

    /// The leading version symbol is not a supported format version.
    #[error("unsupported song format version {0}")]
    UnsupportedVersion(u32),

    /// An embedded bit stream was shorter than its declared length.
    #[error("bit stream ended before its declared length")]
    TruncatedBitStream,

    /// A value that selects a variant (not a clampable number) was out of
    /// range. This indicates corrupt data.
    #[error("{context} value {value} is out of range")]
    OutOfRange {
        /// What was being decoded.
        context: &'static str,
        /// The offending value.
        value: i64,
    },

    /// The JSON song form could not be interpreted.
    #[error("JSON song error: {0}")]
    Json(String),

    /// Error writing an audio file.
    #[error("audio file write error: {0}")]
    AudioFileError(String),
}

/// Result type for song and codec operations.
pub type Result<T> = std::result::Result<T, SongError>;

// Public API exports
pub use song::{Channel, Instrument, InstrumentKind, Note, NotePin, Pattern, Song};
pub use synth::Synth;
