//! Song format codec.
//!
//! Serialization support for the compact URL song form and the JSON form:
//! - `bits`: base64 alphabet, bit-field reader/writer, long-tail integers
//! - `url`: the versioned tag-stream decoder and encoder
//! - `legacy`: translators for pre-version-9 settings
//! - `json`: JSON import/export (feature `json`)

pub mod bits;
#[cfg(feature = "json")]
pub mod json;
pub mod legacy;
pub mod url;

pub use bits::{BitReader, BitWriter};
