//! Signal-processing primitives shared by the synthesizer.
//!
//! - [`filter`]: static biquad coefficient kit and the per-sample
//!   interpolating dynamic biquad used throughout the engine.
//! - [`fft`]: inverse real FFT helpers for building wave tables from
//!   spectra.
//! - [`wave`]: cached chip, noise, spectrum and harmonics wave tables.

pub mod fft;
pub mod filter;
pub mod wave;

pub use filter::{DynamicBiquad, FilterCoefficients};
pub use wave::WaveBank;
