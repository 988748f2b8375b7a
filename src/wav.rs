//! Offline rendering to WAV files.

use std::path::Path;

use crate::song::Song;
use crate::synth::Synth;
use crate::{Result, SongError};

/// Renders `seconds` of a song from its start and writes a 16-bit stereo
/// WAV file.
pub fn render_to_wav<P: AsRef<Path>>(
    song: Song,
    seconds: f64,
    sample_rate: u32,
    path: P,
) -> Result<()> {
    let (left, right) = Synth::render(song, seconds, sample_rate as f64);
    write_wav(&left, &right, sample_rate, path)
}

/// Writes two equal-length sample channels as a 16-bit stereo WAV file.
pub fn write_wav<P: AsRef<Path>>(
    left: &[f32],
    right: &[f32],
    sample_rate: u32,
    path: P,
) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| SongError::AudioFileError(e.to_string()))?;
    for (&l, &r) in left.iter().zip(right.iter()) {
        let scale = i16::MAX as f32;
        writer
            .write_sample((l.clamp(-1.0, 1.0) * scale) as i16)
            .and_then(|_| writer.write_sample((r.clamp(-1.0, 1.0) * scale) as i16))
            .map_err(|e| SongError::AudioFileError(e.to_string()))?;
    }
    writer
        .finalize()
        .map_err(|e| SongError::AudioFileError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_playable_wav() {
        let dir = std::env::temp_dir().join("chipbox_wav_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("default.wav");
        render_to_wav(Song::default(), 0.1, 44100, &path).unwrap();
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 44100);
        assert_eq!(reader.len(), 4410 * 2);
        std::fs::remove_file(&path).ok();
    }
}
