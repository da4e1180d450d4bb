//! Shared fixtures for the unit tests.

use std::path::Path;

/// Write a stereo 16-bit 440 Hz sine WAV at -6 dBFS with the given length.
pub fn write_test_wav(path: &Path, rate: u32, frames: usize) {
    write_sine_wav(path, rate, frames, 440.0, 0.5);
}

/// Write a stereo 16-bit sine WAV with the given frequency and linear amplitude.
pub fn write_sine_wav(path: &Path, rate: u32, frames: usize, frequency: f32, amplitude: f32) {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for frame in 0..frames {
        let phase = frame as f32 / rate as f32 * frequency * std::f32::consts::TAU;
        let sample = (phase.sin() * amplitude * i16::MAX as f32) as i16;
        writer.write_sample(sample).unwrap();
        writer.write_sample(sample).unwrap();
    }
    writer.finalize().unwrap();
}
