use rubato::{FftFixedIn, Resampler as _};

use crate::error::Error;

// -------------------------------------------------------------------------------------------------

/// Frames per resampler chunk. Power of two keeps the FFT sizes friendly.
const CHUNK_SIZE: usize = 1024;

// -------------------------------------------------------------------------------------------------

/// Converts interleaved source audio of any rate and channel layout into interleaved stereo
/// at the engine rate.
///
/// Input is buffered until a full chunk is available, so `process` may return nothing for small
/// feeds; `flush` pads and drains the remainder at the end of a stream.
pub struct StereoResampler {
    resampler: Option<FftFixedIn<f32>>,
    input_rate: u32,
    output_rate: u32,
    channels: usize,
    pending: Vec<Vec<f32>>,
}

impl StereoResampler {
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self, Error> {
        if channels == 0 {
            return Err(Error::Resample("source has no channels".to_string()));
        }
        let resampler = if input_rate != output_rate {
            Some(
                FftFixedIn::new(
                    input_rate as usize,
                    output_rate as usize,
                    CHUNK_SIZE,
                    2,
                    channels,
                )
                .map_err(|err| Error::Resample(err.to_string()))?,
            )
        } else {
            None
        };
        Ok(Self {
            resampler,
            input_rate,
            output_rate,
            channels,
            pending: vec![Vec::new(); channels],
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Feed interleaved source samples, returning whatever full chunks of converted
    /// interleaved stereo output they produced.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>, Error> {
        if self.resampler.is_none() {
            // rate matches, only the channel layout may need mapping
            return Ok(map_to_stereo(input, self.channels));
        }
        self.append_deinterleaved(input);
        self.drain_chunks(false)
    }

    /// Drain buffered samples at the end of a stream, padding the last chunk with silence.
    pub fn flush(&mut self) -> Result<Vec<f32>, Error> {
        if self.resampler.is_none() {
            return Ok(Vec::new());
        }
        self.drain_chunks(true)
    }

    fn append_deinterleaved(&mut self, input: &[f32]) {
        for frame in input.chunks_exact(self.channels) {
            for (channel, sample) in frame.iter().enumerate() {
                self.pending[channel].push(*sample);
            }
        }
    }

    fn drain_chunks(&mut self, pad_tail: bool) -> Result<Vec<f32>, Error> {
        let resampler = match self.resampler.as_mut() {
            Some(resampler) => resampler,
            None => return Ok(Vec::new()),
        };
        if pad_tail && !self.pending[0].is_empty() {
            let missing = CHUNK_SIZE - (self.pending[0].len() % CHUNK_SIZE);
            if missing != CHUNK_SIZE {
                for channel in self.pending.iter_mut() {
                    channel.resize(channel.len() + missing, 0.0);
                }
            }
        }

        let mut output = Vec::new();
        while self.pending[0].len() >= CHUNK_SIZE {
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|channel| channel.drain(..CHUNK_SIZE).collect())
                .collect();
            let resampled = resampler
                .process(&chunk, None)
                .map_err(|err| Error::Resample(err.to_string()))?;
            append_interleaved_stereo(&resampled, &mut output);
        }
        Ok(output)
    }
}

// -------------------------------------------------------------------------------------------------

/// Interleave planar channel data as stereo: mono is duplicated, anything above two channels
/// is reduced to its front pair.
fn append_interleaved_stereo(planes: &[Vec<f32>], output: &mut Vec<f32>) {
    if planes.is_empty() {
        return;
    }
    let frames = planes[0].len();
    output.reserve(frames * 2);
    if planes.len() == 1 {
        for frame in 0..frames {
            output.push(planes[0][frame]);
            output.push(planes[0][frame]);
        }
    } else {
        for frame in 0..frames {
            output.push(planes[0][frame]);
            output.push(planes[1][frame]);
        }
    }
}

fn map_to_stereo(interleaved: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        2 => interleaved.to_vec(),
        1 => {
            let mut output = Vec::with_capacity(interleaved.len() * 2);
            for sample in interleaved {
                output.push(*sample);
                output.push(*sample);
            }
            output
        }
        _ => {
            let mut output = Vec::with_capacity(interleaved.len() / channels * 2);
            for frame in interleaved.chunks_exact(channels) {
                output.push(frame[0]);
                output.push(frame[1]);
            }
            output
        }
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_keeps_stereo() {
        let mut resampler = StereoResampler::new(44100, 44100, 2).unwrap();
        let input = vec![0.1, -0.1, 0.2, -0.2];
        assert_eq!(resampler.process(&input).unwrap(), input);
        assert!(resampler.flush().unwrap().is_empty());
    }

    #[test]
    fn passthrough_duplicates_mono() {
        let mut resampler = StereoResampler::new(44100, 44100, 1).unwrap();
        let output = resampler.process(&[0.5, -0.5]).unwrap();
        assert_eq!(output, vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn passthrough_downmixes_to_front_pair() {
        let mut resampler = StereoResampler::new(44100, 44100, 4).unwrap();
        let output = resampler.process(&[0.1, 0.2, 0.9, 0.9, 0.3, 0.4, 0.9, 0.9]).unwrap();
        assert_eq!(output, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn resamples_rate_roughly_proportionally() {
        let mut resampler = StereoResampler::new(48000, 44100, 2).unwrap();
        let input = vec![0.0f32; 48000 * 2];
        let mut produced = resampler.process(&input).unwrap().len();
        produced += resampler.flush().unwrap().len();
        let expected = 44100 * 2;
        // FFT resamplers delay by a chunk or two; accept a coarse bound
        assert!(produced as i64 >= expected as i64 - (CHUNK_SIZE * 2 * 4) as i64);
        assert!(produced as i64 <= expected as i64 + (CHUNK_SIZE * 2 * 4) as i64);
    }
}
