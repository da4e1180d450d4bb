use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Condvar, Mutex,
    },
    time::Duration,
};

use symphonia::core::audio::SampleBuffer;

use crate::{
    buffer::SampleSink,
    error::Error,
    utils::{decoder::AudioDecoder, resampler::StereoResampler},
    Sample,
};

// -------------------------------------------------------------------------------------------------

const CHANNEL_COUNT: usize = 2;
const DEFAULT_MAX_FRAMES: u64 = 8 * 1024;

// -------------------------------------------------------------------------------------------------

/// Pulls a URL (file path or http stream) and delivers interleaved stereo `i16` at the engine
/// rate into a [`SampleSink`].
///
/// Construction performs all fallible work: opening the source, selecting the audio track,
/// probing the duration and setting up the rate converter. `read` then runs the decode loop
/// on the calling thread until the source ends or the reader is cancelled. `cancel` is safe
/// to call from any thread and only returns once the decode loop has left the source.
pub struct CodecReader {
    sample_count: usize,
    duration: f64,
    metadata: HashMap<String, String>,
    decode: Mutex<Option<DecodeParts>>,
    cancelled: AtomicBool,
    busy: Mutex<bool>,
    done: Condvar,
}

struct DecodeParts {
    decoder: AudioDecoder,
    resampler: StereoResampler,
    max_frames: u64,
}

impl CodecReader {
    /// Open `url` for decoding at the given engine rate. `seek` seconds are skipped for
    /// seekable (non-http) sources.
    pub fn new(sample_rate: u32, url: &str, seek: f64) -> Result<Self, Error> {
        log::info!("CodecReader open {}", url);
        let mut decoder = AudioDecoder::new(url)?;

        let remote = url.starts_with("http://") || url.starts_with("https://");
        if !remote && seek > 0.0 {
            log::debug!("CodecReader seek to {:.1}s", seek);
            if let Err(err) = decoder.seek(Duration::from_secs_f64(seek)) {
                log::warn!("CodecReader seek failed: {}", err);
            }
        }

        let spec = decoder.signal_spec();
        let resampler = StereoResampler::new(spec.rate, sample_rate, spec.channels.count())?;
        let max_frames = decoder
            .codec_params()
            .max_frames_per_packet
            .unwrap_or(DEFAULT_MAX_FRAMES);

        let duration = decoder.duration().unwrap_or(0.0);
        let sample_count = if duration > 0.0 {
            (duration * sample_rate as f64 * CHANNEL_COUNT as f64).ceil() as usize + 1
        } else {
            0
        };
        log::debug!("CodecReader estimated sample count: {}", sample_count);

        let metadata = decoder.metadata().clone();
        Ok(Self {
            sample_count,
            duration,
            metadata,
            decode: Mutex::new(Some(DecodeParts {
                decoder,
                resampler,
                max_frames,
            })),
            cancelled: AtomicBool::new(false),
            busy: Mutex::new(false),
            done: Condvar::new(),
        })
    }

    /// Estimated total number of samples (`ceil(duration * rate * 2) + 1`), 0 when unknown.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Source duration in seconds, 0 for live streams.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Tag metadata of the source, keys lower-cased.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Run the decode loop, pushing converted samples into `sink` until the source is
    /// exhausted, the sink refuses more data, or `cancel` was called. One-shot.
    pub fn read(&self, sink: &dyn SampleSink) {
        log::info!("CodecReader read...");
        *self.busy.lock().unwrap() = true;

        let parts = self.decode.lock().unwrap().take();
        if let Some(mut parts) = parts {
            self.run_decode_loop(&mut parts, sink);
        } else {
            log::warn!("CodecReader read called twice");
        }

        *self.busy.lock().unwrap() = false;
        self.done.notify_all();
        log::info!("CodecReader read finished");
    }

    fn run_decode_loop(&self, parts: &mut DecodeParts, sink: &dyn SampleSink) {
        let spec = parts.decoder.signal_spec();
        let mut packet = SampleBuffer::<f32>::new(parts.max_frames, spec);
        let mut converted: Vec<Sample> = Vec::new();
        let mut read_samples = 0usize;

        while !self.cancelled.load(Ordering::Relaxed) {
            if parts.decoder.read_packet(&mut packet).is_none() {
                // end of source; drain what the resampler still holds
                match parts.resampler.flush() {
                    Ok(tail) => {
                        convert_samples(&tail, &mut converted);
                        let _ = push_all(sink, &converted);
                    }
                    Err(err) => log::error!("CodecReader resample error: {}", err),
                }
                break;
            }
            let resampled = match parts.resampler.process(packet.samples()) {
                Ok(resampled) => resampled,
                Err(err) => {
                    log::error!("CodecReader resample error: {}", err);
                    break;
                }
            };
            convert_samples(&resampled, &mut converted);
            read_samples += converted.len();
            if self.sample_count > 0 && read_samples >= self.sample_count {
                log::warn!("CodecReader exceeded estimated sample count");
                break;
            }
            if !push_all(sink, &converted) {
                // sink closed or full
                break;
            }
        }
    }

    /// Request the decode loop to stop and wait until it has released the source.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::Relaxed) {
            return;
        }
        log::debug!("CodecReader cancel...");
        let mut busy = self.busy.lock().unwrap();
        while *busy {
            let (next, _) = self
                .done
                .wait_timeout(busy, Duration::from_millis(100))
                .unwrap();
            busy = next;
        }
        log::debug!("CodecReader cancelled");
    }
}

// -------------------------------------------------------------------------------------------------

fn convert_samples(input: &[f32], output: &mut Vec<Sample>) {
    output.clear();
    output.reserve(input.len());
    for sample in input {
        output.push((sample.clamp(-1.0, 1.0) * Sample::MAX as f32) as Sample);
    }
}

fn push_all(sink: &dyn SampleSink, samples: &[Sample]) -> bool {
    if samples.is_empty() {
        return true;
    }
    let pushed = sink.push(samples);
    pushed == samples.len()
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PlayBuffer;
    use crate::utils::next_multiple;
    use std::sync::Arc;

    #[test]
    fn decodes_a_file_into_a_play_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        crate::testutil::write_test_wav(&path, 44100, 44100);

        let reader = CodecReader::new(44100, path.to_str().unwrap(), 0.0).unwrap();
        assert!(reader.duration() > 0.9 && reader.duration() < 1.1);
        let expected = reader.sample_count();
        assert!(expected >= 44100 * 2);

        let buffer = Arc::new(PlayBuffer::new());
        buffer.resize(next_multiple(expected, 2048), false);
        reader.read(buffer.as_ref());
        assert_eq!(buffer.available(), 44100 * 2);
    }

    #[test]
    fn cancel_before_read_skips_decoding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        crate::testutil::write_test_wav(&path, 44100, 4410);

        let reader = CodecReader::new(44100, path.to_str().unwrap(), 0.0).unwrap();
        reader.cancel();
        let buffer = Arc::new(PlayBuffer::new());
        buffer.resize(65536, false);
        reader.read(buffer.as_ref());
        assert_eq!(buffer.available(), 0);
    }

    #[test]
    fn missing_file_is_a_load_error() {
        let result = CodecReader::new(44100, "/nonexistent/file.mp3", 0.0);
        assert!(matches!(result, Err(Error::LoadOpen(_, _))));
    }

    #[test]
    fn seek_shortens_the_decoded_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        crate::testutil::write_test_wav(&path, 44100, 44100);

        let reader = CodecReader::new(44100, path.to_str().unwrap(), 0.5).unwrap();
        let buffer = Arc::new(PlayBuffer::new());
        buffer.resize(44100 * 4, false);
        reader.read(buffer.as_ref());
        let available = buffer.available();
        assert!(available < 44100 * 2, "{}", available);
        assert!(available > 30000, "{}", available);
    }
}
