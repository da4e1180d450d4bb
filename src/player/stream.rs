use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use crossbeam_channel::Sender;

use crate::{
    buffer::PlayBuffer,
    calendar::PlayItem,
    codec::reader::CodecReader,
    error::Error,
    player::{Player, PlayerBackend, PlayerEvent, PlayerState, VoiceSource},
    utils::page_aligned_samples,
};

// -------------------------------------------------------------------------------------------------

/// Streams cue shortly before their start; buffering ahead of that buys nothing for live
/// sources.
const PRELOAD_TIME: i64 = 10;
/// Ring capacity in seconds of stereo audio.
const RING_SECONDS: usize = 60 * 10;

// -------------------------------------------------------------------------------------------------

/// Create a player which decodes http streams (and, as a catch-all, local files) on the fly
/// into a ten minute ring.
pub fn stream_player(name: &str, sample_rate: u32, events: Sender<PlayerEvent>) -> Player {
    Player::new(name, Box::new(StreamPlayerBackend::new(sample_rate)), events)
}

pub struct StreamPlayerBackend {
    sample_rate: u32,
    buffer: Arc<PlayBuffer>,
    reader: Mutex<Option<Arc<CodecReader>>>,
    sample_count: AtomicU64,
}

impl StreamPlayerBackend {
    pub fn new(sample_rate: u32) -> Self {
        let buffer = Arc::new(PlayBuffer::new());
        // the ring keeps the newest audio when the consumer stalls
        buffer.resize(
            page_aligned_samples(sample_rate as usize * 2 * RING_SECONDS),
            true,
        );
        Self {
            sample_rate,
            buffer,
            reader: Mutex::new(None),
            sample_count: AtomicU64::new(0),
        }
    }

    pub fn buffer(&self) -> Arc<PlayBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Exhausted when idle, or when everything the source announced has been consumed.
    pub fn is_idle(&self, state: PlayerState) -> bool {
        if state == PlayerState::Idle {
            return true;
        }
        let sample_count = self.sample_count.load(Ordering::Relaxed);
        sample_count > 0 && self.buffer.total_read() >= sample_count
    }
}

impl PlayerBackend for StreamPlayerBackend {
    fn can_play(&self, item: &PlayItem) -> bool {
        item.uri.starts_with("http://")
            || item.uri.starts_with("https://")
            || item.uri.starts_with('/')
            || item.uri.starts_with("./")
    }

    fn load(&self, url: &str, seek: f64) -> Result<(), Error> {
        log::info!("StreamPlayer load {} position {:.1}", url, seek);

        let previous = self.reader.lock().unwrap().take();
        if let Some(previous) = previous {
            previous.cancel();
        }
        self.buffer.reset();

        let reader = Arc::new(CodecReader::new(self.sample_rate, url, seek)?);
        self.sample_count
            .store(reader.sample_count() as u64, Ordering::Relaxed);
        *self.reader.lock().unwrap() = Some(Arc::clone(&reader));

        // fill the ring from a detached worker; playback starts as soon as samples arrive
        let buffer = Arc::clone(&self.buffer);
        let sample_rate = self.sample_rate;
        std::thread::Builder::new()
            .name("stream-decode".to_string())
            .spawn(move || {
                // decode at audio priority to prevent under-runs on high CPU usage
                if let Err(err) =
                    audio_thread_priority::promote_current_thread_to_real_time(0, sample_rate)
                {
                    log::warn!("failed to promote stream decoder: {}", err);
                }
                reader.read(buffer.as_ref());
            })
            .map_err(Error::IoError)?;

        Ok(())
    }

    fn unload(&self) {
        let reader = self.reader.lock().unwrap().take();
        if let Some(reader) = reader {
            reader.cancel();
        }
        self.sample_count.store(0, Ordering::Relaxed);
        self.buffer.reset();
    }

    fn preload_time(&self) -> i64 {
        PRELOAD_TIME
    }

    fn voice_source(&self) -> VoiceSource {
        VoiceSource::Buffer(Arc::clone(&self.buffer))
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn routes_urls_and_paths() {
        let backend = StreamPlayerBackend::new(44100);
        assert!(backend.can_play(&PlayItem::new(0, 1, "http://radio/stream.mp3")));
        assert!(backend.can_play(&PlayItem::new(0, 1, "https://radio/stream.mp3")));
        assert!(backend.can_play(&PlayItem::new(0, 1, "/music/a.flac")));
        assert!(!backend.can_play(&PlayItem::new(0, 1, "line://main")));
    }

    #[test]
    fn load_returns_before_the_decode_finishes_and_fills_the_ring() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        crate::testutil::write_test_wav(&path, 44100, 44100);

        let backend = StreamPlayerBackend::new(44100);
        backend.load(path.to_str().unwrap(), 0.0).unwrap();

        // the detached worker fills the ring shortly after
        let mut filled = 0;
        for _ in 0..100 {
            filled = backend.buffer().available();
            if filled >= 44100 * 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(filled, 44100 * 2);

        // everything announced was decoded but not yet consumed
        assert!(!backend.is_idle(PlayerState::Play));
        assert!(backend.is_idle(PlayerState::Idle));
        let mut sink = vec![0; 44100 * 2];
        assert_eq!(backend.buffer().read(&mut sink), 44100 * 2);
        assert_eq!(backend.buffer().total_read(), 44100 * 2);

        backend.unload();
        assert_eq!(backend.buffer().available(), 0);
    }

    #[test]
    fn bad_url_fails_synchronously() {
        let backend = StreamPlayerBackend::new(44100);
        assert!(backend.load("/missing/stream.mp3", 0.0).is_err());
    }
}
