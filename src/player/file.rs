use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;

use crate::{
    buffer::PlayBuffer,
    calendar::PlayItem,
    codec::reader::CodecReader,
    error::Error,
    player::{Player, PlayerBackend, PlayerEvent, VoiceSource},
    utils::next_multiple,
};

// -------------------------------------------------------------------------------------------------

/// Files are decoded up to an hour ahead of their start.
const PRELOAD_TIME: i64 = 3600;
/// Track buffers are sized to the next multiple of this.
const BUFFER_ALIGNMENT: usize = 2048;

// -------------------------------------------------------------------------------------------------

/// Create a player which fully pre-decodes local files into memory.
///
/// `load` allocates a buffer for the whole track and runs the codec reader to completion on
/// the calling (supervisor) thread; playback then simply drains the buffer.
pub fn file_player(name: &str, sample_rate: u32, events: Sender<PlayerEvent>) -> Player {
    Player::new(name, Box::new(FilePlayerBackend::new(sample_rate)), events)
}

pub struct FilePlayerBackend {
    sample_rate: u32,
    buffer: Arc<PlayBuffer>,
    reader: Mutex<Option<Arc<CodecReader>>>,
}

impl FilePlayerBackend {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            buffer: Arc::new(PlayBuffer::new()),
            reader: Mutex::new(None),
        }
    }

    pub fn buffer(&self) -> Arc<PlayBuffer> {
        Arc::clone(&self.buffer)
    }
}

impl PlayerBackend for FilePlayerBackend {
    fn can_play(&self, item: &PlayItem) -> bool {
        item.uri.starts_with('/') || item.uri.starts_with("./")
    }

    fn load(&self, url: &str, seek: f64) -> Result<(), Error> {
        log::info!("FilePlayer load {} position {:.1}", url, seek);

        let previous = self.reader.lock().unwrap().take();
        if let Some(previous) = previous {
            previous.cancel();
        }

        let reader = Arc::new(CodecReader::new(self.sample_rate, url, seek)?);
        let sample_count = reader.sample_count();
        if sample_count == 0 {
            return Err(Error::LoadOpen(
                url.to_string(),
                "source has no known duration".to_string(),
            ));
        }
        self.buffer
            .resize(next_multiple(sample_count, BUFFER_ALIGNMENT), false);
        log::debug!(
            "FilePlayer allocated {:.1} MB",
            self.buffer.memory_size_mb()
        );

        *self.reader.lock().unwrap() = Some(Arc::clone(&reader));
        // the supervisor already is a background thread, so decode synchronously
        reader.read(self.buffer.as_ref());
        *self.reader.lock().unwrap() = None;

        log::debug!("FilePlayer load done {}", url);
        Ok(())
    }

    fn unload(&self) {
        let reader = self.reader.lock().unwrap().take();
        if let Some(reader) = reader {
            reader.cancel();
        }
        self.buffer.close();
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
