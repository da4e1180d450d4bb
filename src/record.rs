use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use rb::{Producer, RbConsumer, RbProducer, SpscRb, RB};

use crate::{codec::writer::CodecWriter, error::Error, Sample};

// -------------------------------------------------------------------------------------------------

/// Interleaved samples buffered between the render callback and the encode worker.
const RING_SIZE: usize = 65536;
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const METADATA_SUCCESS_MARKER: &str = "<message>Metadata update successful</message>";

// -------------------------------------------------------------------------------------------------

/// Flags shared with the audio-thread handle and the encode worker.
struct RecorderShared {
    running: AtomicBool,
    cancelled: AtomicBool,
    dropped_samples: AtomicU64,
}

// -------------------------------------------------------------------------------------------------

/// Encodes the engine output to MP3 on a worker thread, fed from the render callback through
/// a ring which never blocks the audio side: when the worker falls behind, samples are
/// dropped and counted instead.
pub struct Recorder {
    sample_rate: u32,
    ring: SpscRb<Sample>,
    shared: Arc<RecorderShared>,
    worker: Option<JoinHandle<()>>,
}

impl Recorder {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ring: SpscRb::new(RING_SIZE),
            shared: Arc::new(RecorderShared {
                running: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                dropped_samples: AtomicU64::new(0),
            }),
            worker: None,
        }
    }

    /// Open `url` (file path or ICY mount) and start encoding. No-op when already running.
    pub fn start(&mut self, url: &str, metadata: &HashMap<String, String>) -> Result<(), Error> {
        if self.shared.running.load(Ordering::Relaxed) {
            log::debug!("Recorder already running");
            return Ok(());
        }
        log::info!("Recorder start {}", url);

        let mut writer = CodecWriter::new(self.sample_rate, url, metadata)?;
        let consumer = self.ring.consumer();
        let shared = Arc::clone(&self.shared);
        shared.cancelled.store(false, Ordering::Relaxed);
        shared.running.store(true, Ordering::Release);

        self.worker = Some(
            std::thread::Builder::new()
                .name("recorder".to_string())
                .spawn(move || {
                    log::debug!("Recorder worker started");
                    if let Err(err) = writer.write(&consumer, &shared.cancelled) {
                        log::error!("Recorder error: {}", err);
                    }
                    shared.running.store(false, Ordering::Release);
                    log::debug!("Recorder worker finished");
                })
                .map_err(Error::IoError)?,
        );
        Ok(())
    }

    /// Stop encoding: the worker drains the ring, flushes the encoder and exits.
    pub fn stop(&mut self) {
        if !self.shared.running.load(Ordering::Relaxed) && self.worker.is_none() {
            return;
        }
        log::debug!("Recorder stopping...");
        self.shared.cancelled.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        // drop whatever arrived after the worker drained
        let consumer = self.ring.consumer();
        let mut scratch = [0 as Sample; 1024];
        while let Ok(count) = consumer.read(&mut scratch) {
            if count == 0 {
                break;
            }
        }
        log::info!("Recorder stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    /// Samples lost because the encode worker fell behind the audio thread.
    pub fn dropped_samples(&self) -> u64 {
        self.shared.dropped_samples.load(Ordering::Relaxed)
    }

    /// Build the audio-thread half. The producer side of the ring lives there.
    pub fn handle(&self) -> RecorderHandle {
        RecorderHandle {
            producer: self.ring.producer(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop();
    }
}

// -------------------------------------------------------------------------------------------------

/// Render-callback side of a [`Recorder`]: lock-free, never blocks, drops on overrun.
pub struct RecorderHandle {
    producer: Producer<Sample>,
    shared: Arc<RecorderShared>,
}

impl RecorderHandle {
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    pub fn process(&self, samples: &[Sample]) {
        let written = self.producer.write(samples).unwrap_or(0);
        if written < samples.len() {
            self.shared
                .dropped_samples
                .fetch_add((samples.len() - written) as u64, Ordering::Relaxed);
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// A [`Recorder`] pointed at an ICY mount, with a fixed-interval reconnect loop around the
/// initial connection and an in-band metadata updater.
pub struct StreamOutput {
    inner: Arc<StreamOutputInner>,
}

struct StreamOutputInner {
    recorder: Mutex<Recorder>,
    running: AtomicBool,
    retry_interval: u64,
}

impl StreamOutput {
    pub fn new(sample_rate: u32, retry_interval: u64) -> Self {
        Self {
            inner: Arc::new(StreamOutputInner {
                recorder: Mutex::new(Recorder::new(sample_rate)),
                running: AtomicBool::new(false),
                retry_interval: retry_interval.max(1),
            }),
        }
    }

    /// Try to connect the mount; on failure keep retrying from a detached thread until
    /// stopped.
    pub fn start(&self, url: &str) {
        log::debug!("StreamOutput start {}", url);
        self.inner.running.store(true, Ordering::Relaxed);
        if Self::try_start(&self.inner, url) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let url = url.to_string();
        let _ = std::thread::Builder::new()
            .name("stream-output-retry".to_string())
            .spawn(move || loop {
                if !inner.running.load(Ordering::Relaxed) {
                    return;
                }
                log::warn!(
                    "StreamOutput retrying to start in {} seconds...",
                    inner.retry_interval
                );
                std::thread::sleep(Duration::from_secs(inner.retry_interval));
                if !inner.running.load(Ordering::Relaxed) {
                    return;
                }
                log::warn!("StreamOutput restarting...");
                if Self::try_start(&inner, &url) {
                    return;
                }
            });
    }

    fn try_start(inner: &Arc<StreamOutputInner>, url: &str) -> bool {
        let mut recorder = inner.recorder.lock().unwrap();
        match recorder.start(url, &HashMap::new()) {
            Ok(()) => true,
            Err(err) => {
                log::error!("StreamOutput failed to start: {}", err);
                false
            }
        }
    }

    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::Relaxed) {
            return;
        }
        log::debug!("StreamOutput stop...");
        self.inner.recorder.lock().unwrap().stop();
    }

    pub fn is_running(&self) -> bool {
        self.inner.recorder.lock().unwrap().is_running()
    }

    pub fn handle(&self) -> RecorderHandle {
        self.inner.recorder.lock().unwrap().handle()
    }

    /// Push a now-playing title to the ICY metadata endpoint.
    pub fn update_metadata(&self, metadata_url: &str, song: &str) -> Result<(), Error> {
        log::debug!("StreamOutput updateMetadata {}", song);
        let url = format!(
            "{}&mode=updinfo&song={}",
            metadata_url,
            urlencoding::encode(song)
        );
        let agent = crate::utils::http_agent(HTTP_TIMEOUT);
        let body = agent
            .get(&url)
            .call()
            .map_err(|err| Error::Http(err.to_string()))?
            .body_mut()
            .read_to_string()
            .map_err(|err| Error::Http(err.to_string()))?;
        if !body.contains(METADATA_SUCCESS_MARKER) {
            return Err(Error::Http(format!(
                "metadata update failed with response: {}",
                body
            )));
        }
        log::debug!("StreamOutput updateMetadata success");
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_the_audio_feed_to_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.mp3");

        let mut recorder = Recorder::new(44100);
        let handle = recorder.handle();
        assert!(!handle.is_running());

        recorder.start(path.to_str().unwrap(), &HashMap::new()).unwrap();
        assert!(handle.is_running());

        // feed ~0.5 s of audio in render-sized blocks
        let block = vec![1000 as Sample; 2048];
        for _ in 0..20 {
            handle.process(&block);
            std::thread::sleep(Duration::from_millis(10));
        }
        recorder.stop();
        assert!(!handle.is_running());

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.len() > 500, "{}", bytes.len());
    }

    #[test]
    fn overruns_are_counted_not_blocking() {
        let recorder = Recorder::new(44100);
        let handle = recorder.handle();
        // nobody consumes: the ring fills, everything beyond is dropped
        let block = vec![0 as Sample; 4096];
        let mut written = 0usize;
        while written <= RING_SIZE * 2 {
            handle.process(&block);
            written += block.len();
        }
        let dropped = recorder.dropped_samples();
        assert!(dropped >= (written - RING_SIZE) as u64, "{}", dropped);
    }

    #[test]
    fn recorder_start_is_idempotent_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.mp3");
        let mut recorder = Recorder::new(44100);
        recorder.start(path.to_str().unwrap(), &HashMap::new()).unwrap();
        assert!(recorder.is_running());
        recorder.start("/ignored.mp3", &HashMap::new()).unwrap();
        recorder.stop();
    }

    #[test]
    fn stream_output_keeps_retrying_without_a_server() {
        let output = StreamOutput::new(44100, 1);
        output.start("http://127.0.0.1:9/mount");
        assert!(!output.is_running());
        output.stop();
        // stopping twice is fine
        output.stop();
    }
}
