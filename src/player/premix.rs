use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::Sender;

use crate::{
    api::Program,
    buffer::PremixBuffer,
    calendar::PlayItem,
    codec::reader::CodecReader,
    error::Error,
    player::{Fader, PlayerEvent, PlayerShared, PlayerState, Voice, VoiceSource},
    utils::page_aligned_samples,
};

// -------------------------------------------------------------------------------------------------

const MONITOR_INTERVAL: Duration = Duration::from_millis(100);

// -------------------------------------------------------------------------------------------------

/// Concatenates many tracks into one continuous buffer, baking equal-power cross-fades at the
/// joins ahead of time.
///
/// Each loaded track leaves a position marker; a monitor thread watches the consumer pass
/// those markers and publishes `Started` events, which is how a premix emits program-change
/// information even though it renders as one continuous signal.
pub struct PremixPlayer {
    shared: Arc<PlayerShared>,
    buffer: Arc<PremixBuffer>,
    fader: Fader,
    sample_rate: u32,
    xfade_samples: usize,
    fade_in_time: f32,
    fade_out_time: f32,
    track_program: Program,
    reader: Mutex<Option<Arc<CodecReader>>>,
    markers: Arc<Mutex<VecDeque<(usize, PlayItem)>>>,
    current: Arc<Mutex<Option<PlayItem>>>,
    running: Arc<AtomicBool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl PremixPlayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        sample_rate: u32,
        buffer_seconds: usize,
        cross_fade_seconds: f32,
        fade_in_time: f32,
        fade_out_time: f32,
        track_program: Program,
        events: Sender<PlayerEvent>,
    ) -> Self {
        let capacity = page_aligned_samples(sample_rate as usize * 2 * buffer_seconds);
        let buffer = Arc::new(PremixBuffer::new(capacity));
        log::debug!(
            "PremixPlayer {} allocated {:.1} MB",
            name,
            buffer.memory_size_mb()
        );
        let shared = PlayerShared::new(name);
        let markers: Arc<Mutex<VecDeque<(usize, PlayItem)>>> =
            Arc::new(Mutex::new(VecDeque::new()));
        let current = Arc::new(Mutex::new(None));
        let running = Arc::new(AtomicBool::new(true));

        let monitor = {
            let buffer = Arc::clone(&buffer);
            let markers = Arc::clone(&markers);
            let current = Arc::clone(&current);
            let running = Arc::clone(&running);
            let name = name.to_string();
            std::thread::Builder::new()
                .name(format!("premix-{}", name))
                .spawn(move || {
                    while running.load(Ordering::Relaxed) {
                        let passed = {
                            let mut markers = markers.lock().unwrap();
                            let due = matches!(
                                markers.front(),
                                Some((position, _)) if *position < buffer.read_position()
                            );
                            if due {
                                markers.pop_front()
                            } else {
                                None
                            }
                        };
                        if let Some((position, item)) = passed {
                            log::info!("{} passed track marker {}", name, position);
                            *current.lock().unwrap() = Some(item.clone());
                            let event = PlayerEvent::Started {
                                player: name.clone(),
                                item,
                            };
                            if events.send(event).is_err() {
                                log::warn!("{} has no event consumer", name);
                            }
                        } else {
                            std::thread::sleep(MONITOR_INTERVAL);
                        }
                    }
                })
                .expect("failed to spawn premix monitor")
        };

        Self {
            fader: Fader::new(Arc::clone(&shared)),
            shared,
            buffer,
            sample_rate,
            xfade_samples: (sample_rate as f32 * 2.0 * cross_fade_seconds) as usize,
            fade_in_time,
            fade_out_time,
            track_program,
            reader: Mutex::new(None),
            markers,
            current,
            running,
            monitor: Mutex::new(Some(monitor)),
        }
    }

    pub fn buffer(&self) -> Arc<PremixBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn shared(&self) -> Arc<PlayerShared> {
        Arc::clone(&self.shared)
    }

    /// Number of track markers the consumer has not passed yet.
    pub fn num_tracks(&self) -> usize {
        self.markers.lock().unwrap().len()
    }

    /// True once everything premixed has been played out.
    pub fn is_drained(&self) -> bool {
        self.buffer.available() == 0
    }

    pub fn current_track(&self) -> Option<PlayItem> {
        self.current.lock().unwrap().clone()
    }

    pub fn fade_out_time(&self) -> f32 {
        self.fade_out_time
    }

    /// Append a track. Fails with [`Error::BufferFull`] when the premix has no room left,
    /// which merely means the queue is complete.
    pub fn load(&self, url: &str) -> Result<(), Error> {
        log::info!("PremixPlayer load {}", url);

        let previous = self.reader.lock().unwrap().take();
        if let Some(previous) = previous {
            previous.cancel();
        }

        let reader = Arc::new(CodecReader::new(self.sample_rate, url, 0.0)?);
        let write_pos = self.buffer.write_position();
        if write_pos + reader.sample_count() >= self.buffer.capacity() {
            log::debug!("track duration exceeds premix capacity");
            return Err(Error::BufferFull);
        }

        // overlap with the previous track once there is enough of it to fade over
        if write_pos >= self.xfade_samples {
            self.buffer
                .set_cross_fade_zone(write_pos - self.xfade_samples, write_pos + self.xfade_samples);
        }

        *self.reader.lock().unwrap() = Some(Arc::clone(&reader));
        reader.read(self.buffer.as_ref());
        *self.reader.lock().unwrap() = None;

        let mut item = PlayItem::new(0, 0, url);
        item.program = self.track_program.clone();
        item.metadata = reader.metadata().clone();
        self.markers
            .lock()
            .unwrap()
            .push_back((write_pos + 1, item));

        log::debug!("PremixPlayer load done {}", url);
        Ok(())
    }

    /// Discard all premixed content and pending markers.
    pub fn eject(&self) {
        self.buffer.eject();
        self.markers.lock().unwrap().clear();
        *self.current.lock().unwrap() = None;
    }

    pub fn fade_in(&self) {
        self.shared.set_state(PlayerState::Play);
        self.fader.fade_in(self.fade_in_time);
    }

    pub fn fade_out(&self) {
        self.fader.fade_out(self.fade_out_time);
    }

    pub fn volume(&self) -> f32 {
        self.shared.volume()
    }

    pub fn voice(&self) -> Voice {
        Voice::new(self.shared(), VoiceSource::Premix(self.buffer()))
    }

    pub fn stop(&self) {
        let reader = self.reader.lock().unwrap().take();
        if let Some(reader) = reader {
            reader.cancel();
        }
        self.fader.join();
        self.shared.set_state(PlayerState::Idle);
    }

    pub fn terminate(&self) {
        self.running.store(false, Ordering::Relaxed);
        let handle = self.monitor.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.stop();
    }
}

impl Drop for PremixPlayer {
    fn drop(&mut self) {
        self.terminate();
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn premix_with_seconds(seconds: usize) -> (PremixPlayer, crossbeam_channel::Receiver<PlayerEvent>) {
        let (sender, receiver) = unbounded();
        let mut program = Program::default();
        program.show_name = "Fallback".to_string();
        let player = PremixPlayer::new("premix", 44100, seconds, 5.0, 1.0, 0.5, program, sender);
        (player, receiver)
    }

    #[test]
    fn appends_tracks_and_counts_markers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        crate::testutil::write_test_wav(&path, 44100, 44100);

        let (player, _receiver) = premix_with_seconds(30);
        player.load(path.to_str().unwrap()).unwrap();
        player.load(path.to_str().unwrap()).unwrap();
        assert_eq!(player.num_tracks(), 2);
        assert!(!player.is_drained());
    }

    #[test]
    fn overflowing_track_reports_buffer_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        // two seconds of audio into a one second premix
        crate::testutil::write_test_wav(&path, 44100, 88200);

        let (player, _receiver) = premix_with_seconds(1);
        let result = player.load(path.to_str().unwrap());
        assert!(matches!(result, Err(Error::BufferFull)));
        assert_eq!(player.num_tracks(), 0);
    }

    #[test]
    fn consuming_past_a_marker_fires_a_started_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        crate::testutil::write_test_wav(&path, 44100, 4410);

        let (player, receiver) = premix_with_seconds(10);
        player.load(path.to_str().unwrap()).unwrap();

        let mut sink = vec![0; 1024];
        assert_eq!(player.buffer().read(&mut sink), 1024);

        match receiver.recv_timeout(Duration::from_secs(2)).unwrap() {
            PlayerEvent::Started { player: name, item } => {
                assert_eq!(name, "premix");
                assert_eq!(item.program.show_name, "Fallback");
                assert!(item.uri.ends_with("tone.wav"));
            }
        }
        assert_eq!(player.num_tracks(), 0);
        assert!(player.current_track().unwrap().uri.ends_with("tone.wav"));
    }

    #[test]
    fn second_track_is_cross_faded_over_the_first() {
        let dir = tempfile::tempdir().unwrap();
        let quiet = dir.path().join("quiet.wav");
        let loud = dir.path().join("loud.wav");
        // 12 s each so the 5 s cross-fade window is well inside the first track
        crate::testutil::write_sine_wav(&quiet, 44100, 44100 * 12, 440.0, 0.25);
        crate::testutil::write_sine_wav(&loud, 44100, 44100 * 12, 880.0, 0.25);

        let (player, _receiver) = premix_with_seconds(30);
        player.load(quiet.to_str().unwrap()).unwrap();
        let first_end = player.buffer().write_position();
        player.load(loud.to_str().unwrap()).unwrap();

        // content length: two tracks minus the overlapped cross-fade region
        let overlap = (44100.0 * 2.0 * 5.0) as usize;
        let expected = first_end * 2 - overlap;
        let actual = player.buffer().write_position();
        let tolerance = 44100 / 10;
        assert!(
            (actual as i64 - expected as i64).unsigned_abs() as usize <= tolerance,
            "wrote {} expected about {}",
            actual,
            expected
        );
    }

    #[test]
    fn eject_clears_markers_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        crate::testutil::write_test_wav(&path, 44100, 4410);

        let (player, _receiver) = premix_with_seconds(10);
        player.load(path.to_str().unwrap()).unwrap();
        player.eject();
        assert_eq!(player.num_tracks(), 0);
        assert!(player.is_drained());
        assert_eq!(player.buffer().write_position(), 0);
    }
}
