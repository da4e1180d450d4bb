use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::Sender;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{
    api::Program,
    calendar::strip_m3u_line,
    dsp::osc::SineOscillator,
    error::Error,
    player::{premix::PremixPlayer, PlayerEvent, Voice},
    utils::unix_now,
    Sample,
};

// -------------------------------------------------------------------------------------------------

/// Emergency tone level relative to full scale.
const SINE_GAIN: f64 = 1.0 / 128.0;
const SINE_BASE_FREQUENCY: f64 = 1000.0;
/// The second oscillator sits a major third above the first.
const SINE_FREQUENCY_RATIO: f64 = 5.0 / 4.0;
/// Minimum pause between attempts to (re)fill an empty library queue.
const LOAD_RETRY_INTERVAL: i64 = 5;
const WORKER_INTERVAL: Duration = Duration::from_millis(500);

// -------------------------------------------------------------------------------------------------

/// Configuration of the fallback library.
#[derive(Clone, Debug)]
pub struct FallbackOptions {
    /// Directory scanned for audio files and `.m3u` playlists.
    pub path: String,
    /// Seconds of audio the premix holds.
    pub buffer_seconds: usize,
    pub cross_fade_seconds: f32,
    pub fade_in_time: f32,
    pub fade_out_time: f32,
    pub shuffle: bool,
    /// Fixed shuffle seed for reproducible rotations; random otherwise.
    pub shuffle_seed: Option<u64>,
    /// Whether to emit the emergency tone when even the library has nothing to play.
    pub sine_synth: bool,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            path: String::new(),
            buffer_seconds: 600,
            cross_fade_seconds: 5.0,
            fade_in_time: 5.0,
            fade_out_time: 5.0,
            shuffle: true,
            shuffle_seed: None,
            sine_synth: true,
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Continuous-playback safety net: a premixed rotation of the local library, activated by the
/// silence detector, with a two-tone sine as the last resort.
///
/// A supervisor thread keeps the premix filled and completes deferred deactivation: `stop`
/// only starts the fade-out, the active flag drops once the fade has run its course.
pub struct Fallback {
    inner: Arc<FallbackInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct FallbackInner {
    options: FallbackOptions,
    premix: PremixPlayer,
    events: Sender<PlayerEvent>,
    running: AtomicBool,
    active: AtomicBool,
    /// Unix second the pending fade-out completes; 0 when none is pending.
    deactivate_at: AtomicI64,
    last_load: AtomicI64,
}

impl Fallback {
    pub fn new(options: FallbackOptions, sample_rate: u32, events: Sender<PlayerEvent>) -> Self {
        let mut program = Program::default();
        program.show_name = "Fallback".to_string();
        let premix = PremixPlayer::new(
            "fallback",
            sample_rate,
            options.buffer_seconds,
            options.cross_fade_seconds,
            options.fade_in_time,
            options.fade_out_time,
            program,
            events.clone(),
        );
        Self {
            inner: Arc::new(FallbackInner {
                options,
                premix,
                events,
                running: AtomicBool::new(false),
                active: AtomicBool::new(false),
                deactivate_at: AtomicI64::new(0),
                last_load: AtomicI64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the library supervisor. Logs and stays inert when the library path is unusable.
    pub fn run(&self) {
        if self.inner.options.path.is_empty() {
            log::error!("Fallback folder not set");
            return;
        }
        if !std::path::Path::new(&self.inner.options.path).exists() {
            log::error!("Fallback folder does not exist");
            return;
        }
        if self.inner.running.swap(true, Ordering::Relaxed) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("fallback".to_string())
            .spawn(move || {
                while inner.running.load(Ordering::Relaxed) {
                    inner.tick();
                    std::thread::sleep(WORKER_INTERVAL);
                }
            })
            .expect("failed to spawn fallback supervisor");
        *self.worker.lock().unwrap() = Some(handle);
        log::debug!("Fallback running");
    }

    pub fn terminate(&self) {
        log::debug!("Fallback terminate...");
        self.inner.running.store(false, Ordering::Relaxed);
        self.inner.active.store(false, Ordering::Relaxed);
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.inner.premix.terminate();
        log::info!("Fallback terminated");
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Relaxed)
    }

    /// Fade the library in. No-op while already active (a pending fade-out is revoked).
    pub fn start(&self) {
        let inner = &self.inner;
        if !inner.running.load(Ordering::Relaxed) {
            return;
        }
        if inner.active.load(Ordering::Relaxed) {
            let revoked = inner.deactivate_at.swap(0, Ordering::Relaxed) != 0;
            // re-raise the level when a revoked (or already completed) fade-out left it low;
            // while the old ramp still runs, the next tick retries
            if (revoked || inner.premix.volume() < 1.0) && !inner.premix.shared().is_fading() {
                log::info!("Fallback restart");
                inner.premix.fade_in();
            }
            return;
        }
        log::info!("Fallback start");
        inner.premix.fade_in();
        inner.active.store(true, Ordering::Relaxed);
        inner.deactivate_at.store(0, Ordering::Relaxed);
        inner.notify_current_track();
    }

    /// Begin fading the library out; the supervisor flips the active flag once the fade
    /// completed. No-op while inactive or already pending.
    pub fn stop(&self) {
        let inner = &self.inner;
        if !inner.active.load(Ordering::Relaxed)
            || inner.deactivate_at.load(Ordering::Relaxed) != 0
        {
            return;
        }
        log::info!("Fallback stop");
        inner.premix.fade_out();
        let done = unix_now() + inner.premix.fade_out_time().ceil() as i64 + 1;
        inner.deactivate_at.store(done, Ordering::Relaxed);
    }

    /// Build the audio-thread half.
    pub fn voice(&self, sample_rate: u32) -> FallbackVoice {
        let mut osc_left = SineOscillator::new(sample_rate);
        let mut osc_right = SineOscillator::new(sample_rate);
        osc_left.set_frequency(SINE_BASE_FREQUENCY);
        osc_right.set_frequency(SINE_BASE_FREQUENCY * SINE_FREQUENCY_RATIO);
        FallbackVoice {
            inner: Arc::clone(&self.inner),
            premix_voice: self.inner.premix.voice(),
            osc_left,
            osc_right,
            temp: vec![0; crate::output::MAX_BLOCK_FRAMES * 2],
        }
    }

    #[cfg(test)]
    fn premix(&self) -> &PremixPlayer {
        &self.inner.premix
    }
}

impl FallbackInner {
    fn tick(&self) {
        // complete a deferred deactivation
        let deactivate_at = self.deactivate_at.load(Ordering::Relaxed);
        if deactivate_at != 0 && unix_now() >= deactivate_at {
            self.deactivate_at.store(0, Ordering::Relaxed);
            self.active.store(false, Ordering::Relaxed);
            log::info!("Fallback inactive");
        }

        // refill the library once the previous rotation has played out
        let now = unix_now();
        if self.premix.num_tracks() == 0
            && self.premix.is_drained()
            && self.last_load.load(Ordering::Relaxed) + LOAD_RETRY_INTERVAL <= now
        {
            self.last_load.store(now, Ordering::Relaxed);
            self.load_library();
        }
    }

    fn notify_current_track(&self) {
        if let Some(item) = self.premix.current_track() {
            let event = PlayerEvent::Started {
                player: "fallback".to_string(),
                item,
            };
            let _ = self.events.send(event);
        }
    }

    fn load_library(&self) {
        log::info!("Fallback loading queue...");
        self.premix.eject();

        let mut paths: Vec<PathBuf> = match std::fs::read_dir(&self.options.path) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
                .map(|entry| entry.path())
                .collect(),
            Err(err) => {
                log::error!("Fallback failed to scan '{}': {}", self.options.path, err);
                return;
            }
        };
        paths.sort();

        if self.options.shuffle {
            let mut rng = match self.options.shuffle_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            paths.shuffle(&mut rng);
        }

        let mut queue_full = false;
        for path in &paths {
            if !self.running.load(Ordering::Relaxed) || queue_full {
                break;
            }
            let url = path.to_string_lossy().to_string();
            if url.ends_with(".m3u") {
                log::debug!("Fallback opening m3u file {}", url);
                match std::fs::read_to_string(path) {
                    Ok(content) => {
                        for line in content.lines() {
                            if !self.running.load(Ordering::Relaxed) {
                                return;
                            }
                            let line = strip_m3u_line(line);
                            if line.is_empty() || line.starts_with('#') {
                                continue;
                            }
                            if !self.push_track(line) {
                                queue_full = true;
                                break;
                            }
                            log::debug!("Fallback added m3u entry {}", line);
                        }
                    }
                    Err(err) => log::error!("Fallback failed to read '{}': {}", url, err),
                }
            } else if !self.push_track(&url) {
                queue_full = true;
            }
        }

        let queued = self.premix.num_tracks();
        if queued > 0 {
            log::info!("Fallback load done ({} tracks)", queued);
        } else {
            log::warn!(
                "Fallback queue empty - reloading in {} sec...",
                LOAD_RETRY_INTERVAL
            );
        }
    }

    /// Returns false once the premix has no more room.
    fn push_track(&self, url: &str) -> bool {
        match self.premix.load(url) {
            Ok(()) => true,
            Err(Error::BufferFull) => false,
            Err(err) => {
                log::error!("Fallback failed to load '{}': {}", url, err);
                true
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Audio-thread half of the fallback: adds the (volume scaled) premix into the output, or the
/// emergency tone when the premix has nothing.
pub struct FallbackVoice {
    inner: Arc<FallbackInner>,
    premix_voice: Voice,
    osc_left: SineOscillator,
    osc_right: SineOscillator,
    temp: Vec<Sample>,
}

impl FallbackVoice {
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Relaxed)
    }

    /// Sum the fallback signal into `output`.
    pub fn process(&mut self, _input: &[Sample], output: &mut [Sample], nframes: usize) {
        let nsamples = (nframes * 2).min(output.len()).min(self.temp.len());
        let delivered = self
            .premix_voice
            .process(&[], &mut self.temp[..nsamples], nframes);
        if delivered > 0 {
            let volume = self.premix_voice.volume();
            for (out, sample) in output[..nsamples].iter_mut().zip(&self.temp[..nsamples]) {
                let scaled = (*sample as f32 * volume) as i32;
                *out = (*out as i32 + scaled)
                    .clamp(Sample::MIN as i32, Sample::MAX as i32) as Sample;
            }
        } else if self.inner.options.sine_synth {
            for frame in 0..nsamples / 2 {
                let left = (self.osc_left.process_f64() * Sample::MAX as f64 * SINE_GAIN) as i32;
                let right =
                    (self.osc_right.process_f64() * Sample::MAX as f64 * SINE_GAIN) as i32;
                let left_idx = frame * 2;
                let right_idx = left_idx + 1;
                output[left_idx] = (output[left_idx] as i32 + left)
                    .clamp(Sample::MIN as i32, Sample::MAX as i32)
                    as Sample;
                output[right_idx] = (output[right_idx] as i32 + right)
                    .clamp(Sample::MIN as i32, Sample::MAX as i32)
                    as Sample;
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn options_for(dir: &std::path::Path) -> FallbackOptions {
        FallbackOptions {
            path: dir.to_string_lossy().to_string(),
            buffer_seconds: 10,
            cross_fade_seconds: 0.5,
            fade_in_time: 0.0,
            fade_out_time: 0.0,
            shuffle: false,
            shuffle_seed: None,
            sine_synth: true,
        }
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        crate::testutil::write_test_wav(&dir.path().join("a.wav"), 44100, 4410);
        let (sender, _receiver) = unbounded();
        let fallback = Fallback::new(options_for(dir.path()), 44100, sender);
        fallback.run();
        assert!(!fallback.is_active());

        fallback.start();
        assert!(fallback.is_active());
        fallback.start();
        assert!(fallback.is_active());

        fallback.stop();
        // zero fade time: the supervisor drops the flag within a couple of ticks
        let mut inactive = false;
        for _ in 0..20 {
            if !fallback.is_active() {
                inactive = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(200));
        }
        assert!(inactive);
        fallback.stop();
        assert!(!fallback.is_active());
        fallback.terminate();
    }

    #[test]
    fn does_not_activate_without_a_library_path() {
        let (sender, _receiver) = unbounded();
        let fallback = Fallback::new(FallbackOptions::default(), 44100, sender);
        fallback.run();
        fallback.start();
        assert!(!fallback.is_active());
        fallback.terminate();
    }

    #[test]
    fn loads_the_library_into_the_premix() {
        let dir = tempfile::tempdir().unwrap();
        crate::testutil::write_test_wav(&dir.path().join("a.wav"), 44100, 44100);
        crate::testutil::write_test_wav(&dir.path().join("b.wav"), 44100, 44100);
        let (sender, _receiver) = unbounded();
        let fallback = Fallback::new(options_for(dir.path()), 44100, sender);
        fallback.run();

        let mut tracks = 0;
        for _ in 0..100 {
            tracks = fallback.premix().num_tracks();
            if tracks == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(tracks, 2);
        fallback.terminate();
    }

    #[test]
    fn empty_premix_emits_the_emergency_tone() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, _receiver) = unbounded();
        let fallback = Fallback::new(options_for(dir.path()), 44100, sender);
        let mut voice = fallback.voice(44100);

        let mut out = vec![0 as Sample; 512];
        voice.process(&[], &mut out, 256);
        let peak = out.iter().map(|s| s.unsigned_abs()).max().unwrap();
        // two sines at 1/128 of full scale
        assert!(peak > 50, "{}", peak);
        assert!(peak < 600, "{}", peak);
    }
}
