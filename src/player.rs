pub mod file;
pub mod line;
pub mod premix;
pub mod stream;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::Sender;

use crate::{
    buffer::{PlayBuffer, PremixBuffer},
    calendar::PlayItem,
    dsp::rms::Rms,
    error::Error,
    utils::{unix_now, AtomicF32},
    Sample,
};

// -------------------------------------------------------------------------------------------------

/// Supervisor tick interval; also bounds how precisely state transitions hit their second.
const TICK_INTERVAL: Duration = Duration::from_millis(100);
/// Volume steps per second while fading.
const FADE_STEPS_PER_SECOND: f32 = 100.0;

// -------------------------------------------------------------------------------------------------

/// Per-item lifecycle of a player.
///
/// The only legal paths are
/// `IDLE -> WAIT -> LOAD -> CUED -> PLAY` (with `LOAD -> FAIL` on errors) and
/// `any -> IDLE` through `stop`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PlayerState {
    Idle = 0,
    Wait = 1,
    Load = 2,
    Cued = 3,
    Play = 4,
    Fail = 5,
}

impl PlayerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Wait,
            2 => Self::Load,
            3 => Self::Cued,
            4 => Self::Play,
            5 => Self::Fail,
            _ => Self::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Wait => "WAIT",
            Self::Load => "LOAD",
            Self::Cued => "CUE ",
            Self::Play => "PLAY",
            Self::Fail => "FAIL",
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Events players publish towards the engine. Drained from the engine worker tick, never on
/// the audio thread.
#[derive(Clone, Debug)]
pub enum PlayerEvent {
    /// A scheduled item (or premixed track) went on air.
    Started { player: String, item: PlayItem },
}

// -------------------------------------------------------------------------------------------------

/// State record shared between a player's control half, its supervisor thread and its voice
/// on the audio thread. Everything the audio thread touches is atomic.
pub struct PlayerShared {
    pub name: String,
    state: AtomicU8,
    volume: AtomicF32,
    is_fading: AtomicBool,
    is_loaded: AtomicBool,
    rms_db: AtomicF32,
    item: Mutex<Option<PlayItem>>,
}

impl PlayerShared {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: AtomicU8::new(PlayerState::Idle as u8),
            volume: AtomicF32::new(0.0),
            is_fading: AtomicBool::new(false),
            is_loaded: AtomicBool::new(false),
            rms_db: AtomicF32::new(f32::NEG_INFINITY),
            item: Mutex::new(None),
        })
    }

    pub fn state(&self) -> PlayerState {
        PlayerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: PlayerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn volume(&self) -> f32 {
        self.volume.load(Ordering::Relaxed)
    }

    /// Set the playback volume, optionally mapped through the x² fade taper.
    pub fn set_volume(&self, volume: f32, exponential: bool) {
        let clamped = volume.clamp(0.0, 1.0);
        let value = if exponential { clamped * clamped } else { clamped };
        self.volume.store(value, Ordering::Relaxed);
    }

    pub fn is_fading(&self) -> bool {
        self.is_fading.load(Ordering::Relaxed)
    }

    pub fn is_loaded(&self) -> bool {
        self.is_loaded.load(Ordering::Relaxed)
    }

    pub fn rms_db(&self) -> f32 {
        self.rms_db.load(Ordering::Relaxed)
    }

    pub fn set_rms_db(&self, value: f32) {
        self.rms_db.store(value, Ordering::Relaxed);
    }

    pub fn item(&self) -> Option<PlayItem> {
        self.item.lock().unwrap().clone()
    }

    fn set_item(&self, item: PlayItem) {
        *self.item.lock().unwrap() = Some(item);
    }

    fn clear_item(&self) {
        *self.item.lock().unwrap() = None;
    }
}

// -------------------------------------------------------------------------------------------------

/// Runs volume ramps on a joinable background thread: 100 steps per second through the x²
/// taper. Only one fade can be active; further requests are ignored until it completed.
pub struct Fader {
    shared: Arc<PlayerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Fader {
    pub fn new(shared: Arc<PlayerShared>) -> Self {
        Self {
            shared,
            thread: Mutex::new(None),
        }
    }

    pub fn fade_in(&self, duration: f32) {
        self.fade(true, duration);
    }

    pub fn fade_out(&self, duration: f32) {
        self.fade(false, duration);
    }

    fn fade(&self, increase: bool, duration: f32) {
        if self.shared.is_fading.swap(true, Ordering::Relaxed) {
            log::error!("{} is already fading", self.shared.name);
            return;
        }
        // collect a previously finished fade thread
        let previous = self.thread.lock().unwrap().take();
        if let Some(previous) = previous {
            let _ = previous.join();
        }
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::spawn(move || {
            let steps = (duration * FADE_STEPS_PER_SECOND) as i32;
            if steps > 0 {
                let mut volume = if increase { 0.0f32 } else { 1.0f32 };
                let increment = 1.0 / steps as f32 * if increase { 1.0 } else { -1.0 };
                for _ in 0..steps {
                    shared.set_volume(volume, true);
                    std::thread::sleep(Duration::from_millis(10));
                    volume += increment;
                }
            }
            shared.set_volume(if increase { 1.0 } else { 0.0 }, false);
            shared.is_fading.store(false, Ordering::Relaxed);
        });
        *self.thread.lock().unwrap() = Some(handle);
    }

    /// Wait for an active fade to run its course.
    pub fn join(&self) {
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Where a voice pulls its samples from.
pub enum VoiceSource {
    Buffer(Arc<PlayBuffer>),
    Premix(Arc<PremixBuffer>),
    /// Hardware input pass-through.
    Line,
}

/// The audio-thread half of a player: owned by the render callback, reads the buffer,
/// publishes the block level. Lock-free throughout.
pub struct Voice {
    shared: Arc<PlayerShared>,
    source: VoiceSource,
    rms: Rms,
}

impl Voice {
    pub fn new(shared: Arc<PlayerShared>, source: VoiceSource) -> Self {
        Self {
            shared,
            source,
            rms: Rms::new(1),
        }
    }

    /// Whether the mix bus should run this voice: playing, or still ramping a fade.
    pub fn is_active(&self) -> bool {
        self.shared.state() == PlayerState::Play || self.shared.is_fading()
    }

    pub fn volume(&self) -> f32 {
        self.shared.volume()
    }

    /// Fill `output` with the next block. Returns the samples actually delivered; on an
    /// underrun the block is zeroed and 0 is returned.
    pub fn process(&mut self, input: &[Sample], output: &mut [Sample], nframes: usize) -> usize {
        let nsamples = (nframes * 2).min(output.len());
        let block = &mut output[..nsamples];
        let delivered = match &self.source {
            VoiceSource::Line => {
                let available = input.len().min(nsamples);
                block[..available].copy_from_slice(&input[..available]);
                block[available..].fill(0);
                available
            }
            VoiceSource::Buffer(buffer) => {
                let read = buffer.read(block);
                if read == 0 {
                    block.fill(0);
                }
                read
            }
            VoiceSource::Premix(buffer) => {
                let read = buffer.read(block);
                if read == 0 {
                    block.fill(0);
                }
                read
            }
        };
        let level = self.rms.process(block);
        self.shared.set_rms_db(level);
        delivered
    }
}

// -------------------------------------------------------------------------------------------------

/// The variant-specific part of a player: URI routing, the actual loading strategy and the
/// buffer its voice will consume.
pub trait PlayerBackend: Send + Sync + 'static {
    fn can_play(&self, item: &PlayItem) -> bool;
    /// Prepare `url` for playback. File-backed variants decode the entire track before
    /// returning; streaming variants return once their decode worker runs.
    fn load(&self, url: &str, seek: f64) -> Result<(), Error>;
    /// Cancel any in-flight decode and drop buffered audio. Must be idempotent.
    fn unload(&self);
    /// How many seconds before `start` this variant wants to begin loading.
    fn preload_time(&self) -> i64;
    fn voice_source(&self) -> VoiceSource;
}

// -------------------------------------------------------------------------------------------------

/// A scheduled playback slot: one item at a time, driven by its own supervisor thread.
///
/// The supervisor performs all arbitrary-latency work (loading, i.e. codec and network I/O)
/// and drives the timed transitions; the engine only ever calls the cheap control methods.
pub struct Player {
    inner: Arc<PlayerInner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

struct PlayerInner {
    shared: Arc<PlayerShared>,
    backend: Box<dyn PlayerBackend>,
    fader: Fader,
    events: Sender<PlayerEvent>,
    running: AtomicBool,
}

impl Player {
    pub fn new(name: &str, backend: Box<dyn PlayerBackend>, events: Sender<PlayerEvent>) -> Self {
        let shared = PlayerShared::new(name);
        Self {
            inner: Arc::new(PlayerInner {
                fader: Fader::new(Arc::clone(&shared)),
                shared,
                backend,
                events,
                running: AtomicBool::new(false),
            }),
            supervisor: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.shared.name
    }

    pub fn shared(&self) -> Arc<PlayerShared> {
        Arc::clone(&self.inner.shared)
    }

    pub fn state(&self) -> PlayerState {
        self.inner.shared.state()
    }

    pub fn can_play(&self, item: &PlayItem) -> bool {
        self.inner.backend.can_play(item)
    }

    /// Build the audio-thread half. Called once while the engine assembles its mix bus.
    pub fn voice(&self) -> Voice {
        Voice::new(self.shared(), self.inner.backend.voice_source())
    }

    /// Latch `item` and enter WAIT; the supervisor takes it from there.
    pub fn schedule(&self, item: PlayItem) {
        log::info!("{} scheduled '{}'", self.name(), item.uri);
        self.inner.shared.set_item(item);
        self.inner.shared.set_state(PlayerState::Wait);
    }

    /// Start the supervisor thread.
    pub fn run(&self) {
        if self.inner.running.swap(true, Ordering::Relaxed) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let name = format!("player-{}", self.name());
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                while inner.running.load(Ordering::Relaxed) {
                    inner.tick();
                    std::thread::sleep(TICK_INTERVAL);
                }
            })
            .expect("failed to spawn player supervisor");
        *self.supervisor.lock().unwrap() = Some(handle);
    }

    /// Stop playback and the supervisor thread.
    pub fn terminate(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        let handle = self.supervisor.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.inner.stop();
    }

    /// Abort the current item and return to IDLE. Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }
}

impl PlayerInner {
    fn tick(&self) {
        match self.shared.state() {
            PlayerState::Wait => {
                if self.needs_load() {
                    self.try_load();
                }
            }
            PlayerState::Cued | PlayerState::Play => self.update(),
            _ => {}
        }
    }

    fn needs_load(&self) -> bool {
        if self.shared.is_loaded() {
            return false;
        }
        match self.shared.item() {
            Some(item) => item.is_in_schedule_time(unix_now(), self.backend.preload_time()),
            None => false,
        }
    }

    fn try_load(&self) {
        let item = match self.shared.item() {
            Some(item) => item,
            None => return,
        };
        self.shared.set_state(PlayerState::Load);
        let seek = (unix_now() - item.start).max(0) as f64;
        match self.backend.load(&item.uri, seek) {
            Ok(()) => {
                self.shared.set_state(PlayerState::Cued);
                self.shared.is_loaded.store(true, Ordering::Relaxed);
                log::info!("{} cued '{}'", self.shared.name, item.uri);
            }
            Err(err) => {
                self.shared.set_state(PlayerState::Fail);
                log::error!("{} failed to load '{}': {}", self.shared.name, item.uri, err);
            }
        }
    }

    fn update(&self) {
        let item = match self.shared.item() {
            Some(item) => item,
            None => return,
        };
        let now = unix_now();
        let state = self.shared.state();
        let fade_out_begin = item.end - item.fade_out_time.ceil() as i64;

        if now >= item.start && now <= item.end && state == PlayerState::Cued {
            log::info!("{} PLAY", self.shared.name);
            self.shared.set_state(PlayerState::Play);
            log::info!("{} FADE IN", self.shared.name);
            self.fader.fade_in(item.fade_in_time);
            let event = PlayerEvent::Started {
                player: self.shared.name.clone(),
                item,
            };
            if self.events.send(event).is_err() {
                log::warn!("{} has no event consumer", self.shared.name);
            }
        } else if now >= fade_out_begin
            && now < item.end
            && state == PlayerState::Play
            && !self.shared.is_fading()
        {
            log::info!("{} FADE OUT", self.shared.name);
            self.fader.fade_out(item.fade_out_time);
        } else if now >= item.end && state != PlayerState::Idle {
            log::info!("{} STOP", self.shared.name);
            self.stop();
        }
    }

    fn stop(&self) {
        if self.shared.state() == PlayerState::Idle && !self.shared.is_loaded() {
            return;
        }
        self.shared.set_state(PlayerState::Idle);
        self.backend.unload();
        self.fader.join();
        self.shared.is_loaded.store(false, Ordering::Relaxed);
        self.shared.set_volume(0.0, false);
        self.shared.clear_item();
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    struct NullBackend {
        buffer: Arc<PlayBuffer>,
        fail: bool,
    }

    impl NullBackend {
        fn new(fail: bool) -> Self {
            let buffer = Arc::new(PlayBuffer::new());
            buffer.resize(1024, false);
            Self { buffer, fail }
        }
    }

    impl PlayerBackend for NullBackend {
        fn can_play(&self, item: &PlayItem) -> bool {
            item.uri.starts_with("null://")
        }
        fn load(&self, url: &str, _seek: f64) -> Result<(), Error> {
            if self.fail {
                Err(Error::LoadOpen(url.to_string(), "nope".to_string()))
            } else {
                Ok(())
            }
        }
        fn unload(&self) {
            self.buffer.reset();
        }
        fn preload_time(&self) -> i64 {
            30
        }
        fn voice_source(&self) -> VoiceSource {
            VoiceSource::Buffer(Arc::clone(&self.buffer))
        }
    }

    fn wait_for_state(player: &Player, state: PlayerState) -> bool {
        for _ in 0..50 {
            if player.state() == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn walks_wait_load_cued_play_for_an_item_starting_now() {
        let (sender, receiver) = unbounded();
        let player = Player::new("test", Box::new(NullBackend::new(false)), sender);
        assert_eq!(player.state(), PlayerState::Idle);

        let now = unix_now();
        player.schedule(PlayItem::new(now, now + 60, "null://x"));
        assert_eq!(player.state(), PlayerState::Wait);

        player.run();
        assert!(wait_for_state(&player, PlayerState::Play));
        match receiver.recv_timeout(Duration::from_secs(2)).unwrap() {
            PlayerEvent::Started { player: name, item } => {
                assert_eq!(name, "test");
                assert_eq!(item.uri, "null://x");
            }
        }
        player.terminate();
        assert_eq!(player.state(), PlayerState::Idle);
    }

    #[test]
    fn failing_load_parks_the_player_in_fail() {
        let (sender, _receiver) = unbounded();
        let player = Player::new("test", Box::new(NullBackend::new(true)), sender);
        let now = unix_now();
        player.schedule(PlayItem::new(now, now + 60, "null://x"));
        player.run();
        assert!(wait_for_state(&player, PlayerState::Fail));
        // stop recovers to IDLE
        player.stop();
        assert_eq!(player.state(), PlayerState::Idle);
        player.terminate();
    }

    #[test]
    fn item_in_the_future_stays_waiting() {
        let (sender, _receiver) = unbounded();
        let player = Player::new("test", Box::new(NullBackend::new(false)), sender);
        let now = unix_now();
        player.schedule(PlayItem::new(now + 3600, now + 3660, "null://x"));
        player.run();
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(player.state(), PlayerState::Wait);
        player.terminate();
    }

    #[test]
    fn stop_is_idempotent() {
        let (sender, _receiver) = unbounded();
        let player = Player::new("test", Box::new(NullBackend::new(false)), sender);
        let now = unix_now();
        player.schedule(PlayItem::new(now, now + 10, "null://x"));
        player.stop();
        assert_eq!(player.state(), PlayerState::Idle);
        assert!(player.shared().item().is_none());
        player.stop();
        assert_eq!(player.state(), PlayerState::Idle);
    }

    #[test]
    fn zero_duration_fade_completes_in_one_step() {
        let shared = PlayerShared::new("fade");
        let fader = Fader::new(Arc::clone(&shared));
        fader.fade_in(0.0);
        fader.join();
        assert_eq!(shared.volume(), 1.0);
        assert!(!shared.is_fading());
        fader.fade_out(0.0);
        fader.join();
        assert_eq!(shared.volume(), 0.0);
    }

    #[test]
    fn only_one_fade_runs_at_a_time() {
        let shared = PlayerShared::new("fade");
        let fader = Fader::new(Arc::clone(&shared));
        fader.fade_in(0.3);
        // second request while fading is ignored
        fader.fade_out(0.0);
        fader.join();
        assert_eq!(shared.volume(), 1.0);
    }

    #[test]
    fn fade_curve_is_exponential() {
        let shared = PlayerShared::new("vol");
        shared.set_volume(0.5, true);
        assert_eq!(shared.volume(), 0.25);
        shared.set_volume(0.5, false);
        assert_eq!(shared.volume(), 0.5);
        shared.set_volume(2.0, false);
        assert_eq!(shared.volume(), 1.0);
        shared.set_volume(-1.0, false);
        assert_eq!(shared.volume(), 0.0);
    }

    #[test]
    fn voice_zeroes_output_on_underrun() {
        let shared = PlayerShared::new("voice");
        let buffer = Arc::new(PlayBuffer::new());
        buffer.resize(64, false);
        let mut voice = Voice::new(Arc::clone(&shared), VoiceSource::Buffer(Arc::clone(&buffer)));

        let mut out = vec![7 as Sample; 32];
        assert_eq!(voice.process(&[], &mut out, 16), 0);
        assert!(out.iter().all(|sample| *sample == 0));

        buffer.write(&[100; 32]);
        assert_eq!(voice.process(&[], &mut out, 16), 32);
        assert!(out.iter().all(|sample| *sample == 100));
        assert!(shared.rms_db() > -60.0);
    }

    #[test]
    fn line_voice_copies_the_input() {
        let shared = PlayerShared::new("line");
        let mut voice = Voice::new(shared, VoiceSource::Line);
        let input = vec![42 as Sample; 32];
        let mut out = vec![0 as Sample; 32];
        assert_eq!(voice.process(&input, &mut out, 16), 32);
        assert_eq!(out, input);
    }
}
