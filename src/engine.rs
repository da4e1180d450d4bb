use std::{
    collections::HashMap,
    fmt::Write as _,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver};

use crate::{
    api::{ApiClient, Health, PlayLog, Program},
    calendar::{Calendar, PlayItem},
    config::Config,
    control::StatusServer,
    dsp::silence::{SilenceDetector, SilenceState},
    error::Error,
    fallback::{Fallback, FallbackOptions, FallbackVoice},
    output::{AudioClient, DefaultAudioClient, Renderer, MAX_BLOCK_FRAMES},
    params::Parameters,
    player::{
        line::line_player, stream::stream_player, Player, PlayerEvent, PlayerState, Voice,
    },
    record::{Recorder, RecorderHandle, StreamOutput},
    utils::{curr_time_fmt_ms, unix_now, utc_fmt},
    Sample,
};

// -------------------------------------------------------------------------------------------------

const WORKER_INTERVAL: Duration = Duration::from_millis(100);
/// How early the engine hands items to players; the players' own preload takes over from
/// there.
const SCHEDULE_PRELOAD: i64 = 30;

// -------------------------------------------------------------------------------------------------

/// Binds the calendar to the players and runs the mix bus.
///
/// A worker tick (~10 Hz) drives scheduling, the silence/fallback interlock, health reporting
/// and status publishing; the render callback mixes all active voices into the device block
/// and feeds the detector, recorder and stream encoder.
pub struct Engine {
    config: Config,
    calendar: Arc<dyn Calendar>,
    api: Arc<ApiClient>,
    audio: DefaultAudioClient,
    players: Arc<Vec<Player>>,
    fallback: Arc<Fallback>,
    silence_state: Arc<SilenceState>,
    silence_detector: Option<SilenceDetector>,
    recorder: Arc<Mutex<Recorder>>,
    stream_output: Arc<StreamOutput>,
    params: Arc<Parameters>,
    control: Arc<StatusServer>,
    events: Option<Receiver<PlayerEvent>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn new(config: Config, calendar: Arc<dyn Calendar>) -> Self {
        let sample_rate = config.sample_rate;
        let (event_sender, event_receiver) = unbounded();

        let players = Arc::new(vec![
            stream_player("Player 1", sample_rate, event_sender.clone()),
            stream_player("Player 2", sample_rate, event_sender.clone()),
            line_player("Line 1", event_sender.clone()),
        ]);

        let fallback = Arc::new(Fallback::new(
            FallbackOptions {
                path: config.audio_fallback_path.clone(),
                buffer_seconds: config.fallback_buffer_time,
                cross_fade_seconds: config.fallback_cross_fade_time,
                fade_in_time: config.fallback_fade_time,
                fade_out_time: config.fallback_fade_time,
                shuffle: config.fallback_shuffle,
                shuffle_seed: config.fallback_shuffle_seed,
                sine_synth: config.fallback_sine_synth,
            },
            sample_rate,
            event_sender,
        ));

        let silence_detector = SilenceDetector::new(
            config.silence_threshold,
            config.silence_start_duration,
            config.silence_stop_duration,
        );
        let silence_state = silence_detector.state();

        let api = Arc::new(ApiClient::new(
            config.calendar_program_url.clone(),
            config.calendar_playlist_url.clone(),
            config.health_url.clone(),
            config.playlog_url.clone(),
        ));

        Self {
            audio: DefaultAudioClient::new(
                &config.input_device,
                &config.output_device,
                sample_rate,
            ),
            recorder: Arc::new(Mutex::new(Recorder::new(sample_rate))),
            stream_output: Arc::new(StreamOutput::new(
                sample_rate,
                config.stream_retry_interval,
            )),
            params: Arc::new(Parameters::new(&config.parameters_path)),
            control: Arc::new(StatusServer::new(config.tcp_port)),
            events: Some(event_receiver),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            calendar,
            api,
            players,
            fallback,
            silence_state,
            silence_detector: Some(silence_detector),
            config,
        }
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn parameters(&self) -> Arc<Parameters> {
        Arc::clone(&self.params)
    }

    /// Bring the whole pipeline up. Fails hard on socket or device errors.
    pub fn start(&mut self) -> Result<(), Error> {
        log::debug!("Engine starting...");
        self.running.store(true, Ordering::Relaxed);

        self.control.start()?;

        let renderer = EngineRenderer::new(
            self.players.iter().map(Player::voice).collect(),
            self.fallback.voice(self.config.sample_rate),
            self.silence_detector
                .take()
                .ok_or_else(|| Error::Device("engine started twice".to_string()))?,
            self.recorder.lock().unwrap().handle(),
            self.stream_output.handle(),
            Arc::clone(&self.params),
        );
        self.audio.set_renderer(Box::new(renderer));
        self.audio.start()?;

        self.fallback.run();
        for player in self.players.iter() {
            player.run();
        }

        if !self.config.stream_out_url.is_empty() {
            self.stream_output.start(&self.config.stream_out_url);
        }

        let events = self
            .events
            .take()
            .ok_or_else(|| Error::Device("engine started twice".to_string()))?;
        let mut worker = EngineWorker {
            config: self.config.clone(),
            calendar: Arc::clone(&self.calendar),
            api: Arc::clone(&self.api),
            players: Arc::clone(&self.players),
            fallback: Arc::clone(&self.fallback),
            silence: Arc::clone(&self.silence_state),
            recorder: Arc::clone(&self.recorder),
            stream_output: Arc::clone(&self.stream_output),
            control: Arc::clone(&self.control),
            events,
            scheduled: Vec::new(),
            curr_program: Program::default(),
            last_report: 0,
        };
        let running = Arc::clone(&self.running);
        self.worker = Some(
            std::thread::Builder::new()
                .name("engine".to_string())
                .spawn(move || {
                    while running.load(Ordering::Relaxed) {
                        worker.work();
                        std::thread::sleep(WORKER_INTERVAL);
                    }
                })
                .map_err(Error::IoError)?,
        );

        log::info!("Engine started");
        Ok(())
    }

    /// Tear everything down in dependency order.
    pub fn stop(&mut self) {
        log::debug!("Engine stopping...");
        self.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.control.stop();
        self.recorder.lock().unwrap().stop();
        self.fallback.terminate();
        self.stream_output.stop();
        for player in self.players.iter() {
            player.terminate();
        }
        self.audio.stop();
        log::info!("Engine stopped");
    }
}

// -------------------------------------------------------------------------------------------------

/// Worker-tick state; lives on the engine worker thread only.
struct EngineWorker {
    config: Config,
    calendar: Arc<dyn Calendar>,
    api: Arc<ApiClient>,
    players: Arc<Vec<Player>>,
    fallback: Arc<Fallback>,
    silence: Arc<SilenceState>,
    recorder: Arc<Mutex<Recorder>>,
    stream_output: Arc<StreamOutput>,
    control: Arc<StatusServer>,
    events: Receiver<PlayerEvent>,
    /// Membership set of handed-out items, so calendar re-delivery does not re-schedule.
    scheduled: Vec<PlayItem>,
    curr_program: Program,
    last_report: i64,
}

impl EngineWorker {
    fn work(&mut self) {
        if self.silence.silence_detected() {
            self.fallback.start();
        } else {
            self.fallback.stop();
        }

        while let Ok(event) = self.events.try_recv() {
            let PlayerEvent::Started { player, item } = event;
            self.item_did_start(&player, item);
        }

        let now = unix_now();
        schedule_items(
            &self.players,
            &mut self.scheduled,
            self.calendar.items(),
            now,
        );
        self.scheduled
            .retain(|item| now <= item.end + item.eject_time.ceil() as i64 + 1);

        if now - self.last_report > self.config.report_interval {
            self.last_report = now;
            self.post_health();
        }

        if self.control.connected() {
            self.control.set_status(render_status(&self.players));
        }
    }

    fn item_did_start(&mut self, player: &str, item: PlayItem) {
        log::info!("Engine item did start on {}: '{}'", player, item.uri);

        if self.stream_output.is_running() && !self.config.stream_out_metadata_url.is_empty() {
            if let Err(err) = self
                .stream_output
                .update_metadata(&self.config.stream_out_metadata_url, &item.program.show_name)
            {
                log::error!("Engine failed to update stream metadata: {}", err);
            }
        }

        if self.curr_program != item.program {
            self.curr_program = item.program.clone();
            log::info!("Engine program changed to {}", self.curr_program.show_name);

            if !self.config.audio_record_path.is_empty() {
                let mut recorder = self.recorder.lock().unwrap();
                recorder.stop();
                if self.curr_program.show_id > 1 {
                    let url = format!(
                        "{}/{}_{}.mp3",
                        self.config.audio_record_path.trim_end_matches('/'),
                        utc_fmt(unix_now()),
                        self.curr_program.show_name
                    );
                    let metadata = HashMap::from([
                        ("artist".to_string(), item.program.show_name.clone()),
                        ("title".to_string(), item.program.episode_title.clone()),
                    ]);
                    if let Err(err) = recorder.start(&url, &metadata) {
                        log::error!("Engine failed to start recorder for '{}': {}", url, err);
                    }
                }
            }
        }

        if !self.config.playlog_url.is_empty() {
            if let Err(err) = self.api.post_playlog(&PlayLog::from_item(&item)) {
                log::error!("Engine failed to post playlog: {}", err);
            }
        }
    }

    fn post_health(&self) {
        if self.config.health_url.is_empty() {
            return;
        }
        let health = Health {
            is_healthy: true,
            log_time: curr_time_fmt_ms(),
            details: ":)".to_string(),
        };
        if let Err(err) = self.api.post_health(&health) {
            log::error!("Engine failed to post health: {}", err);
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Hand every item inside its schedule window to the first idle player that can play it.
/// Items nobody can play are added to the membership set anyway to keep the log quiet.
fn schedule_items(
    players: &[Player],
    scheduled: &mut Vec<PlayItem>,
    items: Vec<PlayItem>,
    now: i64,
) {
    for item in items {
        if !item.is_in_schedule_time(now, SCHEDULE_PRELOAD) {
            continue;
        }
        if scheduled.contains(&item) {
            continue;
        }
        let mut any_can_play = false;
        let mut assigned = false;
        for player in players {
            if !player.can_play(&item) {
                continue;
            }
            any_can_play = true;
            if player.state() == PlayerState::Idle {
                player.schedule(item.clone());
                scheduled.push(item.clone());
                assigned = true;
                break;
            }
        }
        if !any_can_play {
            log::error!("no player registered for uri {}", item.uri);
            scheduled.push(item);
        } else if !assigned {
            log::debug!("all players busy for '{}' - retrying next tick", item.uri);
        }
    }
}

fn render_status(players: &[Player]) -> String {
    let mut status = String::from("\x1b[5A\n");
    for player in players {
        let _ = write!(status, "{:<16} ", player.name());
    }
    status.push('\n');
    for player in players {
        let _ = write!(status, "{:<16} ", player.state().as_str());
    }
    status.push('\n');
    for player in players {
        let _ = write!(status, "{:<16.2} ", player.shared().volume());
    }
    status.push('\n');
    for player in players {
        let _ = write!(status, "{:<16.2} ", player.shared().rms_db());
    }
    status.push('\n');
    status
}

// -------------------------------------------------------------------------------------------------

/// The hard-real-time half of the engine: mixes all active voices into the output block and
/// feeds the taps. No allocation, no locks, no logging.
pub(crate) struct EngineRenderer {
    voices: Vec<Voice>,
    fallback_voice: FallbackVoice,
    silence: SilenceDetector,
    recorder: RecorderHandle,
    stream_output: RecorderHandle,
    params: Arc<Parameters>,
    mix: Vec<Sample>,
    input: Vec<Sample>,
}

impl EngineRenderer {
    pub(crate) fn new(
        voices: Vec<Voice>,
        fallback_voice: FallbackVoice,
        silence: SilenceDetector,
        recorder: RecorderHandle,
        stream_output: RecorderHandle,
        params: Arc<Parameters>,
    ) -> Self {
        Self {
            voices,
            fallback_voice,
            silence,
            recorder,
            stream_output,
            params,
            mix: vec![0; MAX_BLOCK_FRAMES * 2],
            input: vec![0; MAX_BLOCK_FRAMES * 2],
        }
    }
}

impl Renderer for EngineRenderer {
    fn render(&mut self, input: &[Sample], output: &mut [Sample], nframes: usize) {
        let Self {
            voices,
            fallback_voice,
            silence,
            recorder,
            stream_output,
            params,
            mix,
            input: captured,
        } = self;

        let nsamples = (nframes * 2).min(output.len()).min(mix.len());
        let out = &mut output[..nsamples];
        out.fill(0);

        // captured line block, input gain applied
        let input_gain = params.input_gain_linear();
        let available = input.len().min(nsamples);
        for (slot, sample) in captured[..available].iter_mut().zip(&input[..available]) {
            *slot = scale(*sample, input_gain);
        }
        captured[available..nsamples].fill(0);
        let captured = &captured[..nsamples];

        for voice in voices.iter_mut() {
            if !voice.is_active() {
                continue;
            }
            voice.process(captured, &mut mix[..nsamples], nframes);
            let volume = voice.volume();
            for (out_sample, mix_sample) in out.iter_mut().zip(&mix[..nsamples]) {
                *out_sample = out_sample.saturating_add(scale(*mix_sample, volume));
            }
        }

        let output_gain = params.output_gain_linear();
        if (output_gain - 1.0).abs() > 1e-4 {
            for sample in out.iter_mut() {
                *sample = scale(*sample, output_gain);
            }
        }

        silence.process(out);

        if fallback_voice.is_active() {
            fallback_voice.process(captured, out, nframes);
        }

        if recorder.is_running() {
            recorder.process(out);
        }
        if stream_output.is_running() {
            stream_output.process(out);
        }
    }
}

fn scale(sample: Sample, factor: f32) -> Sample {
    (sample as f32 * factor).clamp(Sample::MIN as f32, Sample::MAX as f32) as Sample
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PlayBuffer;
    use crate::player::{PlayerShared, PlayerState, VoiceSource};
    use crossbeam_channel::unbounded;

    fn playing_voice(name: &str, samples: &[Sample], volume: f32) -> Voice {
        let shared = PlayerShared::new(name);
        shared.set_state(PlayerState::Play);
        shared.set_volume(volume, false);
        let buffer = Arc::new(PlayBuffer::new());
        buffer.resize(samples.len().max(16), false);
        buffer.write(samples);
        Voice::new(shared, VoiceSource::Buffer(buffer))
    }

    fn renderer_under_test(voices: Vec<Voice>) -> (EngineRenderer, Arc<SilenceState>) {
        let dir = tempfile::tempdir().unwrap();
        let (sender, _receiver) = unbounded();
        let fallback = Fallback::new(
            FallbackOptions {
                path: dir.path().to_string_lossy().to_string(),
                buffer_seconds: 5,
                sine_synth: false,
                ..FallbackOptions::default()
            },
            44100,
            sender,
        );
        let detector = SilenceDetector::new(-90.0, 10, 1);
        let state = detector.state();
        let recorder = Recorder::new(44100);
        let stream_output = StreamOutput::new(44100, 5);
        let params = Arc::new(Parameters::new("/nonexistent/params.json"));
        let renderer = EngineRenderer::new(
            voices,
            fallback.voice(44100),
            detector,
            recorder.handle(),
            stream_output.handle(),
            params,
        );
        (renderer, state)
    }

    #[test]
    fn mix_is_the_volume_weighted_sum_of_active_voices() {
        let voices = vec![
            playing_voice("a", &[1000; 32], 1.0),
            playing_voice("b", &[500; 32], 0.5),
        ];
        let (mut renderer, _state) = renderer_under_test(voices);
        let mut out = vec![0 as Sample; 32];
        renderer.render(&[], &mut out, 16);
        assert!(out.iter().all(|sample| *sample == 1250), "{:?}", &out[..4]);
    }

    #[test]
    fn idle_voices_do_not_contribute() {
        let shared = PlayerShared::new("idle");
        let buffer = Arc::new(PlayBuffer::new());
        buffer.resize(64, false);
        buffer.write(&[9999; 64]);
        let idle_voice = Voice::new(shared, VoiceSource::Buffer(buffer));

        let voices = vec![playing_voice("a", &[100; 32], 1.0), idle_voice];
        let (mut renderer, _state) = renderer_under_test(voices);
        let mut out = vec![0 as Sample; 32];
        renderer.render(&[], &mut out, 16);
        assert!(out.iter().all(|sample| *sample == 100));
    }

    #[test]
    fn saturation_instead_of_wraparound() {
        let voices = vec![
            playing_voice("a", &[30000; 32], 1.0),
            playing_voice("b", &[30000; 32], 1.0),
        ];
        let (mut renderer, _state) = renderer_under_test(voices);
        let mut out = vec![0 as Sample; 32];
        renderer.render(&[], &mut out, 16);
        assert!(out.iter().all(|sample| *sample == Sample::MAX));
    }

    #[test]
    fn empty_schedule_renders_silence() {
        let (mut renderer, _state) = renderer_under_test(Vec::new());
        let mut out = vec![1234 as Sample; 64];
        renderer.render(&[], &mut out, 32);
        assert!(out.iter().all(|sample| *sample == 0));
    }

    #[test]
    fn scheduling_assigns_idle_players_and_dedupes() {
        let (sender, _receiver) = unbounded();
        let players = vec![
            stream_player("Player 1", 44100, sender.clone()),
            stream_player("Player 2", 44100, sender.clone()),
            line_player("Line 1", sender),
        ];
        let now = unix_now();
        let mut scheduled = Vec::new();

        let item_a = PlayItem::new(now + 5, now + 60, "http://radio/a");
        let item_line = PlayItem::new(now + 5, now + 60, "line://main");
        let items = vec![item_a.clone(), item_line.clone()];

        schedule_items(&players, &mut scheduled, items.clone(), now);
        assert_eq!(players[0].state(), PlayerState::Wait);
        assert_eq!(players[1].state(), PlayerState::Idle);
        assert_eq!(players[2].state(), PlayerState::Wait);
        assert_eq!(scheduled.len(), 2);

        // re-delivery changes nothing
        schedule_items(&players, &mut scheduled, items, now);
        assert_eq!(scheduled.len(), 2);
        assert_eq!(players[1].state(), PlayerState::Idle);
    }

    #[test]
    fn expired_items_are_never_scheduled() {
        let (sender, _receiver) = unbounded();
        let players = vec![stream_player("Player 1", 44100, sender)];
        let now = unix_now();
        let mut scheduled = Vec::new();
        let expired = PlayItem::new(now - 100, now - 10, "http://radio/a");
        schedule_items(&players, &mut scheduled, vec![expired], now);
        assert_eq!(players[0].state(), PlayerState::Idle);
        assert!(scheduled.is_empty());
    }

    #[test]
    fn unroutable_items_enter_the_set_without_a_player() {
        let (sender, _receiver) = unbounded();
        let players = vec![stream_player("Player 1", 44100, sender)];
        let now = unix_now();
        let mut scheduled = Vec::new();
        let odd = PlayItem::new(now, now + 10, "gopher://old/school");
        schedule_items(&players, &mut scheduled, vec![odd], now);
        assert_eq!(players[0].state(), PlayerState::Idle);
        assert_eq!(scheduled.len(), 1);
    }

    #[test]
    fn status_frame_lists_all_players() {
        let (sender, _receiver) = unbounded();
        let players = vec![
            stream_player("Player 1", 44100, sender.clone()),
            line_player("Line 1", sender),
        ];
        let status = render_status(&players);
        assert!(status.contains("Player 1"));
        assert!(status.contains("Line 1"));
        assert!(status.contains("IDLE"));
    }
}
