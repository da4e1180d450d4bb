use serde::Deserialize;

// -------------------------------------------------------------------------------------------------

/// Engine configuration, loaded from a JSON file. Every field has a default, and an invalid
/// or missing file degrades to the defaults rather than refusing to start.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Input device name prefix; empty selects the system default.
    pub input_device: String,
    /// Output device name prefix; empty selects the system default.
    pub output_device: String,
    pub sample_rate: u32,

    /// Directory of the local fallback library (audio files and `.m3u` playlists).
    pub audio_fallback_path: String,
    /// Seconds of audio the fallback premix holds.
    pub fallback_buffer_time: usize,
    pub fallback_cross_fade_time: f32,
    /// Fade duration used when the fallback goes on or off air.
    pub fallback_fade_time: f32,
    pub fallback_shuffle: bool,
    pub fallback_shuffle_seed: Option<u64>,
    pub fallback_sine_synth: bool,

    /// Directory program recordings are written to; empty disables recording.
    pub audio_record_path: String,
    /// Prefix for `m3u://` playlist entries.
    pub audio_playlist_path: String,
    /// Prefix for `file://` playlist entries.
    pub audio_source_path: String,

    /// ICY mount for the live stream; empty disables streaming.
    pub stream_out_url: String,
    /// ICY metadata endpoint; empty disables title pushes.
    pub stream_out_metadata_url: String,
    pub stream_retry_interval: u64,

    pub silence_threshold: f32,
    pub silence_start_duration: i64,
    pub silence_stop_duration: i64,

    pub calendar_program_url: String,
    pub calendar_playlist_url: String,
    pub health_url: String,
    pub playlog_url: String,
    pub calendar_refresh_interval: i64,
    pub report_interval: i64,

    pub tcp_port: u16,
    pub parameters_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_device: String::new(),
            output_device: String::new(),
            sample_rate: 44100,
            audio_fallback_path: String::new(),
            fallback_buffer_time: 600,
            fallback_cross_fade_time: 5.0,
            fallback_fade_time: 5.0,
            fallback_shuffle: true,
            fallback_shuffle_seed: None,
            fallback_sine_synth: true,
            audio_record_path: String::new(),
            audio_playlist_path: String::new(),
            audio_source_path: String::new(),
            stream_out_url: String::new(),
            stream_out_metadata_url: String::new(),
            stream_retry_interval: 5,
            silence_threshold: -90.0,
            silence_start_duration: 10,
            silence_stop_duration: 1,
            calendar_program_url: String::new(),
            calendar_playlist_url: String::new(),
            health_url: String::new(),
            playlog_url: String::new(),
            calendar_refresh_interval: 60,
            report_interval: 10,
            tcp_port: 9850,
            parameters_path: "parameters.json".to_string(),
        }
    }
}

impl Config {
    /// Load from `path`; any failure is logged and answered with the defaults.
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(err) => {
                    log::error!("invalid configuration '{}': {} - using defaults", path, err);
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!("cannot read configuration '{}': {} - using defaults", path, err);
                Self::default()
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------
