use std::{
    collections::HashMap,
    fs,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    api::{ApiClient, Program},
    codec::reader::CodecReader,
    error::Error,
    utils::unix_now,
};

// -------------------------------------------------------------------------------------------------

/// A scheduled unit of playback. Owned by exactly one player once scheduled; the engine keeps
/// a membership set to dedupe calendar re-delivery.
#[derive(Clone, Debug)]
pub struct PlayItem {
    /// Epoch second the item goes on air.
    pub start: i64,
    /// Epoch second the item leaves the air.
    pub end: i64,
    pub uri: String,
    pub program: Program,
    pub fade_in_time: f32,
    pub fade_out_time: f32,
    /// Grace period after `end` before the owning player is considered finished.
    pub eject_time: f32,
    pub metadata: HashMap<String, String>,
}

impl PlayItem {
    pub fn new(start: i64, end: i64, uri: impl Into<String>) -> Self {
        Self {
            start,
            end,
            uri: uri.into(),
            program: Program::default(),
            fade_in_time: 1.0,
            fade_out_time: 1.0,
            eject_time: 1.0,
            metadata: HashMap::new(),
        }
    }

    /// Whether `now` falls into the schedule window `[start - preload, end]`.
    pub fn is_in_schedule_time(&self, now: i64, preload: i64) -> bool {
        now >= self.start - preload && now <= self.end
    }

    pub fn duration(&self) -> i64 {
        self.end - self.start
    }
}

impl PartialEq for PlayItem {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start && self.end == other.end && self.uri == other.uri
    }
}

impl Eq for PlayItem {}

// -------------------------------------------------------------------------------------------------

/// Source of scheduled play items. The engine polls `items` from its worker tick.
pub trait Calendar: Send + Sync {
    fn items(&self) -> Vec<PlayItem>;
}

// -------------------------------------------------------------------------------------------------

/// Fixed calendar, fed programmatically. Used in tests and for ad-hoc schedules.
#[derive(Default)]
pub struct StaticCalendar {
    items: Mutex<Vec<PlayItem>>,
}

impl StaticCalendar {
    pub fn new(items: Vec<PlayItem>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }

    pub fn set_items(&self, items: Vec<PlayItem>) {
        *self.items.lock().unwrap() = items;
    }
}

impl Calendar for StaticCalendar {
    fn items(&self) -> Vec<PlayItem> {
        self.items.lock().unwrap().clone()
    }
}

// -------------------------------------------------------------------------------------------------

/// Expands `.m3u` playlist files into timed play items.
///
/// `#EXTINF` durations are honoured; files without metadata are probed with a codec reader to
/// learn their length. Parsed playlists are cached per (url, window).
pub struct M3uParser {
    cache: HashMap<String, Vec<PlayItem>>,
}

impl M3uParser {
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
        }
    }

    pub fn reset(&mut self) {
        self.cache.clear();
    }

    pub fn parse(
        &mut self,
        url: &str,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<PlayItem>, Error> {
        let key = format!("{}#{}#{}", url, start_time, end_time);
        if let Some(items) = self.cache.get(&key) {
            return Ok(items.clone());
        }
        let items = parse_m3u(url, start_time, end_time)?;
        self.cache.insert(key, items.clone());
        Ok(items)
    }
}

impl Default for M3uParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip the trailing CR a DOS-edited playlist line carries.
pub fn strip_m3u_line(line: &str) -> &str {
    line.trim_end_matches('\r')
}

fn parse_m3u(url: &str, start_time: i64, end_time: i64) -> Result<Vec<PlayItem>, Error> {
    let probe_duration = |path: &str| -> Result<i64, Error> {
        let reader = CodecReader::new(44100, path, 0.0)?;
        let duration = reader.duration().ceil() as i64;
        if duration <= 0 {
            return Err(Error::Decode(format!("no duration for '{}'", path)));
        }
        Ok(duration)
    };

    let content = fs::read_to_string(url)?;
    let mut lines = content.lines();
    let mut items = Vec::new();
    let mut item_start = start_time;

    let mut push_item = |path: &str, duration: i64, items: &mut Vec<PlayItem>| -> bool {
        let item_end = item_start + duration;
        if end_time == 0 || item_end <= end_time {
            items.push(PlayItem::new(item_start, item_end, path));
            item_start = item_end;
            true
        } else {
            log::debug!("m3u item exceeds end time - truncating");
            items.push(PlayItem::new(item_start, end_time, path));
            false
        }
    };

    let first = lines.next().unwrap_or_default();
    if first.starts_with("#EXTM3U") {
        while let Some(line) = lines.next() {
            let line = strip_m3u_line(line);
            if !line.starts_with("#EXTINF:") {
                continue;
            }
            let metadata = line.split_once(':').map(|(_, rest)| rest).unwrap_or("");
            let duration_str = metadata.split_once(',').map(|(d, _)| d).unwrap_or(metadata);
            let mut duration = duration_str.trim().parse::<i64>().unwrap_or(0);
            if let Some(path) = lines.next() {
                let path = strip_m3u_line(path);
                if duration <= 0 {
                    log::warn!("m3u entry without duration - probing '{}'", path);
                    match probe_duration(path) {
                        Ok(probed) => duration = probed,
                        Err(err) => {
                            log::error!("failed to probe '{}': {}", path, err);
                            continue;
                        }
                    }
                }
                if !push_item(path, duration, &mut items) {
                    break;
                }
            }
        }
    } else {
        for line in std::iter::once(first).chain(lines) {
            let path = strip_m3u_line(line);
            if path.is_empty() || path.starts_with('#') {
                continue;
            }
            match probe_duration(path) {
                Ok(duration) => {
                    if !push_item(path, duration, &mut items) {
                        break;
                    }
                }
                Err(err) => log::error!("failed to probe '{}': {}", path, err),
            }
        }
    }
    Ok(items)
}

// -------------------------------------------------------------------------------------------------

const M3U_PREFIX: &str = "m3u://";
const FILE_PREFIX: &str = "file://";

/// Calendar backed by the scheduling REST service.
///
/// A worker refreshes the program and playlists periodically; `items` returns the most recent
/// expansion. Refresh failures keep the previous schedule.
pub struct ApiCalendar {
    inner: Arc<ApiCalendarInner>,
    worker: Option<JoinHandle<()>>,
}

struct ApiCalendarInner {
    client: ApiClient,
    playlist_path: String,
    source_path: String,
    refresh_interval: i64,
    running: AtomicBool,
    items: Mutex<Vec<PlayItem>>,
}

impl ApiCalendar {
    pub fn new(
        client: ApiClient,
        playlist_path: String,
        source_path: String,
        refresh_interval: i64,
    ) -> Self {
        Self {
            inner: Arc::new(ApiCalendarInner {
                client,
                playlist_path,
                source_path,
                refresh_interval: refresh_interval.max(1),
                running: AtomicBool::new(false),
                items: Mutex::new(Vec::new()),
            }),
            worker: None,
        }
    }

    pub fn start(&mut self) {
        let inner = Arc::clone(&self.inner);
        inner.running.store(true, Ordering::Relaxed);
        self.worker = Some(std::thread::spawn(move || {
            let mut last_refresh = 0i64;
            while inner.running.load(Ordering::Relaxed) {
                let now = unix_now();
                if now - last_refresh > inner.refresh_interval {
                    last_refresh = now;
                    if let Err(err) = inner.refresh() {
                        log::error!("Calendar refresh failed: {}", err);
                    }
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }));
    }

    pub fn stop(&mut self) {
        self.inner.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Calendar for ApiCalendar {
    fn items(&self) -> Vec<PlayItem> {
        self.inner.items.lock().unwrap().clone()
    }
}

impl Drop for ApiCalendar {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ApiCalendarInner {
    fn refresh(&self) -> Result<(), Error> {
        log::info!("Calendar refresh");
        let mut m3u_parser = M3uParser::new();
        let mut items = Vec::new();
        let now = unix_now();
        let programs = self.client.get_program()?;

        for program in &programs {
            let playlist = match self.client.get_playlist(program.playlist_id) {
                Ok(playlist) => playlist,
                Err(err) => {
                    log::error!(
                        "Calendar failed to fetch playlist {}: {}",
                        program.playlist_id,
                        err
                    );
                    continue;
                }
            };
            let program_start = parse_datetime(&program.start)?;
            let program_end = parse_datetime(&program.end)?;
            let mut item_start = program_start;

            for entry in &playlist.entries {
                let mut item_end = item_start + entry.duration;
                if item_end == item_start {
                    // open-ended entry runs until the end of the program
                    item_end = program_end;
                }
                if item_end < now {
                    item_start = item_end;
                    continue;
                }

                if let Some(rest) = entry.uri.strip_prefix(M3U_PREFIX) {
                    let url = format!("{}{}", self.playlist_path, rest);
                    match m3u_parser.parse(&url, item_start, item_end) {
                        Ok(expanded) if !expanded.is_empty() => {
                            for mut item in expanded {
                                item.program = program.clone();
                                item_start = item.end;
                                items.push(item);
                            }
                        }
                        Ok(_) => {
                            log::warn!("Calendar found no m3u entries - adding file as item");
                            let mut item = PlayItem::new(item_start, item_end, url);
                            item.program = program.clone();
                            items.push(item);
                        }
                        Err(err) => {
                            log::error!("Calendar error reading m3u: {}", err);
                        }
                    }
                } else {
                    let uri = match entry.uri.strip_prefix(FILE_PREFIX) {
                        Some(rest) => format!("{}{}", self.source_path, rest),
                        None => entry.uri.clone(),
                    };
                    let mut item = PlayItem::new(item_start, item_end, uri);
                    item.program = program.clone();
                    items.push(item);
                }
                item_start = item_end;
            }
        }

        let mut current = self.items.lock().unwrap();
        if *current != items {
            log::info!("Calendar changed ({} items)", items.len());
            *current = items;
        }
        Ok(())
    }
}

fn parse_datetime(datetime: &str) -> Result<i64, Error> {
    let naive = chrono::NaiveDateTime::parse_from_str(datetime, "%Y-%m-%dT%H:%M:%S")
        .map_err(|err| Error::Http(format!("failed to parse datetime '{}': {}", datetime, err)))?;
    match naive.and_local_timezone(chrono::Local) {
        chrono::LocalResult::Single(local) => Ok(local.timestamp()),
        chrono::LocalResult::Ambiguous(first, _) => Ok(first.timestamp()),
        chrono::LocalResult::None => Err(Error::Http(format!(
            "datetime '{}' has no local representation",
            datetime
        ))),
    }
}

// -------------------------------------------------------------------------------------------------
