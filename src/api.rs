use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::{calendar::PlayItem, error::Error, utils};

// -------------------------------------------------------------------------------------------------

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

// -------------------------------------------------------------------------------------------------

/// A show/episode descriptor. Drives recorder restarts and stream metadata, never audio
/// routing.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    pub timeslot_id: i64,
    pub show_id: i64,
    pub playlist_id: i64,
    pub id: String,
    pub start: String,
    pub end: String,
    pub show_name: String,
    pub episode_title: String,
}

impl Default for Program {
    fn default() -> Self {
        Self {
            timeslot_id: -1,
            show_id: -1,
            playlist_id: -1,
            id: String::new(),
            start: String::new(),
            end: String::new(),
            show_name: String::new(),
            episode_title: String::new(),
        }
    }
}

impl PartialEq for Program {
    fn eq(&self, other: &Self) -> bool {
        self.timeslot_id == other.timeslot_id
            && self.show_id == other.show_id
            && self.playlist_id == other.playlist_id
            && self.id == other.id
    }
}

impl Eq for Program {}

impl Program {
    /// Parse one program object of the calendar payload. The playlist id may live in several
    /// places depending on how the show was scheduled.
    pub fn from_json(value: &Value) -> Option<Self> {
        let show_id = value.get("showId").and_then(Value::as_i64)?;
        let id = value.get("id").map(json_to_id)?;
        let start = value.get("start")?.as_str()?.to_string();
        let end = value.get("end")?.as_str()?.to_string();
        let show_name = value.pointer("/show/name")?.as_str()?.to_string();
        let timeslot_id = value
            .get("timeslotId")
            .and_then(Value::as_i64)
            .unwrap_or(-1);
        let episode_title = value
            .pointer("/episode/title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let playlist_id = value
            .get("playlistId")
            .and_then(Value::as_i64)
            .or_else(|| value.pointer("/schedule/defaultPlaylistId").and_then(Value::as_i64))
            .or_else(|| value.pointer("/show/defaultPlaylistId").and_then(Value::as_i64))
            .unwrap_or(-1);
        Some(Self {
            timeslot_id,
            show_id,
            playlist_id,
            id,
            start,
            end,
            show_name,
            episode_title,
        })
    }
}

fn json_to_id(value: &Value) -> String {
    match value {
        Value::String(id) => id.clone(),
        other => other.to_string(),
    }
}

// -------------------------------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Playlist {
    pub id: i64,
    pub entries: Vec<PlaylistEntry>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlaylistEntry {
    pub uri: String,
    pub duration: i64,
}

impl Playlist {
    pub fn from_json(value: &Value) -> Option<Self> {
        let id = value.get("id").and_then(Value::as_i64)?;
        let entries = value
            .get("entries")?
            .as_array()?
            .iter()
            .filter_map(|entry| {
                Some(PlaylistEntry {
                    uri: entry.get("uri")?.as_str()?.to_string(),
                    duration: entry.get("duration").and_then(Value::as_i64).unwrap_or(0),
                })
            })
            .collect();
        Some(Self { id, entries })
    }
}

// -------------------------------------------------------------------------------------------------

/// One line of the station playlog, posted whenever an item starts.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayLog {
    pub track_start: String,
    pub track_duration: i64,
    pub playlist_id: i64,
    pub show_id: i64,
    pub show_name: String,
    pub timeslot_id: String,
}

impl PlayLog {
    pub fn from_item(item: &PlayItem) -> Self {
        Self {
            track_start: utils::utc_fmt(item.start),
            track_duration: item.end - item.start,
            playlist_id: item.program.playlist_id,
            show_id: item.program.show_id,
            show_name: item.program.show_name.clone(),
            timeslot_id: item.program.timeslot_id.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub is_healthy: bool,
    pub log_time: String,
    pub details: String,
}

// -------------------------------------------------------------------------------------------------

/// Thin client for the calendar REST back-end.
pub struct ApiClient {
    agent: ureq::Agent,
    program_url: String,
    playlist_url: String,
    health_url: String,
    playlog_url: String,
}

impl ApiClient {
    pub fn new(
        program_url: String,
        playlist_url: String,
        health_url: String,
        playlog_url: String,
    ) -> Self {
        Self {
            agent: utils::http_agent(HTTP_TIMEOUT),
            program_url,
            playlist_url,
            health_url,
            playlog_url,
        }
    }

    pub fn get_program(&self) -> Result<Vec<Program>, Error> {
        let payload = self.get_json(&self.program_url)?;
        let programs = payload
            .as_array()
            .map(|entries| entries.iter().filter_map(Program::from_json).collect())
            .unwrap_or_default();
        Ok(programs)
    }

    pub fn get_playlist(&self, playlist_id: i64) -> Result<Playlist, Error> {
        let url = format!("{}/{}", self.playlist_url.trim_end_matches('/'), playlist_id);
        let payload = self.get_json(&url)?;
        Playlist::from_json(&payload)
            .ok_or_else(|| Error::Http(format!("malformed playlist {}", playlist_id)))
    }

    pub fn post_health(&self, health: &Health) -> Result<(), Error> {
        self.post_json(&self.health_url, health)
    }

    pub fn post_playlog(&self, playlog: &PlayLog) -> Result<(), Error> {
        self.post_json(&self.playlog_url, playlog)
    }

    fn get_json(&self, url: &str) -> Result<Value, Error> {
        if url.is_empty() {
            return Err(Error::Http("no endpoint configured".to_string()));
        }
        let body = self
            .agent
            .get(url)
            .call()
            .map_err(|err| Error::Http(err.to_string()))?
            .body_mut()
            .read_to_string()
            .map_err(|err| Error::Http(err.to_string()))?;
        serde_json::from_str(&body).map_err(|err| Error::Http(err.to_string()))
    }

    fn post_json<T: Serialize>(&self, url: &str, payload: &T) -> Result<(), Error> {
        if url.is_empty() {
            return Err(Error::Http("no endpoint configured".to_string()));
        }
        let body = serde_json::to_string(payload).map_err(|err| Error::Http(err.to_string()))?;
        self.agent
            .post(url)
            .header("Content-Type", "application/json")
            .send(body.as_str())
            .map_err(|err| Error::Http(err.to_string()))?;
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_program_with_nested_playlist_id() {
        let value = json!({
            "showId": 7,
            "id": "abc",
            "start": "2025-06-01T10:00:00",
            "end": "2025-06-01T11:00:00",
            "timeslotId": 42,
            "show": { "name": "Morning Show", "defaultPlaylistId": 3 },
            "episode": { "title": "Pilot" }
        });
        let program = Program::from_json(&value).unwrap();
        assert_eq!(program.show_id, 7);
        assert_eq!(program.timeslot_id, 42);
        assert_eq!(program.playlist_id, 3);
        assert_eq!(program.show_name, "Morning Show");
        assert_eq!(program.episode_title, "Pilot");
    }

    #[test]
    fn direct_playlist_id_wins_over_fallbacks() {
        let value = json!({
            "showId": 1,
            "id": 5,
            "start": "s", "end": "e",
            "playlistId": 9,
            "show": { "name": "X", "defaultPlaylistId": 3 }
        });
        let program = Program::from_json(&value).unwrap();
        assert_eq!(program.playlist_id, 9);
        assert_eq!(program.id, "5");
        assert_eq!(program.timeslot_id, -1);
    }

    #[test]
    fn program_equality_ignores_names() {
        let a = Program {
            show_id: 1,
            playlist_id: 2,
            timeslot_id: 3,
            id: "x".into(),
            show_name: "A".into(),
            ..Default::default()
        };
        let mut b = a.clone();
        b.show_name = "B".into();
        assert_eq!(a, b);
        b.show_id = 4;
        assert_ne!(a, b);
    }

    #[test]
    fn parses_playlist_entries() {
        let value = json!({
            "id": 3,
            "entries": [
                { "uri": "file://music/a.mp3", "duration": 120 },
                { "uri": "m3u://shows/b.m3u" },
            ]
        });
        let playlist = Playlist::from_json(&value).unwrap();
        assert_eq!(playlist.id, 3);
        assert_eq!(playlist.entries.len(), 2);
        assert_eq!(playlist.entries[0].duration, 120);
        assert_eq!(playlist.entries[1].duration, 0);
    }
}
