use crossbeam_channel::Sender;

use crate::{
    calendar::PlayItem,
    error::Error,
    player::{Player, PlayerBackend, PlayerEvent, VoiceSource},
};

// -------------------------------------------------------------------------------------------------

const PRELOAD_TIME: i64 = 5;

// -------------------------------------------------------------------------------------------------

/// Create a player which passes the hardware line input straight through to the mix bus.
/// There is nothing to load; the item's schedule alone decides when the line is open.
pub fn line_player(name: &str, events: Sender<PlayerEvent>) -> Player {
    Player::new(name, Box::new(LinePlayerBackend), events)
}

pub struct LinePlayerBackend;

impl PlayerBackend for LinePlayerBackend {
    fn can_play(&self, item: &PlayItem) -> bool {
        item.uri.starts_with("line")
    }

    fn load(&self, _url: &str, _seek: f64) -> Result<(), Error> {
        Ok(())
    }

    fn unload(&self) {}

    fn preload_time(&self) -> i64 {
        PRELOAD_TIME
    }

    fn voice_source(&self) -> VoiceSource {
        VoiceSource::Line
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_line_uris_only() {
        let backend = LinePlayerBackend;
        assert!(backend.can_play(&PlayItem::new(0, 1, "line://main")));
        assert!(backend.can_play(&PlayItem::new(0, 1, "line")));
        assert!(!backend.can_play(&PlayItem::new(0, 1, "/a.wav")));
        assert!(!backend.can_play(&PlayItem::new(0, 1, "http://x")));
    }
}
