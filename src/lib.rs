//! **aircast** is an *automated radio playout engine*.
//!
//! It realizes a calendar of scheduled program items - files, http streams and a hardware
//! line input - as a continuous stereo output, falls back to a locally cached library when
//! silence is detected, and concurrently encodes the output to MP3 recordings and an
//! Icecast/SHOUTcast live mount.
//!
//! ## Architecture
//!
//! - [`calendar`] supplies [`PlayItem`](calendar::PlayItem)s, either from the scheduling
//!   REST service or from a static list.
//! - [`player`] holds the per-item state machine (`IDLE -> WAIT -> LOAD -> CUED -> PLAY`)
//!   with its file, stream, line and premix variants. Each player splits into a control half
//!   driven by a supervisor thread and a lock-free [`Voice`](player::Voice) owned by the
//!   render callback.
//! - [`buffer`] decouples decoders from the audio callback: an SPSC sample ring with
//!   all-or-nothing reads, plus the premix variant with baked equal-power cross-fades.
//! - [`codec`] pulls URLs into engine-rate stereo (symphonia + rubato) and encodes MP3
//!   (LAME) to files or ICY mounts.
//! - [`fallback`] keeps a premixed rotation of the local library ready and a two-tone sine
//!   as the last resort; [`dsp`] houses the silence detector driving it.
//! - [`engine`] schedules items onto players from a ~10 Hz worker tick and runs the mix bus
//!   inside the driver callback provided by [`output`].
//!
//! The audio callback is hard-real-time: no heap allocation, no contended locks, no
//! blocking I/O and no logging happen on it; everything slow runs on per-component worker
//! threads connected through rings, channels and shared atomic records.

pub mod api;
pub mod buffer;
pub mod calendar;
pub mod codec;
pub mod config;
pub mod control;
pub mod dsp;
pub mod engine;
pub mod fallback;
pub mod output;
pub mod params;
pub mod player;
pub mod record;
pub mod utils;

mod error;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::Config;
pub use engine::Engine;
pub use error::Error;

/// One stereo sample element: 16-bit signed, interleaved left/right.
pub type Sample = i16;
