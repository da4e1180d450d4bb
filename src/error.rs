use thiserror::Error;

// -------------------------------------------------------------------------------------------------

/// Errors which may happen anywhere in the playout engine.
///
/// Background workers catch these at their top level and move the owning component into a safe
/// state; the audio thread never sees them.
#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to open media source '{0}': {1}")]
    LoadOpen(String, String),
    #[error("audio decoding failed: {0}")]
    Decode(String),
    #[error("resampling failed: {0}")]
    Resample(String),
    /// Sentinel raised when a premix buffer has no room for another track.
    /// This is not a real failure: the queue simply is full.
    #[error("premix buffer full")]
    BufferFull,
    #[error("audio device error: {0}")]
    Device(String),
    #[error("audio encoder error: {0}")]
    Encoder(String),
    #[error("http request failed: {0}")]
    Http(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid parameter: {0}")]
    Parameter(String),
    #[error("worker channel disconnected")]
    SendError,
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

// -------------------------------------------------------------------------------------------------

pub type Result<T> = std::result::Result<T, Error>;
