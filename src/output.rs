pub mod cpal;

use crate::{error::Error, Sample};

// -------------------------------------------------------------------------------------------------

/// Upper bound for one driver block, used to pre-allocate every buffer the render path
/// touches. Drivers typically deliver 512-1024 frames.
pub const MAX_BLOCK_FRAMES: usize = 8192;

/// The enabled audio client implementation.
pub type DefaultAudioClient = cpal::CpalAudioClient;

// -------------------------------------------------------------------------------------------------

/// The engine's render hook, invoked from the driver callback.
///
/// `input` holds the captured block (zero-padded when the capture side is behind or absent),
/// `output` the interleaved stereo block to fill. Hard-real-time: implementations must not
/// block, allocate or log.
pub trait Renderer: Send {
    fn render(&mut self, input: &[Sample], output: &mut [Sample], nframes: usize);
}

// -------------------------------------------------------------------------------------------------

/// A duplex audio device running the render callback at the driver's block size.
pub trait AudioClient {
    /// Install the renderer. Must be called before `start`.
    fn set_renderer(&mut self, renderer: Box<dyn Renderer>);
    /// Open the devices and begin calling the renderer. Fails hard on device errors.
    fn start(&mut self) -> Result<(), Error>;
    fn stop(&mut self);
    fn sample_rate(&self) -> u32;
}
