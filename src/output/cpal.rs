use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rb::{RbConsumer, RbProducer, SpscRb, RB};

use super::{AudioClient, Renderer, MAX_BLOCK_FRAMES};
use crate::{error::Error, Sample};

// -------------------------------------------------------------------------------------------------

/// Capture ring between the input and output callbacks; their block sizes need not agree.
const INPUT_RING_SIZE: usize = MAX_BLOCK_FRAMES * 2 * 4;

// -------------------------------------------------------------------------------------------------

/// cpal-backed duplex client: stereo i16 at the engine rate on the devices whose names match
/// the configured prefixes, falling back to the defaults.
///
/// The input stream fills a ring which the output callback drains, so the renderer always
/// sees an aligned `(input, output)` pair. A missing input device degrades to silence on the
/// capture side; output device failures abort startup.
pub struct CpalAudioClient {
    input_name: String,
    output_name: String,
    sample_rate: u32,
    renderer: Option<Box<dyn Renderer>>,
    streams: Vec<cpal::Stream>,
}

impl CpalAudioClient {
    pub fn new(input_name: &str, output_name: &str, sample_rate: u32) -> Self {
        Self {
            input_name: input_name.to_string(),
            output_name: output_name.to_string(),
            sample_rate,
            renderer: None,
            streams: Vec::new(),
        }
    }

    fn stream_config(&self) -> cpal::StreamConfig {
        cpal::StreamConfig {
            channels: 2,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        }
    }
}

impl AudioClient for CpalAudioClient {
    fn set_renderer(&mut self, renderer: Box<dyn Renderer>) {
        self.renderer = Some(renderer);
    }

    fn start(&mut self) -> Result<(), Error> {
        let mut renderer = self
            .renderer
            .take()
            .ok_or_else(|| Error::Device("no renderer installed".to_string()))?;

        let host = cpal::default_host();
        let config = self.stream_config();

        let ring = SpscRb::<Sample>::new(INPUT_RING_SIZE);
        let input_producer = ring.producer();
        let input_consumer = ring.consumer();

        // capture side: optional
        match find_device(
            host.input_devices().ok().into_iter().flatten(),
            &self.input_name,
        )
        .or_else(|| host.default_input_device())
        {
            Some(device) => {
                log::info!(
                    "AudioClient input device: {}",
                    device.name().unwrap_or_default()
                );
                let stream = device
                    .build_input_stream(
                        &config,
                        move |data: &[Sample], _: &cpal::InputCallbackInfo| {
                            // on overrun the oldest capture is lost, which is fine for a line feed
                            let _ = input_producer.write(data);
                        },
                        |err| log::error!("AudioClient input stream error: {}", err),
                        None,
                    )
                    .map_err(|err| Error::Device(err.to_string()))?;
                stream
                    .play()
                    .map_err(|err| Error::Device(err.to_string()))?;
                self.streams.push(stream);
            }
            None => log::warn!("AudioClient found no input device - line input stays silent"),
        }

        // render side: mandatory
        let output_device = find_device(
            host.output_devices().ok().into_iter().flatten(),
            &self.output_name,
        )
        .or_else(|| host.default_output_device())
        .ok_or_else(|| Error::Device("no output device".to_string()))?;
        log::info!(
            "AudioClient output device: {}",
            output_device.name().unwrap_or_default()
        );

        let mut input_block = vec![0 as Sample; MAX_BLOCK_FRAMES * 2];
        let stream = output_device
            .build_output_stream(
                &config,
                move |data: &mut [Sample], _: &cpal::OutputCallbackInfo| {
                    let nframes = data.len() / 2;
                    let nsamples = (nframes * 2).min(input_block.len());
                    let captured = input_consumer
                        .read(&mut input_block[..nsamples])
                        .unwrap_or(0);
                    input_block[captured..nsamples].fill(0);

                    #[cfg(feature = "assert-allocs")]
                    assert_no_alloc::assert_no_alloc(|| {
                        renderer.render(&input_block[..nsamples], data, nframes);
                    });
                    #[cfg(not(feature = "assert-allocs"))]
                    renderer.render(&input_block[..nsamples], data, nframes);
                },
                |err| log::error!("AudioClient output stream error: {}", err),
                None,
            )
            .map_err(|err| Error::Device(err.to_string()))?;
        stream
            .play()
            .map_err(|err| Error::Device(err.to_string()))?;
        self.streams.push(stream);

        log::info!(
            "AudioClient started at {} Hz, driver-chosen block size",
            self.sample_rate
        );
        Ok(())
    }

    fn stop(&mut self) {
        for stream in self.streams.drain(..) {
            let _ = stream.pause();
        }
        log::debug!("AudioClient stopped");
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

// -------------------------------------------------------------------------------------------------

/// First device whose name starts with `prefix`; `None` for an empty prefix or no match.
fn find_device<I>(devices: I, prefix: &str) -> Option<cpal::Device>
where
    I: Iterator<Item = cpal::Device>,
{
    if prefix.is_empty() {
        return None;
    }
    for device in devices {
        if let Ok(name) = device.name() {
            if name.starts_with(prefix) {
                return Some(device);
            }
        }
    }
    log::warn!("audio device '{}' not found - using default", prefix);
    None
}
