use std::{
    collections::HashMap,
    fs::File,
    io::{Read, Seek, SeekFrom},
    sync::Mutex,
    time::Duration,
};

use symphonia::core::{
    audio::{Channels, SampleBuffer, SignalSpec},
    codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions},
    meta::MetadataOptions,
    probe::Hint,
    units::Time,
};

use crate::error::Error;

// -------------------------------------------------------------------------------------------------

/// Connect and response timeout for http sources.
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

// -------------------------------------------------------------------------------------------------

/// Decodes audio files or http streams via symphonia.
///
/// Accepts everything the enabled symphonia features can demux and decode. Http sources are
/// opened as unseekable live streams; file paths are opened directly and can be seeked.
pub struct AudioDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    signal_spec: SignalSpec,
    codec_params: CodecParameters,
    metadata: HashMap<String, String>,
}

impl AudioDecoder {
    /// Open the given file path or http(s) URL and prepare the best audio track for decoding.
    pub fn new(url: &str) -> Result<Self, Error> {
        let mut hint = Hint::new();
        let source: Box<dyn MediaSource> = if is_remote_url(url) {
            let (reader, content_type) = open_http_source(url)?;
            if let Some(extension) = extension_from_mime(content_type.as_deref()) {
                hint.with_extension(extension);
            }
            Box::new(reader)
        } else {
            if let Some(extension) = url.rsplit('.').next() {
                hint.with_extension(extension);
            }
            let file = File::open(url)
                .map_err(|err| Error::LoadOpen(url.to_string(), err.to_string()))?;
            Box::new(file)
        };

        let stream = MediaSourceStream::new(source, MediaSourceStreamOptions::default());
        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let metadata_opts = MetadataOptions::default();

        let mut probed = symphonia::default::get_probe()
            .format(&hint, stream, &format_opts, &metadata_opts)
            .map_err(|err| Error::LoadOpen(url.to_string(), err.to_string()))?;

        let mut format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::LoadOpen(url.to_string(), "no audio track".to_string()))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();
        let rate = codec_params.sample_rate.unwrap_or(44100);
        let channels = codec_params
            .channels
            .unwrap_or(Channels::FRONT_LEFT | Channels::FRONT_RIGHT);
        let signal_spec = SignalSpec::new(rate, channels);

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|err| Error::LoadOpen(url.to_string(), err.to_string()))?;

        // collect tags from the container and the probe
        let mut metadata = HashMap::new();
        if let Some(revision) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
            collect_tags(revision.tags(), &mut metadata);
        }
        if let Some(revision) = format.metadata().current() {
            collect_tags(revision.tags(), &mut metadata);
        }

        Ok(Self {
            format,
            decoder,
            track_id,
            signal_spec,
            codec_params,
            metadata,
        })
    }

    pub fn signal_spec(&self) -> SignalSpec {
        self.signal_spec
    }

    pub fn codec_params(&self) -> &CodecParameters {
        &self.codec_params
    }

    /// Tag metadata of the source (title, artist, ...), keys lower-cased.
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Total duration in seconds, when the container knows it. Live streams return `None`.
    pub fn duration(&self) -> Option<f64> {
        let time_base = self.codec_params.time_base?;
        let n_frames = self.codec_params.n_frames?;
        let time = time_base.calc_time(n_frames);
        Some(time.seconds as f64 + time.frac)
    }

    /// Seek to the given position. Returns the actual timestamp in frames.
    pub fn seek(&mut self, position: Duration) -> Result<u64, Error> {
        let seeked_to = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(position.as_secs_f64()),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|err| Error::Decode(err.to_string()))?;
        self.decoder.reset();
        Ok(seeked_to.actual_ts)
    }

    /// Decode the next packet of the selected track into `output`.
    /// Returns `None` at the end of the stream. Corrupt packets are skipped, which also absorbs
    /// the short dropouts a reconnecting http source produces.
    pub fn read_packet(&mut self, output: &mut SampleBuffer<f32>) -> Option<()> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(_) => return None,
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    if decoded.frames() * self.signal_spec.channels.count() > output.capacity() {
                        // oversized packet, should not happen with max_frames_per_packet sizing
                        continue;
                    }
                    output.copy_interleaved_ref(decoded);
                    return Some(());
                }
                Err(SymphoniaError::DecodeError(_)) => {
                    // corrupt packet: skip and continue with the next one
                    continue;
                }
                Err(_) => return None,
            }
        }
    }
}

// -------------------------------------------------------------------------------------------------

fn is_remote_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn collect_tags(tags: &[symphonia::core::meta::Tag], map: &mut HashMap<String, String>) {
    for tag in tags {
        map.insert(tag.key.to_lowercase(), tag.value.to_string());
    }
}

fn extension_from_mime(mime: Option<&str>) -> Option<&'static str> {
    let mime = mime?;
    if mime.contains("mpeg") || mime.contains("mp3") {
        Some("mp3")
    } else if mime.contains("aac") {
        Some("aac")
    } else if mime.contains("mp4") || mime.contains("m4a") {
        Some("m4a")
    } else if mime.contains("ogg") || mime.contains("vorbis") {
        Some("ogg")
    } else if mime.contains("flac") {
        Some("flac")
    } else if mime.contains("wav") {
        Some("wav")
    } else {
        None
    }
}

fn open_http_source(url: &str) -> Result<(RemoteSource, Option<String>), Error> {
    let agent = crate::utils::http_agent(HTTP_TIMEOUT);
    let response = agent
        .get(url)
        .header("Icy-MetaData", "0")
        .call()
        .map_err(|err| Error::LoadOpen(url.to_string(), err.to_string()))?;
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let reader = response.into_body().into_reader();
    Ok((RemoteSource::new(Box::new(reader)), content_type))
}

// -------------------------------------------------------------------------------------------------

/// Adapter which turns a live http body into an unseekable symphonia `MediaSource`.
///
/// The mutex only exists to make the reader `Sync` as the `MediaSource` trait demands;
/// it is never contended, since a media source is driven by exactly one decode thread.
pub struct RemoteSource {
    reader: Mutex<Box<dyn Read + Send>>,
}

impl RemoteSource {
    pub fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader: Mutex::new(reader),
        }
    }
}

impl Read for RemoteSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.reader.get_mut() {
            Ok(reader) => reader.read(buf),
            Err(_) => Err(std::io::Error::other("poisoned media source")),
        }
    }
}

impl Seek for RemoteSource {
    fn seek(&mut self, _pos: SeekFrom) -> std::io::Result<u64> {
        Err(std::io::Error::other("live streams are not seekable"))
    }
}

impl MediaSource for RemoteSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_hints() {
        assert_eq!(extension_from_mime(Some("audio/mpeg")), Some("mp3"));
        assert_eq!(extension_from_mime(Some("application/ogg")), Some("ogg"));
        assert_eq!(extension_from_mime(Some("text/html")), None);
        assert_eq!(extension_from_mime(None), None);
    }

    #[test]
    fn remote_urls() {
        assert!(is_remote_url("http://example.com/stream"));
        assert!(is_remote_url("https://example.com/stream"));
        assert!(!is_remote_url("/var/audio/a.wav"));
        assert!(!is_remote_url("./a.wav"));
    }

    #[test]
    fn decodes_wav_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        crate::testutil::write_test_wav(&path, 44100, 4410);

        let mut decoder = AudioDecoder::new(path.to_str().unwrap()).unwrap();
        assert_eq!(decoder.signal_spec().rate, 44100);
        assert_eq!(decoder.signal_spec().channels.count(), 2);

        let max_frames = decoder.codec_params().max_frames_per_packet.unwrap_or(8192);
        let mut buffer = SampleBuffer::<f32>::new(max_frames, decoder.signal_spec());
        let mut samples = 0usize;
        while decoder.read_packet(&mut buffer).is_some() {
            samples += buffer.samples().len();
        }
        assert_eq!(samples, 4410 * 2);
    }
}
