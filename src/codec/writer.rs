use std::{
    collections::HashMap,
    fs::File,
    io::{BufWriter, Read, Write},
    mem::MaybeUninit,
    net::{TcpStream, ToSocketAddrs},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
// NB: `Birtate` really is how the crate spells it
use mp3lame_encoder::{Birtate, Builder, Encoder, FlushNoGap, Id3Tag, InterleavedPcm, Quality};
use rb::{Consumer, RbConsumer};

use crate::{error::Error, Sample};

// -------------------------------------------------------------------------------------------------

const CHANNEL_COUNT: usize = 2;
/// One MPEG-1 layer III granule pair per encode call.
const FRAMES_PER_BLOCK: usize = 1152;
const SAMPLES_PER_BLOCK: usize = FRAMES_PER_BLOCK * CHANNEL_COUNT;
const BITRATE: Birtate = Birtate::Kbps192;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// -------------------------------------------------------------------------------------------------

/// Encodes interleaved stereo `i16` to MP3 and writes it to a local file or an
/// Icecast/SHOUTcast mount.
///
/// Construction opens the output (the part that realistically fails); the LAME encoder itself
/// is created lazily inside [`write`](Self::write) so the writer can move onto its worker
/// thread first.
pub struct CodecWriter {
    sample_rate: u32,
    metadata: HashMap<String, String>,
    sink: WriterSink,
    frames_written: u64,
}

enum WriterSink {
    File(BufWriter<File>),
    Stream(TcpStream),
}

impl WriterSink {
    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            WriterSink::File(writer) => writer.write_all(bytes),
            WriterSink::Stream(stream) => stream.write_all(bytes),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            WriterSink::File(writer) => writer.flush(),
            WriterSink::Stream(stream) => stream.flush(),
        }
    }
}

impl CodecWriter {
    /// Open `url` for MP3 output. `http(s)` and `icecast` URLs become ICY source connections,
    /// anything else is treated as a file path.
    pub fn new(
        sample_rate: u32,
        url: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<Self, Error> {
        let sink = if url.starts_with("http://")
            || url.starts_with("https://")
            || url.starts_with("icecast://")
        {
            WriterSink::Stream(open_icy_connection(url, metadata)?)
        } else {
            if let Some(parent) = Path::new(url).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            WriterSink::File(BufWriter::new(File::create(url)?))
        };
        log::info!("CodecWriter opened {} at {} Hz", url, sample_rate);
        Ok(Self {
            sample_rate,
            metadata: metadata.clone(),
            sink,
            frames_written: 0,
        })
    }

    /// Number of sample frames submitted to the encoder so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Pull blocks from `consumer` and encode until `cancelled` is set, then drain the ring,
    /// flush the encoder and the output.
    pub fn write(
        &mut self,
        consumer: &Consumer<Sample>,
        cancelled: &AtomicBool,
    ) -> Result<(), Error> {
        let tag_metadata = match self.sink {
            // files carry an ID3 tag, a live mount announces itself via the ICY headers
            WriterSink::File(_) => Some(self.metadata.clone()),
            WriterSink::Stream(_) => None,
        };
        let mut encoder = build_encoder(self.sample_rate, tag_metadata.as_ref())?;
        let mut pcm = vec![0 as Sample; SAMPLES_PER_BLOCK];

        loop {
            let mut filled = 0usize;
            while filled < SAMPLES_PER_BLOCK {
                if cancelled.load(Ordering::Relaxed) {
                    break;
                }
                match consumer.read(&mut pcm[filled..]) {
                    Ok(0) | Err(_) => std::thread::sleep(Duration::from_millis(10)),
                    Ok(count) => filled += count,
                }
            }
            if filled > 0 {
                self.encode_block(&mut encoder, &pcm[..filled])?;
            }
            if cancelled.load(Ordering::Relaxed) {
                // drain whatever is left in the ring before closing
                while let Ok(count) = consumer.read(&mut pcm[..]) {
                    if count == 0 {
                        break;
                    }
                    self.encode_block(&mut encoder, &pcm[..count])?;
                }
                break;
            }
        }

        self.flush(&mut encoder)?;
        log::info!("CodecWriter wrote {} frames", self.frames_written);
        Ok(())
    }

    fn encode_block(&mut self, encoder: &mut Encoder, pcm: &[Sample]) -> Result<(), Error> {
        // worst case per LAME docs: 1.25x the sample count plus 7200 bytes
        let capacity = pcm.len() * 5 / 4 + 7200;
        let mut mp3: Vec<MaybeUninit<u8>> = vec![MaybeUninit::uninit(); capacity];
        let encoded = encoder
            .encode(InterleavedPcm(pcm), &mut mp3)
            .map_err(|err| Error::Encoder(format!("{:?}", err)))?;
        self.write_encoded(&mp3, encoded)?;
        self.frames_written += (pcm.len() / CHANNEL_COUNT) as u64;
        Ok(())
    }

    fn flush(&mut self, encoder: &mut Encoder) -> Result<(), Error> {
        let mut mp3: Vec<MaybeUninit<u8>> = vec![MaybeUninit::uninit(); 7200];
        let encoded = encoder
            .flush::<FlushNoGap>(&mut mp3)
            .map_err(|err| Error::Encoder(format!("{:?}", err)))?;
        self.write_encoded(&mp3, encoded)?;
        self.sink.flush()?;
        Ok(())
    }

    fn write_encoded(&mut self, mp3: &[MaybeUninit<u8>], len: usize) -> Result<(), Error> {
        if len == 0 {
            return Ok(());
        }
        // SAFETY: the encoder initialized the first `len` bytes.
        let bytes = unsafe { std::slice::from_raw_parts(mp3.as_ptr() as *const u8, len) };
        self.sink.write_all(bytes)?;
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------

fn build_encoder(
    sample_rate: u32,
    metadata: Option<&HashMap<String, String>>,
) -> Result<Encoder, Error> {
    let mut builder =
        Builder::new().ok_or_else(|| Error::Encoder("failed to allocate LAME".to_string()))?;
    builder
        .set_num_channels(CHANNEL_COUNT as u8)
        .map_err(|err| Error::Encoder(format!("{:?}", err)))?;
    builder
        .set_sample_rate(sample_rate)
        .map_err(|err| Error::Encoder(format!("{:?}", err)))?;
    builder
        .set_brate(BITRATE)
        .map_err(|err| Error::Encoder(format!("{:?}", err)))?;
    builder
        .set_quality(Quality::Best)
        .map_err(|err| Error::Encoder(format!("{:?}", err)))?;
    if let Some(metadata) = metadata {
        let tag_field = |key: &str| {
            metadata
                .get(key)
                .map(|value| value.as_bytes())
                .unwrap_or_default()
        };
        builder.set_id3_tag(Id3Tag {
            title: tag_field("title"),
            artist: tag_field("artist"),
            album: tag_field("album"),
            year: tag_field("date"),
            comment: tag_field("comment"),
            album_art: &[],
        });
    }
    builder
        .build()
        .map_err(|err| Error::Encoder(format!("{:?}", err)))
}

// -------------------------------------------------------------------------------------------------

/// Open an ICY source-client connection: `SOURCE <mount>` with basic auth, answered with a
/// `200` status line, after which the socket takes raw MP3 data.
fn open_icy_connection(
    url_str: &str,
    metadata: &HashMap<String, String>,
) -> Result<TcpStream, Error> {
    let url = url::Url::parse(url_str).map_err(|err| Error::Http(err.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Http(format!("no host in '{}'", url_str)))?;
    let port = url.port().unwrap_or(8000);
    let mount = if url.path().is_empty() { "/" } else { url.path() };
    let user = if url.username().is_empty() {
        "source"
    } else {
        url.username()
    };
    let password = url.password().unwrap_or("");
    let credentials = BASE64.encode(format!("{}:{}", user, password));

    let address = format!("{}:{}", host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Http(format!("cannot resolve '{}'", host)))?;
    let mut stream = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(CONNECT_TIMEOUT))?;
    stream.set_write_timeout(Some(CONNECT_TIMEOUT))?;
    stream.set_nodelay(true)?;

    let name = metadata
        .get("title")
        .map(String::as_str)
        .unwrap_or("aircast");
    let request = format!(
        "SOURCE {mount} HTTP/1.0\r\n\
         Host: {host}:{port}\r\n\
         Authorization: Basic {credentials}\r\n\
         User-Agent: aircast\r\n\
         Content-Type: audio/mpeg\r\n\
         ice-name: {name}\r\n\
         ice-public: 0\r\n\
         \r\n"
    );
    stream.write_all(request.as_bytes())?;

    let mut response = [0u8; 1024];
    let count = stream.read(&mut response)?;
    let status = String::from_utf8_lossy(&response[..count]);
    let status_line = status.lines().next().unwrap_or("");
    if !status_line.contains(" 200 ") && !status_line.ends_with(" 200") {
        return Err(Error::Http(format!(
            "icy mount refused: '{}'",
            status_line
        )));
    }
    log::info!("CodecWriter connected to icy mount {}", mount);
    Ok(stream)
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rb::{RbProducer, SpscRb, RB};

    #[test]
    fn encodes_a_ring_to_an_mp3_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp3");

        let ring = SpscRb::<Sample>::new(SAMPLES_PER_BLOCK * 8);
        let producer = ring.producer();
        let consumer = ring.consumer();

        // two full blocks of a quiet ramp
        let pcm: Vec<Sample> = (0..SAMPLES_PER_BLOCK * 2)
            .map(|i| ((i % 128) * 64) as Sample)
            .collect();
        producer.write(&pcm).unwrap();

        let cancelled = AtomicBool::new(true); // drain-and-stop immediately
        let mut writer =
            CodecWriter::new(44100, path.to_str().unwrap(), &HashMap::new()).unwrap();
        writer.write(&consumer, &cancelled).unwrap();
        assert_eq!(writer.frames_written(), FRAMES_PER_BLOCK as u64 * 2);

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.len() > 1000, "{}", bytes.len());
        // MP3 frame sync or ID3 header at the start
        assert!(bytes[0] == 0xff || &bytes[..3] == b"ID3");
    }

    #[test]
    fn unresolvable_icy_host_fails() {
        let result = CodecWriter::new(
            44100,
            "http://source:pw@does-not-exist.invalid:8000/live",
            &HashMap::new(),
        );
        assert!(matches!(result, Err(Error::Http(_)) | Err(Error::IoError(_))));
    }
}
