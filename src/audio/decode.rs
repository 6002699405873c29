//! Inbound audio decoding.
//!
//! Model audio normally arrives as raw little-endian i16 PCM tagged
//! `audio/pcm;rate=24000`. Anything else with an `audio/*` MIME type is
//! treated as a container (WAV, MP3) and decoded via Symphonia.

use super::pcm::{le_bytes_to_f32, InboundAudio, PLAYBACK_SAMPLE_RATE};
use crate::error::{VoiceError, VoiceResult};

/// Mono f32 samples ready for the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Parsed form of a MIME descriptor such as `audio/pcm;rate=24000`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioMime {
    pub essence: String,
    pub rate: Option<u32>,
}

impl AudioMime {
    pub fn parse(mime: &str) -> Self {
        let mut parts = mime.split(';');
        let essence = parts
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let rate = parts.find_map(|param| {
            let (key, value) = param.split_once('=')?;
            if key.trim().eq_ignore_ascii_case("rate") {
                value.trim().parse().ok()
            } else {
                None
            }
        });
        Self { essence, rate }
    }

    /// Raw sample data with no container.
    pub fn is_raw_pcm(&self) -> bool {
        matches!(self.essence.as_str(), "audio/pcm" | "audio/l16" | "")
    }

    /// File-extension hint for the container probe.
    fn extension_hint(&self) -> Option<&'static str> {
        match self.essence.as_str() {
            "audio/mpeg" | "audio/mp3" => Some("mp3"),
            "audio/wav" | "audio/x-wav" | "audio/wave" => Some("wav"),
            _ => None,
        }
    }
}

/// Decode one inbound frame to mono f32.
pub fn decode_inbound(frame: &InboundAudio) -> VoiceResult<DecodedAudio> {
    if frame.data.is_empty() {
        return Err(VoiceError::Decode("empty audio frame".into()));
    }
    let mime = AudioMime::parse(&frame.mime_type);
    if mime.is_raw_pcm() {
        let samples = le_bytes_to_f32(&frame.data).ok_or_else(|| {
            VoiceError::Decode(format!(
                "PCM payload has odd length {} bytes",
                frame.data.len()
            ))
        })?;
        return Ok(DecodedAudio {
            samples,
            sample_rate: mime.rate.unwrap_or(PLAYBACK_SAMPLE_RATE),
        });
    }
    if !mime.essence.starts_with("audio/") {
        return Err(VoiceError::Decode(format!(
            "unsupported MIME type: {}",
            frame.mime_type
        )));
    }
    decode_container(&frame.data, mime.extension_hint())
}

/// Decode container-wrapped audio bytes to mono f32 using Symphonia.
fn decode_container(bytes: &[u8], extension: Option<&str>) -> VoiceResult<DecodedAudio> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    // MediaSourceStream needs an owned, 'static source.
    let cursor = std::io::Cursor::new(bytes.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| VoiceError::Decode(format!("container probe failed: {}", e)))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| VoiceError::Decode("no audio track in container".into()))?;
    let track_id = track.id;
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count())
        .unwrap_or(1);
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(PLAYBACK_SAMPLE_RATE);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| VoiceError::Decode(format!("decoder init failed: {}", e)))?;

    let mut all_samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(symphonia::core::errors::Error::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => {
                return Err(VoiceError::Decode(format!("container read error: {}", e)));
            }
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Packet decode error (skipping): {}", e);
                continue;
            }
        };
        let spec = *decoded.spec();
        sample_rate = spec.rate;
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        let samples = sample_buf.samples();

        if channels <= 1 {
            all_samples.extend_from_slice(samples);
        } else {
            for chunk in samples.chunks(channels) {
                let sum: f32 = chunk.iter().sum();
                all_samples.push(sum / channels as f32);
            }
        }
    }

    if all_samples.is_empty() {
        return Err(VoiceError::Decode("container held no samples".into()));
    }

    Ok(DecodedAudio {
        samples: all_samples,
        sample_rate,
    })
}
