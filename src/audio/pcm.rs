//! PCM sample conversion: downmix, resample, quantize and frame types.

/// Capture rate expected by the remote endpoint.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Assumed rate for inbound PCM when the MIME type carries no `rate=`.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Samples per outgoing frame (128 ms at 16 kHz). Constant for a session.
pub const FRAME_SAMPLES: usize = 2048;

/// One fixed-size block of captured microphone audio, mono i16 at
/// [`CAPTURE_SAMPLE_RATE`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self {
            samples,
            sample_rate: CAPTURE_SAMPLE_RATE,
        }
    }

    /// MIME descriptor sent alongside the payload.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Little-endian byte payload.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }
}

/// Encoded audio received from the model, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundAudio {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl InboundAudio {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }
}

/// Quantize one float sample to i16. Out-of-range input saturates at the
/// i16 limits instead of wrapping.
pub fn f32_to_i16(sample: f32) -> i16 {
    let clamped = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    (clamped * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

/// Inverse of [`f32_to_i16`], scaling by 1/32768.
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

pub fn quantize(samples: &[f32]) -> Vec<i16> {
    samples.iter().copied().map(f32_to_i16).collect()
}

pub fn dequantize(samples: &[i16]) -> Vec<f32> {
    samples.iter().copied().map(i16_to_f32).collect()
}

/// Interpret little-endian i16 bytes as float samples. Returns `None` when
/// the byte count is odd.
pub fn le_bytes_to_f32(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(2)
            .map(|pair| i16_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
            .collect(),
    )
}

/// Simple linear resampler from `from_rate` to `to_rate`.
/// Operates on mono f32 samples.
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_idx = i as f64 * ratio;
        let idx0 = src_idx.floor() as usize;
        let frac = (src_idx - idx0 as f64) as f32;
        let s0 = input.get(idx0).copied().unwrap_or(0.0);
        let s1 = input.get(idx0 + 1).copied().unwrap_or(s0);
        output.push(s0 + frac * (s1 - s0));
    }
    output
}

/// Down-mix interleaved multi-channel audio to mono by averaging channels.
pub fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Collects resampled mono samples and cuts them into fixed-size frames.
#[derive(Debug)]
pub struct FrameAccumulator {
    frame_len: usize,
    pending: Vec<f32>,
}

impl FrameAccumulator {
    pub fn new(frame_len: usize) -> Self {
        Self {
            frame_len,
            pending: Vec::with_capacity(frame_len * 2),
        }
    }

    /// Append samples and return every frame that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_len {
            let chunk: Vec<f32> = self.pending.drain(..self.frame_len).collect();
            frames.push(AudioFrame::new(quantize(&chunk)));
        }
        frames
    }
}
