//! Streaming PCM resampler that preserves capture attribution.
//!
//! Converts interleaved PCM16 between sample rates for a fixed channel count
//! while keeping each output chunk mapped onto the wall-clock span of the
//! input chunk that produced it. Providers consume audio at different rates
//! (16k for most, 24k for some), so every provider session that disagrees
//! with the client rate owns one of these.
//!
//! Rate conversion itself is delegated to `rubato`; this wrapper adds an
//! input FIFO (rubato wants fixed-size blocks) and the timestamp math.

use bytes::Bytes;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::audio::{f32_planar_to_pcm16, pcm16_to_f32_planar};
use crate::error::AudioError;

/// Fixed input block size fed to the inner resampler (frames per channel).
const RESAMPLE_BLOCK: usize = 1024;

/// Attribution metadata carried alongside each PCM chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkMeta {
    /// End-of-chunk capture timestamp (ms since epoch).
    pub capture_ts: f64,
    /// Chunk duration (ms).
    pub duration_ms: f64,
    /// Per-channel frame sequence number.
    pub seq: u32,
}

struct Inner {
    resampler: FastFixedIn<f32>,
    /// Pending planar input not yet forming a complete block.
    fifo: Vec<Vec<f32>>,
    /// End timestamp of the last emitted output chunk, for flush attribution.
    last_out_end_ts: f64,
    /// Output milliseconds per output frame from the last push.
    last_ms_per_frame: f64,
    last_seq: u32,
}

/// Streaming rate converter for one provider session.
///
/// When input and output rates match the resampler is a true pass-through:
/// chunks are forwarded unmodified with their metadata intact.
pub struct StreamResampler {
    from_hz: u32,
    to_hz: u32,
    channels: usize,
    inner: Option<Inner>,
}

impl StreamResampler {
    /// Creates a resampler from `from_hz` to `to_hz` for `channels` channels.
    pub fn new(from_hz: u32, to_hz: u32, channels: u16) -> Result<Self, AudioError> {
        let channels = channels as usize;
        let inner = if from_hz == to_hz {
            None
        } else {
            let ratio = to_hz as f64 / from_hz as f64;
            let resampler = FastFixedIn::<f32>::new(
                ratio,
                1.1,
                PolynomialDegree::Septic,
                RESAMPLE_BLOCK,
                channels,
            )
            .map_err(|e| AudioError::Resample(e.to_string()))?;
            Some(Inner {
                resampler,
                fifo: vec![Vec::new(); channels],
                last_out_end_ts: 0.0,
                last_ms_per_frame: 0.0,
                last_seq: 0,
            })
        };
        Ok(Self {
            from_hz,
            to_hz,
            channels,
            inner,
        })
    }

    /// Returns true when the resampler forwards chunks unchanged.
    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Feeds one input chunk, returning zero or more output chunks.
    ///
    /// Each output chunk's `capture_ts`/`duration_ms` are remapped onto the
    /// input chunk's wall-clock span: an output chunk of `S` frames out of an
    /// expected total `E = round(input_frames * to/from)` covers
    /// `S * duration_ms / E` milliseconds ending at
    /// `(capture_ts - duration_ms) + (sent + S) * duration_ms / E`.
    pub fn push(
        &mut self,
        chunk: Bytes,
        meta: ChunkMeta,
    ) -> Result<Vec<(Bytes, ChunkMeta)>, AudioError> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(vec![(chunk, meta)]);
        };

        let planar = pcm16_to_f32_planar(&chunk, self.channels);
        let input_frames = planar.first().map(Vec::len).unwrap_or(0);
        for (fifo, plane) in inner.fifo.iter_mut().zip(planar) {
            fifo.extend(plane);
        }

        let ratio = self.to_hz as f64 / self.from_hz as f64;
        let expected = ((input_frames as f64 * ratio).round() as usize).max(1);
        let ms_per_frame = meta.duration_ms / expected as f64;
        let start_ts = meta.capture_ts - meta.duration_ms;

        inner.last_ms_per_frame = ms_per_frame;
        inner.last_seq = meta.seq;

        let mut out = Vec::new();
        let mut sent = 0usize;
        while inner.fifo[0].len() >= RESAMPLE_BLOCK {
            let block: Vec<Vec<f32>> = inner
                .fifo
                .iter_mut()
                .map(|fifo| fifo.drain(..RESAMPLE_BLOCK).collect())
                .collect();
            let waves = inner
                .resampler
                .process(&block, None)
                .map_err(|e| AudioError::Resample(e.to_string()))?;

            let produced = waves.first().map(Vec::len).unwrap_or(0);
            if produced == 0 {
                continue;
            }
            let out_meta = ChunkMeta {
                capture_ts: start_ts + (sent + produced) as f64 * ms_per_frame,
                duration_ms: produced as f64 * ms_per_frame,
                seq: meta.seq,
            };
            sent += produced;
            inner.last_out_end_ts = out_meta.capture_ts;
            out.push((f32_planar_to_pcm16(&waves), out_meta));
        }

        Ok(out)
    }

    /// Drains any buffered input, producing a final output chunk.
    ///
    /// The tail is attributed as a continuation of the last emitted chunk.
    pub fn flush(&mut self) -> Result<Option<(Bytes, ChunkMeta)>, AudioError> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(None);
        };
        if inner.fifo[0].is_empty() {
            return Ok(None);
        }

        let block: Vec<Vec<f32>> = inner.fifo.iter_mut().map(std::mem::take).collect();
        let waves = inner
            .resampler
            .process_partial(Some(&block), None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;

        let produced = waves.first().map(Vec::len).unwrap_or(0);
        if produced == 0 {
            return Ok(None);
        }
        let duration_ms = produced as f64 * inner.last_ms_per_frame;
        let meta = ChunkMeta {
            capture_ts: inner.last_out_end_ts + duration_ms,
            duration_ms,
            seq: inner.last_seq,
        };
        inner.last_out_end_ts = meta.capture_ts;
        Ok(Some((f32_planar_to_pcm16(&waves), meta)))
    }
}

/// One-shot conversion of a whole PCM16 buffer between rates.
///
/// Batch fan-out uses this to re-rate the shared prepared buffer for each
/// provider. Pass-through returns the input untouched.
pub fn resample_buffer(
    pcm: Bytes,
    from_hz: u32,
    to_hz: u32,
    channels: u16,
) -> Result<Bytes, AudioError> {
    if from_hz == to_hz {
        return Ok(pcm);
    }
    let mut resampler = StreamResampler::new(from_hz, to_hz, channels)?;
    let frames = pcm.len() / (2 * channels as usize);
    let duration_ms = frames as f64 * 1000.0 / from_hz as f64;
    let meta = ChunkMeta {
        capture_ts: duration_ms,
        duration_ms,
        seq: 0,
    };

    let mut out = Vec::new();
    for (chunk, _) in resampler.push(pcm, meta)? {
        out.extend_from_slice(&chunk);
    }
    if let Some((chunk, _)) = resampler.flush()? {
        out.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(out))
}
