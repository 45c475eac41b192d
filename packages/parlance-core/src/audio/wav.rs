//! Minimal WAV read/write for PCM16 files.
//!
//! The batch pipeline stores prepared audio as plain PCM16 WAV. Inputs that
//! already match the target format short-circuit the codec process entirely.

use bytes::{BufMut, Bytes, BytesMut};

use crate::audio::AudioFormat;
use crate::error::AudioError;

/// Generates a standard 44-byte WAVE header for a PCM16 payload of
/// `data_len` bytes.
pub fn create_wav_header(format: AudioFormat, data_len: u32) -> Bytes {
    let mut header = BytesMut::with_capacity(44);

    let byte_rate = format.sample_rate * format.channels as u32 * 2;
    let block_align = format.channels * 2;

    // RIFF header
    header.put_slice(b"RIFF");
    header.put_u32_le(36 + data_len);
    header.put_slice(b"WAVE");

    // fmt chunk
    header.put_slice(b"fmt ");
    header.put_u32_le(16); // Chunk size
    header.put_u16_le(1); // Audio format (PCM)
    header.put_u16_le(format.channels);
    header.put_u32_le(format.sample_rate);
    header.put_u32_le(byte_rate);
    header.put_u16_le(block_align);
    header.put_u16_le(16);

    // data chunk
    header.put_slice(b"data");
    header.put_u32_le(data_len);

    header.freeze()
}

/// Writes a complete PCM16 WAV file.
pub fn write_wav(format: AudioFormat, pcm: &[u8]) -> Bytes {
    let header = create_wav_header(format, pcm.len() as u32);
    let mut file = BytesMut::with_capacity(header.len() + pcm.len());
    file.put_slice(&header);
    file.put_slice(pcm);
    file.freeze()
}

/// Parses a PCM16 WAV file, returning its format and the PCM payload range.
///
/// Only canonical PCM16 files are accepted; anything else (compressed
/// formats, exotic chunk layouts beyond fmt/data with optional extras) is an
/// [`AudioError::InvalidFrame`]-class failure for the caller to route through
/// the codec process instead.
pub fn parse_wav(data: &[u8]) -> Result<(AudioFormat, std::ops::Range<usize>), AudioError> {
    let invalid = || AudioError::InvalidFrame { len: data.len() };

    if data.len() < 44 || &data[0..4] != b"RIFF" || &data[8..12] != b"WAVE" {
        return Err(invalid());
    }

    let mut offset = 12;
    let mut format: Option<AudioFormat> = None;
    while offset + 8 <= data.len() {
        let chunk_id = &data[offset..offset + 4];
        let chunk_len = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]) as usize;
        let body = offset + 8;

        match chunk_id {
            b"fmt " => {
                if body + 16 > data.len() {
                    return Err(invalid());
                }
                let audio_format = u16::from_le_bytes([data[body], data[body + 1]]);
                let channels = u16::from_le_bytes([data[body + 2], data[body + 3]]);
                let sample_rate = u32::from_le_bytes([
                    data[body + 4],
                    data[body + 5],
                    data[body + 6],
                    data[body + 7],
                ]);
                let bits = u16::from_le_bytes([data[body + 14], data[body + 15]]);
                if audio_format != 1 || bits != 16 || channels == 0 {
                    return Err(invalid());
                }
                format = Some(AudioFormat::new(sample_rate, channels));
            }
            b"data" => {
                let format = format.ok_or_else(invalid)?;
                let end = (body + chunk_len).min(data.len());
                return Ok((format, body..end));
            }
            _ => {}
        }
        // Chunks are word-aligned.
        offset = body + chunk_len + (chunk_len & 1);
    }
    Err(invalid())
}
