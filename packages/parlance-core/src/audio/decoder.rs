//! Audio codec facade over an external ffmpeg process.
//!
//! Decodes arbitrary containers to 16-bit little-endian PCM at a target
//! sample rate and channel count. Two shapes:
//!
//! - [`CodecStream`]: long-lived child fed from the socket (or a file for
//!   replay), with PCM read back in fixed-interval chunks.
//! - [`decode_file_to_pcm`]: one-shot full decode for the batch pipeline.
//!
//! The child's stderr is forwarded to the host logger and never parsed for
//! control flow. A non-zero exit surfaces as [`AudioError::CodecExit`] to
//! the owning session.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

use crate::audio::AudioFormat;
use crate::error::AudioError;

/// Where the codec process takes its input from.
#[derive(Debug, Clone)]
pub enum CodecInput {
    /// Container bytes are written in via [`CodecStream::write`].
    Stdin,
    /// The process reads the file itself (replay path).
    File(PathBuf),
}

/// Handle to a live codec child process.
///
/// Owned by the session; dropping it kills the child.
pub struct CodecProcess {
    child: Child,
}

/// A streaming decode: write container bytes in, read PCM chunks out.
pub struct CodecStream {
    stdin: Option<ChildStdin>,
    chunks: mpsc::Receiver<Result<Bytes, AudioError>>,
    process: CodecProcess,
}

impl CodecStream {
    /// Spawns ffmpeg decoding `input` to PCM16 in `format`.
    ///
    /// `realtime` throttles the decode to input-native speed (`-re`), which
    /// is what replay sessions use to simulate a live microphone.
    pub fn spawn(
        input: CodecInput,
        format: AudioFormat,
        chunk_ms: u32,
        realtime: bool,
    ) -> Result<Self, AudioError> {
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner").arg("-loglevel").arg("warning");
        if realtime {
            cmd.arg("-re");
        }
        match &input {
            CodecInput::Stdin => cmd.arg("-i").arg("pipe:0"),
            CodecInput::File(path) => cmd.arg("-i").arg(path),
        };
        cmd.arg("-f")
            .arg("s16le")
            .arg("-ac")
            .arg(format.channels.to_string())
            .arg("-ar")
            .arg(format.sample_rate.to_string())
            .arg("pipe:1")
            .stdin(match input {
                CodecInput::Stdin => Stdio::piped(),
                CodecInput::File(_) => Stdio::null(),
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(AudioError::CodecSpawn)?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Forward codec diagnostics to the host logger; never parse them.
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("[Codec] {}", line);
                }
            });
        }

        let (tx, rx) = mpsc::channel(16);
        let chunk_bytes = format.frame_bytes(chunk_ms).max(2);
        if let Some(stdout) = stdout {
            tokio::spawn(read_pcm_chunks(stdout, chunk_bytes, tx));
        }

        Ok(Self {
            stdin,
            chunks: rx,
            process: CodecProcess { child },
        })
    }

    /// Writes container bytes to the codec, awaiting pipe drain.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), AudioError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| AudioError::CodecPipe(std::io::Error::other("stdin closed")))?;
        stdin.write_all(data).await.map_err(AudioError::CodecPipe)?;
        stdin.flush().await.map_err(AudioError::CodecPipe)
    }

    /// Closes the codec's input, letting it flush and exit.
    pub fn end_input(&mut self) {
        self.stdin.take();
    }

    /// Receives the next PCM chunk, `None` at end of stream.
    ///
    /// The final chunk may be shorter than the configured interval. A codec
    /// failure is delivered in-band as the last item.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, AudioError>> {
        match self.chunks.recv().await {
            Some(item) => Some(item),
            None => match self.wait_exit().await {
                Ok(()) => None,
                Err(e) => Some(Err(e)),
            },
        }
    }

    async fn wait_exit(&mut self) -> Result<(), AudioError> {
        let status = self
            .process
            .child
            .wait()
            .await
            .map_err(AudioError::CodecPipe)?;
        if status.success() {
            Ok(())
        } else {
            Err(AudioError::CodecExit {
                status: status.code().unwrap_or(-1),
            })
        }
    }
}

/// Reads the codec's PCM output into `chunk_bytes`-sized chunks.
async fn read_pcm_chunks(
    mut stdout: tokio::process::ChildStdout,
    chunk_bytes: usize,
    tx: mpsc::Sender<Result<Bytes, AudioError>>,
) {
    let mut buf = vec![0u8; chunk_bytes];
    let mut filled = 0usize;
    loop {
        match stdout.read(&mut buf[filled..]).await {
            Ok(0) => {
                if filled > 0 && tx.send(Ok(Bytes::copy_from_slice(&buf[..filled]))).await.is_err() {
                    return;
                }
                return;
            }
            Ok(n) => {
                filled += n;
                if filled == chunk_bytes {
                    if tx.send(Ok(Bytes::copy_from_slice(&buf))).await.is_err() {
                        return;
                    }
                    filled = 0;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(AudioError::CodecPipe(e))).await;
                return;
            }
        }
    }
}

/// Decodes a whole file to PCM16 at the target rate, returning the samples.
///
/// Used by the batch pipeline's prepare-once stage. The decoded byte count
/// also yields the audio duration.
pub async fn decode_file_to_pcm(
    path: &Path,
    format: AudioFormat,
) -> Result<Bytes, AudioError> {
    let output = Command::new("ffmpeg")
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("warning")
        .arg("-i")
        .arg(path)
        .arg("-f")
        .arg("s16le")
        .arg("-ac")
        .arg(format.channels.to_string())
        .arg("-ar")
        .arg(format.sample_rate.to_string())
        .arg("pipe:1")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(AudioError::CodecSpawn)?;

    for line in String::from_utf8_lossy(&output.stderr).lines() {
        log::debug!("[Codec] {}", line);
    }

    if !output.status.success() {
        return Err(AudioError::CodecExit {
            status: output.status.code().unwrap_or(-1),
        });
    }
    if output.stdout.is_empty() {
        return Err(AudioError::DurationUnknown(path.display().to_string()));
    }
    Ok(Bytes::from(output.stdout))
}
