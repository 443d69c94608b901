//! TTS adapter — §6.
//!
//! `POST /generate` with `{"text": <utf-8>}` returns an encoded audio
//! stream, which is transcoded through `ffmpeg` to raw 48kHz stereo
//! 16-bit PCM and handed to the Mixer's voice lane via
//! [`crate::voice::mixer::Mixer::stream_voice`].

use std::process::Stdio;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::error::{DexterError, DexterResult};

#[derive(Serialize)]
struct GenerateRequest<'a> {
    text: &'a str,
}

pub struct TtsClient {
    http: reqwest::Client,
    base_url: String,
}

impl TtsClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// Synthesize `text` and return raw little-endian 16-bit stereo
    /// PCM at 48kHz, ready for [`crate::voice::mixer::Mixer::stream_voice`].
    pub async fn synthesize_to_pcm(&self, text: &str) -> DexterResult<Vec<u8>> {
        let url = format!("{}/generate", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&GenerateRequest { text })
            .send()
            .await
            .map_err(|e| DexterError::transient(1, e))?;

        if !resp.status().is_success() {
            return Err(DexterError::ResourceUnavailable(format!(
                "tts endpoint returned {}",
                resp.status()
            )));
        }

        let encoded = resp
            .bytes()
            .await
            .map_err(|e| DexterError::ResourceUnavailable(format!("tts body read failed: {e}")))?;

        transcode_to_pcm(&encoded).await
    }
}

/// Pipes arbitrary audio bytes through `ffmpeg -i pipe:0 -f s16le -ar
/// 48000 -ac 2 pipe:1`, the exact transcode step named in §6.
async fn transcode_to_pcm(input: &[u8]) -> DexterResult<Vec<u8>> {
    let mut child = Command::new("ffmpeg")
        .args([
            "-loglevel", "error", "-i", "pipe:0", "-f", "s16le", "-ar", "48000", "-ac", "2",
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| DexterError::ResourceUnavailable(format!("failed to spawn ffmpeg: {e}")))?;

    let mut stdin = child.stdin.take().expect("piped stdin");
    let mut stdout = child.stdout.take().expect("piped stdout");
    let input = input.to_vec();

    let writer = tokio::spawn(async move {
        let _ = stdin.write_all(&input).await;
        drop(stdin);
    });

    let mut pcm = Vec::new();
    stdout
        .read_to_end(&mut pcm)
        .await
        .map_err(|e| DexterError::ResourceUnavailable(format!("ffmpeg read failed: {e}")))?;

    let _ = writer.await;
    let status = child
        .wait()
        .await
        .map_err(|e| DexterError::ResourceUnavailable(format!("ffmpeg wait failed: {e}")))?;

    if !status.success() {
        return Err(DexterError::ResourceUnavailable(format!(
            "ffmpeg exited with {status}"
        )));
    }
    Ok(pcm)
}
