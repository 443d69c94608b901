//! STT worker adapter — §6.
//!
//! Invoked out-of-process as `<binary> transcribe -k <redisKey>`,
//! producing line-delimited JSON on stdout with at least
//! `original_transcription` and an optional `error`. An empty
//! transcription is silently dropped (§6, §7 "A failed transcription
//! is silently dropped").

use std::path::Path;

use serde::Deserialize;
use tokio::process::Command;

use crate::error::{DexterError, DexterResult};

#[derive(Debug, Deserialize)]
struct SttLine {
    original_transcription: String,
    #[serde(default)]
    error: Option<String>,
}

pub struct SttWorker {
    binary: std::path::PathBuf,
}

impl SttWorker {
    pub fn new(binary: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
        }
    }

    /// Run the worker against the given key-value store key, returning
    /// `None` if the worker reports an error or the transcription is
    /// empty — both are "silently dropped" outcomes per §6/§7, not
    /// surfaced as events.
    pub async fn transcribe(&self, redis_key: &str) -> DexterResult<Option<String>> {
        let output = Command::new(&self.binary)
            .arg("transcribe")
            .arg("-k")
            .arg(redis_key)
            .output()
            .await
            .map_err(|e| {
                DexterError::ResourceUnavailable(format!("failed to spawn stt worker: {e}"))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let parsed: SttLine = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(line, error = %e, "stt worker emitted unparsable line");
                    continue;
                }
            };
            if let Some(err) = parsed.error {
                tracing::warn!(redis_key, error = %err, "stt worker reported an error");
                return Ok(None);
            }
            if parsed.original_transcription.trim().is_empty() {
                return Ok(None);
            }
            return Ok(Some(parsed.original_transcription));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_successful_line() {
        let line: SttLine =
            serde_json::from_str(r#"{"original_transcription":"hello there"}"#).unwrap();
        assert_eq!(line.original_transcription, "hello there");
        assert!(line.error.is_none());
    }

    #[test]
    fn parses_an_error_line() {
        let line: SttLine =
            serde_json::from_str(r#"{"original_transcription":"","error":"model busy"}"#)
                .unwrap();
        assert_eq!(line.error.as_deref(), Some("model busy"));
    }
}
