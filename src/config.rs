//! Process configuration, parsed once at startup with `clap`.
//!
//! Generalizes the teacher's `discrivener-cli.rs` argument parsing
//! (a one-shot local test harness) into the long-running service's
//! boot configuration. Anything missing or unparsable here is the
//! "Unrecoverable" error kind from spec.md §7: we exit non-zero
//! before any worker starts.

use std::path::PathBuf;

use clap::Parser;

use crate::error::{DexterError, DexterResult};

#[derive(Debug, Clone, Parser)]
#[command(name = "dexter", version, about = "Discord voice + chat gateway")]
pub struct Args {
    /// Discord bot token.
    #[arg(long, env = "DEXTER_DISCORD_TOKEN")]
    pub discord_token: String,

    /// Address the HTTP surface (§6) binds to.
    #[arg(long, env = "DEXTER_HTTP_ADDR", default_value = "0.0.0.0:8733")]
    pub http_addr: String,

    /// Redis-compatible URL for the key-value store.
    #[arg(long, env = "DEXTER_KV_URL", default_value = "redis://127.0.0.1:6379")]
    pub kv_url: String,

    /// Base URL of the downstream event bus.
    #[arg(long, env = "DEXTER_EVENT_BUS_URL")]
    pub event_bus_url: String,

    /// Base URL of the chat-model streaming/engagement endpoint.
    #[arg(long, env = "DEXTER_CHAT_MODEL_BASE")]
    pub chat_model_base: String,

    /// Model name sent in chat-model requests.
    #[arg(long, env = "DEXTER_CHAT_MODEL_NAME", default_value = "default")]
    pub chat_model_name: String,

    /// Base URL of the TTS endpoint.
    #[arg(long, env = "DEXTER_TTS_BASE")]
    pub tts_base: String,

    /// Path to the out-of-process STT worker binary.
    #[arg(long, env = "DEXTER_STT_BINARY")]
    pub stt_binary: PathBuf,

    /// The configured "master user" the coordinator follows (§4.3).
    #[arg(long, env = "DEXTER_MASTER_USER_ID")]
    pub master_user_id: Option<u64>,

    /// Default voice channel to return to when the master leaves voice.
    #[arg(long, env = "DEXTER_DEFAULT_VOICE_CHANNEL_ID")]
    pub default_voice_channel_id: Option<u64>,

    /// Allowlisted caller-auth header values (§1, §7); repeatable.
    #[arg(long = "caller-auth-header", env = "DEXTER_CALLER_AUTH_HEADER", value_delimiter = ',')]
    pub caller_auth_headers: Vec<String>,

    /// Directory audio WAV files are written under (§6).
    #[arg(long, env = "DEXTER_AUDIO_DIR")]
    pub audio_dir: Option<PathBuf>,

    /// Default system role granted on member add when no higher-priority
    /// role is already present (§4.6).
    #[arg(long, env = "DEXTER_DEFAULT_SYSTEM_ROLE_ID")]
    pub default_system_role_id: Option<u64>,

    #[arg(long, value_enum, default_value = "pretty")]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Args {
    /// Resolve `audio_dir` to its default, per spec.md §6:
    /// `{tempdir}/dexter/audio/`.
    pub fn resolved_audio_dir(&self) -> PathBuf {
        self.audio_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("dexter").join("audio"))
    }

    /// Validate the parts `clap` can't: well-formed socket address,
    /// well-formed URLs. Anything that fails here is Unrecoverable (§7).
    pub fn validate(&self) -> DexterResult<()> {
        self.http_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| DexterError::Unrecoverable(format!("invalid --http-addr: {e}")))?;

        for (name, url) in [
            ("--event-bus-url", &self.event_bus_url),
            ("--chat-model-base", &self.chat_model_base),
            ("--tts-base", &self.tts_base),
        ] {
            reqwest::Url::parse(url)
                .map_err(|e| DexterError::Unrecoverable(format!("invalid {name}: {e}")))?;
        }

        if self.discord_token.trim().is_empty() {
            return Err(DexterError::Unrecoverable(
                "--discord-token must not be empty".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            discord_token: "token".into(),
            http_addr: "0.0.0.0:8733".into(),
            kv_url: "redis://127.0.0.1:6379".into(),
            event_bus_url: "http://localhost:9000".into(),
            chat_model_base: "http://localhost:9001".into(),
            chat_model_name: "default".into(),
            tts_base: "http://localhost:9002".into(),
            stt_binary: PathBuf::from("/usr/bin/true"),
            master_user_id: None,
            default_voice_channel_id: None,
            caller_auth_headers: vec![],
            audio_dir: None,
            default_system_role_id: None,
            log_format: LogFormat::Pretty,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_args().validate().is_ok());
    }

    #[test]
    fn bad_bind_address_is_unrecoverable() {
        let mut args = base_args();
        args.http_addr = "not-an-address".into();
        let err = args.validate().unwrap_err();
        assert!(matches!(err, DexterError::Unrecoverable(_)));
    }

    #[test]
    fn empty_token_is_unrecoverable() {
        let mut args = base_args();
        args.discord_token = "  ".into();
        assert!(args.validate().is_err());
    }

    #[test]
    fn default_audio_dir_matches_spec() {
        let args = base_args();
        let dir = args.resolved_audio_dir();
        assert!(dir.ends_with("dexter/audio"));
    }
}
