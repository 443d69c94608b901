//! Event bus client — §6.
//!
//! `POST {base}/events` with `{"service":"discord","event":<envelope>}`.
//! Transient-network errors are retried up to 3 times with ×2 backoff
//! (§7, §5 "Backpressure").

use serde::{Deserialize, Serialize};

use crate::error::{DexterError, DexterResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventEnvelope {
    #[serde(rename = "messaging.user.sent_message")]
    UserSentMessage(UserSentMessage),
    #[serde(rename = "messaging.user.joined_voice")]
    UserJoinedVoice(VoiceEvent),
    #[serde(rename = "messaging.user.left_voice")]
    UserLeftVoice(VoiceEvent),
    #[serde(rename = "messaging.user.transcribed")]
    UserTranscribed(UserTranscribed),
    #[serde(rename = "messaging.bot.status_update")]
    BotStatusUpdate(BotStatusUpdate),
    #[serde(rename = "messaging.bot.sent_message")]
    BotSentMessage(BotSentMessage),
    #[serde(rename = "bot.joined_voice")]
    BotJoinedVoice(VoiceEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCommon {
    pub source: String,
    pub user_id: Option<u64>,
    pub user_name: Option<String>,
    pub user_level: Option<String>,
    pub channel_id: Option<u64>,
    pub channel_name: Option<String>,
    pub server_id: Option<u64>,
    pub server_name: Option<String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSentMessage {
    #[serde(flatten)]
    pub common: EventCommon,
    pub message_id: u64,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceEvent {
    #[serde(flatten)]
    pub common: EventCommon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTranscribed {
    #[serde(flatten)]
    pub common: EventCommon,
    pub transcription: String,
    pub audio_duration_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotStatusUpdate {
    #[serde(flatten)]
    pub common: EventCommon,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotSentMessage {
    #[serde(flatten)]
    pub common: EventCommon,
    pub message_id: u64,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct EventBusRequest<'a> {
    service: &'static str,
    event: &'a EventEnvelope,
}

#[derive(Debug, Deserialize)]
pub struct RecentMessageEvent {
    pub channel_id: u64,
    pub message_id: u64,
    pub timestamp: u64,
}

const MAX_ATTEMPTS: u32 = 3;

pub struct EventBusClient {
    http: reqwest::Client,
    base_url: String,
}

impl EventBusClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// Publish an event, retrying transient failures up to 3 times
    /// with ×2 backoff (§5, §7).
    pub async fn publish(&self, event: &EventEnvelope) -> DexterResult<()> {
        let body = EventBusRequest {
            service: "discord",
            event,
        };
        let url = format!("{}/events", self.base_url);

        let mut delay = std::time::Duration::from_millis(200);
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.http.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    last_err = Some(anyhow::anyhow!("event bus returned {}", resp.status()));
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!(e));
                }
            }
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        Err(DexterError::transient(
            MAX_ATTEMPTS,
            last_err.unwrap_or_else(|| anyhow::anyhow!("unknown event bus failure")),
        ))
    }

    /// Fetch the most recent N `user.sent_message` events, for the
    /// catch-up replayer's watermark derivation (§4.5).
    pub async fn recent_sent_messages(
        &self,
        limit: usize,
    ) -> DexterResult<Vec<RecentMessageEvent>> {
        let url = format!(
            "{}/events?type=messaging.user.sent_message&limit={}",
            self.base_url, limit
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DexterError::transient(1, e))?;
        if !resp.status().is_success() {
            return Err(DexterError::ResourceUnavailable(format!(
                "event bus query failed: {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| DexterError::ResourceUnavailable(format!("bad event bus payload: {e}")))
    }
}
