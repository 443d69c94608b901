//! C5 — Catch-up Replayer. §4.5, §8.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::event_bus::{EventBusClient, EventCommon, EventEnvelope, UserSentMessage};
use crate::error::DexterResult;
use crate::types::{ChannelId, MessageId, UserId, CATCHUP_DEDUP_EVENTS, CATCHUP_WATERMARK_EVENTS};

/// One platform message, as handed back by the history query (§4.5
/// "request platform history strictly after that watermark").
#[derive(Debug, Clone)]
pub struct PlatformMessage {
    pub id: MessageId,
    pub author_id: UserId,
    pub author_is_bot: bool,
    pub content: String,
    pub timestamp: u64,
    pub author_name: String,
    pub channel_name: String,
    pub server_id: u64,
    pub server_name: String,
}

/// Platform history lookups, implemented against serenity's
/// `ChannelId::messages` in `crate::gateway::handler`.
#[async_trait]
pub trait ChatHistoryProvider: Send + Sync {
    /// Messages in `channel` strictly after `after`, in whatever order
    /// the platform returns them; the replayer sorts ascending itself.
    async fn fetch_after(&self, channel: ChannelId, after: MessageId) -> DexterResult<Vec<PlatformMessage>>;
}

/// C5 — one per process, run once per gateway resume (§4.5).
pub struct CatchupReplayer<H: ChatHistoryProvider> {
    event_bus: Arc<EventBusClient>,
    history: H,
}

impl<H: ChatHistoryProvider> CatchupReplayer<H> {
    pub fn new(event_bus: Arc<EventBusClient>, history: H) -> Self {
        Self { event_bus, history }
    }

    /// Returns the number of `user.sent_message` events emitted.
    pub async fn run(&self) -> DexterResult<usize> {
        let watermark_events = self.event_bus.recent_sent_messages(CATCHUP_WATERMARK_EVENTS).await?;
        if watermark_events.is_empty() {
            // §4.5 "If the watermark cannot be determined, abort — a
            // safe default of 'one hour ago' is not used because it
            // would cause duplicates."
            tracing::warn!("no prior sent_message events found, aborting catch-up replay");
            return Ok(0);
        }

        let mut watermark: HashMap<ChannelId, MessageId> = HashMap::new();
        for event in &watermark_events {
            watermark
                .entry(event.channel_id)
                .and_modify(|cur| *cur = (*cur).max(event.message_id))
                .or_insert(event.message_id);
        }

        let dedup_events = self.event_bus.recent_sent_messages(CATCHUP_DEDUP_EVENTS).await?;
        let dedup: HashSet<MessageId> = dedup_events.iter().map(|e| e.message_id).collect();

        let mut emitted = 0;
        for (channel, after) in watermark {
            let mut messages = match self.history.fetch_after(channel, after).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(channel, error = %e, "failed to fetch catch-up history for channel");
                    continue;
                }
            };
            messages.sort_by_key(|m| m.id);

            for message in messages {
                if message.author_is_bot {
                    continue;
                }
                if dedup.contains(&message.id) {
                    continue;
                }
                let event = EventEnvelope::UserSentMessage(UserSentMessage {
                    common: EventCommon {
                        source: "discord".into(),
                        user_id: Some(message.author_id),
                        user_name: Some(message.author_name),
                        user_level: None,
                        channel_id: Some(channel),
                        channel_name: Some(message.channel_name),
                        server_id: Some(message.server_id),
                        server_name: Some(message.server_name),
                        timestamp: message.timestamp,
                    },
                    message_id: message.id,
                    content: message.content,
                });
                self.event_bus.publish(&event).await?;
                emitted += 1;
            }
        }
        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeHistory {
        by_channel: Mutex<HashMap<ChannelId, Vec<PlatformMessage>>>,
    }

    #[async_trait]
    impl ChatHistoryProvider for FakeHistory {
        async fn fetch_after(&self, channel: ChannelId, after: MessageId) -> DexterResult<Vec<PlatformMessage>> {
            Ok(self
                .by_channel
                .lock()
                .unwrap()
                .get(&channel)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|m| m.id > after)
                .collect())
        }
    }

    fn msg(id: u64, content: &str) -> PlatformMessage {
        PlatformMessage {
            id,
            author_id: 1,
            author_is_bot: false,
            content: content.to_string(),
            timestamp: id,
            author_name: "alice".into(),
            channel_name: "general".into(),
            server_id: 9,
            server_name: "guild".into(),
        }
    }

    #[tokio::test]
    async fn unreachable_event_bus_never_falls_back_to_a_guessed_watermark() {
        let event_bus = Arc::new(EventBusClient::new(reqwest::Client::new(), "http://127.0.0.1:1"));
        let history = FakeHistory { by_channel: Mutex::new(HashMap::new()) };
        let replayer = CatchupReplayer::new(event_bus, history);
        // Either a transient error or zero emissions is acceptable; what
        // must never happen is silently assuming "one hour ago" (§4.5).
        match replayer.run().await {
            Ok(count) => assert_eq!(count, 0),
            Err(_) => {}
        }
    }

    #[test]
    fn dedup_skips_known_message_ids() {
        let seen: HashSet<MessageId> = [1, 2, 3].into_iter().collect();
        let incoming = vec![msg(2, "dup"), msg(4, "new")];
        let fresh: Vec<_> = incoming.into_iter().filter(|m| !seen.contains(&m.id)).collect();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].id, 4);
    }
}
