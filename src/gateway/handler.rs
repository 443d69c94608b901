//! L2 — Gateway Session event fan-out, plus the thin serenity-backed
//! adapters the chat/voice components need (`ChatPoster`, `RoleAdmin`,
//! `ChatHistoryProvider`). One `Handler` per process, constructed in
//! `main.rs` and handed to the `serenity::Client` builder, the same
//! one-struct-implements-`EventHandler` shape every corpus bot uses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serenity::http::Http;
use serenity::model::channel::Message;
use serenity::model::event::ResumedEvent;
use serenity::model::gateway::Ready;
use serenity::model::guild::Member;
use serenity::model::id::{ChannelId as SerenityChannelId, GuildId as SerenityGuildId, RoleId as SerenityRoleId};
use serenity::model::voice::VoiceState;
use serenity::prelude::{Context, EventHandler};
use tokio::sync::RwLock;

use crate::adapters::chat_model::ChatMessage;
use crate::adapters::event_bus::{EventBusClient, EventCommon, EventEnvelope, UserSentMessage};
use crate::chat::catchup::{CatchupReplayer, ChatHistoryProvider, PlatformMessage};
use crate::chat::engine::ChatEngine;
use crate::chat::roles::{RoleAdmin, RoleEnforcer};
use crate::chat::streaming_editor::ChatPoster;
use crate::error::{DexterError, DexterResult};
use crate::types::{ChannelId, GuildId, MessageId, RoleId, UserId};
use crate::voice::coordinator::VoiceCoordinator;

/// Discord's well-known "Unknown Message" JSON error code (§7, §9
/// "Platform-code-specific error branches").
const UNKNOWN_MESSAGE_CODE: isize = 10008;
/// "Missing Permissions" (§4.6, §7).
const MISSING_PERMISSIONS_CODE: isize = 50013;

/// Presence/typing/posting surface used by the HTTP layer (§10.5), kept
/// separate from the voice/chat adapters below because it needs a live
/// `Context` (for presence, which is a gateway op, not a REST call),
/// not just an `Http` handle.
pub struct GatewayHandle {
    http: Arc<Http>,
    ctx: RwLock<Option<Context>>,
}

impl GatewayHandle {
    pub fn new(http: Arc<Http>) -> Arc<Self> {
        Arc::new(Self {
            http,
            ctx: RwLock::new(None),
        })
    }

    async fn set_context(&self, ctx: Context) {
        *self.ctx.write().await = Some(ctx);
    }

    pub async fn post_text(&self, channel: ChannelId, content: &str) -> DexterResult<MessageId> {
        SerenityChannelId(channel)
            .say(&self.http, content)
            .await
            .map(|m| m.id.0)
            .map_err(map_http_error)
    }

    pub async fn broadcast_typing(&self, channel: ChannelId) -> DexterResult<()> {
        SerenityChannelId(channel)
            .broadcast_typing(&self.http)
            .await
            .map_err(map_http_error)
    }

    pub async fn set_presence(&self, status_text: &str) -> DexterResult<()> {
        let guard = self.ctx.read().await;
        let Some(ctx) = guard.as_ref() else {
            return Err(DexterError::ResourceUnavailable("gateway not connected yet".into()));
        };
        ctx.set_presence(
            Some(serenity::model::gateway::Activity::playing(status_text)),
            serenity::model::user::OnlineStatus::Online,
        )
        .await;
        Ok(())
    }
}

/// Adapts serenity's REST client to the Streaming Editor's `ChatPoster`
/// contract (§4.4, §7 "Deleted-target").
pub struct DiscordChatPoster {
    http: Arc<Http>,
}

impl DiscordChatPoster {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChatPoster for DiscordChatPoster {
    async fn post(&self, channel: ChannelId, content: &str) -> DexterResult<MessageId> {
        SerenityChannelId(channel)
            .say(&self.http, content)
            .await
            .map(|m| m.id.0)
            .map_err(map_http_error)
    }

    async fn edit(&self, channel: ChannelId, message: MessageId, content: &str) -> DexterResult<()> {
        SerenityChannelId(channel)
            .edit_message(&self.http, message, |m| m.content(content))
            .await
            .map(|_| ())
            .map_err(map_http_error)
    }
}

/// Adapts serenity's role APIs to the Role Enforcer's `RoleAdmin`
/// contract (§4.6).
pub struct DiscordRoleAdmin {
    http: Arc<Http>,
}

impl DiscordRoleAdmin {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl RoleAdmin for DiscordRoleAdmin {
    async fn guild_roles(&self, guild: GuildId) -> DexterResult<Vec<(RoleId, String)>> {
        let roles = SerenityGuildId(guild)
            .roles(&self.http)
            .await
            .map_err(map_http_error)?;
        Ok(roles.into_values().map(|r| (r.id.0, r.name)).collect())
    }

    async fn member_roles(&self, guild: GuildId, user: UserId) -> DexterResult<Vec<RoleId>> {
        let member = SerenityGuildId(guild)
            .member(&self.http, user)
            .await
            .map_err(map_http_error)?;
        Ok(member.roles.into_iter().map(|r| r.0).collect())
    }

    async fn add_role(&self, guild: GuildId, user: UserId, role: RoleId) -> DexterResult<()> {
        self.http
            .add_member_role(guild, user, role, None)
            .await
            .map_err(map_http_error)
    }

    async fn remove_role(&self, guild: GuildId, user: UserId, role: RoleId) -> DexterResult<()> {
        self.http
            .remove_member_role(guild, user, role, None)
            .await
            .map_err(map_http_error)
    }
}

/// Adapts serenity's message-history REST call to the Catch-up
/// Replayer's `ChatHistoryProvider` contract (§4.5).
pub struct DiscordHistoryProvider {
    http: Arc<Http>,
}

impl DiscordHistoryProvider {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChatHistoryProvider for DiscordHistoryProvider {
    async fn fetch_after(&self, channel: ChannelId, after: MessageId) -> DexterResult<Vec<PlatformMessage>> {
        let messages = SerenityChannelId(channel)
            .messages(&self.http, |builder| builder.after(after).limit(100))
            .await
            .map_err(map_http_error)?;

        Ok(messages
            .into_iter()
            .map(|m| PlatformMessage {
                id: m.id.0,
                author_id: m.author.id.0,
                author_is_bot: m.author.bot,
                content: m.content,
                timestamp: m.timestamp.unix_timestamp() as u64,
                author_name: m.author.name,
                channel_name: String::new(),
                server_id: m.guild_id.map(|g| g.0).unwrap_or_default(),
                server_name: String::new(),
            })
            .collect())
    }
}

fn map_http_error(err: serenity::Error) -> DexterError {
    if let serenity::Error::Http(http_err) = &err {
        if let serenity::http::HttpError::UnsuccessfulRequest(resp) = http_err.as_ref() {
            if resp.error.code == UNKNOWN_MESSAGE_CODE {
                return DexterError::DeletedTarget(resp.error.message.clone());
            }
            if resp.error.code == MISSING_PERMISSIONS_CODE {
                return DexterError::PermissionDenied(resp.error.message.clone());
            }
        }
    }
    DexterError::transient(1, anyhow::anyhow!(err))
}

/// The serenity `EventHandler`. Holds everything the gateway fans
/// events out to; constructed once in `main.rs`.
pub struct Handler {
    pub coordinator: Arc<VoiceCoordinator>,
    pub role_enforcer: Arc<RoleEnforcer<DiscordRoleAdmin>>,
    pub chat_engine: Arc<ChatEngine<DiscordChatPoster>>,
    pub catchup: Arc<CatchupReplayer<DiscordHistoryProvider>>,
    pub event_bus: Arc<EventBusClient>,
    pub gateway_handle: Arc<GatewayHandle>,
    pub ready_flag: AtomicBool, // set once `ready` has populated the cache
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!(user = %ready.user.name, guild_count = ready.guilds.len(), "gateway session ready");
        self.gateway_handle.set_context(ctx).await;
        self.ready_flag.store(true, Ordering::SeqCst);

        let event = EventEnvelope::BotStatusUpdate(crate::adapters::event_bus::BotStatusUpdate {
            common: EventCommon {
                source: "discord".into(),
                user_id: Some(ready.user.id.0),
                user_name: Some(ready.user.name.clone()),
                user_level: None,
                channel_id: None,
                channel_name: None,
                server_id: None,
                server_name: None,
                timestamp: unix_now(),
            },
            status: "online".into(),
        });
        if let Err(e) = self.event_bus.publish(&event).await {
            tracing::warn!(error = %e, "failed to publish startup status event");
        }
    }

    /// §4.5 "On gateway resume" — the trigger for the Catch-up Replayer.
    async fn resume(&self, _ctx: Context, _: ResumedEvent) {
        tracing::info!("gateway session resumed, running catch-up replay");
        match self.catchup.run().await {
            Ok(count) => tracing::info!(count, "catch-up replay finished"),
            Err(e) => tracing::warn!(error = %e, "catch-up replay failed"),
        }
    }

    async fn voice_state_update(&self, _ctx: Context, _old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else { return };
        self.coordinator
            .on_voice_state_update(guild_id.0, new.user_id.0, new.channel_id.map(|c| c.0))
            .await;
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let event = EventEnvelope::UserSentMessage(UserSentMessage {
            common: EventCommon {
                source: "discord".into(),
                user_id: Some(msg.author.id.0),
                user_name: Some(msg.author.name.clone()),
                user_level: None,
                channel_id: Some(msg.channel_id.0),
                channel_name: None,
                server_id: msg.guild_id.map(|g| g.0),
                server_name: None,
                timestamp: unix_now(),
            },
            message_id: msg.id.0,
            content: msg.content.clone(),
        });
        if let Err(e) = self.event_bus.publish(&event).await {
            tracing::warn!(error = %e, "failed to publish sent-message event");
        }

        let history = vec![ChatMessage {
            role: "user".into(),
            content: msg.content,
        }];
        if let Err(e) = self.chat_engine.handle_conversation(msg.channel_id.0, history).await {
            tracing::warn!(error = %e, "chat engagement pipeline failed");
        }
    }

    async fn guild_member_addition(&self, _ctx: Context, member: Member) {
        let Some(guild_id) = Some(member.guild_id) else { return };
        if let Err(e) = self.role_enforcer.enforce(guild_id.0, member.user.id.0).await {
            tracing::warn!(error = %e, "role enforcement failed on member add");
        }
    }

    async fn guild_member_update(&self, _ctx: Context, _old: Option<Member>, new: Option<Member>) {
        let Some(member) = new else { return };
        if let Err(e) = self.role_enforcer.enforce(member.guild_id.0, member.user.id.0).await {
            tracing::warn!(error = %e, "role enforcement failed on member update");
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Unused directly but documents the mapping referenced by
/// `map_http_error`'s doc comment above (§9).
#[allow(dead_code)]
fn _role_id_roundtrip(role: SerenityRoleId) -> RoleId {
    role.0
}
