//! C3 — Voice Coordinator. §4.3, §9.
//!
//! Preserves a single active connection per process, generalizing the
//! teacher's implicit one-connection-per-process assumption in
//! `model.rs` into an explicit owner with a connection-scoped lock, as
//! §9 "Singletons" asks for: "an explicit lifecycle owner ... rather
//! than ambient global state."

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use songbird::Call;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;

use crate::adapters::event_bus::{EventBusClient, EventCommon, EventEnvelope, VoiceEvent};
use crate::error::{DexterError, DexterResult};
use crate::types::{ChannelId, GuildId, UserId, POST_JOIN_SETTLE_SECS, WATCHDOG_TICK_SECS};
use crate::voice::connection::VoiceConnection;
use crate::voice::mixer::{FrameSink, Mixer, SpeakingSink};
use crate::voice::recorder::Recorder;

/// Supplied by the Gateway Session: asks `songbird`'s serenity-backed
/// manager to join (or move to) `channel` in `guild` with self-mute=false,
/// self-deaf=false (§4.3), and resolves once songbird's own
/// VOICE_STATE_UPDATE/VOICE_SERVER_UPDATE handshake has produced a live
/// `Call` handle. Kept as an injected closure (rather than this module
/// depending on `songbird::Songbird` directly) so the join/move
/// algorithm here stays testable without a real gateway connection.
pub type CallProvider =
    Arc<dyn Fn(GuildId, ChannelId) -> futures::future::BoxFuture<'static, DexterResult<Arc<Mutex<Call>>>> + Send + Sync>;

struct ActiveVoice {
    guild: GuildId,
    channel: ChannelId,
    connection: Arc<VoiceConnection>,
    mixer: Arc<Mixer>,
}

/// C3 — one per process (§3 "Exactly one Mixer per voice connection;
/// replaced on reconnect" is enforced by replacing this struct's
/// single `active` slot under `conn_lock`).
pub struct VoiceCoordinator {
    conn_lock: Mutex<Option<ActiveVoice>>,
    recorder: Arc<Recorder>,
    event_bus: Arc<EventBusClient>,
    call_provider: CallProvider,
    master_user: Option<UserId>,
    default_voice_channel: Option<ChannelId>,
    running: AtomicBool,
}

impl VoiceCoordinator {
    pub fn new(
        recorder: Arc<Recorder>,
        event_bus: Arc<EventBusClient>,
        call_provider: CallProvider,
        master_user: Option<UserId>,
        default_voice_channel: Option<ChannelId>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn_lock: Mutex::new(None),
            recorder,
            event_bus,
            call_provider,
            master_user,
            default_voice_channel,
            running: AtomicBool::new(true),
        })
    }

    /// §4.3 "Join / move algorithm".
    pub async fn join_or_move(self: &Arc<Self>, guild: GuildId, channel: ChannelId) -> DexterResult<()> {
        let mut guard = self.conn_lock.lock().await;

        if let Some(active) = guard.as_ref() {
            if active.guild == guild && active.channel == channel {
                return Ok(());
            }
        }

        if guard.is_some() {
            self.recorder.stop_all_recordings().await;
        }

        let call = (self.call_provider)(guild, channel).await?;
        let connection = Arc::new(VoiceConnection::new(call, channel));
        connection.attach_recorder(Arc::clone(&self.recorder)).await;
        self.recorder.set_current_channel(channel).await;

        tokio::time::sleep(Duration::from_secs(POST_JOIN_SETTLE_SECS)).await;

        let mixer = self.spawn_mixer(Arc::clone(&connection)).await?;
        self.recorder
            .set_playback_state(Arc::clone(&mixer) as Arc<dyn crate::voice::recorder::PlaybackState>)
            .await;

        *guard = Some(ActiveVoice {
            guild,
            channel,
            connection,
            mixer,
        });
        drop(guard);

        let _ = self
            .event_bus
            .publish(&EventEnvelope::BotJoinedVoice(VoiceEvent {
                common: EventCommon {
                    source: "discord".into(),
                    user_id: None,
                    user_name: None,
                    user_level: None,
                    channel_id: Some(channel),
                    channel_name: None,
                    server_id: Some(guild),
                    server_name: None,
                    timestamp: unix_now(),
                },
            }))
            .await;

        Ok(())
    }

    /// Wires a fresh Mixer's output into the connection and starts its
    /// tick loop (§4.2 Lifecycle).
    async fn spawn_mixer(&self, connection: Arc<VoiceConnection>) -> DexterResult<Arc<Mixer>> {
        let (tx, rx) = std::sync::mpsc::channel::<Vec<u8>>();
        let sink: FrameSink = Arc::new(move |frame| {
            let _ = tx.send(frame);
        });
        // songbird's own driver toggles the outbound speaking flag (§6
        // "out-of-band speaking-state flag") from whether its active
        // track is currently producing frames, so the Mixer's edge
        // signal only needs to drive the Recorder's echo gate here.
        let speaking_sink: SpeakingSink = Arc::new(|_speaking| {});
        let ready = connection.ready_flag();
        let mixer = Mixer::new(ready, sink, speaking_sink)?;

        connection.play_mixer_output(rx).await;
        tokio::spawn(Arc::clone(&mixer).run_tick_loop());
        Ok(mixer)
    }

    /// §4.3 "Leave()".
    pub async fn leave(&self) {
        let mut guard = self.conn_lock.lock().await;
        if let Some(active) = guard.take() {
            active.mixer.stop();
            active.connection.disconnect().await;
            self.recorder.stop_all_recordings().await;
            self.recorder.clear_channel_ssrc(active.channel);
        }
    }

    /// §4.3 "Follow-the-master rule".
    pub async fn on_voice_state_update(
        self: &Arc<Self>,
        guild: GuildId,
        user: UserId,
        channel: Option<ChannelId>,
    ) {
        if Some(user) != self.master_user {
            return;
        }
        match channel {
            Some(channel) => {
                if let Err(e) = self.join_or_move(guild, channel).await {
                    tracing::warn!(error = %e, "failed to follow master user into voice");
                }
            }
            None => {
                if let Some(default_channel) = self.default_voice_channel {
                    if let Err(e) = self.join_or_move(guild, default_channel).await {
                        tracing::warn!(error = %e, "failed to return to default voice channel");
                    }
                }
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.conn_lock.lock().await.is_some()
    }

    /// §6 "POST /audio/play" — feeds the active Mixer's voice lane
    /// (barge-in eligible, §4.2) until the reader is exhausted or
    /// interrupted.
    pub async fn play_voice(&self, reader: impl AsyncRead + Unpin + Send + 'static) -> DexterResult<()> {
        let mixer = self.active_mixer().await?;
        mixer.stream_voice(reader).await
    }

    /// Same contract for the music lane, which barge-in never touches.
    pub async fn play_music(&self, reader: impl AsyncRead + Unpin + Send + 'static) -> DexterResult<()> {
        let mixer = self.active_mixer().await?;
        mixer.stream_music(reader).await
    }

    /// §4.2 "InterruptVoice" — drains the voice lane and cancels any
    /// in-flight feeder, used for barge-in.
    pub async fn interrupt_voice(&self) -> DexterResult<()> {
        let mixer = self.active_mixer().await?;
        mixer.interrupt_voice();
        Ok(())
    }

    async fn active_mixer(&self) -> DexterResult<Arc<Mixer>> {
        self.conn_lock
            .lock()
            .await
            .as_ref()
            .map(|a| Arc::clone(&a.mixer))
            .ok_or_else(|| DexterError::ResourceUnavailable("no active voice connection".into()))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// §4.3 "Voice Watchdog" — 5 s tick, hard-resets a not-ready connection.
pub async fn watchdog_forever(coordinator: Arc<VoiceCoordinator>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(WATCHDOG_TICK_SECS));
    loop {
        ticker.tick().await;
        if !coordinator.running.load(Ordering::SeqCst) {
            break;
        }

        let snapshot = {
            let guard = coordinator.conn_lock.lock().await;
            guard
                .as_ref()
                .map(|a| (a.guild, a.channel, a.connection.is_ready()))
        };

        let Some((guild, channel, ready)) = snapshot else {
            continue;
        };
        if ready {
            continue;
        }

        tracing::warn!(guild, channel, "voice connection not ready, hard-resetting");
        coordinator.leave().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        if let Err(e) = coordinator.join_or_move(guild, channel).await {
            tracing::warn!(error = %e, "watchdog reset failed, will retry next tick");
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::kv::KvStore;
    use crate::error::DexterError;
    use crate::voice::ssrc_table::SsrcTable;
    use futures::FutureExt;

    fn test_recorder() -> Arc<Recorder> {
        let ssrc_table = Arc::new(SsrcTable::new());
        let http = reqwest::Client::new();
        let event_bus = Arc::new(EventBusClient::new(http, "http://localhost:1"));
        Arc::new(Recorder::new(
            ssrc_table,
            KvStore::in_memory(),
            event_bus,
            crate::adapters::stt::SttWorker::new("/bin/true"),
            std::env::temp_dir().join("dexter-coordinator-test-audio"),
        ))
    }

    #[tokio::test]
    async fn master_leaving_voice_without_default_is_a_noop() {
        let recorder = test_recorder();
        let http = reqwest::Client::new();
        let event_bus = Arc::new(EventBusClient::new(http, "http://localhost:1"));
        let provider: CallProvider = Arc::new(|_guild, _channel| {
            async { Err(DexterError::ResourceUnavailable("no gateway in test".into())) }.boxed()
        });
        let coordinator = VoiceCoordinator::new(recorder, event_bus, provider, Some(42), None);

        coordinator.on_voice_state_update(1, 42, None).await;
        assert!(!coordinator.is_connected().await);
    }

    #[tokio::test]
    async fn non_master_voice_state_updates_are_ignored() {
        let recorder = test_recorder();
        let http = reqwest::Client::new();
        let event_bus = Arc::new(EventBusClient::new(http, "http://localhost:1"));
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);
        let provider: CallProvider = Arc::new(move |_guild, _channel| {
            called_clone.store(true, Ordering::SeqCst);
            async { Err(DexterError::ResourceUnavailable("unused".into())) }.boxed()
        });
        let coordinator = VoiceCoordinator::new(recorder, event_bus, provider, Some(42), None);

        coordinator.on_voice_state_update(1, 7, Some(99)).await;
        assert!(!called.load(Ordering::SeqCst));
    }
}
