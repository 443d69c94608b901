//! C1 — Voice Recorder. §3, §4.1, §8.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::adapters::event_bus::{EventBusClient, EventCommon, EventEnvelope, UserTranscribed};
use crate::adapters::kv::KvStore;
use crate::adapters::stt::SttWorker;
use crate::error::DexterResult;
use crate::types::{
    ChannelId, Ssrc, UserId, BARGE_IN_RMS_THRESHOLD, MIN_UTTERANCE_SAMPLES,
    SILENCE_MONITOR_TICK_MS, SILENCE_THRESHOLD_MS,
};
use crate::voice::ssrc_table::SsrcTable;
use crate::voice::user_recording::UserRecording;

/// Handle to wherever a finished utterance ended up (§4.1
/// "Persistence and handoff"): a file on disk, a KV blob key, or
/// neither if both sinks failed / the utterance never met the floor.
#[derive(Debug, Clone, Default)]
pub struct BlobHandle {
    pub file_path: Option<PathBuf>,
    pub kv_key: Option<String>,
}

impl BlobHandle {
    pub fn is_empty(&self) -> bool {
        self.file_path.is_none() && self.kv_key.is_none()
    }
}

/// Injected by the Voice Coordinator (§9 "Cyclic-looking references"):
/// the Recorder never calls back into the coordinator directly.
pub type OnStop = Arc<dyn Fn(UserId, ChannelId, BlobHandle) + Send + Sync>;

/// Reports whether the Mixer for the Recorder's voice connection is
/// currently playing, for the echo gate (§4.1, §4.2). Implemented by
/// [`crate::voice::mixer::Mixer`]; kept as a trait so the Recorder
/// doesn't need to depend on the Mixer's concrete type.
pub trait PlaybackState: Send + Sync {
    fn is_playing(&self) -> bool;
}

pub struct Recorder {
    active: DashMap<UserId, Arc<UserRecording>>,
    ssrc_table: Arc<SsrcTable>,
    current_channel: RwLock<Option<ChannelId>>,
    kv: KvStore,
    event_bus: Arc<EventBusClient>,
    stt: SttWorker,
    audio_dir: PathBuf,
    on_stop: RwLock<Option<OnStop>>,
    playback: RwLock<Option<Arc<dyn PlaybackState>>>,
}

impl Recorder {
    pub fn new(
        ssrc_table: Arc<SsrcTable>,
        kv: KvStore,
        event_bus: Arc<EventBusClient>,
        stt: SttWorker,
        audio_dir: PathBuf,
    ) -> Self {
        Self {
            active: DashMap::new(),
            ssrc_table,
            current_channel: RwLock::new(None),
            kv,
            event_bus,
            stt,
            audio_dir,
            on_stop: RwLock::new(None),
            playback: RwLock::new(None),
        }
    }

    pub async fn set_on_stop(&self, cb: OnStop) {
        *self.on_stop.write().await = Some(cb);
    }

    pub async fn set_playback_state(&self, playback: Arc<dyn PlaybackState>) {
        *self.playback.write().await = Some(playback);
    }

    pub async fn set_current_channel(&self, channel: ChannelId) {
        *self.current_channel.write().await = Some(channel);
    }

    pub fn register_ssrc(&self, channel: ChannelId, ssrc: Ssrc, user: UserId) {
        self.ssrc_table.register(channel, ssrc, user);
    }

    pub fn unregister_ssrc(&self, channel: ChannelId, ssrc: Ssrc) {
        self.ssrc_table.unregister(channel, ssrc);
    }

    pub fn unregister_ssrc_by_user(&self, channel: ChannelId, user: UserId) {
        self.ssrc_table.unregister_user(channel, user);
    }

    pub fn clear_channel_ssrc(&self, channel: ChannelId) {
        self.ssrc_table.clear_channel(channel);
    }

    /// Idempotent: returns success if a recording already exists (§4.1).
    pub async fn start_recording(&self, user: UserId, channel: ChannelId) -> DexterResult<()> {
        if self.active.contains_key(&user) {
            return Ok(());
        }
        let start_unix = unix_now();
        let recording = Arc::new(UserRecording::new(user, channel, start_unix)?);
        self.active.insert(user, recording);
        Ok(())
    }

    /// Looks up the user via the SSRCTable under the current channel;
    /// discards silently on an unknown SSRC (§4.1, §8.3).
    pub async fn process_voice_packet(&self, ssrc: Ssrc, opus_frame: &[u8]) -> DexterResult<()> {
        let channel = match *self.current_channel.read().await {
            Some(c) => c,
            None => return Ok(()),
        };
        let Some(user) = self.ssrc_table.lookup(channel, ssrc) else {
            return Ok(());
        };

        self.start_recording(user, channel).await?;
        let Some(recording) = self.active.get(&user).map(|r| Arc::clone(r.value())) else {
            return Ok(());
        };

        let is_playing = self
            .playback
            .read()
            .await
            .as_ref()
            .map(|p| p.is_playing())
            .unwrap_or(false);

        let threshold = BARGE_IN_RMS_THRESHOLD;
        recording.decode_and_maybe_append(opus_frame, move |pcm| {
            if is_playing {
                crate::types::rms(pcm) >= threshold
            } else {
                true
            }
        })?;
        Ok(())
    }

    /// Removes the recording, persists it if it clears the floor, and
    /// fires the stop callback asynchronously (§4.1).
    pub async fn stop_recording(&self, user: UserId) {
        let Some((_, recording)) = self.active.remove(&user) else {
            return;
        };
        let channel = recording.channel;
        let start_unix = recording.start_unix;
        let stop_unix = unix_now();
        let samples = recording.take_buffer();

        let handle = if samples.len() < MIN_UTTERANCE_SAMPLES {
            BlobHandle::default()
        } else {
            self.persist(start_unix, stop_unix, user, channel, samples)
                .await
        };

        if let Some(cb) = self.on_stop.read().await.clone() {
            cb(user, channel, handle.clone());
        }

        if !handle.is_empty() {
            self.dispatch_transcription(user, channel, handle).await;
        }
    }

    /// §4.1 "Persistence and handoff": try the temp-file sink first,
    /// then fall back to a TTL'd KV blob.
    async fn persist(
        &self,
        start_unix: u64,
        stop_unix: u64,
        user: UserId,
        channel: ChannelId,
        samples: Vec<i16>,
    ) -> BlobHandle {
        let wav_bytes = match encode_wav(&samples) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode wav, utterance lost");
                return BlobHandle::default();
            }
        };

        let file_name = format!("{start_unix}-{stop_unix}-{user}-{channel}.wav");
        if let Err(e) = tokio::fs::create_dir_all(&self.audio_dir).await {
            tracing::warn!(error = %e, "could not create audio dir, falling back to kv sink");
        } else {
            let path = self.audio_dir.join(&file_name);
            match tokio::fs::write(&path, &wav_bytes).await {
                Ok(()) => {
                    #[cfg(unix)]
                    {
                        use std::os::unix::fs::PermissionsExt;
                        let _ = tokio::fs::set_permissions(
                            &path,
                            std::fs::Permissions::from_mode(0o644),
                        )
                        .await;
                    }
                    return BlobHandle {
                        file_path: Some(path),
                        kv_key: None,
                    };
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to write wav file, falling back to kv sink");
                }
            }
        }

        let kv_key = format!("discord-audio:{start_unix}-{stop_unix}-{user}-{channel}");
        match self.kv.put_audio_blob(&kv_key, wav_bytes).await {
            Ok(()) => BlobHandle {
                file_path: None,
                kv_key: Some(kv_key),
            },
            Err(e) => {
                tracing::error!(error = %e, "both sinks failed, utterance lost");
                BlobHandle::default()
            }
        }
    }

    async fn dispatch_transcription(&self, user: UserId, channel: ChannelId, handle: BlobHandle) {
        let Some(key) = handle.kv_key.clone().or_else(|| {
            handle
                .file_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
        }) else {
            return;
        };

        let transcription = match self.stt.transcribe(&key).await {
            Ok(Some(t)) => t,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "stt dispatch failed");
                return;
            }
        };

        let event = EventEnvelope::UserTranscribed(UserTranscribed {
            common: EventCommon {
                source: "discord".into(),
                user_id: Some(user),
                user_name: None,
                user_level: None,
                channel_id: Some(channel),
                channel_name: None,
                server_id: None,
                server_name: None,
                timestamp: unix_now(),
            },
            transcription,
            audio_duration_ms: 0,
        });
        if let Err(e) = self.event_bus.publish(&event).await {
            tracing::warn!(error = %e, "failed to publish transcription event");
        }
    }

    /// §4.1 administrative — tear down everything without persisting.
    pub async fn stop_all_recordings(&self) {
        let users: Vec<UserId> = self.active.iter().map(|e| *e.key()).collect();
        for user in users {
            self.stop_recording(user).await;
        }
    }

    pub fn active_user_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_recording(&self, user: UserId) -> bool {
        self.active.contains_key(&user)
    }
}

/// §4.1 `MonitorSilence` — background tick at 100ms (§8.1).
pub async fn monitor_silence_forever(recorder: Arc<Recorder>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(SILENCE_MONITOR_TICK_MS));
    loop {
        ticker.tick().await;
        let stale: Vec<UserId> = recorder
            .active
            .iter()
            .filter(|entry| {
                entry.value().last_packet_at().elapsed()
                    > Duration::from_millis(SILENCE_THRESHOLD_MS)
            })
            .map(|entry| *entry.key())
            .collect();
        for user in stale {
            recorder.stop_recording(user).await;
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// RIFF/PCM/48kHz/2ch/16-bit, per §4.1.
fn encode_wav(samples: &[i16]) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: crate::types::AUDIO_CHANNELS as u16,
        sample_rate: crate::types::DISCORD_SAMPLES_PER_SECOND as u32,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

fn test_recorder() -> Arc<Recorder> {
    let ssrc_table = Arc::new(SsrcTable::new());
    let http = reqwest::Client::new();
    let event_bus = Arc::new(crate::adapters::event_bus::EventBusClient::new(
        http,
        "http://localhost:1",
    ));
    Arc::new(Recorder::new(
        ssrc_table,
        KvStore::in_memory(),
        event_bus,
        crate::adapters::stt::SttWorker::new("/bin/true"),
        std::env::temp_dir().join("dexter-test-audio"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn unknown_ssrc_is_benign() {
        let ssrc_table = Arc::new(SsrcTable::new());
        ssrc_table.register(1, 42, 7);
        assert_eq!(ssrc_table.lookup(1, 999), None);
    }

    #[tokio::test]
    async fn start_recording_is_idempotent() {
        let recorder = test_recorder();
        recorder.start_recording(1, 2).await.unwrap();
        assert!(recorder.is_recording(1));
        recorder.start_recording(1, 2).await.unwrap();
        assert_eq!(recorder.active_user_count(), 1);
    }

    #[tokio::test]
    async fn stop_below_floor_yields_empty_handle_and_no_persistence() {
        let recorder = test_recorder();
        recorder.set_current_channel(2).await;
        recorder.register_ssrc(2, 42, 1);
        recorder.start_recording(1, 2).await.unwrap();

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let handle_empty = Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let fired = fired.clone();
            let handle_empty = handle_empty.clone();
            recorder
                .set_on_stop(Arc::new(move |_user, _channel, handle| {
                    fired.store(true, Ordering::SeqCst);
                    handle_empty.store(handle.is_empty(), Ordering::SeqCst);
                }))
                .await;
        }

        // One 20ms frame is far below the 0.75s floor.
        let mut enc = crate::audio::opus_codec::FrameEncoder::new().unwrap();
        let silent = enc.encode_silence().unwrap();
        recorder.process_voice_packet(42, &silent).await.unwrap();
        recorder.stop_recording(1).await;

        assert!(fired.load(Ordering::SeqCst));
        assert!(handle_empty.load(Ordering::SeqCst));
        assert!(!recorder.is_recording(1));
    }

    #[tokio::test]
    async fn echo_gate_drops_quiet_frames_while_playing() {
        struct AlwaysPlaying;
        impl PlaybackState for AlwaysPlaying {
            fn is_playing(&self) -> bool {
                true
            }
        }

        let recorder = test_recorder();
        recorder.set_current_channel(2).await;
        recorder.register_ssrc(2, 42, 1);
        recorder.set_playback_state(Arc::new(AlwaysPlaying)).await;
        recorder.start_recording(1, 2).await.unwrap();

        let mut enc = crate::audio::opus_codec::FrameEncoder::new().unwrap();
        let silent = enc.encode_silence().unwrap();
        recorder.process_voice_packet(42, &silent).await.unwrap();

        let recording = recorder
            .active
            .get(&1)
            .map(|r| Arc::clone(r.value()))
            .expect("recording should exist");
        assert_eq!(recording.sample_count(), 0);
    }
}
