//! C2 — Audio Mixer. §3, §4.2, §8.
//!
//! One mixer per live voice connection, exactly-one-singleton per §5
//! "Shared-resource policy". Lanes are bounded `ringbuf` queues (the
//! same crate the teacher uses for its own audio accumulator in
//! `voice_buffer.rs`, generalized here from a single growing buffer
//! into the spec's fixed-capacity music/voice lanes), non-blocking on
//! the tick side and timeout-dropping on the feeder side.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use ringbuf::ring_buffer::{RbRead, RbWrite};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::audio::opus_codec::FrameEncoder;
use crate::error::DexterResult;
use crate::types::{
    AudioSample, DUCK_FACTOR_ACTIVE, DUCK_FACTOR_IDLE, FRAME_PERIOD_MS, LANE_CAPACITY_FRAMES,
    SAMPLES_PER_FRAME, TRAILING_SILENCE_FRAMES,
};
use crate::voice::recorder::PlaybackState;

/// Emits one encoded Opus frame per tick, handed to the Voice
/// Connection's output source.
pub type FrameSink = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
/// Fires exactly on a speaking-state edge (§8 invariant 4).
pub type SpeakingSink = Arc<dyn Fn(bool) + Send + Sync>;

type Lane = (
    StdMutex<HeapProducer<Vec<AudioSample>>>,
    StdMutex<HeapConsumer<Vec<AudioSample>>>,
);

fn new_lane() -> Lane {
    let (tx, rx) = HeapRb::<Vec<AudioSample>>::new(LANE_CAPACITY_FRAMES).split();
    (StdMutex::new(tx), StdMutex::new(rx))
}

pub struct Mixer {
    voice: Lane,
    music: Lane,
    voice_token: StdMutex<CancellationToken>,
    speaking: AtomicBool,
    silent_ticks: AtomicU32,
    stopped: AtomicBool,
    ready: Arc<AtomicBool>,
    encoder: StdMutex<FrameEncoder>,
    sink: FrameSink,
    speaking_sink: SpeakingSink,
}

impl Mixer {
    pub fn new(ready: Arc<AtomicBool>, sink: FrameSink, speaking_sink: SpeakingSink) -> DexterResult<Arc<Self>> {
        Ok(Arc::new(Self {
            voice: new_lane(),
            music: new_lane(),
            voice_token: StdMutex::new(CancellationToken::new()),
            speaking: AtomicBool::new(false),
            silent_ticks: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            ready,
            encoder: StdMutex::new(FrameEncoder::new()?),
            sink,
            speaking_sink,
        }))
    }

    /// Background 20ms scheduling loop (§4.2 "Per-tick algorithm").
    /// Intended to be spawned once per Mixer instance.
    pub async fn run_tick_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_PERIOD_MS as u64));
        loop {
            ticker.tick().await;
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.process_tick();
        }
    }

    /// One iteration of the per-tick algorithm, factored out as a
    /// plain synchronous call so it's directly testable (§8).
    pub fn process_tick(&self) {
        if !self.ready.load(Ordering::SeqCst) {
            return;
        }

        let voice_frame = self.voice.1.lock().expect("voice lane poisoned").pop();
        let music_frame = self.music.1.lock().expect("music lane poisoned").pop();

        if voice_frame.is_none() && music_frame.is_none() {
            if self.speaking.load(Ordering::SeqCst) {
                self.emit_silence();
                let silent = self.silent_ticks.fetch_add(1, Ordering::SeqCst) + 1;
                if silent >= TRAILING_SILENCE_FRAMES {
                    self.set_speaking(false);
                }
            }
            return;
        }

        self.silent_ticks.store(0, Ordering::SeqCst);
        if !self.speaking.load(Ordering::SeqCst) {
            self.set_speaking(true);
        }

        let duck = if voice_frame.is_some() {
            DUCK_FACTOR_ACTIVE
        } else {
            DUCK_FACTOR_IDLE
        };
        let mixed = mix_frames(voice_frame.as_deref(), music_frame.as_deref(), duck);
        self.emit(&mixed);
    }

    /// §4.1 / §4.2 — the Recorder's echo gate needs to know whether
    /// this mixer currently considers itself "playing".
    pub fn interrupt_voice(&self) {
        let mut token = self.voice_token.lock().expect("voice token poisoned");
        token.cancel();
        *token = CancellationToken::new();
        let mut consumer = self.voice.1.lock().expect("voice lane poisoned");
        while consumer.pop().is_some() {}
    }

    fn voice_token(&self) -> CancellationToken {
        self.voice_token.lock().expect("voice token poisoned").clone()
    }

    /// §4.2 "Feeder": consumes 16-bit little-endian stereo PCM at 48kHz
    /// in 960-sample (per channel) frames, routing to the voice lane
    /// with a 1s drop-on-full policy. Cancellation (via `InterruptVoice`)
    /// is a normal termination, not an error (§5, §9).
    pub async fn stream_voice(&self, mut reader: impl AsyncRead + Unpin) -> DexterResult<()> {
        let token = self.voice_token();
        loop {
            let mut buf = vec![0u8; SAMPLES_PER_FRAME * 2];
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                result = reader.read_exact(&mut buf) => {
                    match result {
                        Ok(_) => {
                            let frame = bytes_to_samples(&buf);
                            push_with_timeout(&self.voice.0, frame, &token).await;
                        }
                        Err(_) => return Ok(()), // EOF or stream error: normal termination
                    }
                }
            }
        }
    }

    /// Same feeder contract for the music lane; never interrupted by
    /// barge-in (§4.2 "Music lane is untouched").
    pub async fn stream_music(&self, mut reader: impl AsyncRead + Unpin) -> DexterResult<()> {
        let never = CancellationToken::new();
        loop {
            let mut buf = vec![0u8; SAMPLES_PER_FRAME * 2];
            match reader.read_exact(&mut buf).await {
                Ok(_) => {
                    let frame = bytes_to_samples(&buf);
                    push_with_timeout(&self.music.0, frame, &never).await;
                }
                Err(_) => return Ok(()),
            }
        }
    }

    /// §4.2 Lifecycle: "stopped on teardown with a guaranteed
    /// speaking=false edge."
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if self.speaking.swap(false, Ordering::SeqCst) {
            (self.speaking_sink)(false);
        }
    }

    fn set_speaking(&self, value: bool) {
        self.speaking.store(value, Ordering::SeqCst);
        (self.speaking_sink)(value);
    }

    fn emit(&self, pcm: &[AudioSample]) {
        let mut encoder = self.encoder.lock().expect("encoder poisoned");
        if let Ok(packet) = encoder.encode_frame(pcm) {
            (self.sink)(packet);
        }
    }

    fn emit_silence(&self) {
        let silence = vec![0; SAMPLES_PER_FRAME];
        self.emit(&silence);
    }

    #[cfg(test)]
    fn voice_lane_pending(&self) -> usize {
        self.voice.1.lock().unwrap().len()
    }

    #[cfg(test)]
    fn push_voice_frame_for_test(&self, frame: Vec<AudioSample>) {
        let _ = self.voice.0.lock().unwrap().push(frame);
    }
}

impl PlaybackState for Mixer {
    fn is_playing(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }
}

fn bytes_to_samples(bytes: &[u8]) -> Vec<AudioSample> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Try to enqueue `frame` for up to 1s; drop it under sustained
/// backpressure rather than block the producer (§4.2, §5
/// "Backpressure"). Cancellation also aborts the wait early.
async fn push_with_timeout(
    producer: &StdMutex<HeapProducer<Vec<AudioSample>>>,
    frame: Vec<AudioSample>,
    token: &CancellationToken,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    let mut frame = Some(frame);
    loop {
        {
            let mut p = producer.lock().expect("lane poisoned");
            if let Some(f) = frame.take() {
                if let Err(f) = p.push(f) {
                    frame = Some(f);
                } else {
                    return;
                }
            }
        }
        if tokio::time::Instant::now() >= deadline || token.is_cancelled() {
            return; // dropped
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// §4.2 step 3: `clip(voice_sample + music_sample * duck)`.
fn mix_frames(voice: Option<&[AudioSample]>, music: Option<&[AudioSample]>, duck: f32) -> Vec<AudioSample> {
    let len = SAMPLES_PER_FRAME;
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let v = voice.and_then(|s| s.get(i)).copied().unwrap_or(0) as f32;
        let m = music.and_then(|s| s.get(i)).copied().unwrap_or(0) as f32;
        let mixed = v + m * duck;
        out.push(mixed.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mixer() -> Arc<Mixer> {
        let ready = Arc::new(AtomicBool::new(true));
        let sink: FrameSink = Arc::new(|_frame| {});
        let speaking_sink: SpeakingSink = Arc::new(|_val| {});
        Mixer::new(ready, sink, speaking_sink).unwrap()
    }

    #[test]
    fn mix_frames_ducks_music_when_voice_present() {
        let voice = vec![1000i16; SAMPLES_PER_FRAME];
        let music = vec![1000i16; SAMPLES_PER_FRAME];
        let mixed = mix_frames(Some(&voice), Some(&music), DUCK_FACTOR_ACTIVE);
        assert_eq!(mixed[0], 1200); // 1000 + 1000*0.2
    }

    #[test]
    fn mix_frames_clips_to_i16_range() {
        let voice = vec![i16::MAX; SAMPLES_PER_FRAME];
        let music = vec![i16::MAX; SAMPLES_PER_FRAME];
        let mixed = mix_frames(Some(&voice), Some(&music), DUCK_FACTOR_IDLE);
        assert_eq!(mixed[0], i16::MAX);
    }

    #[test]
    fn mix_frames_treats_absent_lane_as_silence() {
        let voice = vec![500i16; SAMPLES_PER_FRAME];
        let mixed = mix_frames(Some(&voice), None, DUCK_FACTOR_ACTIVE);
        assert_eq!(mixed[0], 500);
    }

    #[test]
    fn speaking_edge_sets_on_first_frame_and_clears_after_trailing_silence() {
        let mixer = test_mixer();
        mixer.push_voice_frame_for_test(vec![1000i16; SAMPLES_PER_FRAME]);
        mixer.process_tick();
        assert!(mixer.is_playing());

        for _ in 0..(TRAILING_SILENCE_FRAMES - 1) {
            mixer.process_tick();
            assert!(mixer.is_playing());
        }
        mixer.process_tick();
        assert!(!mixer.is_playing());
    }

    #[test]
    fn not_ready_skips_tick_without_emitting_state_changes() {
        let ready = Arc::new(AtomicBool::new(false));
        let sink: FrameSink = Arc::new(|_| {});
        let speaking_sink: SpeakingSink = Arc::new(|_| {});
        let mixer = Mixer::new(ready, sink, speaking_sink).unwrap();
        mixer.push_voice_frame_for_test(vec![1000i16; SAMPLES_PER_FRAME]);
        mixer.process_tick();
        assert!(!mixer.is_playing());
        assert_eq!(mixer.voice_lane_pending(), 1);
    }

    #[test]
    fn interrupt_voice_drains_the_lane() {
        let mixer = test_mixer();
        mixer.push_voice_frame_for_test(vec![1i16; SAMPLES_PER_FRAME]);
        mixer.push_voice_frame_for_test(vec![2i16; SAMPLES_PER_FRAME]);
        assert_eq!(mixer.voice_lane_pending(), 2);
        mixer.interrupt_voice();
        assert_eq!(mixer.voice_lane_pending(), 0);
    }

    #[test]
    fn stop_guarantees_a_speaking_false_edge() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();
        let ready = Arc::new(AtomicBool::new(true));
        let sink: FrameSink = Arc::new(|_| {});
        let speaking_sink: SpeakingSink = Arc::new(move |v| flag_clone.store(v, Ordering::SeqCst));
        let mixer = Mixer::new(ready, sink, speaking_sink).unwrap();
        mixer.push_voice_frame_for_test(vec![1000i16; SAMPLES_PER_FRAME]);
        mixer.process_tick();
        assert!(mixer.is_playing());
        mixer.stop();
        assert!(!flag.load(Ordering::SeqCst));
    }
}
