//! Shared scalar types and audio constants used across the pipeline.
//!
//! Shadows the shape of `songbird`'s own types where we need to carry
//! them across a thread boundary or through `serde`, the way the
//! teacher's `types.rs` shadowed `songbird::events::context_data`.

use std::sync::Arc;

pub type UserId = u64;
pub type GuildId = u64;
pub type ChannelId = u64;
pub type MessageId = u64;
pub type RoleId = u64;
pub type Ssrc = u32;

pub type AudioSample = i16;
pub type AudioClip = Arc<Vec<AudioSample>>;

pub const AUDIO_CHANNELS: usize = 2;
pub const DISCORD_SAMPLES_PER_SECOND: usize = 48_000;
pub const DISCORD_SAMPLES_PER_MILLISECOND: usize = DISCORD_SAMPLES_PER_SECOND / 1000;
pub const BYTES_PER_SAMPLE: usize = 2;

pub const FRAME_PERIOD_MS: usize = 20;
pub const SAMPLES_PER_FRAME_PER_CHANNEL: usize =
    DISCORD_SAMPLES_PER_MILLISECOND * FRAME_PERIOD_MS;
pub const SAMPLES_PER_FRAME: usize = SAMPLES_PER_FRAME_PER_CHANNEL * AUDIO_CHANNELS;

/// §4.1 / §8.2 — minimum utterance floor: 0.75s at 48kHz stereo.
pub const MIN_UTTERANCE_SAMPLES: usize = 72_000;

/// §4.1 — silence threshold after which a recording is stopped.
pub const SILENCE_THRESHOLD_MS: u64 = 1500;
/// §4.1 — silence monitor tick interval.
pub const SILENCE_MONITOR_TICK_MS: u64 = 100;

/// §4.2 — echo-gate RMS threshold, ~ -30 dBFS on a signed-16 scale.
pub const BARGE_IN_RMS_THRESHOLD: f64 = 1000.0;

/// §4.2 — music lane is ducked to this factor while a voice frame is present.
pub const DUCK_FACTOR_ACTIVE: f32 = 0.2;
pub const DUCK_FACTOR_IDLE: f32 = 1.0;

/// §4.2 — trailing-silence frames before the speaking flag drops.
pub const TRAILING_SILENCE_FRAMES: u32 = 5;

/// §4.2 / §3 — lane capacity, ~2s of 20ms frames.
pub const LANE_CAPACITY_FRAMES: usize = 100;

/// §4.4 — soft chunk size, in unicode scalar values (display characters).
pub const CHUNK_SOFT_MAX: usize = 2000;
/// §4.4 — newline search window from the end of the chunk.
pub const CHUNK_NEWLINE_WINDOW: usize = 500;
/// §4.4 — space search window from the end of the chunk.
pub const CHUNK_SPACE_WINDOW: usize = 200;

/// §4.4 — streaming editor tick interval.
pub const EDITOR_TICK_MS: u64 = 500;

/// §4.5 — recent event-bus messages to scan for a watermark.
pub const CATCHUP_WATERMARK_EVENTS: usize = 1000;
/// §4.5 — recent event ids kept for de-duplication.
pub const CATCHUP_DEDUP_EVENTS: usize = 10_000;

/// §4.3 — voice watchdog tick interval.
pub const WATCHDOG_TICK_SECS: u64 = 5;
/// §4.2 / §4.3 — settle wait after join before the mixer is created.
pub const POST_JOIN_SETTLE_SECS: u64 = 1;

pub type AudioCallback = Arc<dyn Fn(UserId, AudioClip) + Send + Sync>;

/// Compute root-mean-square of a signed 16-bit PCM frame. Used by the
/// recorder's echo gate (§4.1) and testable directly (§8.3).
pub fn rms(frame: &[AudioSample]) -> f64 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / frame.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_silence_is_zero() {
        let frame = vec![0i16; SAMPLES_PER_FRAME];
        assert_eq!(rms(&frame), 0.0);
    }

    #[test]
    fn rms_of_full_scale_square_wave() {
        let frame = vec![i16::MAX; 100];
        assert!((rms(&frame) - i16::MAX as f64).abs() < 1.0);
    }
}
