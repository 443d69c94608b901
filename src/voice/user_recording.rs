//! UserRecording — §3.
//!
//! One PCM accumulator per speaking user, generalized from the
//! teacher's `VoiceBufferForUser` (which flushed fixed-size ring
//! buffers to a callback) into the spec's single growing buffer that
//! is handed off whole on stop, with its own Opus decoder and a lock
//! scoped to decode+append only (§5 "Shared-resource policy").

use std::sync::Mutex;
use std::time::Instant;

use crate::audio::opus_codec::FrameDecoder;
use crate::error::DexterResult;
use crate::types::{AudioSample, ChannelId, UserId};

pub struct UserRecording {
    pub user: UserId,
    pub channel: ChannelId,
    pub start: Instant,
    pub start_unix: u64,
    last_packet: Mutex<Instant>,
    decoder: Mutex<FrameDecoder>,
    buffer: Mutex<Vec<AudioSample>>,
}

impl UserRecording {
    pub fn new(user: UserId, channel: ChannelId, start_unix: u64) -> DexterResult<Self> {
        let now = Instant::now();
        Ok(Self {
            user,
            channel,
            start: now,
            start_unix,
            last_packet: Mutex::new(now),
            decoder: Mutex::new(FrameDecoder::new()?),
            buffer: Mutex::new(Vec::new()),
        })
    }

    /// Decode one Opus frame and append to the buffer, strictly in
    /// packet-arrival order (§5 Ordering guarantees). Returns the
    /// decoded frame so the caller (Recorder) can run the echo gate
    /// on it before deciding whether to keep the append.
    ///
    /// A decoder error drops just this frame (§4.1 Failure semantics).
    pub fn decode_and_maybe_append(
        &self,
        packet: &[u8],
        keep: impl FnOnce(&[AudioSample]) -> bool,
    ) -> DexterResult<()> {
        let mut decoder = self.decoder.lock().expect("decoder lock poisoned");
        let pcm = decoder.decode_frame(packet)?;
        drop(decoder);

        if keep(&pcm) {
            let mut buffer = self.buffer.lock().expect("buffer lock poisoned");
            buffer.extend_from_slice(&pcm);
            *self.last_packet.lock().expect("last_packet poisoned") = Instant::now();
        }
        Ok(())
    }

    pub fn last_packet_at(&self) -> Instant {
        *self.last_packet.lock().expect("last_packet poisoned")
    }

    pub fn sample_count(&self) -> usize {
        self.buffer.lock().expect("buffer lock poisoned").len()
    }

    /// Consume the buffer, leaving it empty. Called exactly once, by
    /// whichever of {silence monitor, explicit stop} wins the race to
    /// finalize this recording (§3 Lifecycle).
    pub fn take_buffer(&self) -> Vec<AudioSample> {
        std::mem::take(&mut self.buffer.lock().expect("buffer lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SAMPLES_PER_FRAME;

    #[test]
    fn append_grows_buffer_in_order() {
        let rec = UserRecording::new(1, 2, 0).unwrap();
        let mut enc = crate::audio::opus_codec::FrameEncoder::new().unwrap();
        let silent = enc.encode_silence().unwrap();
        rec.decode_and_maybe_append(&silent, |_| true).unwrap();
        assert_eq!(rec.sample_count(), SAMPLES_PER_FRAME);
        rec.decode_and_maybe_append(&silent, |_| true).unwrap();
        assert_eq!(rec.sample_count(), SAMPLES_PER_FRAME * 2);
    }

    #[test]
    fn echo_gate_can_drop_a_frame_without_appending() {
        let rec = UserRecording::new(1, 2, 0).unwrap();
        let mut enc = crate::audio::opus_codec::FrameEncoder::new().unwrap();
        let silent = enc.encode_silence().unwrap();
        rec.decode_and_maybe_append(&silent, |_| false).unwrap();
        assert_eq!(rec.sample_count(), 0);
    }

    #[test]
    fn take_buffer_empties_it() {
        let rec = UserRecording::new(1, 2, 0).unwrap();
        let mut enc = crate::audio::opus_codec::FrameEncoder::new().unwrap();
        let silent = enc.encode_silence().unwrap();
        rec.decode_and_maybe_append(&silent, |_| true).unwrap();
        let taken = rec.take_buffer();
        assert_eq!(taken.len(), SAMPLES_PER_FRAME);
        assert_eq!(rec.sample_count(), 0);
    }
}
