//! L1 — Opus Codec Adapter.
//!
//! Encodes/decodes 20ms, 48kHz stereo frames. Wraps `audiopus`, the
//! same opus binding `songbird`'s own driver uses internally, so our
//! standalone encode path (mixer output) and songbird's decode path
//! (inbound packets) agree on frame shape.

use audiopus::coder::{Decoder as OpusDecoder, Encoder as OpusEncoder};
use audiopus::{Application, Channels, SampleRate};

use crate::error::{DexterError, DexterResult};
use crate::types::{AudioSample, AUDIO_CHANNELS, SAMPLES_PER_FRAME};

/// Encodes 20ms stereo PCM frames to Opus. One encoder per active
/// outbound stream (the Mixer owns exactly one).
pub struct FrameEncoder {
    inner: OpusEncoder,
}

impl FrameEncoder {
    pub fn new() -> DexterResult<Self> {
        let inner = OpusEncoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Voip)
            .map_err(|e| DexterError::Unrecoverable(format!("opus encoder init: {e}")))?;
        Ok(Self { inner })
    }

    /// Encode one 20ms stereo frame (`SAMPLES_PER_FRAME` interleaved
    /// i16 samples) into an Opus packet.
    pub fn encode_frame(&mut self, pcm: &[AudioSample]) -> DexterResult<Vec<u8>> {
        if pcm.len() != SAMPLES_PER_FRAME {
            return Err(DexterError::MalformedInput(format!(
                "expected {} samples, got {}",
                SAMPLES_PER_FRAME,
                pcm.len()
            )));
        }
        let mut out = vec![0u8; 4000];
        let written = self
            .inner
            .encode(pcm, &mut out)
            .map_err(|e| DexterError::Unrecoverable(format!("opus encode: {e}")))?;
        out.truncate(written);
        Ok(out)
    }

    /// Encode a silent (all-zero) frame, used by the Mixer's
    /// trailing-silence ticks (§4.2, §8 round-trip law).
    pub fn encode_silence(&mut self) -> DexterResult<Vec<u8>> {
        self.encode_frame(&[0; SAMPLES_PER_FRAME])
    }
}

/// Decodes Opus packets back to 20ms stereo PCM. One decoder per
/// `UserRecording` (§3): the spec requires each user's decode state
/// be independent so that packet loss on one SSRC never corrupts
/// another user's stream.
pub struct FrameDecoder {
    inner: OpusDecoder,
}

impl FrameDecoder {
    pub fn new() -> DexterResult<Self> {
        let inner = OpusDecoder::new(SampleRate::Hz48000, Channels::Stereo)
            .map_err(|e| DexterError::Unrecoverable(format!("opus decoder init: {e}")))?;
        Ok(Self { inner })
    }

    /// Decode one packet to PCM. A decoder error is reported and the
    /// caller drops just this frame (§4.1 Failure semantics) rather
    /// than tearing down the recording.
    pub fn decode_frame(&mut self, packet: &[u8]) -> DexterResult<Vec<AudioSample>> {
        let mut out = vec![0i16; SAMPLES_PER_FRAME];
        let written = self
            .inner
            .decode(Some(packet), &mut out, false)
            .map_err(|e| DexterError::MalformedInput(format!("opus decode: {e}")))?;
        out.truncate(written * AUDIO_CHANNELS);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_silent_frame() {
        let mut enc = FrameEncoder::new().unwrap();
        let packet = enc.encode_silence().unwrap();
        assert!(!packet.is_empty());

        let mut dec = FrameDecoder::new().unwrap();
        let pcm = dec.decode_frame(&packet).unwrap();
        assert_eq!(pcm.len(), SAMPLES_PER_FRAME);
        assert!(pcm.iter().all(|&s| s.abs() < 50));
    }

    #[test]
    fn rejects_wrong_sized_frame() {
        let mut enc = FrameEncoder::new().unwrap();
        let err = enc.encode_frame(&[0; 10]).unwrap_err();
        assert!(matches!(err, DexterError::MalformedInput(_)));
    }
}
