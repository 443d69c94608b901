//! Route handlers for the HTTP surface (§6).
//!
//! One handler per endpoint, each taking `State<Arc<AppState>>` plus a
//! typed JSON body, returning a typed JSON body or the mapped
//! `DexterError` status. The caller-auth check runs as an
//! `axum::middleware::from_fn_with_state` layer ahead of every route.

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::adapters::event_bus::{BotStatusUpdate, EventCommon, EventEnvelope};
use crate::error::DexterError;
use crate::types::{ChannelId, MessageId};

use super::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/post", post(post_message))
        .route("/audio/play", post(play_audio))
        .route("/stream/start", post(stream_start))
        .route("/stream/update", post(stream_update))
        .route("/stream/complete", post(stream_complete))
        .route("/status", post(set_status))
        .route("/typing", post(typing))
        .route("/audio/:key", get(fetch_audio))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), require_caller_auth))
        .with_state(state)
}

/// §1/§7 "Malformed input" boundary — every request must carry one of
/// the configured caller-auth header values. Disabled (no-op) when the
/// allowlist is empty, which is the local-dev default.
const AUTH_HEADER: &str = "x-dexter-caller-auth";

async fn require_caller_auth(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: axum::http::Request<axum::body::Body>,
    next: Next<axum::body::Body>,
) -> Response {
    if state.auth_allowlist.is_empty() {
        return next.run(request).await;
    }
    let authorized = headers
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| state.auth_allowlist.contains(v))
        .unwrap_or(false);

    if authorized {
        next.run(request).await
    } else {
        map_error(DexterError::MalformedInput(format!(
            "missing or unrecognized {AUTH_HEADER} header"
        )))
    }
}

fn map_error(err: DexterError) -> Response {
    let status = match err {
        DexterError::MalformedInput(_) => StatusCode::BAD_REQUEST,
        DexterError::ResourceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

#[derive(Debug, Deserialize)]
struct PostRequest {
    channel: ChannelId,
    content: String,
}

#[derive(Debug, Serialize)]
struct PostResponse {
    message_id: MessageId,
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PostRequest>,
) -> Response {
    if req.content.trim().is_empty() {
        return map_error(DexterError::MalformedInput("content must not be empty".into()));
    }
    match state.gateway.post_text(req.channel, &req.content).await {
        Ok(message_id) => Json(PostResponse { message_id }).into_response(),
        Err(e) => map_error(e),
    }
}

/// §6 "POST /audio/play (stream inbound bytes into the voice lane)".
/// `application/json` bodies are `{"text": ...}` and go through the
/// TTS endpoint's transcode step first (§6 "TTS endpoint"); any other
/// content type is treated as already-PCM (little-endian 16-bit
/// stereo at 48kHz, the Mixer's native feeder format).
async fn play_audio(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    if body.is_empty() {
        return map_error(DexterError::MalformedInput("empty audio body".into()));
    }

    let is_json = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);

    let pcm = if is_json {
        #[derive(Deserialize)]
        struct SynthesizeRequest {
            text: String,
        }
        let req: SynthesizeRequest = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => return map_error(DexterError::MalformedInput(format!("invalid synthesize body: {e}"))),
        };
        match state.tts.synthesize_to_pcm(&req.text).await {
            Ok(pcm) => pcm,
            Err(e) => return map_error(e),
        }
    } else {
        body.to_vec()
    };

    let cursor = Cursor::new(pcm);
    match state.coordinator.play_voice(cursor).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => map_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct StreamStartRequest {
    channel: ChannelId,
    placeholder: Option<String>,
}

#[derive(Debug, Serialize)]
struct StreamStartResponse {
    session_id: MessageId,
}

async fn stream_start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StreamStartRequest>,
) -> Response {
    match state
        .editor
        .start_stream(req.channel, req.placeholder.as_deref())
        .await
    {
        Ok(session_id) => Json(StreamStartResponse { session_id }).into_response(),
        Err(e) => map_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct StreamUpdateRequest {
    session_id: MessageId,
    content: String,
}

async fn stream_update(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StreamUpdateRequest>,
) -> Response {
    if !state.editor.is_live(req.session_id).await {
        return map_error(DexterError::MalformedInput("unknown stream session_id".into()));
    }
    state.editor.update_stream(req.session_id, req.content).await;
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Debug, Deserialize)]
struct StreamCompleteRequest {
    session_id: MessageId,
    content: String,
}

async fn stream_complete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StreamCompleteRequest>,
) -> Response {
    if !state.editor.is_live(req.session_id).await {
        return map_error(DexterError::MalformedInput("unknown stream session_id".into()));
    }
    state.editor.complete(req.session_id, req.content).await;
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    text: String,
}

async fn set_status(State(state): State<Arc<AppState>>, Json(req): Json<StatusRequest>) -> Response {
    if let Err(e) = state.gateway.set_presence(&req.text).await {
        return map_error(e);
    }

    let event = EventEnvelope::BotStatusUpdate(BotStatusUpdate {
        common: EventCommon {
            source: "discord".into(),
            user_id: None,
            user_name: None,
            user_level: None,
            channel_id: None,
            channel_name: None,
            server_id: None,
            server_name: None,
            timestamp: unix_now(),
        },
        status: req.text,
    });
    if let Err(e) = state.event_bus.publish(&event).await {
        tracing::warn!(error = %e, "failed to publish status-update event");
    }
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Debug, Deserialize)]
struct TypingRequest {
    channel: ChannelId,
}

async fn typing(State(state): State<Arc<AppState>>, Json(req): Json<TypingRequest>) -> Response {
    match state.gateway.broadcast_typing(req.channel).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => map_error(e),
    }
}

/// §6 "GET /audio/{key} (fetch a stored utterance)". `key` is either a
/// `discord-audio:*` KV key or a WAV filename under `--audio-dir`,
/// mirroring the Recorder's own fallback order (§4.1 persistence).
async fn fetch_audio(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> Response {
    let is_single_segment = std::path::Path::new(&key).components().count() == 1
        && !key.contains("..")
        && !key.starts_with('/');
    if !is_single_segment {
        return map_error(DexterError::MalformedInput(format!("invalid audio key {key}")));
    }

    if let Ok(Some(bytes)) = state.kv.get_audio_blob(&key).await {
        return (
            [("content-type", "audio/wav")],
            bytes,
        )
            .into_response();
    }

    let path = state.audio_dir.join(&key);
    match tokio::fs::read(&path).await {
        Ok(bytes) => ([("content-type", "audio/wav")], bytes).into_response(),
        Err(_) => map_error(DexterError::ResourceUnavailable(format!("no stored utterance for {key}"))),
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

    #[test]
    fn malformed_input_maps_to_400() {
        let resp = map_error(DexterError::MalformedInput("bad".into()));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn resource_unavailable_maps_to_503() {
        let resp = map_error(DexterError::ResourceUnavailable("bad".into()));
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn unexpected_error_maps_to_500() {
        let resp = map_error(DexterError::Unrecoverable("bad".into()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
