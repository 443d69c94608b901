//! HTTP surface exposed by the core — §6, §10.5.
//!
//! Thin `axum` router over the voice coordinator, streaming editor,
//! TTS adapter and KV store, the same "one `axum::Router` with a
//! shared `Arc<AppState>` extension" shape the corpus's web-facing
//! services use (`mmogr-gglib`'s `gglib-axum`, `Duocast-TSOD`'s
//! control plane).

mod routes;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;

use crate::adapters::event_bus::EventBusClient;
use crate::adapters::kv::KvStore;
use crate::adapters::tts::TtsClient;
use crate::chat::streaming_editor::StreamingEditor;
use crate::error::DexterResult;
use crate::gateway::handler::{DiscordChatPoster, GatewayHandle};
use crate::voice::coordinator::VoiceCoordinator;

pub struct AppState {
    pub gateway: Arc<GatewayHandle>,
    pub coordinator: Arc<VoiceCoordinator>,
    pub editor: Arc<StreamingEditor<DiscordChatPoster>>,
    pub tts: Arc<TtsClient>,
    pub kv: KvStore,
    pub event_bus: Arc<EventBusClient>,
    pub audio_dir: PathBuf,
    /// Allowlisted caller-auth header values (§1, §7 "Malformed input"
    /// boundary). Empty means the check is disabled (local dev).
    pub auth_allowlist: HashSet<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    routes::router(state)
}

pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> DexterResult<()> {
    let app = router(state);
    tracing::info!(%addr, "http surface listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|e| crate::error::DexterError::Unrecoverable(format!("http server failed: {e}")))
}
