//! Process entry point — §10.1 process shape, §10.5 graceful shutdown.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use futures::FutureExt;
use serenity::model::id::{ChannelId as SerenityChannelId, GuildId as SerenityGuildId};
use serenity::prelude::GatewayIntents;
use serenity::Client;
use songbird::SerenityInit;

use dexter::adapters::chat_model::ChatModelClient;
use dexter::adapters::event_bus::EventBusClient;
use dexter::adapters::kv::KvStore;
use dexter::adapters::stt::SttWorker;
use dexter::adapters::tts::TtsClient;
use dexter::chat::catchup::CatchupReplayer;
use dexter::chat::engine::ChatEngine;
use dexter::chat::roles::RoleEnforcer;
use dexter::chat::streaming_editor::StreamingEditor;
use dexter::config::Args;
use dexter::error::{DexterError, DexterResult};
use dexter::gateway::handler::{DiscordChatPoster, DiscordHistoryProvider, DiscordRoleAdmin, GatewayHandle, Handler};
use dexter::http::{self, AppState};
use dexter::voice::coordinator::{watchdog_forever, CallProvider, VoiceCoordinator};
use dexter::voice::recorder::{monitor_silence_forever, Recorder};
use dexter::voice::ssrc_table::SsrcTable;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = args.validate() {
        eprintln!("{e}");
        std::process::exit(1);
    }
    dexter::logging::init(args.log_format);

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> DexterResult<()> {
    let http_client = reqwest::Client::new();

    let kv = KvStore::connect_redis(&args.kv_url).await?;
    let event_bus = Arc::new(EventBusClient::new(http_client.clone(), args.event_bus_url.clone()));
    let chat_model = Arc::new(ChatModelClient::new(
        http_client.clone(),
        args.chat_model_base.clone(),
        args.chat_model_name.clone(),
    ));
    let tts = Arc::new(TtsClient::new(http_client.clone(), args.tts_base.clone()));
    let stt = SttWorker::new(&args.stt_binary);

    let ssrc_table = Arc::new(SsrcTable::new());
    let recorder = Arc::new(Recorder::new(
        ssrc_table,
        kv.clone(),
        Arc::clone(&event_bus),
        stt,
        args.resolved_audio_dir(),
    ));

    let songbird = songbird::Songbird::serenity();
    let call_provider: CallProvider = {
        let songbird = Arc::clone(&songbird);
        Arc::new(move |guild, channel| {
            let songbird = Arc::clone(&songbird);
            async move {
                let (call, join_result) = songbird
                    .join(SerenityGuildId(guild), SerenityChannelId(channel))
                    .await;
                join_result
                    .map_err(|e| DexterError::ResourceUnavailable(format!("voice join failed: {e:?}")))?;
                Ok(call)
            }
            .boxed()
        })
    };

    let coordinator = VoiceCoordinator::new(
        Arc::clone(&recorder),
        Arc::clone(&event_bus),
        call_provider,
        args.master_user_id,
        args.default_voice_channel_id,
    );

    let http_handle = Arc::new(serenity::http::Http::new(&args.discord_token));
    let gateway_handle = GatewayHandle::new(Arc::clone(&http_handle));

    let editor = Arc::new(StreamingEditor::new(DiscordChatPoster::new(Arc::clone(&http_handle))));
    let chat_engine = Arc::new(ChatEngine::new(Arc::clone(&chat_model), Arc::clone(&editor)));

    let role_enforcer = Arc::new(RoleEnforcer::new(
        DiscordRoleAdmin::new(Arc::clone(&http_handle)),
        kv.clone(),
        args.default_system_role_id,
    ));

    let catchup = Arc::new(CatchupReplayer::new(
        Arc::clone(&event_bus),
        DiscordHistoryProvider::new(Arc::clone(&http_handle)),
    ));

    let handler = Handler {
        coordinator: Arc::clone(&coordinator),
        role_enforcer: Arc::clone(&role_enforcer),
        chat_engine: Arc::clone(&chat_engine),
        catchup: Arc::clone(&catchup),
        event_bus: Arc::clone(&event_bus),
        gateway_handle: Arc::clone(&gateway_handle),
        ready_flag: AtomicBool::new(false),
    };

    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MEMBERS;

    let client = Client::builder(&args.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(Arc::clone(&songbird))
        .await
        .map_err(|e| DexterError::Unrecoverable(format!("failed to build discord client: {e}")))?;

    write_process_info(&kv).await;

    let watchdog = tokio::spawn(watchdog_forever(Arc::clone(&coordinator)));
    let silence_monitor = tokio::spawn(monitor_silence_forever(Arc::clone(&recorder)));
    let editor_ticker = tokio::spawn({
        let editor = Arc::clone(&editor);
        async move { editor.run_tick_loop().await }
    });
    let health_refresher = tokio::spawn(refresh_process_info_forever(kv.clone()));

    let app_state = Arc::new(AppState {
        gateway: Arc::clone(&gateway_handle),
        coordinator: Arc::clone(&coordinator),
        editor: Arc::clone(&editor),
        tts,
        kv: kv.clone(),
        event_bus: Arc::clone(&event_bus),
        audio_dir: args.resolved_audio_dir(),
        auth_allowlist: args.caller_auth_headers.iter().cloned().collect::<HashSet<_>>(),
    });
    let http_addr = args
        .http_addr
        .parse()
        .map_err(|e| DexterError::Unrecoverable(format!("invalid --http-addr: {e}")))?;
    let http_server = tokio::spawn(http::serve(http_addr, app_state));

    tokio::spawn(dexter::gateway::session::run_forever(client));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| DexterError::Unrecoverable(format!("failed to install signal handler: {e}")))?;
    tracing::info!("shutdown signal received, tearing down");

    watchdog.abort();
    silence_monitor.abort();
    editor_ticker.abort();
    health_refresher.abort();
    http_server.abort();

    coordinator.stop();
    coordinator.leave().await;
    recorder.stop_all_recordings().await;

    tracing::info!("shutdown complete");
    Ok(())
}

/// §10.5 "Health reporting" — `process:info:{id}` has no assigned
/// writer in §6's own KV prefix table, so the process claims it here.
async fn write_process_info(kv: &KvStore) {
    #[derive(serde::Serialize)]
    struct ProcessInfo<'a> {
        version: &'a str,
        started_unix: u64,
    }
    let info = ProcessInfo {
        version: env!("CARGO_PKG_VERSION"),
        started_unix: unix_now(),
    };
    if let Err(e) = kv.put_process_info("dexter", &info).await {
        tracing::warn!(error = %e, "failed to write startup process info");
    }
}

async fn refresh_process_info_forever(kv: KvStore) {
    #[derive(serde::Serialize)]
    struct ProcessInfo<'a> {
        version: &'a str,
        uptime_secs: u64,
    }
    let started = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
    loop {
        ticker.tick().await;
        let info = ProcessInfo {
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: started.elapsed().as_secs(),
        };
        if let Err(e) = kv.put_process_info("dexter", &info).await {
            tracing::warn!(error = %e, "failed to refresh process info");
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
