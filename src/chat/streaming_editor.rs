//! C4 — Streaming Editor. §3, §4.4, §8.
//!
//! Generalizes the teacher's one-shot `text_callback` in
//! `model.rs::Model::load` (a single completed transcript, delivered
//! once) into a growing response that is edited into place at a
//! bounded rate and expands across the platform's 2000-character
//! message limit (§4.4 Chunking rule).

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{DexterError, DexterResult};
use crate::types::{
    ChannelId, MessageId, CHUNK_NEWLINE_WINDOW, CHUNK_SOFT_MAX, CHUNK_SPACE_WINDOW,
    EDITOR_TICK_MS,
};

/// Platform operations the editor needs: post a new message, edit an
/// existing one. Implemented against serenity's `Http` in
/// `crate::gateway::handler`; a fake in tests. An edit against a
/// message the user deleted must return [`DexterError::DeletedTarget`]
/// (§7 "Deleted-target").
#[async_trait]
pub trait ChatPoster: Send + Sync {
    async fn post(&self, channel: ChannelId, content: &str) -> DexterResult<MessageId>;
    async fn edit(&self, channel: ChannelId, message: MessageId, content: &str) -> DexterResult<()>;
}

/// §3 `StreamSession`.
struct StreamSession {
    channel: ChannelId,
    message_ids: Vec<MessageId>,
    target_content: String,
    last_sent_chunks: Vec<String>,
    done: bool,
    last_edit_at: Instant,
}

impl StreamSession {
    fn is_synced(&self, chunks: &[String]) -> bool {
        self.message_ids.len() == chunks.len()
            && self.last_sent_chunks.len() == chunks.len()
            && self.last_sent_chunks.iter().zip(chunks).all(|(a, b)| a == b)
    }
}

/// C4 — one scheduler drives every live session's tick loop (§4.4
/// "Tick loop"). Keyed by the identifier of the session's first
/// posted message (§3 "Identified by the first posted chat message").
pub struct StreamingEditor<P: ChatPoster> {
    poster: P,
    sessions: RwLock<HashMap<MessageId, StreamSession>>,
}

impl<P: ChatPoster> StreamingEditor<P> {
    pub fn new(poster: P) -> Self {
        Self {
            poster,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// `StartStream` — posts the first message (placeholder by
    /// default) and returns its id as the session handle (§4.4).
    pub async fn start_stream(
        &self,
        channel: ChannelId,
        placeholder: Option<&str>,
    ) -> DexterResult<MessageId> {
        let content = placeholder.unwrap_or(TYPING_PLACEHOLDER);
        let first_id = self.poster.post(channel, content).await?;

        let session = StreamSession {
            channel,
            message_ids: vec![first_id],
            target_content: content.to_string(),
            last_sent_chunks: vec![content.to_string()],
            done: false,
            last_edit_at: Instant::now(),
        };
        self.sessions.write().await.insert(first_id, session);
        Ok(first_id)
    }

    /// `UpdateStream` — replaces the target content. Ignored once the
    /// session is `Done` (§4.4 "Start / Update / Complete API").
    pub async fn update_stream(&self, session_id: MessageId, content: impl Into<String>) {
        if let Some(session) = self.sessions.write().await.get_mut(&session_id) {
            if !session.done {
                session.target_content = content.into();
            }
        }
    }

    /// `Complete` — flips `Done` and supplies final content.
    pub async fn complete(&self, session_id: MessageId, final_content: impl Into<String>) {
        if let Some(session) = self.sessions.write().await.get_mut(&session_id) {
            session.target_content = final_content.into();
            session.done = true;
        }
    }

    /// §7 "A failed outbound chat finalizes the stream session with
    /// an apology string": used by the caller (the chat engine) when
    /// the upstream chat-model stream fails mid-flight.
    pub async fn fail(&self, session_id: MessageId, apology: impl Into<String>) {
        self.complete(session_id, apology).await;
    }

    pub async fn is_live(&self, session_id: MessageId) -> bool {
        self.sessions.read().await.contains_key(&session_id)
    }

    /// One 500ms scheduler tick across all live sessions (§4.4).
    /// Intended to be spawned once and run forever.
    pub async fn run_tick_loop(&self) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(EDITOR_TICK_MS));
        loop {
            ticker.tick().await;
            self.tick_once().await;
        }
    }

    /// One iteration, factored out for direct testing.
    pub async fn tick_once(&self) {
        let ids: Vec<MessageId> = self.sessions.read().await.keys().copied().collect();
        for id in ids {
            self.tick_session(id).await;
        }
    }

    async fn tick_session(&self, session_id: MessageId) {
        let Some(mut session) = self.sessions.write().await.remove(&session_id) else {
            return;
        };

        let chunks = chunk_content(&session.target_content);

        // Step 2: Expand.
        while session.message_ids.len() < chunks.len() {
            let next_index = session.message_ids.len();
            match self.poster.post(session.channel, &chunks[next_index]).await {
                Ok(new_id) => {
                    session.message_ids.push(new_id);
                    session.last_sent_chunks.push(chunks[next_index].clone());
                }
                Err(e) => {
                    tracing::warn!(session = session_id, error = %e, "failed to expand stream, retrying next tick");
                    break;
                }
            }
        }

        // Step 3: Edit, in chunk-index order (§5 Ordering guarantees).
        let synced_len = session.message_ids.len().min(chunks.len());
        for i in 0..synced_len {
            if session.last_sent_chunks.get(i) == Some(&chunks[i]) {
                continue;
            }
            let message_id = session.message_ids[i];
            match self.poster.edit(session.channel, message_id, &chunks[i]).await {
                Ok(()) => {
                    session.last_sent_chunks[i] = chunks[i].clone();
                    session.last_edit_at = Instant::now();
                }
                Err(e) if e.is_deleted_target() => {
                    tracing::info!(session = session_id, index = i, "chunk message deleted, reposting");
                    match self.poster.post(session.channel, &chunks[i]).await {
                        Ok(new_id) => {
                            let was_first = i == 0 && message_id == session_id;
                            session.message_ids[i] = new_id;
                            session.last_sent_chunks[i] = chunks[i].clone();
                            session.last_edit_at = Instant::now();
                            if was_first {
                                // §3 "recovering the first-message identifier if
                                // it was the victim" — the session's own key is
                                // that id, so re-key the map entry below.
                                self.sessions.write().await.insert(new_id, session);
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(session = session_id, index = i, error = %e, "failed to repost deleted chunk, retrying next tick");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(session = session_id, index = i, error = %e, "edit failed, retrying next tick");
                }
            }
        }

        // Step 4: Sync check — delete one tick after Done && synced.
        if session.done && session.is_synced(&chunks) {
            tracing::debug!(session = session_id, "stream session complete and synced, removing");
            return;
        }

        self.sessions.write().await.insert(session_id, session);
    }

    #[cfg(test)]
    async fn session_snapshot(&self, session_id: MessageId) -> Option<(Vec<MessageId>, Vec<String>, bool)> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .map(|s| (s.message_ids.clone(), s.last_sent_chunks.clone(), s.done))
    }
}

const TYPING_PLACEHOLDER: &str = "\u{2026}"; // horizontal ellipsis, stand-in for an animated typing marker

/// §4.4 "Chunking rule". Operates on unicode scalar values (code
/// points), not bytes, per spec. Prefers splitting at the most recent
/// newline within the last 500 characters of the window; otherwise at
/// the most recent space within the last 200; otherwise force-splits.
/// The separator is kept in the *previous* chunk.
pub fn chunk_content(content: &str) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let remaining = chars.len() - start;
        if remaining <= CHUNK_SOFT_MAX {
            chunks.push(chars[start..].iter().collect());
            break;
        }

        let window_end = start + CHUNK_SOFT_MAX;
        let newline_from = window_end.saturating_sub(CHUNK_NEWLINE_WINDOW).max(start);
        let split_at = (newline_from..window_end)
            .rev()
            .find(|&i| chars[i] == '\n')
            .map(|i| i + 1)
            .or_else(|| {
                let space_from = window_end.saturating_sub(CHUNK_SPACE_WINDOW).max(start);
                (space_from..window_end).rev().find(|&i| chars[i] == ' ').map(|i| i + 1)
            })
            .unwrap_or(window_end);

        chunks.push(chars[start..split_at].iter().collect());
        start = split_at;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[test]
    fn short_content_is_one_chunk() {
        let content = "a".repeat(1999);
        let chunks = chunk_content(&content);
        assert_eq!(chunks, vec![content]);
    }

    #[test]
    fn splits_at_newline_within_window() {
        let content = format!("{}\n{}", "a".repeat(1999), "b".repeat(500));
        let chunks = chunk_content(&content);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], format!("{}\n", "a".repeat(1999)));
        assert_eq!(chunks[1], "b".repeat(500));
    }

    #[test]
    fn force_splits_when_no_separator_found() {
        let content = "a".repeat(4500);
        let chunks = chunk_content(&content);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), CHUNK_SOFT_MAX);
        assert_eq!(chunks[1].chars().count(), CHUNK_SOFT_MAX);
        assert_eq!(chunks[2].chars().count(), 500);
    }

    struct FakePoster {
        next_id: AtomicU64,
        posts: Mutex<Vec<(ChannelId, String)>>,
        edits: Mutex<Vec<(MessageId, String)>>,
        deleted: Mutex<std::collections::HashSet<MessageId>>,
    }

    impl FakePoster {
        fn new() -> Self {
            Self {
                next_id: AtomicU64::new(1),
                posts: Mutex::new(Vec::new()),
                edits: Mutex::new(Vec::new()),
                deleted: Mutex::new(std::collections::HashSet::new()),
            }
        }

        fn delete(&self, id: MessageId) {
            self.deleted.lock().unwrap().insert(id);
        }
    }

    #[async_trait]
    impl ChatPoster for FakePoster {
        async fn post(&self, channel: ChannelId, content: &str) -> DexterResult<MessageId> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.posts.lock().unwrap().push((channel, content.to_string()));
            Ok(id)
        }

        async fn edit(&self, _channel: ChannelId, message: MessageId, content: &str) -> DexterResult<()> {
            if self.deleted.lock().unwrap().contains(&message) {
                return Err(DexterError::DeletedTarget(format!("message {message}")));
            }
            self.edits.lock().unwrap().push((message, content.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn update_then_tick_concatenates_to_target() {
        let editor = StreamingEditor::new(FakePoster::new());
        let id = editor.start_stream(7, None).await.unwrap();
        editor.update_stream(id, "hello world").await;
        editor.tick_once().await;

        let (ids, chunks, done) = editor.session_snapshot(id).await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(chunks.concat(), "hello world");
        assert!(!done);
    }

    #[tokio::test]
    async fn long_content_expands_into_multiple_messages() {
        let editor = StreamingEditor::new(FakePoster::new());
        let id = editor.start_stream(7, None).await.unwrap();
        let long = "x".repeat(5200);
        editor.update_stream(id, long.clone()).await;
        editor.tick_once().await;

        let (ids, chunks, _done) = editor.session_snapshot(id).await.unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(chunks.concat(), long);
    }

    #[tokio::test]
    async fn done_and_synced_session_is_removed_one_tick_later() {
        let editor = StreamingEditor::new(FakePoster::new());
        let id = editor.start_stream(7, None).await.unwrap();
        editor.complete(id, "done").await;
        editor.tick_once().await;
        assert!(!editor.is_live(id).await);
    }

    #[tokio::test]
    async fn deleted_middle_chunk_is_reposted_and_resumes_editing() {
        let poster = FakePoster::new();
        let editor = StreamingEditor::new(poster);
        let id = editor.start_stream(7, None).await.unwrap();
        let long = "x".repeat(4200);
        editor.update_stream(id, long.clone()).await;
        editor.tick_once().await;

        let (ids_before, _, _) = editor.session_snapshot(id).await.unwrap();
        assert_eq!(ids_before.len(), 3);
        let victim = ids_before[1];
        editor.poster.delete(victim);

        // force a re-edit by changing content slightly
        editor.update_stream(id, format!("{long}!")).await;
        editor.tick_once().await;

        let (ids_after, _, _) = editor.session_snapshot(id).await.unwrap();
        assert_ne!(ids_after[1], victim);
    }
}
