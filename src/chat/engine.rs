//! Chat engine — wires the external engagement classifier and
//! chat-model stream into the Streaming Editor, completing the
//! outbound text data flow named in §2: "Engagement → Chat model
//! stream → Streaming Editor → Gateway." Neither the classifier nor
//! the chat model is itself part of the core (§1 "out of scope"), but
//! something has to drive the editor from their output, and this is
//! that driver.

use std::sync::Arc;

use crate::adapters::chat_model::{ChatMessage, ChatModelClient, EngagementAction};
use crate::chat::streaming_editor::{ChatPoster, StreamingEditor};
use crate::error::DexterResult;
use crate::types::ChannelId;

/// §7 "Non-local failures are reported to the user as a replacement
/// message ... rather than a stack trace."
const APOLOGY: &str = "Sorry, I couldn't figure out how to respond.";

pub struct ChatEngine<P: ChatPoster> {
    chat_model: Arc<ChatModelClient>,
    editor: Arc<StreamingEditor<P>>,
}

impl<P: ChatPoster> ChatEngine<P> {
    pub fn new(chat_model: Arc<ChatModelClient>, editor: Arc<StreamingEditor<P>>) -> Self {
        Self { chat_model, editor }
    }

    /// Classify whether to engage with this conversation, and if so,
    /// drive a streamed reply through the editor.
    pub async fn handle_conversation(&self, channel: ChannelId, history: Vec<ChatMessage>) -> DexterResult<()> {
        let engagement = self.chat_model.classify_engagement(history.clone()).await?;
        match engagement.action {
            EngagementAction::Reply => self.stream_reply(channel, history).await,
            EngagementAction::React | EngagementAction::Continue | EngagementAction::Stop | EngagementAction::Ignore => {
                Ok(())
            }
        }
    }

    async fn stream_reply(&self, channel: ChannelId, history: Vec<ChatMessage>) -> DexterResult<()> {
        let session_id = self.editor.start_stream(channel, None).await?;

        let mut rx = match self.chat_model.stream_chat(history).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!(error = %e, "chat-model stream failed to open");
                self.editor.fail(session_id, APOLOGY).await;
                return Err(e);
            }
        };

        let mut last_content = String::new();
        while let Some(accumulated) = rx.recv().await {
            last_content = accumulated.clone();
            self.editor.update_stream(session_id, accumulated).await;
        }

        // §9 "premature producer cancellation should mark the session
        // Done with the accumulated content" — the receiver closing
        // (stream finished or was cancelled) is a normal termination
        // either way, so `Complete` always runs here.
        self.editor.complete(session_id, last_content).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DexterError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    struct FakePoster {
        next_id: AtomicU64,
        posts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatPoster for FakePoster {
        async fn post(&self, _channel: ChannelId, content: &str) -> DexterResult<u64> {
            self.posts.lock().unwrap().push(content.to_string());
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
        }
        async fn edit(&self, _channel: ChannelId, _message: u64, _content: &str) -> DexterResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn engagement_call_failure_propagates_without_starting_a_session() {
        let chat_model = Arc::new(ChatModelClient::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1",
            "test-model",
        ));
        let editor = Arc::new(StreamingEditor::new(FakePoster {
            next_id: AtomicU64::new(1),
            posts: Mutex::new(vec![]),
        }));
        let engine = ChatEngine::new(chat_model, editor);
        let err = engine
            .handle_conversation(7, vec![ChatMessage { role: "user".into(), content: "hi".into() }])
            .await
            .unwrap_err();
        assert!(matches!(err, DexterError::Transient { .. }));
    }
}
