//! Chat-model streaming endpoint and engagement classifier — §6.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{DexterError, DexterResult};

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    message: ChatStreamMessage,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct ChatStreamMessage {
    #[allow(dead_code)]
    role: String,
    content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EngagementAction {
    Reply,
    React,
    Stop,
    Continue,
    Ignore,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngagementResponse {
    #[serde(deserialize_with = "deserialize_action_lenient")]
    pub action: EngagementAction,
    pub argument: Option<String>,
}

fn deserialize_action_lenient<'de, D>(d: D) -> Result<EngagementAction, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(d)?;
    Ok(match raw.as_str() {
        "REPLY" => EngagementAction::Reply,
        "REACT" => EngagementAction::React,
        "STOP" => EngagementAction::Stop,
        "CONTINUE" => EngagementAction::Continue,
        // Unknown actions map to IGNORE (§6).
        _ => EngagementAction::Ignore,
    })
}

pub struct ChatModelClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl ChatModelClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    /// Open a streaming chat completion. Each accumulated-content
    /// update is pushed to the returned receiver; the sender side
    /// drives a [`crate::chat::streaming_editor::StreamSession`] via
    /// `UpdateStream`/`Complete`. Cancellation of the returned join
    /// handle (dropping the receiver) is a normal termination (§5, §9).
    pub async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
    ) -> DexterResult<mpsc::Receiver<String>> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: &messages,
            stream: true,
        };

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DexterError::transient(1, e))?;

        if !resp.status().is_success() {
            return Err(DexterError::ResourceUnavailable(format!(
                "chat model returned {}",
                resp.status()
            )));
        }

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut accumulated = String::new();
            let mut byte_stream = resp.bytes_stream();
            let mut carry = Vec::new();

            while let Some(chunk) = byte_stream.next().await {
                let Ok(chunk) = chunk else { break };
                carry.extend_from_slice(&chunk);

                while let Some(pos) = carry.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = carry.drain(..=pos).collect();
                    let line = &line[..line.len() - 1];
                    if line.iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }
                    let Ok(parsed) = serde_json::from_slice::<ChatStreamChunk>(line) else {
                        continue;
                    };
                    accumulated.push_str(&parsed.message.content);
                    if tx.send(accumulated.clone()).await.is_err() {
                        return;
                    }
                    if parsed.done {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    /// Non-streaming engagement classification (§6).
    pub async fn classify_engagement(
        &self,
        messages: Vec<ChatMessage>,
    ) -> DexterResult<EngagementResponse> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: &messages,
            stream: false,
        };
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DexterError::transient(1, e))?;

        if !resp.status().is_success() {
            return Err(DexterError::ResourceUnavailable(format!(
                "engagement classifier returned {}",
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| DexterError::ResourceUnavailable(format!("bad engagement payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_action_maps_to_ignore() {
        let parsed: EngagementResponse =
            serde_json::from_str(r#"{"action":"DANCE","argument":null}"#).unwrap();
        assert_eq!(parsed.action, EngagementAction::Ignore);
    }

    #[test]
    fn known_action_round_trips() {
        let parsed: EngagementResponse =
            serde_json::from_str(r#"{"action":"REPLY","argument":"hi"}"#).unwrap();
        assert_eq!(parsed.action, EngagementAction::Reply);
        assert_eq!(parsed.argument.as_deref(), Some("hi"));
    }
}
