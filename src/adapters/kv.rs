//! Key-value store adapter — §6.
//!
//! Plain string keys; values are UTF-8 JSON or raw bytes. Recognized
//! prefixes and their TTLs are documented at each helper below.
//! Backed by `redis` with the `tokio-comp`/`connection-manager`
//! features (the async client reconnects on its own), matching the
//! corpus's redis usage (`gjovanov-roomler2`). The raw byte
//! operations sit behind [`KvBackend`] so callers can be tested
//! against [`InMemoryKv`] without a live redis, the same way the
//! teacher's own transcription dependency was hidden behind a trait
//! object (`Arc<Mutex<dyn VoiceRecognizer + Send + Sync>>` in the
//! wider corpus's `junioramilson-discord-voice-recognizer`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;

use crate::error::{DexterError, DexterResult};

#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get_bytes(&self, key: &str) -> DexterResult<Option<Vec<u8>>>;
    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> DexterResult<()>;
}

pub struct RedisKv {
    manager: redis::aio::ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> DexterResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| DexterError::Unrecoverable(format!("invalid kv url: {e}")))?;
        let manager = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| DexterError::ResourceUnavailable(format!("kv store unreachable: {e}")))?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl KvBackend for RedisKv {
    async fn get_bytes(&self, key: &str) -> DexterResult<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        conn.get(key)
            .await
            .map_err(|e| DexterError::ResourceUnavailable(format!("kv read failed: {e}")))
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> DexterResult<()> {
        let mut conn = self.manager.clone();
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs())
                .await
                .map_err(|e| DexterError::ResourceUnavailable(format!("kv write failed: {e}"))),
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(|e| DexterError::ResourceUnavailable(format!("kv write failed: {e}"))),
        }
    }
}

/// In-memory stand-in for tests and for the local-dev fallback path.
#[derive(Default)]
pub struct InMemoryKv {
    entries: Mutex<HashMap<String, (Vec<u8>, Option<Instant>)>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for InMemoryKv {
    async fn get_bytes(&self, key: &str) -> DexterResult<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().await;
        if let Some((_, Some(expires_at))) = entries.get(key) {
            if Instant::now() >= *expires_at {
                entries.remove(key);
                return Ok(None);
            }
        }
        Ok(entries.get(key).map(|(v, _)| v.clone()))
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> DexterResult<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value, expires_at));
        Ok(())
    }
}

/// Typed helpers over the recognized key prefixes from §6, built atop
/// any [`KvBackend`].
#[derive(Clone)]
pub struct KvStore {
    backend: Arc<dyn KvBackend>,
}

impl KvStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub async fn connect_redis(url: &str) -> DexterResult<Self> {
        Ok(Self::new(Arc::new(RedisKv::connect(url).await?)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryKv::new()))
    }

    /// `discord-audio:{startUnix}-{stopUnix}-{user}-{channel}`, 60s TTL.
    pub async fn put_audio_blob(&self, key: &str, bytes: Vec<u8>) -> DexterResult<()> {
        self.backend
            .set_bytes(key, bytes, Some(Duration::from_secs(60)))
            .await
    }

    pub async fn get_audio_blob(&self, key: &str) -> DexterResult<Option<Vec<u8>>> {
        self.backend.get_bytes(key).await
    }

    /// `user:displayname:{guild}:{user}`, 24h TTL.
    pub async fn put_display_name(&self, guild: u64, user: u64, name: &str) -> DexterResult<()> {
        let key = format!("user:displayname:{guild}:{user}");
        self.backend
            .set_bytes(&key, name.as_bytes().to_vec(), Some(Duration::from_secs(24 * 3600)))
            .await
    }

    /// `discord:roles:colors:{guild}`, 24h TTL — cached mapping of
    /// color-name to role id for the role enforcer (§4.6).
    pub async fn put_color_roles(&self, guild: u64, mapping: &HashMap<String, u64>) -> DexterResult<()> {
        let key = format!("discord:roles:colors:{guild}");
        self.put_json_ttl(&key, mapping, Duration::from_secs(24 * 3600))
            .await
    }

    pub async fn get_color_roles(&self, guild: u64) -> DexterResult<Option<HashMap<String, u64>>> {
        let key = format!("discord:roles:colors:{guild}");
        self.get_json(&key).await
    }

    /// `user:profile:{user}`, no expiry.
    pub async fn put_profile<T: Serialize + Sync>(&self, user: u64, value: &T) -> DexterResult<()> {
        let key = format!("user:profile:{user}");
        self.put_json(&key, value).await
    }

    /// `cache:contacts:{guild}`, 5 min TTL.
    pub async fn put_contacts<T: Serialize + Sync>(&self, guild: u64, value: &T) -> DexterResult<()> {
        let key = format!("cache:contacts:{guild}");
        self.put_json_ttl(&key, value, Duration::from_secs(5 * 60)).await
    }

    /// `process:info:{id}`, no expiry (§10.5 health reporting).
    pub async fn put_process_info<T: Serialize + Sync>(&self, id: &str, value: &T) -> DexterResult<()> {
        let key = format!("process:info:{id}");
        self.put_json(&key, value).await
    }

    async fn put_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> DexterResult<()> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| DexterError::MalformedInput(format!("unserializable value: {e}")))?;
        self.backend.set_bytes(key, payload, None).await
    }

    async fn put_json_ttl<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> DexterResult<()> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| DexterError::MalformedInput(format!("unserializable value: {e}")))?;
        self.backend.set_bytes(key, payload, Some(ttl)).await
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> DexterResult<Option<T>> {
        match self.backend.get_bytes(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| DexterError::ResourceUnavailable(format!("corrupt kv value: {e}"))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_color_role_mapping() {
        let kv = KvStore::in_memory();
        let mut mapping = HashMap::new();
        mapping.insert("Blue".to_string(), 111u64);
        kv.put_color_roles(42, &mapping).await.unwrap();
        let got = kv.get_color_roles(42).await.unwrap();
        assert_eq!(got, Some(mapping));
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let kv = KvStore::in_memory();
        assert_eq!(kv.get_audio_blob("discord-audio:none").await.unwrap(), None);
    }

    #[tokio::test]
    async fn audio_blob_round_trips() {
        let kv = KvStore::in_memory();
        kv.put_audio_blob("discord-audio:1-2-3-4", vec![1, 2, 3])
            .await
            .unwrap();
        let got = kv.get_audio_blob("discord-audio:1-2-3-4").await.unwrap();
        assert_eq!(got, Some(vec![1, 2, 3]));
    }
}
