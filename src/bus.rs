//! The message bus adapter: pub/sub channels plus the key-value store the
//! caches sit on.
//!
//! Production runs against redis; [`MemoryBus`] implements the same contract
//! in-process and backs the test suite.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::signal::Signal;

/// How long to wait between delivery attempts of an unreceived publish.
const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(100);

/// After how many failed delivery attempts to log a stall.
const PUBLISH_STALL_ATTEMPTS: u32 = 50;

/// Errors which occur when talking to the bus or decoding what it stores.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("malformed cache entry: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The key-value half of the bus, with glob-style key listing.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn set(&self, key: &str, value: &str) -> Result<(), Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, Error>;
}

/// The pub/sub half of the bus.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Publishes a payload, returning how many subscribers received it.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, Error>;

    /// Opens a non-blocking subscription to a channel.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, Error>;
}

/// A handle to one channel subscription.
///
/// Messages are buffered by a pump task so consumers can poll without
/// blocking their tick loop.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    /// Returns the next buffered payload, if any.
    pub fn try_next(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

/// Publishes a signal, retrying until at least one subscriber received it.
///
/// A publish that nobody hears is transient (the peer daemon may still be
/// starting); the caller cannot make progress without the peer anyway, so
/// this spins with a short sleep and periodically logs the stall.
pub async fn publish_signal(bus: &dyn Channel, channel: &str, signal: &Signal) {
    let payload = signal.encode();
    let mut attempts: u32 = 0;

    loop {
        match bus.publish(channel, &payload).await {
            Ok(received) if received > 0 => return,
            Ok(_) => {}
            Err(e) => warn!("publish of {} failed: {e}", signal.name()),
        }

        attempts += 1;
        if attempts % PUBLISH_STALL_ATTEMPTS == 0 {
            warn!(
                "no subscriber on `{channel}` received {} after {attempts} attempts",
                signal.name()
            );
        }
        tokio::time::sleep(PUBLISH_RETRY_DELAY).await;
    }
}

/// The redis-backed bus used by the real daemons.
pub struct RedisBus {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
}

impl RedisBus {
    /// Connects to the redis instance at `url`.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Store for RedisBus {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, Error> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut conn)
            .await?;
        Ok(keys)
    }
}

#[async_trait]
impl Channel for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, Error> {
        let mut conn = self.conn.clone();
        let received: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(received.max(0) as usize)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, Error> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(message) = messages.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!("dropping undecodable bus message: {e}");
                        continue;
                    }
                };
                if tx.send(payload).is_err() {
                    break;
                }
            }
        });

        Ok(Subscription { rx })
    }
}

/// An in-process bus with the same semantics as the redis adapter.
#[derive(Default)]
pub struct MemoryBus {
    kv: Mutex<HashMap<String, String>>,
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryBus {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.kv.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.kv
            .lock()
            .unwrap()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.kv.lock().unwrap().remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .kv
            .lock()
            .unwrap()
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Channel for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, Error> {
        let mut channels = self.channels.lock().unwrap();
        let subscribers = channels.entry(channel.to_owned()).or_default();
        subscribers.retain(|tx| !tx.is_closed());

        let received = subscribers
            .iter()
            .filter(|tx| tx.send(payload.to_owned()).is_ok())
            .count();
        Ok(received)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .lock()
            .unwrap()
            .entry(channel.to_owned())
            .or_default()
            .push(tx);
        Ok(Subscription { rx })
    }
}

/// Matches a redis-style glob pattern (`*` wildcards only) against a key.
fn glob_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = match value.strip_prefix(parts[0]) {
        Some(rest) => rest,
        None => return false,
    };

    let last = parts.len() - 1;
    for (index, part) in parts.iter().enumerate().skip(1) {
        if part.is_empty() {
            continue;
        }
        if index == last && !pattern.ends_with('*') {
            return rest.len() >= part.len() && rest.ends_with(part);
        }
        match rest.find(part) {
            Some(found) => rest = &rest[found + part.len()..],
            None => return false,
        }
    }

    true
}
