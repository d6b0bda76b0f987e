//! External bus adapter: bridges Redis pub/sub and the broker.
//!
//! One publisher task drains the shared publish queue onto Redis; one
//! subscriber task pattern-subscribes to the membership and group-broadcast
//! feeds and forwards each message to the broker. Both reconnect with
//! exponential backoff; a bus failure never reaches the broker's event loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use crate::broker::events::BusPublish;
use crate::broker::BrokerHandle;
use crate::config::Config;

/// Timeout for individual Redis operations.
const REDIS_TIMEOUT: Duration = Duration::from_secs(5);

/// Initial backoff delay for reconnection.
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for reconnection.
const MAX_BACKOFF_SECS: u64 = 30;

/// Capacity of the publish queue. Senders that outrun a prolonged Redis
/// outage see a full queue and drop (broker announcements) or slow down
/// (connection pumps).
pub const PUBLISH_CHANNEL_CAPACITY: usize = 10_000;

pub struct BusAdapter {
    client: redis::Client,
    config: Arc<Config>,
    broker: BrokerHandle,
}

impl BusAdapter {
    pub fn new(config: Arc<Config>, broker: BrokerHandle) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .context("failed to create redis client")?;
        Ok(Self {
            client,
            config,
            broker,
        })
    }

    /// Spawn the publisher and subscriber tasks. `publish_rx` is the
    /// receiving end of the queue the broker and connection pumps feed.
    pub fn start(self, publish_rx: mpsc::Receiver<BusPublish>) {
        tokio::spawn(run_publisher(self.client.clone(), publish_rx));
        tokio::spawn(self.run_subscriber_loop());
    }

    async fn run_subscriber_loop(self) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;
        loop {
            match self.run_subscriber().await {
                SubscriberExit::Disconnected => {
                    // The connection was healthy before it dropped; reset the
                    // backoff since the server was reachable.
                    tracing::error!("redis subscription stream ended, reconnecting");
                    backoff_secs = INITIAL_BACKOFF_SECS;
                }
                SubscriberExit::ConnectFailed(e) => {
                    tracing::error!(
                        error = %e,
                        backoff_secs,
                        "redis subscriber failed to connect, retrying after backoff"
                    );
                }
            }
            backoff_sleep(&mut backoff_secs).await;
        }
    }

    /// One subscriber session: connect, psubscribe, pump messages until the
    /// stream ends.
    async fn run_subscriber(&self) -> SubscriberExit {
        let mut pubsub = match timeout(REDIS_TIMEOUT, self.client.get_async_pubsub()).await {
            Ok(Ok(ps)) => ps,
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(
                    anyhow::anyhow!(e).context("failed to get redis pub/sub connection"),
                );
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(anyhow::anyhow!(
                    "timed out getting redis pub/sub connection"
                ));
            }
        };

        let channels = &self.config.channels;
        let patterns = [
            format!("{}*", channels.new_groups),
            format!("{}*", channels.data_to_group),
        ];
        match timeout(REDIS_TIMEOUT, pubsub.psubscribe(&patterns[..])).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(
                    anyhow::anyhow!(e).context("failed to psubscribe to bus patterns"),
                );
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(anyhow::anyhow!(
                    "timed out subscribing to bus patterns"
                ));
            }
        }

        tracing::info!(
            membership = %patterns[0],
            broadcast = %patterns[1],
            "redis subscriber connected"
        );

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            let payload: Vec<u8> = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, %channel, "invalid bus payload");
                    continue;
                }
            };
            self.dispatch(&channel, payload).await;
        }

        // The stream returned None: the Redis connection was lost.
        SubscriberExit::Disconnected
    }

    /// Route one bus message to the broker based on its channel prefix.
    async fn dispatch(&self, channel: &str, payload: Vec<u8>) {
        let channels = &self.config.channels;
        if let Some(session_id) = channel.strip_prefix(channels.new_groups.as_str()) {
            let groups = parse_group_list(&payload);
            tracing::debug!(%session_id, groups = groups.len(), "membership update from bus");
            self.broker
                .membership_update(session_id.to_string(), groups)
                .await;
        } else if let Some(group) = channel.strip_prefix(channels.data_to_group.as_str()) {
            tracing::debug!(%group, bytes = payload.len(), "group broadcast from bus");
            self.broker
                .group_broadcast(group.to_string(), Bytes::from(payload))
                .await;
        } else {
            tracing::warn!(%channel, "message on unexpected bus channel");
        }
    }
}

/// Publisher task: drains the publish queue onto Redis, reconnecting with
/// backoff and retrying the in-flight request after a reconnect.
async fn run_publisher(client: redis::Client, mut publish_rx: mpsc::Receiver<BusPublish>) {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;
    let mut retry: Option<BusPublish> = None;

    loop {
        let mut conn = match timeout(REDIS_TIMEOUT, client.get_multiplexed_async_connection()).await
        {
            Ok(Ok(conn)) => {
                backoff_secs = INITIAL_BACKOFF_SECS;
                conn
            }
            Ok(Err(e)) => {
                tracing::error!(
                    error = %e,
                    backoff_secs,
                    "failed to get redis connection for publishing, retrying"
                );
                backoff_sleep(&mut backoff_secs).await;
                continue;
            }
            Err(_) => {
                tracing::error!(
                    backoff_secs,
                    "timed out getting redis connection for publishing, retrying"
                );
                backoff_sleep(&mut backoff_secs).await;
                continue;
            }
        };

        tracing::info!("redis publisher (re)connected");

        if let Some(req) = retry.take() {
            if let Err(e) = publish(&mut conn, &req).await {
                tracing::warn!(error = %e, channel = %req.channel, "retry publish failed, reconnecting");
                retry = Some(req);
                backoff_sleep(&mut backoff_secs).await;
                continue;
            }
        }

        loop {
            let Some(req) = publish_rx.recv().await else {
                tracing::warn!("publish queue closed, redis publisher exiting");
                return;
            };
            if let Err(e) = publish(&mut conn, &req).await {
                tracing::error!(
                    error = %e,
                    channel = %req.channel,
                    "publish failed, saving for retry after reconnect"
                );
                retry = Some(req);
                break;
            }
        }

        backoff_sleep(&mut backoff_secs).await;
    }
}

async fn publish(conn: &mut redis::aio::MultiplexedConnection, req: &BusPublish) -> Result<()> {
    let receivers: usize = timeout(
        REDIS_TIMEOUT,
        conn.publish(&req.channel, req.payload.as_ref()),
    )
    .await
    .context("timed out publishing to redis")?
    .context("failed to publish to redis")?;
    tracing::debug!(channel = %req.channel, receivers, "published to redis");
    Ok(())
}

async fn backoff_sleep(backoff_secs: &mut u64) {
    tokio::time::sleep(Duration::from_secs(*backoff_secs)).await;
    *backoff_secs = (*backoff_secs * 2).min(MAX_BACKOFF_SECS);
}

/// How a subscriber session ended, which decides the backoff behavior.
enum SubscriberExit {
    /// Messages were flowing and the stream ended: Redis disconnected.
    Disconnected,
    /// Could not connect or subscribe; keep growing the backoff.
    ConnectFailed(anyhow::Error),
}

/// Parse a comma-separated group list from a membership-update payload.
/// An empty payload means "no groups".
fn parse_group_list(payload: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(payload)
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
