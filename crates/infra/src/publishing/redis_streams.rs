//! Redis Streams event transport (durable, partitioned by tenant).
//!
//! ## Architecture
//!
//! - **Stream key**: `catalog.events.v1:{tenant_id}`, one stream per tenant, so
//!   XADD order is the tenant's publish order
//! - **Entry fields**: `event_id`, `event_type`, `entity_id`, `version`,
//!   `payload` (the JSON-encoded [`DomainEvent`])
//! - **Retention**: approximate `MAXLEN` trim on every append
//!
//! Consumers read with their own consumer groups and deduplicate on
//! `event_id`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::instrument;

use marketplace_events::{DomainEvent, EVENT_STREAM, EventTransport, TransportError};

/// Default approximate stream length kept per tenant
const DEFAULT_MAX_LEN: usize = 100_000;

#[derive(Clone)]
pub struct RedisStreamsTransport {
    conn: ConnectionManager,
    stream_prefix: String,
    max_len: usize,
}

impl RedisStreamsTransport {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `stream_prefix` - Stream key prefix (default: "catalog.events.v1")
    pub async fn connect(
        redis_url: impl AsRef<str>,
        stream_prefix: Option<String>,
    ) -> Result<Self, TransportError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        Ok(Self {
            conn,
            stream_prefix: stream_prefix.unwrap_or_else(|| EVENT_STREAM.to_string()),
            max_len: DEFAULT_MAX_LEN,
        })
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn stream_key(&self, partition_key: &str) -> String {
        format!("{}:{}", self.stream_prefix, partition_key)
    }
}

#[async_trait]
impl EventTransport for RedisStreamsTransport {
    #[instrument(
        skip(self, event),
        fields(
            tenant_id = %event.tenant_id,
            entity_id = %event.entity_id,
            version = event.version
        ),
        err
    )]
    async fn send(&self, partition_key: &str, event: &DomainEvent) -> Result<(), TransportError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| TransportError::Serialization(e.to_string()))?;

        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(self.stream_key(partition_key))
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*") // Auto-generate message ID
            .arg("event_id")
            .arg(event.id.to_string())
            .arg("event_type")
            .arg(event.event_type())
            .arg("entity_id")
            .arg(event.entity_id.to_string())
            .arg("version")
            .arg(event.version)
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                    TransportError::Unavailable(format!("XADD failed: {e}"))
                } else {
                    TransportError::Rejected(format!("XADD failed: {e}"))
                }
            })?;

        Ok(())
    }
}
