//! Redis Streams broker: one stream as the topic, one consumer group as the queue.
//!
//! # Mapping
//!
//! | Broker concept        | Redis Streams                                   |
//! |-----------------------|-------------------------------------------------|
//! | publish               | `XADD`, then a `SET EX` dedup key               |
//! | long-poll receive     | `XREADGROUP … BLOCK`                            |
//! | visibility timeout    | `XAUTOCLAIM` of entries idle longer than it     |
//! | receive count         | delivery counter from `XPENDING`                |
//! | delete (acknowledge)  | `XACK`                                          |
//! | message attributes    | entry fields next to the `body` field           |
//!
//! Acknowledging never removes the entry from the stream, since other
//! consumer groups on the same stream may not have read it yet.
//!
//! Blocking reads get a dedicated connection each. A multiplexed connection
//! serializes commands, so a blocked `XREADGROUP` on the shared
//! [`ConnectionManager`] would stall every acknowledgement behind it.

use album_store_core::broker::{
    BrokerError, EventPublisher, MessageQueue, OutboundMessage, QueueMessage, ReceiptHandle,
    ReceiveOptions,
};
use album_store_core::event::DomainEvent;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::StreamReadReply;
use redis::{Client, Script, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Entry field holding the serialized event.
pub const BODY_FIELD: &str = "body";

/// Publishes unless the dedup key already exists. Returns the entry id or nil.
///
/// The key is written only after `XADD` succeeded: a failed append aborts the
/// script and leaves the event publishable.
const PUBLISH_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[2]) == 1 then
    return false
end
local id = redis.call('XADD', KEYS[1], '*', unpack(ARGV, 2))
redis.call('SET', KEYS[2], '1', 'EX', ARGV[1])
return id
";

/// Broker over a single Redis stream.
///
/// # Example
///
/// ```no_run
/// use album_store_redis::RedisStreamBroker;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = RedisStreamBroker::builder()
///     .url("redis://127.0.0.1:6379")
///     .stream("album-events")
///     .group("album-workers")
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct RedisStreamBroker {
    client: Client,
    conn: ConnectionManager,
    blocking: Mutex<Vec<MultiplexedConnection>>,
    publish_script: Script,
    stream: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
    dedup_window: Duration,
}

impl RedisStreamBroker {
    /// Start configuring a broker.
    #[must_use]
    pub fn builder() -> RedisStreamBrokerBuilder {
        RedisStreamBrokerBuilder::default()
    }

    /// Stream key.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Consumer group.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Consumer name used by this process.
    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    fn receive_error(&self, context: &str, error: &redis::RedisError) -> BrokerError {
        BrokerError::ReceiveFailed {
            queue: format!("{}/{}", self.stream, self.group),
            reason: format!("{context}: {error}"),
        }
    }

    async fn blocking_connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        let idle = self
            .blocking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| self.receive_error("Failed to open read connection", &e)),
        }
    }

    fn release_blocking_connection(&self, conn: MultiplexedConnection) {
        self.blocking
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn);
    }

    /// Reclaim entries whose previous delivery exceeded the visibility timeout.
    async fn reclaim(&self, count: usize) -> Result<Vec<QueueMessage>, BrokerError> {
        let mut conn = self.conn.clone();
        let min_idle_ms = u64::try_from(self.visibility_timeout.as_millis()).unwrap_or(u64::MAX);

        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.receive_error("XAUTOCLAIM failed", &e))?;

        let entries = match &reply {
            Value::Array(parts) => parts.get(1).map(parse_entries).unwrap_or_default(),
            _ => Vec::new(),
        };
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let counts = self.delivery_counts(&entries).await?;
        Ok(entries
            .into_iter()
            .map(|(id, fields)| {
                let receive_count = counts.get(&id).copied().unwrap_or(2);
                into_message(id, fields, receive_count)
            })
            .collect())
    }

    /// Delivery counters of pending entries, keyed by entry id.
    async fn delivery_counts(
        &self,
        entries: &[(String, Vec<(String, Vec<u8>)>)],
    ) -> Result<HashMap<String, u32>, BrokerError> {
        let mut pipe = redis::pipe();
        for (id, _) in entries {
            pipe.cmd("XPENDING")
                .arg(&self.stream)
                .arg(&self.group)
                .arg(id)
                .arg(id)
                .arg(1);
        }
        let mut conn = self.conn.clone();
        let replies: Vec<Value> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| self.receive_error("XPENDING failed", &e))?;

        let mut counts = HashMap::new();
        for reply in replies {
            // [[id, consumer, idle_ms, deliveries]]
            let Value::Array(rows) = reply else { continue };
            for row in rows {
                let Value::Array(columns) = row else { continue };
                if let (Some(id), Some(Value::Int(deliveries))) = (columns.first(), columns.get(3)) {
                    if let Some(id) = value_string(id) {
                        counts.insert(id, u32::try_from(*deliveries).unwrap_or(u32::MAX));
                    }
                }
            }
        }
        Ok(counts)
    }

    /// Read entries never delivered to the group, blocking up to `wait`.
    async fn read_new(&self, count: usize, wait: Option<Duration>) -> Result<Vec<QueueMessage>, BrokerError> {
        let mut conn = self.blocking_connection().await?;

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(count);
        if let Some(wait) = wait.filter(|w| !w.is_zero()) {
            let block_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS").arg(&self.stream).arg(">");

        let reply: Option<StreamReadReply> = match cmd.query_async(&mut conn).await {
            Ok(reply) => {
                self.release_blocking_connection(conn);
                reply
            }
            // The connection may be broken; let it drop.
            Err(e) => return Err(self.receive_error("XREADGROUP failed", &e)),
        };

        let mut messages = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                let fields = entry
                    .map
                    .iter()
                    .filter_map(|(name, value)| value_bytes(value).map(|bytes| (name.clone(), bytes)))
                    .collect();
                messages.push(into_message(entry.id, fields, 1));
            }
        }
        Ok(messages)
    }
}

impl EventPublisher for RedisStreamBroker {
    fn publish<'a>(
        &'a self,
        event: &'a DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            let outbound = OutboundMessage::from_event(event)?;
            let dedup_key = format!("{}:dedup:{}", self.stream, outbound.deduplication_id);

            let mut invocation = self.publish_script.key(&self.stream);
            invocation.key(&dedup_key).arg(self.dedup_window.as_secs().max(1));
            invocation.arg(BODY_FIELD).arg(outbound.body.as_slice());
            for (name, value) in &outbound.attributes {
                invocation.arg(name).arg(value);
            }

            let mut conn = self.conn.clone();
            let entry_id: Option<String> = invocation.invoke_async(&mut conn).await.map_err(|e| {
                tracing::error!(stream = %self.stream, event_id = %event.id, error = %e, "Failed to publish event");
                BrokerError::PublishFailed {
                    topic: self.stream.clone(),
                    reason: e.to_string(),
                }
            })?;

            match entry_id {
                Some(entry_id) => tracing::debug!(
                    stream = %self.stream,
                    entry_id = %entry_id,
                    event_id = %event.id,
                    event_type = %event.event_type(),
                    "Event published"
                ),
                None => {
                    metrics::counter!("publisher_duplicates_suppressed_total").increment(1);
                    tracing::debug!(event_id = %event.id, "Duplicate publish suppressed");
                }
            }
            Ok(())
        })
    }
}

impl MessageQueue for RedisStreamBroker {
    fn receive(
        &self,
        options: ReceiveOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueueMessage>, BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let mut batch = self.reclaim(options.max_messages).await?;
            let remaining = options.max_messages.saturating_sub(batch.len());
            if remaining > 0 {
                // Only wait when there is nothing to hand out yet.
                let wait = batch.is_empty().then_some(options.wait_time);
                batch.extend(self.read_new(remaining, wait).await?);
            }
            Ok(batch)
        })
    }

    fn delete<'a>(
        &'a self,
        receipt: &'a ReceiptHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let acked: i64 = redis::cmd("XACK")
                .arg(&self.stream)
                .arg(&self.group)
                .arg(receipt.as_str())
                .query_async(&mut conn)
                .await
                .map_err(|e| BrokerError::DeleteFailed {
                    receipt: receipt.to_string(),
                    reason: e.to_string(),
                })?;

            if acked == 0 {
                return Err(BrokerError::DeleteFailed {
                    receipt: receipt.to_string(),
                    reason: "entry is not pending".to_string(),
                });
            }
            Ok(())
        })
    }
}

/// Builder for [`RedisStreamBroker`].
#[derive(Default)]
pub struct RedisStreamBrokerBuilder {
    url: Option<String>,
    stream: Option<String>,
    group: Option<String>,
    consumer: Option<String>,
    visibility_timeout: Option<Duration>,
    dedup_window: Option<Duration>,
}

impl RedisStreamBrokerBuilder {
    /// Redis connection URL (required).
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Stream key. Default: `album-events`
    #[must_use]
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Consumer group shared by all workers. Default: `album-workers`
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Consumer name of this process. Default: `worker-{uuid}`
    #[must_use]
    pub fn consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }

    /// Idle time after which an unacknowledged entry is redelivered.
    ///
    /// Default: 30 seconds
    #[must_use]
    pub const fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    /// How long a publish dedup key lives. Default: 5 minutes
    #[must_use]
    pub const fn dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = Some(window);
        self
    }

    /// Connect and make sure the consumer group exists.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if:
    /// - the URL is missing or invalid
    /// - Redis is unreachable
    /// - the consumer group cannot be created
    pub async fn build(self) -> Result<RedisStreamBroker, BrokerError> {
        let url = self
            .url
            .ok_or_else(|| BrokerError::ConnectionFailed("Redis URL not configured".to_string()))?;
        let client = Client::open(url.as_str())
            .map_err(|e| BrokerError::ConnectionFailed(format!("Invalid Redis URL: {e}")))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to connect to Redis: {e}")))?;

        let broker = RedisStreamBroker {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
            publish_script: Script::new(PUBLISH_SCRIPT),
            stream: self.stream.unwrap_or_else(|| "album-events".to_string()),
            group: self.group.unwrap_or_else(|| "album-workers".to_string()),
            consumer: self
                .consumer
                .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4())),
            visibility_timeout: self.visibility_timeout.unwrap_or(Duration::from_secs(30)),
            dedup_window: self.dedup_window.unwrap_or(Duration::from_secs(300)),
        };
        broker.ensure_group().await?;

        tracing::info!(
            stream = %broker.stream,
            group = %broker.group,
            consumer = %broker.consumer,
            visibility_timeout_secs = broker.visibility_timeout.as_secs(),
            "Redis stream broker ready"
        );
        Ok(broker)
    }
}

impl RedisStreamBroker {
    async fn ensure_group(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                tracing::info!(stream = %self.stream, group = %self.group, "Consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BrokerError::ConnectionFailed(format!(
                "Failed to create consumer group {}: {e}",
                self.group
            ))),
        }
    }
}

fn value_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::BulkString(bytes) => Some(bytes.clone()),
        Value::SimpleString(text) => Some(text.clone().into_bytes()),
        Value::Int(n) => Some(n.to_string().into_bytes()),
        _ => None,
    }
}

fn value_string(value: &Value) -> Option<String> {
    value_bytes(value).and_then(|bytes| String::from_utf8(bytes).ok())
}

/// Parse `[[id, [field, value, …]], …]`, skipping entries deleted meanwhile.
fn parse_entries(value: &Value) -> Vec<(String, Vec<(String, Vec<u8>)>)> {
    let Value::Array(entries) = value else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let Value::Array(parts) = entry else { return None };
            let id = value_string(parts.first()?)?;
            let Value::Array(flat) = parts.get(1)? else { return None };
            let fields = flat
                .chunks_exact(2)
                .filter_map(|pair| Some((value_string(&pair[0])?, value_bytes(&pair[1])?)))
                .collect();
            Some((id, fields))
        })
        .collect()
}

fn into_message(id: String, fields: Vec<(String, Vec<u8>)>, receive_count: u32) -> QueueMessage {
    let mut body = Vec::new();
    let mut attributes = BTreeMap::new();
    for (name, value) in fields {
        if name == BODY_FIELD {
            body = value;
        } else {
            attributes.insert(name, String::from_utf8_lossy(&value).into_owned());
        }
    }
    QueueMessage {
        message_id: id.clone(),
        body,
        receipt: ReceiptHandle::new(id),
        receive_count,
        attributes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(text: &str) -> Value {
        Value::BulkString(text.as_bytes().to_vec())
    }

    #[test]
    fn entries_split_body_from_attributes() {
        let reply = Value::Array(vec![
            Value::Array(vec![
                bulk("1-0"),
                Value::Array(vec![bulk("body"), bulk("{}"), bulk("EventType"), bulk("ALBUM_LIKED")]),
            ]),
            Value::Nil,
        ]);

        let entries = parse_entries(&reply);
        assert_eq!(entries.len(), 1);

        let (id, fields) = entries.into_iter().next().unwrap_or_default();
        let message = into_message(id, fields, 3);
        assert_eq!(message.message_id, "1-0");
        assert_eq!(message.receipt.as_str(), "1-0");
        assert_eq!(message.body, b"{}");
        assert_eq!(message.receive_count, 3);
        assert_eq!(message.event_type_attribute(), Some("ALBUM_LIKED"));
    }

    #[test]
    fn entry_without_body_yields_empty_body() {
        let message = into_message(
            "2-0".to_string(),
            vec![("EventType".to_string(), b"ALBUM_CREATED".to_vec())],
            1,
        );
        assert!(message.body.is_empty());
        assert_eq!(message.attributes.len(), 1);
    }
}
