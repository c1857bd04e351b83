use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Direction};

/// A message held by a consumer until it is acked or nacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue: String,
    pub payload: String,
}

/// Queue operations the worker needs from a message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Take the next message off `queue`, waiting up to `wait` for one to arrive.
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Settle a delivery successfully.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Reject a delivery, either returning it to its queue or dead-lettering it.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;

    async fn publish(&self, queue: &str, payload: &str) -> Result<(), BrokerError>;

    /// Return deliveries left unsettled by a previous run to `queue`.
    async fn recover(&self, queue: &str) -> Result<u64, BrokerError>;

    async fn health_check(&self) -> Result<(), BrokerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl BrokerError {
    pub fn is_connectivity(&self) -> bool {
        match self {
            BrokerError::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
            }
        }
    }
}

/// List holding deliveries taken by this worker but not yet settled.
pub fn processing_key(queue: &str, worker: &str) -> String {
    format!("{queue}:processing:{worker}")
}

/// List receiving rejected messages.
pub fn dead_letter_key(queue: &str) -> String {
    format!("{queue}:dead")
}

/// Redis-backed reliable queue.
///
/// Producers `LPUSH`; receiving atomically moves the oldest message into a
/// per-worker processing list, so a crash leaves it there for [`Broker::recover`].
pub struct RedisBroker {
    client: redis::Client,
    worker: String,
    commands: ConnectionManager,
    /// One connection per consumed queue; blocking pops would stall a shared one.
    receivers: DashMap<String, MultiplexedConnection>,
}

impl RedisBroker {
    pub async fn connect(url: &str, worker: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let commands = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            worker: worker.to_string(),
            commands,
            receivers: DashMap::new(),
        })
    }

    async fn receiver(&self, queue: &str) -> Result<MultiplexedConnection, BrokerError> {
        if let Some(conn) = self.receivers.get(queue) {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        self.receivers.insert(queue.to_string(), conn.clone());
        Ok(conn)
    }

    /// Current queue depth (pending messages).
    pub async fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError> {
        let mut conn = self.commands.clone();
        Ok(conn.llen(queue).await?)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = self.receiver(queue).await?;
        let processing = processing_key(queue, &self.worker);
        let result: Result<Option<String>, redis::RedisError> = conn
            .blmove(
                queue,
                &processing,
                Direction::Right,
                Direction::Left,
                wait.as_secs_f64(),
            )
            .await;

        match result {
            Ok(payload) => Ok(payload.map(|payload| Delivery {
                queue: queue.to_string(),
                payload,
            })),
            Err(e) => {
                // Drop the cached connection so the next call reconnects.
                self.receivers.remove(queue);
                Err(e.into())
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.commands.clone();
        conn.lrem::<_, _, ()>(
            processing_key(&delivery.queue, &self.worker),
            1,
            &delivery.payload,
        )
        .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let mut conn = self.commands.clone();
        let target = if requeue {
            delivery.queue.clone()
        } else {
            dead_letter_key(&delivery.queue)
        };
        redis::pipe()
            .atomic()
            .lrem(processing_key(&delivery.queue, &self.worker), 1, &delivery.payload)
            .ignore()
            .lpush(&target, &delivery.payload)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &str) -> Result<(), BrokerError> {
        let mut conn = self.commands.clone();
        conn.lpush::<_, _, ()>(queue, payload).await?;
        Ok(())
    }

    async fn recover(&self, queue: &str) -> Result<u64, BrokerError> {
        let mut conn = self.commands.clone();
        let processing = processing_key(queue, &self.worker);
        let mut moved = 0;
        loop {
            let payload: Option<String> = conn.rpoplpush(&processing, queue).await?;
            if payload.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }

    async fn health_check(&self) -> Result<(), BrokerError> {
        let mut conn = self.commands.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// Exponential backoff for broker reconnection.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2.0)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            current: initial,
        }
    }

    /// Delay to wait now; grows the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next_ms = (self.current.as_millis() as f64 * self.multiplier) as u64;
        self.current = Duration::from_millis(next_ms).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
