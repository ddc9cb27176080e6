use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::domain::errors::CommandError;
use crate::fanout::{Channel, EventSink, LifecycleEvent};
use crate::metrics::Metrics;
use crate::utils::{
    retry_transient, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, IsTransient, RetryPolicy,
};

// ============================================================================
// Redis pub/sub mirror
// ============================================================================
//
// Publishes every lifecycle event as JSON to `orders:store:{id}` and
// `orders:admin`, so out-of-process viewers can follow the same audiences as
// the in-process broker. Guarded by a circuit breaker; transient Redis errors
// are retried with backoff while the circuit is closed.
//
// ============================================================================

const CHANNEL_PREFIX: &str = "orders";

impl IsTransient for CircuitBreakerError<redis::RedisError> {
    fn is_transient(&self) -> bool {
        match self {
            // Fail fast until the cooldown elapses.
            CircuitBreakerError::Open(_) => false,
            CircuitBreakerError::Inner(err) => {
                err.is_io_error() || err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal()
            }
        }
    }
}

pub struct RedisEventSink {
    connection: MultiplexedConnection,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl RedisEventSink {
    pub async fn connect(url: &str, retry: RetryPolicy, metrics: Arc<Metrics>) -> Result<Self, CommandError> {
        let client = redis::Client::open(url).map_err(|err| CommandError::PublishFailure {
            channel: CHANNEL_PREFIX.to_string(),
            reason: format!("invalid redis url: {}", err),
        })?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| CommandError::PublishFailure {
                channel: CHANNEL_PREFIX.to_string(),
                reason: err.to_string(),
            })?;

        tracing::info!("Connected Redis fan-out mirror");
        Ok(Self {
            connection,
            breaker: CircuitBreaker::new("redis", CircuitBreakerConfig::default()),
            retry,
            metrics,
        })
    }

    pub fn channel_name(channel: &Channel) -> String {
        format!("{}:{}", CHANNEL_PREFIX, channel)
    }
}

#[async_trait]
impl EventSink for RedisEventSink {
    fn name(&self) -> &str {
        "redis"
    }

    async fn publish(&self, channel: &Channel, event: &LifecycleEvent) -> Result<(), CommandError> {
        let name = Self::channel_name(channel);
        let payload = serde_json::to_string(event).map_err(|err| CommandError::PublishFailure {
            channel: name.clone(),
            reason: format!("serialize: {}", err),
        })?;

        let result = retry_transient(&self.retry, "redis_publish", Some(self.metrics.as_ref()), |_| {
            let mut connection = self.connection.clone();
            let name = name.as_str();
            let payload = payload.as_str();
            self.breaker.call(async move {
                let receivers: i64 = connection.publish(name, payload).await?;
                Ok::<_, redis::RedisError>(receivers)
            })
        })
        .await;

        self.metrics
            .set_circuit_state(self.breaker.name(), self.breaker.state().await.as_gauge());

        match result {
            Ok(receivers) => {
                tracing::debug!(channel = %name, receivers, event_type = %event.event_type, "Published to Redis");
                Ok(())
            }
            Err(err) => Err(CommandError::PublishFailure {
                channel: name,
                reason: err.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::StoreId;

    #[test]
    fn test_channel_names() {
        assert_eq!(RedisEventSink::channel_name(&Channel::Store(StoreId(4))), "orders:store:4");
        assert_eq!(RedisEventSink::channel_name(&Channel::Admin), "orders:admin");
    }

    #[test]
    fn test_only_connection_errors_are_retried() {
        let io = redis::RedisError::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "reset"));
        assert!(CircuitBreakerError::Inner(io).is_transient());

        let typed = redis::RedisError::from((redis::ErrorKind::TypeError, "unexpected reply"));
        assert!(!CircuitBreakerError::Inner(typed).is_transient());

        assert!(!CircuitBreakerError::<redis::RedisError>::Open("redis".into()).is_transient());
    }
}
