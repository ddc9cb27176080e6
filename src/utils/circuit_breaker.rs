use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

// ============================================================================
// Circuit Breaker
// ============================================================================
//
// Guards an external event sink. After `failure_threshold` consecutive
// failures the circuit opens and publishes fail fast until `cooldown` has
// passed; then one trial call is let through (half-open). A success closes
// the circuit again, a failure re-opens it.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0=Closed, 1=Open, 2=HalfOpen
    pub fn as_gauge(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit {0} is open")]
    Open(String),
    #[error(transparent)]
    Inner(E),
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        self.admit().await?;

        match operation.await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(err) => {
                self.on_failure().await;
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    async fn admit<E>(&self) -> Result<(), CircuitBreakerError<E>> {
        let mut inner = self.inner.lock().await;
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let cooled = inner
            .opened_at
            .map_or(true, |at| at.elapsed() >= self.config.cooldown);
        if cooled {
            tracing::info!(circuit = %self.name, "Circuit half-open, allowing trial call");
            inner.state = CircuitState::HalfOpen;
            Ok(())
        } else {
            Err(CircuitBreakerError::Open(self.name.clone()))
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::HalfOpen {
            tracing::info!(circuit = %self.name, "Circuit closed after successful trial");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures += 1;

        let trip = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.config.failure_threshold;
        if trip && inner.state != CircuitState::Open {
            tracing::warn!(
                circuit = %self.name,
                failures = inner.consecutive_failures,
                "Circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }
}
