use std::sync::Arc;

use crate::config::Config;
use crate::domain::errors::CommandError;
use crate::domain::order::{HandlerSettings, OrderCommandHandler};
use crate::fanout::{Channel, EventBroker, EventSink, FanOut, Subscription, ViewFollower, ViewScope};
use crate::ledger::{InMemoryLedger, LedgerStore, PostgresLedger};
use crate::messaging::RedisEventSink;
use crate::metrics::Metrics;
use crate::utils::RetryPolicy;

// ============================================================================
// Delivery Core - wiring
// ============================================================================
//
//   OrderCommandHandler ──► LedgerStore (memory | postgres)
//          │
//          └──► FanOut ──► EventBroker (in-process subscribers)
//                     └──► RedisEventSink (optional mirror)
//
// ============================================================================

pub struct DeliveryCore {
    pub config: Config,
    pub metrics: Arc<Metrics>,
    pub ledger: Arc<dyn LedgerStore>,
    pub broker: EventBroker,
    pub handler: OrderCommandHandler,
}

impl DeliveryCore {
    /// Wire a core around an existing ledger. The broker is always the first sink.
    pub fn assemble(
        config: Config,
        ledger: Arc<dyn LedgerStore>,
        metrics: Arc<Metrics>,
        extra_sinks: Vec<Arc<dyn EventSink>>,
    ) -> Self {
        let broker = EventBroker::new(config.channel_capacity);
        let fanout = extra_sinks
            .into_iter()
            .fold(FanOut::new(metrics.clone()).with_sink(Arc::new(broker.clone())), |fanout, sink| {
                fanout.with_sink(sink)
            });

        let handler = OrderCommandHandler::new(
            ledger.clone(),
            Arc::new(fanout),
            metrics.clone(),
            HandlerSettings {
                command_timeout: config.command_timeout,
                assign_lock_timeout: config.assign_lock_timeout,
            },
        );

        Self {
            config,
            metrics,
            ledger,
            broker,
            handler,
        }
    }

    pub fn in_memory(config: Config) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        Ok(Self::assemble(config, Arc::new(InMemoryLedger::new()), metrics, Vec::new()))
    }

    /// Postgres when `DATABASE_URL` is configured, in-memory otherwise; adds
    /// the Redis mirror when `REDIS_URL` is configured.
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::new()?);

        let ledger: Arc<dyn LedgerStore> = match &config.database_url {
            Some(url) => {
                let ledger = PostgresLedger::connect(url, config.db_max_connections).await?;
                ledger.ensure_schema().await?;
                Arc::new(ledger)
            }
            None => {
                tracing::info!("DATABASE_URL not set, using in-memory ledger");
                Arc::new(InMemoryLedger::new())
            }
        };

        let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
        if let Some(url) = &config.redis_url {
            let retry = RetryPolicy::with_attempts(config.publish_max_attempts);
            sinks.push(Arc::new(RedisEventSink::connect(url, retry, metrics.clone()).await?));
        }

        Ok(Self::assemble(config, ledger, metrics, sinks))
    }

    pub fn subscribe(&self, channel: Channel) -> Subscription {
        self.broker.subscribe(channel)
    }

    /// Start a live view for a store screen or the admin dashboard.
    pub async fn follow(&self, scope: ViewScope) -> Result<ViewFollower, CommandError> {
        ViewFollower::start(
            scope,
            &self.broker,
            self.ledger.clone(),
            self.metrics.clone(),
            self.config.view_resync_interval,
        )
        .await
    }
}
