use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::domain::errors::CommandError;
use crate::metrics::Metrics;
use super::event::{Channel, LifecycleEvent};

/// Destination for committed lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver `event` to `channel`. Failures are reported as
    /// `CommandError::PublishFailure`.
    async fn publish(&self, channel: &Channel, event: &LifecycleEvent) -> Result<(), CommandError>;
}

/// Outcome of fanning one event out to every sink and audience.
#[derive(Debug, Default)]
pub struct PublishReport {
    pub delivered: usize,
    pub failures: Vec<CommandError>,
}

impl PublishReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

// ============================================================================
// Fan-out
// ============================================================================
//
// Runs strictly after commit. Every sink gets the event on both audiences in
// parallel; a failing sink or channel is logged and counted but never fails
// the command that produced the event. Subscribers recover from gaps through
// their periodic resync.
//
// ============================================================================

pub struct FanOut {
    sinks: Vec<Arc<dyn EventSink>>,
    metrics: Arc<Metrics>,
}

impl FanOut {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            sinks: Vec::new(),
            metrics,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }

    pub async fn publish(&self, event: &LifecycleEvent) -> PublishReport {
        let audiences = event.audiences();

        let mut attempts = Vec::with_capacity(self.sinks.len() * audiences.len());
        for sink in &self.sinks {
            for channel in &audiences {
                attempts.push(async move {
                    let result = sink.publish(channel, event).await;
                    (sink.name(), channel, result)
                });
            }
        }

        let mut report = PublishReport::default();
        for (sink, channel, result) in join_all(attempts).await {
            let event_type = event.event_type.as_str();
            match result {
                Ok(()) => {
                    self.metrics.record_publish(sink, event_type, true);
                    report.delivered += 1;
                }
                Err(err) => {
                    self.metrics.record_publish(sink, event_type, false);
                    tracing::error!(
                        sink,
                        channel = %channel,
                        order_id = %event.order_id,
                        event_type,
                        error = %err,
                        "Fan-out failed; subscribers will catch up on resync"
                    );
                    report.failures.push(match err {
                        CommandError::PublishFailure { .. } => err,
                        other => CommandError::PublishFailure {
                            channel: channel.to_string(),
                            reason: other.to_string(),
                        },
                    });
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{CreateOrder, CustomerId, Order, OrderEventType, OrderId, OrderItem, StoreId};
    use crate::fanout::EventBroker;
    use chrono::Utc;
    use rust_decimal::Decimal;

    struct BrokenSink;

    #[async_trait]
    impl EventSink for BrokenSink {
        fn name(&self) -> &str {
            "broken"
        }

        async fn publish(&self, _channel: &Channel, _event: &LifecycleEvent) -> Result<(), CommandError> {
            Err(CommandError::storage("socket closed"))
        }
    }

    fn event() -> LifecycleEvent {
        let draft = CreateOrder {
            store_id: StoreId(2),
            customer_id: CustomerId(1),
            items: vec![OrderItem::new("Eggs", 12)],
            invoice_amount: Decimal::new(1000, 2),
            invoice_number: None,
            notes: None,
        };
        let snapshot = Order::open(OrderId(1), &draft, Utc::now()).unwrap();
        LifecycleEvent::new(OrderEventType::OrderCreated, snapshot, Utc::now())
    }

    #[tokio::test]
    async fn test_event_reaches_store_and_admin_once() {
        let broker = EventBroker::new(8);
        let mut store = broker.subscribe(Channel::Store(StoreId(2)));
        let mut admin = broker.subscribe(Channel::Admin);
        let mut other = broker.subscribe(Channel::Store(StoreId(9)));
        let fanout = FanOut::new(Arc::new(Metrics::new().unwrap())).with_sink(Arc::new(broker.clone()));

        let report = fanout.publish(&event()).await;

        assert!(report.is_complete());
        assert_eq!(report.delivered, 2);
        assert!(store.try_recv().unwrap().is_some());
        assert!(store.try_recv().unwrap().is_none());
        assert!(admin.try_recv().unwrap().is_some());
        assert!(admin.try_recv().unwrap().is_none());
        assert!(other.try_recv().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_sink_is_isolated() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let broker = EventBroker::new(8);
        let mut admin = broker.subscribe(Channel::Admin);
        let fanout = FanOut::new(metrics.clone())
            .with_sink(Arc::new(BrokenSink))
            .with_sink(Arc::new(broker.clone()));

        let report = fanout.publish(&event()).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failures.len(), 2);
        assert!(report
            .failures
            .iter()
            .all(|err| matches!(err, CommandError::PublishFailure { .. })));
        assert!(admin.try_recv().unwrap().is_some());
        assert_eq!(metrics.publish_failures_total.with_label_values(&["broken"]).get(), 2);
        assert_eq!(fanout.sink_names(), vec!["broken", "broker"]);
    }
}
