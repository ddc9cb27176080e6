use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use delivery_ledger::domain::dues::ClearDues;
use delivery_ledger::domain::order::{CreateOrder, OrderItem, PaymentMethod, ReturnType, StoreId};
use delivery_ledger::fanout::{Channel, ViewScope};
use delivery_ledger::ledger::{LedgerStore, NewAgent, NewCustomer};
use delivery_ledger::{metrics, Config, DeliveryCore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO level, can be overridden with RUST_LOG env var
    // Example: RUST_LOG=debug cargo run
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,delivery_ledger=debug")),
        )
        .init();

    tracing::info!("🚀 Starting delivery ledger demo");

    let config = Config::from_env();
    let core = DeliveryCore::connect(config.clone()).await?;

    // === 1. Metrics server on its own runtime ===
    let metrics_registry = Arc::new(core.metrics.registry().clone());
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Runtime::new() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!("Metrics runtime error: {}", e);
                return;
            }
        };
        runtime.block_on(async {
            if let Err(e) = metrics::start_metrics_server(metrics_registry, metrics_port).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    });

    // === 2. Reference data the CRUD layer would own ===
    let store = StoreId(1);
    let customer = core
        .ledger
        .register_customer(NewCustomer {
            store_id: store,
            name: "Lakshmi Stores account".to_string(),
        })
        .await?;
    let agent = core
        .ledger
        .register_agent(NewAgent {
            store_id: store,
            name: "Arjun".to_string(),
        })
        .await?;

    // === 3. Viewers: a live store screen and a raw admin feed ===
    let store_screen = core.follow(ViewScope::Store(store)).await?;
    let mut admin_feed = core.subscribe(Channel::Admin);
    let admin_log = tokio::spawn(async move {
        while let Ok(event) = admin_feed.recv().await {
            tracing::info!(
                event_type = %event.event_type,
                order_id = %event.order_id,
                status = %event.snapshot.status,
                "📡 admin"
            );
        }
    });

    // === 4. Full lifecycle ===
    let handler = &core.handler;
    let order = handler
        .create_order(CreateOrder {
            store_id: store,
            customer_id: customer.id,
            items: vec![OrderItem::new("Basmati rice 5kg", 1), OrderItem::new("Ghee 1l", 2)],
            invoice_amount: Decimal::from_str("100.00")?,
            invoice_number: Some(format!("INV-{}", Utc::now().timestamp_millis())),
            notes: Some("Leave at the gate".to_string()),
        })
        .await?;
    tracing::info!("✅ Order created: {}", order.order_number);

    handler.assign_order(order.id, agent.id).await?;
    handler.advance_to_out_for_delivery(order.id).await?;
    let delivered = handler
        .deliver_order(order.id, PaymentMethod::CustomerCredit)
        .await?;
    tracing::info!(
        "✅ Delivered in {}s, dues now {}",
        delivered.delivery_duration().map_or(0, |d| d.num_seconds()),
        handler.dues_balance(customer.id).await?
    );

    handler
        .clear_dues(ClearDues {
            customer_id: customer.id,
            amount: Decimal::from_str("40.00")?,
            payment_method: PaymentMethod::Upi,
            cleared_on: Utc::now().date_naive(),
            notes: None,
        })
        .await?;

    let refund = handler
        .return_order(
            order.id,
            ReturnType::Partial,
            Decimal::from_str("30.00")?,
            PaymentMethod::CustomerCredit,
            Some("Damaged packaging".to_string()),
        )
        .await?;
    tracing::info!("✅ Return {} processed for {}", refund.id, refund.refund_amount);

    // === 5. A cancelled order is removable ===
    let spare = handler
        .create_order(CreateOrder {
            store_id: store,
            customer_id: customer.id,
            items: vec![OrderItem::new("Salt 1kg", 1)],
            invoice_amount: Decimal::from_str("20.00")?,
            invoice_number: None,
            notes: None,
        })
        .await?;
    handler.cancel_order(spare.id).await?;
    handler.delete_order(spare.id).await?;

    // === 6. Reconciliation ===
    let report = handler.verify_dues(customer.id).await?;
    tracing::info!(
        cached = %report.cached,
        recomputed = %report.recomputed,
        consistent = report.is_consistent(),
        "🧮 Dues reconciliation"
    );

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    {
        let view = store_screen.view();
        let view = view.read().await;
        tracing::info!("🖥️  Store screen holds {} order(s)", view.len());
    }

    drop(store_screen);
    admin_log.abort();
    tracing::info!("🎉 Demo complete!");

    Ok(())
}
