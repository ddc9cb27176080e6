// ============================================================================
// Delivery Ledger - order lifecycle, dues ledger and real-time fan-out
// ============================================================================

pub mod app;
pub mod config;
pub mod domain;
pub mod fanout;
pub mod ledger;
pub mod messaging;
pub mod metrics;
pub mod utils;

pub use app::DeliveryCore;
pub use config::Config;
pub use domain::errors::CommandError;
