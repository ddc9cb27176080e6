// ============================================================================
// Order Domain - Lifecycle State Machine
// ============================================================================
//
// - Value objects (ids, OrderItem, OrderStatus, PaymentMethod, Order, Return)
// - Commands (CreateOrder, OrderCommand)
// - Changes (OrderChange) and the event types they publish
// - Aggregate (transition graph on Order)
// - Assignment coordinator (per-order critical section)
// - Command handler (transactional write, then fan-out)
//
// ============================================================================

pub mod value_objects;
pub mod events;
pub mod commands;
pub mod aggregate;
pub mod assignment;
pub mod command_handler;

// Re-export for convenience
pub use value_objects::*;
pub use events::*;
pub use commands::*;
pub use aggregate::*;
pub use assignment::*;
pub use command_handler::*;
