// ============================================================================
// Event Fan-out
// ============================================================================
//
// Committed lifecycle changes leave the core here:
// - event:  LifecycleEvent payload and its audiences (store + admin)
// - broker: in-process per-channel subscription registry
// - sink:   EventSink seam and the FanOut dispatcher
// - view:   subscriber-side OrderView with resync
//
// ============================================================================

mod broker;
mod event;
mod sink;
mod view;

pub use broker::{EventBroker, SubscriberId, Subscription, SubscriptionError};
pub use event::{Channel, LifecycleEvent};
pub use sink::{EventSink, FanOut, PublishReport};
pub use view::{OrderView, ViewFollower, ViewScope};
