// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// Each aggregate has its own subdirectory with:
// - Value objects
// - Commands
// - Changes / events
// - Aggregate implementation
// - Command handler
//
// The domain talks to persistence only through the `ledger` traits and to
// viewers only through `fanout`.
//
// ============================================================================

pub mod errors;
pub mod order;
pub mod dues;

pub use errors::{CommandError, Entity, Operation};
