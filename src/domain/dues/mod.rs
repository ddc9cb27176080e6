// ============================================================================
// Dues Domain - Customer balance derived from the ledger
// ============================================================================

pub mod value_objects;
pub mod reconciler;

pub use value_objects::*;
pub use reconciler::*;
