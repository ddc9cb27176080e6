// ============================================================================
// Ledger Store
// ============================================================================
//
// Durable record of orders, items, returns, due clearances, and the cached
// dues column on customers. The only shared mutable resource of the core.
//
// - store    - the LedgerStore / LedgerTransaction seam
// - memory   - single-writer in-process ledger (tests, demo)
// - postgres - sqlx-backed relational ledger
//
// ============================================================================

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryLedger;
pub use postgres::PostgresLedger;
pub use store::{LedgerStore, LedgerTransaction, NewAgent, NewCustomer};
