pub mod db;
pub mod ledger;
pub mod store;

pub use db::{create_db, create_memory_db, DbPool};
pub use ledger::SqliteLedger;
pub use store::{CursorStore, LedgerStore, StoreError};
