pub mod account;
pub mod feed;
pub mod merchant;
pub mod money;
pub mod period;
pub mod sync;
pub mod transaction;

pub use account::{Account, AccountId, CategoryId, ConnectionId, CoreError};
pub use feed::{DeltaPage, IncomingTransaction, RawTransaction, RemovedTransaction};
pub use merchant::extract_pattern;
pub use money::Money;
pub use period::DateRange;
pub use sync::{CategorizationRule, SyncCursor, SyncProgress, SyncResult, SyncStage};
pub use transaction::{
    parse_date, AggregatorLink, LedgerTransaction, LinkedUpdate, NewTransaction, TransactionId,
};
