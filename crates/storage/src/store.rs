//! The data-access contract the sync engine writes through.
//!
//! [`LedgerStore`] covers the row-level operations on ledger transactions,
//! categorization rules and the durable flush; [`CursorStore`] is the
//! per-connection feed position. Both are implemented by
//! [`crate::SqliteLedger`].

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use penny_core::{
    Account, AccountId, CategorizationRule, CategoryId, ConnectionId, DateRange,
    LedgerTransaction, LinkedUpdate, NewTransaction, SyncCursor, TransactionId,
};
use sqlx::error::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Transaction {0} not found")]
    NotFound(TransactionId),
    #[error("Transaction {0} is already linked to an aggregator transaction")]
    AlreadyLinked(TransactionId),
    #[error("Aggregator transaction '{0}' is already linked to another row")]
    DuplicateLink(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Row-level failures affect a single write and can be skipped; anything
    /// else means the store itself is unusable and the page must be aborted.
    /// A database error is row-level only when it is a constraint violation.
    pub fn is_row_level(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Database(db)) => matches!(
                db.kind(),
                ErrorKind::UniqueViolation
                    | ErrorKind::ForeignKeyViolation
                    | ErrorKind::NotNullViolation
                    | ErrorKind::CheckViolation
            ),
            StoreError::Database(e) => {
                matches!(e, sqlx::Error::RowNotFound | sqlx::Error::ColumnDecode { .. })
            }
            StoreError::NotFound(_)
            | StoreError::AlreadyLinked(_)
            | StoreError::DuplicateLink(_)
            | StoreError::Corrupt(_) => true,
            StoreError::Unavailable(_) => false,
        }
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Accounts fed by `connection`, with their aggregator account ids.
    async fn accounts_for_connection(
        &self,
        connection: &ConnectionId,
    ) -> Result<Vec<Account>, StoreError>;

    /// The subset of `aggregator_ids` already held by some ledger row.
    async fn linked_aggregator_ids(
        &self,
        aggregator_ids: &[String],
    ) -> Result<HashSet<String>, StoreError>;

    /// Unlinked rows on `accounts` dated within `range`, oldest first.
    async fn unlinked_in_range(
        &self,
        accounts: &[AccountId],
        range: DateRange,
    ) -> Result<Vec<LedgerTransaction>, StoreError>;

    async fn get_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<LedgerTransaction>, StoreError>;

    async fn insert_transaction(&self, tx: &NewTransaction) -> Result<TransactionId, StoreError>;

    /// Attaches aggregator linkage to an existing unlinked row, keeping its
    /// id, category and confirmation state.
    async fn upgrade_transaction(
        &self,
        id: TransactionId,
        update: &LinkedUpdate,
    ) -> Result<(), StoreError>;

    /// Returns `false` when no row carries `aggregator_id`.
    async fn update_by_aggregator_id(
        &self,
        aggregator_id: &str,
        update: &LinkedUpdate,
    ) -> Result<bool, StoreError>;

    /// Returns `false` when no row carries `aggregator_id`.
    async fn delete_by_aggregator_id(&self, aggregator_id: &str) -> Result<bool, StoreError>;

    /// Rules in stored order.
    async fn categorization_rules(&self) -> Result<Vec<CategorizationRule>, StoreError>;

    async fn upsert_rule(&self, rule: &CategorizationRule) -> Result<(), StoreError>;

    async fn set_category(
        &self,
        id: TransactionId,
        category: CategoryId,
        confirmed: bool,
    ) -> Result<(), StoreError>;

    /// Flushes committed rows to durable storage.
    async fn persist(&self) -> Result<(), StoreError>;

    /// Reclaims space after bulk deletions. Not called by the sync engine.
    async fn vacuum(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get_cursor(&self, connection: &ConnectionId) -> Result<Option<SyncCursor>, StoreError>;

    async fn set_cursor(
        &self,
        connection: &ConnectionId,
        cursor: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
