//! In-process fakes for the engine's seams.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use penny_core::{
    Account, AccountId, CategorizationRule, CategoryId, ConnectionId, DateRange, DeltaPage,
    LedgerTransaction, LinkedUpdate, NewTransaction, RawTransaction, SyncCursor, TransactionId,
};
use penny_storage::{create_memory_db, CursorStore, LedgerStore, SqliteLedger, StoreError};
use rust_decimal::Decimal;

use crate::aggregator::{AggregatorFeed, FeedError};
use crate::matcher::UncertainPair;
use crate::verifier::{VerificationOutcome, VerificationService, VerifiedMatch, VerifyError};

pub const EXTERNAL_ACCOUNT: &str = "acc-ext";

pub fn conn() -> ConnectionId {
    ConnectionId::new("item-1").unwrap()
}

pub fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
}

pub async fn ledger_with_account() -> (SqliteLedger, AccountId) {
    let ledger = SqliteLedger::new(create_memory_db().await.unwrap());
    let account = ledger
        .insert_account("Checking", Some(&conn()), Some(EXTERNAL_ACCOUNT))
        .await
        .unwrap();
    (ledger, account)
}

/// `amount` uses the aggregator's sign convention: "5.75" is money out.
pub fn raw(id: &str, name: &str, amount: &str, day: u32) -> RawTransaction {
    RawTransaction {
        aggregator_transaction_id: id.to_string(),
        account_external_id: EXTERNAL_ACCOUNT.to_string(),
        name: name.to_string(),
        merchant_name: None,
        amount: Decimal::from_str(amount).unwrap(),
        date: date(day),
        authorized_date: None,
        pending: false,
    }
}

pub fn page(added: Vec<RawTransaction>, next_cursor: &str) -> DeltaPage {
    DeltaPage {
        added,
        next_cursor: next_cursor.to_string(),
        ..Default::default()
    }
}

/// Serves pages keyed by the cursor they follow. Unknown cursors get
/// `fallback`, or an empty page that keeps the cursor where it is.
#[derive(Default)]
pub struct ScriptedFeed {
    pub by_cursor: HashMap<Option<String>, DeltaPage>,
    pub fallback: Option<DeltaPage>,
    pub reauth: bool,
    pub delay: Option<Duration>,
    pub calls: Mutex<Vec<Option<String>>>,
}

impl ScriptedFeed {
    pub fn first_page(page: DeltaPage) -> Self {
        let mut by_cursor = HashMap::new();
        by_cursor.insert(None, page);
        Self { by_cursor, ..Default::default() }
    }

    pub fn then(mut self, after: &str, page: DeltaPage) -> Self {
        self.by_cursor.insert(Some(after.to_string()), page);
        self
    }

    pub fn repeating(page: DeltaPage) -> Self {
        Self { fallback: Some(page), ..Default::default() }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl AggregatorFeed for ScriptedFeed {
    async fn fetch_page(
        &self,
        _connection: &ConnectionId,
        cursor: Option<&str>,
    ) -> Result<DeltaPage, FeedError> {
        let key = cursor.map(str::to_string);
        self.calls.lock().unwrap().push(key.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.reauth {
            return Err(FeedError::ReauthRequired("ITEM_LOGIN_REQUIRED".to_string()));
        }
        let page = self
            .by_cursor
            .get(&key)
            .or(self.fallback.as_ref())
            .cloned()
            .unwrap_or_else(|| DeltaPage {
                next_cursor: key.unwrap_or_default(),
                ..Default::default()
            });
        Ok(page)
    }
}

/// Confirms every pair whose incoming reference is in `confirm`.
#[derive(Default)]
pub struct ScriptedVerifier {
    pub confirm: HashSet<String>,
    pub calls: AtomicUsize,
}

impl ScriptedVerifier {
    pub fn confirming(refs: &[&str]) -> Self {
        Self {
            confirm: refs.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl VerificationService for ScriptedVerifier {
    async fn verify_batch(&self, pairs: &[UncertainPair]) -> Result<VerificationOutcome, VerifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut outcome = VerificationOutcome::default();
        for pair in pairs {
            if self.confirm.contains(&pair.new_transaction_ref) {
                outcome.matches.push(VerifiedMatch {
                    candidate_id: pair.candidate_id,
                    new_transaction_ref: pair.new_transaction_ref.clone(),
                    confidence: 0.9,
                });
            } else {
                outcome.non_matches.push(pair.new_transaction_ref.clone());
            }
        }
        Ok(outcome)
    }
}

/// Wraps a real ledger and starts failing fatally after a number of inserts.
pub struct FlakyStore {
    pub inner: SqliteLedger,
    pub fail_after_inserts: Option<usize>,
    pub inserts: AtomicUsize,
    pub persists: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: SqliteLedger) -> Self {
        Self {
            inner,
            fail_after_inserts: None,
            inserts: AtomicUsize::new(0),
            persists: AtomicUsize::new(0),
        }
    }

    pub fn failing_after(inner: SqliteLedger, inserts: usize) -> Self {
        Self { fail_after_inserts: Some(inserts), ..Self::new(inner) }
    }

    pub fn persist_count(&self) -> usize {
        self.persists.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerStore for FlakyStore {
    async fn accounts_for_connection(&self, connection: &ConnectionId) -> Result<Vec<Account>, StoreError> {
        self.inner.accounts_for_connection(connection).await
    }

    async fn linked_aggregator_ids(&self, ids: &[String]) -> Result<HashSet<String>, StoreError> {
        self.inner.linked_aggregator_ids(ids).await
    }

    async fn unlinked_in_range(
        &self,
        accounts: &[AccountId],
        range: DateRange,
    ) -> Result<Vec<LedgerTransaction>, StoreError> {
        self.inner.unlinked_in_range(accounts, range).await
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<LedgerTransaction>, StoreError> {
        self.inner.get_transaction(id).await
    }

    async fn insert_transaction(&self, tx: &NewTransaction) -> Result<TransactionId, StoreError> {
        let done = self.inserts.fetch_add(1, Ordering::SeqCst);
        if self.fail_after_inserts.is_some_and(|limit| done >= limit) {
            return Err(StoreError::Unavailable("disk I/O error".to_string()));
        }
        self.inner.insert_transaction(tx).await
    }

    async fn upgrade_transaction(&self, id: TransactionId, update: &LinkedUpdate) -> Result<(), StoreError> {
        self.inner.upgrade_transaction(id, update).await
    }

    async fn update_by_aggregator_id(&self, id: &str, update: &LinkedUpdate) -> Result<bool, StoreError> {
        self.inner.update_by_aggregator_id(id, update).await
    }

    async fn delete_by_aggregator_id(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete_by_aggregator_id(id).await
    }

    async fn categorization_rules(&self) -> Result<Vec<CategorizationRule>, StoreError> {
        self.inner.categorization_rules().await
    }

    async fn upsert_rule(&self, rule: &CategorizationRule) -> Result<(), StoreError> {
        self.inner.upsert_rule(rule).await
    }

    async fn set_category(&self, id: TransactionId, category: CategoryId, confirmed: bool) -> Result<(), StoreError> {
        self.inner.set_category(id, category, confirmed).await
    }

    async fn persist(&self) -> Result<(), StoreError> {
        self.persists.fetch_add(1, Ordering::SeqCst);
        self.inner.persist().await
    }

    async fn vacuum(&self) -> Result<(), StoreError> {
        self.inner.vacuum().await
    }
}

#[async_trait]
impl CursorStore for FlakyStore {
    async fn get_cursor(&self, connection: &ConnectionId) -> Result<Option<SyncCursor>, StoreError> {
        self.inner.get_cursor(connection).await
    }

    async fn set_cursor(&self, connection: &ConnectionId, cursor: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.set_cursor(connection, cursor, at).await
    }
}
