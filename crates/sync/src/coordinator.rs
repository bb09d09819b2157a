//! Orchestrates a sync pass for one bank connection.
//!
//! A pass walks `Idle → Fetching → Processing → Deduplicating → Saving` once
//! per delta page and returns to `Idle`. At most one pass per connection runs
//! at a time; a second request while one is in flight is coalesced into a
//! zero-delta result.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use penny_core::{
    AccountId, ConnectionId, DateRange, DeltaPage, IncomingTransaction, SyncProgress, SyncResult,
    SyncStage,
};
use penny_storage::{CursorStore, LedgerStore, StoreError};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::aggregator::{AggregatorFeed, FeedError};
use crate::config::SyncConfig;
use crate::matcher::TransactionMatcher;
use crate::reconciler::{Decisions, Reconciler};
use crate::verifier::VerifierClient;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Connection id must not be blank")]
    InvalidConnection,
}

/// Receives stage updates during a sync. Purely informational.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, connection: &ConnectionId, progress: SyncProgress);
}

impl<F> ProgressReporter for F
where
    F: Fn(&ConnectionId, SyncProgress) + Send + Sync,
{
    fn report(&self, connection: &ConnectionId, progress: SyncProgress) {
        self(connection, progress)
    }
}

impl ProgressReporter for UnboundedSender<(ConnectionId, SyncProgress)> {
    fn report(&self, connection: &ConnectionId, progress: SyncProgress) {
        // A closed receiver only means nobody is watching.
        let _ = self.send((connection.clone(), progress));
    }
}

/// Process-wide registry of connections with a sync in flight.
#[derive(Clone, Default)]
pub struct SyncGuard {
    active: Arc<DashMap<ConnectionId, SyncStage>>,
}

impl SyncGuard {
    /// A guard independent of every other; coordinators use [`SyncGuard::global`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The guard shared by every coordinator in the process.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<SyncGuard> = OnceLock::new();
        GLOBAL.get_or_init(SyncGuard::default).clone()
    }

    /// `None` when a sync for `connection` is already running.
    pub fn try_acquire(&self, connection: &ConnectionId) -> Option<SyncPermit> {
        match self.active.entry(connection.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(SyncStage::Fetching);
                Some(SyncPermit {
                    active: Arc::clone(&self.active),
                    connection: connection.clone(),
                })
            }
        }
    }

    pub fn stage(&self, connection: &ConnectionId) -> SyncStage {
        self.active
            .get(connection)
            .map(|stage| *stage)
            .unwrap_or(SyncStage::Idle)
    }

    pub fn is_syncing(&self, connection: &ConnectionId) -> bool {
        self.active.contains_key(connection)
    }
}

/// Held for the duration of a sync; dropping it releases the connection.
pub struct SyncPermit {
    active: Arc<DashMap<ConnectionId, SyncStage>>,
    connection: ConnectionId,
}

impl SyncPermit {
    fn set_stage(&self, stage: SyncStage) {
        if let Some(mut current) = self.active.get_mut(&self.connection) {
            *current = stage;
        }
    }
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        self.active.remove(&self.connection);
    }
}

struct PassContext<'a> {
    connection: &'a ConnectionId,
    permit: &'a SyncPermit,
    reporter: Option<&'a dyn ProgressReporter>,
}

impl PassContext<'_> {
    fn enter(&self, stage: SyncStage) {
        self.permit.set_stage(stage);
        self.notify(SyncProgress::stage(stage));
    }

    fn notify(&self, progress: SyncProgress) {
        if let Some(reporter) = self.reporter {
            reporter.report(self.connection, progress);
        }
    }
}

pub struct SyncCoordinator {
    feed: Arc<dyn AggregatorFeed>,
    store: Arc<dyn LedgerStore>,
    cursors: Arc<dyn CursorStore>,
    verifier: VerifierClient,
    reconciler: Reconciler,
    matcher: TransactionMatcher,
    window_padding_days: i64,
    max_pages: u32,
    fetch_timeout: Duration,
    guard: SyncGuard,
}

impl SyncCoordinator {
    pub fn new(
        feed: Arc<dyn AggregatorFeed>,
        store: Arc<dyn LedgerStore>,
        cursors: Arc<dyn CursorStore>,
        verifier: VerifierClient,
        config: &SyncConfig,
    ) -> Self {
        Self {
            feed,
            reconciler: Reconciler::new(Arc::clone(&store), Arc::clone(&cursors)),
            store,
            cursors,
            verifier,
            matcher: config.matching.matcher(),
            window_padding_days: config.matching.window_padding_days,
            max_pages: config.sync.max_pages_per_sync.max(1),
            fetch_timeout: Duration::from_secs(config.aggregator.timeout_secs),
            guard: SyncGuard::global(),
        }
    }

    /// Replaces the process-wide guard, isolating this coordinator.
    pub fn with_guard(mut self, guard: SyncGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn stage(&self, connection: &ConnectionId) -> SyncStage {
        self.guard.stage(connection)
    }

    /// Runs a sync pass for `connection_id`. Failures inside the pass are
    /// reported through [`SyncResult::errors`]; only a blank id is an error.
    #[tracing::instrument(name = "sync", skip_all, fields(connection = %connection_id))]
    pub async fn sync(
        &self,
        connection_id: &str,
        reporter: Option<&dyn ProgressReporter>,
    ) -> Result<SyncResult, SyncError> {
        let connection = ConnectionId::new(connection_id).ok_or(SyncError::InvalidConnection)?;

        let Some(permit) = self.guard.try_acquire(&connection) else {
            info!("sync already in progress, coalescing request");
            return Ok(SyncResult::empty(connection));
        };

        let ctx = PassContext {
            connection: &connection,
            permit: &permit,
            reporter,
        };
        let result = self.run_pass(&ctx).await;
        ctx.notify(SyncProgress::stage(SyncStage::Idle));

        info!(
            added = result.added,
            modified = result.modified,
            removed = result.removed,
            upgraded = result.upgraded,
            errors = result.errors.len(),
            requires_reauth = result.requires_reauth,
            "sync finished"
        );
        Ok(result)
    }

    async fn run_pass(&self, ctx: &PassContext<'_>) -> SyncResult {
        let connection = ctx.connection;
        let mut result = SyncResult::empty(connection.clone());

        let (accounts, mut cursor) = match self.load_state(connection).await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "could not load sync state");
                result.errors.push(format!("Could not load sync state: {e}"));
                return result;
            }
        };
        let account_ids: Vec<AccountId> = accounts.values().copied().collect();

        let mut reconciled_pages = 0u32;
        for page_no in 1..=self.max_pages {
            ctx.enter(SyncStage::Fetching);
            ctx.notify(SyncProgress::step(SyncStage::Fetching, page_no, self.max_pages));

            let page = match self.fetch(connection, cursor.as_deref()).await {
                Ok(page) => page,
                Err(e) => {
                    if e.requires_reauth() {
                        result.requires_reauth = true;
                    } else {
                        warn!(error = %e, page = page_no, "fetch failed");
                    }
                    result.errors.push(e.to_string());
                    break;
                }
            };

            match self.process_page(ctx, &page, &accounts, &account_ids, &mut result).await {
                Ok(()) => {
                    reconciled_pages += 1;
                    cursor = Some(page.next_cursor.clone());
                }
                Err(message) => {
                    warn!(page = page_no, %message, "page aborted");
                    result.errors.push(message);
                    break;
                }
            }

            if !page.has_more {
                break;
            }
            if page_no == self.max_pages {
                info!(pages = self.max_pages, "page limit reached, remaining changes wait for the next sync");
            }
        }

        if reconciled_pages > 0 {
            if let Err(e) = self.store.persist().await {
                warn!(error = %e, "persist failed");
                result.errors.push(format!("Could not persist ledger: {e}"));
            }
        }

        result
    }

    /// Accounts keyed by aggregator account id, and the saved cursor.
    async fn load_state(
        &self,
        connection: &ConnectionId,
    ) -> Result<(HashMap<String, AccountId>, Option<String>), StoreError> {
        let accounts = self
            .store
            .accounts_for_connection(connection)
            .await?
            .into_iter()
            .filter_map(|a| a.aggregator_account_id.map(|ext| (ext, a.id)))
            .collect();
        let cursor = self.cursors.get_cursor(connection).await?.map(|c| c.cursor);
        Ok((accounts, cursor))
    }

    async fn fetch(
        &self,
        connection: &ConnectionId,
        cursor: Option<&str>,
    ) -> Result<DeltaPage, FeedError> {
        tokio::time::timeout(self.fetch_timeout, self.feed.fetch_page(connection, cursor))
            .await
            .unwrap_or(Err(FeedError::Timeout(self.fetch_timeout)))
    }

    /// Matches, verifies and reconciles one page. `Err` carries the reason
    /// the page was abandoned; the cursor has not moved in that case.
    async fn process_page(
        &self,
        ctx: &PassContext<'_>,
        page: &DeltaPage,
        accounts: &HashMap<String, AccountId>,
        account_ids: &[AccountId],
        result: &mut SyncResult,
    ) -> Result<(), String> {
        ctx.enter(SyncStage::Processing);
        let incoming = self
            .fresh_incoming(page, accounts, &mut result.errors)
            .await
            .map_err(|e| format!("Could not check linked transactions: {e}"))?;

        ctx.enter(SyncStage::Deduplicating);
        let dates = incoming.iter().map(IncomingTransaction::preferred_date);
        let padding = self.window_padding_days.max(self.matcher.date_tolerance_days);
        let existing = match DateRange::around(dates, padding) {
            Some(range) => self
                .store
                .unlinked_in_range(account_ids, range)
                .await
                .map_err(|e| format!("Could not load candidate transactions: {e}"))?,
            None => Vec::new(),
        };

        let outcome = self.matcher.partition(&incoming, &existing);
        debug!(
            incoming = incoming.len(),
            candidates = existing.len(),
            definite = outcome.definite.len(),
            uncertain = outcome.uncertain.len(),
            unmatched = outcome.unmatched.len(),
            "tier-1 partition"
        );

        let report = self.verifier.verify(&outcome.uncertain).await;
        result.errors.extend(report.errors);
        let decisions = Decisions::resolve(outcome, &report.outcome);

        ctx.enter(SyncStage::Saving);
        let summary = self
            .reconciler
            .reconcile(ctx.connection, page, decisions)
            .await
            .map_err(|e| {
                result.errors.extend(e.row_errors().iter().cloned());
                e.to_string()
            })?;

        info!(
            added = summary.added,
            modified = summary.modified,
            removed = summary.removed,
            upgraded = summary.upgraded,
            cursor = %page.next_cursor,
            "page reconciled"
        );
        result.added += summary.added;
        result.modified += summary.modified;
        result.removed += summary.removed;
        result.upgraded += summary.upgraded;
        result.errors.extend(summary.errors);
        Ok(())
    }

    /// Maps the page's settled additions to local accounts, dropping repeats
    /// within the page and transactions some ledger row already holds.
    /// Pending entries are left for the aggregator to redeliver once posted.
    async fn fresh_incoming(
        &self,
        page: &DeltaPage,
        accounts: &HashMap<String, AccountId>,
        errors: &mut Vec<String>,
    ) -> Result<Vec<IncomingTransaction>, StoreError> {
        let mut seen = HashSet::new();
        let mut incoming = Vec::with_capacity(page.added.len());
        for raw in page.added.iter().filter(|raw| !raw.pending) {
            if !seen.insert(raw.aggregator_transaction_id.as_str()) {
                debug!(aggregator_id = %raw.aggregator_transaction_id, "duplicate entry in page");
                continue;
            }
            match accounts.get(&raw.account_external_id) {
                Some(&account_id) => incoming.push(IncomingTransaction::from_raw(raw, account_id)),
                None => {
                    warn!(
                        aggregator_id = %raw.aggregator_transaction_id,
                        account = %raw.account_external_id,
                        "transaction for unknown account skipped"
                    );
                    errors.push(format!(
                        "Skipped {}: unknown account {}",
                        raw.aggregator_transaction_id, raw.account_external_id
                    ));
                }
            }
        }

        if incoming.is_empty() {
            return Ok(incoming);
        }
        let ids: Vec<String> = incoming
            .iter()
            .map(|t| t.aggregator_transaction_id.clone())
            .collect();
        let linked = self.store.linked_aggregator_ids(&ids).await?;
        if !linked.is_empty() {
            debug!(already_linked = linked.len(), "skipping redelivered transactions");
        }
        incoming.retain(|t| !linked.contains(&t.aggregator_transaction_id));
        Ok(incoming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use penny_core::{Money, NewTransaction, RemovedTransaction};
    use penny_storage::SqliteLedger;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    struct Harness {
        ledger: SqliteLedger,
        store: Arc<FlakyStore>,
        feed: Arc<ScriptedFeed>,
        verifier: Arc<ScriptedVerifier>,
        coordinator: SyncCoordinator,
    }

    fn harness(ledger: SqliteLedger, feed: ScriptedFeed, verifier: ScriptedVerifier) -> Harness {
        harness_with(ledger, FlakyStore::new, feed, verifier, SyncConfig::default())
    }

    fn harness_with(
        ledger: SqliteLedger,
        wrap: impl FnOnce(SqliteLedger) -> FlakyStore,
        feed: ScriptedFeed,
        verifier: ScriptedVerifier,
        config: SyncConfig,
    ) -> Harness {
        let store = Arc::new(wrap(ledger.clone()));
        let feed = Arc::new(feed);
        let verifier = Arc::new(verifier);
        let client = VerifierClient::from_config(verifier.clone(), &config.verifier);
        let coordinator = SyncCoordinator::new(feed.clone(), store.clone(), store.clone(), client, &config)
            .with_guard(SyncGuard::new());
        Harness { ledger, store, feed, verifier, coordinator }
    }

    async fn manual(ledger: &SqliteLedger, account: AccountId, desc: &str, cents: i64, day: u32) {
        ledger
            .insert_transaction(&NewTransaction::manual(account, desc, Money::from_cents(cents), date(day)))
            .await
            .unwrap();
    }

    async fn cursor_of(ledger: &SqliteLedger) -> Option<String> {
        ledger.get_cursor(&conn()).await.unwrap().map(|c| c.cursor)
    }

    #[tokio::test]
    async fn blank_connection_is_rejected() {
        let (ledger, _) = ledger_with_account().await;
        let h = harness(ledger, ScriptedFeed::default(), ScriptedVerifier::default());
        assert_eq!(h.coordinator.sync("   ", None).await, Err(SyncError::InvalidConnection));
        assert_eq!(h.feed.call_count(), 0);
    }

    #[tokio::test]
    async fn starbucks_scenario_upgrades() {
        let (ledger, account) = ledger_with_account().await;
        manual(&ledger, account, "STARBUCKS 4821", -575, 10).await;
        let feed = ScriptedFeed::first_page(page(vec![raw("t1", "Starbucks", "5.75", 10)], "c-1"));
        let h = harness(ledger, feed, ScriptedVerifier::default());

        let result = h.coordinator.sync("item-1", None).await.unwrap();
        assert_eq!(result.upgraded, 1);
        assert_eq!(result.added, 0);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        assert_eq!(cursor_of(&h.ledger).await.as_deref(), Some("c-1"));
        assert_eq!(h.ledger.all_transactions().await.unwrap().len(), 1);
        assert_eq!(h.store.persist_count(), 1);
    }

    #[tokio::test]
    async fn redelivered_page_adds_nothing() {
        let (ledger, _) = ledger_with_account().await;
        let delta = page(
            vec![raw("t1", "Netflix", "15.99", 10), raw("t2", "Shell Oil", "40.00", 11)],
            "c-1",
        );
        let h = harness(ledger, ScriptedFeed::repeating(delta), ScriptedVerifier::default());

        let first = h.coordinator.sync("item-1", None).await.unwrap();
        assert_eq!(first.added, 2);
        let second = h.coordinator.sync("item-1", None).await.unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.upgraded, 0);
        assert!(second.errors.is_empty());
        assert_eq!(h.ledger.all_transactions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn removal_without_local_row_is_a_noop() {
        let (ledger, _) = ledger_with_account().await;
        let mut delta = page(Vec::new(), "c-1");
        delta.removed = vec![RemovedTransaction { aggregator_transaction_id: "t9".into() }];
        let h = harness(ledger, ScriptedFeed::first_page(delta), ScriptedVerifier::default());

        let result = h.coordinator.sync("item-1", None).await.unwrap();
        assert_eq!(result.removed, 0);
        assert!(result.errors.is_empty());
        assert_eq!(cursor_of(&h.ledger).await.as_deref(), Some("c-1"));
    }

    #[tokio::test]
    async fn reauth_leaves_cursor_and_ledger_alone() {
        let (ledger, _) = ledger_with_account().await;
        ledger.set_cursor(&conn(), "c-0", chrono::Utc::now()).await.unwrap();
        let feed = ScriptedFeed { reauth: true, ..Default::default() };
        let h = harness(ledger, feed, ScriptedVerifier::default());

        let result = h.coordinator.sync("item-1", None).await.unwrap();
        assert!(result.requires_reauth);
        assert_eq!(result.errors.len(), 1);
        assert!(result.is_zero_delta());
        assert_eq!(cursor_of(&h.ledger).await.as_deref(), Some("c-0"));
        assert_eq!(h.store.persist_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_request_is_coalesced() {
        let (ledger, _) = ledger_with_account().await;
        let mut feed = ScriptedFeed::first_page(page(vec![raw("t1", "Netflix", "15.99", 10)], "c-1"));
        feed.delay = Some(Duration::from_millis(100));
        let h = harness(ledger, feed, ScriptedVerifier::default());

        let (a, b) = tokio::join!(h.coordinator.sync("item-1", None), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.coordinator.sync("item-1", None).await
        });
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.added, 1);
        assert!(b.is_zero_delta());
        assert!(b.errors.is_empty());
        assert_eq!(h.feed.call_count(), 1);
        assert_eq!(h.coordinator.stage(&conn()), SyncStage::Idle);
    }

    #[tokio::test]
    async fn separate_coordinators_share_the_process_guard() {
        let (ledger, _) = ledger_with_account().await;
        let shared = ConnectionId::new("item-shared").unwrap();
        ledger.insert_account("Shared", Some(&shared), Some(EXTERNAL_ACCOUNT)).await.unwrap();
        let store = Arc::new(ledger.clone());

        let mut feed = ScriptedFeed::first_page(page(vec![raw("t1", "Netflix", "15.99", 10)], "c-1"));
        feed.delay = Some(Duration::from_millis(100));
        let feed = Arc::new(feed);
        let config = SyncConfig::default();
        let build = || {
            let client = VerifierClient::from_config(Arc::new(ScriptedVerifier::default()), &config.verifier);
            SyncCoordinator::new(feed.clone(), store.clone(), store.clone(), client, &config)
        };
        let (first, second) = (build(), build());

        let (a, b) = tokio::join!(first.sync("item-shared", None), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            second.sync("item-shared", None).await
        });
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(feed.call_count(), 1);
        assert_eq!(a.added + b.added, 1);
        assert!(a.errors.is_empty() && b.errors.is_empty());
        assert!(!SyncGuard::global().is_syncing(&shared));
    }

    #[tokio::test]
    async fn pending_entries_are_not_written() {
        let (ledger, _) = ledger_with_account().await;
        let mut pending = raw("t-pending", "Whole Foods", "82.10", 10);
        pending.pending = true;
        let delta = page(vec![pending, raw("t2", "Spotify", "9.99", 10)], "c-1");
        let h = harness(ledger, ScriptedFeed::first_page(delta), ScriptedVerifier::default());

        let result = h.coordinator.sync("item-1", None).await.unwrap();
        assert_eq!(result.added, 1);
        assert!(result.errors.is_empty());
        assert!(h.ledger.find_by_aggregator_id("t-pending").await.unwrap().is_none());
        assert_eq!(cursor_of(&h.ledger).await.as_deref(), Some("c-1"));
    }

    #[tokio::test]
    async fn guard_is_per_connection() {
        let guard = SyncGuard::new();
        let a = ConnectionId::new("item-a").unwrap();
        let b = ConnectionId::new("item-b").unwrap();

        let permit = guard.try_acquire(&a).unwrap();
        assert!(guard.try_acquire(&a).is_none());
        assert!(guard.try_acquire(&b).is_some());
        assert_eq!(guard.stage(&a), SyncStage::Fetching);

        permit.set_stage(SyncStage::Saving);
        assert_eq!(guard.stage(&a), SyncStage::Saving);

        drop(permit);
        assert!(!guard.is_syncing(&a));
        assert_eq!(guard.stage(&a), SyncStage::Idle);
        assert!(guard.try_acquire(&a).is_some());
    }

    #[tokio::test]
    async fn follows_has_more_until_the_last_page() {
        let (ledger, _) = ledger_with_account().await;
        let mut first = page(vec![raw("t1", "Netflix", "15.99", 10)], "c-1");
        first.has_more = true;
        let second = page(vec![raw("t2", "Spotify", "9.99", 11)], "c-2");
        let feed = ScriptedFeed::first_page(first).then("c-1", second);
        let h = harness(ledger, feed, ScriptedVerifier::default());

        let result = h.coordinator.sync("item-1", None).await.unwrap();
        assert_eq!(result.added, 2);
        assert_eq!(h.feed.call_count(), 2);
        assert_eq!(cursor_of(&h.ledger).await.as_deref(), Some("c-2"));
        assert_eq!(h.store.persist_count(), 1);
    }

    #[tokio::test]
    async fn page_limit_stops_pagination() {
        let (ledger, _) = ledger_with_account().await;
        let mut endless = page(Vec::new(), "c-n");
        endless.has_more = true;
        let mut config = SyncConfig::default();
        config.sync.max_pages_per_sync = 3;
        let h = harness_with(
            ledger,
            FlakyStore::new,
            ScriptedFeed::repeating(endless),
            ScriptedVerifier::default(),
            config,
        );

        h.coordinator.sync("item-1", None).await.unwrap();
        assert_eq!(h.feed.call_count(), 3);
    }

    #[tokio::test]
    async fn uncertain_pairs_go_through_the_verifier() {
        let (ledger, account) = ledger_with_account().await;
        manual(&ledger, account, "Amazon.com", -2599, 11).await;
        manual(&ledger, account, "Amazon.com", -1099, 12).await;
        let delta = page(
            vec![
                raw("t1", "AMZN Mktp US", "25.99", 10),
                raw("t2", "AMZN Mktp US", "10.99", 12),
            ],
            "c-1",
        );
        let h = harness(ledger, ScriptedFeed::first_page(delta), ScriptedVerifier::confirming(&["t1"]));

        let result = h.coordinator.sync("item-1", None).await.unwrap();
        assert_eq!(h.verifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.upgraded, 1);
        assert_eq!(result.added, 1);

        let rows = h.ledger.all_transactions().await.unwrap();
        assert_eq!(rows.len(), 3);
        let linked = h.ledger.find_by_aggregator_id("t1").await.unwrap().unwrap();
        assert_eq!(linked.date, date(10));
    }

    #[tokio::test]
    async fn no_two_rows_share_an_aggregator_id() {
        let (ledger, account) = ledger_with_account().await;
        manual(&ledger, account, "STARBUCKS", -575, 10).await;
        let delta = page(
            vec![
                raw("t1", "Starbucks", "5.75", 10),
                raw("t1", "Starbucks", "5.75", 10),
                raw("t2", "Starbucks", "5.75", 10),
            ],
            "c-1",
        );
        let h = harness(ledger, ScriptedFeed::repeating(delta), ScriptedVerifier::confirming(&["t1", "t2"]));

        h.coordinator.sync("item-1", None).await.unwrap();
        h.coordinator.sync("item-1", None).await.unwrap();

        let rows = h.ledger.all_transactions().await.unwrap();
        let mut ids: Vec<_> = rows.iter().filter_map(|r| r.link.transaction_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["t1".to_string(), "t2".to_string()]);
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn unknown_account_is_skipped_with_an_error() {
        let (ledger, _) = ledger_with_account().await;
        let mut stray = raw("t1", "Netflix", "15.99", 10);
        stray.account_external_id = "acc-other".into();
        let delta = page(vec![stray, raw("t2", "Spotify", "9.99", 10)], "c-1");
        let h = harness(ledger, ScriptedFeed::first_page(delta), ScriptedVerifier::default());

        let result = h.coordinator.sync("item-1", None).await.unwrap();
        assert_eq!(result.added, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("acc-other"));
    }

    #[tokio::test]
    async fn fatal_store_error_aborts_the_page() {
        let (ledger, _) = ledger_with_account().await;
        let delta = page(
            vec![raw("t1", "Netflix", "15.99", 10), raw("t2", "Spotify", "9.99", 10)],
            "c-1",
        );
        let h = harness_with(
            ledger,
            |inner| FlakyStore::failing_after(inner, 1),
            ScriptedFeed::first_page(delta),
            ScriptedVerifier::default(),
            SyncConfig::default(),
        );

        let result = h.coordinator.sync("item-1", None).await.unwrap();
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("page aborted"));
        assert_eq!(cursor_of(&h.ledger).await, None);
        assert_eq!(h.store.persist_count(), 0);
    }

    #[tokio::test]
    async fn slow_feed_times_out() {
        let (ledger, _) = ledger_with_account().await;
        let mut feed = ScriptedFeed::first_page(page(Vec::new(), "c-1"));
        feed.delay = Some(Duration::from_secs(3));
        let mut config = SyncConfig::default();
        config.aggregator.timeout_secs = 1;
        let h = harness_with(ledger, FlakyStore::new, feed, ScriptedVerifier::default(), config);

        let result = h.coordinator.sync("item-1", None).await.unwrap();
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("timed out"));
        assert!(!result.requires_reauth);
        assert_eq!(cursor_of(&h.ledger).await, None);
    }

    #[tokio::test]
    async fn progress_reports_stages_in_order() {
        let (ledger, _) = ledger_with_account().await;
        let feed = ScriptedFeed::first_page(page(vec![raw("t1", "Netflix", "15.99", 10)], "c-1"));
        let h = harness(ledger, feed, ScriptedVerifier::default());

        let seen = Mutex::new(Vec::new());
        let reporter = |_: &ConnectionId, p: SyncProgress| {
            let mut seen = seen.lock().unwrap();
            if seen.last() != Some(&p.stage) {
                seen.push(p.stage);
            }
        };
        h.coordinator.sync("item-1", Some(&reporter)).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                SyncStage::Fetching,
                SyncStage::Processing,
                SyncStage::Deduplicating,
                SyncStage::Saving,
                SyncStage::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn channel_reporter_receives_updates() {
        let (ledger, _) = ledger_with_account().await;
        let h = harness(ledger, ScriptedFeed::default(), ScriptedVerifier::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        h.coordinator.sync("item-1", Some(&tx)).await.unwrap();
        drop(tx);

        let mut last = None;
        while let Some((connection, progress)) = rx.recv().await {
            assert_eq!(connection, conn());
            last = Some(progress.stage);
        }
        assert_eq!(last, Some(SyncStage::Idle));
    }
}
