//! Applies one page's decisions to the ledger and advances the cursor.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use penny_core::{ConnectionId, DeltaPage, IncomingTransaction, TransactionId};
use penny_storage::{CursorStore, LedgerStore, StoreError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::matcher::{DuplicateMatch, MatchOutcome, MatchTier};
use crate::rules::CategoryRuleEngine;
use crate::verifier::VerificationOutcome;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// `row_errors` holds what was collected before the failure.
    #[error("Store failure, page aborted: {source}")]
    Store {
        source: StoreError,
        row_errors: Vec<String>,
    },
}

impl ReconcileError {
    pub fn row_errors(&self) -> &[String] {
        match self {
            ReconcileError::Store { row_errors, .. } => row_errors,
        }
    }
}

/// What to write for the `added` part of a page.
#[derive(Debug, Clone, Default)]
pub struct Decisions {
    pub upgrades: Vec<DuplicateMatch>,
    pub inserts: Vec<IncomingTransaction>,
}

impl Decisions {
    /// Folds the verification service's answers into the Tier-1 outcome.
    ///
    /// Each incoming transaction takes its first acceptable match; a row
    /// already claimed (by a definite match or an earlier verified one) is
    /// skipped. Uncertain transactions left unresolved are inserted.
    pub fn resolve(outcome: MatchOutcome, verification: &VerificationOutcome) -> Self {
        let submitted: HashSet<(&str, TransactionId)> = outcome
            .uncertain
            .iter()
            .map(|p| (p.new_transaction_ref.as_str(), p.candidate_id))
            .collect();
        let mut claimed: HashSet<TransactionId> =
            outcome.definite.iter().map(|m| m.existing_id).collect();
        let mut resolved: HashMap<String, (TransactionId, f32)> = HashMap::new();

        for m in &verification.matches {
            if !submitted.contains(&(m.new_transaction_ref.as_str(), m.candidate_id)) {
                warn!(
                    reference = %m.new_transaction_ref,
                    candidate = %m.candidate_id,
                    "verifier matched a pair that was never submitted, ignoring"
                );
                continue;
            }
            if resolved.contains_key(&m.new_transaction_ref) {
                continue;
            }
            if !claimed.insert(m.candidate_id) {
                debug!(candidate = %m.candidate_id, "candidate already claimed, skipping verified match");
                continue;
            }
            resolved.insert(m.new_transaction_ref.clone(), (m.candidate_id, m.confidence));
        }

        let mut upgrades = outcome.definite;
        let mut inserts = outcome.unmatched;
        for incoming in outcome.pending {
            match resolved.remove(&incoming.aggregator_transaction_id) {
                Some((existing_id, confidence)) => upgrades.push(DuplicateMatch {
                    incoming,
                    existing_id,
                    confidence,
                    tier: MatchTier::Verified,
                }),
                None => inserts.push(incoming),
            }
        }

        Decisions { upgrades, inserts }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSummary {
    pub added: u32,
    pub modified: u32,
    pub removed: u32,
    pub upgraded: u32,
    pub errors: Vec<String>,
}

pub struct Reconciler {
    store: Arc<dyn LedgerStore>,
    cursors: Arc<dyn CursorStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn LedgerStore>, cursors: Arc<dyn CursorStore>) -> Self {
        Self { store, cursors }
    }

    /// Writes upgrades, inserts, modifications and removals, then moves the
    /// cursor to `page.next_cursor`. A fatal store error returns early and the
    /// cursor keeps its previous value.
    pub async fn reconcile(
        &self,
        connection: &ConnectionId,
        page: &DeltaPage,
        decisions: Decisions,
    ) -> Result<PageSummary, ReconcileError> {
        let mut summary = PageSummary::default();
        match self.apply(connection, page, &decisions, &mut summary).await {
            Ok(()) => Ok(summary),
            Err(source) => Err(ReconcileError::Store {
                source,
                row_errors: summary.errors,
            }),
        }
    }

    async fn apply(
        &self,
        connection: &ConnectionId,
        page: &DeltaPage,
        decisions: &Decisions,
        summary: &mut PageSummary,
    ) -> Result<(), StoreError> {
        let rules = CategoryRuleEngine::load(self.store.as_ref()).await?;

        for m in &decisions.upgrades {
            match self
                .store
                .upgrade_transaction(m.existing_id, &m.incoming.to_update())
                .await
            {
                Ok(()) => {
                    debug!(
                        aggregator_id = %m.incoming.aggregator_transaction_id,
                        existing = %m.existing_id,
                        tier = ?m.tier,
                        confidence = m.confidence,
                        "upgraded"
                    );
                    summary.upgraded += 1;
                }
                // The target changed since matching; a possible duplicate
                // beats losing the transaction.
                Err(e) if e.is_row_level() => {
                    warn!(
                        aggregator_id = %m.incoming.aggregator_transaction_id,
                        existing = %m.existing_id,
                        error = %e,
                        "upgrade target unavailable, inserting instead"
                    );
                    self.insert(&m.incoming, &rules, summary).await?;
                }
                Err(e) => return Err(e),
            }
        }

        for incoming in &decisions.inserts {
            self.insert(incoming, &rules, summary).await?;
        }

        for raw in &page.modified {
            let result = self
                .store
                .update_by_aggregator_id(&raw.aggregator_transaction_id, &raw.to_update())
                .await;
            match absorb(result, &mut summary.errors, || {
                format!("Could not apply modification to {}", raw.aggregator_transaction_id)
            })? {
                Some(true) => summary.modified += 1,
                Some(false) => {
                    debug!(aggregator_id = %raw.aggregator_transaction_id, "modified entry has no local row")
                }
                None => {}
            }
        }

        for removed in &page.removed {
            let result = self
                .store
                .delete_by_aggregator_id(&removed.aggregator_transaction_id)
                .await;
            if let Some(true) = absorb(result, &mut summary.errors, || {
                format!("Could not remove {}", removed.aggregator_transaction_id)
            })? {
                summary.removed += 1;
            }
        }

        self.cursors
            .set_cursor(connection, &page.next_cursor, Utc::now())
            .await
    }

    /// Inserts `incoming` as a new, auto-categorized, unconfirmed row.
    async fn insert(
        &self,
        incoming: &IncomingTransaction,
        rules: &CategoryRuleEngine,
        summary: &mut PageSummary,
    ) -> Result<(), StoreError> {
        let mut tx = incoming.to_new_transaction();
        tx.category_id = rules.categorize(&incoming.name);
        let result = self.store.insert_transaction(&tx).await;
        if absorb(result, &mut summary.errors, || {
            format!("Could not insert {}", incoming.aggregator_transaction_id)
        })?
        .is_some()
        {
            summary.added += 1;
        }
        Ok(())
    }
}

/// Row-level failures become a collected message; anything else aborts.
fn absorb<T>(
    result: Result<T, StoreError>,
    errors: &mut Vec<String>,
    context: impl FnOnce() -> String,
) -> Result<Option<T>, StoreError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_row_level() => {
            let message = format!("{}: {e}", context());
            warn!(error = %e, "{}", message);
            errors.push(message);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
