pub mod aggregator;
pub mod config;
pub mod coordinator;
pub mod matcher;
pub mod reconciler;
pub mod rules;
pub(crate) mod util;
pub mod verifier;

#[cfg(test)]
mod testing;

pub use aggregator::{AggregatorFeed, FeedError, HttpAggregatorFeed};
pub use config::{
    AggregatorConfig, ConfigError, MatchingConfig, PagingConfig, SyncConfig, VerifierConfig,
};
pub use coordinator::{ProgressReporter, SyncCoordinator, SyncError, SyncGuard, SyncPermit};
pub use matcher::{
    description_similarity, DuplicateMatch, MatchOutcome, MatchTier, TransactionMatcher,
    UncertainPair,
};
pub use reconciler::{Decisions, PageSummary, ReconcileError, Reconciler};
pub use rules::{confirm_category, import_rules, CategoryRuleEngine, RuleError};
pub use verifier::{
    HttpVerificationService, VerificationOutcome, VerificationReport, VerificationService,
    VerifiedMatch, VerifierClient, VerifyError,
};
