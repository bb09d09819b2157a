use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::NaiveDate;
use penny_core::{IncomingTransaction, LedgerTransaction, Money, TransactionId};
use serde::{Deserialize, Serialize};

use crate::util::similarity_ratio;

/// Token pairs scoring below this contribute nothing to description similarity.
const MIN_TOKEN_CREDIT: f32 = 0.5;
const DESCRIPTION_WEIGHT: f32 = 0.8;
const DATE_WEIGHT: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Deterministic,
    Verified,
}

/// An incoming aggregator transaction paired with the unlinked ledger row it
/// duplicates.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateMatch {
    pub incoming: IncomingTransaction,
    pub existing_id: TransactionId,
    pub confidence: f32,
    pub tier: MatchTier,
}

/// A plausible pair that needs semantic judgment. This is the wire shape sent
/// to the verification service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UncertainPair {
    pub new_transaction_ref: String,
    pub candidate_id: TransactionId,
    pub new_description: String,
    pub new_merchant_name: Option<String>,
    pub new_amount: Money,
    pub new_date: NaiveDate,
    pub candidate_description: String,
    pub candidate_amount: Money,
    pub candidate_date: NaiveDate,
    pub score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub definite: Vec<DuplicateMatch>,
    pub uncertain: Vec<UncertainPair>,
    pub unmatched: Vec<IncomingTransaction>,
    /// The incoming transactions behind `uncertain`, in input order.
    pub pending: Vec<IncomingTransaction>,
}

/// Tier-1 matcher: exact amount, date within tolerance, then description
/// similarity decides between definite, uncertain and unmatched.
#[derive(Debug, Clone)]
pub struct TransactionMatcher {
    pub date_tolerance_days: i64,
    pub definite_threshold: f32,
    pub uncertain_floor: f32,
    pub tie_margin: f32,
    pub max_candidates: usize,
}

impl Default for TransactionMatcher {
    fn default() -> Self {
        Self {
            date_tolerance_days: 3,
            definite_threshold: 0.8,
            uncertain_floor: 0.2,
            tie_margin: 0.05,
            max_candidates: 3,
        }
    }
}

struct Candidate<'a> {
    existing: &'a LedgerTransaction,
    description: f32,
    confidence: f32,
}

/// Higher confidence first, then the earliest-dated row, then the lowest id.
fn rank(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then(a.existing.date.cmp(&b.existing.date))
        .then(a.existing.id.cmp(&b.existing.id))
}

impl TransactionMatcher {
    pub fn partition(
        &self,
        incoming: &[IncomingTransaction],
        existing: &[LedgerTransaction],
    ) -> MatchOutcome {
        let candidates: Vec<Vec<Candidate<'_>>> = incoming
            .iter()
            .map(|inc| self.candidates_for(inc, existing))
            .collect();

        // Definite proposals: each incoming transaction's clear best candidate.
        let mut proposals: Vec<(usize, &Candidate<'_>)> = candidates
            .iter()
            .enumerate()
            .filter_map(|(idx, cands)| {
                let best = cands.first()?;
                (best.description >= self.definite_threshold && self.is_clear_best(cands))
                    .then_some((idx, best))
            })
            .collect();
        proposals.sort_by(|(ia, a), (ib, b)| rank(a, b).then(ia.cmp(ib)));

        let mut claimed: HashSet<TransactionId> = HashSet::new();
        let mut assigned = vec![false; incoming.len()];
        let mut outcome = MatchOutcome::default();

        for (idx, cand) in proposals {
            if claimed.insert(cand.existing.id) {
                assigned[idx] = true;
                outcome.definite.push(DuplicateMatch {
                    incoming: incoming[idx].clone(),
                    existing_id: cand.existing.id,
                    confidence: cand.confidence,
                    tier: MatchTier::Deterministic,
                });
            }
        }

        for (idx, inc) in incoming.iter().enumerate() {
            if assigned[idx] {
                continue;
            }
            let pairs: Vec<UncertainPair> = candidates[idx]
                .iter()
                .filter(|c| !claimed.contains(&c.existing.id))
                .take(self.max_candidates)
                .map(|c| uncertain_pair(inc, c))
                .collect();

            if pairs.is_empty() {
                outcome.unmatched.push(inc.clone());
            } else {
                outcome.uncertain.extend(pairs);
                outcome.pending.push(inc.clone());
            }
        }

        outcome
    }

    /// Plausible candidates for `inc`, best first. Candidates below the
    /// uncertain floor are discarded.
    fn candidates_for<'a>(
        &self,
        inc: &IncomingTransaction,
        existing: &'a [LedgerTransaction],
    ) -> Vec<Candidate<'a>> {
        let date = inc.preferred_date();
        let mut cands: Vec<Candidate<'a>> = existing
            .iter()
            .filter(|e| !e.is_linked())
            .filter(|e| e.account_id == inc.account_id)
            .filter(|e| e.amount.to_cents() == inc.amount.to_cents())
            .filter_map(|e| {
                let date_diff = (date - e.date).num_days().abs();
                if date_diff > self.date_tolerance_days {
                    return None;
                }
                let description = incoming_similarity(inc, &e.description);
                if description < self.uncertain_floor {
                    return None;
                }
                let date_score = 1.0 - (date_diff as f32 / (self.date_tolerance_days + 1) as f32);
                Some(Candidate {
                    existing: e,
                    description,
                    confidence: DESCRIPTION_WEIGHT * description + DATE_WEIGHT * date_score,
                })
            })
            .collect();
        cands.sort_by(rank);
        cands
    }

    /// No runner-up is also above the definite threshold within `tie_margin`.
    fn is_clear_best(&self, sorted: &[Candidate<'_>]) -> bool {
        let Some(best) = sorted.first() else {
            return false;
        };
        !sorted[1..].iter().any(|c| {
            c.description >= self.definite_threshold
                && best.confidence - c.confidence < self.tie_margin
        })
    }
}

fn uncertain_pair(inc: &IncomingTransaction, cand: &Candidate<'_>) -> UncertainPair {
    UncertainPair {
        new_transaction_ref: inc.aggregator_transaction_id.clone(),
        candidate_id: cand.existing.id,
        new_description: inc.name.clone(),
        new_merchant_name: inc.merchant_name.clone(),
        new_amount: inc.amount,
        new_date: inc.preferred_date(),
        candidate_description: cand.existing.description.clone(),
        candidate_amount: cand.existing.amount,
        candidate_date: cand.existing.date,
        score: cand.confidence,
    }
}

/// Best of the aggregator's raw name and its cleaned merchant name.
fn incoming_similarity(inc: &IncomingTransaction, existing_description: &str) -> f32 {
    let by_name = description_similarity(&inc.name, existing_description);
    match &inc.merchant_name {
        Some(merchant) => by_name.max(description_similarity(merchant, existing_description)),
        None => by_name,
    }
}

/// Soft token-overlap (Dice) similarity in [0.0, 1.0].
///
/// Descriptions are uppercased and split on non-alphanumerics; digit-only
/// and single-character tokens are dropped. Each token of the smaller set is
/// credited with its best Levenshtein ratio against the other set.
pub fn description_similarity(s1: &str, s2: &str) -> f32 {
    let a = tokens(s1);
    let b = tokens(s2);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let (small, large) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    let credit: f32 = small
        .iter()
        .map(|t| {
            let best = large
                .iter()
                .map(|u| similarity_ratio(t, u))
                .fold(0.0f32, f32::max);
            if best >= MIN_TOKEN_CREDIT {
                best
            } else {
                0.0
            }
        })
        .sum();

    (2.0 * credit / (a.len() + b.len()) as f32).min(1.0)
}

fn tokens(s: &str) -> Vec<String> {
    s.to_uppercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 1 && !w.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}
