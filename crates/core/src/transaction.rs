use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::account::{AccountId, CategoryId, CoreError};
use super::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub i64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Aggregator linkage carried by a ledger row. All fields are `None` for
/// rows that were entered by hand or imported from a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorLink {
    pub transaction_id: Option<String>,
    pub authorized_date: Option<NaiveDate>,
    pub posted_date: Option<NaiveDate>,
    pub merchant_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerTransaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    pub category_id: Option<CategoryId>,
    pub description: String,
    pub amount: Money,
    pub date: NaiveDate,
    pub excluded: bool,
    pub is_confirmed: bool,
    pub created_at: DateTime<Utc>,
    pub link: AggregatorLink,
}

impl LedgerTransaction {
    pub fn is_linked(&self) -> bool {
        self.link.transaction_id.is_some()
    }
}

/// A ledger row that has not been written yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub account_id: AccountId,
    pub category_id: Option<CategoryId>,
    pub description: String,
    pub amount: Money,
    pub date: NaiveDate,
    pub is_confirmed: bool,
    pub link: AggregatorLink,
}

impl NewTransaction {
    /// A hand-entered (or file-imported) row with no aggregator linkage.
    pub fn manual(account_id: AccountId, description: &str, amount: Money, date: NaiveDate) -> Self {
        NewTransaction {
            account_id,
            category_id: None,
            description: description.to_string(),
            amount,
            date,
            is_confirmed: false,
            link: AggregatorLink::default(),
        }
    }
}

/// Fields overwritten from the aggregator payload on upgrade or modification.
/// Category, confirmation state and the row id are never touched.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedUpdate {
    pub description: String,
    pub amount: Money,
    pub date: NaiveDate,
    pub link: AggregatorLink,
}

pub fn parse_date(s: &str) -> Result<NaiveDate, CoreError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| CoreError::InvalidDate(s.to_string()))
}
