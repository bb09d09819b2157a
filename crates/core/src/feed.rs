//! Payloads of the aggregator's cursor-based change feed, and the incoming
//! transaction shape the engine works with once a payload has been mapped to
//! a local account.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::account::AccountId;
use crate::money::Money;
use crate::transaction::{AggregatorLink, LinkedUpdate, NewTransaction};

/// A transaction exactly as the aggregator reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    pub aggregator_transaction_id: String,
    pub account_external_id: String,
    pub name: String,
    #[serde(default)]
    pub merchant_name: Option<String>,
    /// Aggregator sign convention: positive means money left the account.
    pub amount: Decimal,
    pub date: NaiveDate,
    #[serde(default)]
    pub authorized_date: Option<NaiveDate>,
    #[serde(default)]
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedTransaction {
    pub aggregator_transaction_id: String,
}

/// One page of the delta feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaPage {
    #[serde(default)]
    pub added: Vec<RawTransaction>,
    #[serde(default)]
    pub modified: Vec<RawTransaction>,
    #[serde(default)]
    pub removed: Vec<RemovedTransaction>,
    pub next_cursor: String,
    #[serde(default)]
    pub has_more: bool,
}

impl DeltaPage {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// An aggregator transaction resolved to a local account, with the amount
/// already in ledger sign convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingTransaction {
    pub aggregator_transaction_id: String,
    pub account_id: AccountId,
    pub name: String,
    pub merchant_name: Option<String>,
    pub amount: Money,
    pub posted_date: NaiveDate,
    pub authorized_date: Option<NaiveDate>,
}

impl IncomingTransaction {
    pub fn from_raw(raw: &RawTransaction, account_id: AccountId) -> Self {
        IncomingTransaction {
            aggregator_transaction_id: raw.aggregator_transaction_id.clone(),
            account_id,
            name: raw.name.clone(),
            merchant_name: raw.merchant_name.clone(),
            amount: Money::from_aggregator(raw.amount),
            posted_date: raw.date,
            authorized_date: raw.authorized_date,
        }
    }

    /// Authorized date when the bank supplied one, otherwise the posted date.
    pub fn preferred_date(&self) -> NaiveDate {
        self.authorized_date.unwrap_or(self.posted_date)
    }

    pub fn link(&self) -> AggregatorLink {
        AggregatorLink {
            transaction_id: Some(self.aggregator_transaction_id.clone()),
            authorized_date: self.authorized_date,
            posted_date: Some(self.posted_date),
            merchant_name: self.merchant_name.clone(),
        }
    }

    pub fn to_update(&self) -> LinkedUpdate {
        LinkedUpdate {
            description: self.name.clone(),
            amount: self.amount,
            date: self.preferred_date(),
            link: self.link(),
        }
    }

    pub fn to_new_transaction(&self) -> NewTransaction {
        NewTransaction {
            account_id: self.account_id,
            category_id: None,
            description: self.name.clone(),
            amount: self.amount,
            date: self.preferred_date(),
            is_confirmed: false,
            link: self.link(),
        }
    }
}

impl RawTransaction {
    /// Update payload for a modification reported against an already-linked row.
    pub fn to_update(&self) -> LinkedUpdate {
        LinkedUpdate {
            description: self.name.clone(),
            amount: Money::from_aggregator(self.amount),
            date: self.authorized_date.unwrap_or(self.date),
            link: AggregatorLink {
                transaction_id: Some(self.aggregator_transaction_id.clone()),
                authorized_date: self.authorized_date,
                posted_date: Some(self.date),
                merchant_name: self.merchant_name.clone(),
            },
        }
    }
}
