use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use penny_core::{
    parse_date, Account, AccountId, AggregatorLink, CategorizationRule, CategoryId, ConnectionId,
    DateRange, LedgerTransaction, LinkedUpdate, Money, NewTransaction, SyncCursor, TransactionId,
};
use sqlx::sqlite::SqliteArguments;
use sqlx::{QueryBuilder, Sqlite};

use crate::db::DbPool;
use crate::store::{CursorStore, LedgerStore, StoreError};

/// SQLite's bound-parameter limit is 999 on older builds.
const MAX_BIND_CHUNK: usize = 500;

const TXN_COLUMNS: &str = "id, account_id, category_id, description, amount_cents, date, excluded, is_confirmed, created_at, aggregator_transaction_id, aggregator_authorized_date, aggregator_posted_date, aggregator_merchant_name";

type TxnRow = (
    i64,
    i64,
    Option<i64>,
    String,
    i64,
    String,
    i64,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: DbPool,
}

impl SqliteLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Registers a local account. Account management proper lives in the UI
    /// layer; this exists for setup and the CLI.
    pub async fn insert_account(
        &self,
        name: &str,
        connection: Option<&ConnectionId>,
        aggregator_account_id: Option<&str>,
    ) -> Result<AccountId, StoreError> {
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO accounts (name, connection_id, aggregator_account_id) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(connection.map(ConnectionId::as_str))
        .bind(aggregator_account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(AccountId(id))
    }

    /// Every ledger row, newest first.
    pub async fn all_transactions(&self) -> Result<Vec<LedgerTransaction>, StoreError> {
        let rows = sqlx::query_as::<_, TxnRow>(&format!(
            "SELECT {TXN_COLUMNS} FROM transactions ORDER BY date DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_transaction).collect()
    }

    pub async fn find_by_aggregator_id(
        &self,
        aggregator_id: &str,
    ) -> Result<Option<LedgerTransaction>, StoreError> {
        let row = sqlx::query_as::<_, TxnRow>(&format!(
            "SELECT {TXN_COLUMNS} FROM transactions WHERE aggregator_transaction_id = ?"
        ))
        .bind(aggregator_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_transaction).transpose()
    }
}

#[async_trait]
impl LedgerStore for SqliteLedger {
    async fn accounts_for_connection(
        &self,
        connection: &ConnectionId,
    ) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, String, Option<String>, Option<String>)>(
            "SELECT id, name, connection_id, aggregator_account_id FROM accounts WHERE connection_id = ? ORDER BY id",
        )
        .bind(connection.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Account {
                id: AccountId(r.0),
                name: r.1,
                connection_id: r.2.and_then(ConnectionId::new),
                aggregator_account_id: r.3,
            })
            .collect())
    }

    async fn linked_aggregator_ids(
        &self,
        aggregator_ids: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let mut linked = HashSet::new();
        for chunk in aggregator_ids.chunks(MAX_BIND_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT aggregator_transaction_id FROM transactions WHERE aggregator_transaction_id IN (",
            );
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(id.as_str());
            }
            separated.push_unseparated(")");

            let rows: Vec<(String,)> = qb.build_query_as().fetch_all(&self.pool).await?;
            linked.extend(rows.into_iter().map(|r| r.0));
        }
        Ok(linked)
    }

    async fn unlinked_in_range(
        &self,
        accounts: &[AccountId],
        range: DateRange,
    ) -> Result<Vec<LedgerTransaction>, StoreError> {
        if accounts.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {TXN_COLUMNS} FROM transactions WHERE aggregator_transaction_id IS NULL AND date >= "
        ));
        qb.push_bind(range.start.to_string());
        qb.push(" AND date <= ");
        qb.push_bind(range.end.to_string());
        qb.push(" AND account_id IN (");
        let mut separated = qb.separated(", ");
        for account in accounts {
            separated.push_bind(account.0);
        }
        separated.push_unseparated(") ORDER BY date, id");

        let rows: Vec<TxnRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_transaction).collect()
    }

    async fn get_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<LedgerTransaction>, StoreError> {
        let row = sqlx::query_as::<_, TxnRow>(&format!(
            "SELECT {TXN_COLUMNS} FROM transactions WHERE id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_transaction).transpose()
    }

    async fn insert_transaction(&self, tx: &NewTransaction) -> Result<TransactionId, StoreError> {
        let result = sqlx::query_as::<_, (i64,)>(
            r#"
            INSERT INTO transactions (
                account_id, category_id, description, amount_cents, date, is_confirmed,
                aggregator_transaction_id, aggregator_authorized_date, aggregator_posted_date,
                aggregator_merchant_name
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(tx.account_id.0)
        .bind(tx.category_id.map(|c| c.0))
        .bind(tx.description.as_str())
        .bind(tx.amount.to_cents())
        .bind(tx.date.to_string())
        .bind(tx.is_confirmed)
        .bind(tx.link.transaction_id.as_deref())
        .bind(tx.link.authorized_date.map(|d| d.to_string()))
        .bind(tx.link.posted_date.map(|d| d.to_string()))
        .bind(tx.link.merchant_name.as_deref())
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok((id,)) => Ok(TransactionId(id)),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateLink(
                tx.link.transaction_id.clone().unwrap_or_default(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn upgrade_transaction(
        &self,
        id: TransactionId,
        update: &LinkedUpdate,
    ) -> Result<(), StoreError> {
        let result = bind_linked_update(sqlx::query(UPGRADE_SQL), update)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map(|r| r.rows_affected());

        match result {
            Ok(0) => match self.get_transaction(id).await? {
                Some(_) => Err(StoreError::AlreadyLinked(id)),
                None => Err(StoreError::NotFound(id)),
            },
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateLink(
                update.link.transaction_id.clone().unwrap_or_default(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_by_aggregator_id(
        &self,
        aggregator_id: &str,
        update: &LinkedUpdate,
    ) -> Result<bool, StoreError> {
        let result = bind_linked_update(sqlx::query(UPDATE_LINKED_SQL), update)
            .bind(aggregator_id)
            .execute(&self.pool)
            .await;

        match result {
            Ok(r) => Ok(r.rows_affected() > 0),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateLink(
                update.link.transaction_id.clone().unwrap_or_default(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_by_aggregator_id(&self, aggregator_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM transactions WHERE aggregator_transaction_id = ?")
            .bind(aggregator_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn categorization_rules(&self) -> Result<Vec<CategorizationRule>, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT pattern, category_id FROM categorization_rules ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(pattern, category_id)| CategorizationRule {
                pattern,
                category_id: CategoryId(category_id),
            })
            .collect())
    }

    async fn upsert_rule(&self, rule: &CategorizationRule) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO categorization_rules (pattern, category_id) VALUES (?, ?)
            ON CONFLICT (pattern) DO UPDATE SET category_id = excluded.category_id
            "#,
        )
        .bind(rule.pattern.as_str())
        .bind(rule.category_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_category(
        &self,
        id: TransactionId,
        category: CategoryId,
        confirmed: bool,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE transactions SET category_id = ?, is_confirmed = ? WHERE id = ?")
                .bind(category.0)
                .bind(confirmed)
                .bind(id.0)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn persist(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn vacuum(&self) -> Result<(), StoreError> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CursorStore for SqliteLedger {
    async fn get_cursor(&self, connection: &ConnectionId) -> Result<Option<SyncCursor>, StoreError> {
        let row = sqlx::query_as::<_, (String, String)>(
            "SELECT cursor, last_synced_at FROM sync_cursors WHERE connection_id = ?",
        )
        .bind(connection.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(cursor, synced)| {
            let last_synced_at = DateTime::parse_from_rfc3339(&synced)
                .map_err(|_| StoreError::Corrupt(format!("bad last_synced_at '{synced}'")))?
                .with_timezone(&Utc);
            Ok(SyncCursor {
                connection_id: connection.clone(),
                cursor,
                last_synced_at,
            })
        })
        .transpose()
    }

    async fn set_cursor(
        &self,
        connection: &ConnectionId,
        cursor: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (connection_id, cursor, last_synced_at) VALUES (?, ?, ?)
            ON CONFLICT (connection_id) DO UPDATE SET
                cursor = excluded.cursor,
                last_synced_at = excluded.last_synced_at
            "#,
        )
        .bind(connection.as_str())
        .bind(cursor)
        .bind(synced_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

const UPGRADE_SQL: &str = r#"
    UPDATE transactions SET
        description = ?, amount_cents = ?, date = ?,
        aggregator_transaction_id = ?, aggregator_authorized_date = ?,
        aggregator_posted_date = ?, aggregator_merchant_name = ?
    WHERE id = ? AND aggregator_transaction_id IS NULL
"#;

const UPDATE_LINKED_SQL: &str = r#"
    UPDATE transactions SET
        description = ?, amount_cents = ?, date = ?,
        aggregator_transaction_id = ?, aggregator_authorized_date = ?,
        aggregator_posted_date = ?, aggregator_merchant_name = ?
    WHERE aggregator_transaction_id = ?
"#;

/// Binds the SET parameters shared by [`UPGRADE_SQL`] and [`UPDATE_LINKED_SQL`].
fn bind_linked_update<'q>(query: SqliteQuery<'q>, update: &'q LinkedUpdate) -> SqliteQuery<'q> {
    query
        .bind(update.description.as_str())
        .bind(update.amount.to_cents())
        .bind(update.date.to_string())
        .bind(update.link.transaction_id.as_deref())
        .bind(update.link.authorized_date.map(|d| d.to_string()))
        .bind(update.link.posted_date.map(|d| d.to_string()))
        .bind(update.link.merchant_name.as_deref())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn parse_optional_date(value: Option<String>) -> Result<Option<NaiveDate>, StoreError> {
    value
        .map(|s| parse_date(&s).map_err(|e| StoreError::Corrupt(e.to_string())))
        .transpose()
}

fn parse_created_at(value: &str) -> Result<DateTime<Utc>, StoreError> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc())
        .or_else(|_| DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc)))
        .map_err(|_| StoreError::Corrupt(format!("bad created_at '{value}'")))
}

fn row_to_transaction(r: TxnRow) -> Result<LedgerTransaction, StoreError> {
    Ok(LedgerTransaction {
        id: TransactionId(r.0),
        account_id: AccountId(r.1),
        category_id: r.2.map(CategoryId),
        description: r.3,
        amount: Money::from_cents(r.4),
        date: parse_date(&r.5).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        excluded: r.6 != 0,
        is_confirmed: r.7 != 0,
        created_at: parse_created_at(&r.8)?,
        link: AggregatorLink {
            transaction_id: r.9,
            authorized_date: parse_optional_date(r.10)?,
            posted_date: parse_optional_date(r.11)?,
            merchant_name: r.12,
        },
    })
}
