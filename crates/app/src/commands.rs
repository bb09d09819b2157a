use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use penny_core::{CategoryId, ConnectionId, SyncProgress, SyncResult, TransactionId};
use penny_storage::{CursorStore, LedgerStore};
use penny_sync::{
    CategoryRuleEngine, HttpAggregatorFeed, HttpVerificationService, SyncCoordinator,
    VerifierClient,
};
use tokio::task::JoinSet;

use crate::AppContext;

pub async fn sync(ctx: &AppContext, connections: Vec<String>, json: bool) -> Result<()> {
    let feed = HttpAggregatorFeed::new(&ctx.config.aggregator).context("building aggregator client")?;
    let service =
        HttpVerificationService::new(&ctx.config.verifier).context("building verifier client")?;
    let verifier = VerifierClient::from_config(Arc::new(service), &ctx.config.verifier);
    let coordinator = Arc::new(SyncCoordinator::new(
        Arc::new(feed),
        ctx.ledger.clone(),
        ctx.ledger.clone(),
        verifier,
        &ctx.config,
    ));

    let mut tasks = JoinSet::new();
    for connection in connections {
        let coordinator = Arc::clone(&coordinator);
        tasks.spawn(async move {
            let reporter = |c: &ConnectionId, p: SyncProgress| {
                tracing::debug!(connection = %c, stage = %p.stage, progress = ?p.progress, total = ?p.total, "progress");
            };
            coordinator
                .sync(&connection, Some(&reporter))
                .await
                .with_context(|| format!("syncing '{connection}'"))
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        results.push(joined.context("sync task panicked")??);
    }
    results.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        results.iter().for_each(print_result);
    }
    Ok(())
}

fn print_result(result: &SyncResult) {
    println!(
        "{}: {} added, {} upgraded, {} modified, {} removed",
        result.connection_id, result.added, result.upgraded, result.modified, result.removed
    );
    for error in &result.errors {
        println!("  error: {error}");
    }
    if result.requires_reauth {
        println!("  reauthentication required, reconnect this bank before syncing again");
    }
}

pub async fn show_cursor(ctx: &AppContext, connection: &str) -> Result<()> {
    let connection: ConnectionId = connection.parse()?;
    match ctx.ledger.get_cursor(&connection).await? {
        Some(cursor) => println!(
            "{}: {} (last synced {})",
            cursor.connection_id,
            cursor.cursor,
            cursor.last_synced_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => println!("{connection}: never synced"),
    }
    Ok(())
}

pub async fn confirm(ctx: &AppContext, transaction_id: i64, category_id: i64) -> Result<()> {
    let learned = penny_sync::confirm_category(
        ctx.ledger.as_ref(),
        TransactionId(transaction_id),
        CategoryId(category_id),
    )
    .await?;
    match learned {
        Some(rule) => println!(
            "Transaction {transaction_id} confirmed; '{}' now maps to category {}",
            rule.pattern, rule.category_id
        ),
        None => println!("Transaction {transaction_id} confirmed; no merchant pattern to learn"),
    }
    Ok(())
}

pub async fn list_rules(ctx: &AppContext) -> Result<()> {
    let rules = ctx.ledger.categorization_rules().await?;
    if rules.is_empty() {
        println!("No rules.");
    }
    for rule in rules {
        println!("{:<32} {}", rule.pattern, rule.category_id);
    }
    Ok(())
}

pub async fn import_rules(ctx: &AppContext, file: &Path) -> Result<()> {
    let content =
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let engine = CategoryRuleEngine::from_toml(&content)?;
    let count = penny_sync::import_rules(ctx.ledger.as_ref(), &engine).await?;
    println!("Imported {count} rules from {}", file.display());
    Ok(())
}

pub async fn vacuum(ctx: &AppContext) -> Result<()> {
    ctx.ledger.vacuum().await?;
    println!("Ledger vacuumed.");
    Ok(())
}
