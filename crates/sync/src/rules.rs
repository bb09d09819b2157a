use penny_core::{extract_pattern, CategorizationRule, CategoryId, TransactionId};
use penny_storage::{LedgerStore, StoreError};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Failed to parse rules TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ordered substring rules mapping a merchant token to a category.
pub struct CategoryRuleEngine {
    rules: Vec<CategorizationRule>,
}

#[derive(Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<CategorizationRule>,
}

impl CategoryRuleEngine {
    /// Keeps the given order. Patterns are uppercased and empty ones dropped,
    /// since an empty pattern would match every description.
    pub fn new(rules: Vec<CategorizationRule>) -> Self {
        let rules = rules
            .into_iter()
            .filter_map(|rule| {
                let pattern = rule.pattern.trim().to_uppercase();
                (!pattern.is_empty()).then_some(CategorizationRule {
                    pattern,
                    category_id: rule.category_id,
                })
            })
            .collect();
        Self { rules }
    }

    /// Parses a `[[rules]]` array of `{ pattern, categoryId }` tables.
    pub fn from_toml(toml_content: &str) -> Result<Self, RuleError> {
        let file: RuleFile = toml::from_str(toml_content)?;
        Ok(Self::new(file.rules))
    }

    pub async fn load(store: &dyn LedgerStore) -> Result<Self, StoreError> {
        Ok(Self::new(store.categorization_rules().await?))
    }

    pub fn rules(&self) -> &[CategorizationRule] {
        &self.rules
    }

    pub fn find_matching_rule(&self, description: &str) -> Option<&CategorizationRule> {
        let text = description.to_uppercase();
        self.rules.iter().find(|rule| text.contains(&rule.pattern))
    }

    pub fn categorize(&self, description: &str) -> Option<CategoryId> {
        self.find_matching_rule(description).map(|rule| rule.category_id)
    }
}

/// Records a user's category choice on a transaction and learns a rule from
/// its description. Returns the rule that was upserted, if the description
/// yielded a pattern.
pub async fn confirm_category(
    store: &dyn LedgerStore,
    id: TransactionId,
    category: CategoryId,
) -> Result<Option<CategorizationRule>, StoreError> {
    let tx = store
        .get_transaction(id)
        .await?
        .ok_or(StoreError::NotFound(id))?;
    store.set_category(id, category, true).await?;

    let pattern = extract_pattern(&tx.description);
    if pattern.is_empty() {
        debug!(%id, description = %tx.description, "no merchant pattern, rule not learned");
        return Ok(None);
    }

    let rule = CategorizationRule { pattern, category_id: category };
    store.upsert_rule(&rule).await?;
    debug!(%id, pattern = %rule.pattern, category = %category, "learned categorization rule");
    Ok(Some(rule))
}

/// Upserts every rule in `engine`, returning how many were written.
pub async fn import_rules(
    store: &dyn LedgerStore,
    engine: &CategoryRuleEngine,
) -> Result<usize, StoreError> {
    for rule in engine.rules() {
        store.upsert_rule(rule).await?;
    }
    Ok(engine.rules().len())
}
