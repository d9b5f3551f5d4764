//! Rule book: compiled rules indexed by source chat.
//!
//! Rules are compiled when loaded. A spec with a malformed pattern is
//! rejected on its own and reported back to the caller; the remaining
//! specs load normally.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{ConfigError, DatabaseError};
use crate::rules::matcher::{Route, select_routes};
use crate::rules::model::{Rule, RuleSpec};
use crate::store::Database;
use crate::types::ChatId;

/// Key prefix of persisted rule specs: `rule/<source>/<rule-id>`.
const RULE_PREFIX: &str = "rule/";

/// Read-mostly source of forwarding rules.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// All rules (active or not) configured for a source chat, in order.
    async fn rules_for(&self, source: ChatId) -> Result<Vec<Arc<Rule>>, DatabaseError>;

    /// Destinations that should receive `text` from `source`.
    async fn destinations_for(&self, source: ChatId, text: &str) -> Result<Vec<Route>, DatabaseError> {
        let rules = self.rules_for(source).await?;
        Ok(select_routes(&rules, text))
    }
}

/// In-memory rule store built from specs.
pub struct RuleBook {
    rules: RwLock<HashMap<ChatId, Vec<Arc<Rule>>>>,
    specs: RwLock<Vec<RuleSpec>>,
}

impl RuleBook {
    /// An empty rule book.
    pub fn empty() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            specs: RwLock::new(Vec::new()),
        }
    }

    /// Compile specs into a rule book. Returns the rejected specs' errors.
    pub fn from_specs(specs: Vec<RuleSpec>) -> (Self, Vec<ConfigError>) {
        let (specs, rules, errors) = compile_all(specs);
        let book = Self {
            rules: RwLock::new(rules),
            specs: RwLock::new(specs),
        };
        (book, errors)
    }

    /// Load specs from a JSON file containing an array of rule specs.
    pub async fn load_json(path: &Path) -> Result<(Self, Vec<ConfigError>), ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let specs: Vec<RuleSpec> = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), count = specs.len(), "Loaded rule file");
        Ok(Self::from_specs(specs))
    }

    /// Load every spec persisted under `rule/`.
    pub async fn load_from_db(
        db: &dyn Database,
    ) -> Result<(Self, Vec<ConfigError>), DatabaseError> {
        let entries = db.scan_prefix(RULE_PREFIX.as_bytes()).await?;
        let mut specs = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_slice::<RuleSpec>(&entry.value) {
                Ok(spec) => specs.push(spec),
                Err(e) => warn!(
                    key = %String::from_utf8_lossy(&entry.key),
                    error = %e,
                    "Skipping unreadable persisted rule"
                ),
            }
        }
        Ok(Self::from_specs(specs))
    }

    /// Persist the current specs under `rule/<source>/<id>`, replacing old ones.
    pub async fn persist(&self, db: &dyn Database) -> Result<usize, DatabaseError> {
        for stale in db.scan_prefix(RULE_PREFIX.as_bytes()).await? {
            db.delete(&stale.key).await?;
        }

        let specs = self.specs.read().await;
        for spec in specs.iter() {
            let key = format!("{RULE_PREFIX}{}/{}", spec.source, spec.id);
            let value = serde_json::to_vec(spec)?;
            db.set(key.as_bytes(), &value, None).await?;
        }
        info!(count = specs.len(), "Persisted rule specs");
        Ok(specs.len())
    }

    /// Swap in a new set of specs. Returns the rejected specs' errors.
    pub async fn reload(&self, specs: Vec<RuleSpec>) -> Vec<ConfigError> {
        let (specs, rules, errors) = compile_all(specs);
        *self.rules.write().await = rules;
        *self.specs.write().await = specs;
        errors
    }

    /// Number of successfully compiled rules.
    pub async fn len(&self) -> usize {
        self.rules.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Source chats that have at least one rule.
    pub async fn sources(&self) -> Vec<ChatId> {
        let mut sources: Vec<ChatId> = self.rules.read().await.keys().copied().collect();
        sources.sort_unstable();
        sources
    }
}

#[async_trait]
impl RuleStore for RuleBook {
    async fn rules_for(&self, source: ChatId) -> Result<Vec<Arc<Rule>>, DatabaseError> {
        Ok(self
            .rules
            .read()
            .await
            .get(&source)
            .cloned()
            .unwrap_or_default())
    }
}

/// Compile specs, assigning ids to anonymous ones.
///
/// Returns the accepted specs, the compiled rules per source and the errors.
fn compile_all(
    specs: Vec<RuleSpec>,
) -> (Vec<RuleSpec>, HashMap<ChatId, Vec<Arc<Rule>>>, Vec<ConfigError>) {
    let mut accepted = Vec::with_capacity(specs.len());
    let mut rules: HashMap<ChatId, Vec<Arc<Rule>>> = HashMap::new();
    let mut errors = Vec::new();

    for (index, mut spec) in specs.into_iter().enumerate() {
        if spec.id.is_empty() {
            spec.id = format!("{}-{index}", spec.source);
        }
        match Rule::compile(&spec) {
            Ok(rule) => {
                rules.entry(spec.source).or_default().push(Arc::new(rule));
                accepted.push(spec);
            }
            Err(e) => {
                warn!(rule = %spec.id, source = spec.source, error = %e, "Rejecting invalid rule");
                errors.push(e);
            }
        }
    }

    (accepted, rules, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::Destination;
    use crate::store::LibSqlBackend;

    #[tokio::test]
    async fn invalid_rule_does_not_block_others() {
        let (book, errors) = RuleBook::from_specs(vec![
            RuleSpec::new("good", 1).include("#ARK").to(Destination::new(10)),
            RuleSpec::new("bad", 1).include("(oops"),
            RuleSpec::new("other", 2).to(Destination::new(20)),
        ]);
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], ConfigError::InvalidPattern { rule, .. } if rule == "bad"));

        let rules = book.rules_for(1).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "good");
        assert_eq!(book.len().await, 2);
        assert_eq!(book.sources().await, vec![1, 2]);
        assert!(book.rules_for(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn destinations_for_applies_matching() {
        let (book, _) = RuleBook::from_specs(vec![
            RuleSpec::new("ark", 1).include("#ARK").to(Destination::new(10)),
            RuleSpec::new("all", 1).to(Destination::new(20)),
        ]);
        let routes = book.destinations_for(1, "#ARK news").await.unwrap();
        assert_eq!(routes.len(), 2);
        let routes = book.destinations_for(1, "plain").await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].destination.chat, 20);
    }

    #[tokio::test]
    async fn anonymous_rules_get_ids() {
        let mut spec = RuleSpec::new("", 7);
        spec.id.clear();
        let (book, errors) = RuleBook::from_specs(vec![spec]);
        assert!(errors.is_empty());
        assert_eq!(book.rules_for(7).await.unwrap()[0].id, "7-0");
    }

    #[tokio::test]
    async fn reload_replaces_rules() {
        let (book, _) = RuleBook::from_specs(vec![RuleSpec::new("a", 1)]);
        let errors = book
            .reload(vec![RuleSpec::new("b", 2), RuleSpec::new("c", 2).exclude("[")])
            .await;
        assert_eq!(errors.len(), 1);
        assert!(book.rules_for(1).await.unwrap().is_empty());
        assert_eq!(book.rules_for(2).await.unwrap()[0].id, "b");
    }

    #[tokio::test]
    async fn load_json_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rules.json");
        std::fs::write(
            &path,
            r##"[
                {"id": "ark", "source": -1001, "include": "#ARK",
                 "destinations": [{"chat": -2001, "indelible": true}]},
                {"id": "broken", "source": -1001, "include": "(("}
            ]"##,
        )
        .unwrap();

        let (book, errors) = RuleBook::load_json(&path).await.unwrap();
        assert_eq!(errors.len(), 1);
        let rules = book.rules_for(-1001).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].destinations[0].indelible);
    }

    #[tokio::test]
    async fn load_json_rejects_malformed_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rules.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            RuleBook::load_json(&path).await,
            Err(ConfigError::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn persist_and_load_from_db() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let (book, _) = RuleBook::from_specs(vec![
            RuleSpec::new("a", 1).include("#x").to(Destination::new(10).copy_once()),
            RuleSpec::new("b", 2).to(Destination::new(20)),
        ]);
        assert_eq!(book.persist(&db).await.unwrap(), 2);

        let (loaded, errors) = RuleBook::load_from_db(&db).await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(loaded.len().await, 2);
        let rules = loaded.rules_for(1).await.unwrap();
        assert!(rules[0].destinations[0].copy_once);

        // Persisting a smaller set drops stale specs.
        book.reload(vec![RuleSpec::new("b", 2)]).await;
        assert_eq!(book.persist(&db).await.unwrap(), 1);
        let (loaded, _) = RuleBook::load_from_db(&db).await.unwrap();
        assert!(loaded.rules_for(1).await.unwrap().is_empty());
    }
}
