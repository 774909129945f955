//! Sender blocklist — filters noise before it reaches the classifier.
//!
//! Rules are persisted as JSON in the settings table so operators can edit
//! them at runtime; a default set covers the usual automated senders.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::DatabaseError;
use crate::store::RecordStore;

const SETTING_KEY: &str = "sender_blocklist";

/// How a rule matches a sender address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Exact,
    Domain,
    Regex,
}

/// One blocklist rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRule {
    #[serde(rename = "type")]
    pub kind: RuleKind,
    pub value: String,
    #[serde(default)]
    pub label: String,
}

impl BlockRule {
    fn matches(&self, sender: &str) -> bool {
        match self.kind {
            RuleKind::Exact => sender.eq_ignore_ascii_case(&self.value),
            RuleKind::Domain => sender.ends_with(&self.value.to_lowercase()),
            RuleKind::Regex => match regex::RegexBuilder::new(&self.value)
                .case_insensitive(true)
                .build()
            {
                Ok(re) => re.is_match(sender),
                Err(e) => {
                    warn!(pattern = %self.value, "Skipping invalid blocklist regex: {e}");
                    false
                }
            },
        }
    }
}

fn default_rules() -> Vec<BlockRule> {
    let rule = |kind, value: &str, label: &str| BlockRule {
        kind,
        value: value.into(),
        label: label.into(),
    };
    vec![
        rule(RuleKind::Regex, "^noreply@", "noreply addresses"),
        rule(RuleKind::Regex, "^no-reply@", "no-reply addresses"),
        rule(RuleKind::Regex, "^mailer-daemon@", "mailer daemon"),
        rule(RuleKind::Regex, "^postmaster@", "postmaster"),
        rule(RuleKind::Regex, "@newsletter\\.", "newsletter domains"),
    ]
}

/// Store-backed sender filter.
pub struct Blocklist {
    store: Arc<dyn RecordStore>,
}

impl Blocklist {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Load the rule set, seeding defaults on first use.
    pub async fn rules(&self) -> Result<Vec<BlockRule>, DatabaseError> {
        match self.store.get_setting(SETTING_KEY).await? {
            Some(raw) => {
                serde_json::from_str(&raw).map_err(|e| DatabaseError::Serialization(e.to_string()))
            }
            None => {
                let rules = default_rules();
                self.save(&rules).await?;
                Ok(rules)
            }
        }
    }

    pub async fn add_rule(&self, rule: BlockRule) -> Result<Vec<BlockRule>, DatabaseError> {
        let mut rules = self.rules().await?;
        rules.push(rule);
        self.save(&rules).await?;
        Ok(rules)
    }

    /// Remove a rule by position. Returns the remaining rules, or `None`
    /// when the index was out of range.
    pub async fn remove_rule(&self, index: usize) -> Result<Option<Vec<BlockRule>>, DatabaseError> {
        let mut rules = self.rules().await?;
        if index >= rules.len() {
            return Ok(None);
        }
        rules.remove(index);
        self.save(&rules).await?;
        Ok(Some(rules))
    }

    /// Should mail from this sender be archived unprocessed?
    pub async fn should_block(&self, sender: &str) -> Result<bool, DatabaseError> {
        let sender = sender.trim().to_lowercase();
        let rules = self.rules().await?;
        Ok(rules.iter().any(|rule| rule.matches(&sender)))
    }

    async fn save(&self, rules: &[BlockRule]) -> Result<(), DatabaseError> {
        let raw =
            serde_json::to_string(rules).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.store.set_setting(SETTING_KEY, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlStore;

    async fn blocklist() -> Blocklist {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        Blocklist::new(store)
    }

    #[tokio::test]
    async fn defaults_block_automated_senders() {
        let list = blocklist().await;
        assert!(list.should_block("noreply@shop.com").await.unwrap());
        assert!(list.should_block("No-Reply@shop.com").await.unwrap());
        assert!(list.should_block("mailer-daemon@mx.example.com").await.unwrap());
        assert!(!list.should_block("alice@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn exact_and_domain_rules() {
        let list = blocklist().await;
        list.add_rule(BlockRule {
            kind: RuleKind::Exact,
            value: "spammer@bad.com".into(),
            label: "".into(),
        })
        .await
        .unwrap();
        list.add_rule(BlockRule {
            kind: RuleKind::Domain,
            value: "@ads.example.com".into(),
            label: "".into(),
        })
        .await
        .unwrap();

        assert!(list.should_block("SPAMMER@bad.com").await.unwrap());
        assert!(list.should_block("promo@ads.example.com").await.unwrap());
        assert!(!list.should_block("spammer2@bad.com").await.unwrap());
    }

    #[tokio::test]
    async fn invalid_regex_is_skipped_not_fatal() {
        let list = blocklist().await;
        list.add_rule(BlockRule {
            kind: RuleKind::Regex,
            value: "([unclosed".into(),
            label: "broken".into(),
        })
        .await
        .unwrap();
        // Still evaluates the remaining rules without erroring.
        assert!(!list.should_block("alice@example.com").await.unwrap());
        assert!(list.should_block("noreply@x.com").await.unwrap());
    }

    #[tokio::test]
    async fn remove_rule_by_index() {
        let list = blocklist().await;
        let rules = list.rules().await.unwrap();
        let remaining = list.remove_rule(0).await.unwrap().unwrap();
        assert_eq!(remaining.len(), rules.len() - 1);
        assert!(list.remove_rule(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rules_persist_across_instances() {
        let store: Arc<dyn RecordStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let list = Blocklist::new(Arc::clone(&store));
        list.add_rule(BlockRule {
            kind: RuleKind::Exact,
            value: "x@y.com".into(),
            label: "".into(),
        })
        .await
        .unwrap();

        let second = Blocklist::new(store);
        assert!(second.should_block("x@y.com").await.unwrap());
    }
}
