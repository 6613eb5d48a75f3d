use super::types::{validate_rule, Rule};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Authoritative rule catalog: mutex-guarded map plus a full JSON snapshot
/// rewritten after every successful mutation. The engine evaluates readings
/// under the same mutex, which serialises its state updates against
/// management traffic.
#[derive(Debug)]
pub struct RuleStore {
    path: PathBuf,
    rules: Mutex<HashMap<String, Rule>>,
}

impl RuleStore {
    /// Load the snapshot. A missing file is created empty; an empty or
    /// unreadable file comes up as an empty rule set with a warning. Startup
    /// never fails on the snapshot.
    pub fn load(path: &Path) -> Self {
        let rules = match std::fs::read_to_string(path) {
            Ok(raw) if raw.trim().is_empty() => HashMap::new(),
            Ok(raw) => match serde_json::from_str::<HashMap<String, Rule>>(&raw) {
                Ok(mut rules) => {
                    let now = Instant::now();
                    for rule in rules.values_mut() {
                        rule.reset_state(now);
                    }
                    tracing::info!(count = rules.len(), path = %path.display(), "loaded rule snapshot");
                    rules
                }
                Err(err) => {
                    tracing::warn!(error = %err, path = %path.display(), "unreadable rule snapshot; starting empty");
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if let Err(err) = std::fs::write(path, b"{}") {
                    tracing::warn!(error = %err, path = %path.display(), "failed to create rule snapshot");
                }
                HashMap::new()
            }
            Err(err) => {
                tracing::warn!(error = %err, path = %path.display(), "failed to read rule snapshot; starting empty");
                HashMap::new()
            }
        };

        Self {
            path: path.to_path_buf(),
            rules: Mutex::new(rules),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, HashMap<String, Rule>> {
        self.rules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new rule. A duplicate id is rejected and the store is left
    /// unchanged.
    pub fn create(&self, mut rule: Rule) -> Result<()> {
        validate_rule(&rule).map_err(|err| anyhow!(err))?;
        let mut rules = self.lock();
        if rules.contains_key(&rule.id) {
            return Err(anyhow!("rule {} already exists", rule.id));
        }
        rule.reset_state(Instant::now());
        rules.insert(rule.id.clone(), rule);
        self.persist(&rules)
    }

    /// Replace a rule wholesale, resetting its engine state; a missing id is
    /// created.
    pub fn update(&self, mut rule: Rule) -> Result<()> {
        validate_rule(&rule).map_err(|err| anyhow!(err))?;
        let mut rules = self.lock();
        rule.reset_state(Instant::now());
        rules.insert(rule.id.clone(), rule);
        self.persist(&rules)
    }

    pub fn delete(&self, rule_id: &str) -> Result<bool> {
        let mut rules = self.lock();
        if rules.remove(rule_id).is_none() {
            return Ok(false);
        }
        self.persist(&rules)?;
        Ok(true)
    }

    /// Snapshot of the current set, sorted by id for stable output.
    pub fn list(&self) -> Vec<Rule> {
        let rules = self.lock();
        let mut out: Vec<Rule> = rules.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn save(&self) -> Result<()> {
        let rules = self.lock();
        self.persist(&rules)
    }

    fn persist(&self, rules: &HashMap<String, Rule>) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(rules).context("encode rule snapshot")?;
        std::fs::write(&self.path, encoded)
            .with_context(|| format!("write {}", self.path.display()))
    }
}
