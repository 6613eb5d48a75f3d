use super::store::RuleStore;
use super::types::{compare_f64, compare_str, Action, Condition, Rule};
use crate::commands::CommandRequest;
use crate::sensor::{scalar_to_f64, scalar_to_string, Reading, ReadingValues};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Evaluates every rule against each inbound reading, holding the rule-store
/// mutex for the whole pass. Actions go out over an unbounded channel so the
/// engine never awaits with the lock held.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    store: Arc<RuleStore>,
    commands: mpsc::UnboundedSender<CommandRequest>,
}

impl RuleEngine {
    pub fn new(store: Arc<RuleStore>, commands: mpsc::UnboundedSender<CommandRequest>) -> Self {
        Self { store, commands }
    }

    pub fn evaluate(&self, reading: &Reading, now: Instant) {
        let mut rules = self.store.lock();
        for rule in rules.values_mut() {
            self.evaluate_rule(rule, reading, now);
        }
    }

    fn evaluate_rule(&self, rule: &mut Rule, reading: &Reading, now: Instant) {
        let mut relevant = false;
        let mut verdict = true;

        for condition in &mut rule.condition {
            if !condition.matches(&reading.device_id, &reading.sensor_id) {
                continue;
            }
            relevant = true;
            let satisfied = eval_condition(condition, &reading.values, now);
            verdict = verdict && satisfied;
        }

        // A rule is only reconsidered when a sensor it cares about fires.
        if !relevant {
            return;
        }

        if rule.last_verdict == Some(verdict) {
            return;
        }
        rule.last_verdict = Some(verdict);

        let actions = if verdict { &rule.then } else { &rule.r#else };
        tracing::info!(
            rule = %rule.id,
            verdict,
            actions = actions.len(),
            "rule transition"
        );
        for action in actions {
            self.dispatch(action);
        }
    }

    fn dispatch(&self, action: &Action) {
        let request = CommandRequest {
            device_id: action.device_id.clone(),
            actuator_id: action.actuator_id.clone(),
            value: action.value,
            pulse_seconds: action.pulse_seconds,
            mode: action.mode,
        };
        if self.commands.send(request).is_err() {
            tracing::warn!(
                device = %action.device_id,
                actuator = %action.actuator_id,
                "command dispatcher is gone; dropping action"
            );
        }
    }
}

fn eval_condition(condition: &mut Condition, values: &ReadingValues, now: Instant) -> bool {
    match condition {
        Condition::Limit {
            measure,
            operator,
            threshold,
            hold_seconds,
            last_state,
            state_since,
            ..
        } => {
            let Some(raw) = values.resolve(measure.as_deref()) else {
                tracing::debug!(measure = ?measure, "limit condition found no value in reading");
                return false;
            };
            let Some(predicate) = limit_predicate(raw, *operator, threshold) else {
                tracing::warn!(
                    measure = ?measure,
                    value = %raw,
                    "limit condition value is not comparable; treating as unsatisfied"
                );
                return false;
            };

            if predicate != *last_state {
                *last_state = predicate;
                *state_since = Some(now);
            }

            if *hold_seconds <= 0.0 {
                predicate
            } else {
                let since = *state_since.get_or_insert(now);
                predicate
                    && now.saturating_duration_since(since)
                        >= Duration::from_secs_f64(*hold_seconds)
            }
        }
        Condition::Password { expected, .. } => {
            values.password_input().as_deref() == Some(expected.as_str())
        }
    }
}

fn limit_predicate(
    raw: &JsonValue,
    operator: super::types::CompareOp,
    threshold: &JsonValue,
) -> Option<bool> {
    match threshold {
        JsonValue::String(expected) => {
            let value = scalar_to_string(raw)?;
            Some(compare_str(&value, operator, expected))
        }
        _ => {
            let limit = threshold.as_f64()?;
            let value = scalar_to_f64(raw)?;
            Some(compare_f64(value, operator, limit))
        }
    }
}
