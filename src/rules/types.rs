use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "==", alias = "=")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
}

pub fn compare_f64(value: f64, op: CompareOp, threshold: f64) -> bool {
    match op {
        CompareOp::Lt => value < threshold,
        CompareOp::Lte => value <= threshold,
        CompareOp::Gt => value > threshold,
        CompareOp::Gte => value >= threshold,
        CompareOp::Eq => (value - threshold).abs() <= f64::EPSILON,
        CompareOp::Neq => (value - threshold).abs() > f64::EPSILON,
    }
}

pub fn compare_str(value: &str, op: CompareOp, threshold: &str) -> bool {
    match op {
        CompareOp::Lt => value < threshold,
        CompareOp::Lte => value <= threshold,
        CompareOp::Gt => value > threshold,
        CompareOp::Gte => value >= threshold,
        CompareOp::Eq => value == threshold,
        CompareOp::Neq => value != threshold,
    }
}

/// A sub-predicate over one sensor. The `#[serde(skip)]` fields are engine
/// state: never on the wire, never in the snapshot, re-initialised whenever a
/// rule enters the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Limit {
        device_id: String,
        sensor_id: String,
        #[serde(default)]
        measure: Option<String>,
        operator: CompareOp,
        threshold: JsonValue,
        #[serde(default)]
        hold_seconds: f64,
        #[serde(skip)]
        last_state: bool,
        #[serde(skip)]
        state_since: Option<Instant>,
    },
    Password {
        device_id: String,
        sensor_id: String,
        expected: String,
    },
}

impl Condition {
    pub fn matches(&self, device_id: &str, sensor_id: &str) -> bool {
        let (own_device, own_sensor) = match self {
            Condition::Limit {
                device_id,
                sensor_id,
                ..
            }
            | Condition::Password {
                device_id,
                sensor_id,
                ..
            } => (device_id, sensor_id),
        };
        own_device == device_id && own_sensor == sensor_id
    }

    pub fn reset_state(&mut self, now: Instant) {
        if let Condition::Limit {
            last_state,
            state_since,
            ..
        } = self
        {
            *last_state = false;
            *state_since = Some(now);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionMode {
    #[default]
    Set,
    Toggle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub device_id: String,
    pub actuator_id: String,
    pub value: f64,
    #[serde(default)]
    pub pulse_seconds: f64,
    #[serde(default)]
    pub mode: ActionMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    #[serde(alias = "id_regra")]
    pub id: String,
    #[serde(default)]
    pub condition: Vec<Condition>,
    #[serde(default)]
    pub then: Vec<Action>,
    #[serde(default)]
    pub r#else: Vec<Action>,
    #[serde(skip)]
    pub last_verdict: Option<bool>,
}

impl Rule {
    /// Clear all engine state, as a freshly created rule would have it.
    pub fn reset_state(&mut self, now: Instant) {
        self.last_verdict = None;
        for condition in &mut self.condition {
            condition.reset_state(now);
        }
    }
}

pub fn validate_rule(rule: &Rule) -> Result<(), String> {
    if rule.id.trim().is_empty() {
        return Err("rule requires a non-empty id".to_string());
    }

    for condition in &rule.condition {
        if let Condition::Limit {
            threshold,
            hold_seconds,
            ..
        } = condition
        {
            match threshold {
                JsonValue::Number(n) => {
                    if !n.as_f64().is_some_and(f64::is_finite) {
                        return Err("limit.threshold must be finite".to_string());
                    }
                }
                JsonValue::String(_) => {}
                other => {
                    return Err(format!(
                        "limit.threshold must be a number or string, got {other}"
                    ))
                }
            }
            if !hold_seconds.is_finite() || *hold_seconds < 0.0 {
                return Err("limit.hold_seconds must be >= 0".to_string());
            }
        }
    }

    for action in rule.then.iter().chain(rule.r#else.iter()) {
        if action.device_id.trim().is_empty() || action.actuator_id.trim().is_empty() {
            return Err("action requires device_id and actuator_id".to_string());
        }
        if !action.pulse_seconds.is_finite() || action.pulse_seconds < 0.0 {
            return Err("action.pulse_seconds must be >= 0".to_string());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_wire_rule_with_tagged_conditions() {
        let raw = r#"{
            "id": "r-1",
            "condition": [
                {"type":"limit","device_id":"a","sensor_id":"t","measure":"temperature","operator":">","threshold":30,"hold_seconds":5},
                {"type":"password","device_id":"a","sensor_id":"k","expected":"1234"}
            ],
            "then": [{"device_id":"b","actuator_id":"fan","value":1,"pulse_seconds":0}],
            "else": [{"device_id":"b","actuator_id":"fan","value":0,"mode":"toggle"}]
        }"#;
        let rule: Rule = serde_json::from_str(raw).expect("parsed");
        assert_eq!(rule.id, "r-1");
        assert_eq!(rule.condition.len(), 2);
        assert!(matches!(
            rule.condition[0],
            Condition::Limit {
                operator: CompareOp::Gt,
                hold_seconds,
                ..
            } if hold_seconds == 5.0
        ));
        assert_eq!(rule.then.len(), 1);
        assert_eq!(rule.r#else[0].mode, ActionMode::Toggle);
        assert_eq!(rule.last_verdict, None);
    }

    #[test]
    fn accepts_legacy_rule_id_alias() {
        let rule: Rule = serde_json::from_str(r#"{"id_regra":"legacy"}"#).expect("parsed");
        assert_eq!(rule.id, "legacy");
    }

    #[test]
    fn engine_state_stays_off_the_wire() {
        let mut rule: Rule = serde_json::from_str(
            r#"{"id":"r-1","condition":[{"type":"limit","device_id":"a","sensor_id":"t","operator":">=","threshold":1}]}"#,
        )
        .expect("parsed");
        rule.last_verdict = Some(true);
        rule.reset_state(Instant::now());
        if let Condition::Limit { last_state, .. } = &mut rule.condition[0] {
            *last_state = true;
        }

        let serialized = serde_json::to_string(&rule).expect("serialized");
        assert!(!serialized.contains("last_state"));
        assert!(!serialized.contains("state_since"));
        assert!(!serialized.contains("last_verdict"));
    }

    #[test]
    fn compare_covers_every_operator() {
        assert!(compare_f64(1.0, CompareOp::Lt, 2.0));
        assert!(compare_f64(2.0, CompareOp::Lte, 2.0));
        assert!(compare_f64(3.0, CompareOp::Gt, 2.0));
        assert!(compare_f64(2.0, CompareOp::Gte, 2.0));
        assert!(compare_f64(2.0, CompareOp::Eq, 2.0));
        assert!(compare_f64(2.5, CompareOp::Neq, 2.0));
        assert!(compare_str("abc", CompareOp::Eq, "abc"));
        assert!(compare_str("abc", CompareOp::Lt, "abd"));
    }

    #[test]
    fn validate_rejects_bad_shapes() {
        let rule: Rule = serde_json::from_str(r#"{"id":"  "}"#).expect("parsed");
        assert!(validate_rule(&rule).is_err());

        let rule: Rule = serde_json::from_str(
            r#"{"id":"r","condition":[{"type":"limit","device_id":"a","sensor_id":"t","operator":">","threshold":true}]}"#,
        )
        .expect("parsed");
        assert!(validate_rule(&rule).is_err());

        let rule: Rule = serde_json::from_str(
            r#"{"id":"r","then":[{"device_id":"b","actuator_id":"fan","value":1,"pulse_seconds":-2}]}"#,
        )
        .expect("parsed");
        assert!(validate_rule(&rule).is_err());

        let rule: Rule = serde_json::from_str(json!({"id": "ok"}).to_string().as_str()).expect("parsed");
        assert!(validate_rule(&rule).is_ok());
    }
}
