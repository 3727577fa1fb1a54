//! Business/pattern-learning collaborator: does this input shape correlate
//! with past failures for this tool and agent? A lightweight in-memory
//! correlation table rather than a real model — the spec treats ML as an
//! optional, separately-gated stage (§4.5 step 7).

use crate::tool::canonical_json;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Default)]
struct ShapeStats {
    successes: u32,
    failures: u32,
    dominant_failure_mode: Option<String>,
}

/// Keyed by (tool, agent, shape-fingerprint) where the fingerprint is the
/// canonical-JSON form of the input with scalar values erased, so inputs
/// that only differ by value (not shape) still correlate.
pub struct PatternLearner {
    stats: Mutex<HashMap<(String, String, String), ShapeStats>>,
}

impl Default for PatternLearner {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternLearner {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(HashMap::new()),
        }
    }

    fn shape_fingerprint(input: &Value) -> String {
        canonical_json(&erase_scalars(input))
    }

    pub fn record_outcome(
        &self,
        tool: &str,
        agent_id: &str,
        input: &Value,
        success: bool,
        failure_mode: Option<&str>,
    ) {
        let key = (
            tool.to_string(),
            agent_id.to_string(),
            Self::shape_fingerprint(input),
        );
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry(key).or_default();
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
            if let Some(mode) = failure_mode {
                entry.dominant_failure_mode = Some(mode.to_string());
            }
        }
    }

    /// Returns `(failure_rate, dominant_failure_mode)` for this shape if
    /// there's enough history to say anything (at least 3 observations).
    pub fn correlate(&self, tool: &str, agent_id: &str, input: &Value) -> Option<(f64, String)> {
        let key = (
            tool.to_string(),
            agent_id.to_string(),
            Self::shape_fingerprint(input),
        );
        let stats = self.stats.lock().unwrap();
        let entry = stats.get(&key)?;
        let total = entry.successes + entry.failures;
        if total < 3 {
            return None;
        }
        let rate = entry.failures as f64 / total as f64;
        entry
            .dominant_failure_mode
            .clone()
            .map(|mode| (rate, mode))
    }

    pub fn error_rate_for(&self, tool: &str, agent_id: &str, input: &Value) -> f64 {
        let key = (
            tool.to_string(),
            agent_id.to_string(),
            Self::shape_fingerprint(input),
        );
        let stats = self.stats.lock().unwrap();
        match stats.get(&key) {
            Some(entry) => {
                let total = entry.successes + entry.failures;
                if total == 0 {
                    0.0
                } else {
                    entry.failures as f64 / total as f64
                }
            }
            None => 0.0,
        }
    }
}

fn erase_scalars(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), erase_scalars(v)))
                .collect(),
        ),
        Value::Array(arr) => {
            if let Some(first) = arr.first() {
                Value::Array(vec![erase_scalars(first)])
            } else {
                Value::Array(vec![])
            }
        }
        Value::String(_) => Value::String("str".into()),
        Value::Number(_) => Value::String("num".into()),
        Value::Bool(_) => Value::String("bool".into()),
        Value::Null => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn correlate_requires_minimum_history() {
        let learner = PatternLearner::new();
        let input = json!({"path": "a"});
        learner.record_outcome("read_file", "agent-1", &input, false, Some("not_found"));
        assert!(learner.correlate("read_file", "agent-1", &input).is_none());
    }

    #[test]
    fn correlate_reports_dominant_failure_mode_after_enough_history() {
        let learner = PatternLearner::new();
        let input = json!({"path": "a"});
        for _ in 0..4 {
            learner.record_outcome("read_file", "agent-1", &input, false, Some("not_found"));
        }
        let (rate, mode) = learner.correlate("read_file", "agent-1", &input).unwrap();
        assert!(rate > 0.9);
        assert_eq!(mode, "not_found");
    }

    #[test]
    fn shape_fingerprint_ignores_scalar_values() {
        let learner = PatternLearner::new();
        for _ in 0..4 {
            learner.record_outcome(
                "read_file",
                "agent-1",
                &json!({"path": "first"}),
                false,
                Some("not_found"),
            );
        }
        assert!(learner
            .correlate("read_file", "agent-1", &json!({"path": "second"}))
            .is_some());
    }
}
