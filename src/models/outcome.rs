//! Result of a multi-key delete.

use serde::Serialize;
use std::collections::HashSet;

/// A key the store refused to delete, with the store's reason.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KeyDeleteFailure {
    pub key: String,
    pub code: String,
    pub message: String,
}

/// Per-key accounting of a `remove_keys` call.
///
/// Every requested key lands in exactly one of the two lists, except when
/// the whole request failed outright; then nothing is presumed deleted and
/// every key is listed as failed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BulkDeleteOutcome {
    pub succeeded_keys: Vec<String>,
    pub failed_keys: Vec<KeyDeleteFailure>,
}

impl BulkDeleteOutcome {
    /// Build an outcome from the requested keys and the store's failure
    /// list. Failures for keys that were never requested are ignored.
    pub fn from_failures(requested: &[String], failures: Vec<KeyDeleteFailure>) -> Self {
        let requested_set: HashSet<&str> = requested.iter().map(String::as_str).collect();
        let mut seen = HashSet::new();
        let failed_keys: Vec<KeyDeleteFailure> = failures
            .into_iter()
            .filter(|f| requested_set.contains(f.key.as_str()) && seen.insert(f.key.clone()))
            .collect();
        let succeeded_keys = requested
            .iter()
            .filter(|k| !seen.contains(k.as_str()))
            .cloned()
            .collect();
        Self {
            succeeded_keys,
            failed_keys,
        }
    }

    /// Every key failed with the same cause.
    pub fn all_failed(requested: &[String], code: &str, message: &str) -> Self {
        Self {
            succeeded_keys: Vec::new(),
            failed_keys: requested
                .iter()
                .map(|key| KeyDeleteFailure {
                    key: key.clone(),
                    code: code.to_string(),
                    message: message.to_string(),
                })
                .collect(),
        }
    }

    pub fn merge(&mut self, other: BulkDeleteOutcome) {
        self.succeeded_keys.extend(other.succeeded_keys);
        self.failed_keys.extend(other.failed_keys);
    }

    pub fn is_complete(&self) -> bool {
        self.failed_keys.is_empty()
    }

    pub fn failed_key_names(&self) -> Vec<&str> {
        self.failed_keys.iter().map(|f| f.key.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn every_key_accounted_for_once() {
        let requested = keys(&["a", "b", "c", "d"]);
        let failures = vec![
            KeyDeleteFailure {
                key: "b".into(),
                code: "AccessDenied".into(),
                message: "denied".into(),
            },
            KeyDeleteFailure {
                key: "b".into(),
                code: "AccessDenied".into(),
                message: "denied twice".into(),
            },
            KeyDeleteFailure {
                key: "zzz".into(),
                code: "InternalError".into(),
                message: "not requested".into(),
            },
        ];
        let outcome = BulkDeleteOutcome::from_failures(&requested, failures);
        assert_eq!(outcome.succeeded_keys, keys(&["a", "c", "d"]));
        assert_eq!(outcome.failed_key_names(), vec!["b"]);
        assert!(!outcome.is_complete());
    }

    #[test]
    fn total_failure_marks_everything_failed() {
        let requested = keys(&["x", "y"]);
        let outcome = BulkDeleteOutcome::all_failed(&requested, "Throttled", "slow down");
        assert!(outcome.succeeded_keys.is_empty());
        assert_eq!(outcome.failed_key_names(), vec!["x", "y"]);
    }
}
