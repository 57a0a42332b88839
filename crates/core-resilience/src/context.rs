//! Operation context carried through retries into dead-letter records

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identity and caller-supplied labels for one guarded operation
///
/// An operation has no identity of its own; the context gives it a generated
/// ID for the lifetime of one `execute` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationContext {
    pub operation_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl OperationContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            operation_id: Uuid::new_v4().to_string(),
            name: name.into(),
            labels: BTreeMap::new(),
        }
    }

    /// Attach a label, e.g. the downstream region or a request key
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new("operation")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = OperationContext::new("upload");
        let b = OperationContext::new("upload");
        assert_ne!(a.operation_id, b.operation_id);
        assert_eq!(a.name, "upload");
    }

    #[test]
    fn test_labels() {
        let ctx = OperationContext::new("publish")
            .with_label("topic", "events")
            .with_label("region", "us-central1");

        assert_eq!(ctx.labels.len(), 2);
        assert_eq!(ctx.labels.get("topic").map(String::as_str), Some("events"));
    }
}
