//! Post-completion history records.
//!
//! `GET /history/{prompt_id}` answers with `{"<prompt_id>": {"outputs":
//! {"<node_id>": {...}}, "status": {...}}}`. [`ResultRecord`] keeps the
//! per-node outputs in the order the engine reported them.

use serde::Deserialize;

/// Outputs of one finished submission.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub prompt_id: String,
    /// Node ID → that node's output object, in document order.
    pub outputs: serde_json::Map<String, serde_json::Value>,
    /// Engine-reported status string (`success`, `error`), when present.
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    outputs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    status: Option<HistoryStatus>,
}

#[derive(Debug, Deserialize)]
struct HistoryStatus {
    #[serde(default)]
    status_str: Option<String>,
}

impl ResultRecord {
    /// Extract the entry for `prompt_id` from a raw history document.
    ///
    /// Returns `None` when the document has no entry for the prompt (the
    /// engine has not recorded it, or has already evicted it).
    pub fn from_history(prompt_id: &str, mut history: serde_json::Value) -> Option<Self> {
        let entry = history.as_object_mut()?.remove(prompt_id)?;
        let entry: HistoryEntry = match serde_json::from_value(entry) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(prompt_id, error = %e, "History entry has unexpected shape");
                return None;
            }
        };

        Some(Self {
            prompt_id: prompt_id.to_string(),
            outputs: entry.outputs,
            status: entry.status.and_then(|s| s.status_str),
        })
    }

    /// Node IDs that produced any output, in order.
    pub fn output_nodes(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }
}
