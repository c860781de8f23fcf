//! Wire form of queue entries.
//!
//! Pending requests live in lists keyed `{priority}:{identifier}`; each list
//! element is a JSON-serialized [`ChainRequest`].

use crate::chain::ChainRequest;
use crate::error::AdmissionError;

/// Build the queue key for a priority tier and identifier.
pub fn queue_key(priority: i64, identifier: &str) -> String {
    format!("{priority}:{identifier}")
}

/// Split a queue key into its priority tier and identifier.
///
/// The identifier is everything after the first `:`.
pub fn parse_queue_key(key: &str) -> Option<(i64, &str)> {
    let (priority, identifier) = key.split_once(':')?;
    let priority = priority.parse().ok()?;
    if identifier.is_empty() {
        return None;
    }
    Some((priority, identifier))
}

/// Glob matching every list in a priority tier.
pub fn tier_pattern(priority: i64) -> String {
    format!("{priority}:*")
}

/// An entry popped from the remote queue.
#[derive(Debug, Clone, PartialEq)]
pub struct DequeuedTask {
    pub priority: i64,
    /// Full list key the payload was popped from.
    pub key: String,
    pub identifier: String,
    /// Raw serialized payload, kept so the entry can be pushed back.
    pub payload: String,
}

impl DequeuedTask {
    /// Parse the payload. The key's identifier applies unless the payload
    /// carries its own override.
    pub fn request(&self) -> Result<ChainRequest, AdmissionError> {
        let mut request = parse_request(&self.payload)?;
        if request.id.is_none() {
            request.id = Some(self.identifier.clone());
        }
        Ok(request)
    }
}

/// Parse a serialized chain request.
pub fn parse_request(payload: &str) -> Result<ChainRequest, AdmissionError> {
    let request: ChainRequest = serde_json::from_str(payload)
        .map_err(|e| AdmissionError::InvalidPayload(e.to_string()))?;
    if request.template_name.trim().is_empty() {
        return Err(AdmissionError::InvalidPayload(
            "task_template_name is empty".to_string(),
        ));
    }
    Ok(request)
}
