//! Priority-tiered dequeue.
//!
//! Tiers are tried in the caller's order and a preferred tier is always
//! drained before a later one, whatever the entries' ages. Within a tier a
//! bounded batch of list keys is scanned and the first successful pop wins.

use super::entry::{self, DequeuedTask};
use crate::error::StoreError;
use crate::store::QueueStore;

/// Pop the first available entry across `priorities`.
///
/// Returns `Ok(None)` when no tier has pending work. A key that fails to pop
/// is skipped; only a failed scan aborts the poll. The pop itself is atomic
/// at the store, so two agents racing on one list never receive the same
/// entry.
pub async fn oldest_task(
    store: &dyn QueueStore,
    priorities: &[i64],
    batch: usize,
) -> Result<Option<DequeuedTask>, StoreError> {
    for &priority in priorities {
        let keys = store
            .scan_keys(&entry::tier_pattern(priority), batch, batch)
            .await?;

        for key in keys {
            let Some((key_priority, identifier)) = entry::parse_queue_key(&key) else {
                tracing::debug!(key = %key, "Skipping malformed queue key");
                continue;
            };
            // A store MATCH may be looser than the key grammar.
            if key_priority != priority {
                continue;
            }
            let identifier = identifier.to_string();

            match store.pop_head(&key).await {
                Ok(Some(payload)) => {
                    return Ok(Some(DequeuedTask {
                        priority,
                        key,
                        identifier,
                        payload,
                    }));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to pop queue entry, skipping key");
                }
            }
        }
    }

    Ok(None)
}
