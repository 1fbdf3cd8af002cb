use crate::types::NormalizedItem;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

/// Keeps the items whose dedup key is neither stored already nor repeated
/// earlier in the same batch. Order is preserved.
pub fn filter_new(feed_id: Uuid, items: Vec<NormalizedItem>, existing: &HashSet<String>) -> Vec<NormalizedItem> {
    let total = items.len();
    let mut seen = HashSet::new();

    let fresh: Vec<NormalizedItem> = items
        .into_iter()
        .filter(|item| {
            let key = item.dedup_key.as_str();
            if existing.contains(key) {
                return false;
            }
            if !seen.insert(key.to_string()) {
                debug!("Dropping repeated {} key within feed {}: {}", item.dedup_key.source(), feed_id, key);
                return false;
            }
            true
        })
        .collect();

    debug!("Feed {}: {} of {} items are new", feed_id, fresh.len(), total);
    fresh
}

/// Identity for items that carry neither a guid nor a link.
pub fn content_hash(
    title: Option<&str>,
    description: Option<&str>,
    content: Option<&str>,
    published: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    for part in [title, description, content, published] {
        hasher.update(part.unwrap_or("").as_bytes());
        // Unit separator keeps ("ab", "") distinct from ("a", "b").
        hasher.update([0x1f]);
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
