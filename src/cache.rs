use crate::models::LeadFilter;
use chrono::Utc;
use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Checksummed cache entry.
///
/// Cached rows are stored as JSON with a SHA-256 checksum computed at insert
/// time and verified on every read; a mismatch is treated as a miss and the
/// result is recomputed from the database.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheEntry {
    pub data: String,
    pub checksum: String,
}

impl CacheEntry {
    pub fn new(data: String) -> Self {
        let checksum = Self::compute_checksum(&data);
        Self { data, checksum }
    }

    fn compute_checksum(data: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_valid(&self) -> bool {
        Self::compute_checksum(&self.data) == self.checksum
    }

    pub fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Returns the payload when the entry parses and its checksum matches.
    pub fn deserialize_and_validate(serialized: &str) -> Option<String> {
        let entry: CacheEntry = serde_json::from_str(serialized).ok()?;

        if entry.is_valid() {
            Some(entry.data)
        } else {
            tracing::warn!(
                "Cache validation failed: checksum mismatch, data length {}",
                entry.data.len()
            );
            None
        }
    }
}

// ============ Cache Keys ============

pub fn by_id_key(id: i64) -> String {
    format!("leads_by_id_{}", id)
}

/// Key for a filtered page; every filter parameter participates so distinct
/// filters never collide, with `null` standing in for absent ones.
pub fn filtered_key(filter: &LeadFilter) -> String {
    format!(
        "leads_filtered_{}_{}_{}_{}_{}",
        filter.page,
        filter.limit,
        filter.status.as_deref().unwrap_or("null"),
        filter.email.as_deref().unwrap_or("null"),
        filter.search.as_deref().unwrap_or("null"),
    )
}

pub fn count_key(filter: &LeadFilter) -> String {
    format!(
        "leads_count_filtered_{}_{}_{}",
        filter.status.as_deref().unwrap_or("null"),
        filter.email.as_deref().unwrap_or("null"),
        filter.search.as_deref().unwrap_or("null"),
    )
}

/// Statistics are keyed by calendar day so stale totals expire at midnight
/// even without an explicit write.
pub fn statistics_key() -> String {
    format!("leads_statistics_{}", Utc::now().format("%Y-%m-%d"))
}

// ============ Cache Set ============

/// The lead store's read caches and their invalidation discipline.
///
/// Listings (filtered pages and counts) are wiped wholesale on any write.
/// By-id entries are invalidated per written lead and statistics per day, so
/// an unrelated write never evicts an unrelated lead's cached aggregate.
#[derive(Clone)]
pub struct LeadCaches {
    /// Single-lead aggregates keyed by `leads_by_id_{id}`.
    pub by_id: Cache<String, String>,
    /// Filtered pages and counts; invalidated together on every write.
    pub listings: Cache<String, String>,
    /// Daily statistics keyed by `leads_statistics_{YYYY-MM-DD}`.
    pub statistics: Cache<String, String>,
}

impl LeadCaches {
    pub fn new() -> Self {
        Self {
            by_id: Cache::builder()
                .time_to_live(Duration::from_secs(3600))
                .max_capacity(50_000)
                .build(),
            listings: Cache::builder()
                .time_to_live(Duration::from_secs(600))
                .max_capacity(10_000)
                .build(),
            statistics: Cache::builder()
                .time_to_live(Duration::from_secs(86_400))
                .max_capacity(64)
                .build(),
        }
    }

    /// Reads a typed value through the checksummed entry format.
    pub async fn get_validated<T: DeserializeOwned>(
        cache: &Cache<String, String>,
        key: &str,
    ) -> Option<T> {
        let cached = cache.get(key).await?;
        let data = CacheEntry::deserialize_and_validate(&cached)?;
        serde_json::from_str(&data).ok()
    }

    /// Stores a typed value through the checksummed entry format.
    pub async fn insert_validated<T: Serialize>(
        cache: &Cache<String, String>,
        key: String,
        value: &T,
    ) {
        if let Ok(json) = serde_json::to_string(value) {
            cache.insert(key, CacheEntry::new(json).serialize()).await;
        }
    }

    /// Invalidation after a committed write: all listings, the written lead's
    /// by-id entry, and today's statistics. Other by-id entries survive.
    pub async fn invalidate_after_write(&self, lead_id: i64) {
        self.listings.invalidate_all();
        self.by_id.invalidate(&by_id_key(lead_id)).await;
        self.statistics.invalidate(&statistics_key()).await;
    }
}

impl Default for LeadCaches {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> LeadFilter {
        LeadFilter {
            page: 2,
            limit: 50,
            status: Some("active".to_string()),
            email: None,
            search: Some("smith".to_string()),
        }
    }

    #[test]
    fn keys_are_deterministic_and_parameter_complete() {
        assert_eq!(filtered_key(&filter()), "leads_filtered_2_50_active_null_smith");
        assert_eq!(count_key(&filter()), "leads_count_filtered_active_null_smith");
        assert_eq!(by_id_key(42), "leads_by_id_42");
        assert!(statistics_key().starts_with("leads_statistics_"));
    }

    #[test]
    fn absent_filters_use_null_placeholder() {
        let key = filtered_key(&LeadFilter::default());
        assert_eq!(key, "leads_filtered_1_20_null_null_null");
    }

    #[test]
    fn cache_entry_round_trip() {
        let entry = CacheEntry::new(r#"{"total": 3}"#.to_string());
        assert!(entry.is_valid());

        let restored = CacheEntry::deserialize_and_validate(&entry.serialize());
        assert_eq!(restored.as_deref(), Some(r#"{"total": 3}"#));
    }

    #[test]
    fn tampered_entry_is_rejected() {
        let mut entry = CacheEntry::new("original".to_string());
        entry.data = "tampered".to_string();
        assert!(!entry.is_valid());
        assert_eq!(CacheEntry::deserialize_and_validate(&entry.serialize()), None);
    }

    #[tokio::test]
    async fn write_invalidation_spares_unrelated_by_id_entries() {
        let caches = LeadCaches::new();
        caches.by_id.insert(by_id_key(1), "a".to_string()).await;
        caches.by_id.insert(by_id_key(2), "b".to_string()).await;
        caches
            .listings
            .insert("leads_filtered_1_20_null_null_null".to_string(), "c".to_string())
            .await;

        caches.invalidate_after_write(1).await;
        // moka invalidate_all is eventually consistent; run pending tasks.
        caches.listings.run_pending_tasks().await;

        assert!(caches.by_id.get(&by_id_key(1)).await.is_none());
        assert!(caches.by_id.get(&by_id_key(2)).await.is_some());
        assert!(caches
            .listings
            .get("leads_filtered_1_20_null_null_null")
            .await
            .is_none());
    }
}
