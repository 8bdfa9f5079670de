//! Write-driven cache invalidation.
//!
//! Each write kind maps to the key families (and exact keys) whose cached
//! results it can change. Plans are applied synchronously on the write path;
//! failures are reported but never undo the write.

use std::fmt;

use tracing::{info, warn};
use uuid::Uuid;

use super::keys::{CacheKey, KeyFamily};
use super::query_cache::QueryCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    PostCreated,
    LikeToggled,
    CommentAdded,
    PostDeleted,
}

impl WriteKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PostCreated => "post_created",
            Self::LikeToggled => "like_toggled",
            Self::CommentAdded => "comment_added",
            Self::PostDeleted => "post_deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationPlan {
    pub write: WriteKind,
    /// Families dropped wholesale.
    pub families: Vec<KeyFamily>,
    /// Individual keys dropped outside those families.
    pub keys: Vec<CacheKey>,
}

impl InvalidationPlan {
    pub fn for_write(write: WriteKind, item_id: Uuid) -> Self {
        // Every write moves counts or membership, so listings and rankings
        // are always stale afterwards.
        let families = vec![KeyFamily::Posts, KeyFamily::Trending];
        let keys = match write {
            WriteKind::PostCreated => vec![CacheKey::all_tags()],
            WriteKind::LikeToggled => Vec::new(),
            WriteKind::CommentAdded => vec![CacheKey::comments(item_id)],
            WriteKind::PostDeleted => vec![CacheKey::all_tags(), CacheKey::comments(item_id)],
        };
        Self {
            write,
            families,
            keys,
        }
    }

    /// Whether applying this plan drops `key`.
    pub fn covers(&self, key: &CacheKey) -> bool {
        self.families.contains(&key.family()) || self.keys.contains(key)
    }
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let families: Vec<&str> = self.families.iter().map(|family| family.prefix()).collect();
        let keys: Vec<&str> = self.keys.iter().map(CacheKey::as_str).collect();
        write!(
            f,
            "InvalidationPlan {{ write: {}, prefixes: {:?}, keys: {:?} }}",
            self.write.as_str(),
            families,
            keys
        )
    }
}

/// What happened when a plan was applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationOutcome {
    pub removed: u64,
    pub failures: usize,
}

impl InvalidationOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures == 0
    }
}

impl QueryCache {
    /// Apply the invalidation plan for a write that has already committed.
    pub async fn invalidate_on_write(&self, write: WriteKind, item_id: Uuid) -> InvalidationOutcome {
        let plan = InvalidationPlan::for_write(write, item_id);
        let mut outcome = InvalidationOutcome::default();
        if !self.is_enabled() {
            return outcome;
        }

        for family in &plan.families {
            match self.invalidate_prefix(family.prefix()).await {
                Ok(removed) => outcome.removed += removed,
                Err(err) => {
                    outcome.failures += 1;
                    warn!(
                        write = write.as_str(),
                        %item_id,
                        prefix = family.prefix(),
                        error = %err,
                        "Cache invalidation failed after write"
                    );
                }
            }
        }

        for key in &plan.keys {
            match self.invalidate_key(key).await {
                Ok(removed) => outcome.removed += u64::from(removed),
                Err(err) => {
                    outcome.failures += 1;
                    warn!(
                        write = write.as_str(),
                        %item_id,
                        key = %key,
                        error = %err,
                        "Cache invalidation failed after write"
                    );
                }
            }
        }

        info!(
            plan = %plan,
            removed = outcome.removed,
            failures = outcome.failures,
            "Cache invalidated for write"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use crate::application::pagination::{FeedParams, TrendingParams};
    use crate::cache::config::CacheConfig;

    use super::*;

    #[test]
    fn plans_cover_the_affected_families() {
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let listing = CacheKey::post_list(&FeedParams::default(), Some(3));
        let trending = CacheKey::trending(&TrendingParams::default());

        let created = InvalidationPlan::for_write(WriteKind::PostCreated, id);
        assert!(created.covers(&listing));
        assert!(created.covers(&trending));
        assert!(created.covers(&CacheKey::all_tags()));
        assert!(!created.covers(&CacheKey::comments(id)));

        let liked = InvalidationPlan::for_write(WriteKind::LikeToggled, id);
        assert!(liked.covers(&listing));
        assert!(liked.covers(&trending));
        assert!(!liked.covers(&CacheKey::all_tags()));

        let commented = InvalidationPlan::for_write(WriteKind::CommentAdded, id);
        assert!(commented.covers(&CacheKey::comments(id)));
        assert!(!commented.covers(&CacheKey::comments(other)));
        assert!(!commented.covers(&CacheKey::all_tags()));

        let deleted = InvalidationPlan::for_write(WriteKind::PostDeleted, id);
        assert!(deleted.covers(&CacheKey::all_tags()));
        assert!(deleted.covers(&CacheKey::comments(id)));
        assert!(deleted.covers(&listing));
    }

    #[tokio::test]
    async fn comment_write_drops_listings_and_that_comment_list_only() {
        let cache = QueryCache::in_memory(CacheConfig::default());
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let listing = CacheKey::post_list(&FeedParams::default(), None);

        cache.put(&listing, &vec![1]).await;
        cache.put(&CacheKey::comments(id), &vec![2]).await;
        cache.put(&CacheKey::comments(other), &vec![3]).await;
        cache.put(&CacheKey::all_tags(), &vec![4]).await;

        let outcome = cache.invalidate_on_write(WriteKind::CommentAdded, id).await;
        assert!(outcome.is_complete());
        assert_eq!(outcome.removed, 2, "the listing and that comment list");

        assert_eq!(cache.get::<Vec<u8>>(&listing).await, None);
        assert_eq!(cache.get::<Vec<u8>>(&CacheKey::comments(id)).await, None);
        assert_eq!(
            cache.get::<Vec<u8>>(&CacheKey::comments(other)).await,
            Some(vec![3])
        );
        assert_eq!(cache.get::<Vec<u8>>(&CacheKey::all_tags()).await, Some(vec![4]));
    }

    #[tokio::test]
    async fn absent_keys_do_not_count_as_removed() {
        let cache = QueryCache::in_memory(CacheConfig::default());
        let outcome = cache
            .invalidate_on_write(WriteKind::PostDeleted, Uuid::new_v4())
            .await;
        assert!(outcome.is_complete());
        assert_eq!(outcome.removed, 0);
    }

    #[test]
    fn display_lists_prefixes_and_keys() {
        let plan = InvalidationPlan::for_write(WriteKind::PostCreated, Uuid::nil());
        let rendered = plan.to_string();
        assert!(rendered.contains("post_created"));
        assert!(rendered.contains("posts:"));
        assert!(rendered.contains("tags:all"));
    }
}
