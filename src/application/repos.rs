//! Engagement store interface consumed by the feed service.

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::pagination::SortOrder;
use crate::domain::entities::{
    Comment, ContentItem, CountDelta, LikeChange, NewComment, NewItem, UserId,
};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("engagement store unavailable: {0}")]
    Unavailable(String),
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// Which published items a query selects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemFilter {
    /// Items carrying any of these tags; empty means no tag restriction.
    pub tags: Vec<String>,
    /// Case-insensitive substring of title or content.
    pub search: Option<String>,
    /// Only items created at or after this instant.
    pub created_after: Option<OffsetDateTime>,
}

impl ItemFilter {
    pub fn matches(&self, item: &ContentItem) -> bool {
        if !item.published {
            return false;
        }
        if !self.tags.is_empty() && !item.tags.iter().any(|tag| self.tags.contains(tag)) {
            return false;
        }
        if let Some(search) = self.search.as_deref() {
            let needle = search.to_lowercase();
            if !item.title.to_lowercase().contains(&needle)
                && !item.content.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        if let Some(after) = self.created_after
            && item.created_at < after
        {
            return false;
        }
        true
    }
}

/// Column a store can order by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortField {
    CreatedAt,
    LikeCount,
    CommentCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemSort {
    pub field: SortField,
    pub order: SortOrder,
}

impl Default for ItemSort {
    fn default() -> Self {
        Self {
            field: SortField::CreatedAt,
            order: SortOrder::Desc,
        }
    }
}

/// Offset window into an ordered result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub offset: u64,
    pub limit: u32,
}

/// Durable storage for items, likes and comments.
///
/// Implementations own the counters on [`ContentItem`]; every method that
/// changes them bumps `updated_at`.
#[async_trait]
pub trait EngagementStore: Send + Sync {
    async fn create_item(&self, item: NewItem) -> Result<ContentItem, RepoError>;

    async fn get_item(&self, id: Uuid) -> Result<Option<ContentItem>, RepoError>;

    /// Apply `delta` to the counters, saturating at zero, and return the item.
    async fn update_counts(&self, id: Uuid, delta: CountDelta) -> Result<ContentItem, RepoError>;

    /// Published items matching `filter`, ordered by `sort` with newest-first
    /// as the tie breaker.
    async fn query_items(
        &self,
        filter: &ItemFilter,
        sort: ItemSort,
        page: PageWindow,
    ) -> Result<Vec<ContentItem>, RepoError>;

    async fn count_items(&self, filter: &ItemFilter) -> Result<u64, RepoError>;

    /// Published items created within `window` of `now`, newest first.
    async fn list_recent(
        &self,
        window: time::Duration,
        now: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<ContentItem>, RepoError>;

    /// Subset of `ids` liked by `user`.
    async fn liked_item_ids(&self, user: UserId, ids: &[Uuid]) -> Result<Vec<Uuid>, RepoError>;

    /// Create the like row if absent, delete it otherwise, and move
    /// `like_count` by the rows actually changed in the same atomic step.
    /// Returns the item as it stands after the toggle.
    async fn toggle_like(
        &self,
        id: Uuid,
        user: UserId,
    ) -> Result<(LikeChange, ContentItem), RepoError>;

    async fn add_comment(&self, comment: NewComment) -> Result<Comment, RepoError>;

    /// Comments on an item, newest first.
    async fn list_comments(&self, post_id: Uuid) -> Result<Vec<Comment>, RepoError>;

    /// Unique tags across published items, sorted.
    async fn list_tags(&self) -> Result<Vec<String>, RepoError>;

    /// Remove an item with its likes and comments, returning the removed item.
    async fn delete_item(&self, id: Uuid) -> Result<Option<ContentItem>, RepoError>;
}
