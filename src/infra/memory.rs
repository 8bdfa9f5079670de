//! In-process engagement store used when no database is configured, and by tests.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::pagination::SortOrder;
use crate::application::repos::{
    EngagementStore, ItemFilter, ItemSort, PageWindow, RepoError, SortField,
};
use crate::domain::entities::{
    Comment, ContentItem, CountDelta, LikeChange, NewComment, NewItem, UserId,
};
use crate::util::lock::{rw_read, rw_write};

const SOURCE: &str = "infra::memory";

#[derive(Default)]
struct State {
    items: HashMap<Uuid, ContentItem>,
    likes: HashSet<(Uuid, UserId)>,
    /// Insertion order; listed newest first.
    comments: Vec<Comment>,
}

#[derive(Default)]
pub struct InMemoryEngagementStore {
    state: RwLock<State>,
}

impl InMemoryEngagementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully formed item, e.g. to seed fixtures with past timestamps.
    pub fn insert(&self, item: ContentItem) {
        rw_write(&self.state, SOURCE, "insert")
            .items
            .insert(item.id, item);
    }
}

fn compare(a: &ContentItem, b: &ContentItem, sort: ItemSort) -> Ordering {
    let primary = match sort.field {
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::LikeCount => a.like_count.cmp(&b.like_count),
        SortField::CommentCount => a.comment_count.cmp(&b.comment_count),
    };
    let primary = match sort.order {
        SortOrder::Asc => primary,
        SortOrder::Desc => primary.reverse(),
    };
    primary
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl EngagementStore for InMemoryEngagementStore {
    async fn create_item(&self, item: NewItem) -> Result<ContentItem, RepoError> {
        let now = OffsetDateTime::now_utc();
        let created = ContentItem {
            id: Uuid::new_v4(),
            title: item.title,
            content: item.content,
            tags: item.tags,
            media_url: item.media_url,
            author_id: item.author_id,
            like_count: 0,
            comment_count: 0,
            published: true,
            created_at: now,
            updated_at: now,
        };
        rw_write(&self.state, SOURCE, "create_item")
            .items
            .insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<ContentItem>, RepoError> {
        Ok(rw_read(&self.state, SOURCE, "get_item")
            .items
            .get(&id)
            .cloned())
    }

    async fn update_counts(&self, id: Uuid, delta: CountDelta) -> Result<ContentItem, RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "update_counts");
        let item = state.items.get_mut(&id).ok_or(RepoError::NotFound)?;
        item.like_count = CountDelta::apply(item.like_count, delta.likes);
        item.comment_count = CountDelta::apply(item.comment_count, delta.comments);
        item.updated_at = OffsetDateTime::now_utc().max(item.created_at);
        Ok(item.clone())
    }

    async fn query_items(
        &self,
        filter: &ItemFilter,
        sort: ItemSort,
        page: PageWindow,
    ) -> Result<Vec<ContentItem>, RepoError> {
        let state = rw_read(&self.state, SOURCE, "query_items");
        let mut matching: Vec<&ContentItem> = state
            .items
            .values()
            .filter(|item| filter.matches(item))
            .collect();
        matching.sort_by(|a, b| compare(a, b, sort));

        let offset = usize::try_from(page.offset).unwrap_or(usize::MAX);
        Ok(matching
            .into_iter()
            .skip(offset)
            .take(page.limit as usize)
            .cloned()
            .collect())
    }

    async fn count_items(&self, filter: &ItemFilter) -> Result<u64, RepoError> {
        let state = rw_read(&self.state, SOURCE, "count_items");
        Ok(state.items.values().filter(|item| filter.matches(item)).count() as u64)
    }

    async fn list_recent(
        &self,
        window: time::Duration,
        now: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<ContentItem>, RepoError> {
        let filter = ItemFilter {
            created_after: Some(now - window),
            ..ItemFilter::default()
        };
        let page = PageWindow { offset: 0, limit };
        self.query_items(&filter, ItemSort::default(), page).await
    }

    async fn liked_item_ids(&self, user: UserId, ids: &[Uuid]) -> Result<Vec<Uuid>, RepoError> {
        let state = rw_read(&self.state, SOURCE, "liked_item_ids");
        Ok(ids
            .iter()
            .copied()
            .filter(|id| state.likes.contains(&(*id, user)))
            .collect())
    }

    async fn toggle_like(
        &self,
        id: Uuid,
        user: UserId,
    ) -> Result<(LikeChange, ContentItem), RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "toggle_like");
        if !state.items.contains_key(&id) {
            return Err(RepoError::NotFound);
        }
        let change = if state.likes.remove(&(id, user)) {
            LikeChange::Unliked
        } else {
            state.likes.insert((id, user));
            LikeChange::Liked
        };

        let item = state.items.get_mut(&id).ok_or(RepoError::NotFound)?;
        item.like_count = CountDelta::apply(item.like_count, change.delta().likes);
        item.updated_at = OffsetDateTime::now_utc().max(item.created_at);
        Ok((change, item.clone()))
    }

    async fn add_comment(&self, comment: NewComment) -> Result<Comment, RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "add_comment");
        if !state.items.contains_key(&comment.post_id) {
            return Err(RepoError::NotFound);
        }
        let stored = Comment {
            id: Uuid::new_v4(),
            post_id: comment.post_id,
            author_id: comment.author_id,
            content: comment.content,
            created_at: OffsetDateTime::now_utc(),
        };
        state.comments.push(stored.clone());
        Ok(stored)
    }

    async fn list_comments(&self, post_id: Uuid) -> Result<Vec<Comment>, RepoError> {
        let state = rw_read(&self.state, SOURCE, "list_comments");
        let mut comments: Vec<Comment> = state
            .comments
            .iter()
            .rev()
            .filter(|comment| comment.post_id == post_id)
            .cloned()
            .collect();
        comments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(comments)
    }

    async fn list_tags(&self) -> Result<Vec<String>, RepoError> {
        let state = rw_read(&self.state, SOURCE, "list_tags");
        let tags: BTreeSet<&String> = state
            .items
            .values()
            .filter(|item| item.published)
            .flat_map(|item| item.tags.iter())
            .collect();
        Ok(tags.into_iter().cloned().collect())
    }

    async fn delete_item(&self, id: Uuid) -> Result<Option<ContentItem>, RepoError> {
        let mut state = rw_write(&self.state, SOURCE, "delete_item");
        let removed = state.items.remove(&id);
        if removed.is_some() {
            state.likes.retain(|(item_id, _)| *item_id != id);
            state.comments.retain(|comment| comment.post_id != id);
        }
        Ok(removed)
    }
}
