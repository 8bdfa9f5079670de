//! Feed service: ranked reads through the query cache and the write path that
//! keeps cache and connected clients consistent with the engagement store.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::application::pagination::{
    FeedParams, FeedSort, Paged, Pagination, PaginationError, SortOrder, TrendingParams,
};
use crate::application::repos::{
    EngagementStore, ItemFilter, ItemSort, PageWindow, RepoError, SortField,
};
use crate::broadcast::{Broadcaster, EventKind};
use crate::cache::{CacheKey, InvalidationOutcome, QueryCache, WriteKind};
use crate::domain::entities::{
    CommentView, ContentItem, CountDelta, NewComment, NewItem, UserId,
};
use crate::domain::error::DomainError;
use crate::domain::heat::{HeatScorer, Scored};

/// Upper bound on items scored for one heat-ranked request.
const TRENDING_CANDIDATE_LIMIT: u32 = 500;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    InvalidQuery(#[from] PaginationError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("content item `{0}` not found")]
    NotFound(Uuid),
    #[error("user {user} may not modify content item `{id}`")]
    Forbidden { id: Uuid, user: UserId },
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// One item as listed to a particular user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEntry {
    #[serde(flatten)]
    pub item: ContentItem,
    /// Whether the requesting user likes this item.
    pub liked: bool,
    /// Present when the listing was ranked by heat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heat: Option<u8>,
}

#[derive(Clone)]
pub struct FeedService {
    store: Arc<dyn EngagementStore>,
    cache: QueryCache,
    broadcaster: Arc<Broadcaster>,
    scorer: HeatScorer,
}

impl FeedService {
    pub fn new(
        store: Arc<dyn EngagementStore>,
        cache: QueryCache,
        broadcaster: Arc<Broadcaster>,
        scorer: HeatScorer,
    ) -> Self {
        Self {
            store,
            cache,
            broadcaster,
            scorer,
        }
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// One page of the feed as seen by `user`.
    #[instrument(skip(self, params))]
    pub async fn ranked_feed(
        &self,
        params: &FeedParams,
        user: Option<UserId>,
    ) -> Result<Paged<FeedEntry>, FeedError> {
        let key = CacheKey::post_list(params, user);
        self.cache
            .get_or_load(&key, || self.load_feed(params, user))
            .await
    }

    async fn load_feed(
        &self,
        params: &FeedParams,
        user: Option<UserId>,
    ) -> Result<Paged<FeedEntry>, FeedError> {
        let filter = ItemFilter {
            tags: params.tags.clone(),
            search: params.search.clone(),
            created_after: None,
        };

        let (items, heats, total) = match params.sort {
            FeedSort::Trending => {
                let candidates = self
                    .store
                    .query_items(
                        &filter,
                        ItemSort::default(),
                        PageWindow {
                            offset: 0,
                            limit: TRENDING_CANDIDATE_LIMIT,
                        },
                    )
                    .await?;
                let total = candidates.len() as u64;

                let mut ranked = self.scorer.rank(candidates, OffsetDateTime::now_utc());
                if params.order == SortOrder::Asc {
                    ranked.reverse();
                }
                let (items, heats): (Vec<_>, Vec<_>) = ranked
                    .into_iter()
                    .skip(usize::try_from(params.offset()).unwrap_or(usize::MAX))
                    .take(params.limit as usize)
                    .map(|scored| (scored.item, Some(scored.heat)))
                    .unzip();
                (items, heats, total)
            }
            sort => {
                let field = match sort {
                    FeedSort::LikeCount => SortField::LikeCount,
                    FeedSort::CommentCount => SortField::CommentCount,
                    FeedSort::CreatedAt | FeedSort::Trending => SortField::CreatedAt,
                };
                let sort = ItemSort {
                    field,
                    order: params.order,
                };
                let window = PageWindow {
                    offset: params.offset(),
                    limit: params.limit,
                };
                let items = self.store.query_items(&filter, sort, window).await?;
                let total = self.store.count_items(&filter).await?;
                let heats = vec![None; items.len()];
                (items, heats, total)
            }
        };

        let liked: HashSet<Uuid> = match user {
            Some(user) if !items.is_empty() => {
                let ids: Vec<Uuid> = items.iter().map(|item| item.id).collect();
                self.store
                    .liked_item_ids(user, &ids)
                    .await?
                    .into_iter()
                    .collect()
            }
            _ => HashSet::new(),
        };

        let entries = items
            .into_iter()
            .zip(heats)
            .map(|(item, heat)| FeedEntry {
                liked: liked.contains(&item.id),
                item,
                heat,
            })
            .collect();

        Ok(Paged {
            items: entries,
            pagination: Pagination::new(total, params.page, params.limit),
        })
    }

    /// Hottest recent items within the requested window.
    #[instrument(skip(self))]
    pub async fn trending(
        &self,
        params: TrendingParams,
    ) -> Result<Vec<Scored<ContentItem>>, FeedError> {
        let key = CacheKey::trending(&params);
        self.cache
            .get_or_load(&key, || async {
                let now = OffsetDateTime::now_utc();
                let recent = self
                    .store
                    .list_recent(params.window.duration(), now, TRENDING_CANDIDATE_LIMIT)
                    .await?;
                let mut ranked = self.scorer.rank(recent, now);
                ranked.truncate(params.limit as usize);
                Ok::<_, FeedError>(ranked)
            })
            .await
    }

    pub async fn tags(&self) -> Result<Vec<String>, FeedError> {
        self.cache
            .get_or_load(&CacheKey::all_tags(), || async {
                Ok::<_, FeedError>(self.store.list_tags().await?)
            })
            .await
    }

    pub async fn comments(&self, post_id: Uuid) -> Result<Vec<CommentView>, FeedError> {
        self.cache
            .get_or_load(&CacheKey::comments(post_id), || async {
                self.require_item(post_id).await?;
                let comments = self.store.list_comments(post_id).await?;
                Ok::<_, FeedError>(comments.into_iter().map(CommentView::from).collect())
            })
            .await
    }

    #[instrument(skip(self, new))]
    pub async fn create_post(&self, author: UserId, new: NewItem) -> Result<FeedEntry, FeedError> {
        let new = NewItem {
            author_id: author,
            ..new
        }
        .normalize()?;
        let item = self.store.create_item(new).await?;
        self.after_write(WriteKind::PostCreated, EventKind::Created, &item)
            .await;
        Ok(FeedEntry {
            item,
            liked: false,
            heat: None,
        })
    }

    /// Like the item if `user` has not liked it yet, unlike it otherwise.
    #[instrument(skip(self))]
    pub async fn toggle_like(&self, id: Uuid, user: UserId) -> Result<FeedEntry, FeedError> {
        self.require_item(id).await?;
        let (change, item) = self.store.toggle_like(id, user).await?;
        self.after_write(WriteKind::LikeToggled, EventKind::Updated, &item)
            .await;
        Ok(FeedEntry {
            item,
            liked: change.is_liked(),
            heat: None,
        })
    }

    #[instrument(skip(self, content))]
    pub async fn add_comment(
        &self,
        post_id: Uuid,
        author: UserId,
        content: &str,
    ) -> Result<CommentView, FeedError> {
        let comment = NewComment::new(post_id, author, content)?;
        self.require_item(post_id).await?;
        let comment = self.store.add_comment(comment).await?;
        let item = self
            .store
            .update_counts(post_id, CountDelta::comments(1))
            .await?;
        self.after_write(WriteKind::CommentAdded, EventKind::Updated, &item)
            .await;
        Ok(CommentView::from(comment))
    }

    /// Delete an item. Only its author may do so.
    #[instrument(skip(self))]
    pub async fn delete_post(&self, id: Uuid, user: UserId) -> Result<ContentItem, FeedError> {
        let item = self.require_item(id).await?;
        if item.author_id != user {
            return Err(FeedError::Forbidden { id, user });
        }
        let removed = self
            .store
            .delete_item(id)
            .await?
            .ok_or(FeedError::NotFound(id))?;
        self.after_write(WriteKind::PostDeleted, EventKind::Deleted, &removed)
            .await;
        Ok(removed)
    }

    /// Drop every cached result a committed write may have changed.
    pub async fn invalidate_on_write(
        &self,
        write: WriteKind,
        item: &ContentItem,
    ) -> InvalidationOutcome {
        self.cache.invalidate_on_write(write, item.id).await
    }

    async fn after_write(&self, write: WriteKind, kind: EventKind, item: &ContentItem) {
        self.invalidate_on_write(write, item).await;
        if let Err(err) = self.broadcaster.broadcast(kind, item.clone()) {
            warn!(
                write = write.as_str(),
                item_id = %item.id,
                error = %err,
                "Broadcast failed after write"
            );
        }
    }

    async fn require_item(&self, id: Uuid) -> Result<ContentItem, FeedError> {
        self.store
            .get_item(id)
            .await?
            .filter(|item| item.published)
            .ok_or(FeedError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use time::Duration;
    use tokio::sync::oneshot;

    use super::*;
    use crate::application::pagination::RawFeedQuery;
    use crate::broadcast::{BroadcastConfig, QueueSink, ServerMessage};
    use crate::cache::CacheConfig;
    use crate::domain::entities::{Comment, LikeChange};
    use crate::infra::memory::InMemoryEngagementStore;

    /// Parks the next `query_items` call after it has read the store.
    struct Hold {
        reached: oneshot::Sender<()>,
        release: oneshot::Receiver<()>,
    }

    /// Store wrapper that counts list queries, can be switched off and can
    /// hold one listing read in flight.
    struct ObservedStore {
        inner: InMemoryEngagementStore,
        queries: AtomicUsize,
        down: AtomicBool,
        hold: Mutex<Option<Hold>>,
    }

    impl ObservedStore {
        fn new() -> Self {
            Self {
                inner: InMemoryEngagementStore::new(),
                queries: AtomicUsize::new(0),
                down: AtomicBool::new(false),
                hold: Mutex::new(None),
            }
        }

        /// Arm a hold; returns the "read done" signal and the release switch.
        fn hold_next_query(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
            let (reached, reached_rx) = oneshot::channel();
            let (release_tx, release) = oneshot::channel();
            *self.hold.lock().expect("hold lock") = Some(Hold { reached, release });
            (reached_rx, release_tx)
        }

        fn check(&self) -> Result<(), RepoError> {
            if self.down.load(Ordering::SeqCst) {
                Err(RepoError::Unavailable("store offline".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl EngagementStore for ObservedStore {
        async fn create_item(&self, item: NewItem) -> Result<ContentItem, RepoError> {
            self.check()?;
            self.inner.create_item(item).await
        }

        async fn get_item(&self, id: Uuid) -> Result<Option<ContentItem>, RepoError> {
            self.check()?;
            self.inner.get_item(id).await
        }

        async fn update_counts(
            &self,
            id: Uuid,
            delta: CountDelta,
        ) -> Result<ContentItem, RepoError> {
            self.check()?;
            self.inner.update_counts(id, delta).await
        }

        async fn query_items(
            &self,
            filter: &ItemFilter,
            sort: ItemSort,
            page: PageWindow,
        ) -> Result<Vec<ContentItem>, RepoError> {
            self.check()?;
            self.queries.fetch_add(1, Ordering::SeqCst);
            let items = self.inner.query_items(filter, sort, page).await;
            let hold = self.hold.lock().expect("hold lock").take();
            if let Some(hold) = hold {
                let _ = hold.reached.send(());
                let _ = hold.release.await;
            }
            items
        }

        async fn count_items(&self, filter: &ItemFilter) -> Result<u64, RepoError> {
            self.check()?;
            self.inner.count_items(filter).await
        }

        async fn list_recent(
            &self,
            window: Duration,
            now: OffsetDateTime,
            limit: u32,
        ) -> Result<Vec<ContentItem>, RepoError> {
            self.check()?;
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.inner.list_recent(window, now, limit).await
        }

        async fn liked_item_ids(
            &self,
            user: UserId,
            ids: &[Uuid],
        ) -> Result<Vec<Uuid>, RepoError> {
            self.check()?;
            self.inner.liked_item_ids(user, ids).await
        }

        async fn toggle_like(
            &self,
            id: Uuid,
            user: UserId,
        ) -> Result<(LikeChange, ContentItem), RepoError> {
            self.check()?;
            self.inner.toggle_like(id, user).await
        }

        async fn add_comment(&self, comment: NewComment) -> Result<Comment, RepoError> {
            self.check()?;
            self.inner.add_comment(comment).await
        }

        async fn list_comments(&self, post_id: Uuid) -> Result<Vec<Comment>, RepoError> {
            self.check()?;
            self.inner.list_comments(post_id).await
        }

        async fn list_tags(&self) -> Result<Vec<String>, RepoError> {
            self.check()?;
            self.inner.list_tags().await
        }

        async fn delete_item(&self, id: Uuid) -> Result<Option<ContentItem>, RepoError> {
            self.check()?;
            self.inner.delete_item(id).await
        }
    }

    fn service() -> (FeedService, Arc<ObservedStore>) {
        let store = Arc::new(ObservedStore::new());
        let service = FeedService::new(
            store.clone(),
            QueryCache::in_memory(CacheConfig::default()),
            Arc::new(Broadcaster::new(BroadcastConfig::default())),
            HeatScorer::default(),
        );
        (service, store)
    }

    fn new_item(title: &str, tags: &[&str]) -> NewItem {
        NewItem {
            title: title.into(),
            content: format!("{title} body"),
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            media_url: None,
            author_id: 0,
        }
    }

    #[tokio::test]
    async fn create_invalidates_listing_so_next_read_includes_the_item() {
        let (service, store) = service();
        let params = FeedParams::default();

        let empty = service.ranked_feed(&params, None).await.expect("feed");
        assert!(empty.items.is_empty());
        service.ranked_feed(&params, None).await.expect("cached feed");
        assert_eq!(store.queries.load(Ordering::SeqCst), 1);

        let created = service
            .create_post(7, new_item("first", &["rust"]))
            .await
            .expect("create");

        let page = service.ranked_feed(&params, None).await.expect("feed");
        assert_eq!(store.queries.load(Ordering::SeqCst), 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].item.id, created.item.id);
        assert_eq!(page.pagination.total, 1);
    }

    #[tokio::test]
    async fn listing_read_before_a_create_is_not_cached_past_its_invalidation() {
        let (service, store) = service();
        let params = FeedParams::default();

        let (reached, release) = store.hold_next_query();
        let reader = tokio::spawn({
            let service = service.clone();
            let params = params.clone();
            async move { service.ranked_feed(&params, None).await }
        });

        // The reader has seen the empty store and is parked before caching.
        reached.await.expect("listing read started");
        let created = service
            .create_post(7, new_item("raced", &[]))
            .await
            .expect("create");
        release.send(()).expect("reader still parked");

        let stale = reader.await.expect("reader task").expect("feed");
        assert!(stale.items.is_empty(), "the parked read predates the write");

        let page = service.ranked_feed(&params, None).await.expect("feed");
        let ids: Vec<Uuid> = page.items.iter().map(|entry| entry.item.id).collect();
        assert_eq!(ids, vec![created.item.id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_likes_count_each_user_once() {
        let (service, _store) = service();
        let id = service
            .create_post(1, new_item("popular", &[]))
            .await
            .expect("create")
            .item
            .id;

        let tasks: Vec<_> = (100..120)
            .map(|user| {
                let service = service.clone();
                tokio::spawn(async move { service.toggle_like(id, user).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.expect("task").expect("like").liked);
        }

        let page = service
            .ranked_feed(&FeedParams::default(), None)
            .await
            .expect("feed");
        assert_eq!(page.items[0].item.like_count, 20);
    }

    #[tokio::test]
    async fn toggle_like_flips_state_and_counts() {
        let (service, _store) = service();
        let created = service
            .create_post(1, new_item("post", &[]))
            .await
            .expect("create");
        let id = created.item.id;

        let liked = service.toggle_like(id, 5).await.expect("like");
        assert!(liked.liked);
        assert_eq!(liked.item.like_count, 1);

        let page = service
            .ranked_feed(&FeedParams::default(), Some(5))
            .await
            .expect("feed");
        assert!(page.items[0].liked);

        let unliked = service.toggle_like(id, 5).await.expect("unlike");
        assert!(!unliked.liked);
        assert_eq!(unliked.item.like_count, 0);

        let page = service
            .ranked_feed(&FeedParams::default(), Some(5))
            .await
            .expect("feed");
        assert!(!page.items[0].liked, "stale cached listing was served");
    }

    #[tokio::test]
    async fn comments_are_cached_and_refreshed_after_a_new_comment() {
        let (service, _store) = service();
        let id = service
            .create_post(1, new_item("post", &[]))
            .await
            .expect("create")
            .item
            .id;

        assert!(service.comments(id).await.expect("comments").is_empty());
        let view = service
            .add_comment(id, 21, "  first!  ")
            .await
            .expect("comment");
        assert_eq!(view.content, "first!");
        assert_eq!(view.author.anonymous_name, "Anonymous Fox");

        let comments = service.comments(id).await.expect("comments");
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].id, view.id);
    }

    #[tokio::test]
    async fn writes_are_validated_and_target_existing_items() {
        let (service, _store) = service();
        let missing = Uuid::new_v4();

        assert!(matches!(
            service.create_post(1, new_item("   ", &[])).await,
            Err(FeedError::Domain(DomainError::Validation { .. }))
        ));
        assert!(matches!(
            service.toggle_like(missing, 1).await,
            Err(FeedError::NotFound(id)) if id == missing
        ));
        assert!(matches!(
            service.add_comment(missing, 1, "hello").await,
            Err(FeedError::NotFound(_))
        ));
        assert!(matches!(
            service.comments(missing).await,
            Err(FeedError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn only_the_author_may_delete() {
        let (service, _store) = service();
        let id = service
            .create_post(1, new_item("mine", &["a"]))
            .await
            .expect("create")
            .item
            .id;

        assert!(matches!(
            service.delete_post(id, 2).await,
            Err(FeedError::Forbidden { user: 2, .. })
        ));
        let removed = service.delete_post(id, 1).await.expect("delete");
        assert_eq!(removed.id, id);
        assert!(service.tags().await.expect("tags").is_empty());
    }

    #[tokio::test]
    async fn writes_broadcast_after_commit_in_order() {
        let (service, _store) = service();
        let (sink, mut rx) = QueueSink::channel(32);
        service
            .broadcaster()
            .on_connect(Arc::new(sink))
            .expect("connect");
        rx.try_recv().expect("welcome");

        let id = service
            .create_post(3, new_item("live", &[]))
            .await
            .expect("create")
            .item
            .id;
        service.toggle_like(id, 4).await.expect("like");
        service.delete_post(id, 3).await.expect("delete");

        let mut kinds = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let message: ServerMessage = serde_json::from_str(&frame).expect("frame");
            kinds.push(message.kind());
        }
        assert_eq!(kinds, vec!["created", "updated", "deleted"]);
    }

    #[tokio::test]
    async fn trending_sort_ranks_by_heat() {
        let (service, _store) = service();
        let cold = service
            .create_post(1, new_item("cold", &[]))
            .await
            .expect("create")
            .item
            .id;
        let hot = service
            .create_post(1, new_item("hot", &[]))
            .await
            .expect("create")
            .item
            .id;
        for user in 10..20 {
            service.toggle_like(hot, user).await.expect("like");
        }

        let raw = RawFeedQuery {
            sort_by: Some("trending".into()),
            ..Default::default()
        };
        let params = FeedParams::from_query(&raw).expect("params");
        let page = service.ranked_feed(&params, None).await.expect("feed");

        let ids: Vec<Uuid> = page.items.iter().map(|entry| entry.item.id).collect();
        assert_eq!(ids, vec![hot, cold]);
        assert!(page.items[0].heat > page.items[1].heat);

        let trending = service
            .trending(TrendingParams::default())
            .await
            .expect("trending");
        assert_eq!(trending[0].item.id, hot);
    }

    #[tokio::test]
    async fn store_outage_surfaces_as_retryable_error() {
        let (service, store) = service();
        store.down.store(true, Ordering::SeqCst);

        let err = service
            .ranked_feed(&FeedParams::default(), None)
            .await
            .expect_err("store is down");
        assert!(matches!(err, FeedError::Repo(ref repo) if repo.is_retryable()));
    }
}
