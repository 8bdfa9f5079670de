use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::repos::{EngagementStore, ItemFilter, ItemSort, PageWindow, RepoError};
use crate::domain::entities::{
    Comment, ContentItem, CountDelta, LikeChange, NewComment, NewItem, UserId,
};

use super::{POST_COLUMNS, PostgresEngagementStore, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct PostRow {
    id: Uuid,
    title: String,
    content: String,
    tags: Vec<String>,
    media_url: Option<String>,
    author_id: i64,
    like_count: i64,
    comment_count: i64,
    published: bool,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PostRow> for ContentItem {
    type Error = RepoError;

    fn try_from(row: PostRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            title: row.title,
            content: row.content,
            tags: row.tags,
            media_url: row.media_url,
            author_id: row.author_id,
            like_count: PostgresEngagementStore::convert_count(row.like_count)?,
            comment_count: PostgresEngagementStore::convert_count(row.comment_count)?,
            published: row.published,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CommentRow {
    id: Uuid,
    post_id: Uuid,
    author_id: i64,
    content: String,
    created_at: OffsetDateTime,
}

impl From<CommentRow> for Comment {
    fn from(row: CommentRow) -> Self {
        Self {
            id: row.id,
            post_id: row.post_id,
            author_id: row.author_id,
            content: row.content,
            created_at: row.created_at,
        }
    }
}

fn into_items(rows: Vec<PostRow>) -> Result<Vec<ContentItem>, RepoError> {
    rows.into_iter().map(ContentItem::try_from).collect()
}

fn returning_posts(sql: &str) -> String {
    format!("{sql} RETURNING {}", POST_COLUMNS.replace("p.", ""))
}

/// Binds: `$1` item id, `$2` like delta, `$3` comment delta.
fn count_update_sql() -> String {
    returning_posts(
        "UPDATE posts SET \
            like_count = GREATEST(like_count + $2, 0), \
            comment_count = GREATEST(comment_count + $3, 0), \
            updated_at = GREATEST(now(), created_at) \
         WHERE id = $1",
    )
}

#[async_trait]
impl EngagementStore for PostgresEngagementStore {
    async fn create_item(&self, item: NewItem) -> Result<ContentItem, RepoError> {
        let sql = returning_posts(
            "INSERT INTO posts (id, title, content, tags, media_url, author_id) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        );
        let row = sqlx::query_as::<_, PostRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(item.title)
            .bind(item.content)
            .bind(item.tags)
            .bind(item.media_url)
            .bind(item.author_id)
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        row.try_into()
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<ContentItem>, RepoError> {
        let sql = format!("SELECT {POST_COLUMNS} FROM posts p WHERE p.id = $1");
        sqlx::query_as::<_, PostRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?
            .map(ContentItem::try_from)
            .transpose()
    }

    async fn update_counts(&self, id: Uuid, delta: CountDelta) -> Result<ContentItem, RepoError> {
        sqlx::query_as::<_, PostRow>(&count_update_sql())
            .bind(id)
            .bind(delta.likes)
            .bind(delta.comments)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?
            .ok_or(RepoError::NotFound)?
            .try_into()
    }

    async fn query_items(
        &self,
        filter: &ItemFilter,
        sort: ItemSort,
        page: PageWindow,
    ) -> Result<Vec<ContentItem>, RepoError> {
        let mut qb = Self::select_posts();
        Self::apply_filter(&mut qb, filter);
        Self::apply_order_and_window(&mut qb, sort, page)?;

        let rows = qb
            .build_query_as::<PostRow>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        into_items(rows)
    }

    async fn count_items(&self, filter: &ItemFilter) -> Result<u64, RepoError> {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM posts p WHERE p.published");
        Self::apply_filter(&mut qb, filter);

        let count = qb
            .build_query_scalar::<i64>()
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Self::convert_count(count)
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
        self.query_items(&filter, ItemSort::default(), PageWindow { offset: 0, limit })
            .await
    }

    async fn liked_item_ids(&self, user: UserId, ids: &[Uuid]) -> Result<Vec<Uuid>, RepoError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_scalar::<_, Uuid>(
            "SELECT post_id FROM likes WHERE user_id = $1 AND post_id = ANY($2)",
        )
        .bind(user)
        .bind(ids.to_vec())
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    async fn toggle_like(
        &self,
        id: Uuid,
        user: UserId,
    ) -> Result<(LikeChange, ContentItem), RepoError> {
        let mut tx = self.pool().begin().await.map_err(map_sqlx_error)?;

        // The row lock serializes toggles on one item, so the like row and
        // the counter always move together.
        let locked: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM posts WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        if locked.is_none() {
            return Err(RepoError::NotFound);
        }

        let removed = sqlx::query("DELETE FROM likes WHERE post_id = $1 AND user_id = $2")
            .bind(id)
            .bind(user)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();

        let (change, delta) = if removed > 0 {
            (LikeChange::Unliked, -1)
        } else {
            let inserted = sqlx::query(
                "INSERT INTO likes (post_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(id)
            .bind(user)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();
            (LikeChange::Liked, i64::from(inserted > 0))
        };

        let row = sqlx::query_as::<_, PostRow>(&count_update_sql())
            .bind(id)
            .bind(delta)
            .bind(0_i64)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok((change, row.try_into()?))
    }

    async fn add_comment(&self, comment: NewComment) -> Result<Comment, RepoError> {
        let row = sqlx::query_as::<_, CommentRow>(
            "INSERT INTO comments (id, post_id, author_id, content) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, post_id, author_id, content, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(comment.post_id)
        .bind(comment.author_id)
        .bind(comment.content)
        .fetch_one(self.pool())
        .await
        .map_err(|err| match map_sqlx_error(err) {
            RepoError::InvalidInput { .. } => RepoError::NotFound,
            other => other,
        })?;
        Ok(row.into())
    }

    async fn list_comments(&self, post_id: Uuid) -> Result<Vec<Comment>, RepoError> {
        let rows = sqlx::query_as::<_, CommentRow>(
            "SELECT id, post_id, author_id, content, created_at \
             FROM comments WHERE post_id = $1 \
             ORDER BY created_at DESC, id ASC",
        )
        .bind(post_id)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(Comment::from).collect())
    }

    async fn list_tags(&self) -> Result<Vec<String>, RepoError> {
        sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT tag FROM posts, unnest(tags) AS tag \
             WHERE published ORDER BY tag",
        )
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    async fn delete_item(&self, id: Uuid) -> Result<Option<ContentItem>, RepoError> {
        let sql = returning_posts("DELETE FROM posts WHERE id = $1");
        sqlx::query_as::<_, PostRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?
            .map(ContentItem::try_from)
            .transpose()
    }
}
