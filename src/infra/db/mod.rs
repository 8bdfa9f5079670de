//! Postgres-backed engagement store.

mod engagement;
mod util;

pub use util::map_sqlx_error;

use std::sync::Arc;

use sqlx::{
    Postgres, QueryBuilder,
    postgres::{PgPool, PgPoolOptions},
    query,
};

use crate::application::pagination::SortOrder;
use crate::application::repos::{ItemFilter, ItemSort, PageWindow, RepoError, SortField};

const POST_COLUMNS: &str = "p.id, p.title, p.content, p.tags, p.media_url, p.author_id, \
    p.like_count, p.comment_count, p.published, p.created_at, p.updated_at";

#[derive(Clone)]
pub struct PostgresEngagementStore {
    pool: Arc<PgPool>,
}

impl PostgresEngagementStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(pool).await
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        query("SELECT 1").execute(self.pool()).await.map(|_| ())
    }

    fn select_posts<'q>() -> QueryBuilder<'q, Postgres> {
        let mut qb = QueryBuilder::new("SELECT ");
        qb.push(POST_COLUMNS);
        qb.push(" FROM posts p WHERE p.published");
        qb
    }

    fn apply_filter<'q>(qb: &mut QueryBuilder<'q, Postgres>, filter: &'q ItemFilter) {
        if !filter.tags.is_empty() {
            qb.push(" AND p.tags && ");
            qb.push_bind(filter.tags.clone());
        }

        if let Some(search) = filter.search.as_deref() {
            let pattern = util::like_pattern(search);
            qb.push(" AND (p.title ILIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" OR p.content ILIKE ");
            qb.push_bind(pattern);
            qb.push(")");
        }

        if let Some(after) = filter.created_after {
            qb.push(" AND p.created_at >= ");
            qb.push_bind(after);
        }
    }

    fn apply_order_and_window(
        qb: &mut QueryBuilder<'_, Postgres>,
        sort: ItemSort,
        page: PageWindow,
    ) -> Result<(), RepoError> {
        let column = match sort.field {
            SortField::CreatedAt => "p.created_at",
            SortField::LikeCount => "p.like_count",
            SortField::CommentCount => "p.comment_count",
        };
        let direction = match sort.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        qb.push(" ORDER BY ");
        qb.push(column);
        qb.push(" ");
        qb.push(direction);
        qb.push(", p.created_at DESC, p.id ASC LIMIT ");
        qb.push_bind(i64::from(page.limit));
        qb.push(" OFFSET ");
        qb.push_bind(Self::convert_offset(page.offset)?);
        Ok(())
    }

    fn convert_offset(value: u64) -> Result<i64, RepoError> {
        value.try_into().map_err(|_| RepoError::InvalidInput {
            message: "offset exceeds supported range".to_string(),
        })
    }

    fn convert_count(value: i64) -> Result<u64, RepoError> {
        value
            .try_into()
            .map_err(|_| RepoError::from_persistence("count exceeds supported range"))
    }
}
