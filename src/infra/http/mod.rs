mod feed;
mod middleware;
mod ws;

pub use feed::{NewCommentRequest, PostListResponse};
pub use middleware::{RequestContext, RequestUser, USER_ID_HEADER};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Serialize;

use crate::application::error::ErrorReport;
use crate::application::feed::FeedService;
use crate::util::time::now_millis;

use super::db::PostgresEngagementStore;
use middleware::{identify_user, log_responses, set_request_context};

#[derive(Clone)]
pub struct HttpState {
    pub feed: FeedService,
    /// Present when the service runs against Postgres.
    pub db: Option<PostgresEngagementStore>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: i64,
    pub store: &'static str,
    pub cache: &'static str,
    pub connections: usize,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/posts", get(feed::list_posts).post(feed::create_post))
        .route("/api/posts/trending", get(feed::trending_posts))
        .route("/api/posts/tags", get(feed::list_tags))
        .route("/api/posts/{id}", delete(feed::delete_post))
        .route("/api/posts/{id}/like", post(feed::toggle_like))
        .route(
            "/api/posts/{id}/comments",
            get(feed::list_comments).post(feed::add_comment),
        )
        .route("/ws", get(ws::feed_socket))
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(identify_user))
        .layer(axum_middleware::from_fn(set_request_context))
        .with_state(state)
}

async fn health(State(state): State<HttpState>) -> Response {
    let (status, store) = match state.db.as_ref() {
        Some(db) => match db.health_check().await {
            Ok(()) => (StatusCode::OK, "postgres"),
            Err(err) => {
                let body = health_body(&state, "degraded", "postgres");
                let mut response = (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
                ErrorReport::from_error(
                    "infra::http::health",
                    StatusCode::SERVICE_UNAVAILABLE,
                    &err,
                )
                .attach(&mut response);
                return response;
            }
        },
        None => (StatusCode::OK, "memory"),
    };

    (status, Json(health_body(&state, "ok", store))).into_response()
}

fn health_body(state: &HttpState, status: &'static str, store: &'static str) -> HealthResponse {
    HealthResponse {
        status,
        timestamp: now_millis(),
        store,
        cache: state.feed.cache().backend_name(),
        connections: state.feed.broadcaster().connection_count(),
    }
}
