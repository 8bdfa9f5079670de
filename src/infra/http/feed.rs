//! JSON handlers for the feed API.

use axum::{
    Json,
    extract::{
        Extension, Path, Query, State,
        rejection::{JsonRejection, PathRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::application::error::HttpError;
use crate::application::feed::{FeedEntry, FeedError};
use crate::application::pagination::{
    FeedParams, Pagination, RawFeedQuery, RawTrendingQuery, TrendingParams,
};
use crate::domain::entities::{CommentView, ContentItem, NewItem};
use crate::domain::heat::Scored;

use super::HttpState;
use super::middleware::RequestUser;

const SOURCE: &str = "infra::http::feed";

#[derive(Debug, Serialize)]
pub struct PostListResponse {
    pub posts: Vec<FeedEntry>,
    pub pagination: Pagination,
}

#[derive(Debug, Deserialize)]
pub struct NewCommentRequest {
    pub content: String,
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, HttpError> {
    payload.map(|Json(value)| value).map_err(|rejection| {
        HttpError::bad_request(SOURCE, "Malformed request body", rejection.body_text())
    })
}

fn post_id(path: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, HttpError> {
    path.map(|Path(id)| id).map_err(|rejection| {
        HttpError::bad_request(SOURCE, "Invalid post id", rejection.body_text())
    })
}

pub async fn list_posts(
    State(state): State<HttpState>,
    Extension(user): Extension<RequestUser>,
    Query(raw): Query<RawFeedQuery>,
) -> Result<Json<PostListResponse>, HttpError> {
    let params = FeedParams::from_query(&raw).map_err(FeedError::from)?;
    let page = state.feed.ranked_feed(&params, user.0).await?;
    Ok(Json(PostListResponse {
        posts: page.items,
        pagination: page.pagination,
    }))
}

pub async fn trending_posts(
    State(state): State<HttpState>,
    Query(raw): Query<RawTrendingQuery>,
) -> Result<Json<Vec<Scored<ContentItem>>>, HttpError> {
    let params = TrendingParams::from_query(&raw).map_err(FeedError::from)?;
    Ok(Json(state.feed.trending(params).await?))
}

pub async fn list_tags(State(state): State<HttpState>) -> Result<Json<Vec<String>>, HttpError> {
    Ok(Json(state.feed.tags().await?))
}

pub async fn create_post(
    State(state): State<HttpState>,
    Extension(user): Extension<RequestUser>,
    payload: Result<Json<NewItem>, JsonRejection>,
) -> Result<Response, HttpError> {
    let author = user.require()?;
    let new = json_body(payload)?;
    let entry = state.feed.create_post(author, new).await?;
    Ok((StatusCode::CREATED, Json(entry)).into_response())
}

pub async fn toggle_like(
    State(state): State<HttpState>,
    Extension(user): Extension<RequestUser>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<FeedEntry>, HttpError> {
    let user = user.require()?;
    let id = post_id(path)?;
    Ok(Json(state.feed.toggle_like(id, user).await?))
}

pub async fn list_comments(
    State(state): State<HttpState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Vec<CommentView>>, HttpError> {
    let id = post_id(path)?;
    Ok(Json(state.feed.comments(id).await?))
}

pub async fn add_comment(
    State(state): State<HttpState>,
    Extension(user): Extension<RequestUser>,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<NewCommentRequest>, JsonRejection>,
) -> Result<Response, HttpError> {
    let author = user.require()?;
    let id = post_id(path)?;
    let body = json_body(payload)?;
    let comment = state.feed.add_comment(id, author, &body.content).await?;
    Ok((StatusCode::CREATED, Json(comment)).into_response())
}

pub async fn delete_post(
    State(state): State<HttpState>,
    Extension(user): Extension<RequestUser>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<StatusCode, HttpError> {
    let user = user.require()?;
    let id = post_id(path)?;
    state.feed.delete_post(id, user).await?;
    Ok(StatusCode::NO_CONTENT)
}
