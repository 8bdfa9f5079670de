//! Validation of feed listing parameters.
//!
//! Raw query strings are parsed into canonical parameter structs before they
//! reach the cache or the scorer. Canonical means two requests with the same
//! meaning produce equal structs (and therefore equal cache keys).

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::Duration;

pub const DEFAULT_PAGE_LIMIT: u32 = 10;
pub const MAX_PAGE_LIMIT: u32 = 100;
pub const DEFAULT_TRENDING_LIMIT: u32 = 5;
pub const MAX_TRENDING_LIMIT: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaginationError {
    #[error("page must be a positive integer, got `{0}`")]
    InvalidPage(String),
    #[error("limit must be between 1 and {max}, got `{value}`")]
    InvalidLimit { value: String, max: u32 },
    #[error("order must be `asc` or `desc`, got `{0}`")]
    InvalidOrder(String),
    #[error("time window must be one of `hour`, `day`, `week`, got `{0}`")]
    InvalidWindow(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedSort {
    CreatedAt,
    LikeCount,
    CommentCount,
    Trending,
}

impl FeedSort {
    /// Unknown sort fields fall back to creation time rather than failing.
    fn parse(raw: &str) -> Self {
        match raw.trim() {
            "likeCount" | "likesCount" | "like_count" => Self::LikeCount,
            "commentCount" | "commentsCount" | "comment_count" => Self::CommentCount,
            "trending" | "heat" => Self::Trending,
            _ => Self::CreatedAt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn parse(raw: &str) -> Result<Self, PaginationError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            _ => Err(PaginationError::InvalidOrder(raw.to_string())),
        }
    }
}

/// Query string accepted by the feed listing endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawFeedQuery {
    pub page: Option<String>,
    pub limit: Option<String>,
    /// Comma separated list; an item matches when it carries any of them.
    pub tags: Option<String>,
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub order: Option<String>,
}

/// Validated, canonical feed listing parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FeedParams {
    pub page: u32,
    pub limit: u32,
    pub tags: Vec<String>,
    pub search: Option<String>,
    pub sort: FeedSort,
    pub order: SortOrder,
}

impl Default for FeedParams {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
            tags: Vec::new(),
            search: None,
            sort: FeedSort::CreatedAt,
            order: SortOrder::Desc,
        }
    }
}

impl FeedParams {
    pub fn from_query(raw: &RawFeedQuery) -> Result<Self, PaginationError> {
        let page = match non_blank(raw.page.as_deref()) {
            Some(value) => value
                .parse::<u32>()
                .ok()
                .filter(|page| *page >= 1)
                .ok_or_else(|| PaginationError::InvalidPage(value.to_string()))?,
            None => 1,
        };

        let limit = parse_limit(raw.limit.as_deref(), DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT)?;

        let mut tags: Vec<String> = raw
            .tags
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect();
        tags.sort();
        tags.dedup();

        let search = non_blank(raw.search.as_deref()).map(str::to_lowercase);
        let sort = non_blank(raw.sort_by.as_deref())
            .map(FeedSort::parse)
            .unwrap_or(FeedSort::CreatedAt);
        let order = match non_blank(raw.order.as_deref()) {
            Some(value) => SortOrder::parse(value)?,
            None => SortOrder::Desc,
        };

        Ok(Self {
            page,
            limit,
            tags,
            search,
            sort,
            order,
        })
    }

    /// Number of items preceding the requested page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendingWindow {
    Hour,
    Day,
    Week,
}

impl TrendingWindow {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
        }
    }

    pub fn duration(self) -> Duration {
        match self {
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::hours(24),
            Self::Week => Duration::hours(168),
        }
    }

    fn parse(raw: &str) -> Result<Self, PaginationError> {
        match raw.trim() {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            _ => Err(PaginationError::InvalidWindow(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawTrendingQuery {
    pub limit: Option<String>,
    pub time_window: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrendingParams {
    pub limit: u32,
    pub window: TrendingWindow,
}

impl Default for TrendingParams {
    fn default() -> Self {
        Self {
            limit: DEFAULT_TRENDING_LIMIT,
            window: TrendingWindow::Day,
        }
    }
}

impl TrendingParams {
    pub fn from_query(raw: &RawTrendingQuery) -> Result<Self, PaginationError> {
        let limit = parse_limit(
            raw.limit.as_deref(),
            DEFAULT_TRENDING_LIMIT,
            MAX_TRENDING_LIMIT,
        )?;
        let window = match non_blank(raw.time_window.as_deref()) {
            Some(value) => TrendingWindow::parse(value)?,
            None => TrendingWindow::Day,
        };
        Ok(Self { limit, window })
    }
}

/// Pagination metadata returned next to a page of results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u64,
}

impl Pagination {
    pub fn new(total: u64, page: u32, limit: u32) -> Self {
        Self {
            total,
            page,
            limit,
            total_pages: total.div_ceil(u64::from(limit.max(1))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub pagination: Pagination,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn parse_limit(raw: Option<&str>, default: u32, max: u32) -> Result<u32, PaginationError> {
    match non_blank(raw) {
        Some(value) => value
            .parse::<u32>()
            .ok()
            .filter(|limit| (1..=max).contains(limit))
            .ok_or_else(|| PaginationError::InvalidLimit {
                value: value.to_string(),
                max,
            }),
        None => Ok(default),
    }
}
