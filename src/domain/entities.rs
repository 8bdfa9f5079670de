//! Domain entities mirrored from the engagement store.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::error::DomainError;

/// Identity of the user issuing a request, as asserted by the upstream auth layer.
pub type UserId = i64;

const MAX_TITLE_CHARS: usize = 200;
const MAX_CONTENT_CHARS: usize = 10_000;
const MAX_COMMENT_CHARS: usize = 2_000;

/// Pseudonyms shown next to comments instead of the author's account.
const ANONYMOUS_NAMES: [&str; 20] = [
    "Anonymous Panda",
    "Anonymous Fox",
    "Anonymous Dolphin",
    "Anonymous Eagle",
    "Anonymous Tiger",
    "Anonymous Wolf",
    "Anonymous Bear",
    "Anonymous Lion",
    "Anonymous Owl",
    "Anonymous Deer",
    "Anonymous Rabbit",
    "Anonymous Cat",
    "Anonymous Dog",
    "Anonymous Horse",
    "Anonymous Elephant",
    "Anonymous Giraffe",
    "Anonymous Penguin",
    "Anonymous Koala",
    "Anonymous Kangaroo",
    "Anonymous Zebra",
];

/// A published piece of content together with its engagement counters.
///
/// Snapshots of this record are read by the scorer, the query cache and the
/// broadcaster; only the engagement store mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub media_url: Option<String>,
    pub author_id: UserId,
    pub like_count: u64,
    pub comment_count: u64,
    pub published: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Last modification; bumped by every like, unlike and comment.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ContentItem {
    /// Most recent engagement instant, falling back to creation.
    pub fn last_engaged_at(&self) -> OffsetDateTime {
        self.updated_at.max(self.created_at)
    }
}

/// Input for creating a new content item.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(skip)]
    pub author_id: UserId,
}

impl NewItem {
    /// Trim text fields and drop blank or repeated tags, rejecting empty or
    /// oversized input.
    pub fn normalize(self) -> Result<Self, DomainError> {
        let title = required_text("title", &self.title, MAX_TITLE_CHARS)?;
        let content = required_text("content", &self.content, MAX_CONTENT_CHARS)?;

        let mut tags: Vec<String> = Vec::with_capacity(self.tags.len());
        for tag in self.tags.iter().map(|tag| tag.trim()) {
            if !tag.is_empty() && !tags.iter().any(|seen| seen == tag) {
                tags.push(tag.to_string());
            }
        }

        let media_url = self
            .media_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        Ok(Self {
            title,
            content,
            tags,
            media_url,
            author_id: self.author_id,
        })
    }
}

/// Signed adjustment applied to an item's engagement counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountDelta {
    pub likes: i64,
    pub comments: i64,
}

impl CountDelta {
    pub fn likes(delta: i64) -> Self {
        Self {
            likes: delta,
            comments: 0,
        }
    }

    pub fn comments(delta: i64) -> Self {
        Self {
            likes: 0,
            comments: delta,
        }
    }

    /// Apply the delta to a counter, saturating at zero.
    pub fn apply(current: u64, delta: i64) -> u64 {
        if delta >= 0 {
            current.saturating_add(delta.unsigned_abs())
        } else {
            current.saturating_sub(delta.unsigned_abs())
        }
    }
}

/// Result of toggling a like row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeChange {
    Liked,
    Unliked,
}

impl LikeChange {
    pub fn delta(self) -> CountDelta {
        match self {
            LikeChange::Liked => CountDelta::likes(1),
            LikeChange::Unliked => CountDelta::likes(-1),
        }
    }

    pub fn is_liked(self) -> bool {
        matches!(self, LikeChange::Liked)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: Uuid,
    pub post_id: Uuid,
    pub author_id: UserId,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewComment {
    pub post_id: Uuid,
    pub author_id: UserId,
    pub content: String,
}

impl NewComment {
    pub fn new(post_id: Uuid, author_id: UserId, content: &str) -> Result<Self, DomainError> {
        Ok(Self {
            post_id,
            author_id,
            content: required_text("content", content, MAX_COMMENT_CHARS)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentAuthor {
    pub id: UserId,
    pub anonymous_name: String,
}

/// Comment projection served to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentView {
    pub id: Uuid,
    pub post_id: Uuid,
    pub content: String,
    pub author: CommentAuthor,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<Comment> for CommentView {
    fn from(comment: Comment) -> Self {
        Self {
            id: comment.id,
            post_id: comment.post_id,
            content: comment.content,
            author: CommentAuthor {
                id: comment.author_id,
                anonymous_name: anonymous_name(comment.author_id).to_string(),
            },
            created_at: comment.created_at,
        }
    }
}

fn required_text(field: &str, value: &str, max_chars: usize) -> Result<String, DomainError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation(format!("{field} is required")));
    }
    if trimmed.chars().count() > max_chars {
        return Err(DomainError::validation(format!(
            "{field} must be at most {max_chars} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Stable pseudonym for a user id.
pub fn anonymous_name(user: UserId) -> &'static str {
    let index = user.rem_euclid(ANONYMOUS_NAMES.len() as i64) as usize;
    ANONYMOUS_NAMES[index]
}
