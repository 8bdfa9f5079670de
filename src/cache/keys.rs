//! Cache key definitions.
//!
//! Every key belongs to exactly one [`KeyFamily`]; families share a prefix so a
//! write can drop all of them with one prefix invalidation.

use std::fmt;

use uuid::Uuid;

use crate::application::pagination::{FeedParams, TrendingParams};
use crate::domain::entities::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFamily {
    /// Paginated, filtered feed listings.
    Posts,
    /// Tag enumeration.
    Tags,
    /// Per-item comment lists.
    Comments,
    /// Heat-ranked trending lists.
    Trending,
}

impl KeyFamily {
    pub const ALL: [KeyFamily; 4] = [Self::Posts, Self::Tags, Self::Comments, Self::Trending];

    pub fn prefix(self) -> &'static str {
        match self {
            Self::Posts => "posts:",
            Self::Tags => "tags:",
            Self::Comments => "comments:post:",
            Self::Trending => "trending:",
        }
    }

    /// Families that may hold keys starting with `prefix`.
    pub fn overlapping(prefix: &str) -> impl Iterator<Item = KeyFamily> + '_ {
        Self::ALL.into_iter().filter(move |family| {
            family.prefix().starts_with(prefix) || prefix.starts_with(family.prefix())
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Posts => "posts",
            Self::Tags => "tags",
            Self::Comments => "comments",
            Self::Trending => "trending",
        }
    }
}

/// A fully qualified cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    family: KeyFamily,
    key: String,
}

impl CacheKey {
    /// Key for one page of the feed as seen by `user`.
    ///
    /// Every parameter takes part in the key, and the listing carries per-user
    /// `liked` flags, so the user id does too. String fields are written in
    /// their escaped debug form so distinct parameters never collide.
    pub fn post_list(params: &FeedParams, user: Option<UserId>) -> Self {
        let key = format!(
            "{}page={}:limit={}:sort={:?}:order={:?}:tags={:?}:search={:?}:user={:?}",
            KeyFamily::Posts.prefix(),
            params.page,
            params.limit,
            params.sort,
            params.order,
            params.tags,
            params.search,
            user,
        );
        Self {
            family: KeyFamily::Posts,
            key,
        }
    }

    pub fn all_tags() -> Self {
        Self {
            family: KeyFamily::Tags,
            key: format!("{}all", KeyFamily::Tags.prefix()),
        }
    }

    pub fn comments(post_id: Uuid) -> Self {
        Self {
            family: KeyFamily::Comments,
            key: format!("{}{post_id}", KeyFamily::Comments.prefix()),
        }
    }

    pub fn trending(params: &TrendingParams) -> Self {
        Self {
            family: KeyFamily::Trending,
            key: format!(
                "{}{}:{}",
                KeyFamily::Trending.prefix(),
                params.window.as_str(),
                params.limit
            ),
        }
    }

    pub fn family(&self) -> KeyFamily {
        self.family
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}
