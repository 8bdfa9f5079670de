//! Heat scoring: a bounded ranking value combining engagement and recency.
//!
//! The score for an item is
//!
//! ```text
//! round(raw * exp(-decay_rate * engagement_age_hours) * boost / log10(age_hours + 2))
//! ```
//!
//! clamped to `0..=100`, where `raw` is the weighted sum of likes and comments and
//! `boost` applies while the item is younger than the boost window. The
//! denominator is at least `log10(2)`, so there is no division by zero.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use super::entities::ContentItem;

pub const MAX_HEAT: u8 = 100;

const DEFAULT_LIKE_WEIGHT: f64 = 2.0;
const DEFAULT_COMMENT_WEIGHT: f64 = 1.0;
const DEFAULT_DECAY_RATE: f64 = 0.1;
const DEFAULT_BOOST_WINDOW_HOURS: i64 = 24;
const DEFAULT_BOOST_MULTIPLIER: f64 = 1.2;

/// Tunable constants of the heat formula.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeatWeights {
    pub like_weight: f64,
    pub comment_weight: f64,
    /// Fraction of heat lost per hour since the last engagement.
    pub decay_rate: f64,
    pub boost_window: Duration,
    pub boost_multiplier: f64,
}

impl Default for HeatWeights {
    fn default() -> Self {
        Self {
            like_weight: DEFAULT_LIKE_WEIGHT,
            comment_weight: DEFAULT_COMMENT_WEIGHT,
            decay_rate: DEFAULT_DECAY_RATE,
            boost_window: Duration::hours(DEFAULT_BOOST_WINDOW_HOURS),
            boost_multiplier: DEFAULT_BOOST_MULTIPLIER,
        }
    }
}

/// An item paired with the heat it scored at ranking time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scored<T> {
    #[serde(flatten)]
    pub item: T,
    pub heat: u8,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeatScorer {
    weights: HeatWeights,
}

impl HeatScorer {
    pub fn new(weights: HeatWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &HeatWeights {
        &self.weights
    }

    /// Score an item as of `now`.
    ///
    /// Assumes validated, non-negative counters. Timestamps in the future (clock
    /// skew) are treated as "just now".
    pub fn score(&self, item: &ContentItem, now: OffsetDateTime) -> u8 {
        let age_hours = hours_between(item.created_at, now);
        let engagement_age_hours = age_hours.min(hours_between(item.last_engaged_at(), now));

        let raw = item.like_count as f64 * self.weights.like_weight
            + item.comment_count as f64 * self.weights.comment_weight;
        let decay = (-self.weights.decay_rate * engagement_age_hours).exp();
        let boost = if age_hours < hours(self.weights.boost_window) {
            self.weights.boost_multiplier
        } else {
            1.0
        };

        let heat = (raw * decay * boost) / (age_hours + 2.0).log10();
        clamp_heat(heat)
    }

    /// Score and order items hottest first.
    ///
    /// The sort is stable: items with equal heat keep their input order, so
    /// callers pass items in recency order to break ties by recency.
    pub fn rank(&self, items: Vec<ContentItem>, now: OffsetDateTime) -> Vec<Scored<ContentItem>> {
        let mut scored: Vec<_> = items
            .into_iter()
            .map(|item| {
                let heat = self.score(&item, now);
                Scored { item, heat }
            })
            .collect();
        scored.sort_by(|a, b| b.heat.cmp(&a.heat));
        scored
    }
}

fn clamp_heat(value: f64) -> u8 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    value.round().min(f64::from(MAX_HEAT)) as u8
}

fn hours(duration: Duration) -> f64 {
    duration.as_seconds_f64() / 3600.0
}

/// Hours elapsed from `earlier` to `now`, never negative.
pub fn hours_between(earlier: OffsetDateTime, now: OffsetDateTime) -> f64 {
    hours(now - earlier).max(0.0)
}
