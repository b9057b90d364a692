//! Civility scoring: five bounded metrics averaged into a single score.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of metrics in one rating.
pub const METRIC_COUNT: usize = 5;

/// Inclusive upper bound of a single metric.
pub const METRIC_MAX: u8 = 5;

/// The five rated dimensions, in payload order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    Clarity,
    Respectfulness,
    Relevance,
    Evidence,
    Constructiveness,
}

impl Metric {
    /// All metrics in the fixed order used by the attestation payload.
    pub const ALL: [Metric; METRIC_COUNT] = [
        Metric::Clarity,
        Metric::Respectfulness,
        Metric::Relevance,
        Metric::Evidence,
        Metric::Constructiveness,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Metric::Clarity => "clarity",
            Metric::Respectfulness => "respectfulness",
            Metric::Relevance => "relevance",
            Metric::Evidence => "evidence",
            Metric::Constructiveness => "constructiveness",
        }
    }
}

/// Rejected metric input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidMetric {
    #[error("expected {METRIC_COUNT} metrics, got {0}")]
    WrongCount(usize),
    #[error("metric {metric} out of range [0, {METRIC_MAX}]: {value}")]
    OutOfRange { metric: &'static str, value: i64 },
}

/// Five validated metric values, each in `0..=5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricRatings([u8; METRIC_COUNT]);

impl MetricRatings {
    /// Validate raw integers. Rejects a wrong count or any value outside `0..=5`.
    pub fn try_from_slice(values: &[i64]) -> Result<Self, InvalidMetric> {
        if values.len() != METRIC_COUNT {
            return Err(InvalidMetric::WrongCount(values.len()));
        }
        let mut out = [0u8; METRIC_COUNT];
        for ((slot, raw), metric) in out.iter_mut().zip(values).zip(Metric::ALL) {
            *slot = u8::try_from(*raw)
                .ok()
                .filter(|v| *v <= METRIC_MAX)
                .ok_or(InvalidMetric::OutOfRange {
                    metric: metric.name(),
                    value: *raw,
                })?;
        }
        Ok(Self(out))
    }

    pub fn as_array(&self) -> [u8; METRIC_COUNT] {
        self.0
    }

    pub fn get(&self, metric: Metric) -> u8 {
        self.0[metric as usize]
    }

    pub fn sum(&self) -> u16 {
        self.0.iter().map(|v| u16::from(*v)).sum()
    }

    /// Average of the five metrics, exactly `sum / 5`.
    pub fn score(&self) -> f64 {
        f64::from(self.sum()) / 5.0
    }

    /// `round(score * 100)`. Since `score = sum / 5`, this is exactly `sum * 20`.
    pub fn scaled_score(&self) -> u16 {
        self.sum() * 20
    }
}

impl fmt::Display for MetricRatings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u8::to_string).collect();
        write!(f, "[{}]", parts.join(","))
    }
}

/// Validate five raw metrics and return their average.
pub fn calculate_score(values: &[i64]) -> Result<f64, InvalidMetric> {
    MetricRatings::try_from_slice(values).map(|m| m.score())
}

/// Qualitative band derived from a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    Bronze,
    Silver,
    Gold,
}

impl Tier {
    pub fn name(&self) -> &'static str {
        match self {
            Tier::Bronze => "Bronze",
            Tier::Silver => "Silver",
            Tier::Gold => "Gold",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Tier::Bronze => "\u{1F949}",
            Tier::Silver => "\u{1F948}",
            Tier::Gold => "\u{1F947}",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Inclusive lower bounds of each tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierBands {
    pub bronze: f64,
    pub silver: f64,
    pub gold: f64,
}

impl Default for TierBands {
    fn default() -> Self {
        Self {
            bronze: 3.0,
            silver: 4.0,
            gold: 4.6,
        }
    }
}

impl TierBands {
    /// Bounds must be ascending and inside `[0, 5]`.
    pub fn validate(&self) -> Result<(), String> {
        let in_range = |v: f64| (0.0..=5.0).contains(&v);
        if !(in_range(self.bronze) && in_range(self.silver) && in_range(self.gold)) {
            return Err("tier bounds must lie in [0, 5]".to_string());
        }
        if !(self.bronze < self.silver && self.silver < self.gold) {
            return Err(format!(
                "tier bounds must be ascending: bronze={} silver={} gold={}",
                self.bronze, self.silver, self.gold
            ));
        }
        Ok(())
    }

    /// Tier for a score, or `None` below the bronze bound.
    pub fn tier_for(&self, score: f64) -> Option<Tier> {
        if score >= self.gold {
            Some(Tier::Gold)
        } else if score >= self.silver {
            Some(Tier::Silver)
        } else if score >= self.bronze {
            Some(Tier::Bronze)
        } else {
            None
        }
    }
}
