use crate::config::{RiskThresholds, RiskWeights};
use crate::models::{DerivedFeatures, RiskAssessment, RiskComponents, RiskLevel};

/// Returned by [`normalize`] when a feature has zero variance in the batch.
pub const NEUTRAL_RISK: f64 = 50.0;

/// Maps `value` onto the 0-100 axis spanned by `[min, max]`. With `inverse`
/// the axis is flipped so that low values carry high risk.
pub fn normalize(value: f64, min: f64, max: f64, inverse: bool) -> f64 {
    if min == max {
        return NEUTRAL_RISK;
    }
    let linear = (value - min) / (max - min) * 100.0;
    let risk = if inverse { 100.0 - linear } else { linear };
    risk.clamp(0.0, 100.0)
}

/// Observed bounds of one feature across the batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    fn of(values: impl Iterator<Item = f64>) -> Option<Self> {
        values.fold(None, |acc, v| match acc {
            None => Some(Range { min: v, max: v }),
            Some(r) => Some(Range {
                min: r.min.min(v),
                max: r.max.max(v),
            }),
        })
    }
}

/// Batch-wide bounds for every normalized feature. Computing this is the
/// barrier between the reduction phase and the per-record phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureRanges {
    pub attendance: Range,
    pub grade: Range,
    pub trend: Range,
}

impl FeatureRanges {
    /// `None` for an empty batch.
    pub fn from_batch(features: &[DerivedFeatures]) -> Option<Self> {
        Some(Self {
            attendance: Range::of(features.iter().map(|f| f.attendance_pct))?,
            grade: Range::of(features.iter().map(|f| f.final_grade))?,
            trend: Range::of(features.iter().map(|f| f.trend_recent))?,
        })
    }

    pub fn components(&self, features: &DerivedFeatures) -> RiskComponents {
        RiskComponents {
            attendance_risk: normalize(
                features.attendance_pct,
                self.attendance.min,
                self.attendance.max,
                true,
            ),
            grade_risk: normalize(features.final_grade, self.grade.min, self.grade.max, true),
            trend_risk: normalize(features.trend_recent, self.trend.min, self.trend.max, true),
            missing_assignments_risk: f64::from(features.missing_assignments) * 100.0,
        }
    }
}

pub fn normalize_batch(features: &[DerivedFeatures]) -> Vec<RiskComponents> {
    match FeatureRanges::from_batch(features) {
        Some(ranges) => features.iter().map(|f| ranges.components(f)).collect(),
        None => Vec::new(),
    }
}

pub fn weighted_score(components: &RiskComponents, weights: &RiskWeights) -> f64 {
    let score = components.attendance_risk * weights.attendance
        + components.grade_risk * weights.grade
        + components.trend_risk * weights.trend
        + components.missing_assignments_risk * weights.missing_assignments;
    score.clamp(0.0, 100.0)
}

pub fn classify(score: f64, thresholds: &RiskThresholds) -> RiskLevel {
    if score <= thresholds.low_max {
        RiskLevel::Low
    } else if score <= thresholds.medium_max {
        RiskLevel::Medium
    } else {
        RiskLevel::High
    }
}

/// Weighted aggregation plus level classification. Holds an already
/// validated weight set and threshold table.
#[derive(Debug, Clone, Copy)]
pub struct RiskAggregator {
    weights: RiskWeights,
    thresholds: RiskThresholds,
}

impl RiskAggregator {
    pub fn new(weights: RiskWeights, thresholds: RiskThresholds) -> crate::error::Result<Self> {
        weights.validate()?;
        thresholds.validate()?;
        Ok(Self {
            weights,
            thresholds,
        })
    }

    pub fn assess(&self, components: &RiskComponents) -> RiskAssessment {
        let risk_score = weighted_score(components, &self.weights);
        RiskAssessment {
            risk_score,
            risk_level: classify(risk_score, &self.thresholds),
        }
    }

    pub fn thresholds(&self) -> &RiskThresholds {
        &self.thresholds
    }

    pub fn weights(&self) -> &RiskWeights {
        &self.weights
    }
}

impl Default for RiskAggregator {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            thresholds: RiskThresholds::default(),
        }
    }
}
