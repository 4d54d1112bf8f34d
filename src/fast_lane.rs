//! Fast-lane progression policy.
//!
//! A learner whose ability estimates are confident, who sits between milestone gates, and
//! whose warmup is over may skip some diagnostic tasks and see slightly fewer OOD probes.
//! The policy only reports eligibility; callers apply it through
//! [`apply_fast_lane_to_diagnostic_mode`] and [`apply_fast_lane_ood_rate`] (or by passing
//! the decision to [`compute_ood_budget`](crate::compute_ood_budget)).

use tracing::debug;

use crate::round_to;

/// Protocol version stamped on every [`FastLaneDecision`].
pub const FAST_LANE_PROTOCOL_VERSION: &str = "fast-lane-progression-v1";

/// Upstream confidence and gate signals for one learner.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct FastLaneSignals {
    /// Confidence of the stage projection. Non-finite counts as `0`.
    pub projection_confidence: f64,
    /// Confidence of the placement estimate. Non-finite counts as `0`.
    pub placement_confidence: f64,
    /// Uncertainty of the placement estimate. Non-finite counts as `1`.
    pub placement_uncertainty: f64,
    /// The learner is ready for a promotion check.
    pub promotion_ready: bool,
    /// A stress gate must be run before progressing.
    pub stress_gate_required: bool,
    /// Share of target-stage nodes at 70% mastery, if known.
    #[cfg_attr(feature = "serde", serde(default))]
    pub target_stage_coverage: Option<f64>,
    /// Cold-start mode is still on.
    pub cold_start_active: bool,
    /// Placement happened recently.
    pub placement_fresh: bool,
}

/// Thresholds for [`evaluate_fast_lane`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct FastLaneConfig {
    pub min_projection_confidence: f64,
    pub min_placement_confidence: f64,
    pub max_placement_uncertainty: f64,
    /// Coverage at or above this means a milestone gate is imminent.
    pub coverage_gate: f64,
    /// Added to the OOD budget rate when eligible.
    pub ood_rate_delta: f64,
}

impl Default for FastLaneConfig {
    fn default() -> Self {
        Self {
            min_projection_confidence: 0.8,
            min_placement_confidence: 0.75,
            max_placement_uncertainty: 0.24,
            coverage_gate: 0.95,
            ood_rate_delta: -0.02,
        }
    }
}

fn unit_or(x: f64, fallback: f64) -> f64 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        fallback
    }
}

impl FastLaneConfig {
    /// Copy with thresholds in `[0, 1]` and the rate delta in `[-1, 1]`.
    pub fn sanitized(&self) -> Self {
        let d = Self::default();
        Self {
            min_projection_confidence: unit_or(
                self.min_projection_confidence,
                d.min_projection_confidence,
            ),
            min_placement_confidence: unit_or(self.min_placement_confidence, d.min_placement_confidence),
            max_placement_uncertainty: unit_or(
                self.max_placement_uncertainty,
                d.max_placement_uncertainty,
            ),
            coverage_gate: unit_or(self.coverage_gate, d.coverage_gate),
            ood_rate_delta: if self.ood_rate_delta.is_finite() {
                self.ood_rate_delta.clamp(-1.0, 1.0)
            } else {
                d.ood_rate_delta
            },
        }
    }
}

/// Thresholds actually used, echoed for audit.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct FastLaneThresholds {
    pub min_projection_confidence: f64,
    pub min_placement_confidence: f64,
    pub max_placement_uncertainty: f64,
}

/// Output of [`evaluate_fast_lane`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct FastLaneDecision {
    pub protocol_version: String,
    pub high_confidence: bool,
    pub between_milestone_gates: bool,
    pub warmup_complete: bool,
    /// All three conditions hold.
    pub eligible: bool,
    /// Equal to `eligible`.
    pub reduce_diagnostic_density: bool,
    /// `ood_rate_delta` when eligible, else `0`.
    pub ood_budget_rate_delta: f64,
    /// One entry per condition, pass or fail wording.
    pub reasons: Vec<String>,
    pub thresholds: FastLaneThresholds,
}

/// Decide fast-lane eligibility.
pub fn evaluate_fast_lane(signals: &FastLaneSignals, cfg: &FastLaneConfig) -> FastLaneDecision {
    let cfg = cfg.sanitized();
    let projection = unit_or(signals.projection_confidence, 0.0);
    let placement = unit_or(signals.placement_confidence, 0.0);
    let uncertainty = unit_or(signals.placement_uncertainty, 1.0);

    let high_confidence = projection >= cfg.min_projection_confidence
        && placement >= cfg.min_placement_confidence
        && uncertainty <= cfg.max_placement_uncertainty;
    // A NaN coverage compares false, which keeps the gate window closed.
    let coverage_open = signals
        .target_stage_coverage
        .map_or(true, |c| c < cfg.coverage_gate);
    let between_milestone_gates =
        !signals.promotion_ready && !signals.stress_gate_required && coverage_open;
    let warmup_complete = !signals.cold_start_active && !signals.placement_fresh;
    let eligible = high_confidence && between_milestone_gates && warmup_complete;

    let reasons = vec![
        if high_confidence { "high_confidence" } else { "confidence_below_threshold" }.to_string(),
        if between_milestone_gates { "between_milestone_gates" } else { "milestone_gate_window" }
            .to_string(),
        if warmup_complete { "warmup_complete" } else { "warmup_active" }.to_string(),
    ];

    debug!(
        eligible,
        high_confidence, between_milestone_gates, warmup_complete, "fast-lane evaluation"
    );

    FastLaneDecision {
        protocol_version: FAST_LANE_PROTOCOL_VERSION.to_string(),
        high_confidence,
        between_milestone_gates,
        warmup_complete,
        eligible,
        reduce_diagnostic_density: eligible,
        ood_budget_rate_delta: if eligible { cfg.ood_rate_delta } else { 0.0 },
        reasons,
        thresholds: FastLaneThresholds {
            min_projection_confidence: cfg.min_projection_confidence,
            min_placement_confidence: cfg.min_placement_confidence,
            max_placement_uncertainty: cfg.max_placement_uncertainty,
        },
    }
}

/// Turn diagnostic mode off for fast-lane learners; otherwise keep `base`.
pub fn apply_fast_lane_to_diagnostic_mode(base: bool, decision: &FastLaneDecision) -> bool {
    if decision.eligible && decision.reduce_diagnostic_density {
        false
    } else {
        base
    }
}

/// Shift an OOD rate by the fast-lane delta, clamped to `[0, 1]` and rounded to 4 decimals.
///
/// A non-finite `base_rate` is returned unchanged.
pub fn apply_fast_lane_ood_rate(base_rate: f64, decision: &FastLaneDecision) -> f64 {
    if !base_rate.is_finite() {
        return base_rate;
    }
    if !decision.eligible {
        return round_to(base_rate, 4);
    }
    round_to((base_rate + decision.ood_budget_rate_delta).clamp(0.0, 1.0), 4)
}
