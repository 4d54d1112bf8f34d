//! Retention promotion gate.
//!
//! Promotion into a high-stakes stage requires durable evidence: for each retention window
//! (7, 30, 90 days by default) enough anchored skill demonstrations must have been
//! re-demonstrated a window later, at a pass rate of at least `pass_threshold`.
//!
//! The pass-rate metric, per window `w`:
//! - group evidence rows by `(learner_id, node_id)` and sort each group by time;
//! - every row scoring at least [`RETENTION_PASS_SCORE`] and dated at or before `now - w`
//!   is an anchor;
//! - its follow-up is the first later row in the group dated within
//!   `[anchor + w, anchor + w + RETENTION_GRACE_DAYS]`;
//! - anchors without a follow-up are skipped; `value = passing follow-ups / anchors
//!   with a follow-up`.
//!
//! Rows older than [`RETENTION_LOOKBACK_DAYS`] are ignored.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::{Error, Result};

/// Protocol version stamped on every [`RetentionGateResult`].
pub const RETENTION_GATE_VERSION: &str = "retention-promotion-gate-v1";

/// Score at or above which a row counts as a demonstration.
pub const RETENTION_PASS_SCORE: f64 = 0.7;

/// Extra days after the window in which a follow-up still counts.
pub const RETENTION_GRACE_DAYS: i64 = 21;

/// Evidence older than this is not considered.
pub const RETENTION_LOOKBACK_DAYS: i64 = 365;

/// Ordered learner stages plus the first stage that counts as high stakes.
///
/// Deserialization runs [`StageLadder::validate`], so a loaded ladder always contains its
/// threshold stage.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(rename_all = "camelCase", try_from = "RawStageLadder")
)]
pub struct StageLadder {
    stages: Vec<String>,
    high_stakes_stage: String,
}

#[cfg(feature = "serde")]
#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStageLadder {
    stages: Vec<String>,
    high_stakes_stage: String,
}

#[cfg(feature = "serde")]
impl TryFrom<RawStageLadder> for StageLadder {
    type Error = Error;

    fn try_from(raw: RawStageLadder) -> Result<Self> {
        Self::new(raw.stages, raw.high_stakes_stage)
    }
}

impl Default for StageLadder {
    /// CEFR `A0..C2`, high stakes from `B1`.
    fn default() -> Self {
        Self {
            stages: ["A0", "A1", "A2", "B1", "B2", "C1", "C2"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            high_stakes_stage: "B1".to_string(),
        }
    }
}

impl StageLadder {
    /// Build a ladder, lowest stage first.
    pub fn new<I, S>(stages: I, high_stakes_stage: impl Into<String>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ladder = Self {
            stages: stages.into_iter().map(Into::into).collect(),
            high_stakes_stage: high_stakes_stage.into(),
        };
        ladder.validate()?;
        Ok(ladder)
    }

    /// Reject empty ladders, repeated stages, and a threshold stage outside the ladder.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::InvalidConfig {
                message: "stage ladder must name at least one stage".to_string(),
            });
        }
        for (i, s) in self.stages.iter().enumerate() {
            if self.stages[..i].contains(s) {
                return Err(Error::InvalidConfig {
                    message: format!("stage {s:?} appears twice in the stage ladder"),
                });
            }
        }
        if !self.stages.contains(&self.high_stakes_stage) {
            return Err(Error::UnknownStage {
                stage: self.high_stakes_stage.clone(),
            });
        }
        Ok(())
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn high_stakes_stage(&self) -> &str {
        &self.high_stakes_stage
    }

    /// Position of `stage`; unknown stages rank as the lowest.
    pub fn rank(&self, stage: &str) -> usize {
        self.stages.iter().position(|s| s == stage).unwrap_or(0)
    }

    pub fn is_high_stakes(&self, stage: &str) -> bool {
        match self.stages.iter().position(|s| *s == self.high_stakes_stage) {
            Some(threshold) => self.rank(stage) >= threshold,
            None => false,
        }
    }
}

/// One retention window and the evidence it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct RetentionWindowSpec {
    pub window_days: u32,
    pub min_sample_size: u32,
}

/// Gate knobs.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct RetentionGateConfig {
    /// Minimum pass rate per window.
    pub pass_threshold: f64,
    pub windows: Vec<RetentionWindowSpec>,
    pub ladder: StageLadder,
}

impl Default for RetentionGateConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 0.7,
            windows: vec![
                RetentionWindowSpec {
                    window_days: 7,
                    min_sample_size: 3,
                },
                RetentionWindowSpec {
                    window_days: 30,
                    min_sample_size: 2,
                },
                RetentionWindowSpec {
                    window_days: 90,
                    min_sample_size: 1,
                },
            ],
            ladder: StageLadder::default(),
        }
    }
}

impl RetentionGateConfig {
    /// Copy with the threshold in `[0, 1]`, zero-day windows dropped, window lengths capped
    /// at [`RETENTION_LOOKBACK_DAYS`], and the default windows restored if none remain.
    pub fn sanitized(&self) -> Self {
        let d = Self::default();
        let windows: Vec<RetentionWindowSpec> = self
            .windows
            .iter()
            .filter(|w| w.window_days > 0)
            .map(|w| RetentionWindowSpec {
                window_days: w.window_days.min(MAX_WINDOW_DAYS),
                min_sample_size: w.min_sample_size,
            })
            .collect();
        Self {
            pass_threshold: if self.pass_threshold.is_finite() {
                self.pass_threshold.clamp(0.0, 1.0)
            } else {
                d.pass_threshold
            },
            windows: if windows.is_empty() { d.windows } else { windows },
            ladder: self.ladder.clone(),
        }
    }
}

/// One piece of direct skill evidence.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct RetentionEvidenceRow {
    pub learner_id: String,
    pub node_id: String,
    pub created_at: DateTime<Utc>,
    /// In `[0, 1]`.
    pub score: f64,
}

/// Pass-rate metric for one window.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct RetentionWindowMetric {
    pub window_days: u32,
    /// `None` when no anchor had a follow-up.
    pub value: Option<f64>,
    /// Anchors with a follow-up.
    pub sample_size: u32,
    pub passed_count: u32,
}

const MAX_WINDOW_DAYS: u32 = RETENTION_LOOKBACK_DAYS as u32;

/// Compute the retention pass rate for `window_days` as of `now`.
///
/// Windows longer than the lookback cannot pair any evidence and are measured as the
/// lookback itself.
pub fn retention_pass_rate(
    rows: &[RetentionEvidenceRow],
    window_days: u32,
    now: DateTime<Utc>,
) -> RetentionWindowMetric {
    let mut metric = RetentionWindowMetric {
        window_days,
        value: None,
        sample_size: 0,
        passed_count: 0,
    };
    let window = Duration::days(i64::from(window_days.min(MAX_WINDOW_DAYS)));
    let grace = Duration::days(RETENTION_GRACE_DAYS);
    let (Some(oldest), Some(latest_anchor)) = (
        now.checked_sub_signed(Duration::days(RETENTION_LOOKBACK_DAYS)),
        now.checked_sub_signed(window),
    ) else {
        return metric;
    };

    let mut groups: BTreeMap<(&str, &str), Vec<&RetentionEvidenceRow>> = BTreeMap::new();
    for r in rows.iter().filter(|r| r.created_at >= oldest) {
        groups
            .entry((r.learner_id.as_str(), r.node_id.as_str()))
            .or_default()
            .push(r);
    }

    let mut evaluated = 0u32;
    let mut passed = 0u32;
    for events in groups.values_mut() {
        events.sort_by_key(|r| r.created_at);
        for (i, anchor) in events.iter().enumerate() {
            let is_anchor =
                anchor.score >= RETENTION_PASS_SCORE && anchor.created_at <= latest_anchor;
            if !is_anchor {
                continue;
            }
            let Some(min_ts) = anchor.created_at.checked_add_signed(window) else {
                continue;
            };
            let max_ts = min_ts.checked_add_signed(grace).unwrap_or(DateTime::<Utc>::MAX_UTC);
            let follow_up = events[i + 1..]
                .iter()
                .find(|r| r.created_at >= min_ts)
                .filter(|r| r.created_at <= max_ts);
            if let Some(f) = follow_up {
                evaluated += 1;
                if f.score >= RETENTION_PASS_SCORE {
                    passed += 1;
                }
            }
        }
    }

    metric.value = (evaluated > 0).then(|| f64::from(passed) / f64::from(evaluated));
    metric.sample_size = evaluated;
    metric.passed_count = passed;
    metric
}

/// Classification of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RetentionGateStatus {
    Pass,
    Fail,
    InsufficientSample,
}

/// Gate verdict for one window.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct RetentionWindowResult {
    pub window_days: u32,
    pub value: Option<f64>,
    pub sample_size: u32,
    pub min_sample_size: u32,
    pub status: RetentionGateStatus,
    pub passed: bool,
}

impl RetentionWindowResult {
    fn blocker_reason(&self) -> String {
        match self.status {
            RetentionGateStatus::InsufficientSample => {
                format!("retention_{}d_insufficient_sample", self.window_days)
            }
            _ => format!("retention_{}d_below_threshold", self.window_days),
        }
    }
}

/// Output of [`evaluate_retention_gate`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct RetentionGateResult {
    pub protocol_version: String,
    pub target_stage: String,
    /// The gate applies to this target.
    pub required: bool,
    pub high_stakes_target: bool,
    pub pass_threshold: f64,
    pub windows: Vec<RetentionWindowResult>,
    /// Always true when not required.
    pub passed: bool,
    /// One entry per non-passing window; empty when not required.
    pub blocker_reasons: Vec<String>,
}

/// Evaluate the gate from pre-aggregated window metrics.
///
/// A configured window with no matching metric is treated as having no evidence.
pub fn evaluate_retention_gate(
    metrics: &[RetentionWindowMetric],
    target_stage: &str,
    cfg: &RetentionGateConfig,
) -> RetentionGateResult {
    let cfg = cfg.sanitized();
    let high_stakes_target = cfg.ladder.is_high_stakes(target_stage);
    let required = high_stakes_target;

    let windows: Vec<RetentionWindowResult> = cfg
        .windows
        .iter()
        .map(|spec| {
            let metric = metrics.iter().find(|m| m.window_days == spec.window_days);
            let value = metric.and_then(|m| m.value);
            let sample_size = metric.map_or(0, |m| m.sample_size);
            let status = if sample_size < spec.min_sample_size {
                RetentionGateStatus::InsufficientSample
            } else if value.map_or(true, |v| v < cfg.pass_threshold) {
                RetentionGateStatus::Fail
            } else {
                RetentionGateStatus::Pass
            };
            RetentionWindowResult {
                window_days: spec.window_days,
                value,
                sample_size,
                min_sample_size: spec.min_sample_size,
                status,
                passed: status == RetentionGateStatus::Pass,
            }
        })
        .collect();

    let blocker_reasons: Vec<String> = if required {
        windows
            .iter()
            .filter(|w| !w.passed)
            .map(RetentionWindowResult::blocker_reason)
            .collect()
    } else {
        Vec::new()
    };
    let passed = !required || blocker_reasons.is_empty();

    debug!(
        target_stage,
        required,
        passed,
        blockers = blocker_reasons.len(),
        "retention promotion gate"
    );

    RetentionGateResult {
        protocol_version: RETENTION_GATE_VERSION.to_string(),
        target_stage: target_stage.to_string(),
        required,
        high_stakes_target,
        pass_threshold: cfg.pass_threshold,
        windows,
        passed,
        blocker_reasons,
    }
}

/// Compute every configured window's metric from raw evidence, then evaluate the gate.
pub fn evaluate_retention_gate_from_rows(
    rows: &[RetentionEvidenceRow],
    target_stage: &str,
    now: DateTime<Utc>,
    cfg: &RetentionGateConfig,
) -> RetentionGateResult {
    let metrics: Vec<RetentionWindowMetric> = cfg
        .sanitized()
        .windows
        .iter()
        .map(|w| retention_pass_rate(rows, w.window_days, now))
        .collect();
    evaluate_retention_gate(&metrics, target_stage, cfg)
}
