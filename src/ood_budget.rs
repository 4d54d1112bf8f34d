//! Out-of-distribution probe budget.
//!
//! Every `interval`-th task of a learner is replaced by an OOD transfer probe. The target
//! rate starts at a base and rises under milestone pressure or when recent probes suggest
//! the learner is overfitting to familiar formats. The rate stays inside
//! `[min_rate, max_rate]` and the cadence inside `[min_interval, max_interval]`.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{round_to, FastLaneDecision};

/// Protocol version stamped on every [`OodBudgetDecision`].
pub const OOD_BUDGET_CONTROLLER_VERSION: &str = "ood-budget-controller-v1";

/// Why the planner picked the current task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SelectionReason {
    Weakness,
    Overdue,
    Uncertainty,
    Verification,
}

/// Classified outcome of one OOD probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum OodVerdict {
    Pass,
    Fail,
    Inconclusive,
    Unknown,
}

impl OodVerdict {
    /// Pass or fail; inconclusive and unknown probes carry no transfer evidence.
    pub fn is_evaluated(self) -> bool {
        matches!(self, OodVerdict::Pass | OodVerdict::Fail)
    }
}

/// Classify a free-form verdict string.
///
/// Case-insensitive substring match, checked in order: `pass` or `success` → pass,
/// `fail` → fail, `inconclusive` → inconclusive. Missing, blank, and anything else →
/// unknown.
pub fn normalize_verdict(verdict: Option<&str>) -> OodVerdict {
    let Some(raw) = verdict else {
        return OodVerdict::Unknown;
    };
    let v = raw.trim().to_lowercase();
    if v.is_empty() {
        OodVerdict::Unknown
    } else if v.contains("pass") || v.contains("success") {
        OodVerdict::Pass
    } else if v.contains("fail") {
        OodVerdict::Fail
    } else if v.contains("inconclusive") {
        OodVerdict::Inconclusive
    } else {
        OodVerdict::Unknown
    }
}

/// One past OOD probe, as stored by the caller.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct OodSignal {
    pub verdict: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl OodSignal {
    pub fn new(verdict: Option<&str>, created_at: DateTime<Utc>) -> Self {
        Self {
            verdict: verdict.map(str::to_string),
            status: "evaluated".to_string(),
            created_at,
        }
    }
}

/// Inputs for one budget decision.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct OodBudgetInput {
    /// 1-based position of the upcoming task in the learner's sequence.
    pub task_ordinal: u64,
    pub selection_reason: SelectionReason,
    #[cfg_attr(feature = "serde", serde(default))]
    pub primary_goal: Option<String>,
    /// Recent probes, most recent first.
    #[cfg_attr(feature = "serde", serde(default))]
    pub recent_signals: Vec<OodSignal>,
    /// Current fast-lane decision, if the caller evaluated one.
    #[cfg_attr(feature = "serde", serde(default))]
    pub fast_lane: Option<FastLaneDecision>,
}

impl OodBudgetInput {
    pub fn new(task_ordinal: u64, selection_reason: SelectionReason) -> Self {
        Self {
            task_ordinal,
            selection_reason,
            primary_goal: None,
            recent_signals: Vec::new(),
            fast_lane: None,
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.primary_goal = Some(goal.into());
        self
    }

    pub fn with_signals(mut self, signals: Vec<OodSignal>) -> Self {
        self.recent_signals = signals;
        self
    }

    pub fn with_fast_lane(mut self, decision: FastLaneDecision) -> Self {
        self.fast_lane = Some(decision);
        self
    }
}

/// Budget controller knobs.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct OodBudgetConfig {
    pub base_rate: f64,
    pub min_rate: f64,
    pub max_rate: f64,
    /// Added under milestone pressure.
    pub milestone_boost: f64,
    /// Added under overfit risk.
    pub overfit_boost: f64,
    pub min_interval: u32,
    pub max_interval: u32,
    /// Overfit risk needs at least this many pass/fail probes when judged by pass rate.
    pub overfit_min_evaluated: u32,
    /// Pass rate strictly below this signals overfit risk.
    pub overfit_pass_rate: f64,
    /// This many leading fails signals overfit risk on its own.
    pub overfit_fail_streak: u32,
}

impl Default for OodBudgetConfig {
    fn default() -> Self {
        Self {
            base_rate: 0.14,
            min_rate: 0.10,
            max_rate: 0.20,
            milestone_boost: 0.03,
            overfit_boost: 0.03,
            min_interval: 5,
            max_interval: 10,
            overfit_min_evaluated: 3,
            overfit_pass_rate: 0.5,
            overfit_fail_streak: 2,
        }
    }
}

impl OodBudgetConfig {
    /// Copy with rates in `(0, 1]`, `min <= max` for both rates and intervals, and
    /// non-negative boosts.
    pub fn sanitized(&self) -> Self {
        let d = Self::default();
        let rate = |x: f64, fallback: f64| {
            if x.is_finite() && x > 0.0 {
                x.min(1.0)
            } else {
                fallback
            }
        };
        let boost = |x: f64, fallback: f64| {
            if x.is_finite() {
                x.max(0.0)
            } else {
                fallback
            }
        };
        let mut min_rate = rate(self.min_rate, d.min_rate);
        let mut max_rate = rate(self.max_rate, d.max_rate);
        if min_rate > max_rate {
            std::mem::swap(&mut min_rate, &mut max_rate);
        }
        let min_interval = self.min_interval.max(1);
        let max_interval = self.max_interval.max(min_interval);
        Self {
            base_rate: rate(self.base_rate, d.base_rate).clamp(min_rate, max_rate),
            min_rate,
            max_rate,
            milestone_boost: boost(self.milestone_boost, d.milestone_boost),
            overfit_boost: boost(self.overfit_boost, d.overfit_boost),
            min_interval,
            max_interval,
            overfit_min_evaluated: self.overfit_min_evaluated,
            overfit_pass_rate: if self.overfit_pass_rate.is_finite() {
                self.overfit_pass_rate.clamp(0.0, 1.0)
            } else {
                d.overfit_pass_rate
            },
            overfit_fail_streak: self.overfit_fail_streak.max(1),
        }
    }
}

/// Verdict counts over the supplied signals.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct RecentOodStats {
    /// `pass_count + fail_count`.
    pub evaluated_ood_count: u32,
    pub pass_count: u32,
    pub fail_count: u32,
    pub inconclusive_count: u32,
    /// Rounded to 4 decimals; `None` when nothing was evaluated.
    pub pass_rate: Option<f64>,
    /// Number of consecutive fails at the head of the list.
    pub fail_streak: u32,
}

impl RecentOodStats {
    /// Count verdicts. `signals` must be most recent first.
    pub fn from_signals(signals: &[OodSignal]) -> Self {
        let verdicts: Vec<OodVerdict> = signals
            .iter()
            .map(|s| normalize_verdict(s.verdict.as_deref()))
            .collect();
        let count = |v: OodVerdict| verdicts.iter().filter(|&&x| x == v).count() as u32;
        let pass_count = count(OodVerdict::Pass);
        let fail_count = count(OodVerdict::Fail);
        let evaluated = pass_count + fail_count;
        let fail_streak = verdicts
            .iter()
            .take_while(|&&v| v == OodVerdict::Fail)
            .count() as u32;
        Self {
            evaluated_ood_count: evaluated,
            pass_count,
            fail_count,
            inconclusive_count: count(OodVerdict::Inconclusive),
            pass_rate: (evaluated > 0).then(|| f64::from(pass_count) / f64::from(evaluated)),
            fail_streak,
        }
    }
}

/// Output of [`compute_ood_budget`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct OodBudgetDecision {
    pub controller_version: String,
    pub task_ordinal: u64,
    /// Target probe rate, rounded to 4 decimals.
    pub budget_rate: f64,
    /// `clamp(round(1 / budget_rate), min_interval, max_interval)`.
    pub interval: u32,
    /// `task_ordinal > 0 && task_ordinal % interval == 0`.
    pub should_inject: bool,
    pub milestone_pressure: bool,
    pub overfit_risk: bool,
    pub fast_lane_applied: bool,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none", default))]
    pub fast_lane_protocol_version: Option<String>,
    /// `base`, then `milestone_pressure`, `overfit_risk`, `fast_lane` as applicable.
    pub reasons: Vec<String>,
    pub recent_stats: RecentOodStats,
}

fn milestone_pressure(reason: SelectionReason, goal: Option<&str>) -> bool {
    if reason == SelectionReason::Verification {
        return true;
    }
    let goal = goal.unwrap_or_default().to_lowercase();
    ["milestone", "promotion", "verify"]
        .iter()
        .any(|k| goal.contains(k))
}

/// Decide the OOD probe rate and whether the upcoming task is a probe.
///
/// Both boosts apply whenever both conditions hold, even if the first already reaches
/// `max_rate`; `reasons` records every condition that held.
pub fn compute_ood_budget(input: &OodBudgetInput, cfg: &OodBudgetConfig) -> OodBudgetDecision {
    let cfg = cfg.sanitized();
    let mut stats = RecentOodStats::from_signals(&input.recent_signals);

    let milestone_pressure = milestone_pressure(input.selection_reason, input.primary_goal.as_deref());
    let overfit_by_rate = stats.evaluated_ood_count >= cfg.overfit_min_evaluated
        && stats.pass_rate.is_some_and(|r| r < cfg.overfit_pass_rate);
    let overfit_risk = overfit_by_rate || stats.fail_streak >= cfg.overfit_fail_streak;

    let mut reasons = vec!["base".to_string()];
    let mut rate = cfg.base_rate;
    if milestone_pressure {
        rate += cfg.milestone_boost;
        reasons.push("milestone_pressure".to_string());
    }
    if overfit_risk {
        rate += cfg.overfit_boost;
        reasons.push("overfit_risk".to_string());
    }
    let fast_lane = input.fast_lane.as_ref().filter(|f| f.eligible);
    if let Some(f) = fast_lane {
        rate += f.ood_budget_rate_delta;
        reasons.push("fast_lane".to_string());
    }

    let rate = rate.clamp(cfg.min_rate, cfg.max_rate);
    let interval = ((1.0 / rate).round() as u32).clamp(cfg.min_interval, cfg.max_interval);
    let should_inject = input.task_ordinal > 0 && input.task_ordinal % u64::from(interval) == 0;

    stats.pass_rate = stats.pass_rate.map(|r| round_to(r, 4));

    debug!(
        task_ordinal = input.task_ordinal,
        budget_rate = rate,
        interval,
        should_inject,
        milestone_pressure,
        overfit_risk,
        "ood budget decision"
    );

    OodBudgetDecision {
        controller_version: OOD_BUDGET_CONTROLLER_VERSION.to_string(),
        task_ordinal: input.task_ordinal,
        budget_rate: round_to(rate, 4),
        interval,
        should_inject,
        milestone_pressure,
        overfit_risk,
        fast_lane_applied: fast_lane.is_some(),
        fast_lane_protocol_version: fast_lane.map(|f| f.protocol_version.clone()),
        reasons,
        recent_stats: stats,
    }
}
