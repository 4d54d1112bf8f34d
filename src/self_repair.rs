//! Self-repair budget guardrail.
//!
//! An immediate-retry loop is cheap for the learner but easy to overuse. Within a rolling
//! session window a skill gets at most `max_loops_per_skill_session` loops, and immediate
//! retries may take at most `max_session_time_share` of the projected session time.
//! Exhausting the budget only blocks immediate retries; delayed verification stays
//! allowed.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::{collapse_whitespace, round_to};

/// Protocol version stamped on every [`SelfRepairBudgetUsage`].
pub const SELF_REPAIR_BUDGET_VERSION: &str = "self-repair-budget-guardrails-v1";

/// Task mode marking an attempt as an immediate retry.
pub const IMMEDIATE_RETRY_MODE: &str = "immediate_retry";

/// Repair cycles with this status do not count against the loop cap.
pub const CANCELLED_CYCLE_STATUS: &str = "cancelled";

/// Task scores below this (0..100 scale) offer an immediate retry.
pub const IMMEDIATE_RETRY_SCORE_THRESHOLD: f64 = 70.0;

/// Budget caps.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct SelfRepairBudgetConfig {
    /// Rolling session window.
    pub window_minutes: u32,
    pub max_loops_per_skill_session: u32,
    /// Maximum projected share of session time spent in immediate retries.
    pub max_session_time_share: f64,
    /// Duration assumed for the next retry when the source attempt has none.
    pub estimated_immediate_duration_sec: f64,
}

impl Default for SelfRepairBudgetConfig {
    fn default() -> Self {
        Self {
            window_minutes: 90,
            max_loops_per_skill_session: 2,
            max_session_time_share: 0.25,
            estimated_immediate_duration_sec: 90.0,
        }
    }
}

impl SelfRepairBudgetConfig {
    pub fn sanitized(&self) -> Self {
        let d = Self::default();
        Self {
            window_minutes: self.window_minutes.max(1),
            max_loops_per_skill_session: self.max_loops_per_skill_session,
            max_session_time_share: if self.max_session_time_share.is_finite() {
                self.max_session_time_share.clamp(0.0, 1.0)
            } else {
                d.max_session_time_share
            },
            estimated_immediate_duration_sec: if self.estimated_immediate_duration_sec.is_finite() {
                self.estimated_immediate_duration_sec.max(0.0)
            } else {
                d.estimated_immediate_duration_sec
            },
        }
    }

    fn window(&self) -> Duration {
        Duration::minutes(i64::from(self.window_minutes))
    }
}

/// Aggregated usage inside the current session window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct SelfRepairStats {
    pub loops_used_for_skill_session: u32,
    pub session_total_duration_sec: f64,
    pub immediate_duration_sec: f64,
    pub estimated_immediate_duration_sec: f64,
}

/// Output of [`evaluate_self_repair_budget`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct SelfRepairBudgetUsage {
    pub version: String,
    pub window_minutes: u32,
    pub loops_used_for_skill_session: u32,
    pub max_loops_per_skill_session: u32,
    pub session_total_duration_sec: f64,
    pub immediate_duration_sec: f64,
    pub projected_immediate_duration_sec: f64,
    pub projected_session_duration_sec: f64,
    /// In `[0, 1]`, rounded to 6 decimals.
    pub projected_immediate_share: f64,
    pub max_session_time_share: f64,
    pub exhausted: bool,
    /// `per_skill_loop_cap` and/or `session_time_share_cap`.
    pub reasons: Vec<String>,
}

fn non_negative(x: f64) -> f64 {
    if x.is_finite() {
        x.max(0.0)
    } else {
        0.0
    }
}

/// Decide whether another immediate-retry loop fits the budget.
pub fn evaluate_self_repair_budget(
    stats: &SelfRepairStats,
    cfg: &SelfRepairBudgetConfig,
) -> SelfRepairBudgetUsage {
    let cfg = cfg.sanitized();
    let loops = stats.loops_used_for_skill_session;
    let session = non_negative(stats.session_total_duration_sec);
    let immediate = non_negative(stats.immediate_duration_sec);
    let estimate = non_negative(stats.estimated_immediate_duration_sec);

    let projected_immediate = immediate + estimate;
    let projected_session = session + estimate;
    let share = if projected_session > 0.0 {
        projected_immediate / projected_session
    } else {
        0.0
    };

    let mut reasons = Vec::new();
    if loops >= cfg.max_loops_per_skill_session {
        reasons.push("per_skill_loop_cap".to_string());
    }
    if share > cfg.max_session_time_share {
        reasons.push("session_time_share_cap".to_string());
    }
    let exhausted = !reasons.is_empty();

    debug!(
        loops,
        projected_share = share,
        exhausted,
        "self-repair budget evaluation"
    );

    SelfRepairBudgetUsage {
        version: SELF_REPAIR_BUDGET_VERSION.to_string(),
        window_minutes: cfg.window_minutes,
        loops_used_for_skill_session: loops,
        max_loops_per_skill_session: cfg.max_loops_per_skill_session,
        session_total_duration_sec: round_to(session, 2),
        immediate_duration_sec: round_to(immediate, 2),
        projected_immediate_duration_sec: round_to(projected_immediate, 2),
        projected_session_duration_sec: round_to(projected_session, 2),
        projected_immediate_share: round_to(share.clamp(0.0, 1.0), 6),
        max_session_time_share: cfg.max_session_time_share,
        exhausted,
        reasons,
    }
}

/// A self-repair cycle row, as fetched by the caller.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct RepairCycleRow {
    pub status: String,
    /// Task type (skill) of the attempt that opened the cycle.
    pub source_task_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An attempt row, as fetched by the caller.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct AttemptRow {
    pub duration_sec: Option<f64>,
    /// Self-repair mode of the attempt's task, e.g. `immediate_retry`.
    pub self_repair_mode: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One learner's recent rows plus the evaluation time.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct SelfRepairHistory {
    pub cycles: Vec<RepairCycleRow>,
    pub attempts: Vec<AttemptRow>,
    pub now: DateTime<Utc>,
}

/// Aggregate usage stats for `skill` over the session window ending at `history.now`.
///
/// - loops: non-cancelled cycles whose source task type equals `skill`.
/// - session total: sum of attempt durations (missing or non-finite count as 0).
/// - immediate: sum of durations of attempts in `immediate_retry` mode.
/// - estimate: `source_attempt_duration_sec`, else the configured default.
///
/// Rows created before `now - window` are ignored.
pub fn aggregate_self_repair_stats(
    history: &SelfRepairHistory,
    skill: &str,
    source_attempt_duration_sec: Option<f64>,
    cfg: &SelfRepairBudgetConfig,
) -> SelfRepairStats {
    let cfg = cfg.sanitized();
    let since = history.now - cfg.window();
    let skill = skill.trim();

    let loops = history
        .cycles
        .iter()
        .filter(|c| c.created_at >= since)
        .filter(|c| c.status != CANCELLED_CYCLE_STATUS)
        .filter(|c| c.source_task_type.as_deref().map(str::trim) == Some(skill))
        .count();

    let mut session_total = 0.0;
    let mut immediate = 0.0;
    for a in history.attempts.iter().filter(|a| a.created_at >= since) {
        let Some(d) = a.duration_sec.filter(|d| d.is_finite()) else {
            continue;
        };
        session_total += d;
        if a.self_repair_mode.as_deref() == Some(IMMEDIATE_RETRY_MODE) {
            immediate += d;
        }
    }

    SelfRepairStats {
        loops_used_for_skill_session: u32::try_from(loops).unwrap_or(u32::MAX),
        session_total_duration_sec: session_total,
        immediate_duration_sec: immediate,
        estimated_immediate_duration_sec: source_attempt_duration_sec
            .filter(|d| d.is_finite())
            .unwrap_or(cfg.estimated_immediate_duration_sec),
    }
}

/// Whether a just-scored attempt should open an immediate retry.
///
/// No for attempts that already are immediate retries, for `read_aloud` tasks, and for
/// unscored attempts. Otherwise yes when the score (clamped to `[0, 100]`) is below 70.
pub fn should_trigger_immediate_self_repair(
    task_type: &str,
    self_repair_mode: Option<&str>,
    task_score: Option<f64>,
) -> bool {
    if self_repair_mode.map(str::trim) == Some(IMMEDIATE_RETRY_MODE) {
        return false;
    }
    if task_type == "read_aloud" {
        return false;
    }
    match task_score.filter(|s| s.is_finite()) {
        Some(score) => score.clamp(0.0, 100.0) < IMMEDIATE_RETRY_SCORE_THRESHOLD,
        None => false,
    }
}

/// Learner-facing instruction for an immediate retry of `source_prompt`.
pub fn build_immediate_self_repair_prompt(
    source_prompt: &str,
    cause_label: Option<&str>,
    feedback_message: Option<&str>,
) -> String {
    let cause = cause_label
        .filter(|c| !c.is_empty())
        .map(|c| format!("Main issue: {c}."))
        .unwrap_or_default();
    let hint = match feedback_message.map(str::trim).filter(|m| !m.is_empty()) {
        Some(m) => format!("Fix hint: {m}"),
        None => "Fix the main mistake from the previous attempt.".to_string(),
    };
    collapse_whitespace(&format!(
        "Immediate self-repair retry. {cause} {hint} Repeat the same task with a corrected answer: {source_prompt}"
    ))
}
