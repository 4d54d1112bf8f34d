//! Off-policy evaluation of logged decisions (SNIPS).
//!
//! Logged [`Decision`]s carry the probability of the chosen action, which is what makes
//! them usable here. The evaluated target policy is the greedy one: always pick the
//! highest pre-action score. Each logged row gets importance weight `1 / propensity` when
//! the logged choice agrees with the target and `0` otherwise; the self-normalized
//! estimate is `sum(w * y) / sum(w)`.
//!
//! Fallback decisions are excluded: their propensity of `1` is not a sampling probability.

use std::collections::BTreeMap;

use tracing::debug;

use crate::{round_to, Decision};

/// Version stamped on every [`SnipsEstimate`].
pub const OPE_POLICY_VERSION: &str = "ope-snips-v1";

/// Quantiles of the bootstrap interval.
pub const OPE_CI_QUANTILES: (f64, f64) = (0.025, 0.975);

/// Why a logged decision cannot feed the estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum OpeExclusion {
    FallbackDecision,
    MissingChosenAction,
    MissingCandidateActionSet,
    MissingPreActionScores,
    InvalidPropensity,
    ChosenActionNotInCandidateSet,
    MissingChosenActionScore,
    MissingTargetAction,
    MissingOutcome,
}

/// One complete row for the estimator.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct OpeRow {
    pub chosen_action: String,
    pub target_action: String,
    /// In `(0, 1]`.
    pub propensity: f64,
    /// In `[0, 1]`.
    pub outcome: f64,
}

impl OpeRow {
    fn weight(&self) -> f64 {
        if self.chosen_action == self.target_action {
            1.0 / self.propensity
        } else {
            0.0
        }
    }
}

/// Greedy target action: highest finite pre-action score, action id ascending on ties.
pub fn target_action_for(decision: &Decision) -> Option<String> {
    decision
        .candidate_action_set
        .iter()
        .filter_map(|a| {
            decision
                .pre_action_scores
                .get(a)
                .filter(|s| s.is_finite())
                .map(|&s| (a, s))
        })
        .min_by(|x, y| y.1.total_cmp(&x.1).then_with(|| x.0.cmp(y.0)))
        .map(|(a, _)| a.clone())
}

/// Build an estimator row from a logged decision and its observed outcome.
///
/// `outcome` is clamped to `[0, 1]`; a missing or non-finite outcome excludes the row.
pub fn ope_row_from_decision(
    decision: &Decision,
    outcome: Option<f64>,
) -> std::result::Result<OpeRow, OpeExclusion> {
    if decision.fallback_applied {
        return Err(OpeExclusion::FallbackDecision);
    }
    let chosen = decision.chosen_action.trim();
    if chosen.is_empty() {
        return Err(OpeExclusion::MissingChosenAction);
    }
    if decision.candidate_action_set.is_empty() {
        return Err(OpeExclusion::MissingCandidateActionSet);
    }
    if decision.pre_action_scores.is_empty() {
        return Err(OpeExclusion::MissingPreActionScores);
    }
    let p = decision.propensity;
    if !p.is_finite() || p <= 0.0 || p > 1.0 {
        return Err(OpeExclusion::InvalidPropensity);
    }
    if !decision.candidate_action_set.iter().any(|a| a == chosen) {
        return Err(OpeExclusion::ChosenActionNotInCandidateSet);
    }
    if !decision
        .pre_action_scores
        .get(chosen)
        .is_some_and(|s| s.is_finite())
    {
        return Err(OpeExclusion::MissingChosenActionScore);
    }
    let target = target_action_for(decision).ok_or(OpeExclusion::MissingTargetAction)?;
    let outcome = outcome
        .filter(|y| y.is_finite())
        .ok_or(OpeExclusion::MissingOutcome)?;
    Ok(OpeRow {
        chosen_action: chosen.to_string(),
        target_action: target,
        propensity: p,
        outcome: outcome.clamp(0.0, 1.0),
    })
}

/// Output of [`snips_estimate`]. Values are rounded to 6 decimals.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct SnipsEstimate {
    pub policy_version: String,
    pub sample_size: usize,
    /// Mean logged outcome.
    pub baseline_value: Option<f64>,
    /// SNIPS value of the greedy target policy.
    pub target_policy_value: Option<f64>,
    /// `target_policy_value - baseline_value`.
    pub lift: Option<f64>,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
    /// `(sum w)^2 / sum w^2`.
    pub effective_sample_size: Option<f64>,
    /// Share of rows whose logged choice equals the target action.
    pub target_match_rate: Option<f64>,
    /// Bootstrap resamples with at least one matched row.
    pub valid_bootstrap_samples: usize,
}

fn mean(xs: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = xs.fold((0.0, 0usize), |(s, n), x| (s + x, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// SNIPS value minus mean outcome; `None` when no row matches the target.
fn snips_lift<'a>(rows: impl Iterator<Item = &'a OpeRow> + Clone) -> Option<f64> {
    let baseline = mean(rows.clone().map(|r| r.outcome))?;
    let (num, den) = rows.fold((0.0, 0.0), |(num, den), r| {
        let w = r.weight();
        (num + w * r.outcome, den + w)
    });
    (den > 0.0).then(|| num / den - baseline)
}

/// Linear-interpolated quantile of `sorted`.
fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = (sorted.len() - 1) as f64 * q;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64))
}

#[cfg(feature = "stochastic")]
fn bootstrap_lifts(rows: &[OpeRow], samples: usize, seed: u64) -> Vec<f64> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Vec::with_capacity(samples);
    for _ in 0..samples {
        let idx: Vec<usize> = (0..rows.len())
            .map(|_| rng.random_range(0..rows.len()))
            .collect();
        if let Some(l) = snips_lift(idx.iter().map(|&i| &rows[i])) {
            out.push(l);
        }
    }
    out
}

#[cfg(not(feature = "stochastic"))]
fn bootstrap_lifts(_rows: &[OpeRow], _samples: usize, _seed: u64) -> Vec<f64> {
    Vec::new()
}

/// SNIPS estimate of the greedy policy with a percentile bootstrap interval.
///
/// The interval needs feature `stochastic` and `bootstrap_samples > 0`; otherwise the
/// bounds are `None`. Resamples are drawn from a `StdRng` seeded with `seed`.
pub fn snips_estimate(rows: &[OpeRow], bootstrap_samples: usize, seed: u64) -> SnipsEstimate {
    let r6 = |x: Option<f64>| x.map(|v| round_to(v, 6));
    let baseline = mean(rows.iter().map(|r| r.outcome));

    let mut num = 0.0;
    let mut den = 0.0;
    let mut den_sq = 0.0;
    let mut matched = 0usize;
    for r in rows {
        let w = r.weight();
        if w > 0.0 {
            matched += 1;
        }
        num += w * r.outcome;
        den += w;
        den_sq += w * w;
    }
    let target_value = (den > 0.0).then(|| num / den);
    let lift = target_value.zip(baseline).map(|(t, b)| t - b);
    let ess = (den > 0.0 && den_sq > 0.0).then(|| den * den / den_sq);
    let match_rate = (!rows.is_empty()).then(|| matched as f64 / rows.len() as f64);

    let mut lifts = if lift.is_some() && bootstrap_samples > 0 {
        bootstrap_lifts(rows, bootstrap_samples, seed)
    } else {
        Vec::new()
    };
    lifts.sort_by(f64::total_cmp);

    debug!(
        rows = rows.len(),
        matched,
        lift = lift.unwrap_or(f64::NAN),
        bootstrap = lifts.len(),
        "snips estimate"
    );

    SnipsEstimate {
        policy_version: OPE_POLICY_VERSION.to_string(),
        sample_size: rows.len(),
        baseline_value: r6(baseline),
        target_policy_value: r6(target_value),
        lift: r6(lift),
        ci_lower: r6(quantile(&lifts, OPE_CI_QUANTILES.0)),
        ci_upper: r6(quantile(&lifts, OPE_CI_QUANTILES.1)),
        effective_sample_size: r6(ess),
        target_match_rate: r6(match_rate),
        valid_bootstrap_samples: lifts.len(),
    }
}

/// Estimate plus bookkeeping over a batch of logged decisions.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct OpeReport {
    pub total_rows: usize,
    pub complete_rows: usize,
    /// `(total - complete) / total`, `0` for an empty batch.
    pub incomplete_rate: f64,
    pub exclusion_counts: BTreeMap<OpeExclusion, usize>,
    pub policy_version_counts: BTreeMap<String, usize>,
    pub estimate: SnipsEstimate,
}

/// Turn `(decision, outcome)` pairs into rows, count exclusions, and estimate.
pub fn evaluate_logged_decisions(
    logged: &[(Decision, Option<f64>)],
    bootstrap_samples: usize,
    seed: u64,
) -> OpeReport {
    let mut exclusion_counts = BTreeMap::new();
    let mut policy_version_counts = BTreeMap::new();
    let mut rows = Vec::new();
    for (decision, outcome) in logged {
        *policy_version_counts
            .entry(decision.policy_version.clone())
            .or_insert(0) += 1;
        match ope_row_from_decision(decision, *outcome) {
            Ok(row) => rows.push(row),
            Err(reason) => *exclusion_counts.entry(reason).or_insert(0) += 1,
        }
    }
    let total = logged.len();
    let complete = rows.len();
    OpeReport {
        total_rows: total,
        complete_rows: complete,
        incomplete_rate: if total > 0 {
            round_to((total - complete) as f64 / total as f64, 6)
        } else {
            0.0
        },
        exclusion_counts,
        policy_version_counts,
        estimate: snips_estimate(&rows, bootstrap_samples, seed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{select_hybrid, Candidate, SelectorConfig};

    fn row(chosen: &str, target: &str, p: f64, y: f64) -> OpeRow {
        OpeRow {
            chosen_action: chosen.into(),
            target_action: target.into(),
            propensity: p,
            outcome: y,
        }
    }

    fn decision() -> Decision {
        select_hybrid(
            &[
                Candidate::new("qa_prompt", 0.8, 1.1),
                Candidate::new("role_play", 0.6, 0.4),
            ],
            &SelectorConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn target_is_highest_score() {
        assert_eq!(target_action_for(&decision()).as_deref(), Some("qa_prompt"));
    }

    #[test]
    fn rows_from_decisions() {
        let d = decision();
        let r = ope_row_from_decision(&d, Some(1.4)).unwrap();
        assert_eq!(r.chosen_action, "qa_prompt");
        assert_eq!(r.target_action, "qa_prompt");
        assert_eq!(r.outcome, 1.0);
        assert_eq!(r.propensity, d.propensity);

        assert_eq!(
            ope_row_from_decision(&d, None),
            Err(OpeExclusion::MissingOutcome)
        );

        let mut bad = d.clone();
        bad.propensity = 0.0;
        assert_eq!(
            ope_row_from_decision(&bad, Some(0.5)),
            Err(OpeExclusion::InvalidPropensity)
        );

        let mut stray = d.clone();
        stray.chosen_action = "speech_builder".into();
        assert_eq!(
            ope_row_from_decision(&stray, Some(0.5)),
            Err(OpeExclusion::ChosenActionNotInCandidateSet)
        );
    }

    #[test]
    fn fallback_rows_are_excluded() {
        let d = select_hybrid(
            &[Candidate::new("qa_prompt", 1.0, 1.0).blocked_by("sla")],
            &SelectorConfig::default(),
        )
        .unwrap();
        assert_eq!(
            ope_row_from_decision(&d, Some(0.5)),
            Err(OpeExclusion::FallbackDecision)
        );
    }

    #[test]
    fn snips_matches_hand_computation() {
        let rows = vec![
            row("a", "a", 0.5, 1.0),
            row("a", "a", 0.25, 0.0),
            row("b", "a", 0.5, 0.5),
        ];
        let e = snips_estimate(&rows, 0, 0);
        // w = [2, 4, 0]; value = 2 / 6; baseline = 0.5.
        assert_eq!(e.target_policy_value, Some(0.333333));
        assert_eq!(e.baseline_value, Some(0.5));
        assert_eq!(e.lift, Some(-0.166667));
        // ess = 36 / 20
        assert_eq!(e.effective_sample_size, Some(1.8));
        assert_eq!(e.target_match_rate, Some(0.666667));
        assert_eq!(e.ci_lower, None);
        assert_eq!(e.valid_bootstrap_samples, 0);
    }

    #[test]
    fn no_matches_means_no_value() {
        let e = snips_estimate(&[row("b", "a", 0.5, 1.0)], 100, 7);
        assert_eq!(e.target_policy_value, None);
        assert_eq!(e.lift, None);
        assert_eq!(e.effective_sample_size, None);
        assert_eq!(e.ci_upper, None);
    }

    #[test]
    fn empty_input() {
        let e = snips_estimate(&[], 100, 7);
        assert_eq!(e.baseline_value, None);
        assert_eq!(e.target_match_rate, None);
        assert_eq!(e.sample_size, 0);
    }

    #[test]
    fn quantile_interpolates() {
        let xs = [0.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&xs, 0.5), Some(2.0));
        assert_eq!(quantile(&xs, 0.125), Some(0.5));
        assert_eq!(quantile(&[], 0.5), None);
    }

    #[cfg(feature = "stochastic")]
    #[test]
    fn bootstrap_interval_brackets_lift_and_replays() {
        let rows: Vec<OpeRow> = (0..40)
            .map(|i| {
                let matched = i % 2 == 0;
                row(
                    if matched { "a" } else { "b" },
                    "a",
                    0.6,
                    if i % 3 == 0 { 1.0 } else { 0.4 },
                )
            })
            .collect();
        let e1 = snips_estimate(&rows, 300, 20260218);
        let e2 = snips_estimate(&rows, 300, 20260218);
        assert_eq!(e1, e2);
        let (lo, hi) = (e1.ci_lower.unwrap(), e1.ci_upper.unwrap());
        assert!(lo <= hi);
        assert!(e1.valid_bootstrap_samples > 250);
    }

    #[test]
    fn report_counts_exclusions() {
        let d = decision();
        let mut fb = select_hybrid(
            &[Candidate::new("x", 0.0, 0.0).blocked_by("sla")],
            &SelectorConfig::default(),
        )
        .unwrap();
        fb.policy_version = "policy-old".into();
        let report = evaluate_logged_decisions(
            &[(d.clone(), Some(0.8)), (d, None), (fb, Some(0.1))],
            0,
            1,
        );
        assert_eq!(report.total_rows, 3);
        assert_eq!(report.complete_rows, 1);
        assert_eq!(report.exclusion_counts[&OpeExclusion::MissingOutcome], 1);
        assert_eq!(report.exclusion_counts[&OpeExclusion::FallbackDecision], 1);
        assert_eq!(report.policy_version_counts["policy-old"], 1);
        assert_eq!(report.incomplete_rate, 0.666667);
    }
}
