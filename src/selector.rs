//! Hybrid guardrailed selector.
//!
//! Blends a rule utility with a learned value, removes hard-constrained actions, and
//! turns the remaining scores into a floored softmax distribution. The returned
//! [`Decision`] carries the full distribution so every choice has a known propensity.
//!
//! Semantics:
//! - Candidates whose `hard_constraint_reasons` contain any non-blank entry are blocked.
//! - If every candidate is blocked, the highest `rule_utility` candidate is chosen
//!   (action id ascending on ties) with propensity `1.0` and `fallback_applied = true`.
//! - Otherwise `score = rule_utility * rule_weight + learned_value * learned_weight`,
//!   rounded to [`SCORE_DECIMALS`] so that ties are exact and replayable.
//! - `candidate_action_set` is ordered by score descending, then action id ascending.
//! - `p(a) = floor + (1 - floor * n) * softmax(score / temperature)(a)`.
//! - The chosen action has the highest `p`; ties go to the higher score, then the
//!   smaller action id.
//!
//! - A repeated action id keeps its first occurrence; later ones are ignored and
//!   [`CONSTRAINT_DUPLICATE_IGNORED`] is added to `active_constraints`.
//!
//! Only an empty candidate list is an error; every knob is clamped.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::{
    apply_exploration_floor, clamp_temperature, round_to, softmax_actions, Candidate, Decision,
    Error, Result, SelectionMode, CONSTRAINT_DUPLICATE_IGNORED, CONSTRAINT_EXPLORATION_FLOOR,
    CONSTRAINT_FALLBACK, CONSTRAINT_HARD_ENFORCED,
};

/// Protocol version stamped on every [`Decision`] by default.
pub const SELECTOR_POLICY_VERSION: &str = "policy-hybrid-guardrailed-v1";

/// Scores are rounded to this many decimals before ordering and softmax.
pub const SCORE_DECIMALS: u32 = 6;

/// Probabilities closer than this are treated as tied when picking the chosen action.
pub const PROPENSITY_TIE_EPS: f64 = 1e-12;

/// Tuning knobs for [`select_hybrid`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct SelectorConfig {
    /// Version string copied into each decision.
    pub policy_version: String,
    /// Weight on `rule_utility` (renormalized with `learned_weight`).
    pub rule_weight: f64,
    /// Weight on `learned_value` (renormalized with `rule_weight`).
    pub learned_weight: f64,
    /// Minimum probability per feasible action; clamped to `[0, 1/n]` per call.
    pub exploration_floor: f64,
    /// Softmax temperature; clamped to `[0.05, 5]`.
    pub temperature: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            policy_version: SELECTOR_POLICY_VERSION.to_string(),
            rule_weight: 0.45,
            learned_weight: 0.55,
            exploration_floor: 0.08,
            temperature: 0.7,
        }
    }
}

impl SelectorConfig {
    /// Override the exploration floor.
    pub fn with_exploration_floor(mut self, floor: f64) -> Self {
        self.exploration_floor = floor;
        self
    }

    /// Override the softmax temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Override both blend weights.
    pub fn with_weights(mut self, rule_weight: f64, learned_weight: f64) -> Self {
        self.rule_weight = rule_weight;
        self.learned_weight = learned_weight;
        self
    }

    /// Copy with every knob forced into its valid range.
    ///
    /// Weights are renormalized to sum to 1; the floor is clamped to `[0, 1]` here and to
    /// `[0, 1/n]` at selection time.
    pub fn sanitized(&self) -> Self {
        let defaults = Self::default();
        let (rule_weight, learned_weight) = normalize_weights(self.rule_weight, self.learned_weight);
        let floor = if self.exploration_floor.is_finite() {
            self.exploration_floor.clamp(0.0, 1.0)
        } else {
            defaults.exploration_floor
        };
        let policy_version = if self.policy_version.trim().is_empty() {
            defaults.policy_version
        } else {
            self.policy_version.clone()
        };
        Self {
            policy_version,
            rule_weight,
            learned_weight,
            exploration_floor: floor,
            temperature: clamp_temperature(self.temperature, defaults.temperature),
        }
    }
}

/// Normalize a weight pair so it sums to 1.
///
/// Non-finite weights take their default, negative weights count as zero, and a pair that
/// sums to zero becomes `(0.5, 0.5)`.
pub fn normalize_weights(rule_weight: f64, learned_weight: f64) -> (f64, f64) {
    let defaults = SelectorConfig::default();
    let rule = if rule_weight.is_finite() {
        rule_weight.max(0.0)
    } else {
        defaults.rule_weight
    };
    let learned = if learned_weight.is_finite() {
        learned_weight.max(0.0)
    } else {
        defaults.learned_weight
    };
    let sum = rule + learned;
    if sum <= 0.0 {
        return (0.5, 0.5);
    }
    (rule / sum, learned / sum)
}

fn finite_or_zero(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

fn push_unique(out: &mut Vec<String>, item: &str) {
    if !out.iter().any(|x| x == item) {
        out.push(item.to_string());
    }
}

/// Order by score descending, then id ascending. Scores are already rounded.
fn score_order(a: (&str, f64), b: (&str, f64)) -> std::cmp::Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0))
}

/// Deterministic hybrid selection. See the module docs for semantics.
///
/// # Example
///
/// ```rust
/// use coachgate::{select_hybrid, Candidate, SelectorConfig};
///
/// let candidates = vec![
///     Candidate::new("speech_builder", 0.9, 1.8).blocked_by("verification_sla"),
///     Candidate::new("qa_prompt", 0.8, 1.1),
///     Candidate::new("target_vocab", 0.7, 0.9),
/// ];
/// let d = select_hybrid(&candidates, &SelectorConfig::default()).unwrap();
/// assert_eq!(d.chosen_action, "qa_prompt");
/// assert!(d.blocked_actions.contains(&"speech_builder".to_string()));
/// ```
pub fn select_hybrid(candidates: &[Candidate], cfg: &SelectorConfig) -> Result<Decision> {
    if candidates.is_empty() {
        return Err(Error::EmptyCandidates);
    }
    let candidates_len = candidates.len();
    let mut seen = BTreeSet::new();
    let candidates: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| seen.insert(c.action_id.as_str()))
        .collect();
    let duplicates_ignored = seen.len() < candidates_len;

    let cfg = cfg.sanitized();

    let mut constraint_mask: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut active_constraints: Vec<String> = Vec::new();
    for c in &candidates {
        let mut reasons: Vec<String> = Vec::new();
        for r in &c.hard_constraint_reasons {
            let r = r.trim();
            if !r.is_empty() {
                push_unique(&mut reasons, r);
                push_unique(&mut active_constraints, r);
            }
        }
        constraint_mask.insert(c.action_id.clone(), reasons);
    }
    if duplicates_ignored {
        debug!(
            ignored = candidates_len - candidates.len(),
            "duplicate candidate action ids ignored"
        );
        push_unique(&mut active_constraints, CONSTRAINT_DUPLICATE_IGNORED);
    }

    let is_blocked = |c: &Candidate| {
        constraint_mask
            .get(&c.action_id)
            .is_some_and(|reasons| !reasons.is_empty())
    };
    let blocked_actions: Vec<String> = candidates
        .iter()
        .filter(|c| is_blocked(**c))
        .map(|c| c.action_id.clone())
        .collect();
    let feasible: Vec<&Candidate> = candidates
        .iter()
        .copied()
        .filter(|c| !is_blocked(*c))
        .collect();

    if feasible.is_empty() {
        return Ok(fallback_decision(
            &candidates,
            &cfg,
            constraint_mask,
            active_constraints,
            blocked_actions,
        ));
    }

    let mut pre_action_scores: BTreeMap<String, f64> = BTreeMap::new();
    for c in &feasible {
        let score = finite_or_zero(c.rule_utility) * cfg.rule_weight
            + finite_or_zero(c.learned_value) * cfg.learned_weight;
        pre_action_scores.insert(c.action_id.clone(), round_to(score, SCORE_DECIMALS));
    }

    let mut candidate_action_set: Vec<String> =
        feasible.iter().map(|c| c.action_id.clone()).collect();
    candidate_action_set.sort_by(|a, b| {
        score_order(
            (a.as_str(), pre_action_scores[a]),
            (b.as_str(), pre_action_scores[b]),
        )
    });

    let base = softmax_actions(&candidate_action_set, &pre_action_scores, cfg.temperature);
    let propensity_by_action =
        apply_exploration_floor(&candidate_action_set, &base, cfg.exploration_floor);

    let chosen_action = argmax_action(&candidate_action_set, &propensity_by_action, &pre_action_scores);
    let propensity = propensity_by_action
        .get(&chosen_action)
        .copied()
        .unwrap_or(0.0);

    push_unique(&mut active_constraints, CONSTRAINT_HARD_ENFORCED);
    push_unique(&mut active_constraints, CONSTRAINT_EXPLORATION_FLOOR);

    debug!(
        chosen = %chosen_action,
        propensity,
        feasible = candidate_action_set.len(),
        blocked = blocked_actions.len(),
        policy_version = %cfg.policy_version,
        "hybrid selection"
    );

    Ok(Decision {
        policy_version: cfg.policy_version.clone(),
        chosen_action,
        propensity,
        selection_mode: SelectionMode::DeterministicChoice,
        candidate_action_set,
        pre_action_scores,
        propensity_by_action,
        constraint_mask,
        active_constraints,
        blocked_actions,
        exploration_floor: cfg.exploration_floor,
        temperature: cfg.temperature,
        rule_weight: round_to(cfg.rule_weight, SCORE_DECIMALS),
        learned_weight: round_to(cfg.learned_weight, SCORE_DECIMALS),
        fallback_applied: false,
    })
}

fn argmax_action(
    ordered: &[String],
    probs: &BTreeMap<String, f64>,
    scores: &BTreeMap<String, f64>,
) -> String {
    let mut best = &ordered[0];
    for a in &ordered[1..] {
        let p_best = probs.get(best).copied().unwrap_or(0.0);
        let p_next = probs.get(a).copied().unwrap_or(0.0);
        if p_next > p_best + PROPENSITY_TIE_EPS {
            best = a;
            continue;
        }
        if (p_next - p_best).abs() <= PROPENSITY_TIE_EPS {
            let s_best = scores.get(best).copied().unwrap_or(f64::NEG_INFINITY);
            let s_next = scores.get(a).copied().unwrap_or(f64::NEG_INFINITY);
            if s_next > s_best || (s_next == s_best && a < best) {
                best = a;
            }
        }
    }
    best.clone()
}

fn fallback_decision(
    candidates: &[&Candidate],
    cfg: &SelectorConfig,
    constraint_mask: BTreeMap<String, Vec<String>>,
    mut active_constraints: Vec<String>,
    blocked_actions: Vec<String>,
) -> Decision {
    let mut ranked: Vec<(&str, f64)> = candidates
        .iter()
        .map(|c| {
            (
                c.action_id.as_str(),
                round_to(finite_or_zero(c.rule_utility), SCORE_DECIMALS),
            )
        })
        .collect();
    ranked.sort_by(|a, b| score_order(*a, *b));
    // Non-empty: the caller rejected empty input.
    let (chosen, utility) = ranked[0];
    let chosen = chosen.to_string();

    push_unique(&mut active_constraints, CONSTRAINT_FALLBACK);

    debug!(
        chosen = %chosen,
        blocked = blocked_actions.len(),
        "hybrid selection fell back: every candidate is hard-constrained"
    );

    Decision {
        policy_version: cfg.policy_version.clone(),
        chosen_action: chosen.clone(),
        propensity: 1.0,
        selection_mode: SelectionMode::HardConstraintFallback,
        candidate_action_set: vec![chosen.clone()],
        pre_action_scores: BTreeMap::from([(chosen.clone(), utility)]),
        propensity_by_action: BTreeMap::from([(chosen, 1.0)]),
        constraint_mask,
        active_constraints,
        blocked_actions,
        exploration_floor: cfg.exploration_floor,
        temperature: cfg.temperature,
        rule_weight: round_to(cfg.rule_weight, SCORE_DECIMALS),
        learned_weight: round_to(cfg.learned_weight, SCORE_DECIMALS),
        fallback_applied: true,
    }
}

/// Like [`select_hybrid`], but draws the chosen action from `propensity_by_action`.
///
/// The RNG is seeded from `replay_seed(seed, decision_key)`, so replaying the same
/// `(candidates, cfg, seed, decision_key)` reproduces the draw. The fallback path stays
/// deterministic.
#[cfg(feature = "stochastic")]
pub fn sample_decision(
    candidates: &[Candidate],
    cfg: &SelectorConfig,
    seed: u64,
    decision_key: &str,
) -> Result<Decision> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut d = select_hybrid(candidates, cfg)?;
    if d.fallback_applied {
        return Ok(d);
    }

    let mut rng = StdRng::seed_from_u64(crate::replay_seed(seed, decision_key));
    let r: f64 = rng.random();
    let mut cdf = 0.0;
    // Numerical fallback: the last action if rounding leaves `r` above the final cdf.
    let mut chosen = d.candidate_action_set[d.candidate_action_set.len() - 1].clone();
    for a in &d.candidate_action_set {
        cdf += d.propensity_of(a);
        if r < cdf {
            chosen = a.clone();
            break;
        }
    }

    d.propensity = d.propensity_of(&chosen);
    d.chosen_action = chosen;
    d.selection_mode = SelectionMode::SampledFromDistribution;
    debug!(
        chosen = %d.chosen_action,
        propensity = d.propensity,
        decision_key,
        "hybrid selection sampled"
    );
    Ok(d)
}
