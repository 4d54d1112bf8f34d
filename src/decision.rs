//! Decision envelope and candidate rows for the hybrid selector.
//!
//! A [`Decision`] is a fact about one selection call. It is meant to be persisted verbatim
//! so offline analysis can reconstruct why an action was chosen and with what
//! probability. Nothing in this crate mutates a decision after it is built.

use std::collections::BTreeMap;

/// Marker added to `active_constraints` when every candidate was blocked.
pub const CONSTRAINT_FALLBACK: &str = "hard_constraint_fallback";
/// Marker added to `active_constraints` on the normal path.
pub const CONSTRAINT_HARD_ENFORCED: &str = "hard_constraints_enforced";
/// Marker added to `active_constraints` on the normal path.
pub const CONSTRAINT_EXPLORATION_FLOOR: &str = "exploration_floor";
/// Marker added to `active_constraints` when a repeated action id was ignored.
pub const CONSTRAINT_DUPLICATE_IGNORED: &str = "duplicate_action_ignored";

/// How the chosen action was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SelectionMode {
    /// Highest final probability, stable tie-breaks.
    DeterministicChoice,
    /// Drawn from `propensity_by_action` with a replayable seed.
    SampledFromDistribution,
    /// Every candidate was blocked; highest rule utility was taken.
    HardConstraintFallback,
}

/// One candidate action offered to the selector.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct Candidate {
    /// Unique within one selection call.
    pub action_id: String,
    /// Score from the rule-based planner.
    pub rule_utility: f64,
    /// Score from the learned value model.
    pub learned_value: f64,
    /// Reasons this action is blocked. Empty (or only blank entries) means feasible.
    #[cfg_attr(feature = "serde", serde(default))]
    pub hard_constraint_reasons: Vec<String>,
}

impl Candidate {
    /// A feasible candidate.
    pub fn new(action_id: impl Into<String>, rule_utility: f64, learned_value: f64) -> Self {
        Self {
            action_id: action_id.into(),
            rule_utility,
            learned_value,
            hard_constraint_reasons: Vec::new(),
        }
    }

    /// Attach a hard-constraint reason.
    pub fn blocked_by(mut self, reason: impl Into<String>) -> Self {
        self.hard_constraint_reasons.push(reason.into());
        self
    }
}

/// Output of one hybrid selection call.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct Decision {
    /// Protocol version of the selector that produced this row.
    pub policy_version: String,
    /// The selected action.
    pub chosen_action: String,
    /// Probability with which `chosen_action` was selected. `1.0` on the fallback path.
    pub propensity: f64,
    /// How `chosen_action` was picked.
    pub selection_mode: SelectionMode,
    /// Non-blocked actions, score descending then action id ascending.
    pub candidate_action_set: Vec<String>,
    /// Blended score per action in `candidate_action_set`.
    pub pre_action_scores: BTreeMap<String, f64>,
    /// Final probability per action in `candidate_action_set`; sums to 1.
    pub propensity_by_action: BTreeMap<String, f64>,
    /// De-duplicated constraint reasons for every input candidate (empty when feasible).
    pub constraint_mask: BTreeMap<String, Vec<String>>,
    /// Union of constraint reasons plus policy markers, first-seen order.
    pub active_constraints: Vec<String>,
    /// Candidates with at least one constraint reason, input order.
    pub blocked_actions: Vec<String>,
    /// Effective exploration floor after sanitizing.
    pub exploration_floor: f64,
    /// Effective softmax temperature after clamping.
    pub temperature: f64,
    /// Normalized rule weight.
    pub rule_weight: f64,
    /// Normalized learned weight.
    pub learned_weight: f64,
    /// True when every candidate was blocked and the deterministic fallback chose.
    ///
    /// Fallback rows should be excluded from off-policy estimates.
    pub fallback_applied: bool,
}

impl Decision {
    /// Logged probability for `action_id`, or `0.0` if it was not a candidate.
    pub fn propensity_of(&self, action_id: &str) -> f64 {
        self.propensity_by_action
            .get(action_id)
            .copied()
            .unwrap_or(0.0)
    }

    /// Whether the row can feed an inverse-propensity estimate.
    pub fn is_ope_eligible(&self) -> bool {
        !self.fallback_applied && self.propensity > 0.0 && self.propensity <= 1.0
    }
}
