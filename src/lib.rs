//! `coachgate`: guardrailed, auditable decision primitives for adaptive practice.
//!
//! Designed for "what should this learner do next" problems: a planner offers a handful
//! of candidate activities, each scored by rules and by a learned model, and the engine
//! decides under exploration while respecting hard constraints and time budgets. Every
//! decision is a plain value carrying the numbers that produced it, so the caller can
//! persist it verbatim and evaluate it off-policy later.
//!
//! **Goals:**
//! - **Deterministic by default**: same inputs + config → byte-identical output.
//! - **Known propensities**: every selection logs the probability of what it chose.
//! - **Clamp, don't fail**: tuning knobs are sanitized; only structurally impossible
//!   input (no candidates, a broken stage ladder) is an [`Error`].
//! - **Stateless**: history arrives as explicit, pre-fetched windows.
//!
//! **Components:**
//! - [`select_hybrid`] / [`SelectorConfig`]: blend rule utility and learned value,
//!   block hard-constrained actions, floored softmax over the rest. Falls back
//!   deterministically when everything is blocked.
//! - (feature `stochastic`) [`sample_decision`]: same distribution, sampled with a
//!   replayable seed.
//! - [`compute_ood_budget`] / [`OodBudgetConfig`]: out-of-distribution probe rate and
//!   cadence from milestone pressure and recent transfer verdicts.
//! - [`evaluate_fast_lane`]: reduced diagnostic density for confident learners between
//!   milestone gates.
//! - [`evaluate_self_repair_budget`] / [`aggregate_self_repair_stats`]: loop and
//!   time-share caps on immediate retries.
//! - [`validate_delayed_verification`]: rejects verification tasks that repeat the
//!   source task family or wording.
//! - [`evaluate_retention_gate_from_rows`] / [`StageLadder`]: 7/30/90-day retention
//!   evidence gate for high-stakes promotions.
//! - [`snips_estimate`] / [`evaluate_logged_decisions`]: self-normalized off-policy
//!   estimate of the greedy policy from logged decisions.
//! - [`EngineConfig`]: all knobs in one (JSON-loadable, feature `serde`) document.
//!
//! **Non-goals:**
//! - No storage, transport, or content generation. Callers fetch history and persist
//!   decisions.
//! - No ability estimation; confidence signals arrive precomputed.
//!
//! # Determinism
//!
//! Output maps are `BTreeMap`s. Pre-action scores are rounded to 6 decimals before they
//! are ordered, so ties are exact and the tie-break order (score descending, action id
//! ascending) is stable across platforms. Sampling derives its RNG seed from a caller
//! seed and a decision key ([`replay_seed`]), never from process state.
//!
//! # Logging
//!
//! Each component emits one `tracing` `debug!` event per decision. The crate installs no
//! subscriber.

#![forbid(unsafe_code)]

mod error;
pub use error::*;

mod decision;
pub use decision::*;

mod alloc;
pub use alloc::*;

mod stable_hash;
pub use stable_hash::*;

mod selector;
pub use selector::*;

mod fast_lane;
pub use fast_lane::*;

mod ood_budget;
pub use ood_budget::*;

mod self_repair;
pub use self_repair::*;

mod delayed_verification;
pub use delayed_verification::*;

mod retention;
pub use retention::*;

mod ope;
pub use ope::*;

mod config;
pub use config::*;

/// Round half away from zero to `digits` decimals.
pub(crate) fn round_to(x: f64, digits: u32) -> f64 {
    if !x.is_finite() {
        return x;
    }
    let m = 10f64.powi(digits as i32);
    (x * m).round() / m
}

/// Replace whitespace runs with a single space and trim.
pub(crate) fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
