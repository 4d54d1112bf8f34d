//! Allocation helpers: scores to a propensity distribution.
//!
//! Both steps are deterministic. The output maps are keyed by action id, so iteration
//! order never depends on input order.

use std::collections::BTreeMap;

/// Lower bound applied to softmax temperatures.
pub const MIN_TEMPERATURE: f64 = 0.05;
/// Upper bound applied to softmax temperatures.
pub const MAX_TEMPERATURE: f64 = 5.0;

/// Clamp a temperature into `[MIN_TEMPERATURE, MAX_TEMPERATURE]`, using `fallback` for
/// non-finite input.
pub fn clamp_temperature(temperature: f64, fallback: f64) -> f64 {
    let t = if temperature.is_finite() {
        temperature
    } else {
        fallback
    };
    t.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE)
}

/// Stable softmax over `actions`, reading each action's score from `scores`.
///
/// - Missing scores count as `0.0`.
/// - Subtracts the max logit before exponentiating.
/// - Degenerate denominators fall back to uniform.
pub fn softmax_actions(
    actions: &[String],
    scores: &BTreeMap<String, f64>,
    temperature: f64,
) -> BTreeMap<String, f64> {
    if actions.is_empty() {
        return BTreeMap::new();
    }
    let t = clamp_temperature(temperature, 1.0);

    let logits: Vec<f64> = actions
        .iter()
        .map(|a| scores.get(a).copied().unwrap_or(0.0) / t)
        .collect();
    let max_logit = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let mut out: BTreeMap<String, f64> = BTreeMap::new();
    let mut denom = 0.0;
    for (a, &l) in actions.iter().zip(&logits) {
        let x = (l - max_logit).exp();
        denom += x;
        out.insert(a.clone(), x);
    }
    if denom <= 0.0 || !denom.is_finite() {
        let uniform = 1.0 / actions.len() as f64;
        return actions.iter().map(|a| (a.clone(), uniform)).collect();
    }
    for v in out.values_mut() {
        *v /= denom;
    }
    out
}

/// Mix a base distribution with a per-action exploration floor.
///
/// `p(a) = floor + (1 - floor * n) * base(a)`, with `floor` clamped to `[0, 1/n]`.
/// When `floor * n >= 1` the result is uniform.
pub fn apply_exploration_floor(
    actions: &[String],
    base: &BTreeMap<String, f64>,
    floor: f64,
) -> BTreeMap<String, f64> {
    if actions.is_empty() {
        return BTreeMap::new();
    }
    let n = actions.len() as f64;
    let floor = if floor.is_finite() { floor } else { 0.0 };
    let per_action = floor.clamp(0.0, 1.0 / n);
    let floor_mass = per_action * n;
    if floor_mass >= 1.0 {
        let uniform = 1.0 / n;
        return actions.iter().map(|a| (a.clone(), uniform)).collect();
    }
    actions
        .iter()
        .map(|a| {
            let b = base.get(a).copied().unwrap_or(0.0);
            (a.clone(), per_action + (1.0 - floor_mass) * b)
        })
        .collect()
}
