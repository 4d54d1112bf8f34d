//! Delayed-verification duplicate validator.
//!
//! After an immediate retry, a later verification task checks whether the repair stuck.
//! It only proves anything if it is not the same exercise in disguise: the task family
//! must differ from the source task and the prompt wording must not be a near copy.

use std::collections::BTreeSet;

use tracing::debug;

use crate::{collapse_whitespace, round_to};

/// Protocol version stamped on every [`DelayedVerificationValidation`].
pub const DELAYED_VERIFICATION_VERSION: &str = "self-repair-delayed-verification-v1";

/// Tokens must be longer than this to count toward similarity.
pub const MIN_SIMILARITY_TOKEN_LEN: usize = 2;

/// Validator knobs.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct DuplicateValidatorConfig {
    /// Similarity at or above this marks the prompt as a duplicate formulation.
    pub prompt_similarity_threshold: f64,
}

impl Default for DuplicateValidatorConfig {
    fn default() -> Self {
        Self {
            prompt_similarity_threshold: 0.88,
        }
    }
}

impl DuplicateValidatorConfig {
    pub fn sanitized(&self) -> Self {
        Self {
            prompt_similarity_threshold: if self.prompt_similarity_threshold.is_finite() {
                self.prompt_similarity_threshold.clamp(0.0, 1.0)
            } else {
                Self::default().prompt_similarity_threshold
            },
        }
    }
}

/// Task family and prompt of one side of the comparison.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct TaskContext {
    pub task_type: Option<String>,
    pub prompt: Option<String>,
}

impl TaskContext {
    pub fn new(task_type: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task_type: Some(task_type.into()),
            prompt: Some(prompt.into()),
        }
    }
}

/// Output of [`validate_delayed_verification`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct DelayedVerificationValidation {
    pub version: String,
    /// No reasons were recorded.
    pub valid: bool,
    pub duplicate_task_family: bool,
    pub duplicate_prompt_formulation: bool,
    /// Rounded to 6 decimals; `None` when either prompt is missing.
    pub prompt_similarity: Option<f64>,
    pub reasons: Vec<String>,
}

/// Lower-case, replace anything but `[a-z0-9]` and whitespace with a space, collapse runs
/// of whitespace, trim.
pub fn normalize_prompt_text(text: &str) -> String {
    let replaced: String = text
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    collapse_whitespace(&replaced)
}

/// Jaccard similarity of the normalized token sets, in `[0, 1]`.
///
/// Only tokens longer than [`MIN_SIMILARITY_TOKEN_LEN`] count. If either side normalizes
/// to nothing the similarity is `0`; if either side has no qualifying tokens the
/// normalized strings are compared for equality instead.
pub fn prompt_similarity(left: &str, right: &str) -> f64 {
    let l = normalize_prompt_text(left);
    let r = normalize_prompt_text(right);
    if l.is_empty() || r.is_empty() {
        return 0.0;
    }
    let tokens = |s: &str| -> BTreeSet<String> {
        s.split(' ')
            .filter(|t| t.len() > MIN_SIMILARITY_TOKEN_LEN)
            .map(str::to_string)
            .collect()
    };
    let lt = tokens(&l);
    let rt = tokens(&r);
    if lt.is_empty() || rt.is_empty() {
        return if l == r { 1.0 } else { 0.0 };
    }
    let intersection = lt.intersection(&rt).count();
    let union = lt.union(&rt).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

fn present(s: &Option<String>) -> Option<&str> {
    s.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Check that `candidate` is a real delayed verification of `source`.
///
/// Reasons accumulate: `missing_task_family_context` or `duplicate_task_family`, then
/// `missing_prompt_context` or `duplicate_prompt_formulation`.
pub fn validate_delayed_verification(
    source: &TaskContext,
    candidate: &TaskContext,
    cfg: &DuplicateValidatorConfig,
) -> DelayedVerificationValidation {
    let threshold = cfg.sanitized().prompt_similarity_threshold;
    let mut reasons = Vec::new();

    let mut duplicate_task_family = false;
    match (present(&source.task_type), present(&candidate.task_type)) {
        (Some(a), Some(b)) => {
            if a == b {
                duplicate_task_family = true;
                reasons.push("duplicate_task_family".to_string());
            }
        }
        _ => reasons.push("missing_task_family_context".to_string()),
    }

    let mut duplicate_prompt_formulation = false;
    let mut similarity = None;
    match (present(&source.prompt), present(&candidate.prompt)) {
        (Some(a), Some(b)) => {
            let s = round_to(prompt_similarity(a, b), 6);
            if s >= threshold {
                duplicate_prompt_formulation = true;
                reasons.push("duplicate_prompt_formulation".to_string());
            }
            similarity = Some(s);
        }
        _ => reasons.push("missing_prompt_context".to_string()),
    }

    let valid = reasons.is_empty();
    debug!(
        valid,
        duplicate_task_family,
        duplicate_prompt_formulation,
        similarity = similarity.unwrap_or(f64::NAN),
        "delayed verification validation"
    );

    DelayedVerificationValidation {
        version: DELAYED_VERIFICATION_VERSION.to_string(),
        valid,
        duplicate_task_family,
        duplicate_prompt_formulation,
        prompt_similarity: similarity,
        reasons,
    }
}

/// Task family used to verify a repair of `source_task_type`.
///
/// `qa_prompt` → `role_play`, `filler_control` → `speech_builder`, `argumentation` →
/// `register_switch`, `register_switch` → `misunderstanding_repair`; everything else
/// (including `target_vocab`, `role_play`, `topic_talk`, `speech_builder`, `read_aloud`)
/// → `qa_prompt`.
pub fn select_delayed_verification_task_type(source_task_type: &str) -> &'static str {
    match source_task_type {
        "qa_prompt" => "role_play",
        "filler_control" => "speech_builder",
        "argumentation" => "register_switch",
        "register_switch" => "misunderstanding_repair",
        _ => "qa_prompt",
    }
}

/// Learner-facing instruction for a delayed verification task.
///
/// Uses `generated_prompt` when it has content, otherwise a generic instruction naming
/// `verification_task_type`.
pub fn build_delayed_verification_prompt(
    generated_prompt: &str,
    verification_task_type: &str,
) -> String {
    let generated = generated_prompt.trim();
    let base = if generated.is_empty() {
        format!("Demonstrate the corrected skill in a new context using {verification_task_type}.")
    } else {
        generated.to_string()
    };
    collapse_whitespace(&format!(
        "Delayed verification check. Use a different task framing from the immediate retry, \
         and do not repeat the previous wording. {base}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_family_differs_from_source() {
        assert_eq!(select_delayed_verification_task_type("qa_prompt"), "role_play");
        assert_eq!(select_delayed_verification_task_type("target_vocab"), "qa_prompt");
        assert_eq!(
            select_delayed_verification_task_type("argumentation"),
            "register_switch"
        );
        assert_eq!(
            select_delayed_verification_task_type("register_switch"),
            "misunderstanding_repair"
        );
        assert_eq!(
            select_delayed_verification_task_type("filler_control"),
            "speech_builder"
        );
        assert_eq!(select_delayed_verification_task_type("unknown_type"), "qa_prompt");
    }

    #[test]
    fn duplicate_family_is_rejected() {
        let v = validate_delayed_verification(
            &TaskContext::new("qa_prompt", "Explain your daily routine."),
            &TaskContext::new("qa_prompt", "Describe your routine in detail."),
            &DuplicateValidatorConfig::default(),
        );
        assert!(!v.valid);
        assert!(v.duplicate_task_family);
        assert_eq!(v.reasons, vec!["duplicate_task_family"]);
    }

    #[test]
    fn identical_prompt_is_rejected() {
        let v = validate_delayed_verification(
            &TaskContext::new("qa_prompt", "Describe your favorite teacher and why."),
            &TaskContext::new("role_play", "Describe your favorite teacher and why."),
            &DuplicateValidatorConfig::default(),
        );
        assert!(!v.valid);
        assert!(v.duplicate_prompt_formulation);
        assert_eq!(v.prompt_similarity, Some(1.0));
        assert_eq!(v.reasons, vec!["duplicate_prompt_formulation"]);
    }

    #[test]
    fn distinct_family_and_wording_is_valid() {
        let v = validate_delayed_verification(
            &TaskContext::new("qa_prompt", "Describe your school day."),
            &TaskContext::new(
                "role_play",
                "Role-play asking a friend to plan a weekend activity.",
            ),
            &DuplicateValidatorConfig::default(),
        );
        assert!(v.valid);
        assert!(v.reasons.is_empty());
        assert_eq!(v.prompt_similarity, Some(0.0));
    }

    #[test]
    fn missing_context_accumulates_reasons() {
        let v = validate_delayed_verification(
            &TaskContext::default(),
            &TaskContext {
                task_type: Some("  ".into()),
                prompt: None,
            },
            &DuplicateValidatorConfig::default(),
        );
        assert!(!v.valid);
        assert_eq!(
            v.reasons,
            vec!["missing_task_family_context", "missing_prompt_context"]
        );
        assert_eq!(v.prompt_similarity, None);
    }

    #[test]
    fn similarity_uses_long_tokens_and_exact_fallback() {
        assert_eq!(normalize_prompt_text("  Hello,   WORLD!! "), "hello world");
        assert_eq!(prompt_similarity("?!", "hello"), 0.0);
        assert_eq!(prompt_similarity("a b", "A, b"), 1.0);
        assert_eq!(prompt_similarity("a b", "a c"), 0.0);
        // {describe, your, day} vs {describe, your, week}
        assert!((prompt_similarity("Describe your day", "describe your week") - 0.5).abs() < 1e-12);
    }

    #[test]
    fn threshold_is_clamped() {
        let cfg = DuplicateValidatorConfig {
            prompt_similarity_threshold: 7.0,
        };
        let v = validate_delayed_verification(
            &TaskContext::new("qa_prompt", "same words here"),
            &TaskContext::new("role_play", "same words here"),
            &cfg,
        );
        // Clamped to 1.0, so an exact copy still trips it.
        assert!(v.duplicate_prompt_formulation);
    }

    #[test]
    fn delayed_prompt_wraps_generated_text() {
        assert_eq!(
            build_delayed_verification_prompt("  Plan a  trip. ", "role_play"),
            "Delayed verification check. Use a different task framing from the immediate retry, \
             and do not repeat the previous wording. Plan a trip."
        );
        assert!(build_delayed_verification_prompt("", "role_play")
            .ends_with("Demonstrate the corrected skill in a new context using role_play."));
    }
}
