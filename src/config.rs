//! Bundled configuration for every component.

use crate::{
    DuplicateValidatorConfig, FastLaneConfig, OodBudgetConfig, Result, RetentionGateConfig,
    SelectorConfig, SelfRepairBudgetConfig,
};

/// One knob set per component. Every field defaults to the production constants.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "camelCase"))]
pub struct EngineConfig {
    pub selector: SelectorConfig,
    pub ood_budget: OodBudgetConfig,
    pub fast_lane: FastLaneConfig,
    pub self_repair: SelfRepairBudgetConfig,
    pub duplicate_validator: DuplicateValidatorConfig,
    pub retention: RetentionGateConfig,
}

impl EngineConfig {
    /// Structural checks that clamping cannot repair (currently the stage ladder).
    pub fn validate(&self) -> Result<()> {
        self.retention.ladder.validate()
    }

    /// Copy with every component's knobs clamped into range.
    pub fn sanitized(&self) -> Self {
        Self {
            selector: self.selector.sanitized(),
            ood_budget: self.ood_budget.sanitized(),
            fast_lane: self.fast_lane.sanitized(),
            self_repair: self.self_repair.sanitized(),
            duplicate_validator: self.duplicate_validator.sanitized(),
            retention: self.retention.sanitized(),
        }
    }

    /// Parse a (possibly partial) JSON document. Missing sections and fields take their
    /// defaults; the result is validated and sanitized.
    ///
    /// ```rust
    /// let cfg = coachgate::EngineConfig::from_json_str(
    ///     r#"{ "selector": { "explorationFloor": 0.05 } }"#,
    /// ).unwrap();
    /// assert_eq!(cfg.selector.exploration_floor, 0.05);
    /// assert_eq!(cfg.selector.temperature, 0.7);
    /// ```
    #[cfg(feature = "serde")]
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg.sanitized())
    }
}
