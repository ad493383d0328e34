use serde::Serialize;
use strum::{Display, EnumString};

use crate::models::{ClassKey, DecisionWeights, ValidityFlags};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecisionReason {
    Ok,
    LowScore,
}

#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct Decision {
    pub accepted: bool,
    pub score: f64,
    pub label: String,
    pub reason: DecisionReason,
}

/// Weighted sum of the set validity flags, accepted once it reaches the threshold.
///
/// Pure function of its inputs.
pub fn decide(class: ClassKey, flags: &ValidityFlags, weights: &DecisionWeights) -> Decision {
    let score = [
        (flags.color_valid, weights.color),
        (flags.shape_valid, weights.shape),
        (flags.ai_valid, weights.ai),
        (flags.depth_valid, weights.depth),
        (flags.depth_mask_valid, weights.depth_mask),
        (flags.tracker_valid, weights.tracker),
    ]
    .into_iter()
    .filter(|(set, _)| *set)
    .map(|(_, weight)| weight)
    .sum::<f64>();
    let accepted = score >= weights.threshold;

    Decision {
        accepted,
        score,
        label: class.label(),
        reason: if accepted {
            DecisionReason::Ok
        } else {
            DecisionReason::LowScore
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColorKind, ShapeKind};

    const CLASS: ClassKey = ClassKey {
        shape: ShapeKind::Square,
        color: ColorKind::Green,
    };

    #[test]
    fn all_flags_accept_with_defaults() {
        let flags = ValidityFlags {
            color_valid: true,
            shape_valid: true,
            ai_valid: true,
            depth_valid: true,
            depth_mask_valid: true,
            tracker_valid: true,
        };
        let decision = decide(CLASS, &flags, &DecisionWeights::default());

        assert!(decision.accepted);
        assert!((decision.score - 3.6).abs() < 1e-9);
        assert_eq!(decision.label, "green_square");
        assert_eq!(decision.reason, DecisionReason::Ok);
    }

    #[test]
    fn missing_ai_falls_below_threshold() {
        let flags = ValidityFlags {
            color_valid: true,
            shape_valid: true,
            ai_valid: false,
            depth_valid: true,
            depth_mask_valid: true,
            tracker_valid: false,
        };
        let decision = decide(CLASS, &flags, &DecisionWeights::default());

        assert!(!decision.accepted);
        assert!((decision.score - 1.6).abs() < 1e-9);
        assert_eq!(decision.reason.to_string(), "low_score");
    }

    #[test]
    fn score_equal_to_threshold_accepts_and_is_deterministic() {
        let weights = DecisionWeights {
            threshold: 1.0,
            ..DecisionWeights::default()
        };
        let flags = ValidityFlags {
            tracker_valid: true,
            ..ValidityFlags::default()
        };
        let first = decide(CLASS, &flags, &weights);

        assert!(first.accepted);
        assert_eq!(first, decide(CLASS, &flags, &weights));
    }
}
