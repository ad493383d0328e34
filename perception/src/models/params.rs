use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use strum::{Display, EnumIter, EnumString};

use super::deserialize_with_ok_or_default;
use crate::{ColorKind, Error, Result};

/// Upper clamp applied to [`TrackerParams::max_lost`].
pub const MAX_LOST_CLAMP: u32 = 60;

/// Every tunable numeric parameter of the pipeline, grouped by component.
///
/// Blocks missing from a JSON document keep their defaults so partially written
/// presets stay loadable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Params {
    #[serde(default)]
    pub circle: CircleParams,
    #[serde(default = "square_default")]
    pub square: QuadParams,
    #[serde(default = "rectangle_default")]
    pub rectangle: QuadParams,
    #[serde(default)]
    pub depth: DepthParams,
    #[serde(default)]
    pub tracker: TrackerParams,
    #[serde(default)]
    pub decision: DecisionWeights,
    #[serde(default)]
    pub preprocess: PreprocessParams,
    #[serde(default)]
    pub hsv: HsvRanges,
    #[serde(default)]
    pub morphology: MorphologyParams,
    #[serde(default)]
    pub verify: VerifyParams,
    #[serde(default)]
    pub timing: TimingParams,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            circle: CircleParams::default(),
            square: square_default(),
            rectangle: rectangle_default(),
            depth: DepthParams::default(),
            tracker: TrackerParams::default(),
            decision: DecisionWeights::default(),
            preprocess: PreprocessParams::default(),
            hsv: HsvRanges::default(),
            morphology: MorphologyParams::default(),
            verify: VerifyParams::default(),
            timing: TimingParams::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircleParams {
    /// Inverse accumulator resolution of the Hough transform.
    pub dp: f64,
    pub min_dist: f64,
    pub param1: f64,
    pub param2: f64,
    pub min_radius: i32,
    pub max_radius: i32,
    /// Gaussian kernel size, bumped to the next odd value.
    pub blur_kernel: i32,
    /// Minimum foreground pixel count inside the circle's bounding patch.
    pub min_area: i32,
    pub min_circularity: f64,
    pub min_mask_overlap: f64,
}

impl Default for CircleParams {
    fn default() -> Self {
        Self {
            dp: 2.0,
            min_dist: 200.0,
            param1: 200.0,
            param2: 60.0,
            min_radius: 50,
            max_radius: 200,
            blur_kernel: 9,
            min_area: 2500,
            min_circularity: 0.30,
            min_mask_overlap: 0.70,
        }
    }
}

/// Thresholds shared by the square and rectangle detectors.
///
/// Fields missing from a partially written block fall back to the square defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuadParams {
    /// Polygon approximation epsilon as a fraction of the perimeter.
    pub epsilon_scale: f64,
    pub min_area: f64,
    pub max_area: f64,
    pub min_solidity: f64,
    pub max_circularity: f64,
    pub min_aspect: f64,
    pub max_aspect: f64,
    pub min_extent: f64,
}

impl Default for QuadParams {
    fn default() -> Self {
        square_default()
    }
}

fn square_default() -> QuadParams {
    QuadParams {
        epsilon_scale: 0.1,
        min_area: 5000.0,
        max_area: 80000.0,
        min_solidity: 0.30,
        max_circularity: 0.97,
        min_aspect: 0.60,
        max_aspect: 1.10,
        min_extent: 0.85,
    }
}

fn rectangle_default() -> QuadParams {
    QuadParams {
        epsilon_scale: 0.1,
        min_area: 50.0,
        max_area: 500000.0,
        min_solidity: 0.0,
        max_circularity: 2.0,
        min_aspect: 0.5,
        max_aspect: 4.0,
        min_extent: 0.5,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthParams {
    pub min_mm: f64,
    pub max_mm: f64,
    pub offset_mm: f64,
    pub mask_overlap_ok: f64,
}

impl Default for DepthParams {
    fn default() -> Self {
        Self {
            min_mm: 500.0,
            max_mm: 1000.0,
            offset_mm: 0.0,
            mask_overlap_ok: 0.65,
        }
    }
}

/// Which coordinates the tracker filters and associates on.
#[derive(
    Clone, Copy, PartialEq, Eq, Default, Debug, Serialize, Deserialize, EnumIter, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TrackingSpace {
    /// Pixel centers with a 4-state filter.
    #[default]
    Image,
    /// Camera-frame millimetres with a 6-state filter.
    World,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerParams {
    #[serde(deserialize_with = "deserialize_with_ok_or_default")]
    pub space: TrackingSpace,
    /// Blend factor for non-tracked numeric fields.
    pub alpha: f64,
    pub base_match_distance: f64,
    /// Clamped to `[1, 60]` when used.
    pub max_lost: u32,
    pub spawn_persist: u32,
    pub speed_gain: f64,
    pub lost_gain: f64,
    pub min_stable_age: u32,
    pub min_spawn_radius: f64,
    pub q_2d: f64,
    pub r_2d: f64,
    pub q_3d: f64,
    pub r_3d: f64,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            space: TrackingSpace::default(),
            alpha: 0.2,
            base_match_distance: 1500.0,
            max_lost: 30,
            spawn_persist: 3,
            speed_gain: 0.0,
            lost_gain: 5.0,
            min_stable_age: 3,
            min_spawn_radius: 25.0,
            q_2d: 0.002,
            r_2d: 0.005,
            q_3d: 0.010,
            r_3d: 0.009,
        }
    }
}

impl TrackerParams {
    #[inline]
    pub fn max_lost_clamped(&self) -> u32 {
        self.max_lost.clamp(1, MAX_LOST_CLAMP)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionWeights {
    pub color: f64,
    pub shape: f64,
    pub ai: f64,
    pub depth: f64,
    pub depth_mask: f64,
    pub tracker: f64,
    pub threshold: f64,
}

impl Default for DecisionWeights {
    fn default() -> Self {
        Self {
            color: 0.5,
            shape: 0.5,
            ai: 1.0,
            depth: 0.15,
            depth_mask: 0.45,
            tracker: 1.0,
            threshold: 2.0,
        }
    }
}

/// Inclusive HSV bounds on OpenCV's 0..180 hue scale.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HsvRange {
    pub h_min: u8,
    pub h_max: u8,
    pub s_min: u8,
    pub s_max: u8,
    pub v_min: u8,
    pub v_max: u8,
}

impl HsvRange {
    pub const fn new(h: (u8, u8), s: (u8, u8), v: (u8, u8)) -> Self {
        Self {
            h_min: h.0,
            h_max: h.1,
            s_min: s.0,
            s_max: s.1,
            v_min: v.0,
            v_max: v.1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HsvRanges {
    /// Lower red hue band, OR-ed with `red_high`.
    pub red_low: HsvRange,
    pub red_high: HsvRange,
    pub blue: HsvRange,
    pub green: HsvRange,
    pub yellow: HsvRange,
    pub neon_yellow: HsvRange,
}

impl Default for HsvRanges {
    fn default() -> Self {
        Self {
            red_low: HsvRange::new((0, 9), (200, 255), (25, 255)),
            red_high: HsvRange::new((170, 180), (200, 255), (25, 255)),
            blue: HsvRange::new((105, 145), (100, 255), (50, 255)),
            green: HsvRange::new((23, 90), (80, 255), (25, 255)),
            yellow: HsvRange::new((20, 35), (100, 255), (100, 255)),
            neon_yellow: HsvRange::new((12, 60), (105, 255), (80, 255)),
        }
    }
}

impl HsvRanges {
    /// The bands whose union forms the mask of `color`.
    pub fn bands(&self, color: ColorKind) -> Vec<HsvRange> {
        match color {
            ColorKind::Red => vec![self.red_low, self.red_high],
            ColorKind::Blue => vec![self.blue],
            ColorKind::Green => vec![self.green],
            ColorKind::Yellow => vec![self.yellow],
            ColorKind::NeonYellow => vec![self.neon_yellow],
        }
    }
}

/// Frame conditioning applied before color segmentation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessParams {
    /// CLAHE clip limit on the LAB lightness channel, `0` disables it.
    pub clahe_clip: f64,
    /// Gaussian blur kernel, bumped to odd. `0` disables it.
    pub blur_kernel: i32,
}

impl Default for PreprocessParams {
    fn default() -> Self {
        Self {
            clahe_clip: 0.0,
            blur_kernel: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MorphologyParams {
    pub kernel_size: i32,
    pub open_iterations: i32,
    pub close_iterations: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyParams {
    /// A candidate is AI-verified when its best box IoU exceeds this.
    pub match_iou: f64,
    /// A new box refreshes a buffered one when their IoU exceeds this.
    pub buffer_iou: f64,
    pub buffer_ttl: u32,
}

impl Default for VerifyParams {
    fn default() -> Self {
        Self {
            match_iou: 0.15,
            buffer_iou: 0.2,
            buffer_ttl: 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingParams {
    pub predict_deadline_millis: u64,
    pub correct_deadline_millis: u64,
    pub assign_deadline_millis: u64,
    pub retries: u32,
}

impl Default for TimingParams {
    fn default() -> Self {
        Self {
            predict_deadline_millis: 1500,
            correct_deadline_millis: 1500,
            assign_deadline_millis: 2000,
            retries: 2,
        }
    }
}

impl Params {
    /// Builds parameters from a flat `block.field` (or `hsv.color.field`) map.
    ///
    /// Missing names keep their defaults. Unknown names and values that do not fit their
    /// field are rejected.
    pub fn from_flat(values: &HashMap<String, f64>) -> Result<Params> {
        let mut root = serde_json::to_value(Params::default())
            .map_err(|err| Error::InvalidParams(err.to_string()))?;
        for (name, value) in values {
            let slot = lookup_mut(&mut root, name)
                .ok_or_else(|| Error::InvalidParams(format!("unknown parameter {name}")))?;
            *slot = to_json_number(*value)
                .ok_or_else(|| Error::InvalidParams(format!("{name} is not finite")))?;
        }
        let params = serde_json::from_value::<Params>(root)
            .map_err(|err| Error::InvalidParams(err.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    /// Rejects values outside of their documented ranges.
    pub fn validate(&self) -> Result<()> {
        let tracker = &self.tracker;
        check(
            (0.0..=1.0).contains(&tracker.alpha),
            "tracker.alpha must be within [0, 1]",
        )?;
        check(
            tracker.base_match_distance > 0.0 && tracker.base_match_distance < 50000.0,
            "tracker.base_match_distance must be within (0, 50000)",
        )?;
        check(
            (1..=MAX_LOST_CLAMP).contains(&tracker.spawn_persist),
            "tracker.spawn_persist must be within [1, 60]",
        )?;
        check(
            non_negative(tracker.speed_gain) && non_negative(tracker.lost_gain),
            "tracker gains must be finite and non-negative",
        )?;
        check(
            [tracker.q_2d, tracker.r_2d, tracker.q_3d, tracker.r_3d]
                .iter()
                .all(|v| v.is_finite() && *v > 0.0),
            "tracker noise gains must be finite and positive",
        )?;
        check(
            tracker.min_stable_age <= 600,
            "tracker.min_stable_age must not exceed 600",
        )?;
        check(
            non_negative(tracker.min_spawn_radius),
            "tracker.min_spawn_radius must be finite and non-negative",
        )?;

        let decision = &self.decision;
        check(
            [
                decision.color,
                decision.shape,
                decision.ai,
                decision.depth,
                decision.depth_mask,
                decision.tracker,
            ]
            .iter()
            .all(|w| non_negative(*w)),
            "decision weights must be finite and non-negative",
        )?;
        check(
            decision.threshold.is_finite(),
            "decision.threshold must be finite",
        )?;

        let depth = &self.depth;
        check(
            non_negative(depth.min_mm) && depth.max_mm.is_finite() && depth.min_mm < depth.max_mm,
            "depth range must be finite, non-negative and ordered",
        )?;
        check(
            depth.offset_mm.is_finite(),
            "depth.offset_mm must be finite",
        )?;
        check(
            unit(depth.mask_overlap_ok) && unit(self.circle.min_mask_overlap),
            "overlap thresholds must be within [0, 1]",
        )?;

        let circle = &self.circle;
        check(
            circle.dp > 0.0 && circle.min_dist > 0.0 && circle.param1 > 0.0 && circle.param2 > 0.0,
            "circle Hough parameters must be positive",
        )?;
        check(
            circle.min_radius >= 0 && circle.min_radius <= circle.max_radius,
            "circle radius range must be ordered",
        )?;
        for (name, quad) in [("square", &self.square), ("rectangle", &self.rectangle)] {
            check(
                quad.epsilon_scale > 0.0 && quad.epsilon_scale.is_finite(),
                &format!("{name}.epsilon_scale must be positive"),
            )?;
            check(
                non_negative(quad.min_area) && quad.min_area <= quad.max_area,
                &format!("{name} area range must be ordered"),
            )?;
            check(
                non_negative(quad.min_aspect) && quad.min_aspect <= quad.max_aspect,
                &format!("{name} aspect range must be ordered"),
            )?;
            check(
                [quad.min_solidity, quad.max_circularity, quad.min_extent]
                    .iter()
                    .all(|v| v.is_finite()),
                &format!("{name} thresholds must be finite"),
            )?;
        }

        let preprocess = &self.preprocess;
        check(
            non_negative(preprocess.clahe_clip) && preprocess.clahe_clip <= 40.0,
            "preprocess.clahe_clip must be within [0, 40]",
        )?;
        check(
            (0..=31).contains(&preprocess.blur_kernel),
            "preprocess.blur_kernel must be within [0, 31]",
        )?;

        check(
            unit(self.verify.match_iou) && unit(self.verify.buffer_iou),
            "verify IoU thresholds must be within [0, 1]",
        )?;
        check(
            self.timing.predict_deadline_millis > 0
                && self.timing.correct_deadline_millis > 0
                && self.timing.assign_deadline_millis > 0
                && self.timing.retries > 0,
            "timing deadlines and retries must be positive",
        )?;

        Ok(())
    }
}

#[inline]
fn check(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::InvalidParams(message.to_string()))
    }
}

#[inline]
fn non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

#[inline]
fn unit(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

fn lookup_mut<'a>(root: &'a mut Value, name: &str) -> Option<&'a mut Value> {
    let mut current = root;
    for segment in name.split('.') {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            _ => return None,
        };
    }
    (!current.is_object()).then_some(current)
}

/// Integral values become JSON integers so they can land in integer fields.
fn to_json_number(value: f64) -> Option<Value> {
    if !value.is_finite() {
        return None;
    }
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Some(Value::Number(Number::from(value as i64)))
    } else {
        Number::from_f64(value).map(Value::Number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_flat_overrides_named_fields() {
        let values = HashMap::from([
            ("tracker.alpha".to_string(), 0.5),
            ("tracker.spawn_persist".to_string(), 4.0),
            ("hsv.blue.h_min".to_string(), 100.0),
            ("decision.threshold".to_string(), 1.5),
        ]);
        let params = Params::from_flat(&values).unwrap();

        assert_eq!(params.tracker.alpha, 0.5);
        assert_eq!(params.tracker.spawn_persist, 4);
        assert_eq!(params.hsv.blue.h_min, 100);
        assert_eq!(params.decision.threshold, 1.5);
        assert_eq!(params.circle, CircleParams::default());
        assert_eq!(params.rectangle, rectangle_default());
    }

    #[test]
    fn from_flat_rejects_unknown_and_fractional_integers() {
        let unknown = HashMap::from([("tracker.nope".to_string(), 1.0)]);
        assert!(matches!(
            Params::from_flat(&unknown),
            Err(Error::InvalidParams(_))
        ));

        let fractional = HashMap::from([("tracker.max_lost".to_string(), 2.5)]);
        assert!(matches!(
            Params::from_flat(&fractional),
            Err(Error::InvalidParams(_))
        ));

        let block = HashMap::from([("tracker".to_string(), 1.0)]);
        assert!(Params::from_flat(&block).is_err());
    }

    #[test]
    fn from_flat_sets_preprocess_block() {
        let values = HashMap::from([
            ("preprocess.clahe_clip".to_string(), 2.0),
            ("preprocess.blur_kernel".to_string(), 7.0),
        ]);
        let params = Params::from_flat(&values).unwrap();
        assert_eq!(params.preprocess.clahe_clip, 2.0);
        assert_eq!(params.preprocess.blur_kernel, 7);

        let negative = HashMap::from([("preprocess.clahe_clip".to_string(), -1.0)]);
        assert!(matches!(
            Params::from_flat(&negative),
            Err(Error::InvalidParams(_))
        ));
        let oversized = HashMap::from([("preprocess.blur_kernel".to_string(), 33.0)]);
        assert!(Params::from_flat(&oversized).is_err());
    }

    #[test]
    fn validate_bounds() {
        let mut params = Params::default();
        assert!(params.validate().is_ok());

        params.tracker.alpha = -0.1;
        assert!(params.validate().is_err());
        params.tracker.alpha = 0.2;

        params.tracker.base_match_distance = 0.0;
        assert!(params.validate().is_err());
        params.tracker.base_match_distance = 50000.0;
        assert!(params.validate().is_err());
        params.tracker.base_match_distance = 1500.0;

        params.decision.ai = f64::NAN;
        assert!(params.validate().is_err());
        params.decision.ai = 1.0;

        params.tracker.max_lost = 500;
        assert!(params.validate().is_ok());
        assert_eq!(params.tracker.max_lost_clamped(), 60);
        params.tracker.max_lost = 0;
        assert_eq!(params.tracker.max_lost_clamped(), 1);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let params = serde_json::from_str::<Params>(
            r#"{ "tracker": { "space": "bogus", "alpha": 0.3 }, "square": { "min_area": 10 } }"#,
        )
        .unwrap();

        assert_eq!(params.tracker.space, TrackingSpace::Image);
        assert_eq!(params.tracker.alpha, 0.3);
        assert_eq!(params.tracker.max_lost, 30);
        assert_eq!(params.square.min_area, 10.0);
        assert_eq!(params.square.max_area, 80000.0);
    }
}
