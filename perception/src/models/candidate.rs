use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// The geometric family a candidate was detected as.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Debug,
    Serialize,
    Deserialize,
    EnumIter,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ShapeKind {
    Circle,
    Square,
    Rectangle,
}

impl ShapeKind {
    /// Index used by the compact object message.
    pub fn wire_index(self) -> u8 {
        match self {
            ShapeKind::Circle => 0,
            ShapeKind::Square => 1,
            ShapeKind::Rectangle => 2,
        }
    }
}

#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Debug,
    Serialize,
    Deserialize,
    EnumIter,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ColorKind {
    Red,
    Blue,
    Green,
    Yellow,
    NeonYellow,
}

impl ColorKind {
    /// Index used by the compact object message.
    pub fn wire_index(self) -> u8 {
        match self {
            ColorKind::Red => 0,
            ColorKind::Blue => 1,
            ColorKind::Green => 2,
            ColorKind::Yellow => 3,
            ColorKind::NeonYellow => 4,
        }
    }
}

/// A (shape, color) pair identifying one independently tracked class.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct ClassKey {
    pub shape: ShapeKind,
    pub color: ColorKind,
}

impl ClassKey {
    pub fn new(shape: ShapeKind, color: ColorKind) -> Self {
        Self { shape, color }
    }

    /// The `{color}_{shape}` label attached to decisions.
    pub fn label(&self) -> String {
        format!("{}_{}", self.color, self.shape)
    }
}

impl std::fmt::Display for ClassKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// The 2D footprint of a candidate in pixels.
#[derive(Clone, Copy, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Extent {
    Circle { radius: f64 },
    Box { width: f64, height: f64, angle: f64 },
}

impl Extent {
    /// Equivalent radius used for spawning, depth sampling and AI footprints.
    ///
    /// Boxes use `(width + height) / 4`.
    pub fn radius(&self) -> f64 {
        match *self {
            Extent::Circle { radius } => radius,
            Extent::Box { width, height, .. } => (width + height) / 4.0,
        }
    }

    pub(crate) fn blend(&self, observed: &Extent, alpha: f64) -> Extent {
        match (*self, *observed) {
            (Extent::Circle { radius: old }, Extent::Circle { radius: new }) => Extent::Circle {
                radius: lerp(old, new, alpha),
            },
            (
                Extent::Box {
                    width: ow,
                    height: oh,
                    angle: oa,
                },
                Extent::Box {
                    width: nw,
                    height: nh,
                    angle: na,
                },
            ) => Extent::Box {
                width: lerp(ow, nw, alpha),
                height: lerp(oh, nh, alpha),
                angle: lerp_angle(oa, na, alpha),
            },
            _ => *observed,
        }
    }
}

/// A point in camera coordinates, millimetres.
#[derive(Clone, Copy, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct Position {
    pub x_mm: f64,
    pub y_mm: f64,
    pub z_mm: f64,
}

impl Position {
    pub fn new(x_mm: f64, y_mm: f64, z_mm: f64) -> Self {
        Self { x_mm, y_mm, z_mm }
    }

    pub(crate) fn blend(&self, observed: &Position, alpha: f64) -> Position {
        Position {
            x_mm: lerp(self.x_mm, observed.x_mm, alpha),
            y_mm: lerp(self.y_mm, observed.y_mm, alpha),
            z_mm: lerp(self.z_mm, observed.z_mm, alpha),
        }
    }
}

/// The six independent signals fused by the decision engine.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct ValidityFlags {
    pub color_valid: bool,
    pub shape_valid: bool,
    pub ai_valid: bool,
    pub depth_valid: bool,
    pub depth_mask_valid: bool,
    pub tracker_valid: bool,
}

/// A per-frame detection, optionally enriched with a 3D position and validity flags.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Candidate {
    pub shape: ShapeKind,
    pub color: ColorKind,
    pub cx: f64,
    pub cy: f64,
    pub extent: Extent,
    /// Circularity for circles, extent for boxes.
    pub quality: f64,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub flags: ValidityFlags,
}

impl Candidate {
    pub fn class(&self) -> ClassKey {
        ClassKey::new(self.shape, self.color)
    }

    #[inline]
    pub fn radius(&self) -> f64 {
        self.extent.radius()
    }
}

#[inline]
pub(crate) fn lerp(old: f64, new: f64, alpha: f64) -> f64 {
    old * (1.0 - alpha) + new * alpha
}

/// Blends box angles in degrees along the shorter arc, modulo 180.
#[inline]
fn lerp_angle(old: f64, new: f64, alpha: f64) -> f64 {
    let delta = (new - old + 90.0).rem_euclid(180.0) - 90.0;
    (old + delta * alpha).rem_euclid(180.0)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn class_label_uses_color_then_shape() {
        let key = ClassKey::new(ShapeKind::Circle, ColorKind::NeonYellow);
        assert_eq!(key.label(), "neon_yellow_circle");
        assert_eq!(ShapeKind::from_str("rectangle").unwrap(), ShapeKind::Rectangle);
    }

    #[test]
    fn box_radius_is_quarter_perimeter_sides() {
        let extent = Extent::Box {
            width: 60.0,
            height: 20.0,
            angle: 0.0,
        };
        assert_eq!(extent.radius(), 20.0);
    }

    #[test]
    fn blend_mixes_matching_extents() {
        let old = Extent::Circle { radius: 10.0 };
        let new = Extent::Circle { radius: 20.0 };
        assert_eq!(old.blend(&new, 0.25), Extent::Circle { radius: 12.5 });
    }

    #[test]
    fn blend_wraps_box_angle_across_zero() {
        let boxed = |angle| Extent::Box {
            width: 40.0,
            height: 40.0,
            angle,
        };
        let angle_of = |extent: Extent| match extent {
            Extent::Box { angle, .. } => angle,
            Extent::Circle { .. } => unreachable!(),
        };
        let wrapped_distance = |a: f64, b: f64| {
            let d = (a - b).rem_euclid(180.0);
            d.min(180.0 - d)
        };

        let mid = angle_of(boxed(178.0).blend(&boxed(2.0), 0.5));
        assert!((0.0..180.0).contains(&mid));
        assert!(wrapped_distance(mid, 0.0) < 1e-9);

        let near_new = angle_of(boxed(170.0).blend(&boxed(10.0), 0.75));
        assert!((near_new - 5.0).abs() < 1e-9);

        let plain = angle_of(boxed(20.0).blend(&boxed(60.0), 0.25));
        assert!((plain - 30.0).abs() < 1e-9);
    }
}
