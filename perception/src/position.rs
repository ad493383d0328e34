use anyhow::Result;
use log::debug;
use nalgebra::{Rotation3, Vector3};
use opencv::{
    core::{
        CV_8U, CV_8UC1, Mat, MatExprTraitConst, MatTraitConst, MatTraitConstManual, Point, Scalar,
        bitwise_and_def, count_non_zero,
    },
    imgproc::{FILLED, LINE_8, circle, moments},
};
use serde::{Deserialize, Serialize};

use crate::{
    mat::DepthMap,
    models::{Candidate, DepthParams, Position},
};

/// Fewest in-range depth samples accepted for an estimate.
const MIN_DEPTH_SAMPLES: usize = 20;
/// Smallest radius in pixels worth sampling.
const MIN_RADIUS: i32 = 3;

/// Pinhole camera intrinsics in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// The 3D estimate of one candidate.
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct DepthEstimate {
    pub position: Position,
    pub depth_valid: bool,
    pub depth_mask_valid: bool,
}

impl DepthEstimate {
    pub fn is_empty(&self) -> bool {
        *self == DepthEstimate::default()
    }
}

/// Back-projects pixel `(u, v)` at depth `z` into camera coordinates.
#[inline]
pub fn to_3d(u: f64, v: f64, z: f64, intrinsics: &Intrinsics) -> Position {
    Position {
        x_mm: (u - intrinsics.cx) * z / intrinsics.fx,
        y_mm: (v - intrinsics.cy) * z / intrinsics.fy,
        z_mm: z,
    }
}

/// Fraction of the filled disk at `(cx, cy, r)` covered by `mask`.
pub fn mask_overlap(mask: &Mat, cx: i32, cy: i32, r: i32) -> Result<f64> {
    if r <= 0 {
        return Ok(0.0);
    }
    let disk = filled_disk(mask.rows(), mask.cols(), cx, cy, r)?;
    let mut overlap = Mat::default();
    bitwise_and_def(mask, &disk, &mut overlap)?;

    let disk_area = count_non_zero(&disk)?;
    if disk_area == 0 {
        return Ok(0.0);
    }
    Ok(count_non_zero(&overlap)? as f64 / disk_area as f64)
}

/// Estimates the camera-frame position of `candidate` from `depth`.
///
/// Degenerate geometry or too few usable depth samples yields an empty estimate instead of
/// an error.
pub fn estimate(
    candidate: &Candidate,
    depth: &DepthMap,
    intrinsics: &Intrinsics,
    mask: Option<&Mat>,
    params: &DepthParams,
) -> DepthEstimate {
    match estimate_inner(candidate, depth, intrinsics, mask, params) {
        Ok(estimate) => estimate.unwrap_or_default(),
        Err(err) => {
            debug!(target: "position", "estimate failed for {}: {err}", candidate.class());
            DepthEstimate::default()
        }
    }
}

fn estimate_inner(
    candidate: &Candidate,
    depth: &DepthMap,
    intrinsics: &Intrinsics,
    mask: Option<&Mat>,
    params: &DepthParams,
) -> Result<Option<DepthEstimate>> {
    let (cx, cy, r) = (
        candidate.cx.round(),
        candidate.cy.round(),
        candidate.radius().round(),
    );
    if !(cx.is_finite() && cy.is_finite() && r.is_finite()) {
        return Ok(None);
    }
    // Disks larger than the image are degenerate and would overflow the window bounds
    if r > depth.rows().max(depth.cols()) as f64 {
        return Ok(None);
    }
    let (cx, cy, r) = (cx as i32, cy as i32, r as i32);
    if !(0..depth.cols()).contains(&cx) || !(0..depth.rows()).contains(&cy) || r <= MIN_RADIUS {
        return Ok(None);
    }
    if let Some(mask) = mask
        && (mask.typ() != CV_8UC1 || mask.rows() != depth.rows() || mask.cols() != depth.cols())
    {
        return Ok(None);
    }

    let mut roi = filled_disk(depth.rows(), depth.cols(), cx, cy, r)?;
    if let Some(mask) = mask {
        let mut masked = Mat::default();
        bitwise_and_def(&roi, mask, &mut masked)?;
        roi = masked;
    }

    let mut samples = Vec::new();
    let roi_data = roi.data_typed::<u8>()?;
    let (row_start, row_end) = ((cy - r).max(0), (cy + r + 1).min(depth.rows()));
    let (col_start, col_end) = ((cx - r).max(0), (cx + r + 1).min(depth.cols()));
    for row in row_start..row_end {
        for col in col_start..col_end {
            if roi_data[(row * depth.cols() + col) as usize] == 0 {
                continue;
            }
            let Some(value) = depth.get(row, col) else {
                continue;
            };
            let value = value as f64;
            if value >= params.min_mm && value <= params.max_mm {
                samples.push(value);
            }
        }
    }
    if samples.len() < MIN_DEPTH_SAMPLES {
        return Ok(None);
    }
    let z = median(&mut samples) + params.offset_mm;

    let m = moments(&roi, true)?;
    if m.m00 == 0.0 {
        return Ok(None);
    }
    let position = to_3d(m.m10 / m.m00, m.m01 / m.m00, z, intrinsics);

    let overlap = match mask {
        Some(mask) => mask_overlap(mask, cx, cy, r)?,
        None => mask_overlap(&roi, cx, cy, r)?,
    };

    Ok(Some(DepthEstimate {
        position,
        depth_valid: z >= params.min_mm && z <= params.max_mm,
        depth_mask_valid: overlap >= params.mask_overlap_ok,
    }))
}

fn filled_disk(rows: i32, cols: i32, cx: i32, cy: i32, r: i32) -> Result<Mat> {
    let mut disk = Mat::zeros(rows, cols, CV_8U)?.to_mat()?;
    circle(
        &mut disk,
        Point::new(cx, cy),
        r,
        Scalar::all(255.0),
        FILLED,
        LINE_8,
        0,
    )?;
    Ok(disk)
}

/// Mean of the two middle values for even counts.
fn median(samples: &mut [f64]) -> f64 {
    samples.sort_by(f64::total_cmp);
    let mid = samples.len() / 2;
    if samples.len() % 2 == 0 {
        (samples[mid - 1] + samples[mid]) / 2.0
    } else {
        samples[mid]
    }
}

/// Static placement of the camera relative to the robot base.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraMount {
    pub lateral_mm: f64,
    pub forward_mm: f64,
    pub height_mm: f64,
    /// Downward tilt about the camera x axis.
    pub tilt_degrees: f64,
}

impl Default for CameraMount {
    fn default() -> Self {
        Self {
            lateral_mm: 185.0,
            forward_mm: 0.0,
            height_mm: 195.0,
            tilt_degrees: 27.5,
        }
    }
}

impl CameraMount {
    /// Rotates `position` by the tilt, then offsets it into the robot frame.
    pub fn to_robot(&self, position: Position) -> Position {
        let rotation = Rotation3::from_axis_angle(&Vector3::x_axis(), self.tilt_degrees.to_radians());
        let rotated = rotation * Vector3::new(position.x_mm, position.y_mm, position.z_mm);

        Position {
            x_mm: rotated.x + self.lateral_mm,
            y_mm: rotated.y + self.forward_mm,
            z_mm: self.height_mm - rotated.z,
        }
    }
}
