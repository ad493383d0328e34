use std::f64::consts::PI;

use anyhow::Result;
use log::{debug, error};
use opencv::{
    core::{
        CV_8U, CV_8UC1, Mat, MatExprTraitConst, MatTraitConst, Point, Rect, Scalar, Size, Vec3f,
        Vector, bitwise_and_def, count_non_zero,
    },
    imgproc::{
        CHAIN_APPROX_SIMPLE, FILLED, HOUGH_GRADIENT, LINE_8, RETR_EXTERNAL, approx_poly_dp,
        arc_length, circle, contour_area, convex_hull_def, find_contours_def, gaussian_blur_def,
        hough_circles, min_area_rect,
    },
};

use crate::{
    models::{
        Candidate, CircleParams, ColorKind, Extent, Params, QuadParams, ShapeKind, ValidityFlags,
    },
    position::mask_overlap,
};

/// Two circles closer than this fraction of the radius are considered the same.
const DUPLICATE_CENTER_RATIO: f64 = 0.5;
/// Two circles whose radii differ less than this many pixels are considered the same.
const DUPLICATE_RADIUS_PX: f64 = 10.0;

/// A detection before it is attached to a class.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Shape2d {
    cx: f64,
    cy: f64,
    extent: Extent,
    quality: f64,
}

impl Shape2d {
    fn into_candidate(self, shape: ShapeKind, color: ColorKind) -> Candidate {
        Candidate {
            shape,
            color,
            cx: self.cx,
            cy: self.cy,
            extent: self.extent,
            quality: self.quality,
            position: None,
            flags: ValidityFlags {
                color_valid: true,
                shape_valid: true,
                ..ValidityFlags::default()
            },
        }
    }
}

/// Detects `shape` candidates of `color` in a binary segmentation `mask`.
///
/// Returns an empty list when `mask` is empty or not single channel 8-bit. OpenCV failures
/// are logged and also produce an empty list.
pub fn detect(
    shape: ShapeKind,
    color: ColorKind,
    mask: &Mat,
    params: &Params,
) -> Vec<Candidate> {
    if mask.empty() || mask.typ() != CV_8UC1 {
        return vec![];
    }

    let shapes = match shape {
        ShapeKind::Circle => detect_circles(mask, &params.circle),
        ShapeKind::Square => detect_quads(mask, &params.square),
        ShapeKind::Rectangle => detect_quads(mask, &params.rectangle),
    };
    match shapes {
        Ok(shapes) => {
            debug!(target: "detect", "{color} {shape}: {} candidates", shapes.len());
            shapes
                .into_iter()
                .map(|detected| detected.into_candidate(shape, color))
                .collect()
        }
        Err(err) => {
            error!(target: "detect", "{color} {shape} detection failed: {err}");
            vec![]
        }
    }
}

fn detect_circles(mask: &Mat, params: &CircleParams) -> Result<Vec<Shape2d>> {
    let kernel = odd_kernel(params.blur_kernel);
    let mut blurred = Mat::default();
    gaussian_blur_def(mask, &mut blurred, Size::new(kernel, kernel), 0.0)?;

    let mut circles = Vector::<Vec3f>::new();
    hough_circles(
        &blurred,
        &mut circles,
        HOUGH_GRADIENT,
        params.dp,
        params.min_dist,
        params.param1,
        params.param2,
        params.min_radius,
        params.max_radius,
    )?;

    let (width, height) = (mask.cols(), mask.rows());
    let max_radius = (width.min(height) / 2).max(1);
    let mut kept = Vec::<Shape2d>::new();
    for found in circles {
        let cx = (found[0].round() as i32).clamp(0, width - 1);
        let cy = (found[1].round() as i32).clamp(0, height - 1);
        let r = (found[2].round() as i32).clamp(1, max_radius);

        if *mask.at_2d::<u8>(cy, cx)? == 0 {
            continue;
        }
        let patch = Rect::from_points(
            Point::new((cx - r).max(0), (cy - r).max(0)),
            Point::new((cx + r + 1).min(width), (cy + r + 1).min(height)),
        );
        if count_non_zero(&mask.roi(patch)?.try_clone()?)? < params.min_area {
            continue;
        }

        let mut disk = Mat::zeros(height, width, CV_8U)?.to_mat()?;
        circle(
            &mut disk,
            Point::new(cx, cy),
            r,
            Scalar::all(255.0),
            FILLED,
            LINE_8,
            0,
        )?;
        let mut blob = Mat::default();
        bitwise_and_def(mask, &disk, &mut blob)?;
        let Some(circularity) = largest_contour_circularity(&blob)? else {
            continue;
        };
        if circularity < params.min_circularity {
            continue;
        }
        if mask_overlap(mask, cx, cy, r)? < params.min_mask_overlap {
            continue;
        }

        let detected = Shape2d {
            cx: cx as f64,
            cy: cy as f64,
            extent: Extent::Circle { radius: r as f64 },
            quality: circularity,
        };
        if !kept.iter().any(|prev| is_duplicate_circle(prev, &detected)) {
            kept.push(detected);
        }
    }

    Ok(kept)
}

/// Circularity `4πA/P²` of the largest external contour, `None` without a usable contour.
fn largest_contour_circularity(blob: &Mat) -> Result<Option<f64>> {
    let mut contours = Vector::<Vector<Point>>::new();
    find_contours_def(blob, &mut contours, RETR_EXTERNAL, CHAIN_APPROX_SIMPLE)?;

    let mut largest = None::<(f64, Vector<Point>)>;
    for contour in contours {
        let area = contour_area(&contour, false)?;
        if largest.as_ref().is_none_or(|(best, _)| area > *best) {
            largest = Some((area, contour));
        }
    }
    let Some((area, contour)) = largest else {
        return Ok(None);
    };
    let perimeter = arc_length(&contour, true)?;
    if perimeter == 0.0 {
        return Ok(None);
    }

    Ok(Some(4.0 * PI * area / (perimeter * perimeter)))
}

fn is_duplicate_circle(prev: &Shape2d, next: &Shape2d) -> bool {
    let dx = next.cx - prev.cx;
    let dy = next.cy - prev.cy;
    let dr = next.extent.radius() - prev.extent.radius();
    let limit = DUPLICATE_CENTER_RATIO * next.extent.radius();

    dx * dx + dy * dy < limit * limit && dr.abs() < DUPLICATE_RADIUS_PX
}

fn detect_quads(mask: &Mat, params: &QuadParams) -> Result<Vec<Shape2d>> {
    let mut contours = Vector::<Vector<Point>>::new();
    find_contours_def(mask, &mut contours, RETR_EXTERNAL, CHAIN_APPROX_SIMPLE)?;

    let mut quads = Vec::new();
    for contour in contours {
        let perimeter = arc_length(&contour, true)?;
        let mut approx = Vector::<Point>::new();
        approx_poly_dp(&contour, &mut approx, params.epsilon_scale * perimeter, true)?;
        if approx.len() != 4 {
            continue;
        }

        let area = contour_area(&contour, false)?;
        if area < params.min_area || area > params.max_area {
            continue;
        }

        let mut hull = Vector::<Point>::new();
        convex_hull_def(&contour, &mut hull)?;
        let hull_area = contour_area(&hull, false)?;
        if hull_area == 0.0 || area / hull_area < params.min_solidity {
            continue;
        }

        let circularity = 4.0 * PI * area / (perimeter * perimeter + 1e-6);
        if circularity > params.max_circularity {
            continue;
        }

        let rect = min_area_rect(&contour)?;
        let (mut width, mut height) = (rect.size.width as f64, rect.size.height as f64);
        let mut angle = rect.angle as f64;
        if width < height {
            std::mem::swap(&mut width, &mut height);
            angle += 90.0;
        }
        let angle = angle.rem_euclid(180.0);
        if height == 0.0 {
            continue;
        }

        let aspect = width / height;
        if aspect < params.min_aspect || aspect > params.max_aspect {
            continue;
        }
        let extent = area / (width * height);
        if extent < params.min_extent {
            continue;
        }

        quads.push(Shape2d {
            cx: rect.center.x as f64,
            cy: rect.center.y as f64,
            extent: Extent::Box {
                width,
                height,
                angle,
            },
            quality: extent,
        });
    }

    Ok(quads)
}

#[inline]
fn odd_kernel(size: i32) -> i32 {
    let size = size.max(1);
    if size % 2 == 0 { size + 1 } else { size }
}
