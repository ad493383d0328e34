use anyhow::Result;
use opencv::{
    core::{
        BORDER_CONSTANT, Mat, Point, Scalar, Size, Vector, bitwise_or_def, in_range, merge, split,
    },
    imgproc::{
        COLOR_BGR2HSV, COLOR_BGR2Lab, COLOR_Lab2BGR, MORPH_CLOSE, MORPH_ELLIPSE, MORPH_OPEN,
        create_clahe, cvt_color_def, gaussian_blur_def, get_structuring_element_def,
        morphology_default_border_value, morphology_ex,
    },
    prelude::*,
};

use crate::models::{ColorKind, HsvRange, HsvRanges, MorphologyParams, PreprocessParams};

/// CLAHE tile grid on each image axis.
const CLAHE_TILES: i32 = 8;

/// Conditions a BGR frame before segmentation.
///
/// Equalizes the LAB lightness channel with CLAHE when `clahe_clip > 0`, then applies a
/// Gaussian blur when `blur_kernel > 0`.
pub fn preprocess(bgr: &Mat, params: &PreprocessParams) -> Result<Mat> {
    let mut frame = if params.clahe_clip > 0.0 {
        equalize_lightness(bgr, params.clahe_clip)?
    } else {
        bgr.try_clone()?
    };

    if params.blur_kernel > 0 {
        let size = odd_size(params.blur_kernel);
        let mut blurred = Mat::default();
        gaussian_blur_def(&frame, &mut blurred, Size::new(size, size), 0.0)?;
        frame = blurred;
    }

    Ok(frame)
}

fn equalize_lightness(bgr: &Mat, clip: f64) -> Result<Mat> {
    let mut lab = Mat::default();
    cvt_color_def(bgr, &mut lab, COLOR_BGR2Lab)?;
    let mut channels = Vector::<Mat>::new();
    split(&lab, &mut channels)?;

    let mut clahe = create_clahe(clip, Size::new(CLAHE_TILES, CLAHE_TILES))?;
    let mut lightness = Mat::default();
    clahe.apply(&channels.get(0)?, &mut lightness)?;
    channels.set(0, lightness)?;

    let mut equalized = Mat::default();
    merge(&channels, &mut equalized)?;
    let mut out = Mat::default();
    cvt_color_def(&equalized, &mut out, COLOR_Lab2BGR)?;
    Ok(out)
}

/// Converts a BGR `Mat` image to HSV with hue on the 0..180 scale.
pub fn to_hsv(bgr: &Mat) -> Result<Mat> {
    let mut hsv = Mat::default();
    cvt_color_def(bgr, &mut hsv, COLOR_BGR2HSV)?;
    Ok(hsv)
}

/// Builds the cleaned binary mask of `color` from an HSV image.
pub fn color_mask(
    hsv: &Mat,
    color: ColorKind,
    ranges: &HsvRanges,
    morphology: &MorphologyParams,
) -> Result<Mat> {
    let mut mask = Mat::default();
    for (i, band) in ranges.bands(color).into_iter().enumerate() {
        let band_mask = in_band(hsv, &band)?;
        if i == 0 {
            mask = band_mask;
        } else {
            let mut combined = Mat::default();
            bitwise_or_def(&mask, &band_mask, &mut combined)?;
            mask = combined;
        }
    }

    clean_mask(&mask, morphology)
}

fn in_band(hsv: &Mat, band: &HsvRange) -> Result<Mat> {
    let lower = Scalar::new(band.h_min as f64, band.s_min as f64, band.v_min as f64, 0.0);
    let upper = Scalar::new(band.h_max as f64, band.s_max as f64, band.v_max as f64, 0.0);
    let mut mask = Mat::default();
    in_range(hsv, &lower, &upper, &mut mask)?;
    Ok(mask)
}

/// Opens then closes `mask` with an elliptical kernel.
///
/// The kernel size is bumped to the next odd value and a pass with zero iterations is skipped.
pub fn clean_mask(mask: &Mat, params: &MorphologyParams) -> Result<Mat> {
    let size = odd_size(params.kernel_size);
    let kernel = get_structuring_element_def(MORPH_ELLIPSE, Size::new(size, size))?;

    let mut cleaned = mask.try_clone()?;
    for (op, iterations) in [
        (MORPH_OPEN, params.open_iterations),
        (MORPH_CLOSE, params.close_iterations),
    ] {
        if iterations <= 0 {
            continue;
        }
        let mut next = Mat::default();
        morphology_ex(
            &cleaned,
            &mut next,
            op,
            &kernel,
            Point::new(-1, -1),
            iterations,
            BORDER_CONSTANT,
            morphology_default_border_value()?,
        )?;
        cleaned = next;
    }

    Ok(cleaned)
}

#[inline]
fn odd_size(size: i32) -> i32 {
    let size = size.max(1);
    if size % 2 == 0 { size + 1 } else { size }
}

#[cfg(test)]
mod tests {
    use opencv::{
        core::{CV_8U, CV_8UC3, count_non_zero, min_max_loc, no_array},
        imgproc::{COLOR_BGR2GRAY, FILLED, LINE_8, rectangle},
    };

    use super::*;

    fn solid(b: f64, g: f64, r: f64) -> Mat {
        Mat::new_rows_cols_with_default(40, 40, CV_8UC3, Scalar::new(b, g, r, 0.0)).unwrap()
    }

    #[test]
    fn red_uses_both_hue_bands() {
        let ranges = HsvRanges::default();
        let morphology = MorphologyParams::default();

        let low_hue = to_hsv(&solid(0.0, 0.0, 255.0)).unwrap();
        let high_hue = to_hsv(&solid(40.0, 0.0, 255.0)).unwrap();
        for hsv in [low_hue, high_hue] {
            let mask = color_mask(&hsv, ColorKind::Red, &ranges, &morphology).unwrap();
            assert_eq!(count_non_zero(&mask).unwrap(), 40 * 40);
            let blue = color_mask(&hsv, ColorKind::Blue, &ranges, &morphology).unwrap();
            assert_eq!(count_non_zero(&blue).unwrap(), 0);
        }
    }

    #[test]
    fn blue_image_matches_blue_only() {
        let hsv = to_hsv(&solid(255.0, 0.0, 0.0)).unwrap();
        let ranges = HsvRanges::default();
        let morphology = MorphologyParams::default();

        let blue = color_mask(&hsv, ColorKind::Blue, &ranges, &morphology).unwrap();
        let green = color_mask(&hsv, ColorKind::Green, &ranges, &morphology).unwrap();
        assert_eq!(count_non_zero(&blue).unwrap(), 40 * 40);
        assert_eq!(count_non_zero(&green).unwrap(), 0);
    }

    #[test]
    fn opening_removes_specks() {
        let mut mask = Mat::zeros(60, 60, CV_8U).unwrap().to_mat().unwrap();
        rectangle(
            &mut mask,
            opencv::core::Rect::new(10, 10, 30, 30),
            Scalar::all(255.0),
            FILLED,
            LINE_8,
            0,
        )
        .unwrap();
        *mask.at_2d_mut::<u8>(55, 55).unwrap() = 255;

        let params = MorphologyParams {
            kernel_size: 4,
            open_iterations: 1,
            close_iterations: 1,
        };
        let cleaned = clean_mask(&mask, &params).unwrap();
        assert_eq!(*cleaned.at_2d::<u8>(55, 55).unwrap(), 0);
        assert_eq!(*cleaned.at_2d::<u8>(25, 25).unwrap(), 255);

        let untouched = clean_mask(&mask, &MorphologyParams::default()).unwrap();
        assert_eq!(count_non_zero(&untouched).unwrap(), 30 * 30 + 1);
    }

    fn split_frame(left: f64, right: f64) -> Mat {
        let mut bgr = Mat::new_rows_cols_with_default(128, 128, CV_8UC3, Scalar::all(left)).unwrap();
        rectangle(
            &mut bgr,
            opencv::core::Rect::new(64, 0, 64, 128),
            Scalar::all(right),
            FILLED,
            LINE_8,
            0,
        )
        .unwrap();
        bgr
    }

    fn gray_range(bgr: &Mat) -> f64 {
        let mut gray = Mat::default();
        cvt_color_def(bgr, &mut gray, COLOR_BGR2GRAY).unwrap();
        let (mut min, mut max) = (0.0, 0.0);
        min_max_loc(&gray, Some(&mut min), Some(&mut max), None, None, &no_array()).unwrap();
        max - min
    }

    #[test]
    fn preprocess_disabled_is_identity() {
        let bgr = split_frame(0.0, 255.0);
        let params = PreprocessParams {
            clahe_clip: 0.0,
            blur_kernel: 0,
        };
        let out = preprocess(&bgr, &params).unwrap();

        assert_eq!(out.data_bytes().unwrap(), bgr.data_bytes().unwrap());
    }

    #[test]
    fn preprocess_blur_softens_edges() {
        let bgr = split_frame(0.0, 255.0);
        let params = PreprocessParams {
            clahe_clip: 0.0,
            blur_kernel: 4,
        };
        let out = preprocess(&bgr, &params).unwrap();

        assert_eq!(out.typ(), CV_8UC3);
        assert_eq!((out.rows(), out.cols()), (128, 128));
        let edge = out.at_2d::<opencv::core::Vec3b>(64, 64).unwrap()[0];
        assert!(edge > 0 && edge < 255);
        assert_eq!(out.at_2d::<opencv::core::Vec3b>(64, 10).unwrap()[0], 0);
    }

    #[test]
    fn preprocess_clahe_stretches_contrast() {
        let bgr = split_frame(100.0, 120.0);
        let params = PreprocessParams {
            clahe_clip: 40.0,
            blur_kernel: 0,
        };
        let out = preprocess(&bgr, &params).unwrap();

        assert!(gray_range(&out) > gray_range(&bgr) + 5.0);
    }
}
