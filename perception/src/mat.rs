use anyhow::{Result, bail};
use opencv::core::{CV_16UC1, Mat, MatTraitConst, MatTraitConstManual};

/// A 16-bit depth image in millimetres that owns its buffer.
#[derive(Debug, Clone)]
pub struct DepthMap {
    rows: i32,
    cols: i32,
    data: Vec<u16>,
}

impl DepthMap {
    #[inline]
    pub fn new(rows: i32, cols: i32, data: Vec<u16>) -> Result<Self> {
        if rows <= 0 || cols <= 0 || data.len() != rows as usize * cols as usize {
            bail!("depth buffer of {} values does not match {rows}x{cols}", data.len());
        }
        Ok(Self { rows, cols, data })
    }

    /// Copies a `CV_16UC1` [`Mat`] into an owned depth map.
    pub fn from_mat(mat: &impl MatTraitConst) -> Result<Self> {
        if mat.typ() != CV_16UC1 {
            bail!("depth map must be single channel 16-bit");
        }
        let mat = if mat.is_continuous() {
            mat.try_clone()?
        } else {
            let mut continuous = Mat::default();
            mat.copy_to(&mut continuous)?;
            continuous
        };

        Self::new(mat.rows(), mat.cols(), mat.data_typed::<u16>()?.to_vec())
    }

    pub fn rows(&self) -> i32 {
        self.rows
    }

    pub fn cols(&self) -> i32 {
        self.cols
    }

    #[inline]
    pub fn get(&self, row: i32, col: i32) -> Option<u16> {
        if row < 0 || col < 0 || row >= self.rows || col >= self.cols {
            return None;
        }
        self.data.get((row * self.cols + col) as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use opencv::core::{CV_8UC1, Rect, Scalar};

    use super::*;

    #[test]
    fn new_rejects_mismatched_buffer() {
        assert!(DepthMap::new(2, 2, vec![0; 3]).is_err());
        assert!(DepthMap::new(0, 2, vec![]).is_err());
    }

    #[test]
    fn from_mat_round_trips_values() {
        let mat = Mat::new_rows_cols_with_default(3, 4, CV_16UC1, Scalar::all(750.0)).unwrap();
        let depth = DepthMap::from_mat(&mat).unwrap();

        assert_eq!(depth.rows(), 3);
        assert_eq!(depth.cols(), 4);
        assert_eq!(depth.get(2, 3), Some(750));
        assert_eq!(depth.get(3, 0), None);

        let wrong = Mat::new_rows_cols_with_default(3, 4, CV_8UC1, Scalar::all(1.0)).unwrap();
        assert!(DepthMap::from_mat(&wrong).is_err());
    }

    #[test]
    fn from_mat_copies_sub_views() {
        let data = (0..20u16).collect::<Vec<_>>();
        let full = DepthMap::new(4, 5, data).unwrap();
        assert_eq!(full.get(1, 2), Some(7));

        let mut mat = Mat::new_rows_cols_with_default(4, 5, CV_16UC1, Scalar::all(0.0)).unwrap();
        for row in 0..4 {
            for col in 0..5 {
                *mat.at_2d_mut::<u16>(row, col).unwrap() = (row * 5 + col) as u16;
            }
        }
        let view = mat.roi(Rect::new(1, 1, 3, 2)).unwrap();
        assert!(!view.is_continuous());

        let depth = DepthMap::from_mat(&view).unwrap();
        assert_eq!((depth.rows(), depth.cols()), (2, 3));
        assert_eq!(depth.get(0, 0), Some(6));
        assert_eq!(depth.get(1, 2), Some(13));
    }
}
