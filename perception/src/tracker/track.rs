use anyhow::{Result, bail};
use nalgebra::{Vector2, Vector3};
use serde::Serialize;

use super::kalman_filter::KalmanFilter;
use crate::models::{Candidate, Position, TrackerParams, TrackingSpace, lerp};

/// The coordinates a track is filtered and associated on.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum TrackPoint {
    Image { x: f64, y: f64 },
    World { x: f64, y: f64, z: f64 },
}

impl TrackPoint {
    /// Extracts the point of `candidate` used in `space`.
    ///
    /// Returns `None` for world tracking when the candidate has no position.
    pub fn of(candidate: &Candidate, space: TrackingSpace) -> Option<TrackPoint> {
        match space {
            TrackingSpace::Image => Some(TrackPoint::Image {
                x: candidate.cx,
                y: candidate.cy,
            }),
            TrackingSpace::World => candidate.position.map(|p| TrackPoint::World {
                x: p.x_mm,
                y: p.y_mm,
                z: p.z_mm,
            }),
        }
        .filter(TrackPoint::is_finite)
    }

    /// Euclidean distance, `None` when the two points have different dimensionality.
    pub fn distance(&self, other: &TrackPoint) -> Option<f64> {
        match (self, other) {
            (TrackPoint::Image { x: ax, y: ay }, TrackPoint::Image { x: bx, y: by }) => {
                Some((ax - bx).hypot(ay - by))
            }
            (
                TrackPoint::World {
                    x: ax,
                    y: ay,
                    z: az,
                },
                TrackPoint::World {
                    x: bx,
                    y: by,
                    z: bz,
                },
            ) => Some(Vector3::new(ax - bx, ay - by, az - bz).norm()),
            _ => None,
        }
    }

    fn is_finite(&self) -> bool {
        match *self {
            TrackPoint::Image { x, y } => x.is_finite() && y.is_finite(),
            TrackPoint::World { x, y, z } => x.is_finite() && y.is_finite() && z.is_finite(),
        }
    }
}

/// A filter whose dimensionality is fixed when the track is created.
#[derive(Debug, Clone)]
pub enum MotionFilter {
    Planar(KalmanFilter<4, 2>),
    Spatial(KalmanFilter<6, 3>),
}

impl MotionFilter {
    pub fn new(point: TrackPoint) -> Self {
        match point {
            TrackPoint::Image { x, y } => MotionFilter::Planar(KalmanFilter::new(Vector2::new(x, y))),
            TrackPoint::World { x, y, z } => {
                MotionFilter::Spatial(KalmanFilter::new(Vector3::new(x, y, z)))
            }
        }
    }

    pub fn predict(&mut self, params: &TrackerParams) {
        match self {
            MotionFilter::Planar(filter) => filter.predict(params.q_2d),
            MotionFilter::Spatial(filter) => filter.predict(params.q_3d),
        }
    }

    pub fn update(&mut self, point: TrackPoint, params: &TrackerParams) -> Result<()> {
        match (self, point) {
            (MotionFilter::Planar(filter), TrackPoint::Image { x, y }) => {
                filter.update(Vector2::new(x, y), params.r_2d)
            }
            (MotionFilter::Spatial(filter), TrackPoint::World { x, y, z }) => {
                filter.update(Vector3::new(x, y, z), params.r_3d)
            }
            _ => bail!("measurement dimensionality does not match the filter"),
        }
    }

    pub fn point(&self) -> TrackPoint {
        match self {
            MotionFilter::Planar(filter) => {
                let p = filter.position();
                TrackPoint::Image { x: p[0], y: p[1] }
            }
            MotionFilter::Spatial(filter) => {
                let p = filter.position();
                TrackPoint::World {
                    x: p[0],
                    y: p[1],
                    z: p[2],
                }
            }
        }
    }

    pub fn speed(&self) -> f64 {
        match self {
            MotionFilter::Planar(filter) => filter.velocity().norm(),
            MotionFilter::Spatial(filter) => filter.velocity().norm(),
        }
    }
}

/// A persistent object identity within one class.
#[derive(Debug, Clone)]
pub struct Track {
    pub(super) id: u64,
    pub(super) filter: MotionFilter,
    /// Working position, the filter prediction until corrected.
    pub(super) point: TrackPoint,
    pub(super) data: Candidate,
    pub(super) age: u32,
    pub(super) stable_age: u32,
    pub(super) lost: u32,
}

impl Track {
    pub(super) fn new(id: u64, point: TrackPoint, data: Candidate) -> Self {
        Self {
            id,
            filter: MotionFilter::new(point),
            point,
            data,
            age: 1,
            stable_age: 0,
            lost: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn age(&self) -> u32 {
        self.age
    }

    pub fn stable_age(&self) -> u32 {
        self.stable_age
    }

    pub fn lost(&self) -> u32 {
        self.lost
    }

    pub fn point(&self) -> TrackPoint {
        self.point
    }

    pub fn data(&self) -> &Candidate {
        &self.data
    }

    /// Gating radius growing with speed and with how long the track has been unmatched.
    pub(super) fn gate(&self, params: &TrackerParams, lost_bonus_cap: u32) -> f64 {
        params.base_match_distance
            + params.speed_gain * self.filter.speed()
            + params.lost_gain * self.lost.min(lost_bonus_cap) as f64
    }

    /// Folds a matched observation into the track.
    ///
    /// The tracked coordinates are copied from the observation while the remaining numeric
    /// fields are blended with `alpha`. Flags always follow the observation.
    pub(super) fn absorb(&mut self, observed: &Candidate, space: TrackingSpace, alpha: f64) {
        let old = &self.data;
        let (cx, cy) = match space {
            TrackingSpace::Image => (observed.cx, observed.cy),
            TrackingSpace::World => (
                lerp(old.cx, observed.cx, alpha),
                lerp(old.cy, observed.cy, alpha),
            ),
        };
        let position = match (space, old.position, observed.position) {
            (TrackingSpace::Image, Some(old), Some(new)) => Some(old.blend(&new, alpha)),
            (_, _, new) => new,
        };

        self.data = Candidate {
            shape: observed.shape,
            color: observed.color,
            cx,
            cy,
            extent: old.extent.blend(&observed.extent, alpha),
            quality: lerp(old.quality, observed.quality, alpha),
            position,
            flags: observed.flags,
        };
        self.age += 1;
        self.stable_age = if observed.flags.depth_mask_valid {
            self.stable_age + 1
        } else {
            0
        };
        self.lost = 0;
    }

    pub(super) fn mark_missed(&mut self) {
        self.lost += 1;
        self.stable_age = 0;
    }

    pub(super) fn snapshot(&self) -> TrackSnapshot {
        let mut data = self.data.clone();
        data.flags.tracker_valid = true;
        TrackSnapshot {
            id: self.id,
            age: self.age,
            stable_age: self.stable_age,
            lost: self.lost,
            data,
        }
    }
}

/// A not yet confirmed detection waiting for enough consecutive sightings.
#[derive(Debug, Clone)]
pub struct TrackCandidate {
    pub(super) point: TrackPoint,
    pub(super) data: Candidate,
    pub(super) seen: u32,
    pub(super) refreshed: bool,
}

impl TrackCandidate {
    pub(super) fn new(point: TrackPoint, data: Candidate) -> Self {
        Self {
            point,
            data,
            seen: 1,
            refreshed: true,
        }
    }

    pub(super) fn refresh(&mut self, point: TrackPoint, data: Candidate) {
        self.point = point;
        self.data = data;
        self.seen += 1;
        self.refreshed = true;
    }

    pub fn seen(&self) -> u32 {
        self.seen
    }
}

/// A mature track reported for one frame.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct TrackSnapshot {
    pub id: u64,
    pub age: u32,
    pub stable_age: u32,
    pub lost: u32,
    pub data: Candidate,
}

impl TrackSnapshot {
    pub fn position(&self) -> Option<Position> {
        self.data.position
    }
}
