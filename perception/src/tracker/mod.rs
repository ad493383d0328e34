use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use anyhow::anyhow;
use log::{debug, info};

use crate::{
    Error, Result,
    models::{Candidate, ClassKey, Params, TrackerParams},
    task::BoundedCall,
};

mod kalman_filter;
mod track;

pub use kalman_filter::KalmanFilter;
pub use track::{MotionFilter, Track, TrackCandidate, TrackPoint, TrackSnapshot};

/// Cap on the lost-frame term of the gating radius.
const LOST_BONUS_CAP: u32 = 5;
/// Cost assigned to pairs outside of the gate.
const FORBIDDEN_COST: f64 = 1e6;

/// Per-class track and pending candidate lists.
#[derive(Debug, Default)]
struct ClassTracker {
    tracks: Vec<Track>,
    pending: Vec<TrackCandidate>,
}

/// Kalman-filtered multi-object tracker keeping one independent track list per class.
///
/// Track ids are drawn from a counter shared by every class so they stay unique across the
/// whole tracker until [`MultiObjectTracker::reset`].
#[derive(Debug)]
pub struct MultiObjectTracker {
    classes: HashMap<ClassKey, ClassTracker>,
    next_id: AtomicU64,
    bounded: BoundedCall,
}

impl MultiObjectTracker {
    pub fn new() -> Result<Self> {
        Ok(Self {
            classes: HashMap::new(),
            next_id: AtomicU64::new(1),
            bounded: BoundedCall::new()?,
        })
    }

    /// Drops every track and pending candidate and restarts ids at 1.
    pub fn reset(&mut self) {
        self.classes.clear();
        self.next_id.store(1, Ordering::Relaxed);
        info!(target: "tracker", "tracker reset");
    }

    pub fn tracks(&self, class: ClassKey) -> &[Track] {
        self.classes
            .get(&class)
            .map(|tracker| tracker.tracks.as_slice())
            .unwrap_or_default()
    }

    pub fn pending(&self, class: ClassKey) -> &[TrackCandidate] {
        self.classes
            .get(&class)
            .map(|tracker| tracker.pending.as_slice())
            .unwrap_or_default()
    }

    /// Advances `class` by one frame with `candidates` and returns its mature tracks.
    pub fn track(
        &mut self,
        class: ClassKey,
        candidates: &[Candidate],
        params: &Params,
    ) -> Result<Vec<TrackSnapshot>> {
        params.validate()?;
        let tracker_params = &params.tracker;
        let points = candidates
            .iter()
            .enumerate()
            .map(|(index, candidate)| {
                TrackPoint::of(candidate, tracker_params.space)
                    .ok_or(Error::MissingPosition { class, index })
            })
            .collect::<Result<Vec<_>>>()?;

        let timing = &params.timing;
        let predict_deadline = Duration::from_millis(timing.predict_deadline_millis);
        let correct_deadline = Duration::from_millis(timing.correct_deadline_millis);
        let assign_deadline = Duration::from_millis(timing.assign_deadline_millis);
        self.bounded.set_attempts(timing.retries);

        let state = self.classes.entry(class).or_default();

        // 1. Predict
        for track in &mut state.tracks {
            let filter = track.filter.clone();
            let noise = tracker_params.clone();
            track.filter = self.bounded.call("predict", predict_deadline, move || {
                let mut filter = filter.clone();
                filter.predict(&noise);
                Ok(filter)
            })?;
            track.point = track.filter.point();
        }

        // 2. Associate
        let costs = gated_costs(&state.tracks, &points, tracker_params);
        let (matches, unmatched_tracks, unmatched_candidates) = if costs.is_empty() {
            (vec![], (0..state.tracks.len()).collect(), (0..points.len()).collect())
        } else {
            self.bounded.call("assign", assign_deadline, move || {
                linear_assignment(&costs, FORBIDDEN_COST)
            })?
        };

        // 3. Correct
        for (ti, ci) in matches {
            let track = &mut state.tracks[ti];
            let filter = track.filter.clone();
            let point = points[ci];
            let noise = tracker_params.clone();
            track.filter = self.bounded.call("correct", correct_deadline, move || {
                let mut filter = filter.clone();
                filter.update(point, &noise)?;
                Ok(filter)
            })?;
            track.point = point;
            track.absorb(&candidates[ci], tracker_params.space, tracker_params.alpha);
        }

        // 4. Age unmatched tracks
        for ti in unmatched_tracks {
            state.tracks[ti].mark_missed();
        }

        // 5. Spawn
        spawn(
            state,
            &self.next_id,
            unmatched_candidates
                .into_iter()
                .map(|ci| (points[ci], &candidates[ci])),
            tracker_params,
            class,
        );

        // 6. Prune
        let max_lost = tracker_params.max_lost_clamped();
        state.tracks.retain(|track| {
            let keep = track.lost <= max_lost;
            if !keep {
                debug!(target: "tracker", "{class} track {} pruned after {} lost frames", track.id, track.lost);
            }
            keep
        });

        // 7. Report
        Ok(state
            .tracks
            .iter()
            .filter(|track| track.lost == 0 && track.stable_age >= tracker_params.min_stable_age)
            .map(Track::snapshot)
            .collect())
    }
}

fn gated_costs(tracks: &[Track], points: &[TrackPoint], params: &TrackerParams) -> Vec<Vec<f64>> {
    if tracks.is_empty() || points.is_empty() {
        return vec![];
    }

    tracks
        .iter()
        .map(|track| {
            let gate = track.gate(params, LOST_BONUS_CAP);
            points
                .iter()
                .map(|point| match track.point.distance(point) {
                    Some(distance) if distance <= gate => distance,
                    _ => FORBIDDEN_COST,
                })
                .collect()
        })
        .collect()
}

fn spawn<'a>(
    state: &mut ClassTracker,
    next_id: &AtomicU64,
    unmatched: impl Iterator<Item = (TrackPoint, &'a Candidate)>,
    params: &TrackerParams,
    class: ClassKey,
) {
    for pending in &mut state.pending {
        pending.refreshed = false;
    }

    for (point, candidate) in unmatched {
        if candidate.radius() < params.min_spawn_radius {
            continue;
        }
        let nearest = state
            .pending
            .iter_mut()
            .filter(|pending| !pending.refreshed)
            .filter_map(|pending| {
                pending
                    .point
                    .distance(&point)
                    .filter(|distance| *distance <= params.base_match_distance)
                    .map(|distance| (distance, pending))
            })
            .min_by(|(a, _), (b, _)| a.total_cmp(b));
        match nearest {
            Some((_, pending)) => pending.refresh(point, candidate.clone()),
            None => state
                .pending
                .push(TrackCandidate::new(point, candidate.clone())),
        }
    }

    let mut kept = Vec::with_capacity(state.pending.len());
    for pending in state.pending.drain(..) {
        if !pending.refreshed {
            continue;
        }
        if pending.seen >= params.spawn_persist {
            let id = next_id.fetch_add(1, Ordering::Relaxed);
            debug!(target: "tracker", "{class} track {id} spawned after {} frames", pending.seen);
            state.tracks.push(Track::new(id, pending.point, pending.data));
        } else {
            kept.push(pending);
        }
    }
    state.pending = kept;
}

/// Solves the rectangular assignment problem on `costs`.
///
/// Returns the matches, unmatched rows and unmatched columns. Pairs assigned a cost of at
/// least `forbidden` are treated as unmatched.
fn linear_assignment(
    costs: &[Vec<f64>],
    forbidden: f64,
) -> anyhow::Result<(Vec<(usize, usize)>, Vec<usize>, Vec<usize>)> {
    use lapjv::{Matrix, lapjv};

    let n = costs.len();
    let m = if n > 0 { costs[0].len() } else { 0 };
    if n == 0 || m == 0 {
        return Ok((vec![], (0..n).collect(), (0..m).collect()));
    }

    let k = n.max(m);
    let mut data = vec![forbidden; k * k];
    for i in 0..n {
        for j in 0..m {
            data[i * k + j] = costs[i][j];
        }
    }

    let mat = Matrix::from_shape_vec((k, k), data)?;
    let (x, _) = lapjv(&mat).map_err(|err| anyhow!("lapjv failed: {err:?}"))?;

    let mut matches = Vec::new();
    let mut unmatched_a = Vec::new();
    let mut unmatched_b = vec![true; m];

    for (i, &j) in x.iter().enumerate().take(n) {
        if j < m && costs[i][j] < forbidden {
            matches.push((i, j));
            unmatched_b[j] = false;
        } else {
            unmatched_a.push(i);
        }
    }

    let unmatched_b = unmatched_b
        .iter()
        .enumerate()
        .filter_map(|(j, &u)| if u { Some(j) } else { None })
        .collect();

    Ok((matches, unmatched_a, unmatched_b))
}
