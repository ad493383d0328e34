use std::collections::HashMap;

use anyhow::Result;
use log::{debug, error};
use opencv::{core::Mat, prelude::*};
use serde::Serialize;

use crate::{
    decision::decide,
    detect::detect,
    mat::DepthMap,
    models::{Candidate, ClassKey, ColorKind, Params, TrackingSpace},
    position::{CameraMount, Intrinsics, estimate},
    publish::{AcceptedObject, Publisher},
    segment::{color_mask, preprocess, to_hsv},
    tracker::MultiObjectTracker,
    verify::{AiBox, BufferedBox, VerifiedBoxes, verify},
};

/// One synchronized camera frame.
#[derive(Debug)]
pub struct Frame {
    /// 8-bit BGR color image.
    pub bgr: Mat,
    /// Depth aligned to `bgr`, millimetres.
    pub depth: DepthMap,
    pub intrinsics: Intrinsics,
    pub ai_boxes: Vec<AiBox>,
}

/// Everything the pipeline produced for one frame.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FrameReport {
    pub accepted: Vec<AcceptedObject>,
    pub verified_boxes: Vec<BufferedBox>,
}

/// The sequential per-frame loop from color frame to published objects.
pub struct Pipeline {
    targets: Vec<ClassKey>,
    tracker: MultiObjectTracker,
    verified: VerifiedBoxes,
    publisher: Box<dyn Publisher>,
    mount: Option<CameraMount>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("targets", &self.targets)
            .field("tracker", &self.tracker)
            .field("verified", &self.verified)
            .field("mount", &self.mount)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        targets: Vec<ClassKey>,
        publisher: Box<dyn Publisher>,
        mount: Option<CameraMount>,
    ) -> Result<Self> {
        Ok(Self {
            targets,
            tracker: MultiObjectTracker::new()?,
            verified: VerifiedBoxes::default(),
            publisher,
            mount,
        })
    }

    pub fn targets(&self) -> &[ClassKey] {
        &self.targets
    }

    pub fn tracker(&self) -> &MultiObjectTracker {
        &self.tracker
    }

    /// Clears tracks, track ids and buffered boxes.
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.verified.clear();
    }

    /// Runs `frame` through every stage once and publishes the accepted objects.
    ///
    /// The frame is conditioned before segmentation while depth estimation and AI
    /// footprints keep using the raw geometry.
    ///
    /// Publisher failures are logged and do not stop the frame. Tracker failures are
    /// returned as is.
    pub fn process(&mut self, frame: &Frame, params: &Params) -> Result<FrameReport> {
        params.validate()?;

        let conditioned = preprocess(&frame.bgr, &params.preprocess)?;
        let hsv = to_hsv(&conditioned)?;
        let mut masks = HashMap::<ColorKind, Mat>::new();
        let mut candidates = Vec::<Candidate>::new();
        for class in &self.targets {
            if !masks.contains_key(&class.color) {
                let mask = color_mask(&hsv, class.color, &params.hsv, &params.morphology)?;
                masks.insert(class.color, mask);
            }
            let mask = &masks[&class.color];

            for mut candidate in detect(class.shape, class.color, mask, params) {
                let depth = estimate(
                    &candidate,
                    &frame.depth,
                    &frame.intrinsics,
                    Some(mask),
                    &params.depth,
                );
                if !depth.is_empty() {
                    candidate.position = Some(depth.position);
                    candidate.flags.depth_valid = depth.depth_valid;
                    candidate.flags.depth_mask_valid = depth.depth_mask_valid;
                }
                candidates.push(candidate);
            }
        }

        let matched = verify(
            &mut candidates,
            &frame.ai_boxes,
            frame.bgr.cols(),
            frame.bgr.rows(),
            &params.verify,
        );
        self.verified.update(matched, &params.verify);

        if params.tracker.space == TrackingSpace::World {
            let before = candidates.len();
            candidates.retain(|candidate| candidate.flags.depth_valid);
            if candidates.len() != before {
                debug!(target: "pipeline", "dropped {} candidates without depth", before - candidates.len());
            }
        }

        let mut accepted = Vec::new();
        for class in &self.targets {
            let class_candidates = candidates
                .iter()
                .filter(|candidate| candidate.class() == *class)
                .cloned()
                .collect::<Vec<_>>();
            for snapshot in self.tracker.track(*class, &class_candidates, params)? {
                let decision = decide(*class, &snapshot.data.flags, &params.decision);
                if !decision.accepted {
                    debug!(
                        target: "pipeline",
                        "{class} track {} rejected with score {:.2}",
                        snapshot.id,
                        decision.score
                    );
                    continue;
                }
                let robot_position = self
                    .mount
                    .zip(snapshot.position())
                    .map(|(mount, position)| mount.to_robot(position));
                accepted.push(AcceptedObject {
                    snapshot,
                    decision,
                    robot_position,
                });
            }
        }

        for object in &accepted {
            if let Err(err) = self.publisher.publish(object) {
                error!(target: "pipeline", "failed to publish track {}: {err}", object.snapshot.id);
            }
        }

        Ok(FrameReport {
            accepted,
            verified_boxes: self.verified.entries().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use opencv::{
        core::{CV_8UC3, Rect, Scalar},
        imgproc::{FILLED, LINE_8, rectangle},
    };

    use super::*;
    use crate::{
        Error,
        models::ShapeKind,
        publish::MockPublisher,
    };

    const BLUE_SQUARE: ClassKey = ClassKey {
        shape: ShapeKind::Square,
        color: ColorKind::Blue,
    };

    fn frame(depth_mm: u16, with_square: bool, ai_boxes: Vec<AiBox>) -> Frame {
        let mut bgr = Mat::new_rows_cols_with_default(400, 640, CV_8UC3, Scalar::all(0.0)).unwrap();
        if with_square {
            rectangle(
                &mut bgr,
                Rect::new(270, 150, 100, 100),
                Scalar::new(255.0, 0.0, 0.0, 0.0),
                FILLED,
                LINE_8,
                0,
            )
            .unwrap();
        }

        Frame {
            bgr,
            depth: DepthMap::new(400, 640, vec![depth_mm; 400 * 640]).unwrap(),
            intrinsics: Intrinsics {
                fx: 500.0,
                fy: 500.0,
                cx: 320.0,
                cy: 200.0,
            },
            ai_boxes,
        }
    }

    fn square_box() -> AiBox {
        AiBox {
            left: 270.0,
            top: 150.0,
            right: 370.0,
            bottom: 250.0,
            label: "cube".to_string(),
            confidence: 0.8,
        }
    }

    #[test]
    fn stable_square_is_accepted_and_published() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|object| object.snapshot.id == 1 && object.decision.accepted)
            .times(1..)
            .returning(|_| Ok(()));
        let mut pipeline = Pipeline::new(
            vec![BLUE_SQUARE],
            Box::new(publisher),
            Some(CameraMount::default()),
        )
        .unwrap();
        let params = Params::default();

        let mut reports = Vec::new();
        for _ in 0..8 {
            reports.push(pipeline.process(&frame(800, true, vec![square_box()]), &params).unwrap());
        }

        assert!(reports[..3].iter().all(|report| report.accepted.is_empty()));
        let last = reports.last().unwrap();
        assert_eq!(last.accepted.len(), 1);
        let object = &last.accepted[0];
        let flags = object.snapshot.data.flags;
        assert!(flags.color_valid && flags.shape_valid && flags.ai_valid);
        assert!(flags.depth_valid && flags.depth_mask_valid && flags.tracker_valid);
        assert_eq!(object.decision.label, "blue_square");
        let camera = object.snapshot.position().unwrap();
        assert!((camera.z_mm - 800.0).abs() < 1e-6);
        assert!(camera.x_mm.abs() < 5.0);
        assert!(object.robot_position.is_some());
        assert_eq!(last.verified_boxes.len(), 1);
    }

    #[test]
    fn out_of_range_depth_is_dropped_in_world_space() {
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().never();
        let mut pipeline = Pipeline::new(vec![BLUE_SQUARE], Box::new(publisher), None).unwrap();
        let mut params = Params::default();
        params.tracker.space = TrackingSpace::World;

        for _ in 0..8 {
            let report = pipeline.process(&frame(3000, true, vec![]), &params).unwrap();
            assert!(report.accepted.is_empty());
        }
        assert!(pipeline.tracker().pending(BLUE_SQUARE).is_empty());
        assert!(pipeline.tracker().tracks(BLUE_SQUARE).is_empty());
    }

    #[test]
    fn publisher_failure_does_not_fail_frame() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .returning(|_| Err(anyhow!("transport closed")));
        let mut pipeline = Pipeline::new(vec![BLUE_SQUARE], Box::new(publisher), None).unwrap();
        let params = Params::default();

        let accepted = (0..8)
            .map(|_| pipeline.process(&frame(800, true, vec![]), &params).unwrap())
            .map(|report| report.accepted.len())
            .sum::<usize>();
        assert!(accepted > 0);

        pipeline.reset();
        assert!(pipeline.tracker().tracks(BLUE_SQUARE).is_empty());
    }

    #[test]
    fn invalid_params_fail_before_work() {
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().never();
        let mut pipeline = Pipeline::new(vec![BLUE_SQUARE], Box::new(publisher), None).unwrap();
        let mut params = Params::default();
        params.tracker.alpha = -1.0;

        let err = pipeline.process(&frame(800, true, vec![]), &params).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::InvalidParams(_))));
        assert!(pipeline.tracker().pending(BLUE_SQUARE).is_empty());
    }
}
