use log::debug;
use serde::{Deserialize, Serialize};

use crate::models::{Candidate, VerifyParams};

/// An axis-aligned box reported by the external verifier, in pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AiBox {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub label: String,
    pub confidence: f64,
}

impl AiBox {
    #[inline]
    pub fn corners(&self) -> [f64; 4] {
        [self.left, self.top, self.right, self.bottom]
    }
}

/// Intersection over union of two `[x1, y1, x2, y2]` boxes, `0` for an empty union.
pub fn iou(a: [f64; 4], b: [f64; 4]) -> f64 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - inter_area;
    if union <= 0.0 {
        return 0.0;
    }

    inter_area / union
}

/// The square footprint `(cx - r, cy - r, cx + r, cy + r)` of `candidate` clipped to the image.
pub fn footprint(candidate: &Candidate, width: i32, height: i32) -> [f64; 4] {
    let r = candidate.radius();
    [
        (candidate.cx - r).max(0.0),
        (candidate.cy - r).max(0.0),
        (candidate.cx + r).min(width as f64),
        (candidate.cy + r).min(height as f64),
    ]
}

/// Sets `ai_valid` on every candidate whose best still unmatched box overlaps enough.
///
/// Candidates are visited in order and each box verifies at most one candidate. Returns the
/// verifying boxes.
pub fn verify(
    candidates: &mut [Candidate],
    boxes: &[AiBox],
    width: i32,
    height: i32,
    params: &VerifyParams,
) -> Vec<AiBox> {
    let mut matched = vec![false; boxes.len()];
    for candidate in candidates.iter_mut() {
        let shape = footprint(candidate, width, height);
        let best = boxes
            .iter()
            .enumerate()
            .filter(|(i, _)| !matched[*i])
            .map(|(i, ai)| (i, iou(shape, ai.corners())))
            .max_by(|(_, a), (_, b)| a.total_cmp(b));

        candidate.flags.ai_valid = match best {
            Some((i, overlap)) if overlap > params.match_iou => {
                matched[i] = true;
                true
            }
            _ => false,
        };
    }

    boxes
        .iter()
        .zip(matched)
        .filter_map(|(ai, matched)| matched.then(|| ai.clone()))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BufferedBox {
    pub ai: AiBox,
    pub ttl: u32,
}

/// Short-lived memory of recently verifying boxes for display consumers.
#[derive(Clone, Debug, Default)]
pub struct VerifiedBoxes {
    entries: Vec<BufferedBox>,
}

impl VerifiedBoxes {
    pub fn entries(&self) -> &[BufferedBox] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Ages the buffer by one frame, then merges this frame's verifying boxes.
    pub fn update(&mut self, verified: Vec<AiBox>, params: &VerifyParams) {
        for entry in &mut self.entries {
            entry.ttl = entry.ttl.saturating_sub(1);
        }
        self.entries.retain(|entry| entry.ttl > 0);

        for ai in verified {
            match self
                .entries
                .iter_mut()
                .find(|entry| iou(entry.ai.corners(), ai.corners()) > params.buffer_iou)
            {
                Some(entry) => {
                    entry.ai = ai;
                    entry.ttl = params.buffer_ttl;
                }
                None => {
                    debug!(target: "verify", "buffering {} box {:.2}", ai.label, ai.confidence);
                    self.entries.push(BufferedBox {
                        ai,
                        ttl: params.buffer_ttl,
                    });
                }
            }
        }
    }
}
