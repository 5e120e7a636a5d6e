//! Decoding of region proposals from the proposal network outputs.

use crate::{
    anchor::AnchorSet,
    codec::{BoxCodec, RegressionDelta},
    common::*,
};

#[derive(Debug, Clone)]
pub struct ProposalDecoderInit {
    pub objectness_threshold: f32,
    pub nms_iou_threshold: f32,
    pub max_proposals: usize,
    /// Predicted deltas are divided by this factor before decoding.
    pub regression_scaling: f32,
    pub codec: BoxCodec,
}

impl ProposalDecoderInit {
    pub fn build(self) -> Result<ProposalDecoder> {
        let Self {
            objectness_threshold,
            nms_iou_threshold,
            max_proposals,
            regression_scaling,
            codec,
        } = self;

        ensure!(
            (0.0..=1.0).contains(&objectness_threshold),
            "objectness_threshold must be in range [0, 1]"
        );
        ensure!(
            (0.0..=1.0).contains(&nms_iou_threshold),
            "nms_iou_threshold must be in range [0, 1]"
        );
        ensure!(max_proposals > 0, "max_proposals must be positive");
        ensure!(
            regression_scaling.is_finite() && regression_scaling > 0.0,
            "regression_scaling must be positive"
        );

        Ok(ProposalDecoder {
            objectness_threshold,
            nms_iou_threshold,
            max_proposals,
            regression_scaling,
            codec,
        })
    }
}

/// Turns per-anchor objectness and deltas into a list of proposal boxes.
#[derive(Debug, Clone)]
pub struct ProposalDecoder {
    objectness_threshold: f32,
    nms_iou_threshold: f32,
    max_proposals: usize,
    regression_scaling: f32,
    codec: BoxCodec,
}

impl ProposalDecoder {
    /// Decode proposals from flat outputs.
    ///
    /// `objectness` has shape `(num_anchors,)` and `deltas` has shape
    /// `(num_anchors, 4)`, both in anchor index order. The returned boxes
    /// are in feature map units, ordered by descending objectness.
    pub fn decode(
        &self,
        anchors: &AnchorSet,
        objectness: ArrayView1<f32>,
        deltas: ArrayView2<f32>,
    ) -> Result<Vec<XYWH<f32>>> {
        let num_anchors = anchors.len();
        ensure!(
            objectness.len() == num_anchors,
            "expect {} objectness scores, but get {}",
            num_anchors,
            objectness.len()
        );
        ensure!(
            deltas.dim() == (num_anchors, 4),
            "expect deltas of shape ({}, 4), but get {:?}",
            num_anchors,
            deltas.dim()
        );

        let scaling = [self.regression_scaling; 4];
        let bounds = anchors.bounds();

        let (candidates, scores): (Vec<_>, Vec<_>) = izip!(
            anchors.anchors(),
            objectness.iter(),
            deltas.outer_iter()
        )
        .filter(|(_, &score, _)| score.is_finite() && score >= self.objectness_threshold)
        .filter_map(|(anchor, &score, delta)| {
            let delta = RegressionDelta::from_array([delta[0], delta[1], delta[2], delta[3]])
                .unscale(scaling);
            let rect = self.codec.decode(&anchor.rect(), &delta)?;
            let rect = rect.clip_to(bounds)?;
            Some((rect, score))
        })
        .unzip();

        if candidates.is_empty() {
            warn!("no proposal passes the objectness threshold");
            return Ok(vec![]);
        }

        let keep = nms(
            &candidates,
            &scores,
            self.nms_iou_threshold,
            self.max_proposals,
        );
        debug!(
            "kept {} out of {} candidate proposals",
            keep.len(),
            candidates.len()
        );

        Ok(keep.into_iter().map(|index| candidates[index]).collect())
    }

    /// Decode proposals from grid-shaped outputs.
    ///
    /// `objectness` has shape `(grid_h, grid_w, A)` and `deltas` has shape
    /// `(grid_h, grid_w, 4A)`.
    pub fn decode_grid(
        &self,
        anchors: &AnchorSet,
        objectness: ArrayView3<f32>,
        deltas: ArrayView3<f32>,
    ) -> Result<Vec<XYWH<f32>>> {
        let (objectness, deltas) = flatten_rpn_outputs(anchors, objectness, deltas)?;
        self.decode(anchors, objectness.view(), deltas.view())
    }
}

/// Flatten grid-shaped RPN outputs into `(num_anchors,)` and `(num_anchors, 4)` arrays.
pub fn flatten_rpn_outputs(
    anchors: &AnchorSet,
    objectness: ArrayView3<f32>,
    deltas: ArrayView3<f32>,
) -> Result<(Array1<f32>, Array2<f32>)> {
    let generator = anchors.generator();
    let grid_h = generator.grid_h();
    let grid_w = generator.grid_w();
    let per_cell = generator.anchors_per_cell();

    ensure!(
        objectness.dim() == (grid_h, grid_w, per_cell),
        "expect objectness of shape ({}, {}, {}), but get {:?}",
        grid_h,
        grid_w,
        per_cell,
        objectness.dim()
    );
    ensure!(
        deltas.dim() == (grid_h, grid_w, per_cell * 4),
        "expect deltas of shape ({}, {}, {}), but get {:?}",
        grid_h,
        grid_w,
        per_cell * 4,
        deltas.dim()
    );

    // logical iteration order is row-major regardless of memory layout
    let num_anchors = anchors.len();
    let objectness = Array1::from_iter(objectness.iter().copied());
    let deltas = Array2::from_shape_vec((num_anchors, 4), deltas.iter().copied().collect())?;
    Ok((objectness, deltas))
}

/// Greedy non-maximum suppression.
///
/// Returns indexes of kept boxes in descending score order. A box is
/// suppressed if its IoU with an already kept box reaches `iou_threshold`,
/// so kept boxes overlap each other strictly less than that.
/// Scores must be finite.
pub fn nms(boxes: &[XYWH<f32>], scores: &[f32], iou_threshold: f32, max_outputs: usize) -> Vec<usize> {
    debug_assert_eq!(boxes.len(), scores.len());

    let mut order: Vec<usize> = (0..boxes.len()).collect();
    order.sort_by_key(|&index| Reverse(r32(scores[index])));

    let mut suppressed = vec![false; order.len()];
    let mut keep: Vec<usize> = vec![];

    for (pos, &index) in order.iter().enumerate() {
        if keep.len() >= max_outputs {
            break;
        }
        if suppressed[pos] {
            continue;
        }
        keep.push(index);
        let kept_box = &boxes[index];

        for (other_pos, &other_index) in order.iter().enumerate().skip(pos + 1) {
            if !suppressed[other_pos] && kept_box.iou_with(&boxes[other_index]) >= iou_threshold {
                suppressed[other_pos] = true;
            }
        }
    }

    keep
}
