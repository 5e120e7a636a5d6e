//! Training targets of the region proposal network.

use crate::{
    anchor::{AnchorGenerator, AnchorSet},
    codec::{BoxCodec, RegressionDelta},
    common::*,
    matcher::{best_match_per_row, pairwise_iou, BestMatch},
};

/// IoU values closer than this are treated as ties.
const TIE_EPSILON: f32 = 1e-6;

/// The assignment of an anchor or a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnchorLabel {
    Positive,
    Negative,
    /// Excluded from the loss and from sampling.
    Neutral,
}

impl AnchorLabel {
    /// The value used in the dense label map: 1, 0 or -1.
    pub fn to_f32(self) -> f32 {
        match self {
            Self::Positive => 1.0,
            Self::Negative => 0.0,
            Self::Neutral => -1.0,
        }
    }

    pub fn is_positive(self) -> bool {
        self == Self::Positive
    }

    pub fn is_negative(self) -> bool {
        self == Self::Negative
    }

    pub fn is_neutral(self) -> bool {
        self == Self::Neutral
    }
}

#[derive(Debug, Clone)]
pub struct RpnTargetAssignerInit {
    pub min_overlap: f32,
    pub max_overlap: f32,
    pub num_regions: usize,
    pub regression_scaling: f32,
    pub codec: BoxCodec,
}

impl RpnTargetAssignerInit {
    pub fn build(self) -> Result<RpnTargetAssigner> {
        let Self {
            min_overlap,
            max_overlap,
            num_regions,
            regression_scaling,
            codec,
        } = self;

        ensure!(
            0.0 <= min_overlap && min_overlap < max_overlap && max_overlap <= 1.0,
            "overlap thresholds must satisfy 0 <= min_overlap < max_overlap <= 1, but get {} and {}",
            min_overlap,
            max_overlap
        );
        ensure!(num_regions > 0, "num_regions must be positive");
        ensure!(
            regression_scaling.is_finite() && regression_scaling > 0.0,
            "regression_scaling must be positive"
        );

        Ok(RpnTargetAssigner {
            min_overlap,
            max_overlap,
            num_regions,
            regression_scaling,
            codec,
        })
    }
}

/// Labels anchors against ground truth and caps the number of labeled anchors.
#[derive(Debug, Clone)]
pub struct RpnTargetAssigner {
    min_overlap: f32,
    max_overlap: f32,
    num_regions: usize,
    regression_scaling: f32,
    codec: BoxCodec,
}

impl RpnTargetAssigner {
    pub fn num_regions(&self) -> usize {
        self.num_regions
    }

    pub fn regression_scaling(&self) -> f32 {
        self.regression_scaling
    }

    /// Compute the per-anchor labels and regression targets of one image.
    ///
    /// Ground truth must be in feature map units. Degenerate ground-truth
    /// boxes are ignored.
    pub fn assign<R>(
        &self,
        anchors: &AnchorSet,
        ground_truth: &[GroundTruth],
        rng: &mut R,
    ) -> RpnTargets
    where
        R: Rng + ?Sized,
    {
        let num_anchors = anchors.len();
        let mut labels = vec![AnchorLabel::Neutral; num_anchors];
        let mut matched: Vec<Option<usize>> = vec![None; num_anchors];

        // keep the positions in `ground_truth` of the boxes that take part
        let (gt_indices, gt_rects): (Vec<usize>, Vec<XYWH<f32>>) = ground_truth
            .iter()
            .enumerate()
            .filter(|(_, gt)| {
                let degenerate = gt.rect.is_degenerate();
                if degenerate {
                    warn!("ignore degenerate ground truth box {:?}", gt.rect);
                }
                !degenerate
            })
            .map(|(index, gt)| (index, gt.rect))
            .unzip();

        let valid_indices = anchors.valid_indices();
        let valid_rects: Vec<XYWH<f32>> = valid_indices
            .iter()
            .map(|&index| anchors.anchors()[index].rect())
            .collect();

        // rows: valid anchors, cols: ground truth boxes
        let ious = pairwise_iou(&valid_rects, &gt_rects);

        // label by threshold against the best matching ground truth
        let row_best = best_match_per_row(ious.view());
        let best_gt_of_row =
            |row: usize| row_best[row].map(|best: BestMatch| gt_indices[best.index]);

        row_best
            .iter()
            .zip(valid_indices.iter())
            .for_each(|(best, &anchor_index)| match best {
                Some(best) if best.iou >= self.max_overlap => {
                    labels[anchor_index] = AnchorLabel::Positive;
                    matched[anchor_index] = Some(gt_indices[best.index]);
                }
                Some(best) if best.iou < self.min_overlap => {
                    labels[anchor_index] = AnchorLabel::Negative;
                }
                Some(_) => {}
                None => {
                    // no ground truth at all, everything valid is background
                    labels[anchor_index] = AnchorLabel::Negative;
                }
            });

        // force the best anchors of each ground truth to be positive
        let mut responsible: Vec<usize> = vec![];
        for (gt_index, gt_rect) in gt_rects.iter().enumerate() {
            let column = ious.column(gt_index);
            let best_iou = column.iter().cloned().fold(0.0f32, f32::max);
            if best_iou <= 0.0 {
                warn!(
                    "ground truth box {:?} does not overlap any valid anchor",
                    gt_rect
                );
                continue;
            }

            let ties: Vec<usize> = column
                .iter()
                .enumerate()
                .filter(|(_, &iou)| abs_diff_eq!(iou, best_iou, epsilon = TIE_EPSILON))
                .map(|(row, _)| row)
                .collect();

            // the target of a forced anchor is still its own best match,
            // which may be another box it overlaps more
            ties.iter().for_each(|&row| {
                let anchor_index = valid_indices[row];
                labels[anchor_index] = AnchorLabel::Positive;
                matched[anchor_index] = best_gt_of_row(row);
            });

            // the tie nearest to the box center becomes responsible for it
            let chosen = ties.iter().map(|&row| valid_indices[row]).min_by(|&lhs, &rhs| {
                let lhs_dist = anchors.anchors()[lhs].rect().center_distance_sq_to(gt_rect);
                let rhs_dist = anchors.anchors()[rhs].rect().center_distance_sq_to(gt_rect);
                lhs_dist
                    .partial_cmp(&rhs_dist)
                    .unwrap_or(Ordering::Equal)
                    .then(lhs.cmp(&rhs))
            });
            if let Some(chosen) = chosen {
                responsible.push(chosen);
            }
        }
        responsible.sort_unstable();
        responsible.dedup();

        self.subsample(&mut labels, &responsible, rng);

        // compute regression targets
        let scaling = [self.regression_scaling; 4];
        let mut regression = vec![RegressionDelta::default(); num_anchors];
        for anchor_index in 0..num_anchors {
            if !labels[anchor_index].is_positive() {
                matched[anchor_index] = None;
                continue;
            }

            let delta = matched[anchor_index].and_then(|gt_index| {
                let anchor = anchors.anchors()[anchor_index].rect();
                self.codec.encode(&anchor, &ground_truth[gt_index].rect)
            });

            match delta {
                Some(delta) => regression[anchor_index] = delta.scale(scaling),
                None => {
                    labels[anchor_index] = AnchorLabel::Neutral;
                    matched[anchor_index] = None;
                }
            }
        }

        let targets = RpnTargets {
            labels,
            regression,
            matched,
        };

        if targets.num_positive() == 0 {
            warn!("no positive anchor is assigned for this image");
        }
        debug!(
            "assigned {} positive, {} negative and {} neutral anchors",
            targets.num_positive(),
            targets.num_negative(),
            targets.num_neutral()
        );

        targets
    }

    /// Cap positives to half the region budget and fill the rest with negatives.
    ///
    /// Responsible anchors are kept unless they alone exceed the budget.
    fn subsample<R>(&self, labels: &mut [AnchorLabel], responsible: &[usize], rng: &mut R)
    where
        R: Rng + ?Sized,
    {
        let num_regions = self.num_regions;
        let max_positive = num_regions / 2;

        let responsible_set: HashSet<usize> = responsible.iter().copied().collect();
        let (pinned, others): (Vec<usize>, Vec<usize>) = labels
            .iter()
            .enumerate()
            .filter(|(_, label)| label.is_positive())
            .map(|(index, _)| index)
            .partition(|index| responsible_set.contains(index));

        if pinned.len() > num_regions {
            warn!(
                "{} ground truth boxes exceed the region budget {}, dropping some of them",
                pinned.len(),
                num_regions
            );
            relabel_excess(labels, &pinned, num_regions, rng);
            others
                .iter()
                .for_each(|&index| labels[index] = AnchorLabel::Neutral);
        } else {
            let max_others = max_positive.saturating_sub(pinned.len());
            relabel_excess(labels, &others, max_others, rng);
        }

        let num_positive = labels.iter().filter(|label| label.is_positive()).count();
        let negatives: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, label)| label.is_negative())
            .map(|(index, _)| index)
            .collect();
        let max_negative = num_regions.saturating_sub(num_positive);
        relabel_excess(labels, &negatives, max_negative, rng);
    }
}

/// Keep `keep` randomly chosen entries of `indices` and mark the rest neutral.
fn relabel_excess<R>(labels: &mut [AnchorLabel], indices: &[usize], keep: usize, rng: &mut R)
where
    R: Rng + ?Sized,
{
    if indices.len() <= keep {
        return;
    }

    let kept: HashSet<usize> = indices.choose_multiple(rng, keep).copied().collect();
    indices
        .iter()
        .filter(|index| !kept.contains(index))
        .for_each(|&index| labels[index] = AnchorLabel::Neutral);
}

/// Per-anchor targets aligned to the global anchor index.
#[derive(Debug, Clone, Getters)]
pub struct RpnTargets {
    #[get = "pub"]
    labels: Vec<AnchorLabel>,
    /// Meaningful only where the label is positive, zero elsewhere.
    #[get = "pub"]
    regression: Vec<RegressionDelta>,
    /// For each positive anchor, the index into the `ground_truth` slice
    /// of its best overlapping box.
    #[get = "pub"]
    matched: Vec<Option<usize>>,
}

impl RpnTargets {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_positive(&self) -> usize {
        self.labels.iter().filter(|label| label.is_positive()).count()
    }

    pub fn num_negative(&self) -> usize {
        self.labels.iter().filter(|label| label.is_negative()).count()
    }

    pub fn num_neutral(&self) -> usize {
        self.labels.iter().filter(|label| label.is_neutral()).count()
    }

    pub fn positive_indices(&self) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter_map(|(index, label)| label.is_positive().then(|| index))
            .collect()
    }

    /// The regression targets as a `(num_anchors, 4)` array.
    pub fn regression_array(&self) -> Array2<f32> {
        Array2::from_shape_fn((self.regression.len(), 4), |(index, coord)| {
            self.regression[index].to_array()[coord]
        })
    }

    /// Dense label map `(grid_h, grid_w, A)` and regression map `(grid_h, grid_w, 4A)`.
    pub fn to_arrays(&self, generator: &AnchorGenerator) -> Result<(Array3<f32>, Array3<f32>)> {
        let grid_h = generator.grid_h();
        let grid_w = generator.grid_w();
        let per_cell = generator.anchors_per_cell();
        ensure!(
            self.len() == generator.num_anchors(),
            "expect {} anchors, but get {}",
            generator.num_anchors(),
            self.len()
        );

        let labels: Vec<f32> = self.labels.iter().map(|label| label.to_f32()).collect();
        let labels = Array3::from_shape_vec((grid_h, grid_w, per_cell), labels)?;
        let regression = self
            .regression_array()
            .into_shape((grid_h, grid_w, per_cell * 4))?;
        Ok((labels, regression))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        anchor::{AnchorGeneratorInit, AnchorValidator},
        matcher::iou,
    };
    use approx::assert_abs_diff_eq;

    fn anchor_set(image_size: usize, sizes: Vec<usize>) -> AnchorSet {
        let downscale = 16;
        let grid = image_size / downscale;
        let generator = AnchorGeneratorInit {
            grid_h: grid,
            grid_w: grid,
            sizes,
            ratios: vec![0.5, 1.0, 2.0],
            downscale,
        }
        .build()
        .unwrap();
        let validator = AnchorValidator::new(image_size, image_size, downscale).unwrap();
        AnchorSet::new(generator, &validator).unwrap()
    }

    fn assigner(num_regions: usize) -> RpnTargetAssigner {
        RpnTargetAssignerInit {
            min_overlap: 0.2,
            max_overlap: 0.7,
            num_regions,
            regression_scaling: 1.0,
            codec: BoxCodec::default(),
        }
        .build()
        .unwrap()
    }

    fn gt(xywh: [f32; 4], class: usize) -> GroundTruth {
        Label::new(XYWH::try_from_xywh(xywh).unwrap(), class)
    }

    #[test]
    fn every_ground_truth_gets_a_positive_anchor() {
        let anchors = anchor_set(256, vec![32, 64]);
        let assigner = assigner(64);
        let mut rng = StdRng::seed_from_u64(7);

        // odd sized boxes that no anchor matches above 0.7
        let ground_truth = vec![gt([1.3, 2.1, 1.1, 3.7], 0), gt([9.2, 8.7, 4.4, 1.9], 0)];
        let targets = assigner.assign(&anchors, &ground_truth, &mut rng);

        for gt_index in 0..ground_truth.len() {
            assert!(
                targets.matched().iter().any(|&matched| matched == Some(gt_index)),
                "ground truth {} has no positive anchor",
                gt_index
            );
        }
        assert!(targets.num_positive() + targets.num_negative() <= 64);
    }

    #[test]
    fn invalid_anchors_stay_neutral() {
        let anchors = anchor_set(256, vec![32, 64]);
        let assigner = assigner(100_000);
        let mut rng = StdRng::seed_from_u64(1);
        let ground_truth = vec![gt([4.0, 4.0, 4.0, 4.0], 0)];
        let targets = assigner.assign(&anchors, &ground_truth, &mut rng);

        izip!(anchors.valid(), targets.labels())
            .filter(|(&valid, _)| !valid)
            .for_each(|(_, label)| assert_eq!(*label, AnchorLabel::Neutral));
    }

    #[test]
    fn exact_match_is_positive_with_zero_regression() {
        let anchors = anchor_set(256, vec![64]);
        let assigner = assigner(500);
        let mut rng = StdRng::seed_from_u64(3);

        let index = anchors.generator().index(5, 6, 0, 1);
        let rect = anchors.anchors()[index].rect();
        let ground_truth = vec![Label::new(rect, 0)];
        let targets = assigner.assign(&anchors, &ground_truth, &mut rng);

        assert_eq!(targets.labels()[index], AnchorLabel::Positive);
        assert_eq!(targets.regression()[index], RegressionDelta::default());
    }

    #[test]
    fn forced_anchor_regresses_to_its_best_ground_truth() {
        let anchors = anchor_set(256, vec![64]);
        let assigner = assigner(500);
        let mut rng = StdRng::seed_from_u64(13);

        // the small box is best matched by the same anchor that matches the
        // large box exactly
        let index = anchors.generator().index(5, 6, 0, 1);
        let rect = anchors.anchors()[index].rect();
        let small = XYWH::try_from_cxcywh([rect.cx(), rect.cy(), 0.5, 0.5]).unwrap();
        let ground_truth = vec![Label::new(rect, 0), Label::new(small, 1)];
        let targets = assigner.assign(&anchors, &ground_truth, &mut rng);

        assert_eq!(targets.labels()[index], AnchorLabel::Positive);
        assert_eq!(targets.matched()[index], Some(0));
        assert_eq!(targets.regression()[index], RegressionDelta::default());
    }

    #[test]
    fn matched_indexes_refer_to_the_given_ground_truth() {
        let anchors = anchor_set(256, vec![64]);
        let assigner = assigner(500);
        let mut rng = StdRng::seed_from_u64(19);

        let index = anchors.generator().index(4, 9, 0, 2);
        let rect = anchors.anchors()[index].rect();
        let ground_truth = vec![gt([0.0, 0.0, 0.0, 1.0], 0), Label::new(rect, 1)];
        let targets = assigner.assign(&anchors, &ground_truth, &mut rng);

        assert_eq!(targets.labels()[index], AnchorLabel::Positive);
        assert_eq!(targets.matched()[index], Some(1));
        assert!(targets
            .matched()
            .iter()
            .flatten()
            .all(|&gt_index| gt_index == 1));
    }

    #[test]
    fn positives_regress_to_their_best_overlapping_ground_truth() {
        let anchors = anchor_set(256, vec![32, 64]);
        let assigner = assigner(256);
        let codec = BoxCodec::default();
        let mut rng = StdRng::seed_from_u64(31);

        for _ in 0..20 {
            let num_boxes = rng.gen_range(2..6);
            let ground_truth: Vec<_> = (0..num_boxes)
                .map(|_| {
                    gt(
                        [
                            rng.gen_range(0.0..12.0),
                            rng.gen_range(0.0..12.0),
                            rng.gen_range(0.5..6.0),
                            rng.gen_range(0.5..6.0),
                        ],
                        0,
                    )
                })
                .collect();
            let targets = assigner.assign(&anchors, &ground_truth, &mut rng);

            for anchor_index in targets.positive_indices() {
                let anchor = anchors.anchors()[anchor_index].rect();
                let gt_index = targets.matched()[anchor_index].unwrap();
                let ious: Vec<f32> = ground_truth
                    .iter()
                    .map(|gt| iou(&anchor, &gt.rect))
                    .collect();
                let best_iou = ious.iter().cloned().fold(0.0f32, f32::max);
                assert_eq!(ious[gt_index], best_iou);

                let expect = codec.encode(&anchor, &ground_truth[gt_index].rect).unwrap();
                izip!(
                    targets.regression()[anchor_index].to_array(),
                    expect.to_array()
                )
                .for_each(|(lhs, rhs)| assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-6));
            }
        }
    }

    #[test]
    fn positives_and_negatives_are_capped() {
        let anchors = anchor_set(512, vec![8, 16, 32, 64, 128]);
        let assigner = assigner(32);
        let mut rng = StdRng::seed_from_u64(11);

        let ground_truth: Vec<_> = (0..6)
            .map(|index| gt([2.0 + 4.0 * index as f32, 3.0, 4.0, 4.0], 0))
            .collect();
        let targets = assigner.assign(&anchors, &ground_truth, &mut rng);

        assert!(targets.num_positive() >= ground_truth.len());
        assert!(targets.num_positive() <= 16);
        assert_eq!(targets.num_positive() + targets.num_negative(), 32);
    }

    #[test]
    fn no_ground_truth_yields_negatives_only() {
        let anchors = anchor_set(256, vec![32]);
        let assigner = assigner(50);
        let mut rng = StdRng::seed_from_u64(5);
        let targets = assigner.assign(&anchors, &[], &mut rng);

        assert_eq!(targets.num_positive(), 0);
        assert_eq!(targets.num_negative(), 50);
    }

    #[test]
    fn assignment_is_reproducible() {
        let anchors = anchor_set(256, vec![32, 64]);
        let assigner = assigner(20);
        let ground_truth = vec![gt([2.0, 2.0, 6.0, 5.0], 0)];

        let lhs = assigner.assign(&anchors, &ground_truth, &mut StdRng::seed_from_u64(42));
        let rhs = assigner.assign(&anchors, &ground_truth, &mut StdRng::seed_from_u64(42));
        assert_eq!(lhs.labels(), rhs.labels());
    }

    #[test]
    fn dense_arrays_follow_grid_layout() {
        let anchors = anchor_set(256, vec![32, 64]);
        let assigner = assigner(500);
        let mut rng = StdRng::seed_from_u64(9);
        let ground_truth = vec![gt([3.0, 5.0, 4.0, 4.0], 0)];
        let targets = assigner.assign(&anchors, &ground_truth, &mut rng);

        let generator = anchors.generator();
        let (labels, regression) = targets.to_arrays(generator).unwrap();
        assert_eq!(labels.dim(), (16, 16, 6));
        assert_eq!(regression.dim(), (16, 16, 24));

        let index = targets.positive_indices()[0];
        let (row, col, size_index, ratio_index) = generator.position(index);
        let channel = size_index * generator.ratios().len() + ratio_index;
        assert_eq!(labels[[row, col, channel]], 1.0);
        let delta = targets.regression()[index].to_array();
        for coord in 0..4 {
            assert_eq!(regression[[row, col, channel * 4 + coord]], delta[coord]);
        }
    }
}
