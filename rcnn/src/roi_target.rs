//! Training targets of the region classifier.

use crate::{
    codec::{BoxCodec, RegressionDelta},
    common::*,
    matcher::{best_match_per_row, pairwise_iou},
};

/// Where the synthetic background class sits in the class vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackgroundPosition {
    First,
    Last,
}

/// Column layout of the classifier outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, CopyGetters)]
pub struct ClassLayout {
    #[get_copy = "pub"]
    num_classes: usize,
    #[get_copy = "pub"]
    background: BackgroundPosition,
}

impl ClassLayout {
    pub fn new(num_classes: usize, background: BackgroundPosition) -> Result<Self> {
        ensure!(num_classes > 0, "at least one object class is required");
        Ok(Self {
            num_classes,
            background,
        })
    }

    /// Width of the class vector, background included.
    pub fn num_outputs(&self) -> usize {
        self.num_classes + 1
    }

    pub fn background_column(&self) -> usize {
        match self.background {
            BackgroundPosition::First => 0,
            BackgroundPosition::Last => self.num_classes,
        }
    }

    pub fn class_column(&self, class: usize) -> usize {
        debug_assert!(class < self.num_classes);
        match self.background {
            BackgroundPosition::First => class + 1,
            BackgroundPosition::Last => class,
        }
    }

    /// Width of the regression vector, four slots per object class.
    pub fn regression_width(&self) -> usize {
        self.num_classes * 4
    }
}

#[derive(Debug, Clone)]
pub struct RoiTargetAssignerInit {
    pub min_overlap: f32,
    pub max_overlap: f32,
    pub regression_std: [f32; 4],
    pub layout: ClassLayout,
    pub codec: BoxCodec,
}

impl RoiTargetAssignerInit {
    pub fn build(self) -> Result<RoiTargetAssigner> {
        let Self {
            min_overlap,
            max_overlap,
            regression_std,
            layout,
            codec,
        } = self;

        ensure!(
            0.0 <= min_overlap && min_overlap < max_overlap && max_overlap <= 1.0,
            "overlap thresholds must satisfy 0 <= min_overlap < max_overlap <= 1, but get {} and {}",
            min_overlap,
            max_overlap
        );
        ensure!(
            regression_std
                .iter()
                .all(|&std| std.is_finite() && std > 0.0),
            "regression_std must be positive, but get {:?}",
            regression_std
        );

        Ok(RoiTargetAssigner {
            min_overlap,
            max_overlap,
            regression_std,
            layout,
            codec,
        })
    }
}

#[derive(Debug, Clone, CopyGetters)]
pub struct RoiTargetAssigner {
    min_overlap: f32,
    max_overlap: f32,
    regression_std: [f32; 4],
    #[get_copy = "pub"]
    layout: ClassLayout,
    codec: BoxCodec,
}

impl RoiTargetAssigner {
    /// Label proposals against the ground truth of one image.
    ///
    /// Proposals whose best IoU is below `min_overlap` are discarded. Those
    /// below `max_overlap` become background, and the rest take the class
    /// and regression target of the matched box. Returns an error if a
    /// ground truth class is out of range.
    pub fn assign(
        &self,
        proposals: &[XYWH<f32>],
        ground_truth: &[GroundTruth],
    ) -> Result<RoiTargets> {
        let layout = self.layout;

        let ground_truth: Vec<&GroundTruth> = ground_truth
            .iter()
            .filter(|gt| {
                let degenerate = gt.rect.is_degenerate();
                if degenerate {
                    warn!("ignore degenerate ground truth box {:?}", gt.rect);
                }
                !degenerate
            })
            .collect();
        if let Some(gt) = ground_truth
            .iter()
            .find(|gt| gt.class >= layout.num_classes())
        {
            bail!(
                "ground truth class {} is out of range, there are {} classes",
                gt.class,
                layout.num_classes()
            );
        }

        let gt_rects: Vec<XYWH<f32>> = ground_truth.iter().map(|gt| gt.rect).collect();
        let ious = pairwise_iou(proposals, &gt_rects);

        let mut rows: Vec<RoiRow> = vec![];
        for (proposal_index, (proposal, best)) in proposals
            .iter()
            .zip(best_match_per_row(ious.view()))
            .enumerate()
        {
            if proposal.is_degenerate() {
                continue;
            }

            let (best_index, best_iou) = match best {
                Some(best) => (Some(best.index), best.iou),
                None => (None, 0.0),
            };
            if best_iou < self.min_overlap {
                continue;
            }

            let matched = best_index
                .filter(|_| best_iou >= self.max_overlap)
                .and_then(|gt_index| {
                    let gt = ground_truth[gt_index];
                    let delta = self.codec.encode(proposal, &gt.rect)?;
                    Some((gt.class, delta.scale(self.regression_std)))
                });

            rows.push(RoiRow {
                rect: *proposal,
                proposal_index,
                iou: best_iou,
                matched,
            });
        }

        let num_rows = rows.len();
        let mut class_targets = Array2::<f32>::zeros((num_rows, layout.num_outputs()));
        let mut regression_targets = Array2::<f32>::zeros((num_rows, layout.regression_width()));
        let mut regression_mask = Array2::<f32>::zeros((num_rows, layout.regression_width()));
        let mut classes = Vec::with_capacity(num_rows);

        for (row_index, row) in rows.iter().enumerate() {
            match row.matched {
                Some((class, delta)) => {
                    class_targets[[row_index, layout.class_column(class)]] = 1.0;
                    for (coord, &value) in delta.to_array().iter().enumerate() {
                        regression_targets[[row_index, class * 4 + coord]] = value;
                        regression_mask[[row_index, class * 4 + coord]] = 1.0;
                    }
                    classes.push(Some(class));
                }
                None => {
                    class_targets[[row_index, layout.background_column()]] = 1.0;
                    classes.push(None);
                }
            }
        }

        let targets = RoiTargets {
            layout,
            rois: rows.iter().map(|row| row.rect).collect(),
            proposal_indices: rows.iter().map(|row| row.proposal_index).collect(),
            ious: rows.iter().map(|row| row.iou).collect(),
            classes,
            class_targets,
            regression_targets,
            regression_mask,
        };

        debug!(
            "{} out of {} proposals qualify, {} positive and {} background",
            targets.len(),
            proposals.len(),
            targets.positive_indices().len(),
            targets.negative_indices().len()
        );

        Ok(targets)
    }
}

struct RoiRow {
    rect: XYWH<f32>,
    proposal_index: usize,
    iou: f32,
    matched: Option<(usize, RegressionDelta)>,
}

/// Classifier targets, one row per retained proposal.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct RoiTargets {
    #[get_copy = "pub"]
    layout: ClassLayout,
    #[get = "pub"]
    rois: Vec<XYWH<f32>>,
    /// Index of each row in the proposal list it came from.
    #[get = "pub"]
    proposal_indices: Vec<usize>,
    #[get = "pub"]
    ious: Vec<f32>,
    /// The object class of each row, `None` for background.
    #[get = "pub"]
    classes: Vec<Option<usize>>,
    /// One-hot `(n, num_classes + 1)`.
    #[get = "pub"]
    class_targets: Array2<f32>,
    /// `(n, 4 * num_classes)`, zero outside the matched class slots.
    #[get = "pub"]
    regression_targets: Array2<f32>,
    /// `(n, 4 * num_classes)`, one on the matched class slots.
    #[get = "pub"]
    regression_mask: Array2<f32>,
}

impl RoiTargets {
    pub fn len(&self) -> usize {
        self.rois.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rois.is_empty()
    }

    /// Rows labeled with an object class.
    pub fn positive_indices(&self) -> Vec<usize> {
        self.classes
            .iter()
            .enumerate()
            .filter_map(|(index, class)| class.is_some().then(|| index))
            .collect()
    }

    /// Rows labeled as background.
    pub fn negative_indices(&self) -> Vec<usize> {
        self.classes
            .iter()
            .enumerate()
            .filter_map(|(index, class)| class.is_none().then(|| index))
            .collect()
    }

    /// Gather the given rows. Indexes may repeat.
    pub fn select(&self, indices: &[usize]) -> Result<Self> {
        if let Some(&index) = indices.iter().find(|&&index| index >= self.len()) {
            bail!("row index {} is out of range of {} rows", index, self.len());
        }

        Ok(Self {
            layout: self.layout,
            rois: indices.iter().map(|&index| self.rois[index]).collect(),
            proposal_indices: indices
                .iter()
                .map(|&index| self.proposal_indices[index])
                .collect(),
            ious: indices.iter().map(|&index| self.ious[index]).collect(),
            classes: indices.iter().map(|&index| self.classes[index]).collect(),
            class_targets: self.class_targets.select(Axis(0), indices),
            regression_targets: self.regression_targets.select(Axis(0), indices),
            regression_mask: self.regression_mask.select(Axis(0), indices),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RoiSamplerInit {
    pub num_rois: usize,
}

impl RoiSamplerInit {
    pub fn build(self) -> Result<RoiSampler> {
        let Self { num_rois } = self;
        ensure!(num_rois > 0, "num_rois must be positive");
        Ok(RoiSampler { num_rois })
    }
}

/// Draws a balanced classifier batch from the labeled proposals.
#[derive(Debug, Clone)]
pub struct RoiSampler {
    num_rois: usize,
}

impl RoiSampler {
    pub fn num_rois(&self) -> usize {
        self.num_rois
    }

    /// Sample row indexes of `targets`, positives first.
    ///
    /// Half of the batch is drawn from positives, with replacement if there
    /// are too few of them, and the rest from negatives without
    /// replacement. If one pool is empty, the other one fills the batch.
    pub fn sample<R>(&self, targets: &RoiTargets, rng: &mut R) -> Vec<usize>
    where
        R: Rng + ?Sized,
    {
        let num_rois = self.num_rois;
        let positive = targets.positive_indices();
        let negative = targets.negative_indices();

        let sampled: Vec<usize> = match (positive.is_empty(), negative.is_empty()) {
            (true, true) => vec![],
            (false, true) => draw_without_replacement(&positive, num_rois, rng),
            (true, false) => draw_without_replacement(&negative, num_rois, rng),
            (false, false) => {
                let num_positive = num_rois / 2;
                let mut sampled = if positive.len() < num_positive {
                    (0..num_positive)
                        .filter_map(|_| positive.choose(rng).copied())
                        .collect()
                } else {
                    draw_without_replacement(&positive, num_positive, rng)
                };
                sampled.extend(draw_without_replacement(
                    &negative,
                    num_rois - num_positive,
                    rng,
                ));
                sampled
            }
        };

        debug!(
            "sampled {} ROIs from {} positive and {} negative candidates",
            sampled.len(),
            positive.len(),
            negative.len()
        );
        sampled
    }
}

fn draw_without_replacement<R>(pool: &[usize], count: usize, rng: &mut R) -> Vec<usize>
where
    R: Rng + ?Sized,
{
    pool.choose_multiple(rng, count.min(pool.len()))
        .copied()
        .collect()
}
