//! Per-image processing built from a validated configuration.

use crate::{
    anchor::{self, AnchorGeneratorInit, AnchorSet, AnchorValidator},
    codec::BoxCodecInit,
    common::*,
    config::{Config, LossConfig},
    loss::{self, LossOutput},
    proposal::{self, ProposalDecoder, ProposalDecoderInit},
    roi_target::{
        ClassLayout, RoiSampler, RoiSamplerInit, RoiTargetAssigner, RoiTargetAssignerInit,
        RoiTargets,
    },
    rpn_target::{RpnTargetAssigner, RpnTargetAssignerInit, RpnTargets},
};

#[derive(Debug, Clone)]
pub struct PipelineInit {
    pub config: Config,
    /// The (height, width) of the feature map reported by the backbone.
    ///
    /// If set, the downscale factor is derived from it instead of taken
    /// from the configuration.
    pub feature_size: Option<(usize, usize)>,
}

impl PipelineInit {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            feature_size: None,
        }
    }

    pub fn build(self) -> Result<Pipeline> {
        let Self {
            config,
            feature_size,
        } = self;
        config.validate()?;

        let Config {
            image,
            anchor: anchor_config,
            rpn,
            proposal,
            classifier,
            loss,
        } = &config;

        let (grid_h, grid_w, downscale) = match feature_size {
            Some((grid_h, grid_w)) => {
                let downscale = anchor::downscale_for(image.height, image.width, grid_h, grid_w)?;
                if downscale != anchor_config.downscale {
                    info!(
                        "use downscale {} derived from the {}x{} feature map instead of {}",
                        downscale, grid_h, grid_w, anchor_config.downscale
                    );
                }
                (grid_h, grid_w, downscale)
            }
            None => {
                let (grid_h, grid_w) = config.feature_size();
                (grid_h, grid_w, anchor_config.downscale)
            }
        };

        let generator = AnchorGeneratorInit {
            grid_h,
            grid_w,
            sizes: config.anchor_sizes(),
            ratios: anchor_config.ratios.clone(),
            downscale,
        }
        .build()?;
        let validator = AnchorValidator::new(image.height, image.width, downscale)?;
        let anchors = Arc::new(AnchorSet::new(generator, &validator)?);

        let codec = BoxCodecInit {
            max_log_scale: proposal.max_log_scale,
        }
        .build()?;

        let rpn_assigner = RpnTargetAssignerInit {
            min_overlap: rpn.min_overlap,
            max_overlap: rpn.max_overlap,
            num_regions: rpn.num_regions,
            regression_scaling: rpn.regression_scaling,
            codec,
        }
        .build()?;

        let proposal_decoder = ProposalDecoderInit {
            objectness_threshold: proposal.objectness_threshold,
            nms_iou_threshold: proposal.nms_iou_threshold,
            max_proposals: proposal.max_proposals,
            regression_scaling: rpn.regression_scaling,
            codec,
        }
        .build()?;

        let layout = ClassLayout::new(classifier.classes.len(), classifier.background)?;
        let roi_assigner = RoiTargetAssignerInit {
            min_overlap: classifier.min_overlap,
            max_overlap: classifier.max_overlap,
            regression_std: classifier.regression_std,
            layout,
            codec,
        }
        .build()?;
        let roi_sampler = RoiSamplerInit {
            num_rois: classifier.num_rois,
        }
        .build()?;

        let to_feature = Transform::try_scale(1.0 / downscale as f32)?;
        let loss_weights = *loss;

        info!(
            "{} anchors on a {}x{} feature map, {} of them inside the image",
            anchors.len(),
            grid_h,
            grid_w,
            anchors.num_valid()
        );

        Ok(Pipeline {
            config,
            anchors,
            to_feature,
            rpn_assigner,
            proposal_decoder,
            roi_assigner,
            roi_sampler,
            loss_weights,
        })
    }
}

/// Target assignment, proposal decoding and losses for one image at a time.
#[derive(Debug, Clone, Getters)]
pub struct Pipeline {
    #[get = "pub"]
    config: Config,
    #[get = "pub"]
    anchors: Arc<AnchorSet>,
    to_feature: Transform<f32>,
    #[get = "pub"]
    rpn_assigner: RpnTargetAssigner,
    #[get = "pub"]
    proposal_decoder: ProposalDecoder,
    #[get = "pub"]
    roi_assigner: RoiTargetAssigner,
    #[get = "pub"]
    roi_sampler: RoiSampler,
    loss_weights: LossConfig,
}

impl Pipeline {
    /// Convert pixel labels into feature map units.
    pub fn to_feature_units(&self, labels: &[GroundTruth]) -> Vec<GroundTruth> {
        labels.iter().map(|label| &self.to_feature * label).collect()
    }

    /// Convert boxes in feature map units back to pixels.
    pub fn to_pixel_units(&self, boxes: &[XYWH<f32>]) -> Vec<XYWH<f32>> {
        let to_pixel = self.to_feature.inverse();
        boxes.iter().map(|rect| &to_pixel * rect).collect()
    }

    /// Anchor targets for ground truth in feature map units.
    pub fn rpn_targets<R>(&self, ground_truth: &[GroundTruth], rng: &mut R) -> RpnTargets
    where
        R: Rng + ?Sized,
    {
        self.rpn_assigner.assign(&self.anchors, ground_truth, rng)
    }

    /// Decode `(grid_h, grid_w, A)` objectness and `(grid_h, grid_w, 4A)` deltas into proposals.
    pub fn proposals(
        &self,
        objectness: ArrayView3<f32>,
        deltas: ArrayView3<f32>,
    ) -> Result<Vec<XYWH<f32>>> {
        self.proposal_decoder
            .decode_grid(&self.anchors, objectness, deltas)
    }

    /// Label proposals and sample the classifier batch.
    ///
    /// Returns `None` if no proposal qualifies, in which case the classifier
    /// stage is skipped for this image.
    pub fn classifier_targets<R>(
        &self,
        proposals: &[XYWH<f32>],
        ground_truth: &[GroundTruth],
        rng: &mut R,
    ) -> Result<Option<RoiTargets>>
    where
        R: Rng + ?Sized,
    {
        let targets = self.roi_assigner.assign(proposals, ground_truth)?;
        let sampled = self.roi_sampler.sample(&targets, rng);
        if sampled.is_empty() {
            warn!("no proposal qualifies for the classifier");
            return Ok(None);
        }
        Ok(Some(targets.select(&sampled)?))
    }

    /// The weighted proposal network losses on grid-shaped outputs.
    pub fn rpn_loss(
        &self,
        objectness: ArrayView3<f32>,
        deltas: ArrayView3<f32>,
        targets: &RpnTargets,
    ) -> Result<LossOutput> {
        let (objectness, deltas) = proposal::flatten_rpn_outputs(&self.anchors, objectness, deltas)?;
        let target_deltas = targets.regression_array();

        let rpn_class = loss::rpn_class_loss(
            objectness.view(),
            targets.labels(),
            self.loss_weights.rpn_class,
        )?;
        let rpn_regression = loss::rpn_regression_loss(
            deltas.view(),
            target_deltas.view(),
            targets.labels(),
            self.loss_weights.rpn_regression,
        )?;

        Ok(LossOutput {
            rpn_class,
            rpn_regression,
            ..Default::default()
        })
    }

    /// The weighted classifier losses on `(n, num_classes + 1)` probabilities
    /// and `(n, 4 * num_classes)` deltas.
    pub fn classifier_loss(
        &self,
        class_probs: ArrayView2<f32>,
        deltas: ArrayView2<f32>,
        targets: &RoiTargets,
    ) -> Result<LossOutput> {
        let classifier_class = loss::classifier_class_loss(
            class_probs,
            targets.class_targets().view(),
            self.loss_weights.classifier_class,
        )?;
        let classifier_regression = loss::classifier_regression_loss(
            deltas,
            targets.regression_targets().view(),
            targets.regression_mask().view(),
            self.loss_weights.classifier_regression,
        )?;

        Ok(LossOutput {
            classifier_class,
            classifier_regression,
            ..Default::default()
        })
    }
}
