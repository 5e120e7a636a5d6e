//! Two-stage region-based detection: anchors, target assignment, proposal
//! decoding and training losses.
//!
//! All boxes handled here are in feature map units unless noted otherwise.
//! Use [Pipeline](pipeline::Pipeline) to convert pixel labels.

mod common;

pub mod anchor;
pub mod codec;
pub mod config;
pub mod loss;
pub mod matcher;
pub mod pipeline;
pub mod proposal;
pub mod roi_target;
pub mod rpn_target;

pub use common::GroundTruth;

pub mod prelude {
    pub use crate::{
        anchor::{AnchorGenerator, AnchorGeneratorInit, AnchorSet, AnchorValidator},
        codec::{BoxCodec, BoxCodecInit, RegressionDelta},
        config::Config,
        loss::LossOutput,
        pipeline::{Pipeline, PipelineInit},
        proposal::{ProposalDecoder, ProposalDecoderInit},
        roi_target::{BackgroundPosition, RoiTargets},
        rpn_target::{AnchorLabel, RpnTargets},
        GroundTruth,
    };
}
