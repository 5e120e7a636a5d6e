//! Detection pipeline configuration format.

use crate::{anchor, common::*, roi_target::BackgroundPosition};

pub use anchor_config::*;
pub use classifier_config::*;
pub use loss_config::*;
pub use proposal_config::*;
pub use rpn_config::*;

/// The main pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub anchor: AnchorConfig,
    #[serde(default)]
    pub rpn: RpnConfig,
    #[serde(default)]
    pub proposal: ProposalConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub loss: LossConfig,
}

impl Config {
    /// Load and validate a JSON5 configuration file.
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file '{}'", path.display()))?;
        let config: Self = json5::from_str(&text)
            .with_context(|| format!("unable to parse config file '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every option at once. Any error here is fatal.
    pub fn validate(&self) -> Result<()> {
        let Self {
            image,
            anchor,
            rpn,
            proposal,
            classifier,
            loss,
        } = self;

        ensure!(
            image.height > 0 && image.width > 0,
            "image height and width must be positive"
        );

        let sizes = self.anchor_sizes();
        ensure!(!sizes.is_empty(), "anchor sizes must not be empty");
        ensure!(
            sizes.iter().all(|&size| size > 0),
            "anchor sizes must be positive, but get {:?}",
            sizes
        );
        ensure!(!anchor.ratios.is_empty(), "anchor ratios must not be empty");
        ensure!(
            anchor
                .ratios
                .iter()
                .all(|&ratio| ratio.is_finite() && ratio > 0.0),
            "anchor ratios must be positive, but get {:?}",
            anchor.ratios
        );
        ensure!(anchor.downscale > 0, "downscale must be positive");

        ensure_overlap_range("rpn", rpn.min_overlap, rpn.max_overlap)?;
        ensure!(rpn.num_regions > 0, "num_regions must be positive");
        ensure!(
            rpn.regression_scaling.is_finite() && rpn.regression_scaling > 0.0,
            "rpn regression_scaling must be positive"
        );

        ensure!(
            (0.0..=1.0).contains(&proposal.objectness_threshold),
            "objectness_threshold must be in range [0, 1]"
        );
        ensure!(
            (0.0..=1.0).contains(&proposal.nms_iou_threshold),
            "nms_iou_threshold must be in range [0, 1]"
        );
        ensure!(proposal.max_proposals > 0, "max_proposals must be positive");
        ensure!(
            proposal.max_log_scale.is_finite() && proposal.max_log_scale > 0.0,
            "max_log_scale must be positive"
        );

        ensure!(
            !classifier.classes.is_empty(),
            "at least one object class is required"
        );
        ensure_overlap_range(
            "classifier",
            classifier.min_overlap,
            classifier.max_overlap,
        )?;
        ensure!(
            classifier
                .regression_std
                .iter()
                .all(|&std| std.is_finite() && std > 0.0),
            "classifier regression_std must be positive, but get {:?}",
            classifier.regression_std
        );
        ensure!(classifier.num_rois > 0, "num_rois must be positive");

        let LossConfig {
            rpn_class,
            rpn_regression,
            classifier_class,
            classifier_regression,
        } = *loss;
        ensure!(
            [rpn_class, rpn_regression, classifier_class, classifier_regression]
                .iter()
                .all(|&weight| weight.is_finite() && weight >= 0.0),
            "loss weights must be non-negative"
        );

        Ok(())
    }

    /// The configured anchor sizes, or the sizes derived from the image size if unset.
    pub fn anchor_sizes(&self) -> Vec<usize> {
        match &self.anchor.sizes {
            Some(sizes) => sizes.clone(),
            None => anchor::default_anchor_sizes(self.image.height, self.image.width),
        }
    }

    /// The feature map size in (height, width).
    pub fn feature_size(&self) -> (usize, usize) {
        anchor::feature_size(self.image.height, self.image.width, self.anchor.downscale)
    }
}

fn ensure_overlap_range(stage: &str, min_overlap: f32, max_overlap: f32) -> Result<()> {
    ensure!(
        min_overlap.is_finite() && max_overlap.is_finite(),
        "{} overlap thresholds must be finite",
        stage
    );
    ensure!(
        0.0 <= min_overlap && min_overlap < max_overlap && max_overlap <= 1.0,
        "{} overlap thresholds must satisfy 0 <= min_overlap < max_overlap <= 1, but get min_overlap={} and max_overlap={}",
        stage,
        min_overlap,
        max_overlap
    );
    Ok(())
}

/// The resized input image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    pub height: usize,
    pub width: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            height: 512,
            width: 512,
        }
    }
}

mod anchor_config {
    use super::*;

    /// Anchor box options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AnchorConfig {
        /// Anchor sizes in pixels. Derived from the image size if unset.
        pub sizes: Option<Vec<usize>>,
        /// Anchor aspect ratios (width / height).
        pub ratios: Vec<f32>,
        /// Input resolution divided by feature map resolution.
        pub downscale: usize,
    }

    impl Default for AnchorConfig {
        fn default() -> Self {
            Self {
                sizes: Some(vec![8, 16, 32, 64, 128]),
                ratios: vec![0.5, 1.0, 2.0],
                downscale: 16,
            }
        }
    }
}

mod rpn_config {
    use super::*;

    /// Region proposal network target options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RpnConfig {
        /// Anchors below this overlap are negative.
        pub min_overlap: f32,
        /// Anchors at or above this overlap are positive.
        pub max_overlap: f32,
        /// The maximum number of positive plus negative anchors per image.
        pub num_regions: usize,
        /// The scaling factor applied to anchor regression targets.
        pub regression_scaling: f32,
    }

    impl Default for RpnConfig {
        fn default() -> Self {
            Self {
                min_overlap: 0.2,
                max_overlap: 0.7,
                num_regions: 500,
                regression_scaling: 4.0,
            }
        }
    }
}

mod proposal_config {
    use super::*;

    /// Proposal decoding options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ProposalConfig {
        pub objectness_threshold: f32,
        pub nms_iou_threshold: f32,
        pub max_proposals: usize,
        /// Upper bound of the log-scale deltas before exponentiation.
        pub max_log_scale: f32,
    }

    impl Default for ProposalConfig {
        fn default() -> Self {
            Self {
                objectness_threshold: 0.5,
                nms_iou_threshold: 0.7,
                max_proposals: 300,
                max_log_scale: (1000.0f32 / 16.0).ln(),
            }
        }
    }
}

mod classifier_config {
    use super::*;

    /// Region classifier target options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ClassifierConfig {
        /// Object class names. The background class is implicit.
        pub classes: Vec<String>,
        #[serde(default = "default_background")]
        pub background: BackgroundPosition,
        /// Proposals below this overlap are discarded.
        pub min_overlap: f32,
        /// Proposals at or above this overlap are labeled with the matched class.
        pub max_overlap: f32,
        /// Per-coordinate scaling of (tx, ty, tw, th) targets.
        pub regression_std: [f32; 4],
        /// The number of ROIs sampled per image.
        pub num_rois: usize,
    }

    fn default_background() -> BackgroundPosition {
        BackgroundPosition::Last
    }

    impl Default for ClassifierConfig {
        fn default() -> Self {
            Self {
                classes: vec!["yeast_cell".into()],
                background: default_background(),
                min_overlap: 0.1,
                max_overlap: 0.9,
                regression_std: [8.0, 8.0, 4.0, 4.0],
                num_rois: 100,
            }
        }
    }
}

mod loss_config {
    use super::*;

    /// Scalar weights of the four loss terms.
    #[derive(Debug, Clone, Copy, Serialize, Deserialize)]
    pub struct LossConfig {
        pub rpn_class: f32,
        pub rpn_regression: f32,
        pub classifier_class: f32,
        pub classifier_regression: f32,
    }

    impl Default for LossConfig {
        fn default() -> Self {
            Self {
                rpn_class: 1.0,
                rpn_regression: 1.0,
                classifier_class: 1.0,
                classifier_regression: 1.0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.feature_size(), (32, 32));
        assert_eq!(config.anchor_sizes(), vec![8, 16, 32, 64, 128]);
    }

    #[test]
    fn reject_inverted_overlap_thresholds() {
        let mut config = Config::default();
        config.rpn.min_overlap = 0.8;
        config.rpn.max_overlap = 0.7;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.classifier.max_overlap = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_non_positive_anchor_specs() {
        let mut config = Config::default();
        config.anchor.sizes = Some(vec![8, 0]);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.anchor.ratios = vec![1.0, -0.5];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.anchor.ratios = vec![];
        assert!(config.validate().is_err());
    }

    #[test]
    fn derive_anchor_sizes_from_image() {
        let mut config = Config::default();
        config.anchor.sizes = None;
        assert_eq!(config.anchor_sizes(), vec![512, 256, 128]);
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_json5() {
        let text = r#"{
            image: { height: 256, width: 320 },
            rpn: { min_overlap: 0.3, max_overlap: 0.6, num_regions: 64, regression_scaling: 1.0 },
            classifier: {
                classes: ["cell", "debris"],
                background: "First",
                min_overlap: 0.1,
                max_overlap: 0.5,
                regression_std: [1.0, 1.0, 1.0, 1.0],
                num_rois: 16,
            },
        }"#;
        let config: Config = json5::from_str(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.feature_size(), (16, 20));
        assert_eq!(config.classifier.background, BackgroundPosition::First);
        assert_eq!(config.proposal.max_proposals, 300);
    }
}
