//! The four training loss terms.
//!
//! Every loss is averaged over its contributing samples and is exactly
//! zero when there are none.

use crate::{common::*, rpn_target::AnchorLabel};
use std::ops::Add;

/// Probabilities are clamped to `[EPSILON, 1 - EPSILON]` before taking logs.
const EPSILON: f32 = 1e-7;

/// Huber loss with unit threshold.
pub fn smooth_l1(diff: f32) -> f32 {
    let abs = diff.abs();
    if abs < 1.0 {
        0.5 * diff * diff
    } else {
        abs - 0.5
    }
}

fn clamp_probability(prob: f32) -> f32 {
    prob.max(EPSILON).min(1.0 - EPSILON)
}

fn mean_or_zero(sum: f32, count: usize) -> f32 {
    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}

/// Binary cross entropy over positive and negative anchors.
///
/// `objectness` holds per-anchor probabilities in anchor index order.
pub fn rpn_class_loss(
    objectness: ArrayView1<f32>,
    labels: &[AnchorLabel],
    weight: f32,
) -> Result<f32> {
    ensure!(
        objectness.len() == labels.len(),
        "expect {} objectness scores, but get {}",
        labels.len(),
        objectness.len()
    );

    let (sum, count) = izip!(objectness.iter(), labels)
        .filter(|(_, label)| !label.is_neutral())
        .fold((0.0, 0), |(sum, count), (&prob, label)| {
            let prob = clamp_probability(prob);
            let loss = match label {
                AnchorLabel::Positive => -prob.ln(),
                _ => -(1.0 - prob).ln(),
            };
            (sum + loss, count + 1)
        });

    Ok(weight * mean_or_zero(sum, count))
}

/// Smooth L1 loss between `(num_anchors, 4)` deltas over positive anchors.
pub fn rpn_regression_loss(
    pred: ArrayView2<f32>,
    target: ArrayView2<f32>,
    labels: &[AnchorLabel],
    weight: f32,
) -> Result<f32> {
    let num_anchors = labels.len();
    ensure!(
        pred.dim() == (num_anchors, 4) && target.dim() == (num_anchors, 4),
        "expect deltas of shape ({}, 4), but get {:?} and {:?}",
        num_anchors,
        pred.dim(),
        target.dim()
    );

    let (sum, count) = izip!(pred.outer_iter(), target.outer_iter(), labels)
        .filter(|(_, _, label)| label.is_positive())
        .fold((0.0, 0), |(sum, count), (pred, target, _)| {
            let loss: f32 = izip!(pred.iter(), target.iter())
                .map(|(&p, &t)| smooth_l1(p - t))
                .sum();
            (sum + loss, count + 1)
        });

    Ok(weight * mean_or_zero(sum, count))
}

/// Categorical cross entropy between `(n, num_classes + 1)` probabilities
/// and one-hot targets.
pub fn classifier_class_loss(
    pred: ArrayView2<f32>,
    target: ArrayView2<f32>,
    weight: f32,
) -> Result<f32> {
    ensure!(
        pred.dim() == target.dim(),
        "class prediction shape {:?} does not match target shape {:?}",
        pred.dim(),
        target.dim()
    );

    let num_samples = pred.nrows();
    let sum: f32 = izip!(pred.iter(), target.iter())
        .filter(|(_, &t)| t != 0.0)
        .map(|(&p, &t)| -t * clamp_probability(p).ln())
        .sum();

    Ok(weight * mean_or_zero(sum, num_samples))
}

/// Smooth L1 loss over the masked `(n, 4 * num_classes)` regression slots,
/// averaged over rows with any unmasked slot.
pub fn classifier_regression_loss(
    pred: ArrayView2<f32>,
    target: ArrayView2<f32>,
    mask: ArrayView2<f32>,
    weight: f32,
) -> Result<f32> {
    ensure!(
        pred.dim() == target.dim() && pred.dim() == mask.dim(),
        "regression shapes do not match: prediction {:?}, target {:?}, mask {:?}",
        pred.dim(),
        target.dim(),
        mask.dim()
    );

    let (sum, count) = izip!(pred.outer_iter(), target.outer_iter(), mask.outer_iter())
        .filter(|(_, _, mask)| mask.iter().any(|&m| m != 0.0))
        .fold((0.0, 0), |(sum, count), (pred, target, mask)| {
            let loss: f32 = izip!(pred.iter(), target.iter(), mask.iter())
                .map(|(&p, &t, &m)| m * smooth_l1(p - t))
                .sum();
            (sum + loss, count + 1)
        });

    Ok(weight * mean_or_zero(sum, count))
}

/// Weighted loss terms of one training step.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LossOutput {
    pub rpn_class: f32,
    pub rpn_regression: f32,
    pub classifier_class: f32,
    pub classifier_regression: f32,
}

impl LossOutput {
    pub fn total(&self) -> f32 {
        self.rpn_class + self.rpn_regression + self.classifier_class + self.classifier_regression
    }

    /// Weighted mean of several outputs, e.g. over the images of a batch.
    pub fn weighted_mean<L>(iter: impl IntoIterator<Item = (L, f32)>) -> Result<Self>
    where
        L: std::borrow::Borrow<LossOutput>,
    {
        let (sum, total_weight) = iter.into_iter().try_fold(
            (LossOutput::default(), 0.0),
            |(sum, total_weight), (loss, weight)| -> Result<_> {
                ensure!(
                    weight.is_finite() && weight >= 0.0,
                    "weight must be non-negative, but get {}",
                    weight
                );
                let loss = loss.borrow();
                let weighted = LossOutput {
                    rpn_class: loss.rpn_class * weight,
                    rpn_regression: loss.rpn_regression * weight,
                    classifier_class: loss.classifier_class * weight,
                    classifier_regression: loss.classifier_regression * weight,
                };
                Ok((sum + weighted, total_weight + weight))
            },
        )?;
        ensure!(total_weight > 0.0, "the total weight must be positive");

        Ok(LossOutput {
            rpn_class: sum.rpn_class / total_weight,
            rpn_regression: sum.rpn_regression / total_weight,
            classifier_class: sum.classifier_class / total_weight,
            classifier_regression: sum.classifier_regression / total_weight,
        })
    }
}

impl Add for LossOutput {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            rpn_class: self.rpn_class + rhs.rpn_class,
            rpn_regression: self.rpn_regression + rhs.rpn_regression,
            classifier_class: self.classifier_class + rhs.classifier_class,
            classifier_regression: self.classifier_regression + rhs.classifier_regression,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use AnchorLabel::*;

    #[test]
    fn smooth_l1_values() {
        assert_abs_diff_eq!(smooth_l1(0.0), 0.0);
        assert_abs_diff_eq!(smooth_l1(0.5), 0.125);
        assert_abs_diff_eq!(smooth_l1(-0.5), 0.125);
        assert_abs_diff_eq!(smooth_l1(1.0), 0.5);
        assert_abs_diff_eq!(smooth_l1(-3.0), 2.5);
    }

    #[test]
    fn rpn_class_loss_ignores_neutral() {
        let objectness = Array1::from(vec![0.5, 0.5, 0.0]);
        let labels = [Positive, Negative, Neutral];
        let loss = rpn_class_loss(objectness.view(), &labels, 2.0).unwrap();
        assert_abs_diff_eq!(loss, 2.0 * 2.0f32.ln(), epsilon = 1e-6);
    }

    #[test]
    fn rpn_class_loss_is_finite_at_saturation() {
        let objectness = Array1::from(vec![0.0, 1.0]);
        let labels = [Positive, Negative];
        let loss = rpn_class_loss(objectness.view(), &labels, 1.0).unwrap();
        assert!(loss.is_finite());
        assert!(loss > 10.0);
    }

    #[test]
    fn rpn_regression_loss_counts_positives_only() {
        let pred = Array2::from_shape_vec((3, 4), vec![
            0.5, 0.0, 0.0, 0.0, //
            9.0, 9.0, 9.0, 9.0, //
            0.0, 0.0, 0.0, 3.0,
        ])
        .unwrap();
        let target = Array2::<f32>::zeros((3, 4));
        let labels = [Positive, Negative, Positive];
        let loss = rpn_regression_loss(pred.view(), target.view(), &labels, 1.0).unwrap();
        assert_abs_diff_eq!(loss, (0.125 + 2.5) / 2.0, epsilon = 1e-6);
    }

    #[test]
    fn classifier_losses() {
        let pred = Array2::from_shape_vec((2, 2), vec![0.25, 0.75, 0.5, 0.5]).unwrap();
        let target = Array2::from_shape_vec((2, 2), vec![0.0, 1.0, 1.0, 0.0]).unwrap();
        let loss = classifier_class_loss(pred.view(), target.view(), 1.0).unwrap();
        let expect = -(0.75f32.ln() + 0.5f32.ln()) / 2.0;
        assert_abs_diff_eq!(loss, expect, epsilon = 1e-6);

        let pred = Array2::from_shape_vec((2, 4), vec![
            0.5, 0.5, 0.0, 0.0, //
            7.0, 7.0, 7.0, 7.0,
        ])
        .unwrap();
        let target = Array2::<f32>::zeros((2, 4));
        let mask = Array2::from_shape_vec((2, 4), vec![
            1.0, 1.0, 1.0, 1.0, //
            0.0, 0.0, 0.0, 0.0,
        ])
        .unwrap();
        let loss =
            classifier_regression_loss(pred.view(), target.view(), mask.view(), 0.5).unwrap();
        assert_abs_diff_eq!(loss, 0.5 * 0.25, epsilon = 1e-6);
    }

    #[test]
    fn zero_samples_give_zero_loss() {
        let labels = [Neutral, Neutral];
        let objectness = Array1::from(vec![0.3, 0.7]);
        let deltas = Array2::<f32>::ones((2, 4));
        let zeros = Array2::<f32>::zeros((2, 4));

        assert_eq!(
            rpn_class_loss(objectness.view(), &labels, 1.0).unwrap(),
            0.0
        );
        assert_eq!(
            rpn_regression_loss(deltas.view(), zeros.view(), &labels, 1.0).unwrap(),
            0.0
        );

        let empty = Array2::<f32>::zeros((0, 3));
        assert_eq!(
            classifier_class_loss(empty.view(), empty.view(), 1.0).unwrap(),
            0.0
        );
        assert_eq!(
            classifier_regression_loss(deltas.view(), zeros.view(), zeros.view(), 1.0).unwrap(),
            0.0
        );
    }

    #[test]
    fn reject_shape_mismatch() {
        let objectness = Array1::<f32>::zeros(3);
        assert!(rpn_class_loss(objectness.view(), &[Positive], 1.0).is_err());

        let lhs = Array2::<f32>::zeros((2, 3));
        let rhs = Array2::<f32>::zeros((2, 4));
        assert!(classifier_class_loss(lhs.view(), rhs.view(), 1.0).is_err());
    }

    #[test]
    fn loss_output_total_and_mean() {
        let lhs = LossOutput {
            rpn_class: 1.0,
            rpn_regression: 2.0,
            classifier_class: 3.0,
            classifier_regression: 4.0,
        };
        let rhs = LossOutput::default();
        assert_abs_diff_eq!((lhs + rhs).total(), 10.0);

        let mean = LossOutput::weighted_mean(vec![(lhs, 1.0), (rhs, 3.0)]).unwrap();
        assert_abs_diff_eq!(mean.rpn_class, 0.25);
        assert_abs_diff_eq!(mean.total(), 2.5);
        assert!(LossOutput::weighted_mean(Vec::<(LossOutput, f32)>::new()).is_err());
    }
}
