//! Pairwise IoU between box sets.

use crate::common::*;

/// Intersection over union of two boxes, zero if either is degenerate.
pub fn iou<A, B>(lhs: &A, rhs: &B) -> f32
where
    A: Rect<Type = f32>,
    B: Rect<Type = f32>,
{
    lhs.iou_with(rhs)
}

/// Compute the `lhs.len() x rhs.len()` IoU matrix.
pub fn pairwise_iou<A, B>(lhs: &[A], rhs: &[B]) -> Array2<f32>
where
    A: Rect<Type = f32>,
    B: Rect<Type = f32>,
{
    Array2::from_shape_fn((lhs.len(), rhs.len()), |(row, col)| {
        iou(&lhs[row], &rhs[col])
    })
}

/// The best overlapping entry of a row or a column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestMatch {
    pub index: usize,
    pub iou: f32,
}

/// For each row, the column with maximum IoU. The first column wins on ties.
///
/// It is `None` if the matrix has no columns.
pub fn best_match_per_row(ious: ArrayView2<f32>) -> Vec<Option<BestMatch>> {
    ious.outer_iter().map(|row| best_match(row)).collect()
}

/// For each column, the row with maximum IoU. The first row wins on ties.
pub fn best_match_per_col(ious: ArrayView2<f32>) -> Vec<Option<BestMatch>> {
    ious.axis_iter(Axis(1)).map(|col| best_match(col)).collect()
}

fn best_match(values: ArrayView1<f32>) -> Option<BestMatch> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<BestMatch>, (index, &iou)| match best {
            Some(best) if best.iou >= iou => Some(best),
            _ => Some(BestMatch { index, iou }),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn rect(xywh: [f32; 4]) -> XYWH<f32> {
        XYWH::try_from_xywh(xywh).unwrap()
    }

    #[test]
    fn pairwise_matrix_matches_scalar_iou() {
        let lhs = vec![
            rect([0.0, 0.0, 2.0, 2.0]),
            rect([1.0, 1.0, 2.0, 2.0]),
            rect([5.0, 5.0, 1.0, 1.0]),
        ];
        let rhs = vec![rect([1.0, 1.0, 2.0, 2.0]), rect([0.0, 0.0, 0.0, 0.0])];

        let ious = pairwise_iou(&lhs, &rhs);
        assert_eq!(ious.dim(), (3, 2));
        assert_abs_diff_eq!(ious[[0, 0]], 1.0 / 7.0, epsilon = 1e-6);
        assert_abs_diff_eq!(ious[[1, 0]], 1.0, epsilon = 1e-6);
        assert_eq!(ious[[2, 0]], 0.0);
        assert!(ious.column(1).iter().all(|&iou| iou == 0.0));

        let transposed = pairwise_iou(&rhs, &lhs);
        assert_eq!(transposed.t(), ious);
    }

    #[test]
    fn random_pairwise_iou_is_symmetric_and_bounded() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut random_rects = |count: usize| -> Vec<XYWH<f32>> {
            (0..count)
                .map(|_| {
                    rect([
                        rng.gen_range(0.0..30.0),
                        rng.gen_range(0.0..30.0),
                        rng.gen_range(0.1..12.0),
                        rng.gen_range(0.1..12.0),
                    ])
                })
                .collect()
        };
        let lhs = random_rects(40);
        let rhs = random_rects(25);

        let ious = pairwise_iou(&lhs, &rhs);
        let transposed = pairwise_iou(&rhs, &lhs);
        assert_eq!(transposed.t(), ious);
        assert!(ious.iter().all(|iou| (0.0..=1.0).contains(iou)));

        let diagonal = pairwise_iou(&lhs, &lhs);
        (0..lhs.len()).for_each(|index| assert_eq!(diagonal[[index, index]], 1.0));
    }

    #[test]
    fn best_matches() {
        let ious = ndarray::arr2(&[[0.1, 0.5, 0.5], [0.0, 0.0, 0.0], [0.9, 0.2, 0.3]]);

        let rows = best_match_per_row(ious.view());
        assert_eq!(rows[0], Some(BestMatch { index: 1, iou: 0.5 }));
        assert_eq!(rows[1], Some(BestMatch { index: 0, iou: 0.0 }));
        assert_eq!(rows[2], Some(BestMatch { index: 0, iou: 0.9 }));

        let cols = best_match_per_col(ious.view());
        assert_eq!(cols[0], Some(BestMatch { index: 2, iou: 0.9 }));
        assert_eq!(cols[1], Some(BestMatch { index: 0, iou: 0.5 }));

        let empty = Array2::<f32>::zeros((2, 0));
        assert_eq!(best_match_per_row(empty.view()), vec![None, None]);
    }
}
