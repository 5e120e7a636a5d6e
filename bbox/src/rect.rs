use super::{CxCyWH, XYWH, XYXY, WH};
use crate::common::*;

/// The generic axis-aligned rectangle.
///
/// `x` grows to the right and `y` grows downwards, so (`x`, `y`) is the
/// top-left corner and (`x2`, `y2`) the bottom-right one.
pub trait Rect {
    type Type;

    fn x(&self) -> Self::Type;
    fn y(&self) -> Self::Type;
    fn x2(&self) -> Self::Type;
    fn y2(&self) -> Self::Type;
    fn cx(&self) -> Self::Type;
    fn cy(&self) -> Self::Type;
    fn w(&self) -> Self::Type;
    fn h(&self) -> Self::Type;

    fn try_from_xywh(xywh: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;

    fn try_from_xyxy(xyxy: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;

    fn try_from_cxcywh(cxcywh: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;
}

pub trait RectNum: Rect
where
    Self::Type: Num + PartialOrd,
{
    fn xywh(&self) -> [Self::Type; 4] {
        [self.x(), self.y(), self.w(), self.h()]
    }

    fn xyxy(&self) -> [Self::Type; 4] {
        [self.x(), self.y(), self.x2(), self.y2()]
    }

    fn cxcywh(&self) -> [Self::Type; 4] {
        [self.cx(), self.cy(), self.w(), self.h()]
    }

    fn to_xywh(&self) -> XYWH<Self::Type> {
        XYWH {
            x: self.x(),
            y: self.y(),
            w: self.w(),
            h: self.h(),
        }
    }

    fn to_xyxy(&self) -> XYXY<Self::Type> {
        XYXY {
            x1: self.x(),
            y1: self.y(),
            x2: self.x2(),
            y2: self.y2(),
        }
    }

    fn to_cxcywh(&self) -> CxCyWH<Self::Type> {
        CxCyWH {
            cx: self.cx(),
            cy: self.cy(),
            w: self.w(),
            h: self.h(),
        }
    }

    fn area(&self) -> <Self::Type as Mul<Self::Type>>::Output
    where
        Self::Type: Mul<Self::Type>,
    {
        self.w() * self.h()
    }
}

pub trait RectFloat: RectNum
where
    Self::Type: Float,
{
    /// Returns true if the width or the height is not a positive finite number.
    fn is_degenerate(&self) -> bool {
        let zero = Self::Type::zero();
        let w = self.w();
        let h = self.h();
        !(w.is_finite() && h.is_finite() && w > zero && h > zero)
    }

    /// Compute the overlapping region, or `None` if the boxes do not overlap.
    fn intersect_with<R>(&self, other: &R) -> Option<XYXY<Self::Type>>
    where
        R: Rect<Type = Self::Type>,
    {
        let x1 = self.x().max(other.x());
        let y1 = self.y().max(other.y());
        let x2 = self.x2().min(other.x2());
        let y2 = self.y2().min(other.y2());
        (x2 > x1 && y2 > y1).then(|| XYXY { x1, y1, x2, y2 })
    }

    /// Intersection over union. It is zero if either box is degenerate.
    fn iou_with<R>(&self, other: &R) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        let zero = Self::Type::zero();
        if self.is_degenerate() || other.is_degenerate() {
            return zero;
        }

        // all three areas come from corner differences so that identical
        // boxes have exactly equal areas
        let corner_area = |x1: Self::Type, y1: Self::Type, x2: Self::Type, y2: Self::Type| {
            (x2 - x1) * (y2 - y1)
        };
        let inter_area = self
            .intersect_with(other)
            .map(|inter| corner_area(inter.x1, inter.y1, inter.x2, inter.y2))
            .unwrap_or(zero);
        let self_area = corner_area(self.x(), self.y(), self.x2(), self.y2());
        let other_area = corner_area(other.x(), other.y(), other.x2(), other.y2());
        let union_area = self_area + other_area - inter_area;
        if union_area <= zero {
            return zero;
        }

        (inter_area / union_area).max(zero).min(Self::Type::one())
    }

    /// Squared distance between the two box centers.
    fn center_distance_sq_to<R>(&self, other: &R) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        let dx = self.cx() - other.cx();
        let dy = self.cy() - other.cy();
        dx * dx + dy * dy
    }

    /// Checks if all four corners lie within `[0, w] x [0, h]`.
    fn is_inside(&self, bounds: &WH<Self::Type>) -> bool {
        let zero = Self::Type::zero();
        self.x() >= zero && self.y() >= zero && self.x2() <= bounds.w() && self.y2() <= bounds.h()
    }

    /// Clip the box to `[0, w] x [0, h]`. Returns `None` if nothing non-degenerate is left.
    fn clip_to(&self, bounds: &WH<Self::Type>) -> Option<XYWH<Self::Type>> {
        let zero = Self::Type::zero();
        let x1 = self.x().max(zero).min(bounds.w());
        let y1 = self.y().max(zero).min(bounds.h());
        let x2 = self.x2().max(zero).min(bounds.w());
        let y2 = self.y2().max(zero).min(bounds.h());
        let clipped = XYWH {
            x: x1,
            y: y1,
            w: x2 - x1,
            h: y2 - y1,
        };
        (!clipped.is_degenerate()).then(|| clipped)
    }
}

impl<T> RectNum for T
where
    T: Rect,
    T::Type: Num + PartialOrd,
{
}

impl<T> RectFloat for T
where
    T: Rect,
    T::Type: Float,
{
}
