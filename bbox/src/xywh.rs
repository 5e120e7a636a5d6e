use super::{CxCyWH, Rect, XYXY};
use crate::{common::*, Transform};

/// Bounding box in XYWH format, i.e. the top-left corner and the extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XYWH<T> {
    pub(crate) x: T,
    pub(crate) y: T,
    pub(crate) w: T,
    pub(crate) h: T,
}

impl<T> XYWH<T>
where
    T: Copy + Num,
{
    pub fn transform(&self, transform: &Transform<T>) -> Self {
        XYWH {
            x: self.x * transform.sx + transform.tx,
            y: self.y * transform.sy + transform.ty,
            w: self.w * transform.sx,
            h: self.h * transform.sy,
        }
    }
}

impl<T> Rect for XYWH<T>
where
    T: Copy + Num + PartialOrd,
{
    type Type = T;

    fn x(&self) -> Self::Type {
        self.x
    }

    fn y(&self) -> Self::Type {
        self.y
    }

    fn x2(&self) -> Self::Type {
        self.x + self.w
    }

    fn y2(&self) -> Self::Type {
        self.y + self.h
    }

    fn cx(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.x + self.w / two
    }

    fn cy(&self) -> Self::Type {
        let two = T::one() + T::one();
        self.y + self.h / two
    }

    fn w(&self) -> Self::Type {
        self.w
    }

    fn h(&self) -> Self::Type {
        self.h
    }

    fn try_from_xywh(xywh: [T; 4]) -> Result<Self> {
        let [x, y, w, h] = xywh;
        let zero = T::zero();
        ensure!(
            w >= zero && h >= zero,
            "box width and height must be non-negative"
        );
        Ok(Self { x, y, w, h })
    }

    fn try_from_xyxy(xyxy: [T; 4]) -> Result<Self> {
        let [x1, y1, x2, y2] = xyxy;
        ensure!(x2 >= x1 && y2 >= y1, "x2 >= x1 and y2 >= y1 must hold");
        Ok(Self {
            x: x1,
            y: y1,
            w: x2 - x1,
            h: y2 - y1,
        })
    }

    fn try_from_cxcywh(cxcywh: [T; 4]) -> Result<Self> {
        let [cx, cy, w, h] = cxcywh;
        let zero = T::zero();
        ensure!(
            w >= zero && h >= zero,
            "box width and height must be non-negative"
        );
        let two = T::one() + T::one();
        Ok(Self {
            x: cx - w / two,
            y: cy - h / two,
            w,
            h,
        })
    }
}

impl<T> From<XYXY<T>> for XYWH<T>
where
    T: Copy + Num,
{
    fn from(from: XYXY<T>) -> Self {
        Self::from(&from)
    }
}

impl<T> From<&XYXY<T>> for XYWH<T>
where
    T: Copy + Num,
{
    fn from(from: &XYXY<T>) -> Self {
        let XYXY { x1, y1, x2, y2 } = *from;
        Self {
            x: x1,
            y: y1,
            w: x2 - x1,
            h: y2 - y1,
        }
    }
}

impl<T> From<CxCyWH<T>> for XYWH<T>
where
    T: Copy + Num,
{
    fn from(from: CxCyWH<T>) -> Self {
        Self::from(&from)
    }
}

impl<T> From<&CxCyWH<T>> for XYWH<T>
where
    T: Copy + Num,
{
    fn from(from: &CxCyWH<T>) -> Self {
        let two = T::one() + T::one();
        let CxCyWH { cx, cy, w, h } = *from;
        Self {
            x: cx - w / two,
            y: cy - h / two,
            w,
            h,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RectNum;

    #[test]
    fn xywh_conversions() {
        let rect = XYWH::try_from_xywh([1.0, 2.0, 4.0, 6.0]).unwrap();
        assert_eq!(rect.xyxy(), [1.0, 2.0, 5.0, 8.0]);
        assert_eq!(rect.cxcywh(), [3.0, 5.0, 4.0, 6.0]);
        assert_eq!(XYWH::from(rect.to_xyxy()), rect);
        assert_eq!(XYWH::from(rect.to_cxcywh()), rect);
        assert!(XYWH::try_from_xywh([0.0, 0.0, -1.0, 1.0]).is_err());
    }
}
