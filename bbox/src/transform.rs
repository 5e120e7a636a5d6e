use super::{CxCyWH, Rect, XYWH, XYXY};
use crate::{common::*, WH};

/// Per-axis affine map `(x, y) -> (x * sx + tx, y * sy + ty)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transform<T> {
    pub sx: T,
    pub sy: T,
    pub tx: T,
    pub ty: T,
}

impl<T> Transform<T>
where
    T: Copy + Num + PartialOrd,
{
    /// The transform that maps `src` onto `tgt`.
    pub fn try_from_rects<R>(src: &R, tgt: &R) -> Result<Self>
    where
        R: Rect<Type = T>,
    {
        let zero = T::zero();
        ensure!(
            src.w() > zero && src.h() > zero,
            "source rectangle must have positive extent"
        );

        let sx = tgt.w() / src.w();
        let sy = tgt.h() / src.h();
        let tx = tgt.x() - src.x() * sx;
        let ty = tgt.y() - src.y() * sy;

        Ok(Self { sx, sy, tx, ty })
    }

    /// Stretch an image of size `src_size` to `tgt_size`.
    pub fn try_from_sizes(src_size: &WH<T>, tgt_size: &WH<T>) -> Result<Self> {
        let zero = T::zero();
        let src = XYWH::try_from_xywh([zero, zero, src_size.w(), src_size.h()])?;
        let tgt = XYWH::try_from_xywh([zero, zero, tgt_size.w(), tgt_size.h()])?;
        Self::try_from_rects(&src, &tgt)
    }

    /// Uniform scaling around the origin.
    pub fn try_scale(scale: T) -> Result<Self> {
        ensure!(scale > T::zero(), "scaling factor must be positive");
        Ok(Self {
            sx: scale,
            sy: scale,
            tx: T::zero(),
            ty: T::zero(),
        })
    }
}

impl<T> Transform<T>
where
    T: Copy + Num + Neg<Output = T>,
{
    pub fn inverse(&self) -> Self {
        let sx = T::one() / self.sx;
        let sy = T::one() / self.sy;
        let tx = -self.tx / self.sx;
        let ty = -self.ty / self.sy;

        Self { sx, sy, tx, ty }
    }
}

impl<T> Mul<&XYWH<T>> for &Transform<T>
where
    T: Copy + Num,
{
    type Output = XYWH<T>;

    fn mul(self, rhs: &XYWH<T>) -> Self::Output {
        rhs.transform(self)
    }
}

impl<T> Mul<&XYXY<T>> for &Transform<T>
where
    T: Copy + Num,
{
    type Output = XYXY<T>;

    fn mul(self, rhs: &XYXY<T>) -> Self::Output {
        rhs.transform(self)
    }
}

impl<T> Mul<&CxCyWH<T>> for &Transform<T>
where
    T: Copy + Num,
{
    type Output = CxCyWH<T>;

    fn mul(self, rhs: &CxCyWH<T>) -> Self::Output {
        rhs.transform(self)
    }
}

impl<T> Mul<&Transform<T>> for &Transform<T>
where
    T: Copy + Num,
{
    type Output = Transform<T>;

    fn mul(self, rhs: &Transform<T>) -> Self::Output {
        Transform {
            sx: self.sx * rhs.sx,
            sy: self.sy * rhs.sy,
            tx: rhs.tx * self.sx + self.tx,
            ty: rhs.ty * self.sy + self.ty,
        }
    }
}
