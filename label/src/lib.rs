use bbox::{Transform, XYWH};
use num_traits::Num;
use std::ops::Mul;

/// A rectangle annotated with a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label<R, C> {
    pub rect: R,
    pub class: C,
}

impl<R, C> Label<R, C> {
    pub fn new(rect: R, class: C) -> Self {
        Self { rect, class }
    }
}

impl<'a, T, C> Mul<&'a Label<XYWH<T>, C>> for &'a Transform<T>
where
    T: Copy + Num,
    C: Copy,
{
    type Output = Label<XYWH<T>, C>;

    fn mul(self, rhs: &'a Label<XYWH<T>, C>) -> Self::Output {
        Label {
            rect: self * &rhs.rect,
            class: rhs.class,
        }
    }
}
