use crate::common::*;

/// The extent of an image or a feature map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WH<T> {
    w: T,
    h: T,
}

impl<T> WH<T>
where
    T: Num + PartialOrd + Copy,
{
    pub fn try_from_wh(wh: [T; 2]) -> Result<Self> {
        let [w, h] = wh;
        let zero = T::zero();
        ensure!(
            w >= zero && h >= zero,
            "width and height parameters must be non-negative"
        );
        Ok(Self { w, h })
    }

    pub fn area(&self) -> T {
        self.w * self.h
    }

    pub fn w(&self) -> T {
        self.w
    }

    pub fn h(&self) -> T {
        self.h
    }
}
