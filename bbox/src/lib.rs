//! Safe bounding box types and functions.

mod common;

pub use transform::*;
mod transform;

pub use rect::*;
pub mod rect;

pub use xywh::*;
pub mod xywh;

pub use xyxy::*;
pub mod xyxy;

pub use cxcywh::*;
pub mod cxcywh;

pub use wh::*;
pub mod wh;

pub mod prelude {
    pub use crate::rect::{Rect, RectFloat, RectNum};
}
